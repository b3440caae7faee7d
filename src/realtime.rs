//! Realtime bridge: applies server-pushed events without waiting for a
//! manual sync.
//!
//! The socket is best-effort; correctness comes from the full sync pass
//! run on every (re)connect, which covers anything missed while
//! disconnected. Events carried in notifications are deduplicated by id
//! against the log, so duplicate delivery is harmless.

use crate::bus::ChangeKind;
use crate::event::{EventRecord, EventVerb};
use crate::projection::{self, ProjectionState};
use crate::sync::TOKEN_KEY;
use crate::ClientInner;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Wire shape of a push notification:
/// `{ "type": "<aggregate>_<verb>", "event": { ... } }`.
#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: Option<serde_json::Value>,
}

/// Connection loop: connect, full-sync, listen, reconnect with backoff.
pub(crate) async fn run(inner: Arc<ClientInner>) {
    let mut backoff = crate::backoff::Backoff::standard();
    loop {
        match connection_url(&inner) {
            Some(url) => match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    backoff.reset();
                    tracing::info!("realtime connected");
                    // At-least-once: pull whatever the socket missed
                    // while we were away.
                    let _ = inner.sync.sync().await;
                    if let Err(e) = listen(&inner, stream).await {
                        tracing::warn!(error = %e, "realtime stream ended");
                    } else {
                        tracing::info!("realtime closed by server");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "realtime connect failed"),
            },
            None => tracing::debug!("realtime idle (backend or session missing)"),
        }
        let delay = backoff.on_failure();
        tokio::time::sleep(delay).await;
    }
}

fn connection_url(inner: &ClientInner) -> Option<String> {
    let ws_url = inner
        .backend
        .lock()
        .expect("backend lock")
        .as_ref()
        .map(|b| b.ws_url.clone())?;
    let token = inner.store.config_get(TOKEN_KEY).ok().flatten()?;
    Some(format!("{}?token={}", ws_url, urlencoding::encode(&token)))
}

async fn listen(
    inner: &Arc<ClientInner>,
    mut stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<()> {
    while let Some(message) = stream.next().await {
        match message.context("websocket read")? {
            Message::Text(text) => handle_notification(inner, &text).await,
            Message::Ping(payload) => {
                stream.send(Message::Pong(payload)).await.context("pong")?;
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

async fn handle_notification(inner: &Arc<ClientInner>, text: &str) {
    let note: Notification = match serde_json::from_str(text) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable realtime message");
            return;
        }
    };
    match note.event {
        Some(raw) => match apply_embedded_event(inner, &raw) {
            Ok(true) => inner.bus.publish(ChangeKind::Realtime),
            Ok(false) => tracing::debug!(kind = %note.kind, "realtime duplicate ignored"),
            Err(e) => tracing::warn!(kind = %note.kind, error = %e, "realtime event application failed"),
        },
        None => {
            // Notification without a body: fall back to a pull.
            tracing::debug!(kind = %note.kind, "realtime notification without event, pulling");
            let _ = inner.sync.sync().await;
        }
    }
}

/// Append one server-pushed event and update the projection. Returns
/// `false` when the event was already known. CREATED/UPDATED/DELETED
/// apply incrementally on the cached state; UNDO re-opens history, so it
/// falls back to a full rebuild.
pub(crate) fn apply_embedded_event(inner: &ClientInner, raw: &serde_json::Value) -> Result<bool> {
    let mut record = EventRecord::from_wire(raw).context("decode realtime event")?;
    record.synced = true;
    if !inner.store.insert_event(&record)? {
        return Ok(false);
    }
    let incremental = record.payload.verb() != EventVerb::Undo;
    if incremental {
        if let Some((contacts, transactions)) = inner.store.state_load()? {
            let mut state = ProjectionState::from_cached(contacts, transactions);
            if state.apply_live(&record) {
                inner.store.state_save(&state.contacts(), &state.transactions())?;
                return Ok(true);
            }
        }
    }
    projection::rebuild_and_cache(&inner.store)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AggregateKind, ContactFields, EventPayload, TransactionFields};
    use crate::ids::{ContactId, TransactionId};
    use crate::models::{Currency, TransactionDirection, TransactionKind};
    use crate::TallyClient;
    use chrono::Utc;

    fn contact_created_wire(id: &ContactId, name: &str) -> serde_json::Value {
        EventRecord::new(
            AggregateKind::Contact,
            id.as_str(),
            EventPayload::ContactCreated(ContactFields {
                name: name.to_string(),
                username: None,
                phone: None,
                email: None,
                notes: None,
            }),
        )
        .to_wire()
        .expect("wire")
    }

    fn transaction_created_wire(id: &TransactionId, contact: &ContactId, amount: i64) -> serde_json::Value {
        EventRecord::new(
            AggregateKind::Transaction,
            id.as_str(),
            EventPayload::TransactionCreated(TransactionFields {
                contact_id: contact.clone(),
                kind: TransactionKind::Money,
                direction: TransactionDirection::Lent,
                amount,
                currency: Currency::IQD,
                description: None,
                transaction_date: Utc::now().date_naive(),
                due_date: None,
            }),
        )
        .to_wire()
        .expect("wire")
    }

    #[test]
    fn embedded_event_applies_incrementally() {
        let client = TallyClient::open_in_memory().expect("client");
        let alice = ContactId::generate();
        assert!(apply_embedded_event(client.inner(), &contact_created_wire(&alice, "Alice")).unwrap());
        let t1 = TransactionId::generate();
        assert!(apply_embedded_event(client.inner(), &transaction_created_wire(&t1, &alice, 500)).unwrap());
        let contact = client.get_contact(&alice).unwrap().expect("contact");
        assert_eq!(contact.balance, 500);
        assert!(contact.is_synced, "server-pushed events are synced");
    }

    #[test]
    fn duplicate_embedded_event_is_ignored() {
        let client = TallyClient::open_in_memory().expect("client");
        let alice = ContactId::generate();
        let wire = contact_created_wire(&alice, "Alice");
        assert!(apply_embedded_event(client.inner(), &wire).unwrap());
        assert!(!apply_embedded_event(client.inner(), &wire).unwrap());
        assert_eq!(client.get_contacts().unwrap().len(), 1);
    }

    #[test]
    fn undo_event_forces_full_rebuild() {
        let client = TallyClient::open_in_memory().expect("client");
        let alice = ContactId::generate();
        let t1 = TransactionId::generate();
        apply_embedded_event(client.inner(), &contact_created_wire(&alice, "Alice")).unwrap();
        let create_wire = transaction_created_wire(&t1, &alice, 500);
        apply_embedded_event(client.inner(), &create_wire).unwrap();
        assert_eq!(client.get_contact(&alice).unwrap().unwrap().balance, 500);

        let create_id = create_wire["id"].as_str().unwrap();
        let undo = EventRecord::new(
            AggregateKind::Transaction,
            t1.as_str(),
            EventPayload::Undone {
                undone_event_id: crate::ids::EventId::parse(create_id).unwrap(),
            },
        )
        .to_wire()
        .expect("wire");
        assert!(apply_embedded_event(client.inner(), &undo).unwrap());
        // The rebuild excludes the undone create.
        assert_eq!(client.get_contact(&alice).unwrap().unwrap().balance, 0);
        assert!(client.get_transaction(&t1).unwrap().is_none());
    }

    #[test]
    fn notification_shape_parses() {
        let note: Notification = serde_json::from_str(
            r#"{"type":"contact_created","event":{"id":"x"}}"#,
        )
        .expect("parse");
        assert_eq!(note.kind, "contact_created");
        assert!(note.event.is_some());

        let bare: Notification = serde_json::from_str(r#"{"type":"transaction_deleted"}"#).expect("parse");
        assert!(bare.event.is_none());
    }
}
