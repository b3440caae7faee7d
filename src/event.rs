//! Event envelope and typed payloads.
//!
//! Events are immutable once appended; only the `synced` flag may change.
//! Payloads are decoded and validated once, at the log/wire boundary;
//! the rest of the crate never touches raw JSON maps.

use crate::ids::{ContactId, EventId, IdError, TransactionId};
use crate::models::{Contact, Currency, Transaction, TransactionDirection, TransactionKind};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Domain entity kind an event applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Contact,
    Transaction,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Contact => "contact",
            AggregateKind::Transaction => "transaction",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "contact" => Some(AggregateKind::Contact),
            "transaction" => Some(AggregateKind::Transaction),
            _ => None,
        }
    }
}

/// Wire verb of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventVerb {
    Created,
    Updated,
    Deleted,
    Undo,
}

impl EventVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventVerb::Created => "CREATED",
            EventVerb::Updated => "UPDATED",
            EventVerb::Deleted => "DELETED",
            EventVerb::Undo => "UNDO",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(EventVerb::Created),
            "UPDATED" => Some(EventVerb::Updated),
            "DELETED" => Some(EventVerb::Deleted),
            "UNDO" => Some(EventVerb::Undo),
            _ => None,
        }
    }
}

/// Full field set for a new contact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactFields {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Changed fields of a contact; `None` means unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Full field set for a new transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionFields {
    pub contact_id: ContactId,
    #[serde(rename = "type", default)]
    pub kind: TransactionKind,
    pub direction: TransactionDirection,
    pub amount: i64,
    pub currency: Currency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transaction_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

/// Changed fields of a transaction; `None` means unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<ContactId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TransactionDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

/// Typed event payload, one variant per (aggregate, verb).
///
/// DELETED variants carry the last known snapshot so deletes stay
/// undo-able and history views can resolve amounts of removed entities.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    ContactCreated(ContactFields),
    ContactUpdated(ContactPatch),
    ContactDeleted { snapshot: Option<Contact> },
    TransactionCreated(TransactionFields),
    TransactionUpdated(TransactionPatch),
    TransactionDeleted { snapshot: Option<Transaction> },
    /// Semantically reverses `undone_event_id` without removing it from the log.
    Undone { undone_event_id: EventId },
}

impl EventPayload {
    pub fn verb(&self) -> EventVerb {
        match self {
            EventPayload::ContactCreated(_) | EventPayload::TransactionCreated(_) => EventVerb::Created,
            EventPayload::ContactUpdated(_) | EventPayload::TransactionUpdated(_) => EventVerb::Updated,
            EventPayload::ContactDeleted { .. } | EventPayload::TransactionDeleted { .. } => EventVerb::Deleted,
            EventPayload::Undone { .. } => EventVerb::Undo,
        }
    }

    /// Aggregate kind implied by the payload alone. `None` for UNDO,
    /// which applies to whichever aggregate its target belongs to.
    pub fn implied_aggregate(&self) -> Option<AggregateKind> {
        match self {
            EventPayload::ContactCreated(_)
            | EventPayload::ContactUpdated(_)
            | EventPayload::ContactDeleted { .. } => Some(AggregateKind::Contact),
            EventPayload::TransactionCreated(_)
            | EventPayload::TransactionUpdated(_)
            | EventPayload::TransactionDeleted { .. } => Some(AggregateKind::Transaction),
            EventPayload::Undone { .. } => None,
        }
    }

    /// Encode as the wire `event_data` object.
    pub fn wire_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventPayload::ContactCreated(f) => serde_json::to_value(f),
            EventPayload::ContactUpdated(p) => serde_json::to_value(p),
            EventPayload::ContactDeleted { snapshot } => match snapshot {
                Some(c) => Ok(json!({ "snapshot": serde_json::to_value(c)? })),
                None => Ok(json!({})),
            },
            EventPayload::TransactionCreated(f) => serde_json::to_value(f),
            EventPayload::TransactionUpdated(p) => serde_json::to_value(p),
            EventPayload::TransactionDeleted { snapshot } => match snapshot {
                Some(t) => Ok(json!({ "snapshot": serde_json::to_value(t)? })),
                None => Ok(json!({})),
            },
            EventPayload::Undone { undone_event_id } => {
                Ok(json!({ "undone_event_id": undone_event_id.as_str() }))
            }
        }
    }

    /// Decode from the wire triple. This is the single place raw JSON
    /// becomes a typed payload.
    pub fn decode(aggregate: AggregateKind, verb: EventVerb, data: &Value) -> Result<Self, WireError> {
        match (aggregate, verb) {
            (AggregateKind::Contact, EventVerb::Created) => {
                Ok(EventPayload::ContactCreated(serde_json::from_value(data.clone())?))
            }
            (AggregateKind::Contact, EventVerb::Updated) => {
                Ok(EventPayload::ContactUpdated(serde_json::from_value(data.clone())?))
            }
            (AggregateKind::Contact, EventVerb::Deleted) => Ok(EventPayload::ContactDeleted {
                snapshot: data
                    .get("snapshot")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
            }),
            (AggregateKind::Transaction, EventVerb::Created) => {
                Ok(EventPayload::TransactionCreated(serde_json::from_value(data.clone())?))
            }
            (AggregateKind::Transaction, EventVerb::Updated) => {
                Ok(EventPayload::TransactionUpdated(serde_json::from_value(data.clone())?))
            }
            (AggregateKind::Transaction, EventVerb::Deleted) => Ok(EventPayload::TransactionDeleted {
                snapshot: data
                    .get("snapshot")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
            }),
            (_, EventVerb::Undo) => {
                let raw = data
                    .get("undone_event_id")
                    .and_then(|v| v.as_str())
                    .ok_or(WireError::Missing("undone_event_id"))?;
                Ok(EventPayload::Undone { undone_event_id: EventId::parse(raw)? })
            }
        }
    }
}

/// Errors decoding a wire or stored event.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("missing field `{0}`")]
    Missing(&'static str),

    #[error("unknown aggregate type `{0}`")]
    UnknownAggregate(String),

    #[error("unknown event type `{0}`")]
    UnknownVerb(String),

    #[error("bad timestamp `{0}`")]
    BadTimestamp(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Id(#[from] IdError),
}

/// One log entry. `seq` is the store-assigned monotonic insertion order
/// used to break timestamp ties during replay; it is local-only, as is
/// `synced`. `total_debt` is the post-event sum of all balances, stamped
/// after projection for history views.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub id: EventId,
    pub aggregate: AggregateKind,
    pub aggregate_id: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
    pub version: i32,
    pub synced: bool,
    pub total_debt: Option<i64>,
}

impl EventRecord {
    /// A fresh local event: new id, current time, unsynced, no seq yet.
    pub fn new(aggregate: AggregateKind, aggregate_id: impl Into<String>, payload: EventPayload) -> Self {
        debug_assert!(payload
            .implied_aggregate()
            .map(|a| a == aggregate)
            .unwrap_or(true));
        Self {
            id: EventId::generate(),
            aggregate,
            aggregate_id: aggregate_id.into(),
            payload,
            timestamp: Utc::now(),
            seq: 0,
            version: 1,
            synced: false,
            total_debt: None,
        }
    }

    /// RFC 3339 with fixed microsecond width, so lexical order in the
    /// store equals chronological order.
    pub fn timestamp_str(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// `event_data` as sent on the wire and stored in the log:
    /// the payload object plus the stamped `total_debt`, if any.
    pub fn wire_event_data(&self) -> Result<Value, serde_json::Error> {
        let mut data = self.payload.wire_data()?;
        if let (Some(total), Some(obj)) = (self.total_debt, data.as_object_mut()) {
            obj.insert("total_debt".to_string(), json!(total));
        }
        Ok(data)
    }

    /// Full wire object for push/pull.
    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        Ok(json!({
            "id": self.id.as_str(),
            "aggregate_type": self.aggregate.as_str(),
            "aggregate_id": self.aggregate_id,
            "event_type": self.payload.verb().as_str(),
            "event_data": self.wire_event_data()?,
            "timestamp": self.timestamp_str(),
            "version": self.version,
        }))
    }

    /// Decode a wire object. The caller decides `synced` (pulled events
    /// are synced by definition); `seq` is assigned on insert.
    pub fn from_wire(v: &Value) -> Result<Self, WireError> {
        let id = v
            .get("id")
            .and_then(|x| x.as_str())
            .ok_or(WireError::Missing("id"))?;
        let aggregate_raw = v
            .get("aggregate_type")
            .and_then(|x| x.as_str())
            .ok_or(WireError::Missing("aggregate_type"))?;
        let aggregate = AggregateKind::from_code(aggregate_raw)
            .ok_or_else(|| WireError::UnknownAggregate(aggregate_raw.to_string()))?;
        let aggregate_id = v
            .get("aggregate_id")
            .and_then(|x| x.as_str())
            .ok_or(WireError::Missing("aggregate_id"))?;
        let verb_raw = v
            .get("event_type")
            .and_then(|x| x.as_str())
            .ok_or(WireError::Missing("event_type"))?;
        let verb = EventVerb::from_code(verb_raw)
            .ok_or_else(|| WireError::UnknownVerb(verb_raw.to_string()))?;
        let data = v.get("event_data").cloned().unwrap_or(Value::Null);
        let ts_raw = v
            .get("timestamp")
            .and_then(|x| x.as_str())
            .ok_or(WireError::Missing("timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(ts_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| WireError::BadTimestamp(ts_raw.to_string()))?;
        Ok(Self {
            id: EventId::parse(id)?,
            aggregate,
            aggregate_id: aggregate_id.to_string(),
            payload: EventPayload::decode(aggregate, verb, &data)?,
            timestamp,
            seq: 0,
            version: v.get("version").and_then(|x| x.as_i64()).unwrap_or(1) as i32,
            synced: false,
            total_debt: data.get("total_debt").and_then(|x| x.as_i64()),
        })
    }
}

/// Replay order: timestamp ascending, local sequence as tie-break.
pub fn replay_order(a: &EventRecord, b: &EventRecord) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_created() -> EventPayload {
        EventPayload::ContactCreated(ContactFields {
            name: "Alice".to_string(),
            username: Some("alice".to_string()),
            phone: None,
            email: None,
            notes: None,
        })
    }

    #[test]
    fn wire_round_trip_preserves_payload() {
        let rec = EventRecord::new(AggregateKind::Contact, ContactId::generate().as_str(), contact_created());
        let wire = rec.to_wire().expect("to_wire");
        let back = EventRecord::from_wire(&wire).expect("from_wire");
        assert_eq!(back.id, rec.id);
        assert_eq!(back.aggregate, AggregateKind::Contact);
        assert_eq!(back.payload, rec.payload);
        assert_eq!(back.timestamp, rec.timestamp);
    }

    #[test]
    fn patch_serializes_changed_fields_only() {
        let patch = TransactionPatch { amount: Some(2000), ..Default::default() };
        let data = EventPayload::TransactionUpdated(patch).wire_data().expect("wire_data");
        let obj = data.as_object().expect("object");
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["amount"], 2000);
    }

    #[test]
    fn undo_decode_requires_target() {
        let err = EventPayload::decode(AggregateKind::Contact, EventVerb::Undo, &json!({}));
        assert!(matches!(err, Err(WireError::Missing("undone_event_id"))));
    }

    #[test]
    fn decode_tolerates_legacy_delete_data() {
        // Older servers sent {"comment": ...} for deletes; snapshot is optional.
        let payload = EventPayload::decode(
            AggregateKind::Transaction,
            EventVerb::Deleted,
            &json!({"comment": "Transaction deleted"}),
        )
        .expect("decode");
        assert_eq!(payload, EventPayload::TransactionDeleted { snapshot: None });
    }

    #[test]
    fn total_debt_stamp_lands_in_event_data() {
        let mut rec = EventRecord::new(AggregateKind::Contact, ContactId::generate().as_str(), contact_created());
        rec.total_debt = Some(500);
        let wire = rec.to_wire().expect("to_wire");
        assert_eq!(wire["event_data"]["total_debt"], 500);
        let back = EventRecord::from_wire(&wire).expect("from_wire");
        assert_eq!(back.total_debt, Some(500));
    }
}
