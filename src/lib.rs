//! Local-first client core for a personal debt-tracking app.
//!
//! The event log is the source of truth: every user action becomes an
//! immutable event, the projection engine folds the log into current
//! contact/transaction state (with running balances), and the sync
//! engine reconciles the log with the server in the background. All
//! reads and writes complete against local state; the network is never
//! on the write path.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

mod api;
mod backoff;
mod bus;
mod error;
mod event;
mod ids;
mod models;
mod projection;
mod realtime;
mod storage;
mod sync;

pub use api::{AUTH_DECLINED_CODE, PERMISSION_DENIED_CODE};
pub use bus::{ChangeBus, ChangeKind};
pub use error::{CoreError, StoreError, SyncError};
pub use event::{
    AggregateKind, ContactFields, ContactPatch, EventPayload, EventRecord, EventVerb,
    TransactionFields, TransactionPatch, WireError,
};
pub use ids::{ContactId, EventId, IdError, TransactionId};
pub use models::{Contact, Currency, Transaction, TransactionDirection, TransactionKind};
pub use projection::{rebuild, total_debt_at, ProjectionState, Tombstone};
pub use storage::LocalStore;
pub use sync::{SyncEngine, SyncOutcome};

use bus::ChangeBus as Bus;
use projection::rebuild_and_cache;
use storage::LocalStore as Store;
use sync::TOKEN_KEY;

const DEFAULT_DIRECTION_KEY: &str = "default_direction";

/// Actions newer than this can be undone through the aggregate-level
/// undo entry points; older ones need an explicit event id.
const UNDO_WINDOW_SECS: i64 = 5;

/// Where the server lives. Set once credentials and host are known;
/// everything works offline without it.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub ws_url: String,
}

pub(crate) struct ClientInner {
    pub(crate) store: Arc<Store>,
    pub(crate) bus: Bus,
    pub(crate) sync: SyncEngine,
    pub(crate) backend: Arc<Mutex<Option<BackendConfig>>>,
    pub(crate) sync_nudge: Notify,
}

/// The client core. Cheap to clone; inject it into whatever layer needs
/// it instead of reaching for globals.
#[derive(Clone)]
pub struct TallyClient {
    inner: Arc<ClientInner>,
}

impl TallyClient {
    /// Open (or create) the local store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        Ok(Self::from_store(Store::open(dir)?))
    }

    /// Fully in-memory client, for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        Ok(Self::from_store(Store::open_in_memory()?))
    }

    fn from_store(store: Store) -> Self {
        let store = Arc::new(store);
        let bus = Bus::new();
        let backend = Arc::new(Mutex::new(None));
        let sync = SyncEngine::new(store.clone(), bus.clone(), backend.clone());
        Self {
            inner: Arc::new(ClientInner {
                store,
                bus,
                sync,
                backend,
                sync_nudge: Notify::new(),
            }),
        }
    }

    /// Point the client at a server. Idempotent; triggers a sync nudge.
    pub fn configure_backend(&self, config: BackendConfig) {
        *self.inner.backend.lock().expect("backend lock") = Some(config);
        self.inner.sync_nudge.notify_one();
    }

    pub fn set_auth_token(&self, token: &str) -> Result<(), CoreError> {
        self.inner.store.config_set(TOKEN_KEY, token)?;
        self.inner.sync_nudge.notify_one();
        Ok(())
    }

    /// Forget the session token. Local data stays.
    pub fn clear_session(&self) -> Result<(), CoreError> {
        self.inner.store.config_remove(TOKEN_KEY)?;
        Ok(())
    }

    /// Wipe all local data (events, projection, config). The next sync
    /// does a full pull.
    pub fn reset_local(&self) -> Result<(), CoreError> {
        self.inner.store.clear_all()?;
        rebuild_and_cache(&self.inner.store)?;
        self.inner.bus.publish(ChangeKind::LocalWrite);
        Ok(())
    }

    // --- Reads (always local, offline-safe) ---

    pub fn get_contacts(&self) -> Result<Vec<Contact>, CoreError> {
        Ok(self.projection()?.contacts())
    }

    pub fn get_transactions(&self) -> Result<Vec<Transaction>, CoreError> {
        Ok(self.projection()?.transactions())
    }

    pub fn get_contact(&self, id: &ContactId) -> Result<Option<Contact>, CoreError> {
        Ok(self.projection()?.contact(id).cloned())
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, CoreError> {
        Ok(self.projection()?.transaction(id).cloned())
    }

    /// The full event log in replay order, for history views.
    pub fn get_events(&self) -> Result<Vec<EventRecord>, CoreError> {
        Ok(self.inner.store.all_events()?)
    }

    /// Sum of all balances as of `at` (inclusive).
    pub fn total_debt_at(&self, at: DateTime<Utc>) -> Result<i64, CoreError> {
        let events = self.inner.store.all_events()?;
        Ok(projection::total_debt_at(&events, at))
    }

    // --- Writes (append event, re-project, nudge sync) ---

    pub fn create_contact(&self, fields: ContactFields) -> Result<Contact, CoreError> {
        if fields.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("contact name must not be empty".to_string()));
        }
        let id = ContactId::generate();
        let record = EventRecord::new(
            AggregateKind::Contact,
            id.as_str(),
            EventPayload::ContactCreated(fields),
        );
        let state = self.append_and_project(record)?;
        state
            .contact(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound("contact not found after create".to_string()))
    }

    pub fn update_contact(&self, id: &ContactId, patch: ContactPatch) -> Result<(), CoreError> {
        let record = EventRecord::new(
            AggregateKind::Contact,
            id.as_str(),
            EventPayload::ContactUpdated(patch),
        );
        self.append_and_project(record)?;
        Ok(())
    }

    pub fn delete_contact(&self, id: &ContactId) -> Result<(), CoreError> {
        let snapshot = self
            .projection()?
            .contact(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("contact {}", id)))?;
        let record = EventRecord::new(
            AggregateKind::Contact,
            id.as_str(),
            EventPayload::ContactDeleted { snapshot: Some(snapshot) },
        );
        self.append_and_project(record)?;
        Ok(())
    }

    pub fn create_transaction(&self, fields: TransactionFields) -> Result<Transaction, CoreError> {
        if fields.amount <= 0 {
            return Err(CoreError::InvalidInput("amount must be positive".to_string()));
        }
        if self.projection()?.contact(&fields.contact_id).is_none() {
            return Err(CoreError::NotFound(format!("contact {}", fields.contact_id)));
        }
        let id = TransactionId::generate();
        let record = EventRecord::new(
            AggregateKind::Transaction,
            id.as_str(),
            EventPayload::TransactionCreated(fields),
        );
        let state = self.append_and_project(record)?;
        state
            .transaction(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound("transaction not found after create".to_string()))
    }

    pub fn update_transaction(&self, id: &TransactionId, patch: TransactionPatch) -> Result<(), CoreError> {
        if matches!(patch.amount, Some(a) if a <= 0) {
            return Err(CoreError::InvalidInput("amount must be positive".to_string()));
        }
        let record = EventRecord::new(
            AggregateKind::Transaction,
            id.as_str(),
            EventPayload::TransactionUpdated(patch),
        );
        self.append_and_project(record)?;
        Ok(())
    }

    /// Delete a transaction. A delete right after another action on the
    /// same transaction (within the undo window) collapses into an UNDO
    /// of that action instead, which reads better in history.
    pub fn delete_transaction(&self, id: &TransactionId) -> Result<(), CoreError> {
        let last = self
            .last_event_for(AggregateKind::Transaction, id.as_str())?
            .ok_or_else(|| CoreError::NotFound(format!("transaction {}", id)))?;
        if within_undo_window(last.timestamp) {
            return self.undo_action(&last.id);
        }
        let snapshot = self.projection()?.transaction(id).cloned();
        let record = EventRecord::new(
            AggregateKind::Transaction,
            id.as_str(),
            EventPayload::TransactionDeleted { snapshot },
        );
        self.append_and_project(record)?;
        Ok(())
    }

    pub fn bulk_delete_contacts(&self, ids: &[ContactId]) -> Result<(), CoreError> {
        for id in ids {
            self.delete_contact(id)?;
        }
        Ok(())
    }

    pub fn bulk_delete_transactions(&self, ids: &[TransactionId]) -> Result<(), CoreError> {
        for id in ids {
            self.delete_transaction(id)?;
        }
        Ok(())
    }

    // --- Undo ---

    /// Append an UNDO event for `event_id`. The original event stays in
    /// the log; replay simply excludes it from now on. Synced like any
    /// other event.
    pub fn undo_action(&self, event_id: &EventId) -> Result<(), CoreError> {
        let target = self
            .inner
            .store
            .event_by_id(event_id)?
            .ok_or_else(|| CoreError::NotFound(format!("event {}", event_id)))?;
        let record = EventRecord::new(
            target.aggregate,
            target.aggregate_id.clone(),
            EventPayload::Undone { undone_event_id: target.id },
        );
        self.append_and_project(record)?;
        Ok(())
    }

    /// Undo the last action on a contact, if it is recent enough.
    pub fn undo_contact_action(&self, contact_id: &ContactId) -> Result<(), CoreError> {
        self.undo_last_for(AggregateKind::Contact, contact_id.as_str())
    }

    /// Undo the last action on a transaction, if it is recent enough.
    pub fn undo_transaction_action(&self, transaction_id: &TransactionId) -> Result<(), CoreError> {
        self.undo_last_for(AggregateKind::Transaction, transaction_id.as_str())
    }

    fn undo_last_for(&self, aggregate: AggregateKind, aggregate_id: &str) -> Result<(), CoreError> {
        let last = self
            .last_event_for(aggregate, aggregate_id)?
            .ok_or_else(|| CoreError::NotFound(format!("no events for {}", aggregate_id)))?;
        if !within_undo_window(last.timestamp) {
            return Err(CoreError::UndoRefused(format!(
                "action is too old (must be within {} seconds)",
                UNDO_WINDOW_SECS
            )));
        }
        self.undo_action(&last.id)
    }

    // --- Preferences ---

    pub fn get_default_direction(&self) -> Result<TransactionDirection, CoreError> {
        let stored = self.inner.store.config_get(DEFAULT_DIRECTION_KEY)?;
        Ok(stored
            .as_deref()
            .and_then(TransactionDirection::from_code)
            .unwrap_or(TransactionDirection::Owed))
    }

    pub fn set_default_direction(&self, direction: TransactionDirection) -> Result<(), CoreError> {
        self.inner
            .store
            .config_set(DEFAULT_DIRECTION_KEY, direction.as_str())?;
        Ok(())
    }

    // --- Sync & realtime ---

    /// One manual sync pass (push then pull). Coalesced with any pass
    /// already in flight.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        self.inner.sync.sync().await
    }

    /// Append server-origin events to the log (deduplicated by id) and
    /// re-project. Used by the pull path and the realtime bridge.
    pub fn ingest_remote_events(&self, events: &[serde_json::Value]) -> Result<usize, CoreError> {
        Ok(self.inner.sync.ingest_remote(events)?)
    }

    /// Background sync loop: runs a pass on every write nudge and on a
    /// steady tick, paced by the failure backoff. Call from within a
    /// tokio runtime.
    pub fn spawn_sync_loop(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tracing::info!("background sync loop started");
        tokio::spawn(async move {
            loop {
                let delay = inner.sync.next_delay();
                tokio::select! {
                    _ = inner.sync_nudge.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                if inner.sync.ready() {
                    let _ = inner.sync.sync().await;
                }
            }
        })
    }

    /// Realtime bridge: connect to the server's WebSocket, apply pushed
    /// events live, reconnect with backoff, full sync on every
    /// (re)connect. Call from within a tokio runtime.
    pub fn connect_realtime(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(realtime::run(inner))
    }

    /// Projection-change notifications, so the UI re-renders after any
    /// local write, remote pull, or realtime event without polling.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeKind> {
        self.inner.bus.subscribe()
    }

    // --- Internals ---

    /// Current projection, from the cache when present. A missing cache
    /// (first run, crash mid-write) rebuilds from the log.
    fn projection(&self) -> Result<ProjectionState, CoreError> {
        match self.inner.store.state_load()? {
            Some((contacts, transactions)) => Ok(ProjectionState::from_cached(contacts, transactions)),
            None => Ok(rebuild_and_cache(&self.inner.store)?),
        }
    }

    /// The single serialized write path: durable append, synchronous
    /// re-projection (read-your-writes), total-debt stamp, change
    /// notice, sync nudge. The network is never involved here.
    fn append_and_project(&self, record: EventRecord) -> Result<ProjectionState, CoreError> {
        self.inner.store.insert_event(&record)?;
        let state = rebuild_and_cache(&self.inner.store)?;
        self.inner.store.stamp_total_debt(&record.id, state.total_debt())?;
        self.inner.bus.publish(ChangeKind::LocalWrite);
        self.inner.sync_nudge.notify_one();
        Ok(state)
    }

    fn last_event_for(
        &self,
        aggregate: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Option<EventRecord>, CoreError> {
        let events = self.inner.store.events_for_aggregate(aggregate, aggregate_id)?;
        Ok(events.into_iter().last())
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }
}

fn within_undo_window(timestamp: DateTime<Utc>) -> bool {
    (Utc::now() - timestamp).num_seconds() < UNDO_WINDOW_SECS
}
