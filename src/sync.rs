//! Sync engine: push unsynced events, pull remote events, merge by
//! union, rebuild the projection.
//!
//! Events are deltas, deduplicated by id, and replayed in timestamp
//! order, so concurrent local and remote streams merge without
//! last-write-wins field clobbering. The local append already happened
//! before any of this runs; a failed pass never loses data.

use crate::api::ApiClient;
use crate::backoff::Backoff;
use crate::bus::{ChangeBus, ChangeKind};
use crate::error::{StoreError, SyncError};
use crate::event::EventRecord;
use crate::ids::EventId;
use crate::projection;
use crate::storage::LocalStore;
use crate::BackendConfig;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const LAST_SYNC_KEY: &str = "last_sync_timestamp";
pub(crate) const TOKEN_KEY: &str = "token";

/// Result of a sync trigger. `Skipped` means another pass was already
/// in flight or the backoff gate was closed; the trigger is coalesced,
/// not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { pushed: usize, pulled: usize },
    Skipped,
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    bus: ChangeBus,
    api: ApiClient,
    backend: Arc<Mutex<Option<BackendConfig>>>,
    in_flight: Mutex<bool>,
    backoff: Mutex<Backoff>,
}

/// Releases the in-flight flag on drop, even if the pass errors.
struct SyncGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> SyncGuard<'a> {
    fn try_acquire(flag: &'a Mutex<bool>) -> Option<Self> {
        let mut in_flight = flag.lock().expect("sync flag poisoned");
        if *in_flight {
            return None;
        }
        *in_flight = true;
        Some(Self { flag })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.flag.lock().expect("sync flag poisoned");
        *in_flight = false;
    }
}

impl SyncEngine {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        bus: ChangeBus,
        backend: Arc<Mutex<Option<BackendConfig>>>,
    ) -> Self {
        Self {
            store,
            bus,
            api: ApiClient::new(),
            backend,
            in_flight: Mutex::new(false),
            backoff: Mutex::new(Backoff::standard()),
        }
    }

    /// True when a sync pass can do anything: backend configured and a
    /// session token present. The background loop idles otherwise.
    pub(crate) fn ready(&self) -> bool {
        let configured = self.backend.lock().expect("backend lock").is_some();
        configured && matches!(self.store.config_get(TOKEN_KEY), Ok(Some(_)))
    }

    /// Loop pacing: sit out the backoff window (clamped), else 1s.
    pub(crate) fn next_delay(&self) -> Duration {
        let backoff = self.backoff.lock().expect("backoff lock");
        backoff
            .remaining()
            .map(|d| Duration::from_millis((d.as_millis() as u64).clamp(100, 3000)))
            .unwrap_or(Duration::from_secs(1))
    }

    /// One full pass: push then pull. Coalesced (one at a time) and
    /// gated by the failure backoff. A pass in progress runs to
    /// completion; it is never cancelled mid-push.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        {
            let backoff = self.backoff.lock().expect("backoff lock");
            if !backoff.can_attempt() {
                if let Some(wait) = backoff.remaining() {
                    tracing::debug!(remaining_ms = wait.as_millis() as u64, "sync skipped (backoff active)");
                }
                return Ok(SyncOutcome::Skipped);
            }
        }
        let Some(_guard) = SyncGuard::try_acquire(&self.in_flight) else {
            tracing::debug!("sync skipped (pass already in flight)");
            return Ok(SyncOutcome::Skipped);
        };

        tracing::debug!("sync pass start");
        match self.run_pass().await {
            Ok(outcome) => {
                self.backoff.lock().expect("backoff lock").reset();
                if let SyncOutcome::Completed { pushed, pulled } = outcome {
                    tracing::info!(pushed, pulled, "sync pass complete");
                }
                Ok(outcome)
            }
            Err(e) => {
                if matches!(e, SyncError::AuthDeclined) {
                    // Session is dead; keep data, drop the token so the
                    // UI can prompt for login.
                    let _ = self.store.config_remove(TOKEN_KEY);
                }
                if e.is_retryable() {
                    let delay = self.backoff.lock().expect("backoff lock").on_failure();
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "sync backoff armed");
                }
                tracing::warn!(error = %e, "sync pass failed");
                Err(e)
            }
        }
    }

    async fn run_pass(&self) -> Result<SyncOutcome, SyncError> {
        let pushed = self.push_unsynced().await?;
        let pulled = self.pull_and_merge().await?;
        Ok(SyncOutcome::Completed { pushed, pulled })
    }

    /// Push pending events in timestamp order; mark accepted ids synced.
    async fn push_unsynced(&self) -> Result<usize, SyncError> {
        let unsynced = self.store.unsynced_events()?;
        if unsynced.is_empty() {
            return Ok(0);
        }
        let base = self.base_url()?;
        let token = self.token()?;
        tracing::debug!(pending = unsynced.len(), "pushing unsynced events");
        let payload: Vec<Value> = unsynced
            .iter()
            .filter_map(|e| e.to_wire().ok())
            .collect();
        match self.api.push_events(&base, &token, &payload).await {
            Ok(accepted) => {
                let ids: Vec<EventId> = accepted.iter().filter_map(|s| EventId::parse(s).ok()).collect();
                self.store.mark_synced(&ids)?;
                Ok(ids.len())
            }
            Err(SyncError::PermissionDenied { .. }) => {
                // The server will never take these events. Drop them and
                // re-project so the optimistic local changes revert.
                let dropped = self.store.delete_unsynced()?;
                projection::rebuild_and_cache(&self.store)?;
                self.bus.publish(ChangeKind::RemotePull);
                tracing::warn!(dropped, "permission denied; pending events reverted");
                Err(SyncError::PermissionDenied { dropped })
            }
            // Network and other rejections leave the queue untouched for
            // the next trigger.
            Err(e) => Err(e),
        }
    }

    /// Pull remote events since the cursor (full pull when the local log
    /// is empty), merge, rebuild, advance the cursor.
    async fn pull_and_merge(&self) -> Result<usize, SyncError> {
        let base = self.base_url()?;
        let token = self.token()?;
        let since = if self.store.events_count()? == 0 {
            tracing::debug!("empty local log, full pull");
            None
        } else {
            self.store.config_get(LAST_SYNC_KEY)?
        };
        let remote = self.api.pull_events(&base, &token, since.as_deref()).await?;
        tracing::debug!(received = remote.len(), "pull response");
        let merged = self.ingest_remote(&remote)?;
        if let Some(ts) = remote.last().and_then(|e| e.get("timestamp").and_then(|v| v.as_str())) {
            self.store.config_set(LAST_SYNC_KEY, ts)?;
        }
        Ok(merged)
    }

    /// Append remote events to the log (deduplicated by id), then
    /// rebuild and publish. Returns how many were actually new. Also the
    /// entry point for events arriving outside a pull (realtime, tests).
    pub(crate) fn ingest_remote(&self, events: &[Value]) -> Result<usize, StoreError> {
        let mut merged = 0;
        for raw in events {
            let mut record = match EventRecord::from_wire(raw) {
                Ok(r) => r,
                Err(err) => {
                    // One bad event must not wedge the whole stream.
                    tracing::warn!(%err, "skipping undecodable remote event");
                    continue;
                }
            };
            record.synced = true;
            if self.store.insert_event(&record)? {
                merged += 1;
            }
        }
        // Rebuild even when nothing was new: a preceding push may have
        // flipped synced flags the cached projection still reflects.
        projection::rebuild_and_cache(&self.store)?;
        self.bus.publish(ChangeKind::RemotePull);
        Ok(merged)
    }

    fn base_url(&self) -> Result<String, SyncError> {
        self.backend
            .lock()
            .expect("backend lock")
            .as_ref()
            .map(|b| b.base_url.clone())
            .ok_or(SyncError::NotConfigured)
    }

    fn token(&self) -> Result<String, SyncError> {
        self.store
            .config_get(TOKEN_KEY)?
            .ok_or(SyncError::NotAuthenticated)
    }
}
