//! SQLite storage: append-only event log, projection cache, config.
//!
//! The log is the source of truth. Rows are never deleted except on the
//! explicit permission-revocation and full-reset paths; deletions of
//! domain entities are DELETED events, not row removals. `seq` is an
//! AUTOINCREMENT column so insertion order is explicit and monotonic.

use crate::error::StoreError;
use crate::event::{AggregateKind, EventPayload, EventRecord, EventVerb, WireError};
use crate::ids::EventId;
use crate::models::{Contact, Transaction};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

const DB_FILE: &str = "tally.db";

/// Durable local store. All writes on a device funnel through one of
/// these; the inner connection is serialized by the mutex.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        create_tables(&conn)?;
        tracing::debug!(path = %dir.display(), "local store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store, for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn).map_err(StoreError::from)
    }

    // --- Event log ---

    /// Durably append an event. Deduplicated by event id: returns `true`
    /// if the row was inserted, `false` if an event with this id already
    /// exists (duplicate delivery).
    pub fn insert_event(&self, e: &EventRecord) -> Result<bool, StoreError> {
        let event_data = serde_json::to_string(&e.wire_event_data()?)?;
        let inserted = self.with_conn(|conn| {
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO events (id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    e.id.as_str(),
                    e.aggregate.as_str(),
                    e.aggregate_id,
                    e.payload.verb().as_str(),
                    event_data,
                    e.timestamp_str(),
                    e.version,
                    if e.synced { 1 } else { 0 }
                ],
            )?;
            Ok(n > 0)
        })?;
        tracing::debug!(
            event = %e.id,
            aggregate = e.aggregate.as_str(),
            aggregate_id = %e.aggregate_id,
            verb = e.payload.verb().as_str(),
            inserted,
            "event append"
        );
        Ok(inserted)
    }

    /// All events in replay order (timestamp, then insertion seq).
    pub fn all_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events("SELECT seq, id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced FROM events ORDER BY timestamp ASC, seq ASC", params![])
    }

    /// Events strictly after `since`, in replay order. Supports the
    /// incremental sync cursor and point-in-time queries.
    pub fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<EventRecord>, StoreError> {
        let cutoff = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.query_events(
            "SELECT seq, id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced FROM events WHERE timestamp > ?1 ORDER BY timestamp ASC, seq ASC",
            params![cutoff],
        )
    }

    /// All events for one aggregate, oldest first.
    pub fn events_for_aggregate(
        &self,
        aggregate: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(
            "SELECT seq, id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced FROM events WHERE aggregate_type = ?1 AND aggregate_id = ?2 ORDER BY timestamp ASC, seq ASC",
            params![aggregate.as_str(), aggregate_id],
        )
    }

    /// The pending queue: events the server has not acknowledged.
    pub fn unsynced_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(
            "SELECT seq, id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced FROM events WHERE synced = 0 ORDER BY timestamp ASC, seq ASC",
            params![],
        )
    }

    pub fn event_by_id(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError> {
        let mut found = self.query_events(
            "SELECT seq, id, aggregate_type, aggregate_id, event_type, event_data, timestamp, version, synced FROM events WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(found.pop())
    }

    pub fn events_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0)))
    }

    /// Idempotent: marking an already-synced event again is a no-op.
    pub fn mark_synced(&self, ids: &[EventId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            for id in ids {
                conn.execute("UPDATE events SET synced = 1 WHERE id = ?1", params![id.as_str()])?;
            }
            Ok(())
        })
    }

    /// Stamp the post-event total debt into the stored `event_data`, so
    /// history views can show the running total per event.
    pub fn stamp_total_debt(&self, id: &EventId, total_debt: i64) -> Result<(), StoreError> {
        let raw: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT event_data FROM events WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let Some(raw) = raw else { return Ok(()) };
        let mut data: serde_json::Value = serde_json::from_str(&raw)?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("total_debt".to_string(), serde_json::json!(total_debt));
        }
        let updated = serde_json::to_string(&data)?;
        self.with_conn(|conn| {
            conn.execute("UPDATE events SET event_data = ?1 WHERE id = ?2", params![updated, id.as_str()])?;
            Ok(())
        })
    }

    /// Drop all pending (unsynced) events. Only used when the server
    /// explicitly rejected them with a permission error.
    pub fn delete_unsynced(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM events WHERE synced = 0", [])?;
            Ok(affected as u64)
        })
    }

    /// Wipe everything (events, cache, config). Used on logout/reset so
    /// the next sync does a full pull.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                DELETE FROM events;
                DELETE FROM state;
                DELETE FROM config;
                "#,
            )?;
            Ok(())
        })
    }

    // --- Projection cache ---

    /// Atomically replace the cached projection. Readers see the old row
    /// or the new one, never a partial mix.
    pub fn state_save(&self, contacts: &[Contact], transactions: &[Transaction]) -> Result<(), StoreError> {
        let contacts_json = serde_json::to_string(contacts)?;
        let transactions_json = serde_json::to_string(transactions)?;
        let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO state (slot, contacts_json, transactions_json, updated_at) VALUES (0, ?1, ?2, ?3)
                ON CONFLICT(slot) DO UPDATE SET contacts_json = ?1, transactions_json = ?2, updated_at = ?3
                "#,
                params![contacts_json, transactions_json, updated_at],
            )?;
            Ok(())
        })
    }

    pub fn state_load(&self) -> Result<Option<(Vec<Contact>, Vec<Transaction>)>, StoreError> {
        let pair: Option<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT contacts_json, transactions_json FROM state WHERE slot = 0")?;
            let mut rows = stmt.query([])?;
            if let Some(row) = rows.next()? {
                return Ok(Some((row.get(0)?, row.get(1)?)));
            }
            Ok(None)
        })?;
        match pair {
            Some((contacts_json, transactions_json)) => {
                let contacts: Vec<Contact> = serde_json::from_str(&contacts_json)?;
                let transactions: Vec<Transaction> = serde_json::from_str(&transactions_json)?;
                Ok(Some((contacts, transactions)))
            }
            None => Ok(None),
        }
    }

    // --- Config ---

    pub fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            if let Some(row) = rows.next()? {
                return Ok(Some(row.get(0)?));
            }
            Ok(None)
        })
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn config_remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn query_events(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows: Vec<RawEventRow> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mapped = stmt.query_map(args, RawEventRow::from_row)?;
            mapped.collect::<Result<Vec<_>, _>>()
        })?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(e) => events.push(e),
                // A row we cannot decode is skipped, not fatal: the log
                // stays replayable and the bad row stays inspectable.
                Err(err) => tracing::warn!(event = %row.id, %err, "skipping undecodable event row"),
            }
        }
        Ok(events)
    }
}

fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT);
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            synced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_events_order ON events(timestamp, seq);
        CREATE INDEX IF NOT EXISTS idx_events_synced ON events(synced);
        CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events(aggregate_type, aggregate_id);
        CREATE TABLE IF NOT EXISTS state (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            contacts_json TEXT NOT NULL,
            transactions_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
}

struct RawEventRow {
    seq: i64,
    id: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    event_data: String,
    timestamp: String,
    version: i32,
    synced: bool,
}

impl RawEventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            aggregate_type: row.get(2)?,
            aggregate_id: row.get(3)?,
            event_type: row.get(4)?,
            event_data: row.get(5)?,
            timestamp: row.get(6)?,
            version: row.get(7)?,
            synced: row.get::<_, i32>(8)? != 0,
        })
    }

    fn decode(&self) -> Result<EventRecord, WireError> {
        let aggregate = AggregateKind::from_code(&self.aggregate_type)
            .ok_or_else(|| WireError::UnknownAggregate(self.aggregate_type.clone()))?;
        let verb = EventVerb::from_code(&self.event_type)
            .ok_or_else(|| WireError::UnknownVerb(self.event_type.clone()))?;
        let data: serde_json::Value = serde_json::from_str(&self.event_data)?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| WireError::BadTimestamp(self.timestamp.clone()))?;
        Ok(EventRecord {
            id: EventId::parse(&self.id)?,
            aggregate,
            aggregate_id: self.aggregate_id.clone(),
            payload: EventPayload::decode(aggregate, verb, &data)?,
            timestamp,
            seq: self.seq,
            version: self.version,
            synced: self.synced,
            total_debt: data.get("total_debt").and_then(|v| v.as_i64()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ContactFields;
    use crate::ids::ContactId;

    fn contact_created(name: &str) -> EventRecord {
        EventRecord::new(
            AggregateKind::Contact,
            ContactId::generate().as_str(),
            EventPayload::ContactCreated(ContactFields {
                name: name.to_string(),
                username: None,
                phone: None,
                email: None,
                notes: None,
            }),
        )
    }

    #[test]
    fn insert_assigns_seq_and_dedups_by_id() {
        let store = LocalStore::open_in_memory().expect("open");
        let e = contact_created("Alice");
        assert!(store.insert_event(&e).expect("insert"));
        assert!(!store.insert_event(&e).expect("dup insert"), "same id must be ignored");
        let all = store.all_events().expect("all_events");
        assert_eq!(all.len(), 1);
        assert!(all[0].seq > 0, "seq should be assigned by the store");
    }

    #[test]
    fn replay_order_is_timestamp_then_seq() {
        let store = LocalStore::open_in_memory().expect("open");
        let mut first = contact_created("A");
        let mut second = contact_created("B");
        let mut tied = contact_created("C");
        first.timestamp = "2026-02-04T12:00:00Z".parse().unwrap();
        second.timestamp = "2026-02-04T12:00:01Z".parse().unwrap();
        tied.timestamp = first.timestamp;
        // Insert out of chronological order.
        store.insert_event(&second).unwrap();
        store.insert_event(&first).unwrap();
        store.insert_event(&tied).unwrap();
        let names: Vec<_> = store
            .all_events()
            .unwrap()
            .into_iter()
            .map(|e| match e.payload {
                EventPayload::ContactCreated(f) => f.name,
                _ => unreachable!(),
            })
            .collect();
        // "A" and "C" share a timestamp; insertion order (seq) breaks the tie.
        assert_eq!(names, vec!["A", "C", "B"]);
    }

    #[test]
    fn mark_synced_is_idempotent() {
        let store = LocalStore::open_in_memory().expect("open");
        let e = contact_created("Alice");
        store.insert_event(&e).unwrap();
        assert_eq!(store.unsynced_events().unwrap().len(), 1);
        store.mark_synced(&[e.id.clone()]).unwrap();
        store.mark_synced(&[e.id.clone()]).unwrap();
        assert!(store.unsynced_events().unwrap().is_empty());
        assert!(store.all_events().unwrap()[0].synced);
    }

    #[test]
    fn events_since_is_exclusive_cutoff() {
        let store = LocalStore::open_in_memory().expect("open");
        let mut old = contact_created("Old");
        let mut new = contact_created("New");
        old.timestamp = "2026-02-04T12:00:00Z".parse().unwrap();
        new.timestamp = "2026-02-04T13:00:00Z".parse().unwrap();
        store.insert_event(&old).unwrap();
        store.insert_event(&new).unwrap();
        let since = store.events_since(old.timestamp).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, new.id);
    }

    #[test]
    fn stamp_total_debt_survives_reload() {
        let store = LocalStore::open_in_memory().expect("open");
        let e = contact_created("Alice");
        store.insert_event(&e).unwrap();
        store.stamp_total_debt(&e.id, 500).unwrap();
        let back = store.event_by_id(&e.id).unwrap().expect("event");
        assert_eq!(back.total_debt, Some(500));
    }

    #[test]
    fn config_kv_round_trip() {
        let store = LocalStore::open_in_memory().expect("open");
        assert_eq!(store.config_get("token").unwrap(), None);
        store.config_set("token", "abc").unwrap();
        store.config_set("token", "def").unwrap();
        assert_eq!(store.config_get("token").unwrap().as_deref(), Some("def"));
        store.config_remove("token").unwrap();
        assert_eq!(store.config_get("token").unwrap(), None);
    }

    #[test]
    fn delete_unsynced_leaves_synced_rows() {
        let store = LocalStore::open_in_memory().expect("open");
        let kept = contact_created("Kept");
        let dropped = contact_created("Dropped");
        store.insert_event(&kept).unwrap();
        store.insert_event(&dropped).unwrap();
        store.mark_synced(&[kept.id.clone()]).unwrap();
        assert_eq!(store.delete_unsynced().unwrap(), 1);
        let all = store.all_events().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept.id);
    }
}
