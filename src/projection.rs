//! Projection engine: folds the event log into current contact and
//! transaction state, including running balances.
//!
//! `rebuild` is pure and deterministic: the same event sequence always
//! produces the same state, so it is safe to re-run after conflicting
//! syncs. UNDO is replay-exclusion: an undone event is skipped entirely,
//! which yields exactly the state that would exist had it never been
//! appended. Inconsistent events (unknown references, duplicates) are
//! logged and tolerated, never fatal — the log stays authoritative.

use crate::error::StoreError;
use crate::event::{replay_order, EventPayload, EventRecord, EventVerb};
use crate::ids::{ContactId, EventId, TransactionId};
use crate::models::{Contact, Transaction};
use crate::storage::LocalStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Last snapshot of a deleted entity, keyed by the DELETED event id.
/// Kept so deletes are undo-able in history views and past amounts stay
/// resolvable.
#[derive(Clone, Debug, PartialEq)]
pub enum Tombstone {
    Contact(Contact),
    Transaction(Transaction),
}

/// Materialized current state. Derived and disposable: always fully
/// reconstructable from the event log.
#[derive(Clone, Debug, Default)]
pub struct ProjectionState {
    contacts: HashMap<ContactId, Contact>,
    transactions: HashMap<TransactionId, Transaction>,
    tombstones: HashMap<EventId, Tombstone>,
}

impl ProjectionState {
    /// Reconstruct from the persisted cache (tombstones are not cached;
    /// they come back on the next full rebuild).
    pub fn from_cached(contacts: Vec<Contact>, transactions: Vec<Transaction>) -> Self {
        Self {
            contacts: contacts.into_iter().map(|c| (c.id.clone(), c)).collect(),
            transactions: transactions.into_iter().map(|t| (t.id.clone(), t)).collect(),
            tombstones: HashMap::new(),
        }
    }

    /// Contacts in deterministic order (creation time, then id).
    pub fn contacts(&self) -> Vec<Contact> {
        let mut out: Vec<Contact> = self.contacts.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        out
    }

    /// Transactions in deterministic order (creation time, then id).
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut out: Vec<Transaction> = self.transactions.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        out
    }

    pub fn contact(&self, id: &ContactId) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn tombstones(&self) -> &HashMap<EventId, Tombstone> {
        &self.tombstones
    }

    /// Sum of all contact balances.
    pub fn total_debt(&self) -> i64 {
        self.contacts.values().map(|c| c.balance).sum()
    }

    /// Apply one event on top of current state, for low-latency realtime
    /// application. Returns `false` when the event cannot be applied
    /// incrementally (UNDO re-opens history) and a full rebuild is needed.
    pub fn apply_live(&mut self, event: &EventRecord) -> bool {
        if event.payload.verb() == EventVerb::Undo {
            return false;
        }
        self.apply(event);
        true
    }

    fn apply(&mut self, event: &EventRecord) {
        match &event.payload {
            EventPayload::ContactCreated(f) => self.apply_contact_created(event, f),
            EventPayload::ContactUpdated(p) => self.apply_contact_updated(event, p),
            EventPayload::ContactDeleted { snapshot } => self.apply_contact_deleted(event, snapshot.clone()),
            EventPayload::TransactionCreated(f) => self.apply_transaction_created(event, f),
            EventPayload::TransactionUpdated(p) => self.apply_transaction_updated(event, p),
            EventPayload::TransactionDeleted { snapshot } => {
                self.apply_transaction_deleted(event, snapshot.clone())
            }
            // UNDO never reaches here: rebuild excludes it, apply_live rejects it.
            EventPayload::Undone { .. } => {}
        }
    }

    fn apply_contact_created(&mut self, event: &EventRecord, f: &crate::event::ContactFields) {
        let Ok(id) = ContactId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "contact CREATED with invalid aggregate id");
            return;
        };
        if let Some(existing) = self.contacts.get_mut(&id) {
            // Duplicate create (e.g. replayed from two sources): refresh
            // fields, keep the accumulated balance.
            tracing::warn!(contact = %id, "duplicate contact CREATED, merging");
            existing.name = f.name.clone();
            existing.username = f.username.clone();
            existing.phone = f.phone.clone();
            existing.email = f.email.clone();
            existing.notes = f.notes.clone();
            existing.updated_at = event.timestamp;
            existing.is_synced = event.synced;
            return;
        }
        self.contacts.insert(
            id.clone(),
            Contact {
                id,
                name: f.name.clone(),
                username: f.username.clone(),
                phone: f.phone.clone(),
                email: f.email.clone(),
                notes: f.notes.clone(),
                balance: 0,
                created_at: event.timestamp,
                updated_at: event.timestamp,
                is_synced: event.synced,
            },
        );
    }

    fn apply_contact_updated(&mut self, event: &EventRecord, p: &crate::event::ContactPatch) {
        let Ok(id) = ContactId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "contact UPDATED with invalid aggregate id");
            return;
        };
        match self.contacts.get_mut(&id) {
            Some(c) => {
                if let Some(name) = &p.name {
                    c.name = name.clone();
                }
                if p.username.is_some() {
                    c.username = p.username.clone();
                }
                if p.phone.is_some() {
                    c.phone = p.phone.clone();
                }
                if p.email.is_some() {
                    c.email = p.email.clone();
                }
                if p.notes.is_some() {
                    c.notes = p.notes.clone();
                }
                c.updated_at = event.timestamp;
                c.is_synced = event.synced;
            }
            None => {
                // Out-of-order update; keep going with a placeholder so
                // later events still have something to land on.
                tracing::warn!(contact = %id, "UPDATED for unknown contact, creating placeholder");
                self.contacts.insert(
                    id.clone(),
                    Contact {
                        id,
                        name: p.name.clone().unwrap_or_default(),
                        username: p.username.clone(),
                        phone: p.phone.clone(),
                        email: p.email.clone(),
                        notes: p.notes.clone(),
                        balance: 0,
                        created_at: event.timestamp,
                        updated_at: event.timestamp,
                        is_synced: event.synced,
                    },
                );
            }
        }
    }

    fn apply_contact_deleted(&mut self, event: &EventRecord, snapshot: Option<Contact>) {
        let Ok(id) = ContactId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "contact DELETED with invalid aggregate id");
            return;
        };
        let removed = self.contacts.remove(&id);
        // A deleted contact takes its transactions (and their balance
        // contributions) out of the live view with it.
        let orphaned: Vec<TransactionId> = self
            .transactions
            .values()
            .filter(|t| t.contact_id == id)
            .map(|t| t.id.clone())
            .collect();
        for tid in orphaned {
            self.transactions.remove(&tid);
        }
        match snapshot.or(removed) {
            Some(c) => {
                self.tombstones.insert(event.id.clone(), Tombstone::Contact(c));
            }
            None => tracing::warn!(contact = %id, "DELETED for unknown contact"),
        }
    }

    fn apply_transaction_created(&mut self, event: &EventRecord, f: &crate::event::TransactionFields) {
        let Ok(id) = TransactionId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "transaction CREATED with invalid aggregate id");
            return;
        };
        if self.transactions.contains_key(&id) {
            tracing::warn!(transaction = %id, "duplicate transaction CREATED, ignoring");
            return;
        }
        let Some(contact) = self.contacts.get_mut(&f.contact_id) else {
            tracing::warn!(transaction = %id, contact = %f.contact_id, "transaction references unknown contact");
            return;
        };
        contact.balance += f.direction.signed(f.amount);
        self.transactions.insert(
            id.clone(),
            Transaction {
                id,
                contact_id: f.contact_id.clone(),
                kind: f.kind,
                direction: f.direction,
                amount: f.amount,
                currency: f.currency,
                description: f.description.clone(),
                transaction_date: f.transaction_date,
                due_date: f.due_date,
                created_at: event.timestamp,
                updated_at: event.timestamp,
                is_synced: event.synced,
            },
        );
    }

    fn apply_transaction_updated(&mut self, event: &EventRecord, p: &crate::event::TransactionPatch) {
        let Ok(id) = TransactionId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "transaction UPDATED with invalid aggregate id");
            return;
        };
        let Some(existing) = self.transactions.get_mut(&id) else {
            self.apply_transaction_placeholder(event, p, id);
            return;
        };
        let old_signed = existing.signed_amount();
        let old_contact = existing.contact_id.clone();
        if let Some(contact_id) = &p.contact_id {
            existing.contact_id = contact_id.clone();
        }
        if let Some(kind) = p.kind {
            existing.kind = kind;
        }
        if let Some(direction) = p.direction {
            existing.direction = direction;
        }
        if let Some(amount) = p.amount {
            existing.amount = amount;
        }
        if let Some(currency) = p.currency {
            existing.currency = currency;
        }
        if p.description.is_some() {
            existing.description = p.description.clone();
        }
        if let Some(date) = p.transaction_date {
            existing.transaction_date = date;
        }
        if p.due_date.is_some() {
            existing.due_date = p.due_date;
        }
        existing.updated_at = event.timestamp;
        existing.is_synced = event.synced;
        let new_signed = existing.signed_amount();
        let new_contact = existing.contact_id.clone();

        if old_contact == new_contact {
            match self.contacts.get_mut(&old_contact) {
                Some(c) => c.balance += new_signed - old_signed,
                None => tracing::warn!(transaction = %id, contact = %old_contact, "updated transaction references unknown contact"),
            }
        } else {
            match self.contacts.get_mut(&old_contact) {
                Some(c) => c.balance -= old_signed,
                None => tracing::warn!(transaction = %id, contact = %old_contact, "transaction moved off unknown contact"),
            }
            match self.contacts.get_mut(&new_contact) {
                Some(c) => c.balance += new_signed,
                None => tracing::warn!(transaction = %id, contact = %new_contact, "transaction moved onto unknown contact"),
            }
        }
    }

    /// UPDATED for a transaction we have never seen: materialize it when
    /// the patch carries enough to be meaningful, otherwise drop it.
    fn apply_transaction_placeholder(
        &mut self,
        event: &EventRecord,
        p: &crate::event::TransactionPatch,
        id: TransactionId,
    ) {
        let (Some(contact_id), Some(direction), Some(amount)) = (p.contact_id.clone(), p.direction, p.amount)
        else {
            tracing::warn!(transaction = %id, "UPDATED for unknown transaction with incomplete patch, skipping");
            return;
        };
        let Some(contact) = self.contacts.get_mut(&contact_id) else {
            tracing::warn!(transaction = %id, contact = %contact_id, "placeholder transaction references unknown contact");
            return;
        };
        tracing::warn!(transaction = %id, "UPDATED for unknown transaction, creating placeholder");
        contact.balance += direction.signed(amount);
        self.transactions.insert(
            id.clone(),
            Transaction {
                id,
                contact_id,
                kind: p.kind.unwrap_or_default(),
                direction,
                amount,
                currency: p.currency.unwrap_or_default(),
                description: p.description.clone(),
                transaction_date: p.transaction_date.unwrap_or_else(|| event.timestamp.date_naive()),
                due_date: p.due_date,
                created_at: event.timestamp,
                updated_at: event.timestamp,
                is_synced: event.synced,
            },
        );
    }

    fn apply_transaction_deleted(&mut self, event: &EventRecord, snapshot: Option<Transaction>) {
        let Ok(id) = TransactionId::parse(&event.aggregate_id) else {
            tracing::warn!(event = %event.id, "transaction DELETED with invalid aggregate id");
            return;
        };
        let removed = self.transactions.remove(&id);
        if let Some(t) = &removed {
            match self.contacts.get_mut(&t.contact_id) {
                Some(c) => c.balance -= t.signed_amount(),
                None => tracing::warn!(transaction = %id, contact = %t.contact_id, "deleted transaction references unknown contact"),
            }
        }
        match removed.or(snapshot) {
            Some(t) => {
                self.tombstones.insert(event.id.clone(), Tombstone::Transaction(t));
            }
            None => tracing::warn!(transaction = %id, "DELETED for unknown transaction"),
        }
    }
}

/// Replay every event in `(timestamp, seq)` order into a fresh state.
/// Pure: same sequence in, same state out.
pub fn rebuild(events: &[EventRecord]) -> ProjectionState {
    let mut ordered: Vec<&EventRecord> = events.iter().collect();
    ordered.sort_by(|a, b| replay_order(a, b));
    let undone = undone_ids(&ordered);
    let mut state = ProjectionState::default();
    for event in ordered {
        if event.payload.verb() == EventVerb::Undo {
            continue;
        }
        if undone.contains(&event.id) {
            continue;
        }
        state.apply(event);
    }
    state
}

/// Ids excluded from replay. Processed newest-first so an UNDO that was
/// itself undone does not suppress its target.
fn undone_ids(ordered: &[&EventRecord]) -> HashSet<EventId> {
    let mut undone = HashSet::new();
    for event in ordered.iter().rev() {
        if let EventPayload::Undone { undone_event_id } = &event.payload {
            if undone.contains(&event.id) {
                continue;
            }
            undone.insert(undone_event_id.clone());
        }
    }
    undone
}

/// Total debt as of `at` (inclusive). Replays only the prefix, so it
/// matches the live projection when `at` is now.
pub fn total_debt_at(events: &[EventRecord], at: DateTime<Utc>) -> i64 {
    let prefix: Vec<EventRecord> = events.iter().filter(|e| e.timestamp <= at).cloned().collect();
    rebuild(&prefix).total_debt()
}

/// Rebuild from the full log and atomically replace the cached
/// projection. The recovery path for any suspected cache divergence.
pub fn rebuild_and_cache(store: &LocalStore) -> Result<ProjectionState, StoreError> {
    let events = store.all_events()?;
    let state = rebuild(&events);
    store.state_save(&state.contacts(), &state.transactions())?;
    Ok(state)
}
