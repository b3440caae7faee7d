//! Shared helpers for integration tests.

// Each integration test binary compiles its own copy; not every binary
// uses every helper.
#![allow(dead_code)]

use chrono::Utc;
use tally_client_core::{
    ContactFields, ContactId, Currency, TallyClient, TransactionDirection, TransactionFields,
    TransactionKind,
};

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn contact_fields(name: &str) -> ContactFields {
    ContactFields {
        name: name.to_string(),
        username: None,
        phone: None,
        email: None,
        notes: None,
    }
}

pub fn lent(contact: &ContactId, amount: i64) -> TransactionFields {
    transaction(contact, TransactionDirection::Lent, amount)
}

pub fn owed(contact: &ContactId, amount: i64) -> TransactionFields {
    transaction(contact, TransactionDirection::Owed, amount)
}

fn transaction(contact: &ContactId, direction: TransactionDirection, amount: i64) -> TransactionFields {
    TransactionFields {
        contact_id: contact.clone(),
        kind: TransactionKind::Money,
        direction,
        amount,
        currency: Currency::IQD,
        description: None,
        transaction_date: Utc::now().date_naive(),
        due_date: None,
    }
}

/// The client's full event log as wire objects, as a server (or peer
/// device) would see them.
pub fn wire_events(client: &TallyClient) -> Vec<serde_json::Value> {
    client
        .get_events()
        .expect("get_events")
        .iter()
        .map(|e| e.to_wire().expect("to_wire"))
        .collect()
}
