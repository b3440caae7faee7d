//! Offline durability: everything written while disconnected survives a
//! process restart byte-for-byte — nothing lost, nothing duplicated.

mod common;

use common::{contact_fields, lent, owed};
use tally_client_core::TallyClient;

#[test]
fn restart_preserves_projections_and_log() {
    common::init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");

    let (contacts_before, transactions_before, event_count) = {
        let client = TallyClient::open(dir.path()).expect("open");
        let alice = client.create_contact(contact_fields("Alice")).expect("alice");
        let bob = client.create_contact(contact_fields("Bob")).expect("bob");
        client.create_transaction(lent(&alice.id, 500)).expect("t1");
        client.create_transaction(owed(&alice.id, 200)).expect("t2");
        client.create_transaction(lent(&bob.id, 1000)).expect("t3");
        (
            client.get_contacts().expect("contacts"),
            client.get_transactions().expect("transactions"),
            client.get_events().expect("events").len(),
        )
    };

    // Reopen the same directory, as after an app restart with no network.
    let client = TallyClient::open(dir.path()).expect("reopen");
    assert_eq!(client.get_contacts().expect("contacts"), contacts_before);
    assert_eq!(client.get_transactions().expect("transactions"), transactions_before);
    assert_eq!(client.get_events().expect("events").len(), event_count);

    let alice = contacts_before.iter().find(|c| c.name == "Alice").expect("alice");
    assert_eq!(alice.balance, 300);
}

#[test]
fn pending_queue_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let client = TallyClient::open(dir.path()).expect("open");
        let alice = client.create_contact(contact_fields("Alice")).expect("alice");
        client.create_transaction(lent(&alice.id, 500)).expect("t1");
    }

    let client = TallyClient::open(dir.path()).expect("reopen");
    let pending: Vec<_> = client
        .get_events()
        .expect("events")
        .into_iter()
        .filter(|e| !e.synced)
        .collect();
    // One queue entry per local event, still awaiting the server.
    assert_eq!(pending.len(), 2);
}

#[test]
fn cache_divergence_recovers_from_the_log() {
    // The projection cache is disposable: with only the event log on
    // disk, reopening rebuilds identical state.
    let dir = tempfile::tempdir().expect("tempdir");

    let contacts_before = {
        let client = TallyClient::open(dir.path()).expect("open");
        let alice = client.create_contact(contact_fields("Alice")).expect("alice");
        client.create_transaction(lent(&alice.id, 500)).expect("t1");
        client.get_contacts().expect("contacts")
    };

    let client = TallyClient::open(dir.path()).expect("reopen");
    // Rebuilt-from-log state must equal the cached state it replaces.
    let events = client.get_events().expect("events");
    let rebuilt = tally_client_core::rebuild(&events);
    assert_eq!(rebuilt.contacts(), contacts_before);
}
