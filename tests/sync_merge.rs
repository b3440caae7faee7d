//! Merge semantics without a server: remote streams are ingested by
//! union + dedup and replayed in timestamp order, so duplicate delivery
//! is harmless and independently-written devices converge.

mod common;

use common::{contact_fields, lent, owed, wire_events};
use tally_client_core::{EventVerb, TallyClient};

#[test]
fn duplicate_pull_does_not_double_apply() {
    common::init_tracing();
    let origin = TallyClient::open_in_memory().expect("origin");
    let alice = origin.create_contact(contact_fields("Alice")).expect("alice");
    origin.create_transaction(lent(&alice.id, 500)).expect("t1");
    let batch = wire_events(&origin);

    let device = TallyClient::open_in_memory().expect("device");
    assert_eq!(device.ingest_remote_events(&batch).expect("first pull"), 2);
    assert_eq!(device.ingest_remote_events(&batch).expect("duplicate pull"), 0);

    let contact = device.get_contact(&alice.id).expect("get").expect("exists");
    assert_eq!(contact.balance, 500, "duplicate delivery must not double-count");
    assert_eq!(device.get_events().expect("events").len(), 2);
}

#[test]
fn ingested_events_are_marked_synced() {
    let origin = TallyClient::open_in_memory().expect("origin");
    origin.create_contact(contact_fields("Alice")).expect("alice");

    let device = TallyClient::open_in_memory().expect("device");
    device.ingest_remote_events(&wire_events(&origin)).expect("pull");
    assert!(device.get_events().expect("events").iter().all(|e| e.synced));
    let contacts = device.get_contacts().expect("contacts");
    assert!(contacts[0].is_synced);
}

#[test]
fn two_devices_converge_after_exchanging_events() {
    // Device X and device Y write independently (disjoint event ids),
    // then each ingests the other's stream.
    let x = TallyClient::open_in_memory().expect("x");
    let y = TallyClient::open_in_memory().expect("y");

    let alice = x.create_contact(contact_fields("Alice")).expect("alice");
    x.create_transaction(lent(&alice.id, 500)).expect("t1");
    x.create_transaction(lent(&alice.id, 100)).expect("t3");

    let bob = y.create_contact(contact_fields("Bob")).expect("bob");
    y.create_transaction(owed(&bob.id, 50)).expect("t4");

    let from_x = wire_events(&x);
    let from_y = wire_events(&y);
    x.ingest_remote_events(&from_y).expect("x pulls y");
    y.ingest_remote_events(&from_x).expect("y pulls x");

    // Compare domain state; sync flags legitimately differ until each
    // device has pushed its own events.
    let domain = |client: &TallyClient| {
        let contacts: Vec<_> = client
            .get_contacts()
            .expect("contacts")
            .into_iter()
            .map(|c| (c.id, c.name, c.balance))
            .collect();
        let transactions: Vec<_> = client
            .get_transactions()
            .expect("transactions")
            .into_iter()
            .map(|t| (t.id, t.contact_id, t.direction, t.amount))
            .collect();
        (contacts, transactions)
    };
    assert_eq!(domain(&x), domain(&y));
    assert_eq!(x.get_contact(&alice.id).unwrap().unwrap().balance, 600);
    assert_eq!(x.get_contact(&bob.id).unwrap().unwrap().balance, -50);
}

#[test]
fn undo_round_trips_across_devices() {
    let x = TallyClient::open_in_memory().expect("x");
    let alice = x.create_contact(contact_fields("Alice")).expect("alice");
    let t1 = x.create_transaction(lent(&alice.id, 500)).expect("t1");
    // Undo the transaction create on the originating device.
    x.undo_transaction_action(&t1.id).expect("undo");
    assert_eq!(x.get_contact(&alice.id).unwrap().unwrap().balance, 0);

    // A second device replaying the full stream (including the UNDO)
    // lands on the same state as if the create never happened.
    let y = TallyClient::open_in_memory().expect("y");
    y.ingest_remote_events(&wire_events(&x)).expect("pull");
    assert_eq!(y.get_contact(&alice.id).unwrap().unwrap().balance, 0);
    assert!(y.get_transaction(&t1.id).unwrap().is_none());
    // The undone event is still in the log on both sides.
    assert!(y
        .get_events()
        .unwrap()
        .iter()
        .any(|e| e.payload.verb() == EventVerb::Undo));
}

#[test]
fn replaying_a_merged_log_is_deterministic() {
    let x = TallyClient::open_in_memory().expect("x");
    let y = TallyClient::open_in_memory().expect("y");
    let alice = x.create_contact(contact_fields("Alice")).expect("alice");
    x.create_transaction(lent(&alice.id, 500)).expect("t1");
    y.ingest_remote_events(&wire_events(&x)).expect("pull");
    y.create_transaction(owed(&alice.id, 200)).expect("t2");

    let events = y.get_events().expect("events");
    let a = tally_client_core::rebuild(&events);
    let b = tally_client_core::rebuild(&events);
    assert_eq!(a.contacts(), b.contacts());
    assert_eq!(a.transactions(), b.transactions());
    assert_eq!(a.total_debt(), 300);
}
