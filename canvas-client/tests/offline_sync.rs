//! Integration tests for offline editing and reconnect-triggered flushing.
//!
//! Edits made while the transport is down land in the local document at once
//! and are replayed against the store, in order, once the monitor reports the
//! connection is back.

mod common;

use std::sync::Arc;

use canvas_client::{SessionEvent, WriteOutcome};
use canvas_sync::{
    ConnectionEvent, ConnectionNotice, ConnectionStatus, FileStorage, KeyValueStorage,
    ObjectPatch, QueuedOperation, RemoteCall, RemoteError,
};
use common::{fast_config, rect, settle, wait_for, Network};

fn flushed_with(succeeded: usize) -> impl FnMut(&SessionEvent) -> bool {
    move |event: &SessionEvent| {
        matches!(event, SessionEvent::Flushed(report)
            if report.remaining == 0 && report.succeeded == succeeded)
    }
}

// ===========================================================================
// Offline edits replay in submission order
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_edits_flush_in_order_after_reconnect() {
    let net = Network::new();
    let mut alice = net.client("alice");
    let mut events = alice.session.subscribe();
    alice.connect();

    let card = rect(10.0, 10.0);
    let card_id = card.id;
    assert_eq!(
        alice.session.create_object(card).await.expect("create"),
        WriteOutcome::Sent
    );
    assert!(net.remote.get(card_id).is_some());

    alice.drop_transport();
    assert_eq!(alice.session.monitor().status(), ConnectionStatus::Reconnecting);

    let note = rect(50.0, 50.0);
    let note_id = note.id;
    let moved = alice
        .session
        .update_object(card_id, ObjectPatch::position(99.0, 98.0))
        .await
        .expect("update");
    let created = alice.session.create_object(note).await.expect("create");
    let deleted = alice.session.delete_object(card_id).await.expect("delete");
    assert_eq!(moved, WriteOutcome::Queued);
    assert_eq!(created, WriteOutcome::Queued);
    assert_eq!(deleted, WriteOutcome::Queued);

    // Local document reflects every edit immediately.
    assert!(alice.session.object(card_id).is_none());
    assert!(alice.session.object(note_id).is_some());
    assert_eq!(alice.session.queue().len(), 3);

    net.remote.clear_calls();
    let attempt = alice.attempts.recv().await.expect("reconnect attempt");
    assert_eq!(attempt, 1);
    alice.connect();

    wait_for(&mut events, flushed_with(3)).await;
    assert_eq!(
        net.remote.calls(),
        vec![
            RemoteCall::Update(card_id),
            RemoteCall::Insert(note_id),
            RemoteCall::Delete(card_id),
        ]
    );
    assert!(alice.session.queue().is_empty());
    assert!(net.remote.get(card_id).is_none());
    assert!(net.remote.get(note_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_offline_lifecycle_of_one_object_leaves_no_trace() {
    let net = Network::new();
    let mut alice = net.client("alice");
    let mut events = alice.session.subscribe();
    alice.connect();
    alice.drop_transport();

    let c1 = rect(0.0, 0.0);
    let c1_id = c1.id;
    alice.session.create_object(c1).await.expect("create");
    alice
        .session
        .update_object(c1_id, ObjectPatch::position(5.0, 5.0))
        .await
        .expect("update");
    alice.session.delete_object(c1_id).await.expect("delete");
    assert_eq!(alice.session.queue().len(), 3);

    alice.attempts.recv().await.expect("reconnect attempt");
    alice.connect();
    wait_for(&mut events, flushed_with(3)).await;

    assert_eq!(
        net.remote.calls(),
        vec![
            RemoteCall::Insert(c1_id),
            RemoteCall::Update(c1_id),
            RemoteCall::Delete(c1_id),
        ]
    );
    assert!(net.remote.is_empty());
    // Row echoes of the replayed writes settle to the same empty state.
    settle().await;
    assert!(alice.session.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_emits_restored_not_offline() {
    let net = Network::new();
    let mut alice = net.client("alice");
    let mut events = alice.session.subscribe();
    alice.connect();

    alice.drop_transport();
    alice.attempts.recv().await.expect("reconnect attempt");
    alice.connect();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Connection(ConnectionEvent::Notice(ConnectionNotice::Restored)))
    })
    .await;
    assert!(alice.session.connection_state().last_error.is_none());

    // Well past the offline notice delay: nothing stale fires.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(
            event,
            SessionEvent::Connection(ConnectionEvent::Notice(ConnectionNotice::WorkingOffline))
        ));
    }
}

// ===========================================================================
// Direct writes
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_rejected_direct_write_rolls_back() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.connect();

    let card = rect(1.0, 2.0);
    let card_id = card.id;
    alice.session.create_object(card).await.expect("create");
    settle().await;

    net.remote
        .fail_next(1, RemoteError::Rejected("row policy".into()));
    let outcome = alice
        .session
        .update_object(card_id, ObjectPatch::position(40.0, 40.0))
        .await
        .expect("update");

    assert_eq!(
        outcome,
        WriteOutcome::RolledBack(RemoteError::Rejected("row policy".into()))
    );
    let local = alice.session.object(card_id).expect("still present");
    assert!((local.x - 1.0).abs() < f64::EPSILON);
    assert!(alice.session.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_direct_create_is_removed_locally() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.connect();

    net.remote
        .fail_next(1, RemoteError::Rejected("quota".into()));
    let card = rect(0.0, 0.0);
    let card_id = card.id;
    let outcome = alice.session.create_object(card).await.expect("create");

    assert!(matches!(outcome, WriteOutcome::RolledBack(_)));
    assert!(alice.session.object(card_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_direct_write_is_queued_and_retried() {
    let net = Network::new();
    let mut alice = net.client("alice");
    let mut events = alice.session.subscribe();
    alice.connect();

    net.remote
        .fail_next(1, RemoteError::Network("connection reset".into()));
    let card = rect(0.0, 0.0);
    let card_id = card.id;
    let outcome = alice.session.create_object(card).await.expect("create");

    assert_eq!(outcome, WriteOutcome::Queued);
    assert!(alice.session.object(card_id).is_some());
    assert_eq!(alice.session.queue().len(), 1);
    // The failure counts as a dropped connection.
    assert_ne!(alice.session.monitor().status(), ConnectionStatus::Connected);

    alice.attempts.recv().await.expect("reconnect attempt");
    alice.connect();
    wait_for(&mut events, flushed_with(1)).await;
    assert!(net.remote.get(card_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_write_queued_while_connected_is_flushed() {
    let net = Network::new();
    let alice = net.client("alice");
    let mut events = alice.session.subscribe();
    alice.connect();
    settle().await;

    // An entry left behind by a pass that already finished.
    let stranded = rect(1.0, 1.0);
    alice
        .session
        .queue()
        .enqueue(QueuedOperation::create(alice.session.scope(), &stranded));

    let card = rect(2.0, 2.0);
    let card_id = card.id;
    let outcome = alice.session.create_object(card).await.expect("create");
    assert_eq!(outcome, WriteOutcome::Queued);

    wait_for(&mut events, flushed_with(2)).await;
    assert!(alice.session.queue().is_empty());
    assert!(net.remote.get(stranded.id).is_some());
    assert!(net.remote.get(card_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_empty_patch_is_rejected() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.connect();

    let card = rect(0.0, 0.0);
    let card_id = card.id;
    alice.session.create_object(card).await.expect("create");

    let err = alice
        .session
        .update_object(card_id, ObjectPatch::default())
        .await
        .expect_err("empty patch");
    assert!(matches!(err, canvas_sync::SyncError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_updates_to_one_object_apply_in_order() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.connect();
    net.remote.set_latency(std::time::Duration::from_millis(5));

    let card = rect(0.0, 0.0);
    let card_id = card.id;
    alice.session.create_object(card).await.expect("create");

    let (a, b, c) = tokio::join!(
        alice
            .session
            .update_object(card_id, ObjectPatch::position(1.0, 0.0)),
        alice
            .session
            .update_object(card_id, ObjectPatch::position(2.0, 0.0)),
        alice
            .session
            .update_object(card_id, ObjectPatch::position(3.0, 0.0)),
    );
    for outcome in [a, b, c] {
        assert_eq!(outcome.expect("update"), WriteOutcome::Sent);
    }

    let stored = net.remote.get(card_id).expect("stored");
    assert!((stored.x - 3.0).abs() < f64::EPSILON);
}

// ===========================================================================
// Durability across restarts
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = Network::new();
    let storage: Arc<dyn KeyValueStorage> =
        Arc::new(FileStorage::new(dir.path()).expect("file storage"));

    let card = rect(5.0, 5.0);
    let card_id = card.id;
    {
        let alice = net.client_with("alice", fast_config(), Arc::clone(&storage));
        alice.connect();
        alice.drop_transport();
        let outcome = alice.session.create_object(card).await.expect("create");
        assert_eq!(outcome, WriteOutcome::Queued);
        alice.session.shutdown().await;
    }

    let reopened: Arc<dyn KeyValueStorage> =
        Arc::new(FileStorage::new(dir.path()).expect("file storage"));
    let alice = net.client_with("alice", fast_config(), reopened);
    let mut events = alice.session.subscribe();
    assert_eq!(alice.session.queue().len(), 1);
    // A recent disconnect resumes as disconnected rather than connecting.
    assert_eq!(alice.session.monitor().status(), ConnectionStatus::Disconnected);

    alice.connect();
    wait_for(&mut events, flushed_with(1)).await;
    assert!(net.remote.get(card_id).is_some());
}
