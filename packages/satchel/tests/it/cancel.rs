use std::time::Duration;

use pretty_assertions::assert_eq as pretty_assert_eq;
use satchel::{CacheKey, OwnerId};

use crate::{FakeTransfer, Fixture, items, request, status, wait_until};

#[test_log::test(tokio::test(start_paused = true))]
async fn superseded_batch_never_writes() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());

    let handle = fixture.engine.start_batch(request("a1", items("s", 3), 3)).await;
    let mut progress = handle.progress.clone();

    // Let one through once all three transfers are waiting on the gate.
    while transfer.calls() < 3 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    transfer.release(1);
    wait_until(&mut progress, |state| state.succeeded == 1).await;

    let next = fixture.engine.cancel_running().await;
    assert!(next > handle.generation);

    // The remaining transfers now complete over the network.
    transfer.release(2);
    let state = handle.done().await;

    pretty_assert_eq!(fixture.transfer.completed(), 3);
    pretty_assert_eq!(state.attempted, 3);
    pretty_assert_eq!(state.succeeded, 1);
    pretty_assert_eq!(state.cancelled, 2);
    pretty_assert_eq!(state.failures, Vec::new());
    pretty_assert_eq!(fixture.store.total_size().await.unwrap().count, 1);
}

#[tokio::test(start_paused = true)]
async fn new_batch_supersedes_running_batch() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());

    let first = fixture.engine.start_batch(request("a1", items("s", 2), 1)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    pretty_assert_eq!(fixture.transfer.active(), 1);

    let second = fixture.engine.start_batch(request("a2", items("t", 1), 1)).await;
    transfer.release(10);

    let first = first.done().await;
    let second = second.done().await;

    // The first item was in the network when the second batch started and
    // is discarded; the second item is never attempted.
    pretty_assert_eq!(first.cancelled, 2);
    pretty_assert_eq!(first.succeeded, 0);
    pretty_assert_eq!(second.succeeded, 1);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s2"), 0);

    let owners = fixture.engine.owners().await.unwrap();
    pretty_assert_eq!(
        owners.into_iter().map(|owner| owner.owner).collect::<Vec<_>>(),
        vec![OwnerId::new("a2")]
    );
}

#[tokio::test(start_paused = true)]
async fn supersession_interrupts_backoff() {
    let transfer = FakeTransfer::new();
    transfer.script("loc-s1", [status(503), status(503), status(503)]);
    let fixture = Fixture::new(transfer);

    let handle = fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 1);

    fixture.engine.cancel_running().await;
    let state = handle.done().await;

    pretty_assert_eq!(state.cancelled, 1);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 1);
    assert!(!fixture.store.contains(&CacheKey::new("a1", "s1")).await.unwrap());
}
