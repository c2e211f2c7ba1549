use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use satchel::evict::{EvictedOwner, GradingLedger, OwnerStatus, SkipReason, SkippedOwner};
use satchel::{CacheKey, Locator, OwnerId};
use tokio::sync::{Notify, Semaphore};

use crate::{FakeTransfer, Fixture, items, request};

/// Reports the listed owners as fully graded and pushed.
struct Graded(HashSet<OwnerId>);

impl GradingLedger for Graded {
    async fn status(&self, owner: &OwnerId) -> Result<OwnerStatus> {
        let done = self.0.contains(owner);
        Ok(OwnerStatus {
            all_graded: done,
            staged_grades_pushed: done,
        })
    }
}

/// Reports every owner as complete, once released.
struct HeldLedger {
    entered: Notify,
    release: Semaphore,
}

impl HeldLedger {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

impl GradingLedger for HeldLedger {
    async fn status(&self, _owner: &OwnerId) -> Result<OwnerStatus> {
        self.entered.notify_one();
        let _permit = self.release.acquire().await?;
        Ok(OwnerStatus {
            all_graded: true,
            staged_grades_pushed: true,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn completed_owner_is_evicted_unless_in_flight() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());

    transfer.release(2);
    fixture
        .engine
        .start_batch(request("a1", items("s", 2), 2))
        .await
        .done()
        .await;

    // Cache something for a2, then leave a new a2 batch hanging in flight.
    fixture
        .store
        .put(&CacheKey::new("a2", "t0"), None, b"%PDF a2", "Assignment a2")
        .await
        .unwrap();
    fixture.engine.start_batch(request("a2", items("t", 1), 1)).await;

    let ledger = Graded(HashSet::from([OwnerId::new("a1"), OwnerId::new("a2")]));
    let report = fixture.engine.evict_completed(&ledger).await.unwrap();

    pretty_assert_eq!(
        report.evicted,
        vec![EvictedOwner {
            owner: OwnerId::new("a1"),
            entries: 2,
        }]
    );
    pretty_assert_eq!(
        report.skipped,
        vec![SkippedOwner {
            owner: OwnerId::new("a2"),
            reason: SkipReason::InFlight,
        }]
    );
    assert!(fixture.store.contains(&CacheKey::new("a2", "t0")).await.unwrap());
    assert!(!fixture.store.contains(&CacheKey::new("a1", "s1")).await.unwrap());
}

#[tokio::test]
async fn fresh_entries_survive_expiry() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 2), 2))
        .await
        .done()
        .await;

    let report = fixture.engine.evict_expired().await.unwrap();
    pretty_assert_eq!(report.entries(), 0);
    pretty_assert_eq!(fixture.engine.total_size().await.unwrap().count, 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn batch_waits_for_eviction_of_its_owner() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());
    fixture
        .store
        .put(
            &CacheKey::new("a1", "s1"),
            Some(&Locator::new("loc-s1")),
            b"%PDF s1",
            "Assignment a1",
        )
        .await
        .unwrap();

    let ledger = Arc::new(HeldLedger::new());
    let evicting = tokio::spawn({
        let engine = fixture.engine.clone();
        let ledger = ledger.clone();
        async move { engine.evict_completed(ledger.as_ref()).await }
    });
    ledger.entered.notified().await;

    // The batch cannot register while the owner is being evicted.
    let starting = tokio::spawn({
        let engine = fixture.engine.clone();
        async move { engine.start_batch(request("a1", items("s", 2), 2)).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!starting.is_finished());
    pretty_assert_eq!(fixture.transfer.calls(), 0);

    ledger.release.add_permits(1);
    let report = evicting.await.unwrap().unwrap();
    pretty_assert_eq!(
        report.evicted,
        vec![EvictedOwner {
            owner: OwnerId::new("a1"),
            entries: 1,
        }]
    );

    // The evicted document is downloaded again instead of counted as cached.
    let handle = starting.await.unwrap();
    transfer.release(2);
    let state = handle.done().await;
    pretty_assert_eq!(state.succeeded, 2);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 1);
    assert!(fixture.store.contains(&CacheKey::new("a1", "s1")).await.unwrap());
}
