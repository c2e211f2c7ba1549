use std::time::Duration;

use pretty_assertions::assert_eq as pretty_assert_eq;
use satchel::progress::ItemFailure;
use satchel::sync::{MISSING_ITEM_ID, NO_SOURCE_LOCATOR};
use satchel::{BatchItem, CacheKey, ItemId, Locator, OwnerId};

use crate::{FakeTransfer, Fixture, document, items, request, status, wait_until};

#[test_log::test(tokio::test(start_paused = true))]
async fn batch_with_one_flaky_item_succeeds() {
    let transfer = FakeTransfer::new();
    transfer.script("loc-s5", [status(500), status(500), status(500)]);
    let fixture = Fixture::new(transfer);

    let handle = fixture.engine.start_batch(request("a1", items("s", 5), 2)).await;
    let state = handle.done().await;

    pretty_assert_eq!(state.attempted, 5);
    pretty_assert_eq!(state.total, 5);
    pretty_assert_eq!(state.succeeded, 5);
    pretty_assert_eq!(state.in_flight, false);
    pretty_assert_eq!(state.failures, Vec::new());
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s5"), 4);
    pretty_assert_eq!(fixture.transfer.calls(), 8);

    for n in 1..=5 {
        let entry = fixture
            .engine
            .lookup(None, &OwnerId::new("a1"), &ItemId::new(format!("s{n}")))
            .await
            .unwrap();
        pretty_assert_eq!(entry.blob, document(&format!("loc-s{n}")));
        pretty_assert_eq!(entry.owner_label, "Assignment a1");
    }
}

#[tokio::test(start_paused = true)]
async fn not_found_fails_after_one_attempt() {
    let transfer = FakeTransfer::new();
    transfer.script("loc-s2", [status(404)]);
    let fixture = Fixture::new(transfer);

    let state = fixture
        .engine
        .start_batch(request("a1", items("s", 2), 2))
        .await
        .done()
        .await;

    pretty_assert_eq!(state.attempted, 2);
    pretty_assert_eq!(state.succeeded, 1);
    pretty_assert_eq!(state.failures.len(), 1);
    pretty_assert_eq!(state.failures[0].item, Some(ItemId::new("s2")));
    assert!(
        state.failures[0].reason.contains("not found"),
        "{:?}",
        state.failures[0]
    );
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s2"), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_unavailable_then_succeeds() {
    let transfer = FakeTransfer::new();
    transfer.script("loc-s1", [status(503), status(503), status(503)]);
    let fixture = Fixture::new(transfer);

    let state = fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    pretty_assert_eq!(state.succeeded, 1);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_recorded() {
    let transfer = FakeTransfer::new();
    transfer.script("loc-s1", [status(502), status(502), status(502), status(502)]);
    let fixture = Fixture::new(transfer);

    let state = fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    pretty_assert_eq!(state.attempted, 1);
    pretty_assert_eq!(state.failures.len(), 1);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 4);
    assert!(!fixture.store.contains(&CacheKey::new("a1", "s1")).await.unwrap());
}

#[tokio::test]
async fn cached_batch_is_idempotent() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 3), 2))
        .await
        .done()
        .await;
    pretty_assert_eq!(fixture.transfer.calls(), 3);

    let handle = fixture.engine.start_batch(request("a1", items("s", 3), 2)).await;
    let state = handle.progress.peek();
    pretty_assert_eq!(state.in_flight, false);
    pretty_assert_eq!(state.attempted, 3);
    pretty_assert_eq!(state.succeeded, 3);
    pretty_assert_eq!(fixture.transfer.calls(), 3);
}

#[tokio::test]
async fn empty_batch_is_terminal() {
    let fixture = Fixture::new(FakeTransfer::new());
    let handle = fixture.engine.start_batch(request("a1", Vec::new(), 2)).await;

    let state = handle.progress.peek();
    pretty_assert_eq!(state.total, 0);
    pretty_assert_eq!(state.attempted, 0);
    pretty_assert_eq!(state.in_flight, false);
    pretty_assert_eq!(fixture.transfer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded() {
    let transfer = FakeTransfer::new().with_delay(Duration::from_millis(100));
    let fixture = Fixture::new(transfer);

    let state = fixture
        .engine
        .start_batch(request("a1", items("s", 10), 3))
        .await
        .done()
        .await;

    pretty_assert_eq!(state.succeeded, 10);
    pretty_assert_eq!(fixture.transfer.peak(), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_concurrency_uses_ceiling() {
    let transfer = FakeTransfer::new().with_delay(Duration::from_millis(100));
    let fixture = Fixture::new(transfer);

    let state = fixture
        .engine
        .start_batch(request("a1", items("s", 30), 0))
        .await
        .done()
        .await;

    pretty_assert_eq!(state.succeeded, 30);
    pretty_assert_eq!(fixture.transfer.peak(), satchel::schedule::UNBOUNDED_CEILING);
}

#[tokio::test(start_paused = true)]
async fn progress_is_monotonic() {
    let transfer = FakeTransfer::new().with_delay(Duration::from_millis(10));
    let fixture = Fixture::new(transfer);

    let handle = fixture.engine.start_batch(request("a1", items("s", 8), 2)).await;
    let mut progress = handle.progress.clone();
    let mut observed = Vec::new();
    loop {
        let state = progress.snapshot();
        observed.push((state.attempted, state.in_flight));
        if !state.in_flight {
            break;
        }
        assert!(progress.changed().await);
    }

    assert!(observed.windows(2).all(|pair| pair[0].0 <= pair[1].0), "{observed:?}");
    let finished = observed.iter().filter(|(_, in_flight)| !in_flight).collect::<Vec<_>>();
    pretty_assert_eq!(finished, vec![&(8, false)]);
}

#[tokio::test]
async fn invalid_items_are_flagged() {
    let fixture = Fixture::new(FakeTransfer::new());
    let batch = vec![
        BatchItem::new("s1", "loc-s1"),
        BatchItem {
            item: None,
            locator: Some(Locator::new("loc-anonymous")),
        },
        BatchItem {
            item: Some(ItemId::new("")),
            locator: Some(Locator::new("loc-empty")),
        },
        BatchItem::new("s1", "loc-duplicate"),
        BatchItem {
            item: Some(ItemId::new("s2")),
            locator: None,
        },
    ];

    let state = fixture
        .engine
        .start_batch(request("a1", batch, 2))
        .await
        .done()
        .await;

    // The duplicate is dropped; the rest are counted.
    pretty_assert_eq!(state.total, 4);
    pretty_assert_eq!(state.attempted, 4);
    pretty_assert_eq!(state.succeeded, 1);
    pretty_assert_eq!(
        state.failures,
        vec![
            ItemFailure {
                item: None,
                reason: String::from(MISSING_ITEM_ID),
            },
            ItemFailure {
                item: None,
                reason: String::from(MISSING_ITEM_ID),
            },
            ItemFailure {
                item: Some(ItemId::new("s2")),
                reason: String::from(NO_SOURCE_LOCATOR),
            },
        ]
    );
    pretty_assert_eq!(fixture.transfer.calls_for("loc-s1"), 1);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-duplicate"), 0);
    pretty_assert_eq!(fixture.transfer.calls_for("loc-anonymous"), 0);
}

#[tokio::test]
async fn cached_item_without_locator_succeeds() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    let batch = vec![BatchItem {
        item: Some(ItemId::new("s1")),
        locator: None,
    }];
    let state = fixture.engine.start_batch(request("a1", batch, 1)).await.done().await;
    pretty_assert_eq!(state.succeeded, 1);
    pretty_assert_eq!(state.failures, Vec::new());
}

#[tokio::test]
async fn lookup_falls_back_to_locator() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    let owner = OwnerId::new("a1");
    let renamed = ItemId::new("renamed");
    pretty_assert_eq!(fixture.engine.lookup(None, &owner, &renamed).await, None);

    let entry = fixture
        .engine
        .lookup(Some(&Locator::new("loc-s1")), &owner, &renamed)
        .await
        .unwrap();
    pretty_assert_eq!(entry.key, CacheKey::new("a1", "s1"));
}

#[tokio::test]
async fn locator_lookup_never_crosses_owners() {
    let fixture = Fixture::new(FakeTransfer::new());
    let shared = Locator::new("loc-shared");
    fixture
        .store
        .put(&CacheKey::new("a1", "x"), Some(&shared), b"%PDF x", "Assignment a1")
        .await
        .unwrap();
    fixture
        .store
        .put(&CacheKey::new("a2", "y"), Some(&shared), b"%PDF x", "Assignment a2")
        .await
        .unwrap();

    let owner = OwnerId::new("a1");
    pretty_assert_eq!(fixture.engine.delete_owner(&owner).await.unwrap(), 1);
    pretty_assert_eq!(
        fixture
            .engine
            .lookup(Some(&shared), &owner, &ItemId::new("x"))
            .await,
        None
    );
    pretty_assert_eq!(
        fixture
            .engine
            .lookup(Some(&shared), &owner, &ItemId::new("other"))
            .await,
        None
    );

    let entry = fixture
        .engine
        .lookup(Some(&shared), &OwnerId::new("a2"), &ItemId::new("renamed"))
        .await
        .unwrap();
    pretty_assert_eq!(entry.key, CacheKey::new("a2", "y"));
}

#[tokio::test]
async fn delete_owner_removes_entries() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 2), 2))
        .await
        .done()
        .await;
    fixture
        .engine
        .start_batch(request("a2", items("s", 1), 1))
        .await
        .done()
        .await;

    pretty_assert_eq!(fixture.engine.delete_owner(&OwnerId::new("a1")).await.unwrap(), 2);
    pretty_assert_eq!(
        fixture
            .engine
            .lookup(None, &OwnerId::new("a1"), &ItemId::new("s1"))
            .await,
        None
    );
    pretty_assert_eq!(fixture.engine.list_by_owner(&OwnerId::new("a1")).await.unwrap(), Vec::new());

    let owners = fixture.engine.owners().await.unwrap();
    pretty_assert_eq!(owners.len(), 1);
    pretty_assert_eq!(owners[0].owner, OwnerId::new("a2"));

    pretty_assert_eq!(fixture.engine.delete_all().await.unwrap(), 1);
    pretty_assert_eq!(fixture.engine.total_size().await.unwrap().count, 0);
}

#[tokio::test(start_paused = true)]
async fn progress_reports_latest_batch() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());

    let handle = fixture.engine.start_batch(request("a1", items("s", 2), 2)).await;
    let mut progress = fixture.engine.progress(&OwnerId::new("a1")).unwrap();
    pretty_assert_eq!(progress.snapshot().generation, handle.generation);

    transfer.release(1);
    wait_until(&mut progress, |state| state.attempted == 1).await;
    transfer.release(1);
    let state = handle.done().await;
    pretty_assert_eq!(state.succeeded, 2);
    assert!(fixture.engine.progress(&OwnerId::new("unknown")).is_none());
}
