use std::time::Duration;

use pretty_assertions::assert_eq as pretty_assert_eq;
use satchel::wait::WaitError;
use satchel::{CacheKey, Config, Locator};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{FakeTransfer, Fixture, document, items, request, status};

#[tokio::test(start_paused = true)]
async fn cached_entry_returns_immediately() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    let entry = fixture
        .engine
        .wait_for(None, &CacheKey::new("a1", "s1"), &CancellationToken::new())
        .await
        .unwrap();
    pretty_assert_eq!(entry.blob, document("loc-s1"));
}

#[tokio::test(start_paused = true)]
async fn no_batch_fails_fast() {
    let fixture = Fixture::new(FakeTransfer::new());

    let started = Instant::now();
    let key = CacheKey::new("a1", "s1");
    let err = fixture
        .engine
        .wait_for(None, &key, &CancellationToken::new())
        .await
        .unwrap_err();

    pretty_assert_eq!(err, WaitError::NeverProduced { key });
    pretty_assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn finished_batch_without_entry_fails_fast() {
    let fixture = Fixture::new(FakeTransfer::new());
    fixture
        .engine
        .start_batch(request("a1", items("s", 1), 1))
        .await
        .done()
        .await;

    let started = Instant::now();
    let key = CacheKey::new("a1", "other");
    let err = fixture
        .engine
        .wait_for(None, &key, &CancellationToken::new())
        .await
        .unwrap_err();
    pretty_assert_eq!(err, WaitError::NeverProduced { key });
    pretty_assert_eq!(started.elapsed(), Duration::ZERO);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn entry_produced_while_waiting() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());
    let handle = fixture.engine.start_batch(request("a1", items("s", 3), 1)).await;

    let waiting = tokio::spawn({
        let engine = fixture.engine.clone();
        async move {
            let locator = Locator::new("loc-s3");
            engine
                .wait_for(Some(&locator), &CacheKey::new("a1", "s3"), &CancellationToken::new())
                .await
        }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiting.is_finished());

    transfer.release(3);
    let entry = waiting.await.unwrap().unwrap();
    pretty_assert_eq!(entry.blob, document("loc-s3"));
    pretty_assert_eq!(handle.done().await.succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn batch_ending_without_entry_is_never_produced() {
    let transfer = FakeTransfer::new().gated();
    transfer.script("loc-s1", [status(404)]);
    let fixture = Fixture::new(transfer.clone());
    fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;

    let waiting = tokio::spawn({
        let engine = fixture.engine.clone();
        async move {
            engine
                .wait_for(None, &CacheKey::new("a1", "s1"), &CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    transfer.release(1);

    let err = waiting.await.unwrap().unwrap_err();
    pretty_assert_eq!(
        err,
        WaitError::NeverProduced {
            key: CacheKey::new("a1", "s1"),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn wait_times_out() {
    let transfer = FakeTransfer::new().gated();
    let config = Config::builder().wait_timeout(Duration::from_secs(5)).build();
    let fixture = Fixture::with_config(transfer, config);
    fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;

    let started = Instant::now();
    let key = CacheKey::new("a1", "s1");
    let err = fixture
        .engine
        .wait_for(None, &key, &CancellationToken::new())
        .await
        .unwrap_err();

    pretty_assert_eq!(
        err,
        WaitError::TimedOut {
            key,
            timeout: Duration::from_secs(5),
        }
    );
    pretty_assert_eq!(started.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn caller_cancels_wait() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer);
    fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;

    let cancel = CancellationToken::new();
    let waiting = tokio::spawn({
        let engine = fixture.engine.clone();
        let cancel = cancel.clone();
        async move {
            engine
                .wait_for(None, &CacheKey::new("a1", "s1"), &cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    pretty_assert_eq!(
        err,
        WaitError::Cancelled {
            key: CacheKey::new("a1", "s1"),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn superseded_batch_ends_wait() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer);
    fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;

    let waiting = tokio::spawn({
        let engine = fixture.engine.clone();
        async move {
            engine
                .wait_for(None, &CacheKey::new("a1", "s1"), &CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture.engine.cancel_running().await;

    let err = waiting.await.unwrap().unwrap_err();
    pretty_assert_eq!(
        err,
        WaitError::NeverProduced {
            key: CacheKey::new("a1", "s1"),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn newer_batch_for_owner_takes_over_wait() {
    let transfer = FakeTransfer::new().gated();
    let fixture = Fixture::new(transfer.clone());
    let first = fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;

    let waiting = tokio::spawn({
        let engine = fixture.engine.clone();
        async move {
            engine
                .wait_for(None, &CacheKey::new("a1", "s1"), &CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let second = fixture.engine.start_batch(request("a1", items("s", 1), 1)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiting.is_finished());

    transfer.release(2);
    let entry = waiting.await.unwrap().unwrap();
    pretty_assert_eq!(entry.blob, document("loc-s1"));
    pretty_assert_eq!(first.done().await.cancelled, 1);
    pretty_assert_eq!(second.done().await.succeeded, 1);
}
