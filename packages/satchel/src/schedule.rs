//! Bounded-concurrency execution of a batch's downloads.

use std::sync::Arc;

use clients::Token;
use derive_more::Debug;
use tokio::task::JoinSet;
use tracing::{debug, instrument, trace, warn};

use crate::fetch::{FetchOutcome, Fetcher, Transfer};
use crate::generation::{Generation, GenerationTracker};
use crate::key::{CacheKey, Locator};
use crate::progress::ProgressReporter;
use crate::store::CacheStore;

/// The concurrency used when a batch asks for "unbounded".
pub const UNBOUNDED_CEILING: usize = 20;

/// Resolve a requested concurrency to the number of fetches allowed at once.
pub fn effective_limit(concurrency: usize) -> usize {
    if concurrency == 0 {
        UNBOUNDED_CEILING
    } else {
        concurrency
    }
}

/// One document to download and store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    pub key: CacheKey,
    pub locator: Locator,
}

/// The downloads of one batch, ready to run.
#[derive(Debug)]
pub struct ScheduledBatch {
    pub generation: Generation,
    pub owner_label: String,
    pub auth: Token,
    pub tasks: Vec<DownloadTask>,
    /// Maximum concurrent fetches; see [`effective_limit`].
    pub concurrency: usize,
}

/// Runs batches of downloads with bounded concurrency.
#[derive(Clone, Debug)]
pub struct Scheduler<T> {
    fetcher: Fetcher<T>,
    store: CacheStore,
    generations: GenerationTracker,
}

impl<T: Transfer> Scheduler<T> {
    pub fn new(fetcher: Fetcher<T>, store: CacheStore, generations: GenerationTracker) -> Self {
        Self {
            fetcher,
            store,
            generations,
        }
    }

    /// Run every task in the batch to a terminal outcome, then finish the
    /// batch's progress.
    ///
    /// Outcomes recorded before this is called (already cached or invalid
    /// items) are left as they are.
    #[instrument(
        name = "Scheduler::run",
        skip(self, batch, reporter),
        fields(generation = %batch.generation, tasks = batch.tasks.len())
    )]
    pub async fn run(&self, batch: ScheduledBatch, reporter: ProgressReporter) {
        let ScheduledBatch {
            generation,
            owner_label,
            auth,
            tasks,
            concurrency,
        } = batch;
        let reporter = Arc::new(reporter);
        let worker_count = effective_limit(concurrency).min(tasks.len());
        debug!(worker_count, "starting download workers");

        let (tx, rx) = flume::bounded::<DownloadTask>(0);
        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let worker = Worker {
                fetcher: self.fetcher.clone(),
                store: self.store.clone(),
                generations: self.generations.clone(),
                reporter: reporter.clone(),
                generation,
                owner_label: owner_label.clone(),
                auth: auth.clone(),
            };
            let rx = rx.clone();
            workers.spawn(async move {
                while let Ok(task) = rx.recv_async().await {
                    worker.process(task).await;
                }
            });
        }
        drop(rx);

        for task in tasks {
            trace!(key = %task.key, "sending task to download workers");
            if let Err(error) = tx.send_async(task).await {
                warn!(key = %error.0.key, "no download workers are alive");
                break;
            }
        }
        drop(tx);

        while let Some(worker) = workers.join_next().await {
            if let Err(error) = worker {
                warn!(?error, "download worker stopped unexpectedly");
            }
        }

        // Workers that stopped early leave tasks without an outcome.
        let state = reporter.snapshot();
        for _ in state.attempted..state.total {
            reporter.record_failure(None, "download worker stopped unexpectedly");
        }
        reporter.finish();
    }
}

struct Worker<T> {
    fetcher: Fetcher<T>,
    store: CacheStore,
    generations: GenerationTracker,
    reporter: Arc<ProgressReporter>,
    generation: Generation,
    owner_label: String,
    auth: Token,
}

impl<T: Transfer> Worker<T> {
    async fn process(&self, task: DownloadTask) {
        let DownloadTask { key, locator } = task;
        let bytes = match self.fetcher.fetch(&locator, &self.auth, self.generation).await {
            FetchOutcome::Fetched(bytes) => bytes,
            FetchOutcome::Failed { error, attempts } => {
                warn!(%key, %locator, attempts, %error, "download failed");
                self.reporter.record_failure(Some(key.item), error.to_string());
                return;
            }
            FetchOutcome::Cancelled => {
                self.reporter.record_cancelled();
                return;
            }
        };

        let Some(_guard) = self.generations.commit_guard(self.generation).await else {
            debug!(%key, "discarding download for superseded generation");
            self.reporter.record_cancelled();
            return;
        };
        match self
            .store
            .put(&key, Some(&locator), &bytes, &self.owner_label)
            .await
        {
            Ok(()) => {
                trace!(%key, bytes = bytes.len(), "stored download");
                self.reporter.record_success();
            }
            Err(error) => {
                warn!(%key, %error, "failed to store download");
                self.reporter.record_failure(Some(key.item), error.to_string());
            }
        }
    }
}
