//! Batch generations: the cancellation primitive for sync work.
//!
//! Every batch runs under a [`Generation`]. Issuing a new generation
//! supersedes the previous one: work that is still running under the old
//! generation stops at its next check, and no state mutation under the old
//! generation can start after [`GenerationTracker::new_generation`] returns.

use std::future::Future;
use std::sync::Arc;

use derive_more::{Debug, Display};
use tokio::sync::{OwnedRwLockReadGuard, RwLock, watch};
use tracing::{debug, instrument};

/// An opaque, strictly increasing batch token.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("g{_0}")]
#[debug("g{_0}")]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Issues generations and answers whether a generation is still current.
///
/// Clones share the same state.
#[derive(Clone, Debug)]
pub struct GenerationTracker {
    #[debug("{}", *current.borrow())]
    current: Arc<watch::Sender<Generation>>,
    #[debug(skip)]
    fence: Arc<RwLock<()>>,
}

impl Default for GenerationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationTracker {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Generation(0));
        Self {
            current: Arc::new(current),
            fence: Arc::new(RwLock::new(())),
        }
    }

    /// The generation that is current right now.
    pub fn current(&self) -> Generation {
        *self.current.borrow()
    }

    /// Issue a new generation, superseding the current one.
    ///
    /// Waits for every outstanding [`CommitGuard`] to be dropped before
    /// advancing.
    #[instrument(name = "GenerationTracker::new_generation", skip(self))]
    pub async fn new_generation(&self) -> Generation {
        let _fence = self.fence.write().await;
        let mut issued = Generation(0);
        self.current.send_modify(|current| {
            *current = current.next();
            issued = *current;
        });
        debug!(%issued, "issued generation");
        issued
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }

    /// Take a guard under which state mutations for `generation` may happen.
    ///
    /// Returns `None` if the generation is no longer current. While the guard
    /// is held no new generation can be issued.
    pub async fn commit_guard(&self, generation: Generation) -> Option<CommitGuard> {
        let guard = self.fence.clone().read_owned().await;
        self.is_current(generation).then(|| CommitGuard {
            generation,
            _guard: guard,
        })
    }

    /// Resolves once `generation` is no longer current.
    ///
    /// The returned future does not borrow the tracker.
    pub fn superseded(&self, generation: Generation) -> impl Future<Output = ()> + Send + 'static {
        let mut current = self.current.subscribe();
        async move {
            // An error means the tracker is gone, which supersedes everything.
            let _ = current.wait_for(|current| *current != generation).await;
        }
    }
}

/// Proof that a generation was current when the guard was taken.
///
/// The generation stays current until the guard is dropped.
#[derive(Debug)]
pub struct CommitGuard {
    generation: Generation,
    #[debug(skip)]
    _guard: OwnedRwLockReadGuard<()>,
}

impl CommitGuard {
    pub fn generation(&self) -> Generation {
        self.generation
    }
}
