//! Progress bar rendering for interactive and CI environments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Debug, Display};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};

use super::{ProgressState, ProgressWatch};

/// How often plain progress lines are printed when not attached to a terminal.
const PLAIN_INTERVAL: Duration = Duration::from_secs(5);

/// A progress bar that follows a batch.
///
/// - In interactive terminals, displays a normal progress bar.
/// - In non-interactive environments emits log lines every 5 seconds.
#[derive(Clone, Debug, Display)]
#[display("{}", self.inner)]
#[debug("{}", self.inner)]
pub struct TransferBar {
    inner: Arc<TransferBarInner>,
}

impl TransferBar {
    /// Create a bar for a batch of `items` items.
    pub fn new(items: u64, operation: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TransferBarInner::new(items, operation)),
        }
    }

    /// Render the batch's state.
    pub fn update(&self, state: &ProgressState) {
        self.inner.update(state);
    }

    /// Follow a batch until it is no longer in flight, then finish the bar.
    ///
    /// Returns the final state.
    pub async fn follow(self, mut progress: ProgressWatch) -> ProgressState {
        let interactive = is_interactive();
        let mut ticker = tokio::time::interval(PLAIN_INTERVAL);
        loop {
            let state = progress.snapshot();
            self.update(&state);
            if !state.in_flight {
                self.inner.finish(&state);
                return state;
            }

            tokio::select! {
                alive = progress.changed() => {
                    if !alive {
                        let state = progress.snapshot();
                        self.inner.finish(&state);
                        return state;
                    }
                }
                _ = ticker.tick(), if !interactive => {
                    println!("{}", self.inner.render_plain());
                }
            }
        }
    }
}

struct TransferBarInner {
    progress: ProgressBar,
    start: Instant,
    operation: String,
}

impl TransferBarInner {
    fn new(items: u64, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let progress = if is_interactive() {
            ProgressBar::new(items)
        } else {
            ProgressBar::hidden()
        };
        progress.set_length(items);
        let template = "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            progress.set_style(style.progress_chars("=> "));
        }
        progress.set_message(operation.clone());

        Self {
            progress,
            start: Instant::now(),
            operation,
        }
    }

    fn message(&self, state: &ProgressState) -> String {
        format!(
            "{} ({} cached, {} failed, {} cancelled)",
            self.operation,
            state.succeeded,
            state.failures.len(),
            state.cancelled,
        )
    }

    fn update(&self, state: &ProgressState) {
        self.progress.set_length(state.total);
        self.progress.set_position(state.attempted);
        self.progress.set_message(self.message(state));
    }

    fn finish(&self, state: &ProgressState) {
        let message = self.message(state);
        if is_interactive() {
            self.progress.finish_with_message(message);
        } else {
            self.progress.set_message(message);
            println!("{}", self.render_plain());
        }
    }

    fn render_plain(&self) -> String {
        let elapsed = HumanDuration(self.start.elapsed());
        let pos = self.progress.position();
        let len = self.progress.length().unwrap_or(0);
        let msg = self.progress.message();
        format!("[{elapsed}] [{pos}/{len}] {msg}")
    }
}

impl std::fmt::Display for TransferBarInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let elapsed = self.start.elapsed();
        let pos = self.progress.position();
        let len = self.progress.length().unwrap_or(0);
        let msg = self.progress.message();
        write!(f, "[{elapsed:?}] [{pos}/{len}] {msg}")
    }
}

/// Detects if running in an interactive terminal environment.
fn is_interactive() -> bool {
    console::Term::stderr().is_term()
}

/// Formats a byte count as a string like "10 MB".
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::DECIMAL)
}
