use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use atomic_time::AtomicInstant;
use clap::ValueEnum;
use color_eyre::{Result, eyre::Context as _};
use tap::Pipe as _;
use tracing_error::ErrorLayer;
use tracing_flame::{FlameLayer, FlushGuard};
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _};
use tracing_tree::time::FormatTime;

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "SATCHEL_LOG";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

/// Build the subscriber for the CLI.
///
/// Logs go to stderr so they never mix with command output. When `profile`
/// is set, flamegraph data is written there too; the returned guard must be
/// flushed before exit.
pub fn make_logger(
    profile: Option<impl AsRef<Path>>,
    color: WhenColor,
) -> Result<(
    impl tracing::Subscriber + Send + Sync,
    Option<FlushGuard<BufWriter<std::fs::File>>>,
)> {
    let (flame_layer, flame_guard) = if let Some(profile) = profile {
        let profile = profile.as_ref();
        FlameLayer::with_file(profile)
            .with_context(|| format!("set up profiling to {profile:?}"))
            .map(|(layer, guard)| (Some(layer), Some(guard)))?
    } else {
        (None, None)
    };

    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with({
            let layer = tracing_tree::HierarchicalLayer::default()
                .with_writer(std::io::stderr)
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(false)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_targets(false);
            match color {
                WhenColor::Always => layer.with_ansi(true),
                WhenColor::Never => layer.with_ansi(false),
                WhenColor::Auto => layer,
            }
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_env_var(LOG_ENV)
                    .from_env_lossy(),
            )
        })
        .with(flame_layer);

    Ok((logger, flame_guard))
}

/// Prints the overall latency and latency between tracing events.
struct Uptime {
    start: Instant,
    prior: AtomicInstant,
}

impl Uptime {
    /// Get the [`Duration`] since the last time this function was called.
    ///
    /// If the function hasn't yet been called, it returns the time since the
    /// overall [`Uptime`] struct was created.
    fn elapsed_since_prior(&self) -> Duration {
        const RELAXED: Ordering = Ordering::Relaxed;
        self.prior
            .fetch_update(RELAXED, RELAXED, |_| Some(Instant::now()))
            .unwrap_or_else(|_| Instant::now())
            .pipe(|prior| prior.elapsed())
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            prior: AtomicInstant::now(),
        }
    }
}

impl FormatTime for Uptime {
    // Total runtime, padded so messages line up.
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        let seconds = self.start.elapsed().as_secs_f64();
        write!(w, "{seconds:.03}s")
    }

    // Time since the previous event rather than time in the span.
    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: std::time::Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        let elapsed = self.elapsed_since_prior().as_millis();
        write!(w, "{elapsed: >3}ms")
    }
}
