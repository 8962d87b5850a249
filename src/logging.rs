//! Logging and tracing initialization.
//!
//! Structured logging through `tracing`, written to stderr so stdout stays
//! free for command output. Pretty console output or JSON for machine parsing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber. Call once, after config is loaded.
///
/// `RUST_LOG` overrides the level chosen from `verbose`, e.g.
/// `RUST_LOG=facade_bridge::rpc=trace`.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "facade_bridge={}",
            default_level.as_str().to_lowercase()
        ))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Rate limiter for log messages that can repeat in a tight loop, such as
/// accept failures when the process runs out of file descriptors.
pub struct LogThrottle {
    interval: Duration,
    // Milliseconds since `epoch` of the last permitted log, or NEVER_LOGGED.
    last: AtomicU64,
    epoch: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: AtomicU64::new(NEVER_LOGGED),
            epoch: Instant::now(),
        }
    }

    /// True when the caller may log now. Concurrent callers racing for the
    /// same slot get exactly one `true`.
    pub fn should_log(&self) -> bool {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX - 1);
        let last = self.last.load(Ordering::Relaxed);
        let interval = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);

        if last != NEVER_LOGGED && now.saturating_sub(last) < interval {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}
