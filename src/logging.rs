//! Tracing setup for the command line tool, plus a throttle for progress
//! events emitted from worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LogSettings;

/// Filter used when `RUST_LOG` is unset: labvault at the configured level,
/// everything else at warnings.
fn default_filter(settings: &LogSettings) -> EnvFilter {
    let level = if settings.verbose { "debug" } else { "info" };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(format!("labvault={level}"))
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured verbosity.
///
/// JSON output closes every span with its timing, so a preprocessing run
/// reports how long each stage took.
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(settings));
    let registry = tracing_subscriber::registry().with(filter);

    if settings.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry.with(fmt::layer().compact().with_target(false)).init();
    }
}

/// Rate limiter for progress events shared between workers.
pub struct LogThrottle {
    interval_ms: u64,
    start: Instant,
    /// Milliseconds after `start` before which events are dropped.
    next_due_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            start: Instant::now(),
            next_due_ms: AtomicU64::new(0),
        }
    }

    /// True when the interval has passed since the last accepted call.
    /// Of several threads racing for the same slot only one wins.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let due = self.next_due_ms.load(Ordering::Relaxed);
        now_ms >= due
            && self
                .next_due_ms
                .compare_exchange(
                    due,
                    now_ms.saturating_add(self.interval_ms),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }
}
