//! Wall-clock sources for heartbeat timestamps.

use std::sync::Arc;

/// Milliseconds since the Unix epoch, as written into heartbeat records.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Wall clock driven by the tokio timer.
///
/// Anchored to the system time at creation and advanced by
/// `tokio::time::Instant`, so it follows `tokio::time::pause`/`advance`.
/// Clones share the anchor, which keeps sibling contexts in a test on the
/// same timeline.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: Arc<(i64, tokio::time::Instant)>,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor: Arc::new((
                chrono::Utc::now().timestamp_millis(),
                tokio::time::Instant::now(),
            )),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        let (base, start) = *self.anchor;
        base + start.elapsed().as_millis() as i64
    }
}
