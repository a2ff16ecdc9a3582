//! Millisecond clock used for segment creation times and roll-by-age decisions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A millisecond time source.
pub trait Time: Send + Sync {
    /// Current time in milliseconds.
    fn milliseconds(&self) -> i64;
}

/// Monotonic clock reading in Unix-epoch milliseconds.
///
/// The wall clock is sampled once at construction; later readings add the elapsed
/// [`Instant`] time, so they never go backwards when the system clock is stepped and stay
/// comparable with record timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SystemTime {
    origin: Instant,
    origin_ms: i64,
}

impl SystemTime {
    /// A clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        let origin_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            origin_ms,
        }
    }
}

impl Default for SystemTime {
    fn default() -> Self {
        Self::new()
    }
}

impl Time for SystemTime {
    fn milliseconds(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

/// Manually advanced clock for deterministic tests. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct MockTime {
    now: Arc<AtomicI64>,
}

impl MockTime {
    /// A clock starting at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Move the clock forward by `ms`.
    pub fn sleep(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to `ms`.
    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Time for MockTime {
    fn milliseconds(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
