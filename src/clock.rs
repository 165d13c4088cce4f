//! Presentation timestamp clock
//!
//! A single monotonic timebase shared by the audio and video paths so that
//! frames stamped by the engine (rather than by the caller) stay in sync.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic clock for presentation timestamps
#[derive(Debug, Clone)]
pub struct PtsClock {
    start: Arc<Instant>,
}

impl PtsClock {
    /// Create a new clock with the current instant as time zero
    pub fn new() -> Self {
        Self { start: Arc::new(Instant::now()) }
    }

    /// Create a clock from an existing start instant
    ///
    /// Use this to share the same timebase between pipeline stages.
    pub fn from_instant(start: Instant) -> Self {
        Self { start: Arc::new(start) }
    }

    /// Elapsed seconds since the clock's time zero
    #[inline]
    pub fn pts(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Timestamp for a given instant, which must not precede time zero
    #[inline]
    pub fn pts_at(&self, instant: Instant) -> f64 {
        instant.duration_since(*self.start).as_secs_f64()
    }

    /// The start instant, for sharing with other components
    pub fn start_instant(&self) -> Instant {
        *self.start
    }
}

impl Default for PtsClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pts_monotonic() {
        let clock = PtsClock::new();
        let a = clock.pts();
        thread::sleep(Duration::from_millis(10));
        let b = clock.pts();
        assert!(b > a);
    }

    #[test]
    fn test_shared_timebase() {
        let a = PtsClock::new();
        let b = PtsClock::from_instant(a.start_instant());
        thread::sleep(Duration::from_millis(5));
        assert!((a.pts() - b.pts()).abs() < 0.001);
    }
}
