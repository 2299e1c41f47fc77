use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Records the most recent use of a managed process.
///
/// The timestamp lives in an atomic so that request traffic can record
/// activity at high frequency without contending on the supervisor's
/// start/stop lock. `fetch_max` keeps the value monotonically non-decreasing
/// even under concurrent writers.
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    last_activity_ms: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Marks the process as used right now.
    pub fn record(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ActivityTracker;

    #[test]
    fn idle_time_grows_without_activity() {
        let tracker = ActivityTracker::new();
        tracker.record();
        std::thread::sleep(Duration::from_millis(30));
        assert!(
            tracker.idle_for() >= Duration::from_millis(20),
            "expected idle time to grow, got {:?}",
            tracker.idle_for()
        );
    }

    #[test]
    fn recording_resets_idle_time() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(30));
        tracker.record();
        assert!(
            tracker.idle_for() < Duration::from_millis(20),
            "expected idle time to reset, got {:?}",
            tracker.idle_for()
        );
    }

    #[test]
    fn concurrent_recording_never_moves_backwards() {
        let tracker = std::sync::Arc::new(ActivityTracker::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let tracker = std::sync::Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    tracker.record();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("recorder thread panicked");
        }
        assert!(
            tracker.idle_for() < Duration::from_millis(100),
            "expected recent activity, got {:?}",
            tracker.idle_for()
        );
    }
}
