use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter for progress logging; at most one `ready()` per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// Default kernel-progress throttle of one update per 100 ms.
    pub fn for_progress() -> Self {
        Self::new(Duration::from_millis(100))
    }

    /// Returns true when enough time has passed since the last accepted
    /// call, and marks this call as accepted.
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().expect("throttle lock");
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_passes() {
        let t = Throttle::new(Duration::from_millis(50));
        assert!(t.ready());
        assert!(!t.ready());
    }

    #[test]
    fn test_passes_again_after_interval() {
        let t = Throttle::new(Duration::from_millis(5));
        assert!(t.ready());
        std::thread::sleep(Duration::from_millis(10));
        assert!(t.ready());
    }
}
