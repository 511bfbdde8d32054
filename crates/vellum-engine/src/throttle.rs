use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-event-type rate limit for one script instance
///
/// An event type that ran less than `min_interval` ago is refused; events
/// are never buffered per type.
#[derive(Debug, Clone)]
pub struct EventThrottle {
    min_interval: Duration,
    last_run: HashMap<String, Instant>,
}

impl EventThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: HashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_min_interval(&mut self, min_interval: Duration) {
        self.min_interval = min_interval;
    }

    /// Record a run of `event` at `now` unless it ran inside the window
    pub fn try_admit(&mut self, event: &str, now: Instant) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }

        match self.last_run.get_mut(event) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_run.insert(event.to_string(), now);
                true
            }
        }
    }

    /// Forget every recorded run; the interval itself is kept
    pub fn clear(&mut self) {
        self.last_run.clear();
    }

    /// Number of event types with a recorded run
    pub fn tracked_count(&self) -> usize {
        self.last_run.len()
    }
}

impl Default for EventThrottle {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_zero_interval_admits_everything() {
        let mut throttle = EventThrottle::default();
        let now = Instant::now();
        assert!(throttle.try_admit("timer", now));
        assert!(throttle.try_admit("timer", now));
        assert_eq!(throttle.tracked_count(), 0);
    }

    #[test]
    fn test_second_event_inside_window_is_refused() {
        let mut throttle = EventThrottle::new(Duration::from_millis(50));
        let now = Instant::now();

        assert!(throttle.try_admit("touch_start", now));
        assert!(!throttle.try_admit("touch_start", now + Duration::from_millis(10)));

        // Other event types have their own window
        assert!(throttle.try_admit("timer", now + Duration::from_millis(10)));
    }

    #[test]
    fn test_window_elapses() {
        let mut throttle = EventThrottle::new(Duration::from_millis(50));
        assert!(throttle.try_admit("touch_start", Instant::now()));

        sleep(Duration::from_millis(60));
        assert!(throttle.try_admit("touch_start", Instant::now()));
    }

    #[test]
    fn test_clear_keeps_interval() {
        let mut throttle = EventThrottle::new(Duration::from_secs(10));
        let now = Instant::now();
        assert!(throttle.try_admit("touch_start", now));

        throttle.clear();
        assert_eq!(throttle.tracked_count(), 0);
        assert_eq!(throttle.min_interval(), Duration::from_secs(10));
        assert!(throttle.try_admit("touch_start", now));
    }
}
