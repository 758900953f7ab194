use std::time::Duration;

use tokio::time::Instant;

/// Fixed-rate sub-task timer checked once per loop tick.
///
/// A fresh timer is due immediately.
#[derive(Debug, Clone)]
pub struct Periodic {
    every: Duration,
    last: Option<Instant>,
}

impl Periodic {
    pub fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    /// Returns `true` and records `now` as the last fire time if the
    /// interval has elapsed.
    pub fn due(&mut self, now: Instant) -> bool {
        let ready = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.every,
        };
        if ready {
            self.last = Some(now);
        }
        ready
    }

    /// Forget the last fire time so the next check fires.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_immediately_then_on_interval() {
        let start = Instant::now();
        let mut p = Periodic::new(Duration::from_secs(5));

        assert!(p.due(start));
        assert!(!p.due(start));
        assert!(!p.due(start + Duration::from_millis(4999)));
        assert!(p.due(start + Duration::from_secs(5)));
        assert!(!p.due(start + Duration::from_secs(9)));
        assert!(p.due(start + Duration::from_secs(10)));
    }

    #[test]
    fn late_check_fires_once_and_rebases() {
        let start = Instant::now();
        let mut p = Periodic::new(Duration::from_secs(5));
        p.due(start);

        assert!(p.due(start + Duration::from_secs(17)));
        assert!(!p.due(start + Duration::from_secs(20)));
        assert!(p.due(start + Duration::from_secs(22)));
    }

    #[test]
    fn reset_makes_it_due() {
        let start = Instant::now();
        let mut p = Periodic::new(Duration::from_secs(60));
        p.due(start);
        p.reset();
        assert!(p.due(start + Duration::from_secs(1)));
    }
}
