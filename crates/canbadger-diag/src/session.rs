use std::time::{Duration, Instant};

/// Cooperative replacement for the firmware's TesterPresent hardware ticker.
///
/// The owner's event loop calls its client's `tick()` often; the ticker just
/// tracks whether a keep-alive is currently owed. It is detached while a
/// foreground request/response is in flight so the two can never interleave
/// on the bus.
#[derive(Clone, Copy, Debug)]
pub struct TesterPresent {
    period: Duration,
    due_at: Option<Instant>,
}

impl TesterPresent {
    pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

    #[must_use]
    pub fn new() -> Self {
        Self {
            period: Self::DEFAULT_PERIOD,
            due_at: None,
        }
    }

    #[must_use]
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            due_at: None,
        }
    }

    /// Start (or restart) the periodic schedule
    pub fn attach(&mut self) {
        self.due_at = Some(Instant::now() + self.period);
    }

    pub fn detach(&mut self) {
        self.due_at = None;
    }

    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.due_at.is_some()
    }

    /// True when a keep-alive is owed; the caller sends it and calls [TesterPresent::attach]
    #[must_use]
    pub fn is_due(&self) -> bool {
        match self.due_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

impl Default for TesterPresent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_is_never_due() {
        let ticker = TesterPresent::new();
        assert!(!ticker.is_attached());
        assert!(!ticker.is_due());
    }

    #[test]
    fn test_due_after_period() {
        let mut ticker = TesterPresent::with_period(Duration::from_millis(1));
        ticker.attach();
        assert!(!ticker.is_due());
        std::thread::sleep(Duration::from_millis(5));
        assert!(ticker.is_due());
        ticker.detach();
        assert!(!ticker.is_due());
    }
}
