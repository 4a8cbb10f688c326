//! Device clock tracking
//!
//! The node keeps a monotonic millisecond counter. The scheduler mirrors it
//! with a [`DeviceClock`] anchored to a local [`Instant`]; a fresh reading
//! from the connector replaces the whole value (on connect and on explicit
//! sync), never a partial merge.

use std::time::Instant;

/// Local mirror of the node's millisecond counter
#[derive(Debug, Clone)]
pub struct DeviceClock {
    millis_at_anchor: u64,
    anchor: Instant,
}

impl DeviceClock {
    /// Anchor a fresh reading taken just now
    pub fn new(millis: u64) -> Self {
        Self {
            millis_at_anchor: millis,
            anchor: Instant::now(),
        }
    }

    /// A clock that started at zero just now
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// Estimated current value of the node's counter
    pub fn millis(&self) -> u64 {
        self.millis_at_anchor + self.anchor.elapsed().as_millis() as u64
    }

    /// The raw reading this clock was anchored with
    pub fn anchored_millis(&self) -> u64 {
        self.millis_at_anchor
    }
}

impl Default for DeviceClock {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn clock_advances_from_anchor() {
        let clock = DeviceClock::new(1_000);
        assert!(clock.millis() >= 1_000);
        thread::sleep(Duration::from_millis(15));
        assert!(clock.millis() >= 1_010);
    }

    #[test]
    fn replacement_is_wholesale() {
        let mut clock = DeviceClock::new(5_000);
        clock = DeviceClock::new(10);
        assert!(clock.millis() < 5_000);
        assert_eq!(clock.anchored_millis(), 10);
    }
}
