//! Stream transmission-rate monitoring
//!
//! Tracks the interval between consecutive stream replies. The first two
//! intervals after start-up are distorted by initialisation, so the running
//! maximum is seeded with sentinels and only the third interval onwards is
//! compared for real:
//!
//! | reading | running maximum               |
//! |---------|-------------------------------|
//! | 1st     | [`STARTUP_SENTINEL`]          |
//! | 2nd     | [`RESET_SENTINEL`]            |
//! | later   | `max(running, interval)`      |
//!
//! Every interval except the first that exceeds [`NO_LOSS_INTERVAL`] counts
//! as an overflow packet.

use serde::Serialize;

/// Longest interval between stream replies without data loss, in seconds
pub const NO_LOSS_INTERVAL: f64 = 0.7;

/// Running maximum after the first reading
pub const STARTUP_SENTINEL: f64 = 100.0;

/// Running maximum after the second reading
pub const RESET_SENTINEL: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Discarding,
    Tracking,
}

/// Snapshot of the rate statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateStats {
    /// Running maximum interval (sentinel values until the third reading)
    pub max_interval: f64,
    /// Intervals that exceeded [`NO_LOSS_INTERVAL`]
    pub overflow_packets: u64,
    /// Readings recorded
    pub samples: u64,
}

/// Inter-packet interval tracker owned by one device session
#[derive(Debug, Clone)]
pub struct RateMonitor {
    phase: Phase,
    last_timestamp: f64,
    max_interval: f64,
    overflow_packets: u64,
    samples: u64,
}

impl RateMonitor {
    /// Create a monitor whose first interval is measured from `start`
    pub fn new(start: f64) -> Self {
        Self {
            phase: Phase::Startup,
            last_timestamp: start,
            max_interval: 0.0,
            overflow_packets: 0,
            samples: 0,
        }
    }

    /// Record a stream reply received at `now`, returning the interval
    pub fn record(&mut self, now: f64) -> f64 {
        let interval = now - self.last_timestamp;
        self.last_timestamp = now;
        self.samples += 1;

        match self.phase {
            Phase::Startup => {
                self.max_interval = STARTUP_SENTINEL;
                self.phase = Phase::Discarding;
                return interval;
            }
            Phase::Discarding => {
                self.max_interval = RESET_SENTINEL;
                self.phase = Phase::Tracking;
            }
            Phase::Tracking => {
                if interval > self.max_interval {
                    self.max_interval = interval;
                }
            }
        }

        if interval > NO_LOSS_INTERVAL {
            self.overflow_packets += 1;
        }
        interval
    }

    pub fn max_interval(&self) -> f64 {
        self.max_interval
    }

    pub fn overflow_packets(&self) -> u64 {
        self.overflow_packets
    }

    pub fn stats(&self) -> RateStats {
        RateStats {
            max_interval: self.max_interval,
            overflow_packets: self.overflow_packets,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_phase_discard() {
        let mut monitor = RateMonitor::new(0.0);

        monitor.record(1.0);
        assert_eq!(monitor.max_interval(), STARTUP_SENTINEL);
        assert_eq!(monitor.overflow_packets(), 0);

        monitor.record(2.0);
        assert_eq!(monitor.max_interval(), RESET_SENTINEL);

        monitor.record(5.0);
        assert_eq!(monitor.max_interval(), 3.0);
        assert_eq!(monitor.overflow_packets(), 2);
        assert_eq!(monitor.stats().samples, 3);
    }

    #[test]
    fn test_fast_stream_has_no_overflow() {
        let mut monitor = RateMonitor::new(0.0);
        for i in 1..=10 {
            monitor.record(i as f64 * 0.05);
        }
        assert_eq!(monitor.overflow_packets(), 0);
        assert!((monitor.max_interval() - RESET_SENTINEL).abs() < f64::EPSILON);
    }

    #[test]
    fn test_max_only_grows() {
        let mut monitor = RateMonitor::new(0.0);
        for t in [0.1, 0.2, 0.6, 0.7, 0.75] {
            monitor.record(t);
        }
        assert!((monitor.max_interval() - 0.4).abs() < 1e-9);
    }
}
