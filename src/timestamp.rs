//! A monotonic timestamp, expressed in whole microseconds.
//!
//! Unlike the source this crate is modeled on, `Timestamp` is pinned to the
//! process's monotonic clock rather than wall-clock time: the timer queue
//! arms a `CLOCK_MONOTONIC` timerfd, and if `Timestamp::now` used wall-clock
//! time the two could drift apart under NTP adjustment. Pinning both to the
//! same clock keeps `now() - timer.when()` meaningful.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

pub const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    pub const fn invalid() -> Timestamp {
        Timestamp {
            micros_since_epoch: 0,
        }
    }

    pub fn now() -> Timestamp {
        let elapsed = Instant::now().duration_since(epoch());
        Timestamp {
            micros_since_epoch: elapsed.as_micros() as i64,
        }
    }

    pub fn from_micros(micros_since_epoch: i64) -> Timestamp {
        Timestamp {
            micros_since_epoch,
        }
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }

    pub fn valid(&self) -> bool {
        self.micros_since_epoch > 0
    }

    pub fn add_seconds(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROSECONDS_PER_SECOND as f64) as i64;
        Timestamp {
            micros_since_epoch: self.micros_since_epoch + delta,
        }
    }

    pub fn add_micros(&self, micros: i64) -> Timestamp {
        Timestamp {
            micros_since_epoch: self.micros_since_epoch + micros,
        }
    }

    /// Seconds between `self` and `earlier`, positive if `self` is later.
    pub fn diff_seconds(&self, earlier: Timestamp) -> f64 {
        (self.micros_since_epoch - earlier.micros_since_epoch) as f64
            / MICROSECONDS_PER_SECOND as f64
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros_since_epoch / MICROSECONDS_PER_SECOND,
            self.micros_since_epoch % MICROSECONDS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn monotonic_and_ordered() {
        let t1 = Timestamp::now();
        thread::sleep(Duration::from_millis(5));
        let t2 = Timestamp::now();
        assert!(t2 > t1);
        assert!(t2.diff_seconds(t1) > 0.0);
    }

    #[test]
    fn add_seconds_roundtrip() {
        let t1 = Timestamp::now();
        let t2 = t1.add_seconds(1.5);
        assert_eq!(t2.micros_since_epoch() - t1.micros_since_epoch(), 1_500_000);
    }

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::invalid().valid());
        assert!(Timestamp::now().valid());
    }
}
