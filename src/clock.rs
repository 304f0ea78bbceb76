//! Time sources owned by a transport session
//!
//! A session needs two clocks: a monotonic tick counter for publish
//! timestamps and resend timeouts, and wall-clock seconds since the Unix
//! epoch for SAS token expiry.

use std::time::Instant;

/// Time capability injected into a session
pub trait Clock {
    /// Milliseconds elapsed on a monotonic counter
    fn now_ms(&self) -> u64;

    /// Seconds since the Unix epoch
    fn unix_time_secs(&self) -> u64;
}

/// Clock backed by [`Instant`] and the system wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn unix_time_secs(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
    }

    #[test]
    fn test_system_clock_unix_time_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock::new().unix_time_secs() > 1_577_836_800);
    }
}
