// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// A deadline measured on the monotonic clock.
///
/// `Instant::now()` boils down to `clock_gettime(CLOCK_MONOTONIC)`, which is async-signal-safe,
/// so a `TimeoutManager` can be created and polled from inside a signal handler.
#[derive(Clone, Copy)]
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }

    /// Starts a new deadline that expires after `limit`, or together with this one if that is
    /// sooner.
    pub fn bounded(&self, limit: Duration) -> TimeoutManager {
        TimeoutManager::new(self.remaining().min(limit))
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("start_time", &self.start_time)
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_manager_new() {
        let timeout = Duration::from_secs(5);
        let manager = TimeoutManager::new(timeout);

        assert_eq!(manager.timeout(), timeout);
        assert!(manager.elapsed() < Duration::from_secs(1));
        assert!(manager.remaining() > Duration::from_secs(4));
        assert!(!manager.expired());
    }

    #[test]
    fn test_timeout_manager_expires() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));

        assert!(manager.expired());
        assert_eq!(manager.remaining(), Duration::ZERO);
        assert!(manager.elapsed() > manager.timeout());
    }

    #[test]
    fn test_zero_timeout_is_expired_immediately() {
        let manager = TimeoutManager::new(Duration::ZERO);
        assert!(manager.expired());
        assert_eq!(manager.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_bounded_never_outlives_parent() {
        let parent = TimeoutManager::new(Duration::from_millis(50));
        let child = parent.bounded(Duration::from_secs(10));
        assert!(child.timeout() <= Duration::from_millis(50));

        let short = parent.bounded(Duration::from_millis(1));
        assert!(short.timeout() <= Duration::from_millis(1));
    }

    #[test]
    fn test_timeout_manager_debug() {
        let manager = TimeoutManager::new(Duration::from_secs(1));
        let debug_str = format!("{manager:?}");

        assert!(debug_str.contains("TimeoutManager"));
        assert!(debug_str.contains("elapsed"));
        assert!(debug_str.contains("remaining"));
    }
}
