//! # Rate Limiter
//!
//! Two sliding windows, one keyed by device token and one by hashed IP.
//!
//! - Each check drops attempts that have left the window, then rejects if the remaining
//!   count already reached the limit, otherwise records the attempt
//! - Rejected attempts are not recorded, hammering does not extend the penalty
//! - Device is checked before IP, a device rejection records nothing on the IP side
//! - One mutex guards both policies, it is never held across an `.await`
//!
//! State lives for the life of the process and is not shared between instances.
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Device,
    Ip,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many attempts for {0:?}")]
    Throttled(Scope),

    #[error("Rate limiter lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy)]
pub struct SlidingWindow {
    pub limit: usize,
    pub window: Duration,
}

type Attempts = HashMap<String, VecDeque<DateTime<Utc>>>;

#[derive(Default)]
struct Windows {
    device: Attempts,
    ip: Attempts,
}

pub struct RateLimiter {
    device: SlidingWindow,
    ip: SlidingWindow,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(device: SlidingWindow, ip: SlidingWindow) -> Self {
        Self {
            device,
            ip,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn check(&self, device: &str, ip: &str, now: DateTime<Utc>) -> Result<(), RateLimitError> {
        let mut windows = self.windows.lock().map_err(|_| RateLimitError::Poisoned)?;

        if !hit(&mut windows.device, device, self.device, now) {
            return Err(RateLimitError::Throttled(Scope::Device));
        }
        if !hit(&mut windows.ip, ip, self.ip, now) {
            return Err(RateLimitError::Throttled(Scope::Ip));
        }

        Ok(())
    }

    /// Forgets keys whose attempts all left the window. Returns how many were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        let mut windows = self.windows.lock().map_err(|_| RateLimitError::Poisoned)?;

        Ok(evict(&mut windows.device, self.device, now) + evict(&mut windows.ip, self.ip, now))
    }
}

fn prune(attempts: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return;
    };

    while attempts.front().is_some_and(|at| now - *at > window) {
        attempts.pop_front();
    }
}

fn hit(attempts: &mut Attempts, key: &str, policy: SlidingWindow, now: DateTime<Utc>) -> bool {
    if key.is_empty() {
        return true;
    }

    let entry = attempts.entry(key.to_string()).or_default();
    prune(entry, policy.window, now);

    if entry.len() >= policy.limit {
        return false;
    }

    entry.push_back(now);
    true
}

fn evict(attempts: &mut Attempts, policy: SlidingWindow, now: DateTime<Utc>) -> usize {
    let before = attempts.len();

    attempts.retain(|_, entry| {
        prune(entry, policy.window, now);
        !entry.is_empty()
    });

    before - attempts.len()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::{RateLimitError, RateLimiter, Scope, SlidingWindow};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            SlidingWindow {
                limit: 5,
                window: Duration::from_secs(30),
            },
            SlidingWindow {
                limit: 40,
                window: Duration::from_secs(10),
            },
        )
    }

    #[test]
    fn test_device_limit_then_window_expiry() {
        let limiter = limiter();
        let start = at("2025-03-14T20:00:00Z");

        for i in 0..5 {
            let now = start + chrono::Duration::seconds(i);
            assert_eq!(limiter.check("device", &format!("ip-{i}"), now), Ok(()));
        }

        let sixth = start + chrono::Duration::seconds(5);
        assert_eq!(
            limiter.check("device", "ip-5", sixth),
            Err(RateLimitError::Throttled(Scope::Device))
        );

        // first attempt at t=0 leaves the window once more than 30s have passed
        let later = start + chrono::Duration::seconds(31);
        assert_eq!(limiter.check("device", "ip-6", later), Ok(()));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = limiter();
        let start = at("2025-03-14T20:00:00Z");

        for _ in 0..5 {
            limiter.check("device", "ip", start).unwrap();
        }
        for i in 1..20 {
            let now = start + chrono::Duration::seconds(i);
            assert!(limiter.check("device", "ip", now).is_err());
        }

        assert_eq!(
            limiter.check("device", "ip", start + chrono::Duration::seconds(31)),
            Ok(())
        );
    }

    #[test]
    fn test_ip_limit_across_devices() {
        let limiter = limiter();
        let now = at("2025-03-14T20:00:00Z");

        for i in 0..40 {
            assert_eq!(limiter.check(&format!("device-{i}"), "shared", now), Ok(()));
        }

        assert_eq!(
            limiter.check("device-40", "shared", now),
            Err(RateLimitError::Throttled(Scope::Ip))
        );
    }

    #[test]
    fn test_empty_keys_are_not_limited() {
        let limiter = limiter();
        let now = at("2025-03-14T20:00:00Z");

        for _ in 0..100 {
            assert_eq!(limiter.check("", "", now), Ok(()));
        }
    }

    #[test]
    fn test_sweep_evicts_idle_keys() {
        let limiter = limiter();
        let now = at("2025-03-14T20:00:00Z");

        limiter.check("device", "ip", now).unwrap();
        assert_eq!(limiter.sweep(now).unwrap(), 0);

        // ip window is 10s, device window 30s
        assert_eq!(limiter.sweep(now + chrono::Duration::seconds(11)).unwrap(), 1);
        assert_eq!(limiter.sweep(now + chrono::Duration::seconds(31)).unwrap(), 1);
    }
}
