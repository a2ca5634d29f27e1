use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use rand::distributions::{Alphanumeric, DistString};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serializer;

/// Source of the current time. Everything that schedules or ages state reads
/// time through this, so tests can move it by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Random alphanumeric string of `len` characters.
pub fn random_alphanumeric(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Replaces each run of characters outside `[A-Za-z0-9_]` with a single `_`.
pub fn normalize_display_name(name: &str) -> String {
    static INVALID: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

    let invalid = INVALID.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new("[^A-Za-z0-9_]+").unwrap()
    });

    invalid.replace_all(name, "_").into_owned()
}

/// Truncates to at most `max` bytes without splitting a character.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `serialize_with` helper for persisted secrets. `SecretString` does not
/// serialize on its own.
pub fn serialize_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_display_name() {
        assert_eq!(normalize_display_name("token"), "token");
        assert_eq!(normalize_display_name("ldap-jane.doe"), "ldap_jane_doe");
        assert_eq!(normalize_display_name("a -- b"), "a_b");
        assert_eq!(normalize_display_name("émile"), "_mile");
        assert_eq!(normalize_display_name(""), "");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("aé", 2), "a");
    }

    #[test]
    fn test_manual_clock() {
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::seconds(5));
        assert_eq!(clock.now().timestamp(), 1_005);
    }

    #[test]
    fn test_random_alphanumeric() {
        let s = random_alphanumeric(20);
        assert_eq!(s.len(), 20);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
