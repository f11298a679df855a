// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::env;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Rate-limits queue signals so that a hot replica does not spam its store
/// queues on every applied batch.
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Throttle {
        Throttle {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_process(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Reads a boolean environment toggle, treating unset or unparseable values
/// as `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" => true,
            "0" | "false" | "f" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Clips a string to at most `max_chars` characters for diagnostics.
pub fn clip_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle() {
        let throttle = Throttle::new(Duration::from_secs(3600));
        let now = Instant::now();
        assert!(throttle.should_process(now));
        assert!(!throttle.should_process(now));
        assert!(!throttle.should_process(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_throttle_zero_interval() {
        let throttle = Throttle::new(Duration::from_secs(0));
        let now = Instant::now();
        assert!(throttle.should_process(now));
        assert!(throttle.should_process(now));
    }

    #[test]
    fn test_env_bool() {
        assert!(env_bool("RANGESTORE_TEST_UNSET_VAR", true));
        assert!(!env_bool("RANGESTORE_TEST_UNSET_VAR", false));
        env::set_var("RANGESTORE_TEST_SET_VAR", "false");
        assert!(!env_bool("RANGESTORE_TEST_SET_VAR", true));
        env::set_var("RANGESTORE_TEST_SET_VAR", "1");
        assert!(env_bool("RANGESTORE_TEST_SET_VAR", false));
        env::remove_var("RANGESTORE_TEST_SET_VAR");
    }

    #[test]
    fn test_clip_chars() {
        assert_eq!(clip_chars("abcdef", 3), "abc");
        assert_eq!(clip_chars("ab", 3), "ab");
        assert_eq!(clip_chars("αβγδ", 2), "αβ");
    }
}
