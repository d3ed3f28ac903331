/// Rate-limited logging for transient failures
///
/// Scheduler action errors, dropped engine events and head-analysis retries
/// can repeat every tick; each key gets at most one log record per 5 s.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Minimum interval between two records for the same key.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(5);

lazy_static! {
    static ref LAST_EMIT: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
}

/// Returns true if the caller should emit a record for `key` now.
///
/// The first call for a key always passes; subsequent calls pass once the
/// throttle window has elapsed since the last passing call.
pub fn should_log(key: &str) -> bool {
    let mut map = LAST_EMIT.lock();
    let now = Instant::now();
    match map.get(key) {
        Some(last) if now.duration_since(*last) < THROTTLE_WINDOW => false,
        _ => {
            map.insert(key.to_string(), now);
            true
        }
    }
}

/// Log a warning for `key`, rate-limited to one record per window.
#[macro_export]
macro_rules! warn_throttled {
    ($key:expr, $($arg:tt)*) => {
        if $crate::throttle::should_log($key) {
            log::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_emit_passes() {
        assert!(should_log("throttle-test-first"));
    }

    #[test]
    fn test_repeat_within_window_blocked() {
        assert!(should_log("throttle-test-repeat"));
        assert!(!should_log("throttle-test-repeat"));
        assert!(!should_log("throttle-test-repeat"));
    }

    #[test]
    fn test_keys_are_independent() {
        assert!(should_log("throttle-test-a"));
        assert!(should_log("throttle-test-b"));
    }
}
