//! Sort-key generation.
//!
//! Keys are `message-` followed by the write time in microseconds, zero-padded
//! to 20 digits so lexicographic order equals numeric order.

use chrono::Utc;
use std::sync::Mutex;

const PREFIX: &str = "message-";

/// Hands out strictly increasing sort keys, even for writes that land in the
/// same microsecond.
#[derive(Debug, Default)]
pub struct SortKeyClock {
    last_micros: Mutex<i64>,
}

impl SortKeyClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next key, derived from the current time.
    pub fn next(&self) -> String {
        self.next_after(Utc::now().timestamp_micros())
    }

    /// `count` consecutive keys for a multi-record write.
    pub fn next_batch(&self, count: usize) -> Vec<String> {
        (0..count).map(|_| self.next()).collect()
    }

    fn next_after(&self, now_micros: i64) -> String {
        let mut last = self
            .last_micros
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let micros = now_micros.max(*last + 1);
        *last = micros;
        format_key(micros)
    }
}

pub fn format_key(micros: i64) -> String {
    format!("{PREFIX}{micros:020}")
}

/// The write time encoded in a sort key, if it has the expected shape.
#[cfg(test)]
fn parse_key(key: &str) -> Option<i64> {
    key.strip_prefix(PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_padded() {
        assert_eq!(format_key(42), "message-00000000000000000042");
        assert_eq!(parse_key("message-00000000000000000042"), Some(42));
        assert_eq!(parse_key("other-1"), None);
    }

    #[test]
    fn same_instant_still_increases() {
        let clock = SortKeyClock::new();
        let a = clock.next_after(1_000);
        let b = clock.next_after(1_000);
        let c = clock.next_after(999);
        assert!(a < b && b < c);
        assert_eq!(parse_key(&c), Some(1_002));
    }

    #[test]
    fn batch_is_strictly_ordered() {
        let clock = SortKeyClock::new();
        let keys = clock.next_batch(50);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}
