use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock used for token bucket refill calculations.
///
/// Time is measured in whole Unix seconds. The manual variant lets tests
/// drive refill and expiry without sleeping.
#[derive(Debug, Clone)]
pub enum TimeSource {
    System,
    Manual(Arc<AtomicI64>),
}

impl TimeSource {
    pub fn new() -> Self {
        TimeSource::System
    }

    /// A clock frozen at `start` until advanced
    pub fn manual(start: i64) -> Self {
        TimeSource::Manual(Arc::new(AtomicI64::new(start)))
    }

    /// Get the current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        match self {
            TimeSource::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            TimeSource::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, seconds: i64) {
        if let TimeSource::Manual(now) = self {
            now.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        match self {
            TimeSource::System => Utc::now(),
            TimeSource::Manual(_) => {
                DateTime::from_timestamp(self.unix_now(), 0).unwrap_or_default()
            }
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the store key for an identifier, namespaced by `prefix` when set
pub fn bucket_key(prefix: &str, identifier: &str) -> String {
    if prefix.is_empty() {
        identifier.to_string()
    } else {
        format!("{}:{}", prefix, identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let time_source = TimeSource::manual(1_000);
        assert_eq!(time_source.unix_now(), 1_000);

        time_source.advance(5);
        assert_eq!(time_source.unix_now(), 1_005);

        // Clones share the same clock
        let other = time_source.clone();
        other.advance(1);
        assert_eq!(time_source.unix_now(), 1_006);
        assert_eq!(time_source.utc_now().timestamp(), 1_006);
    }

    #[test]
    fn test_system_clock_ignores_advance() {
        let time_source = TimeSource::new();
        let before = time_source.unix_now();
        time_source.advance(10_000);
        assert!(time_source.unix_now() - before < 10_000);
    }

    #[test]
    fn test_bucket_key() {
        assert_eq!(bucket_key("", "10.0.0.1"), "10.0.0.1");
        assert_eq!(bucket_key("ratelimit", "10.0.0.1"), "ratelimit:10.0.0.1");
    }
}
