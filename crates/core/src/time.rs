//! Clock helpers
//!
//! Timestamps across the database are UTC milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch reads as 0 rather than panicking.
pub fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current UTC time in whole seconds since the Unix epoch.
pub fn now_utc_secs() -> u32 {
    (now_utc_ms() / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01T00:00:00Z in ms
        assert!(now_utc_ms() > 1_577_836_800_000);
    }

    #[test]
    fn seconds_track_milliseconds() {
        let ms = now_utc_ms();
        let s = now_utc_secs() as u64;
        assert!(s >= ms / 1000 - 1 && s <= ms / 1000 + 1);
    }
}
