//! Row keys of simulated device readings.
//!
//! Keys have the form `device/<device id>/<timestamp in ns>`, so all
//! readings of one device are adjacent and sorted by time within a table.

use chrono::Utc;

pub const DEVICE_ENTITY_CLASS: &str = "device";

/// Returns the row key of a reading taken by `device_id` at `now_nanos`.
pub fn next_row_key(device_id: u64, now_nanos: i64) -> String {
    format!("{}/{}/{}", DEVICE_ENTITY_CLASS, device_id, now_nanos)
}

/// Returns the prefix shared by all readings of `device_id`.
pub fn device_prefix(device_id: u64) -> String {
    format!("{}/{}", DEVICE_ENTITY_CLASS, device_id)
}

/// Nanoseconds since the Unix epoch. Saturates past year 2262.
pub fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Microseconds since the Unix epoch, the timestamp unit of cells.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_row_key() {
        assert_eq!(next_row_key(7, 1000), "device/7/1000");
        assert_eq!(next_row_key(0, 0), "device/0/0");
    }

    #[test]
    fn test_device_prefix_matches_keys() {
        let key = next_row_key(42, 1_700_000_000_000_000_000);
        assert!(key.starts_with(&device_prefix(42)));
        assert_eq!(device_prefix(42), "device/42");
    }

    #[test]
    fn test_clock_units() {
        let micros = now_micros();
        let nanos = now_nanos();
        assert!(nanos / 1000 >= micros);
        assert!(nanos / 1000 - micros < 60_000_000);
    }
}
