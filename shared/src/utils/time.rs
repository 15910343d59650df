//! Time-related utilities

use std::time::{SystemTime, UNIX_EPOCH};

fn since_epoch() -> std::time::Duration {
    // A clock set before 1970 reads as the epoch rather than failing.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Get the current system time in nanoseconds since UNIX epoch
pub fn system_time_nanos() -> u64 {
    since_epoch().as_nanos() as u64
}

/// Get the current system time in milliseconds since UNIX epoch
pub fn system_time_millis() -> u64 {
    since_epoch().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time() {
        let nanos = system_time_nanos();
        let millis = system_time_millis();

        // Basic sanity check
        assert!(nanos > 0);
        assert!(millis > 1_600_000_000_000); // After 2020
    }
}
