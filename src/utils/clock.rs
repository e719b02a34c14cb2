//! Wall-clock helpers shared by connection bookkeeping and replication.

use std::time::{SystemTime, UNIX_EPOCH};

/// Human-readable timestamp format carried in replication sync requests.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current unix time in whole seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Current local time formatted as `YYYY-MM-DD HH:MM:SS`.
pub fn now_formatted() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn formatted_shape() {
        let ts = now_formatted();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }

    #[test]
    fn secs_monotone_enough() {
        let a = now_secs();
        let b = now_secs();
        assert!(a > 1_500_000_000);
        assert!(b >= a);
    }
}
