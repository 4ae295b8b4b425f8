use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in whole seconds.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
        .as_secs()
}

/// Current unix timestamp in milliseconds, for log and wire fields that
/// want sub-second resolution.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_moves_forward() {
        let secs = timestamp_secs();
        let millis = timestamp_millis();
        assert!(secs > 1_500_000_000);
        assert!(millis / 1000 >= secs);
    }
}
