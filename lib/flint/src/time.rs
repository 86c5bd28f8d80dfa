use std::time::{Duration, SystemTime};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Wall clock reads before the unix epoch")
}

/// Wall-clock seconds since the unix epoch.
#[inline]
pub fn unix_secs() -> u64 {
    since_epoch().as_secs()
}

/// Wall-clock milliseconds since the unix epoch.
#[inline]
pub fn unix_millis() -> u64 {
    since_epoch().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_consistent_with_secs() {
        let secs = unix_secs();
        let millis = unix_millis();

        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }

    #[test]
    fn test_epoch_offset_is_sane() {
        // 2020-01-01 in seconds; anything earlier means a broken clock
        // source rather than a broken helper.
        assert!(unix_secs() > 1_577_836_800);
    }
}
