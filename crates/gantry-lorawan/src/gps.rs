//! GPS-epoch time conversion.
//!
//! Class-B ping slots are scheduled against the GPS time scale, which started
//! at 1980-01-06 00:00:00 UTC and does not observe leap seconds. Converting
//! between UTC wall-clock and a duration since the GPS epoch therefore has to
//! add the leap seconds accumulated since.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp of the GPS epoch (1980-01-06 00:00:00 UTC).
const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Leap seconds between UTC and GPS time (last leap second: 2017-01-01).
const LEAP_SECONDS: i64 = 18;

/// Duration since the GPS epoch for the given UTC instant.
///
/// Returns `Duration::ZERO` for instants before the GPS epoch.
pub fn time_since_gps_epoch(t: DateTime<Utc>) -> Duration {
    let ms = (t.timestamp_millis() - GPS_EPOCH_UNIX * 1000) + LEAP_SECONDS * 1000;
    if ms <= 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(ms as u64)
}

/// UTC instant for the given duration since the GPS epoch.
pub fn time_from_gps_epoch(d: Duration) -> DateTime<Utc> {
    let ms = GPS_EPOCH_UNIX * 1000 + d.as_millis() as i64 - LEAP_SECONDS * 1000;
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_epoch_maps_to_leap_offset() {
        let epoch = Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap();
        assert_eq!(
            time_since_gps_epoch(epoch),
            Duration::from_secs(LEAP_SECONDS as u64)
        );
    }

    #[test]
    fn roundtrip() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
        let d = time_since_gps_epoch(t);
        assert_eq!(time_from_gps_epoch(d), t);
    }

    #[test]
    fn pre_epoch_clamps_to_zero() {
        let t = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(time_since_gps_epoch(t), Duration::ZERO);
    }
}
