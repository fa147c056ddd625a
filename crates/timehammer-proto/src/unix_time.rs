//! Conversion between NTP timestamps and Unix-epoch instants.
//!
//! The NTP prime epoch is 1900-01-01T00:00:00Z; Unix time begins 70 years
//! (2 208 988 800 seconds) later. The 32-bit on-wire seconds field wraps
//! every 2^32 seconds (~136 years), so absolute conversion requires era
//! disambiguation: era 0 ends and era 1 begins at 2036-02-07T06:28:16Z.
//! All arithmetic here is 64-bit; truncation to 32 bits happens only at the
//! wire boundary.

use crate::protocol;
use std::time;

/// The number of seconds from 1st January 1900 UTC to the start of the Unix epoch.
pub const EPOCH_DELTA: i64 = 2_208_988_800;

/// The number of seconds in one NTP era (2^32 seconds, approximately 136 years).
///
/// Era 0 spans from 1900-01-01 00:00:00 UTC to 2036-02-07 06:28:15 UTC.
/// Era 1 begins at 2036-02-07 06:28:16 UTC.
pub const ERA_SECONDS: i64 = 4_294_967_296; // 1i64 << 32

// The NTP fractional scale: one second is 2^32 fraction units.
const FRAC_PER_SEC: f64 = 4_294_967_296.0;

/// An instant relative to the Unix epoch (1970-01-01T00:00:00Z) in seconds
/// plus a nanosecond fraction.
///
/// For a moment prior to the epoch both `secs` and `subsec_nanos` are
/// negative. The type exists to bridge `std::time` and the NTP timestamp
/// formats; for calendar rendering see the chrono crate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Instant {
    secs: i64,
    subsec_nanos: i32,
}

impl Instant {
    /// Create a new `Instant` from its `secs` and `subsec_nanos` components.
    ///
    /// The two components must agree in sign. Violating this invariant will
    /// result in a **panic!**.
    pub fn new(secs: i64, subsec_nanos: i32) -> Instant {
        if secs > 0 && subsec_nanos < 0 {
            panic!("invalid instant: secs was positive but subsec_nanos was negative");
        }
        if secs < 0 && subsec_nanos > 0 {
            panic!("invalid instant: secs was negative but subsec_nanos was positive");
        }
        Instant { secs, subsec_nanos }
    }

    /// The current wall-clock time via `std::time::SystemTime`.
    pub fn now() -> Self {
        match time::SystemTime::now().duration_since(time::UNIX_EPOCH) {
            Ok(duration) => {
                let secs = duration.as_secs() as i64;
                let subsec_nanos = duration.subsec_nanos() as i32;
                Instant::new(secs, subsec_nanos)
            }
            Err(sys_time_err) => {
                let duration_pre_unix_epoch = sys_time_err.duration();
                let secs = -(duration_pre_unix_epoch.as_secs() as i64);
                let subsec_nanos = -(duration_pre_unix_epoch.subsec_nanos() as i32);
                Instant::new(secs, subsec_nanos)
            }
        }
    }

    /// The "seconds" component of the `Instant`.
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// The fractional component of the `Instant` in nanoseconds.
    pub fn subsec_nanos(&self) -> i32 {
        self.subsec_nanos
    }

    /// This instant as fractional seconds since the Unix epoch.
    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.subsec_nanos as f64 / 1e9
    }

    /// An instant from fractional seconds since the Unix epoch.
    pub fn from_secs_f64(value: f64) -> Instant {
        let secs = value.trunc() as i64;
        let subsec_nanos = (value.fract() * 1e9) as i32;
        Instant::new(secs, subsec_nanos)
    }

    /// This instant shifted by a (possibly negative, possibly fractional)
    /// number of seconds. Used by the attack engine for offsets and drift.
    pub fn add_secs_f64(&self, delta: f64) -> Instant {
        Instant::from_secs_f64(self.as_secs_f64() + delta)
    }
}

// Era-aware conversion helpers.

/// Given a raw 32-bit NTP timestamp seconds value and a pivot `Instant`,
/// return the absolute NTP seconds (i64) by selecting the era closest to the
/// pivot.
///
/// The algorithm assumes the timestamp is within half an era (~68 years) of
/// the pivot.
fn era_aware_ntp_seconds(raw_seconds: u32, pivot: &Instant) -> i64 {
    let pivot_ntp = pivot.secs + EPOCH_DELTA;
    let raw = raw_seconds as i64;

    let pivot_era = pivot_ntp.div_euclid(ERA_SECONDS);
    let candidate = pivot_era * ERA_SECONDS + raw;

    let diff = candidate - pivot_ntp;
    if diff > ERA_SECONDS / 2 {
        candidate - ERA_SECONDS
    } else if diff < -(ERA_SECONDS / 2) {
        candidate + ERA_SECONDS
    } else {
        candidate
    }
}

/// Convert a [`protocol::TimestampFormat`] to an [`Instant`] using the given
/// pivot for era disambiguation.
///
/// The 32-bit NTP seconds field is ambiguous across eras. This resolves the
/// ambiguity by selecting the era that places the timestamp closest to the
/// provided pivot (within ~68 years). For live use, pass `Instant::now()`;
/// for replay or fixtures, pass a known reference time.
pub fn timestamp_to_instant(ts: protocol::TimestampFormat, pivot: &Instant) -> Instant {
    let ntp_secs = era_aware_ntp_seconds(ts.seconds, pivot);
    let secs = ntp_secs - EPOCH_DELTA;
    // Inverse of the 2^32 fraction scale; lossy by ~233 ps, truncating
    // toward zero.
    let subsec_nanos = (ts.fraction as f64 / FRAC_PER_SEC * 1e9) as i32;
    // Renormalize pre-epoch instants so both components share a sign.
    if secs < 0 && subsec_nanos > 0 {
        Instant::new(secs + 1, subsec_nanos - 1_000_000_000)
    } else {
        Instant::new(secs, subsec_nanos)
    }
}

impl From<protocol::TimestampFormat> for Instant {
    /// Converts an on-wire NTP timestamp to a Unix [`Instant`], using the
    /// current system time as the era pivot.
    fn from(t: protocol::TimestampFormat) -> Self {
        timestamp_to_instant(t, &Instant::now())
    }
}

impl From<Instant> for protocol::TimestampFormat {
    /// Converts a Unix [`Instant`] to an on-wire NTP timestamp.
    ///
    /// `ntp_seconds = unix_seconds + EPOCH_DELTA` computed in 64 bits, then
    /// truncated (wrapping) to the 32-bit wire field; the era is implicit
    /// and must be restored by the receiver with a pivot.
    /// `fraction = nanoseconds × 2^32 / 10^9`, truncated toward zero.
    fn from(t: Instant) -> Self {
        let sec = t.secs() + EPOCH_DELTA;
        let frac = t.subsec_nanos().unsigned_abs() as f64 / 1e9 * FRAC_PER_SEC;
        protocol::TimestampFormat {
            seconds: sec as u32,
            fraction: frac as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_delta_matches_rfc() {
        // 1970-01-01 minus 1900-01-01 including 17 leap days.
        assert_eq!(EPOCH_DELTA, 2_208_988_800);
    }

    #[test]
    fn era0_timestamp_to_instant() {
        // 2024-01-01 00:00:00 UTC: Unix=1704067200, NTP=3913056000
        let ts = protocol::TimestampFormat {
            seconds: 3_913_056_000,
            fraction: 0,
        };
        let pivot = Instant::new(1_704_067_200, 0);
        let result = timestamp_to_instant(ts, &pivot);
        assert_eq!(result.secs(), 1_704_067_200);
    }

    #[test]
    fn era1_timestamp_with_era1_pivot() {
        // Era 1, offset 100_000_000 => absolute NTP = 2^32 + 100_000_000
        // Unix = 4_294_967_296 + 100_000_000 - 2_208_988_800 = 2_185_978_496
        let ts = protocol::TimestampFormat {
            seconds: 100_000_000,
            fraction: 0,
        };
        let pivot = Instant::new(2_185_978_496, 0);
        let result = timestamp_to_instant(ts, &pivot);
        assert_eq!(result.secs(), 2_185_978_496);
    }

    #[test]
    fn era_boundary_pivot_before_ts_after() {
        // Pivot in Jan 2036 (era 0). Timestamp NTP=1000 resolves to era 1.
        let pivot = Instant::new(2_082_758_400, 0); // ~2036-01-01
        let ts = protocol::TimestampFormat {
            seconds: 1000,
            fraction: 0,
        };
        let result = timestamp_to_instant(ts, &pivot);
        let expected = ERA_SECONDS + 1000 - EPOCH_DELTA;
        assert_eq!(result.secs(), expected);
    }

    #[test]
    fn era_boundary_pivot_after_ts_before() {
        // Pivot in Mar 2036 (era 1). Timestamp near u32::MAX resolves to era 0.
        let pivot = Instant::new(2_087_942_400, 0); // ~2036-03-01
        let ts = protocol::TimestampFormat {
            seconds: u32::MAX,
            fraction: 0,
        };
        let result = timestamp_to_instant(ts, &pivot);
        let expected = u32::MAX as i64 - EPOCH_DELTA;
        assert_eq!(result.secs(), expected);
    }

    #[test]
    fn y2k38_wire_truncation() {
        // 2038-01-19T03:14:07Z: Unix 2147483647, absolute NTP 4356472447.
        // That is past the era boundary, so the 32-bit wire value wraps.
        let instant = Instant::new(2_147_483_647, 0);
        let ts: protocol::TimestampFormat = instant.into();
        assert_eq!(ts.seconds, 61_505_151);

        // Era-aware decoding with a contemporary pivot restores the instant.
        let pivot = Instant::new(2_147_000_000, 0);
        let back = timestamp_to_instant(ts, &pivot);
        assert_eq!(back.secs(), 2_147_483_647);
    }

    #[test]
    fn fraction_conversion_truncates_toward_zero() {
        // 500 ms is exactly 2^31 fraction units.
        let instant = Instant::new(1_704_067_200, 500_000_000);
        let ts: protocol::TimestampFormat = instant.into();
        assert_eq!(ts.fraction, 0x8000_0000);

        // One nanosecond is ~4.29 fraction units; truncation keeps 4.
        let instant = Instant::new(0, 1);
        let ts: protocol::TimestampFormat = instant.into();
        assert_eq!(ts.fraction, 4);
    }

    #[test]
    fn timestamp_roundtrip_within_one_lsb() {
        for nanos in [0, 1, 123_456_789, 500_000_000, 999_999_999] {
            let original = Instant::new(1_704_067_200, nanos);
            let ts: protocol::TimestampFormat = original.into();
            let restored = timestamp_to_instant(ts, &original);
            assert_eq!(restored.secs(), original.secs());
            // 1 LSB of the fraction field is ~0.233 ns; nanosecond
            // granularity absorbs it, so the error is at most 1 ns.
            assert!((restored.subsec_nanos() - original.subsec_nanos()).abs() <= 1);
        }
    }

    #[test]
    fn add_secs_f64_forward_and_backward() {
        let base = Instant::new(1_704_067_200, 0);
        assert_eq!(base.add_secs_f64(3600.0).secs(), 1_704_070_800);
        assert_eq!(base.add_secs_f64(-1.0).secs(), 1_704_067_199);

        let half = base.add_secs_f64(0.5);
        assert_eq!(half.secs(), 1_704_067_200);
        assert!((half.subsec_nanos() - 500_000_000).abs() <= 1);
    }

    #[test]
    fn as_secs_f64_roundtrip() {
        let t = Instant::new(1_704_067_200, 250_000_000);
        let back = Instant::from_secs_f64(t.as_secs_f64());
        assert_eq!(back.secs(), t.secs());
        assert!((back.subsec_nanos() - t.subsec_nanos()).abs() <= 200);
    }
}
