//! Response construction.
//!
//! A response is built from the client's request plus a view of the
//! upstream tracker's snapshot, then handed to the attack engine, and only
//! serialized (with the transmit timestamp patched in last) right before
//! the UDP send.

use std::io;
use std::time::Duration;

use timehammer_proto::protocol::{
    ConstPackedSizeBytes, LeapIndicator, Mode, Packet, ReferenceIdentifier, ShortFormat, Stratum,
    TimestampFormat, ToBytes,
};
use timehammer_proto::unix_time;

/// Advertised clock precision, log2 seconds (-20 is about 1 microsecond).
const PRECISION: i8 = -20;

/// Nominal root dispersion advertised in every response, in milliseconds.
const NOMINAL_DISPERSION_MS: f64 = 10.0;

/// The slice of upstream state a response needs.
#[derive(Clone, Debug)]
pub(crate) struct UpstreamView {
    /// Upstream-corrected current time.
    pub current_time: unix_time::Instant,
    /// Stratum to advertise (16 when unsynchronized).
    pub stratum: Stratum,
    /// Reference identifier to advertise.
    pub reference_id: ReferenceIdentifier,
    /// Measured upstream round trip, advertised as root delay.
    pub rtt: Duration,
}

/// Build the response packet for a validated client request.
///
/// Per RFC 5905 Section 8 and the server's upstream state:
/// - version echoes the client's, mode is Server, poll echoes the client's
/// - origin timestamp is the client's transmit timestamp, copied field for
///   field so the bytes the client compares against are identical
/// - receive timestamp is T2 (when the datagram arrived)
/// - reference timestamp is the upstream-corrected time minus one second
/// - an unsynchronized upstream means stratum 16 with the leap alarm set;
///   the response is still sent
/// - the transmit timestamp stays zero here; the pipeline stamps it before
///   the attack stage and refreshes it at send time when no attack fired
pub(crate) fn build_server_response(
    request: &Packet,
    upstream: &UpstreamView,
    receive_time: TimestampFormat,
) -> Packet {
    let leap_indicator = if upstream.stratum == Stratum::UNSYNCHRONIZED {
        LeapIndicator::Unknown
    } else {
        LeapIndicator::NoWarning
    };

    Packet {
        leap_indicator,
        version: request.version,
        mode: Mode::Server,
        stratum: upstream.stratum,
        poll: request.poll,
        precision: PRECISION,
        root_delay: ShortFormat::from_millis(upstream.rtt.as_secs_f64() * 1000.0),
        root_dispersion: ShortFormat::from_millis(NOMINAL_DISPERSION_MS),
        reference_id: upstream.reference_id,
        reference_timestamp: upstream.current_time.add_secs_f64(-1.0).into(),
        origin_timestamp: request.transmit_timestamp,
        receive_timestamp: receive_time,
        transmit_timestamp: TimestampFormat::default(),
    }
}

/// Serialize a response, optionally patching the transmit timestamp (T3)
/// with the current time as late as possible.
///
/// The pipeline refreshes T3 only when no attack mutated the packet: an
/// armed attack owns every timestamp it wrote (including deliberate zeros
/// and forged rollover values) and those bytes must reach the wire
/// untouched.
pub(crate) fn serialize_response_with_transmit(
    response: &Packet,
    refresh_transmit: bool,
) -> io::Result<[u8; Packet::PACKED_SIZE_BYTES]> {
    let mut buf = [0u8; Packet::PACKED_SIZE_BYTES];
    response.to_bytes(&mut buf)?;

    if refresh_transmit {
        let t3: TimestampFormat = unix_time::Instant::now().into();
        buf[40..44].copy_from_slice(&t3.seconds.to_be_bytes());
        buf[44..48].copy_from_slice(&t3.fraction.to_be_bytes());
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use timehammer_proto::protocol::{FromBytes, Version};

    fn request() -> Packet {
        Packet {
            version: Version::V3,
            mode: Mode::Client,
            poll: 10,
            transmit_timestamp: TimestampFormat {
                seconds: 0xE2A1_B2C3,
                fraction: 0x0000_0001,
            },
            ..Packet::default()
        }
    }

    fn synced_view() -> UpstreamView {
        UpstreamView {
            current_time: unix_time::Instant::new(1_704_067_200, 0),
            stratum: Stratum(2),
            reference_id: ReferenceIdentifier::ServerAddress([216, 239, 35, 0]),
            rtt: Duration::from_millis(20),
        }
    }

    fn t2() -> TimestampFormat {
        TimestampFormat {
            seconds: 3_913_056_000,
            fraction: 42,
        }
    }

    #[test]
    fn response_shape_when_synchronized() {
        let resp = build_server_response(&request(), &synced_view(), t2());
        assert_eq!(resp.mode, Mode::Server);
        assert_eq!(resp.version, Version::V3);
        assert_eq!(resp.stratum, Stratum(2));
        assert_eq!(resp.poll, 10);
        assert_eq!(resp.precision, -20);
        assert_eq!(resp.leap_indicator, LeapIndicator::NoWarning);
        assert_eq!(resp.receive_timestamp, t2());
        assert_eq!(resp.origin_timestamp, request().transmit_timestamp);
        assert!(resp.transmit_timestamp.is_zero());
    }

    #[test]
    fn response_unsynchronized_is_stratum16_alarm() {
        let view = UpstreamView {
            stratum: Stratum::UNSYNCHRONIZED,
            reference_id: ReferenceIdentifier::Unknown([0; 4]),
            ..synced_view()
        };
        let resp = build_server_response(&request(), &view, t2());
        assert_eq!(resp.stratum, Stratum::UNSYNCHRONIZED);
        assert_eq!(resp.leap_indicator, LeapIndicator::Unknown);
    }

    #[test]
    fn response_root_delay_from_rtt() {
        let resp = build_server_response(&request(), &synced_view(), t2());
        // 20 ms in 16.16: 0.02 * 65536 = 1310.72.
        assert_eq!(resp.root_delay, ShortFormat { seconds: 0, fraction: 1310 });
        // 10 ms nominal dispersion.
        assert_eq!(
            resp.root_dispersion,
            ShortFormat { seconds: 0, fraction: 655 }
        );
    }

    #[test]
    fn response_reference_is_current_minus_one() {
        let resp = build_server_response(&request(), &synced_view(), t2());
        let expected: TimestampFormat =
            unix_time::Instant::new(1_704_067_199, 0).into();
        assert_eq!(resp.reference_timestamp, expected);
    }

    #[test]
    fn serialize_refreshes_transmit_for_clean_responses() {
        let resp = build_server_response(&request(), &synced_view(), t2());
        let buf = serialize_response_with_transmit(&resp, true).unwrap();
        let (parsed, _) = Packet::from_bytes(&buf).unwrap();
        assert!(!parsed.transmit_timestamp.is_zero());
        // Origin bytes are exactly the client's transmit bytes.
        assert_eq!(&buf[24..32], &[0xE2, 0xA1, 0xB2, 0xC3, 0, 0, 0, 1]);
    }

    #[test]
    fn serialize_preserves_forged_transmit() {
        let mut resp = build_server_response(&request(), &synced_view(), t2());
        // An attack wrote a rollover transmit timestamp; it must survive.
        resp.transmit_timestamp = TimestampFormat {
            seconds: 61_505_151,
            fraction: 0,
        };
        let buf = serialize_response_with_transmit(&resp, false).unwrap();
        let (parsed, _) = Packet::from_bytes(&buf).unwrap();
        assert_eq!(parsed.transmit_timestamp.seconds, 61_505_151);
    }

    #[test]
    fn serialize_preserves_zeroed_timestamps_from_fuzzing() {
        let mut resp = build_server_response(&request(), &synced_view(), t2());
        resp.receive_timestamp = TimestampFormat::default();
        resp.transmit_timestamp = TimestampFormat::default();
        let buf = serialize_response_with_transmit(&resp, false).unwrap();
        assert_eq!(&buf[32..48], &[0u8; 16]);
    }
}
