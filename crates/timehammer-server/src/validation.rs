//! Incoming request validation.

use timehammer_proto::protocol::{ConstPackedSizeBytes, FromBytes, Packet};

use crate::error::ProtocolError;

/// Parse and validate an incoming datagram as an NTP client request.
///
/// Two failure classes, handled differently by the caller:
/// - [`ProtocolError::RequestTooShort`] (malformed): logged at warn, error
///   counter bumped.
/// - [`ProtocolError::NotAClientRequest`] (parsed, but not mode 3 with
///   version 3 or 4): logged at debug and silently dropped, per the
///   wire contract.
pub(crate) fn validate_client_request(
    recv_buf: &[u8],
    recv_len: usize,
) -> Result<Packet, ProtocolError> {
    if recv_len < Packet::PACKED_SIZE_BYTES {
        return Err(ProtocolError::RequestTooShort { received: recv_len });
    }

    // Totality of the codec over 48 bytes means the only parse failure is
    // a short buffer, which was just ruled out.
    let (request, _) = Packet::from_bytes(&recv_buf[..recv_len])
        .map_err(|_| ProtocolError::RequestTooShort { received: recv_len })?;

    if !request.is_valid_client_request() {
        return Err(ProtocolError::NotAClientRequest {
            mode: request.mode as u8,
            version: request.version.value(),
        });
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use timehammer_proto::protocol::{Mode, TimestampFormat, ToBytes, Version};

    fn make_buf(version: Version, mode: Mode) -> [u8; 48] {
        let pkt = Packet {
            version,
            mode,
            poll: 6,
            transmit_timestamp: TimestampFormat {
                seconds: 1000,
                fraction: 1,
            },
            ..Packet::default()
        };
        let mut buf = [0u8; 48];
        pkt.to_bytes(&mut buf).unwrap();
        buf
    }

    #[test]
    fn accepts_v4_client() {
        let buf = make_buf(Version::V4, Mode::Client);
        let pkt = validate_client_request(&buf, 48).unwrap();
        assert_eq!(pkt.version, Version::V4);
        assert_eq!(pkt.mode, Mode::Client);
    }

    #[test]
    fn accepts_v3_client() {
        let buf = make_buf(Version::V3, Mode::Client);
        assert!(validate_client_request(&buf, 48).is_ok());
    }

    #[test]
    fn rejects_short_datagram() {
        let buf = [0u8; 40];
        let err = validate_client_request(&buf, 40).unwrap_err();
        assert!(matches!(err, ProtocolError::RequestTooShort { received: 40 }));
    }

    #[test]
    fn rejects_server_mode() {
        let buf = make_buf(Version::V4, Mode::Server);
        let err = validate_client_request(&buf, 48).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NotAClientRequest { mode: 4, .. }
        ));
    }

    #[test]
    fn rejects_broadcast_and_control_modes() {
        for mode in [Mode::Broadcast, Mode::Control, Mode::SymmetricActive] {
            let buf = make_buf(Version::V4, mode);
            assert!(validate_client_request(&buf, 48).is_err());
        }
    }

    #[test]
    fn rejects_unsupported_versions() {
        for v in [0, 1, 2, 5, 6, 7] {
            let buf = make_buf(Version::from_raw(v), Mode::Client);
            let err = validate_client_request(&buf, 48).unwrap_err();
            assert!(matches!(
                err,
                ProtocolError::NotAClientRequest { version, .. } if version == v
            ));
        }
    }

    #[test]
    fn accepts_zero_transmit_timestamp() {
        // SNTP clients sometimes send an all-zero packet apart from the
        // header byte; they still get served.
        let pkt = Packet {
            version: Version::V4,
            mode: Mode::Client,
            ..Packet::default()
        };
        let mut buf = [0u8; 48];
        pkt.to_bytes(&mut buf).unwrap();
        assert!(validate_client_request(&buf, 48).is_ok());
    }

    #[test]
    fn accepts_oversized_datagram() {
        let short = make_buf(Version::V4, Mode::Client);
        let mut buf = [0u8; 68];
        buf[..48].copy_from_slice(&short);
        assert!(validate_client_request(&buf, 68).is_ok());
    }
}
