use crate::error::ParseError;

use super::{
    ConstPackedSizeBytes, FromBytes, LeapIndicator, Mode, Packet, ReferenceIdentifier, ShortFormat,
    Stratum, TimestampFormat, ToBytes, Version,
};

impl FromBytes for ShortFormat {
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }
        let seconds = u16::from_be_bytes([buf[0], buf[1]]);
        let fraction = u16::from_be_bytes([buf[2], buf[3]]);
        Ok((ShortFormat { seconds, fraction }, Self::PACKED_SIZE_BYTES))
    }
}

impl FromBytes for TimestampFormat {
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }
        let seconds = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let fraction = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok((
            TimestampFormat { seconds, fraction },
            Self::PACKED_SIZE_BYTES,
        ))
    }
}

impl FromBytes for Stratum {
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        if buf.is_empty() {
            return Err(ParseError::BufferTooShort {
                needed: 1,
                available: 0,
            });
        }
        Ok((Stratum(buf[0]), 1))
    }
}

impl FromBytes for (LeapIndicator, Version, Mode) {
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        if buf.is_empty() {
            return Err(ParseError::BufferTooShort {
                needed: 1,
                available: 0,
            });
        }
        let li_vn_mode = buf[0];
        let li_u8 = li_vn_mode >> 6;
        let vn_u8 = (li_vn_mode >> 3) & 0b111;
        let mode_u8 = li_vn_mode & 0b111;
        // Both sub-fields cover their full bit range, so these cannot fail
        // for any input byte; the map keeps the conversion honest.
        let li = LeapIndicator::try_from(li_u8).map_err(|_| ParseError::InvalidField {
            field: "leap indicator",
            value: li_u8 as u32,
        })?;
        let vn = Version::from_raw(vn_u8);
        let mode = Mode::try_from(mode_u8).map_err(|_| ParseError::InvalidField {
            field: "association mode",
            value: mode_u8 as u32,
        })?;
        Ok(((li, vn, mode), 1))
    }
}

impl FromBytes for Packet {
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }

        let mut offset = 0;

        let ((leap_indicator, version, mode), n) =
            <(LeapIndicator, Version, Mode)>::from_bytes(&buf[offset..])?;
        offset += n;

        let (stratum, n) = Stratum::from_bytes(&buf[offset..])?;
        offset += n;

        let poll = buf[offset] as i8;
        offset += 1;

        let precision = buf[offset] as i8;
        offset += 1;

        let (root_delay, n) = ShortFormat::from_bytes(&buf[offset..])?;
        offset += n;

        let (root_dispersion, n) = ShortFormat::from_bytes(&buf[offset..])?;
        offset += n;

        let ref_id_bytes = [
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ];
        let reference_id = ReferenceIdentifier::from_bytes_with_stratum(ref_id_bytes, stratum);
        offset += 4;

        let (reference_timestamp, n) = TimestampFormat::from_bytes(&buf[offset..])?;
        offset += n;

        let (origin_timestamp, n) = TimestampFormat::from_bytes(&buf[offset..])?;
        offset += n;

        let (receive_timestamp, n) = TimestampFormat::from_bytes(&buf[offset..])?;
        offset += n;

        let (transmit_timestamp, n) = TimestampFormat::from_bytes(&buf[offset..])?;
        offset += n;

        Ok((
            Packet {
                leap_indicator,
                version,
                mode,
                stratum,
                poll,
                precision,
                root_delay,
                root_dispersion,
                reference_id,
                reference_timestamp,
                origin_timestamp,
                receive_timestamp,
                transmit_timestamp,
            },
            offset,
        ))
    }
}

// Buffer-based writer implementations.

impl ToBytes for ShortFormat {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }
        buf[..2].copy_from_slice(&self.seconds.to_be_bytes());
        buf[2..4].copy_from_slice(&self.fraction.to_be_bytes());
        Ok(Self::PACKED_SIZE_BYTES)
    }
}

impl ToBytes for TimestampFormat {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }
        buf[..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        Ok(Self::PACKED_SIZE_BYTES)
    }
}

impl ToBytes for Stratum {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.is_empty() {
            return Err(ParseError::BufferTooShort {
                needed: 1,
                available: 0,
            });
        }
        buf[0] = self.0;
        Ok(1)
    }
}

impl ToBytes for (LeapIndicator, Version, Mode) {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.is_empty() {
            return Err(ParseError::BufferTooShort {
                needed: 1,
                available: 0,
            });
        }
        let (li, vn, mode) = *self;
        let mut li_vn_mode = 0u8;
        li_vn_mode |= (li as u8) << 6;
        li_vn_mode |= vn.value() << 3;
        li_vn_mode |= mode as u8;
        buf[0] = li_vn_mode;
        Ok(1)
    }
}

impl ToBytes for ReferenceIdentifier {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }
        buf[..4].copy_from_slice(&self.as_bytes());
        Ok(Self::PACKED_SIZE_BYTES)
    }
}

impl ToBytes for Packet {
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.len() < Self::PACKED_SIZE_BYTES {
            return Err(ParseError::BufferTooShort {
                needed: Self::PACKED_SIZE_BYTES,
                available: buf.len(),
            });
        }

        let mut offset = 0;

        let li_vn_mode = (self.leap_indicator, self.version, self.mode);
        offset += li_vn_mode.to_bytes(&mut buf[offset..])?;
        offset += self.stratum.to_bytes(&mut buf[offset..])?;
        buf[offset] = self.poll as u8;
        offset += 1;
        buf[offset] = self.precision as u8;
        offset += 1;
        offset += self.root_delay.to_bytes(&mut buf[offset..])?;
        offset += self.root_dispersion.to_bytes(&mut buf[offset..])?;
        offset += self.reference_id.to_bytes(&mut buf[offset..])?;
        offset += self.reference_timestamp.to_bytes(&mut buf[offset..])?;
        offset += self.origin_timestamp.to_bytes(&mut buf[offset..])?;
        offset += self.receive_timestamp.to_bytes(&mut buf[offset..])?;
        offset += self.transmit_timestamp.to_bytes(&mut buf[offset..])?;

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KissCode;

    fn make_test_packet() -> Packet {
        Packet {
            leap_indicator: LeapIndicator::NoWarning,
            version: Version::V4,
            mode: Mode::Client,
            stratum: Stratum::UNSPECIFIED,
            poll: 6,
            precision: -20,
            root_delay: ShortFormat {
                seconds: 1,
                fraction: 0x8000,
            },
            root_dispersion: ShortFormat {
                seconds: 0,
                fraction: 0x4000,
            },
            reference_id: ReferenceIdentifier::KissOfDeath(KissCode([0; 4])),
            reference_timestamp: TimestampFormat {
                seconds: 3_913_056_000,
                fraction: 0,
            },
            origin_timestamp: TimestampFormat::default(),
            receive_timestamp: TimestampFormat::default(),
            transmit_timestamp: TimestampFormat {
                seconds: 3_913_056_001,
                fraction: 0x1234_5678,
            },
        }
    }

    // ── ShortFormat / TimestampFormat ─────────────────────────────────

    #[test]
    fn short_format_roundtrip() {
        let sf = ShortFormat {
            seconds: 0x1234,
            fraction: 0x5678,
        };
        let mut buf = [0u8; 4];
        assert_eq!(sf.to_bytes(&mut buf).unwrap(), 4);
        let (decoded, consumed) = ShortFormat::from_bytes(&buf).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(decoded, sf);
    }

    #[test]
    fn timestamp_format_roundtrip_edge_values() {
        for (s, f) in [(0u32, 0u32), (u32::MAX, u32::MAX), (3_913_056_000, 1)] {
            let ts = TimestampFormat {
                seconds: s,
                fraction: f,
            };
            let mut buf = [0u8; 8];
            ts.to_bytes(&mut buf).unwrap();
            let (decoded, _) = TimestampFormat::from_bytes(&buf).unwrap();
            assert_eq!(decoded, ts);
        }
    }

    #[test]
    fn timestamp_format_buffer_too_short() {
        let buf = [0u8; 7];
        let err = TimestampFormat::from_bytes(&buf).unwrap_err();
        assert!(matches!(
            err,
            ParseError::BufferTooShort {
                needed: 8,
                available: 7
            }
        ));
    }

    // ── first byte ────────────────────────────────────────────────────

    #[test]
    fn li_vn_mode_byte_encoding() {
        // LI=0, VN=4, Mode=3 → (0<<6)|(4<<3)|3 = 0x23
        let tuple = (LeapIndicator::NoWarning, Version::V4, Mode::Client);
        let mut buf = [0u8; 1];
        tuple.to_bytes(&mut buf).unwrap();
        assert_eq!(buf[0], 0x23);
    }

    #[test]
    fn li_vn_mode_every_byte_parses() {
        // The first byte is three packed sub-fields that each cover their
        // full range, so parsing is total over 0..=255.
        for b in 0..=255u8 {
            let ((li, vn, mode), _) = <(LeapIndicator, Version, Mode)>::from_bytes(&[b]).unwrap();
            let mut out = [0u8; 1];
            (li, vn, mode).to_bytes(&mut out).unwrap();
            assert_eq!(out[0], b);
        }
    }

    // ── ReferenceIdentifier by stratum ────────────────────────────────

    #[test]
    fn reference_id_stratum0_is_kiss_code() {
        let decoded =
            ReferenceIdentifier::from_bytes_with_stratum(*b"DENY", Stratum::UNSPECIFIED);
        assert_eq!(decoded, ReferenceIdentifier::KissOfDeath(KissCode::DENY));
    }

    #[test]
    fn reference_id_stratum1_is_source_tag() {
        let decoded = ReferenceIdentifier::from_bytes_with_stratum(*b"GPS\0", Stratum::PRIMARY);
        assert_eq!(decoded, ReferenceIdentifier::SourceTag(*b"GPS\0"));
    }

    #[test]
    fn reference_id_stratum2_is_server_address() {
        let decoded = ReferenceIdentifier::from_bytes_with_stratum([10, 0, 0, 1], Stratum(2));
        assert_eq!(decoded, ReferenceIdentifier::ServerAddress([10, 0, 0, 1]));
    }

    #[test]
    fn reference_id_stratum16_is_unknown() {
        let decoded =
            ReferenceIdentifier::from_bytes_with_stratum([0xFF, 0xFE, 0xFD, 0xFC], Stratum(16));
        assert_eq!(
            decoded,
            ReferenceIdentifier::Unknown([0xFF, 0xFE, 0xFD, 0xFC])
        );
    }

    // ── Packet ────────────────────────────────────────────────────────

    #[test]
    fn packet_roundtrip() {
        let pkt = make_test_packet();
        let mut buf = [0u8; 48];
        assert_eq!(pkt.to_bytes(&mut buf).unwrap(), 48);
        let (decoded, consumed) = Packet::from_bytes(&buf).unwrap();
        assert_eq!(consumed, 48);
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn packet_from_bytes_too_short() {
        let buf = [0u8; 47];
        let err = Packet::from_bytes(&buf).unwrap_err();
        assert!(matches!(
            err,
            ParseError::BufferTooShort {
                needed: 48,
                available: 47
            }
        ));
    }

    #[test]
    fn packet_extra_bytes_ignored() {
        // Longer datagrams (authentication extensions) parse the first 48
        // bytes and ignore the rest.
        let pkt = make_test_packet();
        let mut buf = [0u8; 68];
        pkt.to_bytes(&mut buf).unwrap();
        let (decoded, consumed) = Packet::from_bytes(&buf).unwrap();
        assert_eq!(consumed, 48);
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn packet_negative_poll_precision() {
        let pkt = Packet {
            poll: -100,
            precision: 100,
            ..make_test_packet()
        };
        let mut buf = [0u8; 48];
        pkt.to_bytes(&mut buf).unwrap();
        let (decoded, _) = Packet::from_bytes(&buf).unwrap();
        assert_eq!(decoded.poll, -100);
        assert_eq!(decoded.precision, 100);
    }

    #[test]
    fn packet_field_offsets() {
        // Fixed wire offsets: refid at 12..16, origin at 24..32,
        // transmit at 40..48.
        let mut pkt = make_test_packet();
        pkt.set_kiss_code(KissCode::DENY);
        pkt.origin_timestamp = TimestampFormat {
            seconds: 0xE2A1_B2C3,
            fraction: 0,
        };
        let mut buf = [0u8; 48];
        pkt.to_bytes(&mut buf).unwrap();
        assert_eq!(&buf[12..16], b"DENY");
        assert_eq!(&buf[24..28], &0xE2A1_B2C3u32.to_be_bytes());
        assert_eq!(&buf[40..44], &pkt.transmit_timestamp.seconds.to_be_bytes());
    }
}
