//! Integration tests for the wire codec: known-answer packets, kiss code
//! accessors, and fixed field offsets.

use timehammer_proto::protocol::{
    ConstPackedSizeBytes, FromBytes, KissCode, LeapIndicator, Mode, Packet, ReferenceIdentifier,
    ShortFormat, Stratum, TimestampFormat, ToBytes, Version,
};
use timehammer_proto::unix_time;

fn client_request(version: Version, xmit_seconds: u32) -> Packet {
    Packet {
        version,
        mode: Mode::Client,
        poll: 6,
        transmit_timestamp: TimestampFormat {
            seconds: xmit_seconds,
            fraction: 0,
        },
        ..Packet::default()
    }
}

#[test]
fn known_answer_client_request() {
    // The scenario request from interop captures: VN=4, Mode=3, all-zero
    // timestamps except XmitTime = 0xE2A1B2C3.00000000.
    let pkt = client_request(Version::V4, 0xE2A1_B2C3);
    let mut buf = [0u8; 48];
    pkt.to_bytes(&mut buf).unwrap();

    assert_eq!(buf[0], 0x23); // LI=0 VN=4 Mode=3
    assert_eq!(buf[1], 0); // stratum
    assert_eq!(buf[2], 6); // poll
    assert_eq!(&buf[40..48], &[0xE2, 0xA1, 0xB2, 0xC3, 0, 0, 0, 0]);

    let (decoded, _) = Packet::from_bytes(&buf).unwrap();
    assert_eq!(decoded.version, Version::V4);
    assert_eq!(decoded.mode, Mode::Client);
    assert_eq!(decoded.transmit_timestamp, pkt.transmit_timestamp);
    // Stratum 0 re-interprets the zero reference id as a (blank) kiss code;
    // the wire bytes are identical either way.
    let mut out = [0u8; 48];
    decoded.to_bytes(&mut out).unwrap();
    assert_eq!(out, buf);
}

#[test]
fn serialize_parse_identity_on_crafted_buffers() {
    // A handful of adversarial buffers: KoD, unsynchronized, reserved
    // stratum, garbage reference ids. parse ∘ serialize must be identity.
    let mut cases: Vec<[u8; 48]> = Vec::new();

    let mut kod = [0u8; 48];
    kod[0] = 0xE4; // LI=3 VN=4 Mode=4
    kod[12..16].copy_from_slice(b"RATE");
    cases.push(kod);

    let mut unsync = [0u8; 48];
    unsync[0] = 0xDC; // LI=3 VN=3 Mode=4
    unsync[1] = 16;
    unsync[12..16].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    cases.push(unsync);

    let mut reserved = [0xAAu8; 48];
    reserved[1] = 200; // reserved stratum
    cases.push(reserved);

    for case in cases {
        let (pkt, consumed) = Packet::from_bytes(&case).unwrap();
        assert_eq!(consumed, 48);
        let mut out = [0u8; 48];
        pkt.to_bytes(&mut out).unwrap();
        assert_eq!(out, case);
    }
}

#[test]
fn kiss_code_accessors() {
    let mut pkt = client_request(Version::V4, 1);
    pkt.stratum = Stratum(2);

    assert_eq!(pkt.kiss_code(), None);

    pkt.set_kiss_code(KissCode::new("DENY").unwrap());
    assert_eq!(pkt.stratum, Stratum::UNSPECIFIED);
    assert_eq!(pkt.kiss_code().unwrap().to_string(), "DENY");

    let mut buf = [0u8; 48];
    pkt.to_bytes(&mut buf).unwrap();
    assert_eq!(&buf[12..16], b"DENY");
}

#[test]
fn kiss_code_rejects_bad_lengths() {
    assert!(KissCode::new("").is_err());
    assert!(KissCode::new("NO").is_err());
    assert!(KissCode::new("TOOLONG").is_err());
    assert!(KissCode::new("STEP").is_ok());
}

#[test]
fn reference_id_roundtrips_through_stratum_change() {
    // The same 4 bytes mean different things at different strata but must
    // serialize identically.
    let bytes = *b"GPS\0";
    for stratum in [Stratum(0), Stratum(1), Stratum(2), Stratum(16)] {
        let refid = ReferenceIdentifier::from_bytes_with_stratum(bytes, stratum);
        assert_eq!(refid.as_bytes(), bytes);
    }
}

#[test]
fn leap_indicator_values() {
    assert_eq!(LeapIndicator::NoWarning as u8, 0);
    assert_eq!(LeapIndicator::AddOne as u8, 1);
    assert_eq!(LeapIndicator::SubOne as u8, 2);
    assert_eq!(LeapIndicator::Unknown as u8, 3);
}

#[test]
fn vanilla_transmit_time_decodes_near_now() {
    let now = unix_time::Instant::now();
    let ts: TimestampFormat = now.into();
    let back = unix_time::timestamp_to_instant(ts, &now);
    assert_eq!(back.secs(), now.secs());
}

#[test]
fn short_format_is_16_16_fixed_point() {
    let sf = ShortFormat::from_millis(1500.0);
    // 1.5 s → seconds 1, fraction 0x8000.
    assert_eq!(sf.seconds, 1);
    assert_eq!(sf.fraction, 0x8000);
    assert_eq!(ShortFormat::PACKED_SIZE_BYTES, 4);
}
