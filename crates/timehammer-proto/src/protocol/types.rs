use core::fmt;
use std::net::Ipv4Addr;

use super::ConstPackedSizeBytes;
use crate::error::ParseError;

/// **NTP Short Format** - Used in the root delay and root dispersion header
/// fields. A 16-bit unsigned seconds field and a 16-bit fraction field
/// (16.16 fixed point).
///
/// ### Layout
///
/// ```ignore
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Seconds              |           Fraction            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ShortFormat {
    /// Seconds component (16-bit unsigned).
    pub seconds: u16,
    /// Fractional seconds component (16-bit unsigned).
    pub fraction: u16,
}

impl ShortFormat {
    /// Build a short-format value from a duration in milliseconds.
    ///
    /// Used to derive the response root delay from the measured upstream
    /// round trip. Saturates at the 16.16 maximum (~65536 s).
    pub fn from_millis(ms: f64) -> Self {
        let fixed = (ms.max(0.0) / 1000.0 * 65536.0) as u64;
        let fixed = fixed.min(u32::MAX as u64) as u32;
        ShortFormat {
            seconds: (fixed >> 16) as u16,
            fraction: (fixed & 0xFFFF) as u16,
        }
    }
}

/// **NTP Timestamp Format** - Used in the four packet header timestamps.
/// A 32-bit unsigned seconds field spanning 136 years and a 32-bit fraction
/// field resolving ~232 picoseconds.
///
/// The prime epoch is 0 h 1 January 1900 UTC, when all bits are zero. The
/// seconds field wraps every 2^32 seconds; era 1 begins 2036-02-07T06:28:16Z.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimestampFormat {
    /// Seconds since 1900-01-01 00:00:00 UTC (32-bit unsigned, era-relative).
    pub seconds: u32,
    /// Fractional seconds (32-bit unsigned).
    pub fraction: u32,
}

impl TimestampFormat {
    /// Whether both fields are zero (the unset marker in RFC 5905).
    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }
}

/// A 2-bit integer warning of an impending leap second to be inserted or
/// deleted in the last minute of the current month.
///
/// `Unknown` (3) doubles as the alarm condition: clock not synchronized.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum LeapIndicator {
    /// No leap second pending.
    #[default]
    NoWarning = 0,
    /// Last minute of the day has 61 seconds.
    AddOne = 1,
    /// Last minute of the day has 59 seconds.
    SubOne = 2,
    /// Alarm condition (clock unsynchronized).
    Unknown = 3,
}

impl TryFrom<u8> for LeapIndicator {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LeapIndicator::NoWarning),
            1 => Ok(LeapIndicator::AddOne),
            2 => Ok(LeapIndicator::SubOne),
            3 => Ok(LeapIndicator::Unknown),
            _ => Err(()),
        }
    }
}

/// A 3-bit integer representing the NTP version number.
///
/// The raw value is kept as-is: the fuzzing attack deliberately emits
/// versions outside the valid range and they must serialize unchanged.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(pub(super) u8);

impl Version {
    /// NTP version 3 (RFC 1305).
    pub const V3: Self = Version(3);
    /// NTP version 4, the current standard (RFC 5905).
    pub const V4: Self = Version(4);

    /// Create a `Version` from a raw 3-bit value (masked to 0-7).
    pub fn from_raw(v: u8) -> Self {
        Version(v & 0b111)
    }

    /// Returns the raw version number as a `u8`.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether this is a version the server responds to (3 or 4).
    pub fn is_supported(&self) -> bool {
        *self == Version::V3 || *self == Version::V4
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::V4
    }
}

/// A 3-bit integer representing the association mode.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum Mode {
    /// Reserved mode (value 0).
    Reserved = 0,
    /// Symmetric active mode (value 1).
    SymmetricActive = 1,
    /// Symmetric passive mode (value 2).
    SymmetricPassive = 2,
    /// Client mode (value 3).
    #[default]
    Client = 3,
    /// Server mode (value 4).
    Server = 4,
    /// Broadcast mode (value 5).
    Broadcast = 5,
    /// NTP control message mode (value 6).
    Control = 6,
    /// Reserved for private use (value 7).
    Private = 7,
}

impl Mode {
    /// Human-readable mode name, used in fingerprints and session decodes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Reserved => "Reserved",
            Mode::SymmetricActive => "Symmetric Active",
            Mode::SymmetricPassive => "Symmetric Passive",
            Mode::Client => "Client",
            Mode::Server => "Server",
            Mode::Broadcast => "Broadcast",
            Mode::Control => "Control",
            Mode::Private => "Private",
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Reserved),
            1 => Ok(Mode::SymmetricActive),
            2 => Ok(Mode::SymmetricPassive),
            3 => Ok(Mode::Client),
            4 => Ok(Mode::Server),
            5 => Ok(Mode::Broadcast),
            6 => Ok(Mode::Control),
            7 => Ok(Mode::Private),
            _ => Err(()),
        }
    }
}

/// An 8-bit integer representing the stratum.
///
/// ```ignore
/// +--------+-----------------------------------------------------+
/// | Value  | Meaning                                             |
/// +--------+-----------------------------------------------------+
/// | 0      | unspecified or invalid (Kiss-o'-Death)              |
/// | 1      | primary server (e.g., equipped with a GPS receiver) |
/// | 2-15   | secondary server (via NTP)                          |
/// | 16     | unsynchronized                                      |
/// | 17-255 | reserved                                            |
/// +--------+-----------------------------------------------------+
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Stratum(pub u8);

impl Stratum {
    /// Unspecified or invalid; marks a Kiss-o'-Death packet.
    pub const UNSPECIFIED: Self = Stratum(0);
    /// A primary server with direct access to a reference clock.
    pub const PRIMARY: Self = Stratum(1);
    /// The minimum value specifying a secondary server (via NTP).
    pub const SECONDARY_MIN: Self = Stratum(2);
    /// The maximum value specifying a secondary server (via NTP).
    pub const SECONDARY_MAX: Self = Stratum(15);
    /// Advertised by a server that has lost all its time sources.
    pub const UNSYNCHRONIZED: Self = Stratum(16);

    /// Whether or not the stratum represents a secondary server.
    pub fn is_secondary(&self) -> bool {
        Self::SECONDARY_MIN <= *self && *self <= Self::SECONDARY_MAX
    }
}

/// A 4-character ASCII kiss code, carried in the reference identifier of a
/// stratum-0 (Kiss-o'-Death) packet.
///
/// RFC 5905 Section 7.4 registers the well-known codes below, but the field
/// is just four ASCII bytes on the wire and the attack engine may be
/// configured with any code, so the raw bytes are preserved.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KissCode(pub [u8; 4]);

impl KissCode {
    /// The association belongs to an anycast server.
    pub const ACST: Self = KissCode(*b"ACST");
    /// Server authentication failed.
    pub const AUTH: Self = KissCode(*b"AUTH");
    /// Autokey sequence failed.
    pub const AUTO: Self = KissCode(*b"AUTO");
    /// The association belongs to a broadcast server.
    pub const BCST: Self = KissCode(*b"BCST");
    /// Cryptographic authentication or identification failed.
    pub const CRYP: Self = KissCode(*b"CRYP");
    /// Access denied by remote server.
    pub const DENY: Self = KissCode(*b"DENY");
    /// Lost peer in symmetric mode.
    pub const DROP: Self = KissCode(*b"DROP");
    /// Access denied due to local policy.
    pub const RSTR: Self = KissCode(*b"RSTR");
    /// The association has not yet synchronized for the first time.
    pub const INIT: Self = KissCode(*b"INIT");
    /// The association belongs to a dynamically discovered server.
    pub const MCST: Self = KissCode(*b"MCST");
    /// No key found.
    pub const NKEY: Self = KissCode(*b"NKEY");
    /// Rate exceeded; the client must back off.
    pub const RATE: Self = KissCode(*b"RATE");
    /// Alteration of association from a remote host.
    pub const RMOT: Self = KissCode(*b"RMOT");
    /// A step change in system time has occurred.
    pub const STEP: Self = KissCode(*b"STEP");

    /// Build a kiss code from a string, which must be exactly 4 ASCII
    /// characters.
    pub fn new(code: &str) -> Result<Self, ParseError> {
        let bytes = code.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii()) {
            return Err(ParseError::InvalidKissCode);
        }
        Ok(KissCode([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// The raw 4-byte representation.
    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for KissCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b == 0 {
                break;
            }
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "?")?;
            }
        }
        Ok(())
    }
}

/// A 32-bit code identifying the particular server or reference clock.
///
/// The interpretation depends on the value in the stratum field:
///
/// - Stratum 0 (unspecified or invalid): a four-character ASCII kiss code
///   (Kiss-o'-Death, RFC 5905 Section 7.4).
/// - Stratum 1 (primary): a four-octet, left-justified, zero-padded ASCII
///   source tag assigned to the reference clock (e.g. `GPS\0`).
/// - Stratum 2-15 (secondary): the IPv4 address of the synchronization
///   source, in network byte order.
/// - Stratum 16+ (unsynchronized/reserved): opaque.
///
/// All variants preserve the exact wire bytes so that re-serializing a
/// parsed packet is lossless.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ReferenceIdentifier {
    /// Kiss-o'-Death code (stratum 0).
    KissOfDeath(KissCode),
    /// Primary reference source tag (stratum 1), e.g. `GPS\0`, `PPS\0`.
    SourceTag([u8; 4]),
    /// IPv4 address of the synchronization source (stratum 2-15).
    ServerAddress([u8; 4]),
    /// Opaque bytes (stratum 16+ or reserved).
    Unknown([u8; 4]),
}

impl ReferenceIdentifier {
    /// Returns the raw 4-byte representation of the reference identifier.
    pub fn as_bytes(&self) -> [u8; 4] {
        match *self {
            ReferenceIdentifier::KissOfDeath(code) => code.as_bytes(),
            ReferenceIdentifier::SourceTag(arr) => arr,
            ReferenceIdentifier::ServerAddress(arr) => arr,
            ReferenceIdentifier::Unknown(arr) => arr,
        }
    }

    /// Returns true if this is a Kiss-o'-Death reference identifier.
    pub fn is_kiss_of_death(&self) -> bool {
        matches!(self, ReferenceIdentifier::KissOfDeath(_))
    }

    /// Construct a reference identifier from an IPv4 address.
    ///
    /// For stratum 2+ servers the reference identifier is the upstream
    /// server's IPv4 address in network byte order (RFC 5905 Section 7.3).
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        ReferenceIdentifier::ServerAddress(addr.octets())
    }

    /// Parse a reference identifier from 4 bytes, using stratum for
    /// disambiguation.
    pub fn from_bytes_with_stratum(bytes: [u8; 4], stratum: Stratum) -> Self {
        if stratum == Stratum::UNSPECIFIED {
            ReferenceIdentifier::KissOfDeath(KissCode(bytes))
        } else if stratum == Stratum::PRIMARY {
            ReferenceIdentifier::SourceTag(bytes)
        } else if stratum.is_secondary() {
            ReferenceIdentifier::ServerAddress(bytes)
        } else {
            ReferenceIdentifier::Unknown(bytes)
        }
    }
}

impl Default for ReferenceIdentifier {
    /// Defaults to `Unknown([0; 4])` (unset reference identifier).
    fn default() -> Self {
        ReferenceIdentifier::Unknown([0; 4])
    }
}

impl fmt::Display for ReferenceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ReferenceIdentifier::KissOfDeath(code) => write!(f, "{}", code),
            ReferenceIdentifier::SourceTag(arr) => write!(f, "{}", KissCode(arr)),
            ReferenceIdentifier::ServerAddress([a, b, c, d]) => {
                write!(f, "{}.{}.{}.{}", a, b, c, d)
            }
            ReferenceIdentifier::Unknown(arr) => {
                write!(f, "{:02x}{:02x}{:02x}{:02x}", arr[0], arr[1], arr[2], arr[3])
            }
        }
    }
}

/// **Packet Header** - The 48-byte NTP packet header of RFC 5905 Section 7.3.
///
/// The header consists of 12 32-bit words in network byte order. Optional
/// extension fields and MACs may follow on the wire; this server ignores
/// them on input and never emits them.
///
/// ```ignore
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |LI | VN  |Mode |    Stratum     |     Poll      |  Precision   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Root Delay                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Root Dispersion                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Reference ID                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Reference Timestamp (64)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Origin Timestamp (64)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Receive Timestamp (64)                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Transmit Timestamp (64)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Packet {
    /// Leap indicator warning of impending leap second.
    pub leap_indicator: LeapIndicator,
    /// NTP protocol version number.
    pub version: Version,
    /// Association mode (client, server, broadcast, etc.).
    pub mode: Mode,
    /// Stratum level of the time source.
    pub stratum: Stratum,
    /// Maximum interval between successive messages, in log2 seconds.
    pub poll: i8,
    /// Precision of the system clock, in log2 seconds (-20 is ~1 us).
    pub precision: i8,
    /// Total round-trip delay to the reference clock.
    pub root_delay: ShortFormat,
    /// Total dispersion to the reference clock.
    pub root_dispersion: ShortFormat,
    /// Reference identifier (kiss code, source tag, or server address).
    pub reference_id: ReferenceIdentifier,
    /// Time when the system clock was last set or corrected.
    pub reference_timestamp: TimestampFormat,
    /// Time at the client when the request departed for the server.
    pub origin_timestamp: TimestampFormat,
    /// Time at the server when the request arrived from the client.
    pub receive_timestamp: TimestampFormat,
    /// Time at the server when the response left for the client.
    pub transmit_timestamp: TimestampFormat,
}

/// The consecutive types within the first packed byte in the NTP packet.
pub type PacketByte1 = (LeapIndicator, Version, Mode);

impl Packet {
    /// Whether this packet is a request this server responds to:
    /// client mode (3) with version 3 or 4.
    pub fn is_valid_client_request(&self) -> bool {
        self.mode == Mode::Client && self.version.is_supported()
    }

    /// Turn this packet into a Kiss-o'-Death: stores the code in the
    /// reference identifier and forces stratum 0.
    pub fn set_kiss_code(&mut self, code: KissCode) {
        self.stratum = Stratum::UNSPECIFIED;
        self.reference_id = ReferenceIdentifier::KissOfDeath(code);
    }

    /// The kiss code carried in the reference identifier, if this is a
    /// stratum-0 packet.
    pub fn kiss_code(&self) -> Option<KissCode> {
        if self.stratum != Stratum::UNSPECIFIED {
            return None;
        }
        Some(KissCode(self.reference_id.as_bytes()))
    }

    /// Human-readable mode name.
    pub fn mode_str(&self) -> &'static str {
        self.mode.as_str()
    }
}

impl Default for Packet {
    /// Defaults to a valid NTPv4 client request template with all timestamp
    /// and delay fields zeroed. Set `transmit_timestamp` before sending.
    fn default() -> Self {
        Packet {
            leap_indicator: LeapIndicator::default(),
            version: Version::default(),
            mode: Mode::default(),
            stratum: Stratum::default(),
            poll: 0,
            precision: 0,
            root_delay: ShortFormat::default(),
            root_dispersion: ShortFormat::default(),
            reference_id: ReferenceIdentifier::default(),
            reference_timestamp: TimestampFormat::default(),
            origin_timestamp: TimestampFormat::default(),
            receive_timestamp: TimestampFormat::default(),
            transmit_timestamp: TimestampFormat::default(),
        }
    }
}

// Size implementations.

impl ConstPackedSizeBytes for ShortFormat {
    const PACKED_SIZE_BYTES: usize = 4;
}

impl ConstPackedSizeBytes for TimestampFormat {
    const PACKED_SIZE_BYTES: usize = 8;
}

impl ConstPackedSizeBytes for Stratum {
    const PACKED_SIZE_BYTES: usize = 1;
}

impl ConstPackedSizeBytes for ReferenceIdentifier {
    const PACKED_SIZE_BYTES: usize = 4;
}

impl ConstPackedSizeBytes for PacketByte1 {
    const PACKED_SIZE_BYTES: usize = 1;
}

impl ConstPackedSizeBytes for Packet {
    const PACKED_SIZE_BYTES: usize = PacketByte1::PACKED_SIZE_BYTES
        + Stratum::PACKED_SIZE_BYTES
        + 2
        + ShortFormat::PACKED_SIZE_BYTES * 2
        + ReferenceIdentifier::PACKED_SIZE_BYTES
        + TimestampFormat::PACKED_SIZE_BYTES * 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_size_is_48() {
        assert_eq!(Packet::PACKED_SIZE_BYTES, 48);
    }

    #[test]
    fn kiss_code_new_valid() {
        let code = KissCode::new("DENY").unwrap();
        assert_eq!(code, KissCode::DENY);
        assert_eq!(code.to_string(), "DENY");
    }

    #[test]
    fn kiss_code_new_wrong_length() {
        assert_eq!(KissCode::new("DEN").unwrap_err(), ParseError::InvalidKissCode);
        assert_eq!(
            KissCode::new("DENYX").unwrap_err(),
            ParseError::InvalidKissCode
        );
    }

    #[test]
    fn kiss_code_new_non_ascii() {
        assert_eq!(KissCode::new("DÉNY").unwrap_err(), ParseError::InvalidKissCode);
    }

    #[test]
    fn set_kiss_code_forces_stratum_zero() {
        let mut pkt = Packet {
            stratum: Stratum(2),
            ..Packet::default()
        };
        pkt.set_kiss_code(KissCode::RATE);
        assert_eq!(pkt.stratum, Stratum::UNSPECIFIED);
        assert_eq!(pkt.kiss_code(), Some(KissCode::RATE));
    }

    #[test]
    fn kiss_code_none_when_stratum_nonzero() {
        let pkt = Packet {
            stratum: Stratum(2),
            reference_id: ReferenceIdentifier::ServerAddress([10, 0, 0, 1]),
            ..Packet::default()
        };
        assert_eq!(pkt.kiss_code(), None);
    }

    #[test]
    fn valid_client_request_v3_and_v4() {
        for vn in [Version::V3, Version::V4] {
            let pkt = Packet {
                version: vn,
                mode: Mode::Client,
                ..Packet::default()
            };
            assert!(pkt.is_valid_client_request());
        }
    }

    #[test]
    fn invalid_client_request_wrong_mode_or_version() {
        let pkt = Packet {
            mode: Mode::Server,
            ..Packet::default()
        };
        assert!(!pkt.is_valid_client_request());

        let pkt = Packet {
            version: Version::from_raw(2),
            mode: Mode::Client,
            ..Packet::default()
        };
        assert!(!pkt.is_valid_client_request());
    }

    #[test]
    fn reference_id_display_forms() {
        let kod = ReferenceIdentifier::KissOfDeath(KissCode::DENY);
        assert_eq!(kod.to_string(), "DENY");

        let tag = ReferenceIdentifier::SourceTag(*b"GPS\0");
        assert_eq!(tag.to_string(), "GPS");

        let addr = ReferenceIdentifier::ServerAddress([216, 239, 35, 0]);
        assert_eq!(addr.to_string(), "216.239.35.0");
    }

    #[test]
    fn short_format_from_millis() {
        // 1000 ms is exactly one second: 0x0001_0000 in 16.16.
        let sf = ShortFormat::from_millis(1000.0);
        assert_eq!(sf.seconds, 1);
        assert_eq!(sf.fraction, 0);

        // 10 ms nominal dispersion: 0.01 * 65536 = 655.36.
        let sf = ShortFormat::from_millis(10.0);
        assert_eq!(sf.seconds, 0);
        assert_eq!(sf.fraction, 655);
    }

    #[test]
    fn short_format_from_millis_negative_clamps() {
        let sf = ShortFormat::from_millis(-5.0);
        assert_eq!(sf, ShortFormat::default());
    }

    #[test]
    fn mode_strings_match_wire_names() {
        assert_eq!(Mode::Client.as_str(), "Client");
        assert_eq!(Mode::Server.as_str(), "Server");
        assert_eq!(Mode::Control.as_str(), "Control");
    }
}
