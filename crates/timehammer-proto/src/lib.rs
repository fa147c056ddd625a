//! NTP/SNTPv4 wire protocol support for the TimeHammer security-testing server.
//!
//! Provides the 48-byte RFC 5905 packet header as a typed record, total
//! slice-based and `byteorder`-based codecs for it, and conversion between
//! NTP timestamps (seconds since 1900) and Unix-epoch instants, including
//! era disambiguation across the 2036 boundary.
//!
//! Unlike a general-purpose NTP library, this crate must round-trip *any*
//! 48-byte datagram bit-exactly: the attack engine deliberately emits
//! packets with invalid versions, reserved modes, and nonsense timestamps,
//! and the session recorder stores what actually went on the wire.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;
pub mod unix_time;
