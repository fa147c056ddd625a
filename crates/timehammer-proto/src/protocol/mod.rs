//! Types and constants that precisely match the RFC 5905 packet header.
//!
//! Two codec layers are provided. [`FromBytes`]/[`ToBytes`] operate directly
//! on byte slices and are used on the server hot path. [`ReadBytes`] and
//! [`WriteBytes`] extend the byteorder crate `ReadBytesExt`/`WriteBytesExt`
//! traits for reader/writer call sites. Both produce identical bytes.
//!
//! Documentation is partly derived from IETF RFC 5905 and RFC 4330.

/// NTP port number.
pub const PORT: u16 = 123;

/// Maximum stratum number; 16 is advertised by an unsynchronized server.
pub const MAXSTRAT: u8 = 16;

mod bytes;
mod io;
mod traits;
mod types;

pub use self::traits::*;
pub use self::types::*;
