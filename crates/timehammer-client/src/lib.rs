//! One-shot NTP client transactions.
//!
//! The TimeHammer upstream tracker uses this crate to query public time
//! sources: build an NTPv4 client request, send it over UDP, validate the
//! response per RFC 5905 Section 8, and compute clock offset and round-trip
//! delay from the four timestamps.

#![warn(missing_docs)]

pub use timehammer_proto::{error, protocol, unix_time};

mod request;

pub use request::{KissOfDeathError, NtpResult};

pub mod async_ntp;
