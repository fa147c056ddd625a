//! Request construction, response validation, and offset/delay math.
//!
//! The async transaction in [`crate::async_ntp`] reuses the packet-building
//! and validation helpers defined here; they are pure computation and are
//! unit-tested against fixed timestamp fixtures.

use std::io;
use std::net::SocketAddr;
use std::ops::Deref;

use crate::protocol::{self, ConstPackedSizeBytes, ReadBytes, WriteBytes};
use crate::unix_time;

/// Error returned when the server responds with a Kiss-o'-Death (KoD) packet.
///
/// Per RFC 5905 Section 7.4, recipients of kiss codes MUST inspect them and
/// act on them: DENY/RSTR mean stop querying this server, RATE means back
/// off. This error is carried as the inner error of an [`io::Error`] with
/// kind [`io::ErrorKind::ConnectionRefused`] and can be extracted via
/// [`io::Error::get_ref`] and `downcast_ref`.
#[derive(Clone, Copy, Debug)]
pub struct KissOfDeathError {
    /// The kiss code received from the server.
    pub code: protocol::KissCode,
}

impl std::fmt::Display for KissOfDeathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server sent Kiss-o'-Death {}", self.code)
    }
}

impl std::error::Error for KissOfDeathError {}

/// The result of an NTP request: the server's response packet along with
/// computed timing information.
///
/// Implements `Deref<Target = protocol::Packet>`, so packet fields can be
/// read directly (e.g. `result.stratum`).
#[derive(Clone, Copy, Debug)]
pub struct NtpResult {
    /// The parsed NTP response packet from the server.
    pub packet: protocol::Packet,
    /// Address the response actually came from; the upstream tracker uses
    /// its IPv4 form as the advertised reference identifier.
    pub server_addr: SocketAddr,
    /// The destination timestamp (T4): local time when the response arrived.
    pub destination_timestamp: protocol::TimestampFormat,
    /// Clock offset in seconds: `((T2 - T1) + (T3 - T4)) / 2`.
    ///
    /// Positive means the local clock is behind the server.
    pub offset_seconds: f64,
    /// Round-trip delay in seconds: `(T4 - T1) - (T3 - T2)`.
    pub delay_seconds: f64,
}

impl Deref for NtpResult {
    type Target = protocol::Packet;
    fn deref(&self) -> &Self::Target {
        &self.packet
    }
}

/// Compute clock offset and round-trip delay from the four NTP timestamps.
pub(crate) fn compute_offset_delay(
    t1: &unix_time::Instant,
    t2: &unix_time::Instant,
    t3: &unix_time::Instant,
    t4: &unix_time::Instant,
) -> (f64, f64) {
    let t1 = t1.as_secs_f64();
    let t2 = t2.as_secs_f64();
    let t3 = t3.as_secs_f64();
    let t4 = t4.as_secs_f64();
    let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
    let delay = (t4 - t1) - (t3 - t2);
    (offset, delay)
}

/// Build an NTPv4 client request packet and serialize it.
///
/// Returns the serialized buffer and the origin timestamp (T1).
pub(crate) fn build_request_packet() -> io::Result<(
    [u8; protocol::Packet::PACKED_SIZE_BYTES],
    protocol::TimestampFormat,
)> {
    let packet = protocol::Packet {
        transmit_timestamp: unix_time::Instant::now().into(),
        ..protocol::Packet::default()
    };
    let t1 = packet.transmit_timestamp;
    let mut send_buf = [0u8; protocol::Packet::PACKED_SIZE_BYTES];
    (&mut send_buf[..]).write_bytes(packet)?;
    Ok((send_buf, t1))
}

/// Validate and parse an NTP server response.
///
/// Records T4 immediately, then checks source IP, minimum size, server
/// mode, Kiss-o'-Death codes, non-zero transmit, transmit >= receive, and
/// the origin echo (anti-replay: the response's origin timestamp must be
/// byte-equal to the T1 we sent). On success computes offset and delay.
pub(crate) fn validate_response(
    recv_buf: &[u8],
    recv_len: usize,
    src_addr: SocketAddr,
    resolved_addrs: &[SocketAddr],
    t1: &protocol::TimestampFormat,
) -> io::Result<NtpResult> {
    let t4_instant = unix_time::Instant::now();
    let t4: protocol::TimestampFormat = t4_instant.into();

    // IP only; the reply port may differ from 123 behind some NATs.
    if !resolved_addrs.iter().any(|a| a.ip() == src_addr.ip()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response from unexpected source address",
        ));
    }

    if recv_len < protocol::Packet::PACKED_SIZE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "NTP response too short",
        ));
    }

    // Parse the first 48 bytes; extension fields and MACs are ignored.
    let response: protocol::Packet =
        (&recv_buf[..protocol::Packet::PACKED_SIZE_BYTES]).read_bytes()?;

    if response.mode != protocol::Mode::Server {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected response mode (expected Server)",
        ));
    }

    // Enforce Kiss-o'-Death codes (RFC 5905 Section 7.4).
    if let protocol::ReferenceIdentifier::KissOfDeath(code) = response.reference_id {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            KissOfDeathError { code },
        ));
    }

    if response.transmit_timestamp.is_zero() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "server transmit timestamp is zero",
        ));
    }

    // A server that receives after it transmits is lying about something.
    if response.transmit_timestamp < response.receive_timestamp {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "server transmit timestamp precedes receive timestamp",
        ));
    }

    if response.origin_timestamp != *t1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "origin timestamp mismatch: response does not match our request",
        ));
    }

    let t1_instant = unix_time::timestamp_to_instant(*t1, &t4_instant);
    let t2_instant = unix_time::timestamp_to_instant(response.receive_timestamp, &t4_instant);
    let t3_instant = unix_time::timestamp_to_instant(response.transmit_timestamp, &t4_instant);

    let (offset_seconds, delay_seconds) =
        compute_offset_delay(&t1_instant, &t2_instant, &t3_instant, &t4_instant);

    Ok(NtpResult {
        packet: response,
        server_addr: src_addr,
        destination_timestamp: t4,
        offset_seconds,
        delay_seconds,
    })
}
