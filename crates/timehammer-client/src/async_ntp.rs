//! Async NTP client transaction on the Tokio runtime.
//!
//! Must be called from within a Tokio runtime context; this crate does not
//! create one.

use log::debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};

use crate::request::{build_request_packet, validate_response};
use crate::NtpResult;

/// Select the appropriate wildcard bind address for the target family.
fn bind_addr_for(target: &SocketAddr) -> &'static str {
    match target {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    }
}

/// Order resolved addresses IPv4-first.
///
/// The server advertises its upstream source as an IPv4 reference id
/// (RFC 5905 Section 7.3), so when a pool name resolves to both families we
/// query an IPv4 address by preference.
fn prefer_ipv4(mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs.sort_by_key(|a| match a {
        SocketAddr::V4(_) => 0,
        SocketAddr::V6(_) => 1,
    });
    addrs
}

/// Send a request to an NTP server with a configurable timeout.
///
/// Constructs an NTPv4 client-mode packet, sends it, and validates the
/// response per RFC 5905 Section 8. The timeout bounds the entire
/// transaction (DNS + send + receive).
pub async fn request_with_timeout<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
) -> io::Result<NtpResult> {
    tokio::time::timeout(timeout, request_inner(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "NTP request timed out"))?
}

/// Send a request with the conventional 5 second timeout.
pub async fn request<A: ToSocketAddrs>(addr: A) -> io::Result<NtpResult> {
    request_with_timeout(addr, Duration::from_secs(5)).await
}

async fn request_inner<A: ToSocketAddrs>(addr: A) -> io::Result<NtpResult> {
    let resolved_addrs: Vec<SocketAddr> = prefer_ipv4(lookup_host(addr).await?.collect());
    if resolved_addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address resolved to no socket addresses",
        ));
    }
    let target_addr = resolved_addrs[0];

    let (send_buf, t1) = build_request_packet()?;

    let sock = UdpSocket::bind(bind_addr_for(&target_addr)).await?;
    sock.send_to(&send_buf, target_addr).await?;
    debug!("sent NTP query to {}", target_addr);

    // Larger than 48 to accommodate responses carrying extension fields.
    let mut recv_buf = [0u8; 1024];
    let (recv_len, src_addr) = sock.recv_from(&mut recv_buf[..]).await?;
    debug!("recv: {} bytes from {}", recv_len, src_addr);

    validate_response(&recv_buf, recv_len, src_addr, &resolved_addrs, &t1)
}
