//! The TimeHammer server core: an RFC 5905 NTP/SNTPv4 server built for
//! offensive security testing of time-dependent clients.
//!
//! The core is four cooperating pieces around the wire codec from
//! `timehammer-proto`:
//!
//! - [`server::NtpServer`] — the UDP request engine: reader task, per-
//!   datagram workers, active-client sweeper, statistics.
//! - [`upstream::UpstreamTracker`] — keeps a synchronization snapshot
//!   against the configured public time sources.
//! - [`attacks::AttackEngine`] — the single-active-attack mutation stage
//!   applied to responses before transmission.
//! - [`logger::EventLog`] and [`session::SessionRecorder`] — the
//!   observability surfaces a UI or exporter consumes.
//!
//! All of them are explicitly-owned collaborators wired together at
//! startup; there are no global singletons. The server never disciplines
//! the host clock.

#![warn(missing_docs)]

pub mod attacks;
pub mod config;
pub mod error;
pub mod logger;
pub mod session;
pub mod stats;
pub mod upstream;

mod response;
mod server;
mod validation;

pub use server::NtpServer;
