//! The upstream tracker: periodically queries the configured upstream NTP
//! servers and maintains the synchronization snapshot the request engine
//! serves from.
//!
//! The snapshot is a single value with one writer (the tracker task);
//! readers clone it. A sync cycle walks the enabled upstreams in priority
//! order and the first validated response wins; when every server fails the
//! snapshot degrades to unsynchronized and the server advertises stratum 16
//! with the leap-alarm bit until a later cycle succeeds.

use chrono::{DateTime, Utc};
use log::debug;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use timehammer_client::async_ntp;
use timehammer_proto::protocol::{ReferenceIdentifier, Stratum};
use timehammer_proto::unix_time;

use crate::config::Config;
use crate::logger::EventLog;
use crate::session::SessionRecorder;

/// Point-in-time upstream synchronization state.
#[derive(Clone, Debug)]
pub struct SyncStatus {
    /// Whether the last sync cycle succeeded.
    pub synchronized: bool,
    /// Address of the upstream that answered.
    pub active_server: String,
    /// Stratum reported by that upstream.
    pub stratum: u8,
    /// Measured clock offset against that upstream, in seconds.
    pub offset_seconds: f64,
    /// Measured round trip to that upstream.
    pub rtt: Duration,
    /// When the last successful sync completed.
    pub last_sync: Option<DateTime<Utc>>,
    /// Why the last cycle failed, when it did.
    pub last_error: Option<String>,
    /// IPv4 address of the active upstream, advertised as our reference id.
    pub reference_ip: Option<Ipv4Addr>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            synchronized: false,
            active_server: String::new(),
            stratum: 0,
            offset_seconds: 0.0,
            rtt: Duration::ZERO,
            last_sync: None,
            last_error: None,
            reference_ip: None,
        }
    }
}

/// Tracks upstream time sources on a background task.
pub struct UpstreamTracker {
    cfg: Arc<RwLock<Config>>,
    log: Arc<EventLog>,
    recorder: Arc<SessionRecorder>,
    status: RwLock<SyncStatus>,
    wakeup: Notify,
}

impl UpstreamTracker {
    /// Create a tracker over the shared configuration.
    pub fn new(
        cfg: Arc<RwLock<Config>>,
        log: Arc<EventLog>,
        recorder: Arc<SessionRecorder>,
    ) -> UpstreamTracker {
        UpstreamTracker {
            cfg,
            log,
            recorder,
            status: RwLock::new(SyncStatus::default()),
            wakeup: Notify::new(),
        }
    }

    /// Run the sync loop until shutdown: an immediate cycle, then one per
    /// `sync_interval`, plus any cycles requested via [`force_sync`].
    ///
    /// [`force_sync`]: UpstreamTracker::force_sync
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.sync_now().await;

        loop {
            let interval = {
                let cfg = self.cfg.read().expect("config lock poisoned");
                Duration::from_secs(cfg.upstream.sync_interval.max(1))
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.sync_now().await,
                _ = self.wakeup.notified() => self.sync_now().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("upstream tracker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Request an immediate sync cycle from the tracker task.
    pub fn force_sync(&self) {
        self.wakeup.notify_one();
    }

    /// One full sync cycle: first validated upstream wins.
    async fn sync_now(&self) {
        let (servers, timeout, retries) = {
            let cfg = self.cfg.read().expect("config lock poisoned");
            (
                cfg.active_upstreams(),
                Duration::from_secs(cfg.upstream.timeout.max(1)),
                cfg.upstream.retries.max(1),
            )
        };

        if servers.is_empty() {
            self.log
                .warn("UPSTREAM", "No upstream servers configured");
            let mut status = self.status.write().expect("sync status lock poisoned");
            status.synchronized = false;
            status.offset_seconds = 0.0;
            status.last_error = Some("No upstream servers configured".to_string());
            return;
        }

        for server in servers {
            let addr = format!("{}:{}", server.address, server.port);
            debug!("querying upstream server {}", addr);
            self.recorder.record_upstream_query(&addr);

            let result = self.query_server(&addr, timeout, retries).await;
            let result = match result {
                Ok(r) => r,
                Err(e) => {
                    self.log.warn(
                        "UPSTREAM",
                        format!("Failed to query {}: {}", addr, e),
                    );
                    self.log.log_upstream_request(&addr, false, 0.0, 0.0);
                    continue;
                }
            };

            // Plausible stratum only; a stratum-0 or unsynchronized
            // upstream is no better than none.
            let stratum = result.stratum;
            if stratum < Stratum::PRIMARY || stratum > Stratum::SECONDARY_MAX {
                self.log.warn(
                    "UPSTREAM",
                    format!("{} reports implausible stratum {}", addr, stratum.0),
                );
                self.log.log_upstream_request(&addr, false, 0.0, 0.0);
                continue;
            }

            let rtt = Duration::from_secs_f64(result.delay_seconds.max(0.0));
            let reference_ip = match result.server_addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped(),
            };

            {
                let mut status = self.status.write().expect("sync status lock poisoned");
                *status = SyncStatus {
                    synchronized: true,
                    active_server: server.address.clone(),
                    stratum: stratum.0,
                    offset_seconds: result.offset_seconds,
                    rtt,
                    last_sync: Some(Utc::now()),
                    last_error: None,
                    reference_ip,
                };
            }

            self.log.info(
                "UPSTREAM",
                format!(
                    "Synced with {} (stratum {}, offset {:.6}s, RTT {:.1}ms)",
                    server.address,
                    stratum.0,
                    result.offset_seconds,
                    rtt.as_secs_f64() * 1000.0
                ),
            );
            self.log.log_upstream_request(
                &addr,
                true,
                rtt.as_secs_f64() * 1000.0,
                result.offset_seconds,
            );
            return;
        }

        // Every upstream failed: degrade and discard the previous offset.
        {
            let mut status = self.status.write().expect("sync status lock poisoned");
            status.synchronized = false;
            status.offset_seconds = 0.0;
            status.reference_ip = None;
            status.last_error = Some("All upstream servers failed".to_string());
        }
        self.log
            .error("UPSTREAM", "Failed to sync with any upstream server");
    }

    /// Query one server with up to `retries` attempts.
    async fn query_server(
        &self,
        addr: &str,
        timeout: Duration,
        retries: u32,
    ) -> std::io::Result<timehammer_client::NtpResult> {
        let mut last_err = None;
        for _ in 0..retries {
            match async_ntp::request_with_timeout(addr, timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempts made")))
    }

    /// The current synchronization snapshot (a consistent copy).
    pub fn status(&self) -> SyncStatus {
        self.status.read().expect("sync status lock poisoned").clone()
    }

    /// The current best estimate of true time: local time corrected by the
    /// measured upstream offset, or plain local time when unsynchronized.
    pub fn current_time(&self) -> unix_time::Instant {
        let status = self.status.read().expect("sync status lock poisoned");
        let now = unix_time::Instant::now();
        if status.synchronized {
            now.add_secs_f64(status.offset_seconds)
        } else {
            now
        }
    }

    /// The stratum to advertise: upstream stratum + 1 (capped at 15), or 16
    /// when unsynchronized.
    pub fn reported_stratum(&self) -> Stratum {
        let status = self.status.read().expect("sync status lock poisoned");
        if !status.synchronized {
            return Stratum::UNSYNCHRONIZED;
        }
        Stratum((status.stratum + 1).min(15))
    }

    /// The reference identifier to advertise: the active upstream's IPv4
    /// address, or zero when unsynchronized.
    pub fn reference_id(&self) -> ReferenceIdentifier {
        let status = self.status.read().expect("sync status lock poisoned");
        match (status.synchronized, status.reference_ip) {
            (true, Some(ip)) => ReferenceIdentifier::from_ipv4(ip),
            _ => ReferenceIdentifier::Unknown([0; 4]),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_status_for_test(&self, status: SyncStatus) {
        *self.status.write().unwrap() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServer;
    use timehammer_proto::protocol::{
        ConstPackedSizeBytes, Mode, Packet, ReadBytes, TimestampFormat, WriteBytes,
    };
    use tokio::net::UdpSocket;

    fn make_tracker(servers: Vec<UpstreamServer>) -> Arc<UpstreamTracker> {
        let mut cfg = Config::default();
        cfg.upstream.servers = servers;
        cfg.upstream.timeout = 1;
        cfg.upstream.retries = 1;
        Arc::new(UpstreamTracker::new(
            Arc::new(RwLock::new(cfg)),
            Arc::new(EventLog::in_memory()),
            Arc::new(SessionRecorder::new(None)),
        ))
    }

    /// A loopback upstream answering one query at the given stratum.
    async fn spawn_upstream(stratum: u8) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, peer) = sock.recv_from(&mut buf).await.unwrap();
            let request: Packet = (&buf[..Packet::PACKED_SIZE_BYTES]).read_bytes().unwrap();
            let now: TimestampFormat = unix_time::Instant::now().into();
            let response = Packet {
                mode: Mode::Server,
                stratum: Stratum(stratum),
                reference_id: if stratum == 1 {
                    ReferenceIdentifier::SourceTag(*b"GPS\0")
                } else {
                    ReferenceIdentifier::ServerAddress([10, 0, 0, 1])
                },
                origin_timestamp: request.transmit_timestamp,
                receive_timestamp: now,
                transmit_timestamp: now,
                ..Packet::default()
            };
            let mut out = [0u8; 48];
            (&mut out[..]).write_bytes(response).unwrap();
            sock.send_to(&out, peer).await.unwrap();
        });
        addr
    }

    fn upstream_entry(addr: SocketAddr, priority: u32) -> UpstreamServer {
        UpstreamServer {
            address: addr.ip().to_string(),
            port: addr.port(),
            priority,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn sync_against_loopback_upstream() {
        let addr = spawn_upstream(1).await;
        let tracker = make_tracker(vec![upstream_entry(addr, 1)]);
        tracker.sync_now().await;

        let status = tracker.status();
        assert!(status.synchronized);
        assert_eq!(status.stratum, 1);
        assert!(status.last_error.is_none());
        assert!(status.last_sync.is_some());
        assert_eq!(status.reference_ip, Some(Ipv4Addr::new(127, 0, 0, 1)));

        // Upstream at stratum 1 means we serve at stratum 2 with its
        // address as the reference id.
        assert_eq!(tracker.reported_stratum(), Stratum(2));
        assert_eq!(
            tracker.reference_id(),
            ReferenceIdentifier::ServerAddress([127, 0, 0, 1])
        );
    }

    #[tokio::test]
    async fn all_upstreams_failing_degrades_to_unsynchronized() {
        // Point at a port that will not answer.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let tracker = make_tracker(vec![upstream_entry(dead, 1)]);

        // Pretend we were synchronized before.
        tracker.set_status_for_test(SyncStatus {
            synchronized: true,
            offset_seconds: 1.5,
            stratum: 2,
            ..SyncStatus::default()
        });

        tracker.sync_now().await;

        let status = tracker.status();
        assert!(!status.synchronized);
        // Previous offset discarded.
        assert_eq!(status.offset_seconds, 0.0);
        assert_eq!(
            status.last_error.as_deref(),
            Some("All upstream servers failed")
        );
        assert_eq!(tracker.reported_stratum(), Stratum::UNSYNCHRONIZED);
        assert_eq!(tracker.reference_id(), ReferenceIdentifier::Unknown([0; 4]));
    }

    #[tokio::test]
    async fn implausible_stratum_is_rejected() {
        let addr = spawn_upstream(0).await;
        let tracker = make_tracker(vec![upstream_entry(addr, 1)]);
        tracker.sync_now().await;
        assert!(!tracker.status().synchronized);
    }

    #[tokio::test]
    async fn no_servers_configured_sets_error() {
        let tracker = make_tracker(vec![]);
        tracker.sync_now().await;
        let status = tracker.status();
        assert!(!status.synchronized);
        assert_eq!(
            status.last_error.as_deref(),
            Some("No upstream servers configured")
        );
    }

    #[tokio::test]
    async fn reported_stratum_caps_at_fifteen() {
        let tracker = make_tracker(vec![]);
        tracker.set_status_for_test(SyncStatus {
            synchronized: true,
            stratum: 15,
            ..SyncStatus::default()
        });
        assert_eq!(tracker.reported_stratum(), Stratum(15));
    }

    #[tokio::test]
    async fn current_time_applies_offset() {
        let tracker = make_tracker(vec![]);
        tracker.set_status_for_test(SyncStatus {
            synchronized: true,
            offset_seconds: 100.0,
            stratum: 2,
            ..SyncStatus::default()
        });
        let corrected = tracker.current_time();
        let now = unix_time::Instant::now();
        let delta = corrected.secs() - now.secs();
        assert!((99..=101).contains(&delta), "expected ~100s, got {delta}");
    }
}
