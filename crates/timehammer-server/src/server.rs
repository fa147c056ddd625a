//! The UDP request engine.
//!
//! One reader task pulls datagrams off the socket with a short deadline so
//! shutdown stays responsive; every datagram is handed to a fresh task for
//! processing. A sweeper task evicts idle clients from the active-client
//! table, and the upstream tracker runs its own sync loop. All tasks stop
//! on a shared watch-channel shutdown signal.

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant as StdInstant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use timehammer_proto::protocol::TimestampFormat;
use timehammer_proto::unix_time;

use crate::attacks::{AttackEngine, AttackKind};
use crate::config::{port_conflict_help, Config};
use crate::error::{ConfigError, ProtocolError, ServerError};
use crate::logger::{ClientFingerprint, EventLog};
use crate::response::{build_server_response, serialize_response_with_transmit, UpstreamView};
use crate::session::SessionRecorder;
use crate::stats::{ClientInfo, ServerStats, StatsSnapshot, CLIENT_STALE_AFTER};
use crate::upstream::{SyncStatus, UpstreamTracker};
use crate::validation::validate_client_request;

/// Socket read deadline; bounds how long shutdown can take.
const READ_DEADLINE: Duration = Duration::from_millis(500);

/// How often the sweeper evicts stale active-client entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a per-request task needs, cheap to clone.
#[derive(Clone)]
struct RequestContext {
    sock: Arc<UdpSocket>,
    cfg: Arc<RwLock<Config>>,
    log: Arc<EventLog>,
    recorder: Arc<SessionRecorder>,
    attack_engine: Arc<AttackEngine>,
    upstream: Arc<UpstreamTracker>,
    stats: Arc<ServerStats>,
}

struct RunState {
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// The NTP server. Collaborators are injected at construction; none of
/// them are global.
pub struct NtpServer {
    cfg: Arc<RwLock<Config>>,
    log: Arc<EventLog>,
    recorder: Arc<SessionRecorder>,
    attack_engine: Arc<AttackEngine>,
    upstream: Arc<UpstreamTracker>,
    stats: RwLock<Arc<ServerStats>>,
    running: AtomicBool,
    run_state: Mutex<Option<RunState>>,
}

impl NtpServer {
    /// Create a server over the shared configuration and collaborators.
    pub fn new(
        cfg: Arc<RwLock<Config>>,
        log: Arc<EventLog>,
        recorder: Arc<SessionRecorder>,
        attack_engine: Arc<AttackEngine>,
        upstream: Arc<UpstreamTracker>,
    ) -> NtpServer {
        let max_clients = cfg
            .read()
            .expect("config lock poisoned")
            .server
            .max_clients;
        NtpServer {
            cfg,
            log,
            recorder,
            attack_engine,
            upstream,
            stats: RwLock::new(Arc::new(ServerStats::new(max_clients))),
            running: AtomicBool::new(false),
            run_state: Mutex::new(None),
        }
    }

    /// Bind the socket and start the reader, sweeper, and upstream tracker
    /// tasks.
    ///
    /// Binding tries the configured port first; with
    /// `use_alt_port_on_fail` it retries once on `alt_port` before giving
    /// up with an OS-specific remediation hint in the event log.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let (interface, port, alt_port, use_alt, max_clients) = {
            let cfg = self.cfg.read().expect("config lock poisoned");
            (
                cfg.server.interface.clone(),
                cfg.server.port,
                cfg.server.alt_port,
                cfg.server.use_alt_port_on_fail,
                cfg.server.max_clients,
            )
        };

        let iface = if interface.is_empty() {
            "0.0.0.0"
        } else {
            interface.as_str()
        };

        let primary = format!("{iface}:{port}");
        let sock = match UdpSocket::bind(&primary).await {
            Ok(sock) => sock,
            Err(first_err) if use_alt => {
                self.log.warn(
                    "SERVER",
                    format!(
                        "Failed to bind to port {}, trying alt port {}: {}",
                        port, alt_port, first_err
                    ),
                );
                let fallback = format!("{iface}:{alt_port}");
                match UdpSocket::bind(&fallback).await {
                    Ok(sock) => sock,
                    Err(source) => {
                        self.log.error("SERVER", port_conflict_help(alt_port));
                        return Err(ServerError::Bind {
                            addr: format!("{primary} or {fallback}"),
                            source,
                        });
                    }
                }
            }
            Err(source) => {
                self.log.error("SERVER", port_conflict_help(port));
                return Err(ServerError::Bind {
                    addr: primary,
                    source,
                });
            }
        };

        let local_addr = sock.local_addr().map_err(ServerError::Io)?;
        let sock = Arc::new(sock);

        let stats = Arc::new(ServerStats::new(max_clients));
        *self.stats.write().expect("stats lock poisoned") = stats.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = RequestContext {
            sock: sock.clone(),
            cfg: self.cfg.clone(),
            log: self.log.clone(),
            recorder: self.recorder.clone(),
            attack_engine: self.attack_engine.clone(),
            upstream: self.upstream.clone(),
            stats: stats.clone(),
        };

        let tasks = vec![
            tokio::spawn(self.upstream.clone().run(shutdown_rx.clone())),
            tokio::spawn(reader_loop(ctx, shutdown_rx.clone())),
            tokio::spawn(sweeper_loop(stats, shutdown_rx)),
        ];

        *self.run_state.lock().expect("run state lock poisoned") = Some(RunState {
            shutdown_tx,
            local_addr,
            tasks,
        });
        self.running.store(true, Ordering::SeqCst);

        self.log
            .info("SERVER", format!("NTP server started on {}", local_addr));
        info!("NTP server listening on {}", local_addr);
        Ok(())
    }

    /// Signal shutdown and wait for the reader, sweeper, and tracker tasks
    /// to finish. The socket closes when the last task drops it.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let state = self
            .run_state
            .lock()
            .expect("run state lock poisoned")
            .take()
            .ok_or(ServerError::NotRunning)?;

        let _ = state.shutdown_tx.send(true);
        for task in state.tasks {
            let _ = task.await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.log.info("SERVER", "NTP server stopped");
        Ok(())
    }

    /// Whether the server is currently serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound socket address, while running.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.run_state
            .lock()
            .expect("run state lock poisoned")
            .as_ref()
            .map(|s| s.local_addr)
    }

    /// Snapshot of the runtime counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.read().expect("stats lock poisoned").snapshot()
    }

    /// The tracked active clients.
    pub fn active_clients(&self) -> Vec<ClientInfo> {
        self.stats
            .read()
            .expect("stats lock poisoned")
            .active_clients()
    }

    /// The upstream synchronization snapshot.
    pub fn upstream_status(&self) -> SyncStatus {
        self.upstream.status()
    }

    /// Ask the tracker for an immediate sync cycle.
    pub fn force_upstream_sync(&self) {
        self.upstream.force_sync();
    }

    /// The attack engine, for the controller surface.
    pub fn attack_engine(&self) -> &Arc<AttackEngine> {
        &self.attack_engine
    }

    /// The event log, for the controller surface.
    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// The session recorder, for the controller surface.
    pub fn session_recorder(&self) -> &Arc<SessionRecorder> {
        &self.recorder
    }

    /// Replace the configuration. The update is validated first; a
    /// rejected update leaves the previous configuration in effect.
    /// Server/port changes take effect on the next start.
    pub fn update_config(&self, new_cfg: Config) -> Result<(), ConfigError> {
        validate_config(&new_cfg)?;
        let mut cfg = self.cfg.write().expect("config lock poisoned");
        *cfg = new_cfg;
        Ok(())
    }
}

/// Reject configurations the engines cannot act on.
fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if !cfg.security.active_attack.is_empty()
        && AttackKind::from_tag(&cfg.security.active_attack).is_none()
    {
        return Err(ConfigError::UnknownAttack(
            cfg.security.active_attack.clone(),
        ));
    }
    if timehammer_proto::protocol::KissCode::new(&cfg.security.kiss_of_death.code).is_err() {
        return Err(ConfigError::InvalidKissCode(
            cfg.security.kiss_of_death.code.clone(),
        ));
    }
    Ok(())
}

/// Read datagrams until shutdown; each one is processed on its own task.
async fn reader_loop(ctx: RequestContext, mut shutdown: watch::Receiver<bool>) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("reader task stopping");
                    return;
                }
            }
            result = tokio::time::timeout(READ_DEADLINE, ctx.sock.recv_from(&mut buf)) => {
                match result {
                    // Deadline: loop around and re-check shutdown.
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!("UDP read error: {}", e);
                        ctx.stats.record_error();
                    }
                    Ok(Ok((len, peer))) => {
                        let datagram = buf[..len].to_vec();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            process_request(ctx, datagram, peer).await;
                        });
                    }
                }
            }
        }
    }
}

/// Evict stale active-client entries every 30 seconds.
async fn sweeper_loop(stats: Arc<ServerStats>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                stats.sweep_clients(CLIENT_STALE_AFTER);
            }
        }
    }
}

/// Handle one datagram end to end: validate, build, attack, send, record.
async fn process_request(ctx: RequestContext, datagram: Vec<u8>, peer: SocketAddr) {
    let started = StdInstant::now();

    let request = match validate_client_request(&datagram, datagram.len()) {
        Ok(request) => request,
        Err(err @ ProtocolError::RequestTooShort { .. }) => {
            ctx.stats.record_error();
            ctx.log
                .warn("SERVER", format!("Invalid packet from {}: {}", peer, err));
            return;
        }
        Err(err @ ProtocolError::NotAClientRequest { .. }) => {
            ctx.log
                .debug("SERVER", format!("Dropped packet from {}: {}", peer, err));
            return;
        }
    };

    let receive_time: TimestampFormat = unix_time::Instant::now().into();
    ctx.stats.record_request(peer);

    let fingerprint = ClientFingerprint::from_packet(&request);

    // One consistent view of the upstream snapshot for this response.
    let upstream_view = {
        let status = ctx.upstream.status();
        UpstreamView {
            current_time: ctx.upstream.current_time(),
            stratum: ctx.upstream.reported_stratum(),
            reference_id: ctx.upstream.reference_id(),
            rtt: status.rtt,
        }
    };
    let current_time = upstream_view.current_time;

    let mut response = build_server_response(&request, &upstream_view, receive_time);
    response.transmit_timestamp = unix_time::Instant::now().into();

    let attack_tag = ctx.attack_engine.process(&mut response, peer, current_time);
    if attack_tag.is_some() {
        ctx.stats.record_attack();
    }

    if ctx.recorder.is_recording() {
        let peer_str = peer.to_string();
        ctx.recorder
            .record_client_request(&peer_str, &request, attack_tag.as_deref());
        ctx.recorder
            .record_client_response(&peer_str, &response, started.elapsed());
    }

    if ctx
        .cfg
        .read()
        .expect("config lock poisoned")
        .logging
        .log_downstream
    {
        ctx.log.log_client_request(
            &peer.ip().to_string(),
            peer.port(),
            fingerprint,
            attack_tag.as_deref(),
        );
    }

    let buf = match serialize_response_with_transmit(&response, attack_tag.is_none()) {
        Ok(buf) => buf,
        Err(e) => {
            ctx.stats.record_error();
            error!("failed to serialize response for {}: {}", peer, e);
            return;
        }
    };

    match ctx.sock.send_to(&buf, peer).await {
        Ok(_) => {
            ctx.stats.record_response();
            match &attack_tag {
                Some(tag) => debug!("sent response to {} with attack: {}", peer, tag),
                None => debug!("sent response to {}", peer),
            }
        }
        Err(e) => {
            ctx.stats.record_error();
            ctx.log.error(
                "SERVER",
                format!("Failed to send response to {}: {}", peer, e),
            );
        }
    }
}
