//! Runtime statistics: lock-free counters on the hot path plus a
//! mutex-guarded active-client table.
//!
//! Counters use relaxed ordering; readers get values that are individually
//! accurate but not transactionally consistent with each other, which is
//! fine for dashboards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Active-client entries idle longer than this are evicted by the sweeper.
///
/// The window is fixed; making it configurable has come up but nothing
/// drives it yet.
pub const CLIENT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Runtime server statistics.
pub struct ServerStats {
    start_time: Instant,
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    error_count: AtomicU64,
    attacks_executed: AtomicU64,
    active_clients: Mutex<HashMap<SocketAddr, Instant>>,
    max_clients: usize,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug)]
pub struct StatsSnapshot {
    /// Time since the server started.
    pub uptime: Duration,
    /// Requests that parsed and validated as client requests.
    pub total_requests: u64,
    /// Responses actually sent.
    pub total_responses: u64,
    /// Clients seen within the staleness window.
    pub active_clients: usize,
    /// Parse failures, send failures, socket errors.
    pub error_count: u64,
    /// Responses that had an attack mutation applied.
    pub attacks_executed: u64,
}

/// A tracked client endpoint.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    /// The client endpoint (ip:port).
    pub address: SocketAddr,
    /// How long ago the client was last seen.
    pub last_seen_age: Duration,
}

impl ServerStats {
    /// Create a stats instance; the active-client table holds at most
    /// `max_clients` entries.
    pub fn new(max_clients: usize) -> ServerStats {
        ServerStats {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            attacks_executed: AtomicU64::new(0),
            active_clients: Mutex::new(HashMap::new()),
            max_clients: max_clients.max(1),
        }
    }

    /// Count a valid request and refresh the client's last-seen entry.
    pub fn record_request(&self, client: SocketAddr) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut clients = self.active_clients.lock().expect("client table poisoned");
        if !clients.contains_key(&client) && clients.len() >= self.max_clients {
            // Full table: drop the longest-idle entry.
            if let Some(oldest) = clients
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(addr, _)| *addr)
            {
                clients.remove(&oldest);
            }
        }
        clients.insert(client, now);
    }

    /// Count a sent response.
    pub fn record_response(&self) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error (parse failure, send failure, socket error).
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an applied attack mutation.
    pub fn record_attack(&self) {
        self.attacks_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict active-client entries idle longer than `stale_after`.
    pub fn sweep_clients(&self, stale_after: Duration) {
        let now = Instant::now();
        let mut clients = self.active_clients.lock().expect("client table poisoned");
        clients.retain(|_, seen| now.duration_since(*seen) < stale_after);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let active = self
            .active_clients
            .lock()
            .expect("client table poisoned")
            .len();
        StatsSnapshot {
            uptime: self.start_time.elapsed(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            active_clients: active,
            error_count: self.error_count.load(Ordering::Relaxed),
            attacks_executed: self.attacks_executed.load(Ordering::Relaxed),
        }
    }

    /// The tracked clients and how long ago each was seen.
    pub fn active_clients(&self) -> Vec<ClientInfo> {
        let now = Instant::now();
        let clients = self.active_clients.lock().expect("client table poisoned");
        clients
            .iter()
            .map(|(addr, seen)| ClientInfo {
                address: *addr,
                last_seen_age: now.duration_since(*seen),
            })
            .collect()
    }
}
