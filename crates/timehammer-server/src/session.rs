//! Session recording: an on/off sink that captures client requests and
//! server responses (raw bytes plus a decoded view) along with running
//! counters, and persists finished sessions as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use timehammer_proto::protocol::Packet;
use timehammer_proto::unix_time;

/// Human-readable decode of a recorded packet, including Kiss-o'-Death
/// detection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PacketInfo {
    /// Leap indicator bits.
    pub leap_indicator: u8,
    /// Protocol version.
    pub version: u8,
    /// Mode name.
    pub mode: String,
    /// Stratum.
    pub stratum: u8,
    /// Poll exponent.
    pub poll: i8,
    /// Precision exponent.
    pub precision: i8,
    /// Reference id: ASCII for stratum 0-1, dotted quad otherwise.
    pub reference_id: String,
    /// Transmit timestamp as RFC 3339.
    pub transmit_time: String,
    /// Whether this is a Kiss-o'-Death packet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_kod: bool,
    /// The kiss code, when `is_kod`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kod_code: Option<String>,
}

impl PacketInfo {
    /// Decode a packet for display and session storage.
    pub fn from_packet(packet: &Packet) -> PacketInfo {
        let refid_bytes = packet.reference_id.as_bytes();
        let reference_id = if packet.stratum.0 <= 1 {
            refid_bytes
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '?'
                    }
                })
                .collect()
        } else {
            format!(
                "{}.{}.{}.{}",
                refid_bytes[0], refid_bytes[1], refid_bytes[2], refid_bytes[3]
            )
        };

        let xmit = unix_time::Instant::from(packet.transmit_timestamp);
        let transmit_time = chrono::TimeZone::timestamp_opt(
            &Utc,
            xmit.secs(),
            xmit.subsec_nanos().unsigned_abs(),
        )
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

        let kod = packet.kiss_code();
        PacketInfo {
            leap_indicator: packet.leap_indicator as u8,
            version: packet.version.value(),
            mode: packet.mode_str().to_string(),
            stratum: packet.stratum.0,
            poll: packet.poll,
            precision: packet.precision,
            reference_id,
            transmit_time,
            is_kod: kod.is_some(),
            kod_code: kod.map(|c| c.to_string()),
        }
    }
}

/// A single recorded event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// "request", "response", or "upstream_query".
    #[serde(rename = "type")]
    pub kind: String,
    /// Client endpoint for request/response events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    /// Upstream address for upstream events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_addr: Option<String>,
    /// Raw packet bytes as they went over the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_data: Option<Vec<u8>>,
    /// Decoded view of the packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_packet: Option<PacketInfo>,
    /// Attack tag applied to this exchange, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_mode: Option<String>,
}

/// Counters accumulated during a session; `avg_response_time_ms` is
/// finalized when recording stops.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SessionStats {
    /// Client requests recorded.
    pub total_requests: u64,
    /// Responses recorded.
    pub total_responses: u64,
    /// Distinct client endpoints seen.
    pub unique_clients: u64,
    /// Upstream queries issued while recording.
    pub upstream_queries: u64,
    /// Requests that had an attack applied.
    pub attacks_executed: u64,
    /// Mean request-to-response latency in milliseconds.
    pub avg_response_time_ms: f64,
}

/// A recording session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    /// Identifier, also the file stem on disk.
    pub id: String,
    /// When recording started.
    pub start_time: DateTime<Utc>,
    /// When recording stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Operator-supplied description.
    pub description: String,
    /// Recorded events in order.
    pub events: Vec<SessionEvent>,
    /// Session statistics.
    pub stats: SessionStats,
}

/// Summary of a session without its event list.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// When recording started.
    pub start_time: DateTime<Utc>,
    /// When recording stopped, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Operator-supplied description.
    pub description: String,
    /// Number of recorded events.
    pub event_count: usize,
    /// Session statistics.
    pub stats: SessionStats,
}

struct ActiveSession {
    session: Session,
    clients: HashSet<String>,
    response_times: Vec<Duration>,
}

/// Records sessions. An explicitly-owned collaborator; recording is off
/// until [`start_recording`](SessionRecorder::start_recording).
pub struct SessionRecorder {
    sessions_dir: Option<PathBuf>,
    inner: Mutex<Option<ActiveSession>>,
}

impl SessionRecorder {
    /// Create a recorder persisting into `sessions_dir` (no persistence
    /// when `None`).
    pub fn new(sessions_dir: Option<PathBuf>) -> SessionRecorder {
        SessionRecorder {
            sessions_dir,
            inner: Mutex::new(None),
        }
    }

    /// Whether a recording is active.
    pub fn is_recording(&self) -> bool {
        self.inner.lock().expect("recorder lock poisoned").is_some()
    }

    /// Start a new recording session.
    pub fn start_recording(&self, description: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        if inner.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "recording already in progress",
            ));
        }
        let now = Utc::now();
        *inner = Some(ActiveSession {
            session: Session {
                id: format!("session_{}", now.timestamp()),
                start_time: now,
                end_time: None,
                description: description.to_string(),
                events: Vec::new(),
                stats: SessionStats::default(),
            },
            clients: HashSet::new(),
            response_times: Vec::new(),
        });
        Ok(())
    }

    /// Stop the active recording, finalize its statistics, persist it, and
    /// return it.
    pub fn stop_recording(&self) -> io::Result<Session> {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        let mut active = inner.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no recording in progress")
        })?;

        active.session.end_time = Some(Utc::now());
        active.session.stats.unique_clients = active.clients.len() as u64;
        if !active.response_times.is_empty() {
            let total_ms: f64 = active
                .response_times
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum();
            active.session.stats.avg_response_time_ms =
                total_ms / active.response_times.len() as f64;
        }

        if let Some(dir) = &self.sessions_dir {
            let path = dir.join(format!("{}.json", active.session.id));
            let data = serde_json::to_vec_pretty(&active.session)?;
            fs::write(path, data)?;
        }

        Ok(active.session)
    }

    /// Record an incoming client request. No-op when not recording.
    pub fn record_client_request(&self, client_addr: &str, packet: &Packet, attack: Option<&str>) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        let Some(active) = inner.as_mut() else {
            return;
        };
        active.clients.insert(client_addr.to_string());
        active.session.stats.total_requests += 1;
        if attack.is_some() {
            active.session.stats.attacks_executed += 1;
        }
        active.session.events.push(SessionEvent {
            timestamp: Utc::now(),
            kind: "request".to_string(),
            client_addr: Some(client_addr.to_string()),
            upstream_addr: None,
            packet_data: Some(packet_bytes(packet)),
            parsed_packet: Some(PacketInfo::from_packet(packet)),
            attack_mode: attack.map(str::to_string),
        });
    }

    /// Record an outgoing response and its latency. No-op when not
    /// recording.
    pub fn record_client_response(
        &self,
        client_addr: &str,
        packet: &Packet,
        response_time: Duration,
    ) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        let Some(active) = inner.as_mut() else {
            return;
        };
        active.session.stats.total_responses += 1;
        active.response_times.push(response_time);
        active.session.events.push(SessionEvent {
            timestamp: Utc::now(),
            kind: "response".to_string(),
            client_addr: Some(client_addr.to_string()),
            upstream_addr: None,
            packet_data: Some(packet_bytes(packet)),
            parsed_packet: Some(PacketInfo::from_packet(packet)),
            attack_mode: None,
        });
    }

    /// Record an upstream query. No-op when not recording.
    pub fn record_upstream_query(&self, upstream_addr: &str) {
        let mut inner = self.inner.lock().expect("recorder lock poisoned");
        let Some(active) = inner.as_mut() else {
            return;
        };
        active.session.stats.upstream_queries += 1;
        active.session.events.push(SessionEvent {
            timestamp: Utc::now(),
            kind: "upstream_query".to_string(),
            client_addr: None,
            upstream_addr: Some(upstream_addr.to_string()),
            packet_data: None,
            parsed_packet: None,
            attack_mode: None,
        });
    }

    /// Summary of the active session, if recording.
    pub fn current_session(&self) -> Option<SessionSummary> {
        let inner = self.inner.lock().expect("recorder lock poisoned");
        inner.as_ref().map(|active| SessionSummary {
            id: active.session.id.clone(),
            start_time: active.session.start_time,
            end_time: None,
            description: active.session.description.clone(),
            event_count: active.session.events.len(),
            stats: active.session.stats.clone(),
        })
    }

    /// List persisted sessions, newest last (directory order).
    pub fn list_sessions(&self) -> io::Result<Vec<SessionSummary>> {
        let Some(dir) = &self.sessions_dir else {
            return Ok(Vec::new());
        };
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip unreadable or malformed files rather than failing the
            // whole listing.
            let Ok(data) = fs::read(&path) else { continue };
            let Ok(session) = serde_json::from_slice::<Session>(&data) else {
                continue;
            };
            sessions.push(SessionSummary {
                id: session.id,
                start_time: session.start_time,
                end_time: session.end_time,
                description: session.description,
                event_count: session.events.len(),
                stats: session.stats,
            });
        }
        Ok(sessions)
    }

    /// Load a persisted session by id.
    pub fn load_session(&self, id: &str) -> io::Result<Session> {
        let dir = self.sessions_dir.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no sessions directory configured")
        })?;
        let data = fs::read(dir.join(format!("{id}.json")))?;
        serde_json::from_slice(&data).map_err(io::Error::from)
    }

    /// Delete a persisted session by id.
    pub fn delete_session(&self, id: &str) -> io::Result<()> {
        let dir = self.sessions_dir.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no sessions directory configured")
        })?;
        fs::remove_file(dir.join(format!("{id}.json")))
    }
}

fn packet_bytes(packet: &Packet) -> Vec<u8> {
    use timehammer_proto::protocol::{ConstPackedSizeBytes, ToBytes};
    let mut buf = [0u8; Packet::PACKED_SIZE_BYTES];
    // Infallible for a 48-byte buffer.
    let _ = packet.to_bytes(&mut buf);
    buf.to_vec()
}
