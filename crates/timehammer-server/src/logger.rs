//! The in-memory event log: a bounded ring of structured entries with
//! subscriber fan-out, an optional NDJSON file sink, and JSON/CSV export.
//!
//! One mutex guards ring, file handle, and subscriber list; an append does
//! all three side effects under it. Fan-out uses bounded channels with
//! `try_send` so a slow subscriber loses entries rather than ever blocking
//! the request path.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;

use timehammer_proto::protocol::Packet;

use crate::config::{LoggingConfig, EXPORT_DIR_NAME, LOG_FILE_NAME};

/// Capacity of each subscriber channel; entries beyond it are dropped for
/// that subscriber only.
const SUBSCRIBER_BUFFER: usize = 100;

/// Log severity.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something suspicious, service continues.
    Warn,
    /// Something failed.
    Error,
}

impl LogLevel {
    /// Parse a config-file level string; unknown values mean `Info`.
    pub fn parse(s: &str) -> LogLevel {
        match s {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    /// Upper-case short name for CSV and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// NTP client identification derived from a request packet.
#[derive(Clone, Debug, Serialize)]
pub struct ClientFingerprint {
    /// Protocol version from the request.
    pub version: u8,
    /// Raw mode value.
    pub mode: u8,
    /// Human-readable mode name.
    pub mode_string: String,
    /// Stratum field of the request.
    pub stratum: u8,
    /// Poll exponent.
    pub poll: i8,
    /// Precision exponent.
    pub precision: i8,
    /// Best-effort guess at the client implementation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possible_client: Option<String>,
}

impl ClientFingerprint {
    /// Build a fingerprint from a parsed request, including the
    /// implementation guess.
    pub fn from_packet(packet: &Packet) -> ClientFingerprint {
        ClientFingerprint {
            version: packet.version.value(),
            mode: packet.mode as u8,
            mode_string: packet.mode_str().to_string(),
            stratum: packet.stratum.0,
            poll: packet.poll,
            precision: packet.precision,
            possible_client: Some(identify_client(packet).to_string()),
        }
    }
}

/// Guess the client implementation from version and poll exponent.
///
/// Heuristic only; poll defaults differ enough between the common stacks to
/// be a useful hint on a dashboard, nothing more.
pub fn identify_client(packet: &Packet) -> &'static str {
    match (packet.version.value(), packet.poll) {
        (3, 6) => "Windows W32Time (possible)",
        (3, _) => "NTPv3 Client",
        (4, 6) => "ntpd/chrony (likely)",
        (4, 7) => "systemd-timesyncd (possible)",
        (4, 10) => "macOS sntp (possible)",
        (4, _) => "NTPv4 Client",
        _ => "Unknown",
    }
}

/// A single structured log entry. Immutable once created.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Originating subsystem (SERVER, UPSTREAM, ATTACK, CLIENT, ...).
    pub category: String,
    /// Free-form message.
    pub message: String,
    /// Client IP for request entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Client port for request entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    /// Upstream address for tracker entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_ip: Option<String>,
    /// Attack tag when a mutation was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack: Option<String>,
    /// Client fingerprint for request entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<ClientFingerprint>,
    /// Additional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(level: LogLevel, category: &str, message: String) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message,
            client_ip: None,
            client_port: None,
            upstream_ip: None,
            attack: None,
            fingerprint: None,
            extra: None,
        }
    }
}

/// Identifies a log subscription for [`EventLog::unsubscribe`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<LogEntry>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    level: LogLevel,
    file: Option<File>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    data_dir: Option<PathBuf>,
}

/// The event log. An explicitly-owned collaborator: created at startup,
/// injected into the request engine, upstream tracker, and attack engine.
pub struct EventLog {
    inner: Mutex<Inner>,
}

impl EventLog {
    /// Create an event log.
    ///
    /// When `data_dir` is given and file logging is enabled in `cfg`, an
    /// NDJSON sink is appended to `<data_dir>/timehammer.log`; exports land
    /// in `<data_dir>/exports/`.
    pub fn new(cfg: &LoggingConfig, data_dir: Option<&Path>) -> io::Result<EventLog> {
        let file = match (cfg.log_to_file, data_dir) {
            (true, Some(dir)) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(LOG_FILE_NAME))?,
            ),
            _ => None,
        };
        Ok(EventLog {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                max_entries: cfg.max_log_entries.max(1),
                level: LogLevel::parse(&cfg.level),
                file,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                data_dir: data_dir.map(Path::to_path_buf),
            }),
        })
    }

    /// An in-memory log with default settings and no file sink.
    pub fn in_memory() -> EventLog {
        EventLog::new(
            &LoggingConfig {
                log_to_file: false,
                ..LoggingConfig::default()
            },
            None,
        )
        .expect("in-memory event log cannot fail")
    }

    fn append(&self, entry: LogEntry) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");

        if inner.entries.len() >= inner.max_entries {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry.clone());

        if let Some(file) = inner.file.as_mut() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
            }
        }

        for sub in &inner.subscribers {
            // Full buffer: drop for this subscriber only, never block.
            let _ = sub.tx.try_send(entry.clone());
        }
    }

    fn log(&self, level: LogLevel, category: &str, message: String) {
        {
            let inner = self.inner.lock().expect("event log lock poisoned");
            if level < inner.level {
                return;
            }
        }
        self.append(LogEntry::new(level, category, message));
    }

    /// Log a debug message.
    pub fn debug(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, category, message.into());
    }

    /// Log an info message.
    pub fn info(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, category, message.into());
    }

    /// Log a warning.
    pub fn warn(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, category, message.into());
    }

    /// Log an error.
    pub fn error(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message.into());
    }

    /// Log a client request with its fingerprint and any applied attack.
    pub fn log_client_request(
        &self,
        client_ip: &str,
        client_port: u16,
        fingerprint: ClientFingerprint,
        attack: Option<&str>,
    ) {
        let mut entry = LogEntry::new(
            LogLevel::Info,
            "CLIENT",
            format!("Request from {}:{}", client_ip, client_port),
        );
        entry.client_ip = Some(client_ip.to_string());
        entry.client_port = Some(client_port);
        entry.fingerprint = Some(fingerprint);
        entry.attack = attack.map(str::to_string);
        self.append(entry);
    }

    /// Log an upstream query outcome.
    pub fn log_upstream_request(
        &self,
        upstream: &str,
        success: bool,
        rtt_ms: f64,
        offset_secs: f64,
    ) {
        let (level, status) = if success {
            (LogLevel::Info, "success")
        } else {
            (LogLevel::Warn, "failed")
        };
        let mut entry = LogEntry::new(
            level,
            "UPSTREAM",
            format!(
                "Query to {}: {} (RTT: {:.1}ms, Offset: {:.6}s)",
                upstream, status, rtt_ms, offset_secs
            ),
        );
        entry.upstream_ip = Some(upstream.to_string());
        entry.extra = Some(serde_json::json!({
            "success": success,
            "rtt_ms": rtt_ms,
            "offset_secs": offset_secs,
        }));
        self.append(entry);
    }

    /// Log an executed attack mutation.
    pub fn log_attack(&self, attack: &str, target: &str, details: &str) {
        let mut entry = LogEntry::new(
            LogLevel::Warn,
            "ATTACK",
            format!("[{}] {}: {}", attack, target, details),
        );
        entry.attack = Some(attack.to_string());
        entry.client_ip = Some(target.to_string());
        self.append(entry);
    }

    /// The most recent `count` entries (all entries when `count` is 0 or
    /// exceeds the ring size).
    pub fn entries(&self, count: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().expect("event log lock poisoned");
        let len = inner.entries.len();
        let count = if count == 0 || count > len { len } else { count };
        inner.entries.iter().skip(len - count).cloned().collect()
    }

    /// Drop all in-memory entries. The file sink is unaffected.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.entries.clear();
    }

    /// Register a subscriber. Returns its id and the receiving end of a
    /// bounded channel; entries are dropped for this subscriber whenever
    /// its buffer is full.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<LogEntry>) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        let id = SubscriberId(inner.next_subscriber_id);
        inner.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        inner.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove a subscriber; its channel closes once the sender is dropped.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        inner.subscribers.retain(|s| s.id != id);
    }

    fn export_path(&self, name: &str) -> io::Result<PathBuf> {
        let inner = self.inner.lock().expect("event log lock poisoned");
        match &inner.data_dir {
            Some(dir) => Ok(dir.join(EXPORT_DIR_NAME).join(name)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no data directory configured for exports",
            )),
        }
    }

    /// Export all in-memory entries as a pretty-printed JSON array under
    /// `exports/`. Returns the written path.
    pub fn export_json(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.export_path(name)?;
        let entries = self.entries(0);
        let data = serde_json::to_vec_pretty(&entries)?;
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Export all in-memory entries as CSV under `exports/`. Returns the
    /// written path.
    pub fn export_csv(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.export_path(name)?;
        let entries = self.entries(0);
        let mut out = String::from(
            "Timestamp,Level,Category,Message,ClientIP,ClientPort,UpstreamIP,Attack,ClientVersion,ClientMode\n",
        );
        for e in &entries {
            let (version, mode) = match &e.fingerprint {
                Some(fp) => (fp.version.to_string(), fp.mode_string.clone()),
                None => (String::new(), String::new()),
            };
            out.push_str(&format!(
                "{},{},{},\"{}\",{},{},{},{},{},{}\n",
                e.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                e.level.as_str(),
                e.category,
                e.message.replace('"', "\"\""),
                e.client_ip.as_deref().unwrap_or(""),
                e.client_port.map(|p| p.to_string()).unwrap_or_default(),
                e.upstream_ip.as_deref().unwrap_or(""),
                e.attack.as_deref().unwrap_or(""),
                version,
                mode,
            ));
        }
        std::fs::write(&path, out)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timehammer_proto::protocol::{Mode, Version};

    fn log_with_max(max: usize) -> EventLog {
        EventLog::new(
            &LoggingConfig {
                log_to_file: false,
                max_log_entries: max,
                level: "debug".to_string(),
                ..LoggingConfig::default()
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = log_with_max(3);
        for i in 0..5 {
            log.info("TEST", format!("entry {}", i));
        }
        let entries = log.entries(0);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].message, "entry 4");
    }

    #[test]
    fn test_entries_tail() {
        let log = log_with_max(10);
        for i in 0..5 {
            log.info("TEST", format!("entry {}", i));
        }
        let tail = log.entries(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "entry 3");
        assert_eq!(tail[1].message, "entry 4");
    }

    #[test]
    fn test_level_filter() {
        let log = EventLog::new(
            &LoggingConfig {
                log_to_file: false,
                level: "warn".to_string(),
                ..LoggingConfig::default()
            },
            None,
        )
        .unwrap();
        log.debug("TEST", "dropped");
        log.info("TEST", "dropped");
        log.warn("TEST", "kept");
        log.error("TEST", "kept");
        assert_eq!(log.entries(0).len(), 2);
    }

    #[test]
    fn test_structured_helpers_bypass_level_filter() {
        let log = EventLog::new(
            &LoggingConfig {
                log_to_file: false,
                level: "error".to_string(),
                ..LoggingConfig::default()
            },
            None,
        )
        .unwrap();
        let pkt = Packet::default();
        log.log_client_request("10.0.0.1", 50000, ClientFingerprint::from_packet(&pkt), None);
        assert_eq!(log.entries(0).len(), 1);
    }

    #[test]
    fn test_subscriber_receives_entries() {
        let log = log_with_max(10);
        let (_id, mut rx) = log.subscribe();
        log.info("TEST", "hello");
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.message, "hello");
    }

    #[test]
    fn test_full_subscriber_drops_without_blocking() {
        let log = log_with_max(1000);
        let (_id, mut rx) = log.subscribe();
        // Never drain: entries beyond the buffer are dropped for this
        // subscriber, and appends never block.
        for i in 0..(SUBSCRIBER_BUFFER + 50) {
            log.info("TEST", format!("entry {}", i));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
        // The ring itself kept everything.
        assert_eq!(log.entries(0).len(), SUBSCRIBER_BUFFER + 50);
    }

    #[test]
    fn test_unsubscribe_closes_channel() {
        let log = log_with_max(10);
        let (id, mut rx) = log.subscribe();
        log.unsubscribe(id);
        log.info("TEST", "after unsubscribe");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_clear() {
        let log = log_with_max(10);
        log.info("TEST", "one");
        log.clear();
        assert!(log.entries(0).is_empty());
    }

    #[test]
    fn test_identify_client_table() {
        let mut pkt = Packet {
            version: Version::V3,
            mode: Mode::Client,
            poll: 6,
            ..Packet::default()
        };
        assert_eq!(identify_client(&pkt), "Windows W32Time (possible)");
        pkt.poll = 4;
        assert_eq!(identify_client(&pkt), "NTPv3 Client");

        pkt.version = Version::V4;
        pkt.poll = 6;
        assert_eq!(identify_client(&pkt), "ntpd/chrony (likely)");
        pkt.poll = 7;
        assert_eq!(identify_client(&pkt), "systemd-timesyncd (possible)");
        pkt.poll = 10;
        assert_eq!(identify_client(&pkt), "macOS sntp (possible)");
        pkt.poll = 3;
        assert_eq!(identify_client(&pkt), "NTPv4 Client");

        pkt.version = Version::from_raw(2);
        assert_eq!(identify_client(&pkt), "Unknown");
    }

    #[test]
    fn test_entry_serializes_without_empty_options() {
        let log = log_with_max(10);
        log.info("TEST", "plain");
        let json = serde_json::to_string(&log.entries(1)[0]).unwrap();
        assert!(json.contains("\"category\":\"TEST\""));
        assert!(!json.contains("client_ip"));
        assert!(!json.contains("fingerprint"));
    }

    #[test]
    fn test_export_json_and_csv() {
        let dir = std::env::temp_dir().join(format!("th-log-test-{}", std::process::id()));
        std::fs::create_dir_all(dir.join(EXPORT_DIR_NAME)).unwrap();
        let log = EventLog::new(
            &LoggingConfig {
                log_to_file: false,
                ..LoggingConfig::default()
            },
            Some(&dir),
        )
        .unwrap();
        let pkt = Packet::default();
        log.log_client_request(
            "10.0.0.1",
            50000,
            ClientFingerprint::from_packet(&pkt),
            Some("Time Spoofing"),
        );

        let json_path = log.export_json("logs.json").unwrap();
        let data = std::fs::read_to_string(&json_path).unwrap();
        assert!(data.contains("Time Spoofing"));

        let csv_path = log.export_csv("logs.csv").unwrap();
        let data = std::fs::read_to_string(&csv_path).unwrap();
        assert!(data.starts_with("Timestamp,Level,Category"));
        assert!(data.contains("10.0.0.1"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
