//! Configuration for the TimeHammer server.
//!
//! The on-disk document is YAML, kept in the data directory
//! (`<cwd>/.timehammer/config.yaml` by default) alongside session
//! recordings, exports, and the log file. Every section deserializes with
//! defaults so a partial document is valid; an invalid document is rejected
//! and the previous configuration stays in effect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";
/// Data directory name, created under the current working directory.
pub const DATA_DIR_NAME: &str = ".timehammer";
/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "timehammer.log";
/// Session recordings subdirectory.
pub const SESSION_DIR_NAME: &str = "sessions";
/// Log export subdirectory.
pub const EXPORT_DIR_NAME: &str = "exports";

/// The main configuration structure.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Upstream NTP servers.
    pub upstream: UpstreamConfig,
    /// Security testing mode.
    pub security: SecurityConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Attack presets.
    pub attack_presets: Vec<AttackPreset>,
}

/// Server-specific settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network interface to bind to (empty = all interfaces).
    pub interface: String,
    /// Port to listen on.
    pub port: u16,
    /// Alternative port for unprivileged operation.
    pub alt_port: u16,
    /// Retry on the alternative port if the standard port fails to bind.
    pub use_alt_port_on_fail: bool,
    /// Maximum concurrent clients tracked.
    pub max_clients: usize,
    /// NTP version to advertise.
    pub ntp_version: u8,
    /// Stratum level to report when not following an upstream.
    pub stratum: u8,
    /// Enable SNTP mode (simplified responses).
    pub sntp_mode: bool,
    /// Timezone used when rendering timestamps for operators.
    pub timezone: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            interface: String::new(),
            port: 123,
            alt_port: 1123,
            use_alt_port_on_fail: true,
            max_clients: 100,
            ntp_version: 4,
            stratum: 2,
            sntp_mode: false,
            timezone: "UTC".to_string(),
        }
    }
}

/// Upstream NTP server settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// List of upstream servers.
    pub servers: Vec<UpstreamServer>,
    /// Sync interval in seconds.
    pub sync_interval: u64,
    /// Timeout for a single upstream query attempt, in seconds.
    pub timeout: u64,
    /// Number of attempts per server before moving to the next.
    pub retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            servers: vec![
                UpstreamServer::new("time.google.com", 1),
                UpstreamServer::new("time.cloudflare.com", 2),
                UpstreamServer::new("pool.ntp.org", 3),
            ],
            sync_interval: 60,
            timeout: 5,
            retries: 3,
        }
    }
}

/// A single upstream NTP server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamServer {
    /// Server address (hostname or IP).
    pub address: String,
    /// Port (0 is treated as 123).
    pub port: u16,
    /// Priority (lower = higher priority).
    pub priority: u32,
    /// Enabled status.
    pub enabled: bool,
}

impl UpstreamServer {
    fn new(address: &str, priority: u32) -> Self {
        UpstreamServer {
            address: address.to_string(),
            port: 123,
            priority,
            enabled: true,
        }
    }
}

impl Default for UpstreamServer {
    fn default() -> Self {
        UpstreamServer {
            address: String::new(),
            port: 123,
            priority: 0,
            enabled: true,
        }
    }
}

/// Security testing mode settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch for security testing mode.
    pub enabled: bool,
    /// Tag of the active attack (empty = none). Exactly one attack is
    /// active at a time.
    pub active_attack: String,
    /// Time spoofing settings.
    pub time_spoofing: TimeSpoofingConfig,
    /// Gradual drift settings.
    pub time_drift: TimeDriftConfig,
    /// Kiss-of-Death settings.
    pub kiss_of_death: KissOfDeathConfig,
    /// Stratum manipulation settings.
    pub stratum_attack: StratumAttackConfig,
    /// Leap second injection settings.
    pub leap_second: LeapSecondConfig,
    /// Timestamp rollover settings.
    pub rollover: RolloverConfig,
    /// Clock step settings.
    pub clock_step: ClockStepConfig,
    /// Field fuzzing settings.
    pub fuzzing: FuzzingConfig,
}

/// Time spoofing attack parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeSpoofingConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Offset applied to real time; positive = future, negative = past.
    pub offset_secs: i64,
    /// RFC 3339 instant overriding the offset when parseable.
    pub custom_time: String,
}

impl Default for TimeSpoofingConfig {
    fn default() -> Self {
        TimeSpoofingConfig {
            enabled: false,
            offset_secs: 3600,
            custom_time: String::new(),
        }
    }
}

/// Gradual time drift attack parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeDriftConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Seconds of drift accumulated per elapsed second.
    pub drift_per_sec: f64,
    /// Cap on total drift, in seconds.
    pub max_drift: f64,
    /// "forward" or "backward".
    pub direction: String,
}

impl Default for TimeDriftConfig {
    fn default() -> Self {
        TimeDriftConfig {
            enabled: false,
            drift_per_sec: 0.001,
            max_drift: 60.0,
            direction: "forward".to_string(),
        }
    }
}

/// Kiss-of-Death attack parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KissOfDeathConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// 4-character kiss code (DENY, RATE, RSTR, ...).
    pub code: String,
    /// Send KoD every N requests (0 = every request).
    pub interval: u64,
}

impl Default for KissOfDeathConfig {
    fn default() -> Self {
        KissOfDeathConfig {
            enabled: false,
            code: "DENY".to_string(),
            interval: 0,
        }
    }
}

/// Stratum manipulation parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StratumAttackConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Stratum to claim; clamped to 0-15, lower = more authoritative.
    pub fake_stratum: u8,
}

impl Default for StratumAttackConfig {
    fn default() -> Self {
        StratumAttackConfig {
            enabled: false,
            fake_stratum: 1,
        }
    }
}

/// Leap second injection parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LeapSecondConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// 1 = +1 s, 2 = -1 s, 3 = alarm.
    pub leap_indicator: u8,
}

impl Default for LeapSecondConfig {
    fn default() -> Self {
        LeapSecondConfig {
            enabled: false,
            leap_indicator: 1,
        }
    }
}

/// Timestamp rollover parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RolloverConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Year used in "custom" mode (January 1st, midnight UTC).
    pub target_year: i32,
    /// "y2k38", "ntp_era", or "custom".
    pub mode: String,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        RolloverConfig {
            enabled: false,
            target_year: 2038,
            mode: "y2k38".to_string(),
        }
    }
}

/// Clock step parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClockStepConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Sudden jump in seconds.
    pub step_secs: i64,
    /// Apply the step every N requests (0 = every request).
    pub interval: u64,
}

impl Default for ClockStepConfig {
    fn default() -> Self {
        ClockStepConfig {
            enabled: false,
            step_secs: 3600,
            interval: 5,
        }
    }
}

/// Field fuzzing parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FuzzingConfig {
    /// Whether this attack may fire.
    pub enabled: bool,
    /// Mutation selection mode; only "random" is implemented.
    pub mode: String,
    /// PRNG seed for reproducible fuzzing runs; unset seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        FuzzingConfig {
            enabled: false,
            mode: "random".to_string(),
            seed: None,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: debug, info, warn, error.
    pub level: String,
    /// Append NDJSON records to the log file.
    pub log_to_file: bool,
    /// Log upstream queries.
    pub log_upstream: bool,
    /// Log client requests.
    pub log_downstream: bool,
    /// Attach client fingerprints to request log entries.
    pub client_fingerprint: bool,
    /// Allow session recording.
    pub record_sessions: bool,
    /// Maximum log entries kept in memory.
    pub max_log_entries: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            log_to_file: true,
            log_upstream: true,
            log_downstream: true,
            client_fingerprint: true,
            record_sessions: true,
            max_log_entries: 1000,
        }
    }
}

/// A pre-configured attack scenario.
///
/// The `config` map is dynamic on disk (numbers may arrive as integers or
/// floats); [`crate::attacks::AttackEngine::apply_preset`] performs the
/// validated coercion into the typed per-attack records.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AttackPreset {
    /// Display name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Attack tag this preset arms.
    pub attack: String,
    /// Attack-specific parameter map.
    pub config: BTreeMap<String, serde_yaml::Value>,
}

impl AttackPreset {
    fn new(
        name: &str,
        description: &str,
        attack: &str,
        entries: &[(&str, serde_yaml::Value)],
    ) -> Self {
        AttackPreset {
            name: name.to_string(),
            description: description.to_string(),
            attack: attack.to_string(),
            config: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

impl Config {
    /// The built-in configuration: defaults plus the stock attack presets.
    pub fn builtin() -> Config {
        use serde_yaml::Value;
        Config {
            attack_presets: vec![
                AttackPreset::new(
                    "Y2K38 Test",
                    "Test for Year 2038 problem (Unix timestamp overflow)",
                    "rollover",
                    &[
                        ("target_year", Value::from(2038)),
                        ("mode", Value::from("y2k38")),
                    ],
                ),
                AttackPreset::new(
                    "NTP Era Rollover",
                    "Test for NTP Era 1 rollover (February 2036)",
                    "rollover",
                    &[
                        ("target_year", Value::from(2036)),
                        ("mode", Value::from("ntp_era")),
                    ],
                ),
                AttackPreset::new(
                    "Gradual Drift",
                    "Slowly drift time to evade detection",
                    "time_drift",
                    &[
                        ("drift_per_sec", Value::from(0.001)),
                        ("max_drift", Value::from(300)),
                        ("direction", Value::from("forward")),
                    ],
                ),
                AttackPreset::new(
                    "Instant Future",
                    "Jump 1 year into the future (certificate expiry test)",
                    "time_spoofing",
                    &[("offset_secs", Value::from(31_536_000))],
                ),
                AttackPreset::new(
                    "Clock Skew Stress",
                    "Sudden large time jumps every 5 requests",
                    "clock_step",
                    &[
                        ("step_secs", Value::from(86_400)),
                        ("interval", Value::from(5)),
                    ],
                ),
                AttackPreset::new(
                    "DoS via KoD",
                    "Send Kiss-of-Death DENY packets to disable sync",
                    "kiss_of_death",
                    &[("code", Value::from("DENY")), ("interval", Value::from(0))],
                ),
            ],
            ..Config::default()
        }
    }

    /// Enabled upstream servers sorted by priority ascending, with port 0
    /// normalized to 123.
    pub fn active_upstreams(&self) -> Vec<UpstreamServer> {
        let mut active: Vec<UpstreamServer> = self
            .upstream
            .servers
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .map(|mut s| {
                if s.port == 0 {
                    s.port = 123;
                }
                s
            })
            .collect();
        active.sort_by_key(|s| s.priority);
        active
    }

    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file is replaced by the built-in
    /// defaults, which are also written back to disk.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if !config_path.exists() {
            let cfg = Config::builtin();
            cfg.save(&config_path)?;
            return Ok(cfg);
        }

        let data = fs::read_to_string(&config_path)?;
        serde_yaml::from_str(&data).map_err(|e| ConfigError::InvalidYaml(e.to_string()))
    }

    /// Save the configuration to `path` as YAML with a header comment.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let body =
            serde_yaml::to_string(self).map_err(|e| ConfigError::InvalidYaml(e.to_string()))?;
        let mut data = String::from(
            "# TimeHammer configuration file\n\
             # Edit with care - invalid YAML will prevent startup\n\n",
        );
        data.push_str(&body);
        fs::write(path, data)?;
        Ok(())
    }

    /// The configuration as a YAML string.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::InvalidYaml(e.to_string()))
    }

    /// Replace this configuration from a YAML string.
    ///
    /// On any parse error the previous configuration is left untouched and
    /// the error is surfaced to the caller.
    pub fn update_from_yaml(&mut self, yaml: &str) -> Result<(), ConfigError> {
        let new_cfg: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidYaml(e.to_string()))?;
        *self = new_cfg;
        Ok(())
    }
}

/// The data directory path: `<cwd>/.timehammer`.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let cwd = env::current_dir()?;
    Ok(cwd.join(DATA_DIR_NAME))
}

/// Create the data directory and its subdirectories if missing. Returns the
/// data directory path.
pub fn ensure_data_dir() -> Result<PathBuf, ConfigError> {
    let dir = data_dir()?;
    for sub in [None, Some(SESSION_DIR_NAME), Some(EXPORT_DIR_NAME)] {
        let path = match sub {
            None => dir.clone(),
            Some(s) => dir.join(s),
        };
        fs::create_dir_all(&path).map_err(|source| ConfigError::DataDir {
            path: path.clone(),
            source,
        })?;
    }
    Ok(dir)
}

/// The default config file path inside the data directory.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join(CONFIG_FILE_NAME))
}

/// OS-specific commands for diagnosing and freeing a UDP port that is
/// already in use, shown when binding fails on both configured ports.
pub fn port_conflict_help(port: u16) -> String {
    match env::consts::OS {
        "macos" => format!(
            "Port {port} is in use. To free it on macOS:\n\
             1. Find the process: sudo lsof -i :{port}\n\
             2. Stop the process: sudo kill <PID>\n\
             3. Or unload the system NTP service:\n\
             \x20  sudo launchctl unload /System/Library/LaunchDaemons/org.ntp.ntpd.plist\n\
             Do NOT run this on production systems."
        ),
        "linux" => format!(
            "Port {port} is in use. To free it on Linux:\n\
             1. Find the process: sudo ss -tulpn | grep :{port}\n\
             2. Stop the process: sudo kill <PID>\n\
             3. Or stop the system time service:\n\
             \x20  sudo systemctl stop systemd-timesyncd\n\
             \x20  sudo systemctl stop ntp\n\
             Do NOT run this on production systems."
        ),
        "windows" => format!(
            "Port {port} is in use. To free it on Windows (as Administrator):\n\
             1. Find the process: netstat -ano | findstr :{port}\n\
             2. Stop the process: taskkill /PID <PID> /F\n\
             3. Or stop the Windows Time service: net stop w32time\n\
             Do NOT run this on production systems."
        ),
        _ => format!("Port {port} is in use; free it or configure a different port."),
    }
}
