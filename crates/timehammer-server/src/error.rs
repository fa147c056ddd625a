//! Error types for the TimeHammer server core.
//!
//! Errors are constructed as typed variants and convert into `io::Error`
//! where callers expect `io::Result`. Nothing in the per-request path is
//! fatal to the process; fatal conditions exist only during start/stop
//! transitions.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors that can occur during server lifecycle and configuration changes.
#[derive(Debug)]
pub enum ServerError {
    /// NTP protocol validation failure for an incoming request.
    Protocol(ProtocolError),
    /// Invalid configuration (bad YAML, unknown attack, bad kiss code).
    Config(ConfigError),
    /// UDP bind failure after exhausting the configured fallback.
    Bind {
        /// The address(es) that could not be bound.
        addr: String,
        /// The underlying OS error.
        source: io::Error,
    },
    /// `start()` was called while the server is running.
    AlreadyRunning,
    /// `stop()` was called while the server is not running.
    NotRunning,
    /// Underlying I/O error.
    Io(io::Error),
}

/// NTP protocol validation errors for incoming client requests.
#[derive(Clone, Debug)]
pub enum ProtocolError {
    /// Request datagram shorter than the 48-byte header.
    RequestTooShort {
        /// Number of bytes received.
        received: usize,
    },
    /// Parsed, but not a client-mode request with version 3 or 4.
    NotAClientRequest {
        /// The mode value received.
        mode: u8,
        /// The version value received.
        version: u8,
    },
}

/// Configuration errors. A rejected update leaves the previous
/// configuration in effect.
#[derive(Debug)]
pub enum ConfigError {
    /// The YAML document failed to parse or deserialize.
    InvalidYaml(String),
    /// An attack tag that is not one of the eight known kinds.
    UnknownAttack(String),
    /// A kiss code that is not exactly 4 ASCII characters.
    InvalidKissCode(String),
    /// The data directory could not be created or accessed.
    DataDir {
        /// The path that failed.
        path: PathBuf,
        /// The underlying OS error.
        source: io::Error,
    },
    /// I/O failure reading or writing the config file.
    Io(io::Error),
}

// ── Display implementations ─────────────────────────────────────────

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Protocol(e) => write!(f, "protocol error: {e}"),
            ServerError::Config(e) => write!(f, "config error: {e}"),
            ServerError::Bind { addr, source } => {
                write!(f, "failed to bind to {addr}: {source}")
            }
            ServerError::AlreadyRunning => write!(f, "server already running"),
            ServerError::NotRunning => write!(f, "server not running"),
            ServerError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::RequestTooShort { received } => {
                write!(f, "packet too short ({received} bytes)")
            }
            ProtocolError::NotAClientRequest { mode, version } => {
                write!(f, "not a client request (mode {mode}, version {version})")
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidYaml(detail) => write!(f, "invalid YAML: {detail}"),
            ConfigError::UnknownAttack(tag) => write!(f, "unknown attack type: {tag}"),
            ConfigError::InvalidKissCode(code) => {
                write!(f, "invalid kiss code '{code}': must be exactly 4 characters")
            }
            ConfigError::DataDir { path, source } => {
                write!(f, "failed to create data directory {}: {source}", path.display())
            }
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
        }
    }
}

// ── Error trait implementations ─────────────────────────────────────

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl std::error::Error for ProtocolError {}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::DataDir { source, .. } => Some(source),
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ── From conversions ────────────────────────────────────────────────

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> ServerError {
        ServerError::Io(err)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> ServerError {
        ServerError::Protocol(err)
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> ServerError {
        ServerError::Config(err)
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

impl From<ServerError> for io::Error {
    fn from(err: ServerError) -> io::Error {
        let kind = match &err {
            ServerError::Protocol(_) => io::ErrorKind::InvalidData,
            ServerError::Config(_) => io::ErrorKind::InvalidInput,
            ServerError::Bind { .. } => io::ErrorKind::AddrInUse,
            ServerError::AlreadyRunning | ServerError::NotRunning => io::ErrorKind::Other,
            ServerError::Io(e) => e.kind(),
        };
        if let ServerError::Io(e) = err {
            return e;
        }
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let e = ProtocolError::RequestTooShort { received: 40 };
        assert_eq!(e.to_string(), "packet too short (40 bytes)");

        let e = ProtocolError::NotAClientRequest {
            mode: 4,
            version: 2,
        };
        assert_eq!(e.to_string(), "not a client request (mode 4, version 2)");
    }

    #[test]
    fn test_config_error_display() {
        let e = ConfigError::UnknownAttack("dns_spoofing".to_string());
        assert_eq!(e.to_string(), "unknown attack type: dns_spoofing");

        let e = ConfigError::InvalidKissCode("NO".to_string());
        assert!(e.to_string().contains("exactly 4 characters"));
    }

    #[test]
    fn test_lifecycle_error_display() {
        assert_eq!(ServerError::AlreadyRunning.to_string(), "server already running");
        assert_eq!(ServerError::NotRunning.to_string(), "server not running");
    }

    #[test]
    fn test_server_error_to_io_error() {
        let err: io::Error = ServerError::Bind {
            addr: "0.0.0.0:123".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let orig = io::Error::new(io::ErrorKind::BrokenPipe, "broken");
        let err: io::Error = ServerError::Io(orig).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
