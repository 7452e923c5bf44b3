//! Configuration types for the upload gate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::clamd::ClamdEndpoint;
use crate::error::ConfigError;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Upload policy.
    #[serde(default)]
    pub settings: Settings,

    /// ClamAV daemon configuration.
    #[serde(default)]
    pub clamd: ClamdConfig,

    /// Scan token signing.
    #[serde(default)]
    pub token: TokenConfig,
}

/// Upload policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Accept uploads that could not be scanned (daemon down, file over the
    /// daemon's limit). Infected files are always rejected.
    #[serde(default = "default_true")]
    pub upload_unscanned: bool,

    /// Largest declared upload size accepted for scanning (bytes).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Log clean scans at info level.
    #[serde(default)]
    pub log_clean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upload_unscanned: true,
            max_upload_size: default_max_upload_size(),
            log_clean: false,
        }
    }
}

fn default_max_upload_size() -> u64 {
    600 * 1024 * 1024 // 600MB
}

/// How to reach clamd.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum SocketType {
    /// Unix domain socket.
    #[default]
    Unix,
    /// TCP/IP socket.
    Tcp,
}

impl TryFrom<String> for SocketType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "unix" => Ok(SocketType::Unix),
            "tcp" => Ok(SocketType::Tcp),
            _ => Err(ConfigError::UnsupportedSocketType(value)),
        }
    }
}

impl From<SocketType> for String {
    fn from(value: SocketType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Unix => f.write_str("unix"),
            SocketType::Tcp => f.write_str("tcp"),
        }
    }
}

/// ClamAV daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClamdConfig {
    /// Connection mechanism.
    #[serde(default)]
    pub socket_type: SocketType,

    /// Path to clamd Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// TCP target, required when `socket_type` is `tcp`.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Timeout in seconds applied to connect and to every read and write.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Chunk size for streaming to clamd.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            socket_type: SocketType::default(),
            socket_path: default_socket_path(),
            tcp: TcpConfig::default(),
            timeout_secs: default_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClamdConfig {
    /// Resolve the daemon endpoint.
    pub fn endpoint(&self) -> Result<ClamdEndpoint, ConfigError> {
        match self.socket_type {
            SocketType::Unix => Ok(ClamdEndpoint::Unix {
                path: self.socket_path.clone(),
            }),
            SocketType::Tcp => match (&self.tcp.host, self.tcp.port) {
                (Some(host), Some(port)) if !host.is_empty() && port != 0 => {
                    Ok(ClamdEndpoint::Tcp {
                        host: host.clone(),
                        port,
                    })
                }
                (host, port) => Err(ConfigError::MissingTcpTarget {
                    host: host.clone().unwrap_or_default(),
                    port: port.map(|p| p.to_string()).unwrap_or_default(),
                }),
            },
        }
    }
}

/// TCP target of the daemon.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Daemon host.
    #[serde(default)]
    pub host: Option<String>,

    /// Daemon port.
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/clamav/clamd.ctl")
}

fn default_timeout() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    65536 // 64KB
}

fn default_true() -> bool {
    true
}

/// Scan token signing configuration.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Shared HMAC secret used to sign and verify scan tokens.
    #[serde(default)]
    pub secret: String,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.max_upload_size == 0 {
            return Err(ConfigError::Zero("settings.max_upload_size"));
        }

        if self.clamd.timeout_secs == 0 {
            return Err(ConfigError::Zero("clamd.timeout_secs"));
        }

        if self.clamd.chunk_size == 0 {
            return Err(ConfigError::Zero("clamd.chunk_size"));
        }

        if self.token.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }

        self.clamd.endpoint()?;

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# ClamAV upload gate configuration

settings:
  upload_unscanned: true       # accept files that could not be scanned
  max_upload_size: 629145600   # 600MB, larger uploads are rejected outright
  log_clean: false

# ClamAV daemon configuration
clamd:
  socket_type: unix            # unix or tcp
  socket_path: "/var/run/clamav/clamd.ctl"
  tcp:
    host: "127.0.0.1"
    port: 3310
  timeout_secs: 60             # connect and per-operation timeout
  chunk_size: 65536            # 64KB chunks to clamd

# Scan token signing
token:
  secret: "${CLAMAV_TOKEN_SECRET}"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
