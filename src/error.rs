//! Error types.
//!
//! `ConfigError` is fatal and surfaces at startup. `ScanOutcomeError` and
//! `TokenError` are per-upload and end up as a user-facing message.

use std::path::PathBuf;

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// `clamd.socket_type` is neither `unix` nor `tcp`.
    #[error("Clamd: unsupported connection type '{0}'")]
    UnsupportedSocketType(String),

    /// TCP was selected without a full host:port.
    #[error(
        "Clamd: please, provide TCP/IP host:port for ClamAV received host: '{host}', port: '{port}'"
    )]
    MissingTcpTarget {
        /// Configured host, empty when absent.
        host: String,
        /// Configured port, empty when absent.
        port: String,
    },

    /// A numeric setting that must be positive is zero.
    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    /// No token signing secret configured.
    #[error("token.secret must not be empty")]
    MissingSecret,
}

/// Reason an upload is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanOutcomeError {
    /// Declared size is over the accepted ceiling.
    #[error("File is too large")]
    TooLarge {
        /// Declared size in bytes.
        size: u64,
        /// Configured ceiling in bytes.
        limit: u64,
    },

    /// The daemon found malware.
    #[error("malware has been found. Filename: {filename}, signature: {signature}.")]
    Infected {
        /// Uploaded file name.
        filename: String,
        /// Signature reported by the daemon.
        signature: String,
    },

    /// The daemon refused the file for exceeding its size limit.
    #[error("{0}")]
    FileLimit(String),

    /// The daemon could not be reached or gave no verdict.
    #[error("The clamav is disabled. Can't upload the file. Contact administrator")]
    Disabled,

    /// No valid scan token accompanies the file.
    #[error("The file has not been scanned or is infected")]
    NotScanned,
}

/// Scan token rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Token could not be decoded.
    #[error("malformed scan token: {0}")]
    Malformed(String),

    /// Signature does not match the configured secret.
    #[error("scan token signature is invalid")]
    InvalidSignature,

    /// Token is past its expiry.
    #[error("scan token has expired")]
    Expired,

    /// Token was issued for a file that was not scanned clean.
    #[error("scan token does not mark the file as safe")]
    Unsafe,

    /// Token was issued for a different file.
    #[error("scan token was issued for a different file")]
    FileMismatch,

    /// Token could not be signed.
    #[error("failed to sign scan token: {0}")]
    Encoding(String),
}
