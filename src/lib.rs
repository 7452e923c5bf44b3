//! Virus-scanning gate for file uploads.
//!
//! Streams uploads to the ClamAV daemon and issues signed scan tokens that a
//! later upload step can trust without scanning again.

pub mod clamd;
pub mod config;
pub mod error;
pub mod gate;
pub mod scanner;
pub mod token;

pub use clamd::{ClamdClient, ClamdEndpoint, ClamdError, ScanResult};
pub use config::{Config, SocketType};
pub use error::{ConfigError, ScanOutcomeError, TokenError};
pub use gate::{CommitDecision, UploadGate, UploadResponse, UploadedFile};
pub use scanner::{ScanOutcome, ScanVerdict, Scanner};
pub use token::{TokenSigner, TrustToken, TOKEN_TTL_SECS};
