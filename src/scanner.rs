//! Scan verdicts.
//!
//! Turns whatever happened on the wire into one of four outcomes. Transport
//! failures never escape as errors; they become `ScannerUnavailable`.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{error, warn};

use crate::clamd::{ClamdClient, ClamdError, ScanResult};

/// Detail attached to a `FileTooLarge` verdict.
pub const FILE_LIMIT_MESSAGE: &str =
    "The uploaded file exceeds the filesize limit. The file will not be scanned";

/// Detail prefix attached to a `ScannerUnavailable` verdict.
pub const UNAVAILABLE_MESSAGE: &str = "clamav is not accessible, check its status.";

/// Classification of one scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// The daemon reported the content clean.
    Clean,
    /// The daemon matched a signature.
    Infected,
    /// The daemon refused the stream for its size.
    FileTooLarge,
    /// No verdict could be obtained.
    ScannerUnavailable,
}

/// Result of one scan attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanVerdict {
    /// Outcome of the scan.
    pub outcome: ScanOutcome,
    /// Signature name or error message.
    pub detail: Option<String>,
}

impl ScanVerdict {
    /// Clean verdict.
    pub fn clean() -> Self {
        Self {
            outcome: ScanOutcome::Clean,
            detail: None,
        }
    }

    /// Infected verdict carrying the signature name.
    pub fn infected(signature: impl Into<String>) -> Self {
        Self {
            outcome: ScanOutcome::Infected,
            detail: Some(signature.into()),
        }
    }

    /// Size-limit verdict.
    pub fn file_too_large() -> Self {
        Self {
            outcome: ScanOutcome::FileTooLarge,
            detail: Some(FILE_LIMIT_MESSAGE.to_string()),
        }
    }

    /// Unavailable verdict with an optional diagnostic.
    pub fn unavailable(detail: Option<String>) -> Self {
        Self {
            outcome: ScanOutcome::ScannerUnavailable,
            detail,
        }
    }

    /// Whether the verdict is `Clean`.
    pub fn is_clean(&self) -> bool {
        self.outcome == ScanOutcome::Clean
    }
}

/// Anything that can produce a verdict for a byte stream.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan the whole stream.
    async fn scan(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> ScanVerdict;
}

#[async_trait]
impl Scanner for ClamdClient {
    async fn scan(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> ScanVerdict {
        let result = ClamdClient::scan(self, stream).await;
        classify(result, &self.endpoint().to_string())
    }
}

/// Map a clamd exchange to a verdict.
fn classify(result: Result<ScanResult, ClamdError>, endpoint: &str) -> ScanVerdict {
    match result {
        Ok(ScanResult::Clean) => ScanVerdict::clean(),
        Ok(ScanResult::Infected { virus_name }) => ScanVerdict::infected(virus_name),
        Ok(ScanResult::SizeLimitExceeded) => {
            warn!(endpoint = %endpoint, "{}", FILE_LIMIT_MESSAGE);
            ScanVerdict::file_too_large()
        }
        Ok(ScanResult::Error { message }) => {
            error!(endpoint = %endpoint, error = %message, "clamd reported a scan error");
            ScanVerdict::unavailable(Some(format!("{UNAVAILABLE_MESSAGE} {message}")))
        }
        Err(ClamdError::Upload(e)) => {
            error!(endpoint = %endpoint, error = %e, "Failed to read the upload stream");
            ScanVerdict::unavailable(Some(ClamdError::Upload(e).to_string()))
        }
        Err(ClamdError::EmptyResponse) => {
            error!(endpoint = %endpoint, "clamd returned no verdict");
            ScanVerdict::unavailable(None)
        }
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "{}", UNAVAILABLE_MESSAGE);
            ScanVerdict::unavailable(Some(format!("{UNAVAILABLE_MESSAGE} {e}")))
        }
    }
}
