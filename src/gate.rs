//! Upload gate.
//!
//! Two entry points for the host platform: [`UploadGate::evaluate_upload`]
//! scans a file and hands back a scan token, [`UploadGate::authorize_commit`]
//! decides later whether the file may be stored without a new scan.

use serde::Serialize;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use tracing::{debug, error, info, warn};

use crate::clamd::ClamdClient;
use crate::config::{Config, Settings};
use crate::error::{ConfigError, ScanOutcomeError};
use crate::scanner::{ScanOutcome, ScanVerdict, Scanner, FILE_LIMIT_MESSAGE};
use crate::token::TokenSigner;

/// Logged in place of the containing resource when the host does not know it.
pub const UNKNOWN_RESOURCE: &str = "<PACKAGE IS NOT CREATED>";

/// An uploaded file as handed over by the host.
#[derive(Debug)]
pub struct UploadedFile<R> {
    /// Client-side file name.
    pub filename: String,
    /// Size the client declared, in bytes.
    pub declared_size: u64,
    /// File content.
    pub stream: R,
}

impl<R> UploadedFile<R> {
    /// Wrap an upload stream.
    pub fn new(filename: impl Into<String>, declared_size: u64, stream: R) -> Self {
        Self {
            filename: filename.into(),
            declared_size,
            stream,
        }
    }
}

impl<R: AsyncSeek + Unpin> UploadedFile<R> {
    /// Actual length of the content. Leaves the stream rewound.
    pub async fn measure_size(&mut self) -> std::io::Result<u64> {
        let len = self.stream.seek(SeekFrom::End(0)).await?;
        self.stream.seek(SeekFrom::Start(0)).await?;
        Ok(len)
    }
}

impl UploadedFile<tokio::fs::File> {
    /// Open a file on disk, using its metadata length as the declared size.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(filename, size, file))
    }
}

/// Answer to a scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResponse {
    /// Whether the upload may proceed.
    pub success: bool,
    /// Scan token for the commit step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Human readable reason for a refusal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResponse {
    fn accepted(token: String) -> Self {
        Self {
            success: true,
            token: Some(token),
            error: None,
        }
    }

    fn rejected(error: impl ToString) -> Self {
        Self {
            success: false,
            token: None,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of the commit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitDecision {
    /// A valid scan token vouches for the file.
    PreScanned,
    /// No valid token, accepted because unscanned uploads are allowed.
    Unscanned,
}

/// Scanning gate in front of upload storage.
pub struct UploadGate {
    settings: Settings,
    scanner: Arc<dyn Scanner>,
    signer: TokenSigner,
}

impl UploadGate {
    /// Create a gate from its parts.
    pub fn new(settings: Settings, scanner: Arc<dyn Scanner>, signer: TokenSigner) -> Self {
        Self {
            settings,
            scanner,
            signer,
        }
    }

    /// Create a gate backed by clamd.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let client = ClamdClient::from_config(&config.clamd)?;
        let signer = TokenSigner::new(&config.token)?;

        info!(
            endpoint = %client.endpoint(),
            upload_unscanned = config.settings.upload_unscanned,
            max_upload_size = config.settings.max_upload_size,
            "Upload gate initialized"
        );

        Ok(Self::new(config.settings.clone(), Arc::new(client), signer))
    }

    /// Token signer shared with the commit step.
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Scan an upload and issue a scan token.
    ///
    /// Clean files get a `safe` token. Files that could not be scanned get an
    /// unsafe token when unscanned uploads are allowed. `resource_id` names
    /// the containing resource in bypass logs.
    pub async fn evaluate_upload<R>(
        &self,
        file: &mut UploadedFile<R>,
        resource_id: Option<&str>,
    ) -> UploadResponse
    where
        R: AsyncRead + Unpin + Send,
    {
        let safe = match self.check_upload(file, resource_id).await {
            Ok(safe) => safe,
            Err(e) => return UploadResponse::rejected(e),
        };

        match self.signer.issue(&file.filename, file.declared_size, safe) {
            Ok(token) => UploadResponse::accepted(token),
            Err(e) => {
                error!(error = %e, filename = %file.filename, "Failed to issue scan token");
                UploadResponse::rejected(e)
            }
        }
    }

    /// Scan and apply policy. `Ok(true)` means scanned clean, `Ok(false)`
    /// means accepted unscanned.
    async fn check_upload<R>(
        &self,
        file: &mut UploadedFile<R>,
        resource_id: Option<&str>,
    ) -> Result<bool, ScanOutcomeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if file.declared_size > self.settings.max_upload_size {
            debug!(
                filename = %file.filename,
                size = file.declared_size,
                max_size = self.settings.max_upload_size,
                "Upload exceeds max size, not scanning"
            );
            return Err(ScanOutcomeError::TooLarge {
                size: file.declared_size,
                limit: self.settings.max_upload_size,
            });
        }

        let verdict = self.scanner.scan(&mut file.stream).await;
        self.apply_policy(&file.filename, verdict, resource_id)
    }

    fn apply_policy(
        &self,
        filename: &str,
        verdict: ScanVerdict,
        resource_id: Option<&str>,
    ) -> Result<bool, ScanOutcomeError> {
        match verdict.outcome {
            ScanOutcome::Clean => {
                if self.settings.log_clean {
                    info!(filename = %filename, "Scan complete: clean");
                } else {
                    debug!(filename = %filename, "Scan complete: clean");
                }
                Ok(true)
            }
            ScanOutcome::Infected => {
                let err = ScanOutcomeError::Infected {
                    filename: filename.to_string(),
                    signature: verdict.detail.unwrap_or_default(),
                };
                warn!(filename = %filename, "{}", err);
                Err(err)
            }
            ScanOutcome::FileTooLarge | ScanOutcome::ScannerUnavailable => {
                if self.settings.upload_unscanned {
                    info!(
                        filename = %filename,
                        pkg = resource_id.unwrap_or(UNKNOWN_RESOURCE),
                        outcome = ?verdict.outcome,
                        "The unscanned file will be uploaded because unscanned fileupload is enabled"
                    );
                    return Ok(false);
                }

                if verdict.outcome == ScanOutcome::FileTooLarge {
                    Err(ScanOutcomeError::FileLimit(
                        verdict
                            .detail
                            .unwrap_or_else(|| FILE_LIMIT_MESSAGE.to_string()),
                    ))
                } else {
                    Err(ScanOutcomeError::Disabled)
                }
            }
        }
    }

    /// Decide whether a file may be stored without scanning it again.
    ///
    /// `size` must be the real content length, see
    /// [`UploadedFile::measure_size`].
    pub fn authorize_commit(
        &self,
        filename: &str,
        size: u64,
        token: Option<&str>,
    ) -> Result<CommitDecision, ScanOutcomeError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return self.commit_unverified(filename, "no scan token presented");
        };

        match self.signer.verify(token, filename, size) {
            Ok(_) => Ok(CommitDecision::PreScanned),
            Err(e) => self.commit_unverified(filename, &e.to_string()),
        }
    }

    fn commit_unverified(
        &self,
        filename: &str,
        reason: &str,
    ) -> Result<CommitDecision, ScanOutcomeError> {
        if self.settings.upload_unscanned {
            info!(
                filename = %filename,
                reason = %reason,
                "Committing upload without a valid scan token"
            );
            return Ok(CommitDecision::Unscanned);
        }

        warn!(filename = %filename, reason = %reason, "Upload commit refused");
        Err(ScanOutcomeError::NotScanned)
    }
}
