//! ClamAV daemon client using INSTREAM protocol.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClamdConfig;
use crate::error::ConfigError;

/// Reply clamd sends when a stream exceeds its `StreamMaxLength`.
const SIZE_LIMIT_REPLY: &str = "INSTREAM size limit exceeded";

/// Where the ClamAV daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClamdEndpoint {
    /// Filesystem-domain socket.
    Unix {
        /// Path to the clamd socket.
        path: PathBuf,
    },
    /// TCP socket.
    Tcp {
        /// Daemon host name or address.
        host: String,
        /// Daemon port.
        port: u16,
    },
}

impl fmt::Display for ClamdEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClamdEndpoint::Unix { path } => write!(f, "unix:{}", path.display()),
            ClamdEndpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Parsed reply of a single clamd scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File is clean.
    Clean,
    /// Malware detected.
    Infected {
        /// Name of the detected virus/malware.
        virus_name: String,
    },
    /// The daemon refused the stream because it exceeds its size limit.
    SizeLimitExceeded,
    /// Scan error reported by the daemon.
    Error {
        /// Error message.
        message: String,
    },
}

/// Error from ClamAV operations.
#[derive(Debug, thiserror::Error)]
pub enum ClamdError {
    /// Connection to clamd failed.
    #[error("Connection to clamd failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    /// A socket operation did not finish in time.
    #[error("Scan timed out")]
    Timeout,
    /// I/O error during scan.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// clamd closed the connection without answering.
    #[error("Empty response from clamd")]
    EmptyResponse,
    /// Invalid response from clamd.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// The upload itself could not be read; clamd is not at fault.
    #[error("Failed to read upload: {0}")]
    Upload(#[source] std::io::Error),
}

/// Byte stream to the daemon, whichever socket kind backs it.
trait ClamdStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClamdStream for T {}

/// Open a connection to `endpoint`, bounded by `limit`.
async fn connect(
    endpoint: &ClamdEndpoint,
    limit: Duration,
) -> Result<Box<dyn ClamdStream>, ClamdError> {
    let stream: Box<dyn ClamdStream> = match endpoint {
        ClamdEndpoint::Unix { path } => match timeout(limit, UnixStream::connect(path)).await {
            Ok(Ok(s)) => Box::new(s),
            Ok(Err(e)) => return Err(ClamdError::ConnectionFailed(e)),
            Err(_) => return Err(ClamdError::Timeout),
        },
        ClamdEndpoint::Tcp { host, port } => {
            match timeout(limit, TcpStream::connect((host.as_str(), *port))).await {
                Ok(Ok(s)) => Box::new(s),
                Ok(Err(e)) => return Err(ClamdError::ConnectionFailed(e)),
                Err(_) => return Err(ClamdError::Timeout),
            }
        }
    };
    Ok(stream)
}

/// Run one socket operation under the per-operation timeout.
async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = std::io::Result<T>>,
) -> Result<T, ClamdError> {
    match timeout(limit, op).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ClamdError::Io(e)),
        Err(_) => Err(ClamdError::Timeout),
    }
}

/// ClamAV daemon client.
#[derive(Debug, Clone)]
pub struct ClamdClient {
    endpoint: ClamdEndpoint,
    timeout: Duration,
    chunk_size: usize,
}

impl ClamdClient {
    /// Create a new ClamAV client.
    pub fn new(endpoint: ClamdEndpoint, timeout: Duration, chunk_size: usize) -> Self {
        Self {
            endpoint,
            timeout,
            chunk_size,
        }
    }

    /// Build a client from configuration.
    ///
    /// A TCP endpoint without host or port fails here, before any scan is
    /// attempted.
    pub fn from_config(config: &ClamdConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.endpoint()?,
            Duration::from_secs(config.timeout_secs),
            config.chunk_size,
        ))
    }

    /// Daemon endpoint this client talks to.
    pub fn endpoint(&self) -> &ClamdEndpoint {
        &self.endpoint
    }

    /// Stream `data` to clamd using the INSTREAM protocol.
    ///
    /// The INSTREAM protocol:
    /// 1. Send "nINSTREAM\n"
    /// 2. Send chunks as [4-byte big-endian length][data]
    /// 3. Send [0x00 0x00 0x00 0x00] to end stream
    /// 4. Read response: "stream: OK\n" or "stream: <virus> FOUND\n"
    ///
    /// Every socket operation is bounded by the configured timeout. If a
    /// write fails, the reply is still read so a size-limit refusal is not
    /// lost. The connection is dropped on every return path.
    pub async fn scan<R>(&self, data: &mut R) -> Result<ScanResult, ClamdError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug!(endpoint = %self.endpoint, "Starting ClamAV scan");

        let mut stream = connect(&self.endpoint, self.timeout).await?;
        bounded(self.timeout, stream.write_all(b"nINSTREAM\n")).await?;

        match self.send_chunks(&mut stream, data).await {
            Ok(sent) => debug!(bytes = sent, "Stream sent to clamd"),
            Err(ClamdError::Io(e)) => {
                // clamd hangs up once StreamMaxLength is hit, possibly before
                // the terminator goes out; its reply may still be waiting in
                // the socket.
                warn!(error = %e, "clamd stopped accepting the stream");
                return match self.read_reply(&mut stream).await {
                    Ok(ScanResult::SizeLimitExceeded) => Ok(ScanResult::SizeLimitExceeded),
                    _ => Err(ClamdError::Io(e)),
                };
            }
            Err(e) => return Err(e),
        }

        self.read_reply(&mut stream).await
    }

    /// Write `data` as length-prefixed chunks followed by the zero-length
    /// terminator. Returns the number of payload bytes sent.
    async fn send_chunks<R>(
        &self,
        stream: &mut Box<dyn ClamdStream>,
        data: &mut R,
    ) -> Result<u64, ClamdError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            let n = data.read(&mut buf).await.map_err(ClamdError::Upload)?;
            if n == 0 {
                break;
            }

            let len = (n as u32).to_be_bytes();
            bounded(self.timeout, stream.write_all(&len)).await?;
            bounded(self.timeout, stream.write_all(&buf[..n])).await?;
            sent += n as u64;
        }

        bounded(self.timeout, stream.write_all(&[0u8; 4])).await?;
        bounded(self.timeout, stream.flush()).await?;
        Ok(sent)
    }

    /// Check if clamd is available by sending PING.
    pub async fn ping(&self) -> Result<bool, ClamdError> {
        let response = self.command(b"nPING\n").await?;
        Ok(response == "PONG")
    }

    /// Get clamd version.
    pub async fn version(&self) -> Result<String, ClamdError> {
        self.command(b"nVERSION\n").await
    }

    async fn command(&self, cmd: &[u8]) -> Result<String, ClamdError> {
        let mut stream = connect(&self.endpoint, self.timeout).await?;
        bounded(self.timeout, stream.write_all(cmd)).await?;

        let response = self.read_to_end(&mut stream).await?;
        Ok(response.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
    }

    async fn read_reply(&self, stream: &mut Box<dyn ClamdStream>) -> Result<ScanResult, ClamdError> {
        let response = self.read_to_end(stream).await?;
        debug!(response = %response.trim(), "ClamAV response");
        parse_response(&response)
    }

    async fn read_to_end(&self, stream: &mut Box<dyn ClamdStream>) -> Result<String, ClamdError> {
        let mut response = Vec::new();
        bounded(self.timeout, stream.read_to_end(&mut response)).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Parse ClamAV scan response.
///
/// Expected formats:
/// - "stream: OK\n" - file is clean
/// - "stream: <virus_name> FOUND\n" - malware detected
/// - "INSTREAM size limit exceeded. ERROR\n" - stream over StreamMaxLength
/// - "stream: <error> ERROR\n" - scan error
fn parse_response(response: &str) -> Result<ScanResult, ClamdError> {
    let response = response.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if response.is_empty() {
        return Err(ClamdError::EmptyResponse);
    }

    if response == "stream: OK" {
        return Ok(ScanResult::Clean);
    }

    if response.contains(SIZE_LIMIT_REPLY) {
        return Ok(ScanResult::SizeLimitExceeded);
    }

    if let Some(virus_name) = response
        .strip_prefix("stream: ")
        .and_then(|s| s.strip_suffix(" FOUND"))
    {
        return Ok(ScanResult::Infected {
            virus_name: virus_name.to_string(),
        });
    }

    if let Some(message) = response.strip_suffix(" ERROR") {
        let message = message.strip_prefix("stream: ").unwrap_or(message);
        return Ok(ScanResult::Error {
            message: message.to_string(),
        });
    }

    Err(ClamdError::InvalidResponse(response.to_string()))
}

/// In-process stand-in for clamd, listening on a temporary socket.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::path::Path;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::net::{TcpListener, UnixListener};
    use tokio::task::JoinHandle;

    /// Accept one INSTREAM session, answer with `reply` and return the bytes
    /// that were streamed.
    pub(crate) fn serve_once(path: &Path, reply: &'static [u8]) -> JoinHandle<Vec<u8>> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            session(sock, reply).await
        })
    }

    /// Same as [`serve_once`] over TCP.
    pub(crate) fn serve_tcp_once(
        listener: TcpListener,
        reply: &'static [u8],
    ) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            session(sock, reply).await
        })
    }

    async fn session<S>(mut sock: S, reply: &[u8]) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cmd = [0u8; 10];
        sock.read_exact(&mut cmd).await.unwrap();
        assert_eq!(&cmd, b"nINSTREAM\n");

        let mut received = Vec::new();
        loop {
            let mut len = [0u8; 4];
            sock.read_exact(&mut len).await.unwrap();
            let len = u32::from_be_bytes(len) as usize;
            if len == 0 {
                break;
            }
            let mut chunk = vec![0u8; len];
            sock.read_exact(&mut chunk).await.unwrap();
            received.extend_from_slice(&chunk);
        }

        sock.write_all(reply).await.unwrap();
        sock.shutdown().await.unwrap();
        received
    }

    pub(crate) fn client(path: &Path) -> ClamdClient {
        ClamdClient::new(
            ClamdEndpoint::Unix {
                path: path.to_path_buf(),
            },
            Duration::from_secs(5),
            4,
        )
    }

    /// Upload whose every read fails.
    pub(crate) struct BrokenUpload;

    impl AsyncRead for BrokenUpload {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "upload truncated",
            )))
        }
    }
}
