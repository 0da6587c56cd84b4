use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::util::{MonotonicProgress, format_speed, progress_fraction};

pub mod archive;
pub mod codec;

pub use archive::{ArchiveKind, extract_archive};

const USER_AGENT: &str = concat!("spt-launcher/", env!("CARGO_PKG_VERSION"));
/// Smallest progress step forwarded to the sink between chunks.
const PROGRESS_STEP: f32 = 0.005;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download cancelled")]
    Cancelled,
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("download incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether a second attempt against the same source may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Request { .. } | TransferError::Incomplete { .. } => true,
            TransferError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Streams HTTP bodies to disk or any async writer.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .unwrap_or_else(|err| {
                warn!("downloader: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Stream `url` into `dest`, reporting fractional progress when the length is known.
    ///
    /// On error or cancellation `dest` may hold a partial body; the caller discards it.
    pub async fn download<W>(
        &self,
        url: &str,
        dest: &mut W,
        progress: &mut (dyn FnMut(f32) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        debug!("download: GET {url}");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            resp = self.client.get(url).send() => resp.map_err(|source| TransferError::Request {
                url: url.to_owned(),
                source,
            })?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut gate = MonotonicProgress::new(progress);
        if total.is_some() {
            gate.report(0.0);
        }

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("download: cancelled after {downloaded} bytes of {url}");
                    return Err(TransferError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|source| TransferError::Request {
                url: url.to_owned(),
                source,
            })?;
            dest.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(fraction) = progress_fraction(downloaded, total) {
                let advanced = gate
                    .last()
                    .is_none_or(|last| fraction - last >= PROGRESS_STEP);
                if advanced && fraction < 1.0 {
                    gate.report(fraction);
                }
            }

            let elapsed = last_tick.elapsed().as_secs_f32();
            if elapsed > 0.2 {
                let speed = (downloaded - last_bytes) as f32 / elapsed;
                debug!(
                    "download: {} bytes of {:?} ({})",
                    downloaded,
                    total,
                    format_speed(speed)
                );
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }
        dest.flush().await?;

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(TransferError::Incomplete {
                    received: downloaded,
                    expected,
                });
            }
            gate.report(1.0);
        }

        debug!("download: completed {url} ({downloaded} bytes)");
        Ok(downloaded)
    }

    /// Download to a file, deleting it again on any failure.
    pub async fn download_to_path(
        &self,
        url: &str,
        path: &Path,
        progress: &mut (dyn FnMut(f32) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let result = self.download(url, &mut file, progress, cancel).await;
        drop(file);
        if result.is_err() {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }

    /// `download_to_path` with one extra attempt for transient failures.
    pub async fn download_with_retry(
        &self,
        url: &str,
        path: &Path,
        progress: &mut (dyn FnMut(f32) + Send),
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        match self.download_to_path(url, path, progress, cancel).await {
            Err(err) if err.is_transient() => {
                warn!("download: {err}; retrying {url} once");
                self.download_to_path(url, path, progress, cancel).await
            }
            other => other,
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare a file's SHA-256 against a hex digest (case-insensitive).
pub fn verify_sha256(path: &Path, expected: &str) -> Result<(), TransferError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected.trim().to_lowercase() {
        return Err(TransferError::Checksum {
            expected: expected.to_owned(),
            actual,
        });
    }
    info!("checksum: verified {}", path.display());
    Ok(())
}

/// `verify_sha256` on the blocking pool, for callers on the async executor.
pub async fn verify_sha256_file(path: &Path, expected: &str) -> Result<(), TransferError> {
    let path = path.to_path_buf();
    let expected = expected.to_owned();
    tokio::task::spawn_blocking(move || verify_sha256(&path, &expected))
        .await
        .map_err(|err| TransferError::Io(std::io::Error::other(err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Route, TestServer};

    #[tokio::test]
    async fn reports_strictly_increasing_progress_ending_at_one() {
        let body = vec![7u8; 1_000_000];
        let server = TestServer::start(vec![("/big.zip", Route::ok(body.clone()))]).await;
        let mut seen = Vec::new();
        let mut sink = |v: f32| seen.push(v);
        let mut out = Vec::new();

        let written = Downloader::new()
            .download(
                &server.url("/big.zip"),
                &mut out,
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .expect("download succeeds");

        assert_eq!(written, 1_000_000);
        assert_eq!(out, body);
        assert_eq!(seen.first().copied(), Some(0.0));
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    }

    #[tokio::test]
    async fn unknown_length_completes_without_progress() {
        let server =
            TestServer::start(vec![("/blob", Route::ok(vec![1u8; 4096]).without_length())]).await;
        let mut seen = Vec::new();
        let mut sink = |v: f32| seen.push(v);
        let mut out = Vec::new();

        let written = Downloader::new()
            .download(&server.url("/blob"), &mut out, &mut sink, &CancellationToken::new())
            .await
            .expect("download succeeds");

        assert_eq!(written, 4096);
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_typed() {
        let server = TestServer::start(vec![("/gone", Route::status(404))]).await;
        let mut sink = |_: f32| {};
        let err = Downloader::new()
            .download(
                &server.url("/gone"),
                &mut Vec::new(),
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .expect_err("404 fails");
        assert!(matches!(err, TransferError::Status { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_stalled_transfer_and_removes_the_file() {
        let server =
            TestServer::start(vec![("/slow", Route::ok(vec![0u8; 200_000]).stalled())]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.bin");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let mut sink = |_: f32| {};

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            Downloader::new().download_to_path(&server.url("/slow"), &path, &mut sink, &cancel),
        )
        .await
        .expect("cancellation is prompt");

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn retries_transient_status_once() {
        let server = TestServer::start(vec![("/flaky", Route::status(503))]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = |_: f32| {};

        let err = Downloader::new()
            .download_with_retry(
                &server.url("/flaky"),
                &dir.path().join("flaky"),
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .expect_err("still failing");

        assert!(err.is_transient());
        assert_eq!(server.hits("/flaky"), 2);
    }

    #[test]
    fn verifies_sha256_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload");
        fs::write(&path, b"abc").expect("write payload");
        verify_sha256(
            &path,
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
        )
        .expect("digest matches");
        assert!(matches!(
            verify_sha256(&path, "00"),
            Err(TransferError::Checksum { .. })
        ));
    }

    #[tokio::test]
    async fn verifies_off_the_executor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload");
        fs::write(&path, b"abc").expect("write payload");
        verify_sha256_file(
            &path,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .await
        .expect("digest matches");
        assert!(matches!(
            verify_sha256_file(&dir.path().join("missing"), "00").await,
            Err(TransferError::Io(_))
        ));
    }
}
