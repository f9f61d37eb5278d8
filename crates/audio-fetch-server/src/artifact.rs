//! Artifact discovery, cleanup, and streaming delivery.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use actix_web::web::Bytes;
use futures_util::Stream;
use tokio_util::io::ReaderStream;

use crate::errors::DownloadError;

/// File-name prefix shared by every per-job artifact.
pub const ARTIFACT_PREFIX: &str = "audio_";

/// Polling cadence for the artifact after a successful extractor exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between directory listings.
    pub interval: Duration,
    /// Listings before giving up on a missing artifact.
    pub max_attempts: u32,
    /// Delay after a failed directory read.
    pub io_retry_interval: Duration,
    /// Failed reads tolerated before surfacing an I/O error.
    pub io_max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            max_attempts: 20,
            io_retry_interval: Duration::from_millis(500),
            io_max_attempts: 10,
        }
    }
}

/// Locates a job's output file with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPoller {
    policy: PollPolicy,
}

impl ArtifactPoller {
    #[cfg(test)]
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    /// Poll `dir` for `<stem>.<extension>`.
    pub async fn locate(
        &self,
        dir: &Path,
        stem: &str,
        extension: &str,
    ) -> Result<PathBuf, DownloadError> {
        let mut attempts = 0u32;
        let mut io_failures = 0u32;
        loop {
            match find_artifact(dir, stem, extension).await {
                Ok(Some(path)) => {
                    tracing::debug!(path = %path.display(), attempts, "artifact found");
                    return Ok(path);
                }
                Ok(None) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        tracing::error!(
                            dir = %dir.display(),
                            stem,
                            attempts,
                            "artifact never appeared"
                        );
                        return Err(DownloadError::OutputMissing);
                    }
                    if attempts % 5 == 1 {
                        tracing::info!(
                            stem,
                            attempt = attempts,
                            max_attempts = self.policy.max_attempts,
                            "artifact not found yet"
                        );
                    }
                    tokio::time::sleep(self.policy.interval).await;
                }
                Err(e) => {
                    io_failures += 1;
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        attempt = io_failures,
                        "reading work dir failed"
                    );
                    if io_failures >= self.policy.io_max_attempts {
                        return Err(DownloadError::Io(e.to_string()));
                    }
                    tokio::time::sleep(self.policy.io_retry_interval).await;
                }
            }
        }
    }
}

/// A missing directory is an ordinary miss; other read errors are surfaced.
async fn find_artifact(dir: &Path, stem: &str, extension: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    // Intermediate files such as `<stem>.temp.wav` or `<stem>.webm.part`
    // share the stem but are not the final artifact.
    let wanted = format!("{stem}.{extension}");
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy() == wanted {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// True for `stem` itself or `stem.<anything>`; `audio_12` does not own
/// `audio_123.wav`.
fn belongs_to(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Remove every file belonging to one job (partial downloads included),
/// except `keep` when the artifact is still being delivered.
pub async fn cleanup_job_files(dir: &Path, stem: &str, keep: Option<&Path>) -> io::Result<usize> {
    let keep_name = keep.and_then(Path::file_name).map(|name| name.to_string_lossy().to_string());
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if !belongs_to(&file_name, stem) || keep_name.as_deref() == Some(&*file_name) {
            continue;
        }
        if tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove stale artifacts left by a previous run.
///
/// Blocking; called at startup and from the Ctrl+C handler thread.
pub fn cleanup_stale_artifacts(dir: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if !file_name.starts_with(ARTIFACT_PREFIX) {
            continue;
        }
        if std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Deletes the artifact when dropped, whatever happened to the response.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
}

impl ArtifactGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "temporary artifact deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to delete temporary artifact"
            ),
        }
    }
}

/// An opened artifact ready to be streamed.
#[derive(Debug)]
pub struct Artifact {
    file: tokio::fs::File,
    size: u64,
    guard: ArtifactGuard,
}

impl Artifact {
    /// Open the artifact; the guard takes ownership of its cleanup immediately,
    /// so a failed open still deletes the file.
    pub async fn open(path: PathBuf) -> Result<Self, DownloadError> {
        let guard = ArtifactGuard::new(path);
        let file = tokio::fs::File::open(guard.path())
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?
            .len();
        Ok(Self { file, size, guard })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    /// Convert into a body stream that removes the file once dropped.
    pub fn into_stream(self) -> ArtifactStream {
        ArtifactStream {
            inner: ReaderStream::new(self.file),
            size: self.size,
            sent: 0,
            _guard: self.guard,
        }
    }
}

/// Response body over the artifact; logs delivery failures and deletes the
/// file when the HTTP layer drops it.
pub struct ArtifactStream {
    inner: ReaderStream<tokio::fs::File>,
    size: u64,
    sent: u64,
    _guard: ArtifactGuard,
}

impl Stream for ArtifactStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => self.sent += chunk.len() as u64,
            Poll::Ready(Some(Err(e))) => {
                let err = DownloadError::Delivery(e.to_string());
                tracing::error!(kind = err.kind(), error = %err, "artifact read failed mid-stream");
            }
            _ => {}
        }
        polled
    }
}

impl Drop for ArtifactStream {
    fn drop(&mut self) {
        if self.sent >= self.size {
            tracing::info!(bytes = self.sent, "file sent successfully");
        } else {
            tracing::warn!(
                sent = self.sent,
                size = self.size,
                "delivery ended before the whole artifact was sent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::test_support::temp_dir;

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 5,
            io_retry_interval: Duration::from_millis(10),
            io_max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn finds_existing_artifact() {
        let dir = temp_dir("poll-found");
        std::fs::write(dir.join("audio_42.wav"), b"RIFF").unwrap();
        let path = ArtifactPoller::new(fast_policy())
            .locate(&dir, "audio_42", "wav")
            .await
            .unwrap();
        assert_eq!(path, dir.join("audio_42.wav"));
    }

    #[tokio::test]
    async fn finds_artifact_that_appears_late() {
        let dir = temp_dir("poll-late");
        let target = dir.join("audio_7.wav");
        let writer = {
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                std::fs::write(target, b"RIFF").unwrap();
            })
        };
        let path = ArtifactPoller::new(fast_policy())
            .locate(&dir, "audio_7", "wav")
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(path, target);
    }

    #[tokio::test]
    async fn missing_artifact_is_output_missing() {
        let dir = temp_dir("poll-missing");
        std::fs::write(dir.join("audio_5.webm.part"), b"partial").unwrap();
        std::fs::write(dir.join("audio_5.temp.wav"), b"transcoding").unwrap();
        std::fs::write(dir.join("audio_55.wav"), b"other job").unwrap();
        let err = ArtifactPoller::new(fast_policy())
            .locate(&dir, "audio_5", "wav")
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::OutputMissing);
    }

    #[tokio::test]
    async fn missing_directory_counts_as_miss() {
        let dir = temp_dir("poll-nodir").join("does-not-exist");
        let err = ArtifactPoller::new(fast_policy())
            .locate(&dir, "audio_1", "wav")
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::OutputMissing);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_work_dir_surfaces_io_error() {
        let dir = temp_dir("poll-notdir");
        let not_a_dir = dir.join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let started = std::time::Instant::now();
        let err = ArtifactPoller::new(fast_policy())
            .locate(&not_a_dir, "audio_1", "wav")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Io(_)), "unexpected error: {err:?}");
        assert_eq!(err.message(), "Error processing file");
        // Two retry sleeps between three failed reads.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn job_cleanup_only_touches_own_files() {
        let dir = temp_dir("cleanup");
        for name in ["audio_9.wav", "audio_9.webm.part", "audio_99.wav", "notes.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        std::fs::write(dir.join("audio_9.temp.wav"), b"x").unwrap();
        let keep = dir.join("audio_9.wav");
        assert_eq!(cleanup_job_files(&dir, "audio_9", Some(&keep)).await.unwrap(), 2);
        assert!(keep.exists());
        assert_eq!(cleanup_job_files(&dir, "audio_9", None).await.unwrap(), 1);
        assert!(dir.join("audio_99.wav").exists());
        assert_eq!(cleanup_stale_artifacts(&dir).unwrap(), 1);
        assert!(dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn stream_delivers_bytes_and_deletes_file() {
        let dir = temp_dir("stream");
        let path = dir.join("audio_3.wav");
        std::fs::write(&path, b"RIFF----WAVE").unwrap();
        let artifact = Artifact::open(path.clone()).await.unwrap();
        assert_eq!(artifact.size(), 12);
        let mut stream = artifact.into_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        drop(stream);
        assert_eq!(body, b"RIFF----WAVE");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_undelivered_artifact_deletes_file() {
        let dir = temp_dir("stream-drop");
        let path = dir.join("audio_4.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        let artifact = Artifact::open(path.clone()).await.unwrap();
        drop(artifact);
        assert!(!path.exists());
    }
}
