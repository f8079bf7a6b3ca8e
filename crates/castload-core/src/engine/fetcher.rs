//! Episode fetcher - one HTTP transfer per episode
//!
//! Streams a single GET response into a temp file, reporting byte counts to
//! the progress cache, then promotes the temp file onto the final path.
//! The temp file is removed on every exit path, and a failed download never
//! leaves an artifact at the final path.

use crate::error::DownloadError;
use crate::progress::ProgressCache;
use castload_types::Episode;
use futures::StreamExt;
use reqwest::header;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

const USER_AGENT: &str = "Castload";

/// Content types that mean we got an error page instead of media.
const INVALID_CONTENT_TYPES: [&str; 3] = ["application/xml", "text/html", "application/xhtml+xml"];

// things smaller than 150kb are suspect, probably text, xml or html error pages
const SUSPECT_EPISODE_SIZE: u64 = 150 * 1024;

// things smaller than 10kb are not episodes, way too small and something has gone wrong
const BAD_EPISODE_SIZE: u64 = 10 * 1024;

/// Result of one fetch. All failures are typed here; nothing propagates as
/// a raw error past the fetcher.
#[derive(Debug)]
pub enum FetchOutcome {
    Success { download_file: PathBuf, bytes: u64 },
    Cancelled,
    InvalidDownloadUrl,
    UnsuccessfulHttpCall { code: u16 },
    InvalidContentType { content_type: String },
    SuspiciousFileSize { bytes: u64 },
    ExceptionFailure(DownloadError),
}

impl FetchOutcome {
    /// Human-readable reason for a failed fetch. `None` for success and
    /// cancellation.
    pub fn error_message(&self) -> Option<String> {
        let message = match self {
            FetchOutcome::Success { .. } | FetchOutcome::Cancelled => return None,
            FetchOutcome::InvalidDownloadUrl => {
                "Episode not available due to an error in the podcast feed. \
                 Contact the podcast author."
                    .to_string()
            }
            FetchOutcome::UnsuccessfulHttpCall { code: 404 } => {
                "Episode not found, the file may have been moved or deleted. \
                 Contact the podcast author."
                    .to_string()
            }
            FetchOutcome::UnsuccessfulHttpCall { code } => format!(
                "This episode may have been moved or deleted. \
                 Contact the podcast author. (error {code})"
            ),
            FetchOutcome::InvalidContentType { .. } => {
                "This episode may have been moved or deleted. Contact the podcast author."
                    .to_string()
            }
            FetchOutcome::SuspiciousFileSize { .. } => {
                "File not found. The podcast author may have moved or deleted this episode file."
                    .to_string()
            }
            FetchOutcome::ExceptionFailure(error) => match error {
                DownloadError::OutOfStorage => {
                    "Unable to download podcast episode. Check your storage space.".to_string()
                }
                DownloadError::Network(source) if source.is_timeout() => {
                    "The podcast author's server timed out.".to_string()
                }
                DownloadError::Network(_) => {
                    "Unable to download podcast episode. Check your internet connection."
                        .to_string()
                }
                DownloadError::TruncatedBody { .. } => {
                    "Download failed, only part of the episode was downloaded.".to_string()
                }
                DownloadError::Io(_) => {
                    "An error occurred saving your download. Try again, if the error \
                     persists there might be an issue with your device."
                        .to_string()
                }
                _ => "Download failed.".to_string(),
            },
        };
        Some(message)
    }

    /// Whether the scheduler should retry after this outcome.
    pub fn should_retry(&self) -> bool {
        match self {
            FetchOutcome::Success { .. }
            | FetchOutcome::Cancelled
            | FetchOutcome::InvalidDownloadUrl => false,
            FetchOutcome::UnsuccessfulHttpCall { .. }
            | FetchOutcome::InvalidContentType { .. }
            | FetchOutcome::SuspiciousFileSize { .. } => true,
            FetchOutcome::ExceptionFailure(error) => error.is_retryable(),
        }
    }
}

/// Removes the temp file when the fetch unwinds, success or failure.
struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Downloads one episode at a time. One invocation is one logical unit of
/// work: everything, including cleanup, completes before `download`
/// returns, so the caller's bookkeeping can treat the return as the sole
/// completion signal.
#[derive(Clone)]
pub struct EpisodeFetcher {
    client: Client,
    progress: ProgressCache,
}

impl EpisodeFetcher {
    pub fn new(client: Client, progress: ProgressCache) -> Self {
        Self { client, progress }
    }

    pub async fn download(
        &self,
        episode: &Episode,
        download_file: &Path,
        temp_file: &Path,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let url = match parse_download_url(episode) {
            Some(url) => url,
            None => return FetchOutcome::InvalidDownloadUrl,
        };

        let _temp_guard = TempFileGuard {
            path: temp_file.to_path_buf(),
        };
        let outcome = self
            .fetch(episode, url, download_file, temp_file, cancel)
            .await;

        if !matches!(outcome, FetchOutcome::Success { .. }) {
            // No corrupt artifact survives a failed download.
            let _ = fs::remove_file(download_file).await;
        }
        outcome
    }

    async fn fetch(
        &self,
        episode: &Episode,
        url: Url,
        download_file: &Path,
        temp_file: &Path,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        for path in [download_file, temp_file] {
            if let Some(parent) = path.parent() {
                if let Err(error) = fs::create_dir_all(parent).await {
                    return FetchOutcome::ExceptionFailure(DownloadError::classify_io(error));
                }
            }
        }

        let response = match self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return FetchOutcome::ExceptionFailure(error.into()),
        };

        let status = response.status();
        if !status.is_success() {
            return FetchOutcome::UnsuccessfulHttpCall {
                code: status.as_u16(),
            };
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or(value)
                    .trim()
                    .to_ascii_lowercase()
            });
        if let Some(content_type) = &content_type {
            if INVALID_CONTENT_TYPES.contains(&content_type.as_str()) {
                return FetchOutcome::InvalidContentType {
                    content_type: content_type.clone(),
                };
            }
        }

        // The response's own length drives the sanity and truncation
        // checks; the feed's size hint only ever backs progress reporting.
        let response_length = response.content_length();
        let total_bytes = response_length.or(episode.size_hint);
        if let Some(total) = response_length {
            let looks_textual = content_type
                .as_deref()
                .map(|value| value.starts_with("text"))
                .unwrap_or(false);
            if total > 0 && (total < BAD_EPISODE_SIZE || (total < SUSPECT_EPISODE_SIZE && looks_textual))
            {
                return FetchOutcome::SuspiciousFileSize { bytes: total };
            }
        }

        // Zero-byte "started" sample so observers can tell "0 bytes so far"
        // from "not started".
        self.progress.update_progress(&episode.uuid, 0, total_bytes);

        let mut file = match fs::File::create(temp_file).await {
            Ok(file) => file,
            Err(error) => return FetchOutcome::ExceptionFailure(DownloadError::classify_io(error)),
        };

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                info!(episode = %episode.uuid, "download cancelled mid-stream");
                return FetchOutcome::Cancelled;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => return FetchOutcome::ExceptionFailure(error.into()),
            };
            if let Err(error) = file.write_all(&chunk).await {
                return FetchOutcome::ExceptionFailure(DownloadError::classify_io(error));
            }
            downloaded += chunk.len() as u64;
            self.progress
                .update_progress(&episode.uuid, downloaded, total_bytes);
        }

        if let Err(error) = file.flush().await {
            return FetchOutcome::ExceptionFailure(DownloadError::classify_io(error));
        }
        if let Err(error) = file.sync_all().await {
            return FetchOutcome::ExceptionFailure(DownloadError::classify_io(error));
        }
        drop(file);

        if let Some(total) = response_length {
            if downloaded < total {
                return FetchOutcome::ExceptionFailure(DownloadError::TruncatedBody {
                    expected: total,
                    received: downloaded,
                });
            }
        }

        if let Err(error) = promote(temp_file, download_file).await {
            warn!(episode = %episode.uuid, %error, "failed to promote downloaded file");
            return FetchOutcome::ExceptionFailure(error);
        }

        // Pin the final sample at 100%, also when the total was unknown.
        self.progress
            .update_progress(&episode.uuid, downloaded, Some(downloaded.max(1)));

        info!(episode = %episode.uuid, bytes = downloaded, "download complete");
        FetchOutcome::Success {
            download_file: download_file.to_path_buf(),
            bytes: downloaded,
        }
    }
}

/// Atomically move the finished temp file onto the final path, overwriting
/// any existing file. Falls back to copy + remove across filesystems.
async fn promote(temp_file: &Path, download_file: &Path) -> Result<(), DownloadError> {
    match fs::rename(temp_file, download_file).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(temp_file, download_file)
                .await
                .map_err(DownloadError::classify_io)?;
            fs::remove_file(temp_file)
                .await
                .map_err(DownloadError::classify_io)?;
            Ok(())
        }
    }
}

fn parse_download_url(episode: &Episode) -> Option<Url> {
    let raw = episode.download_url.as_deref()?;
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    // Hosts with underscores break DNS resolution on some platforms and are
    // invalid per the feed spec.
    let host = url.host_str()?;
    if host.contains('_') {
        return None;
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn http_response(status_line: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Serve one canned response on a loopback listener, returning the URL.
    fn spawn_http_server(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(&response);
            }
        });
        format!("http://127.0.0.1:{port}/episode.mp3")
    }

    fn fetcher() -> (EpisodeFetcher, ProgressCache) {
        let progress = ProgressCache::new();
        let fetcher = EpisodeFetcher::new(Client::new(), progress.clone());
        (fetcher, progress)
    }

    fn episode_with_url(url: &str) -> Episode {
        Episode::podcast_episode("ep1", "pod1", "Title", url)
    }

    #[tokio::test]
    async fn successful_download_promotes_atomically() {
        let body = vec![0xA5u8; 200 * 1024];
        let url = spawn_http_server(http_response("200 OK", "audio/mpeg", &body));
        let (fetcher, progress) = fetcher();
        let dir = tempfile::tempdir().unwrap();
        let download_file = dir.path().join("episodes/ep1.mp3");
        let temp_file = dir.path().join("tmp/ep1.part");

        let outcome = fetcher
            .download(
                &episode_with_url(&url),
                &download_file,
                &temp_file,
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            FetchOutcome::Success {
                download_file: file,
                bytes,
            } => {
                assert_eq!(file, download_file);
                assert_eq!(bytes, body.len() as u64);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(
            std::fs::metadata(&download_file).unwrap().len(),
            body.len() as u64
        );
        assert!(!temp_file.exists());
        assert_eq!(progress.percent("ep1"), Some(Some(100.0)));
    }

    #[tokio::test]
    async fn http_404_leaves_no_artifacts() {
        let url = spawn_http_server(http_response("404 Not Found", "text/plain", b"gone"));
        let (fetcher, _) = fetcher();
        let dir = tempfile::tempdir().unwrap();
        let download_file = dir.path().join("episodes/ep1.mp3");
        let temp_file = dir.path().join("tmp/ep1.part");

        let outcome = fetcher
            .download(
                &episode_with_url(&url),
                &download_file,
                &temp_file,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            FetchOutcome::UnsuccessfulHttpCall { code: 404 }
        ));
        assert!(!download_file.exists());
        assert!(!temp_file.exists());
        assert_eq!(
            outcome.error_message().unwrap(),
            "Episode not found, the file may have been moved or deleted. \
             Contact the podcast author."
        );
    }

    #[tokio::test]
    async fn missing_url_fails_without_io() {
        let (fetcher, progress) = fetcher();
        let dir = tempfile::tempdir().unwrap();
        let mut episode = episode_with_url("https://host/a.mp3");
        episode.download_url = None;

        let outcome = fetcher
            .download(
                &episode,
                &dir.path().join("ep1.mp3"),
                &dir.path().join("ep1.part"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, FetchOutcome::InvalidDownloadUrl));
        assert!(!outcome.should_retry());
        assert_eq!(progress.percent("ep1"), None);
    }

    #[tokio::test]
    async fn underscore_in_host_is_an_invalid_url() {
        let (fetcher, _) = fetcher();
        let dir = tempfile::tempdir().unwrap();
        let episode = episode_with_url("https://bad_host.example.com/a.mp3");

        let outcome = fetcher
            .download(
                &episode,
                &dir.path().join("ep1.mp3"),
                &dir.path().join("ep1.part"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, FetchOutcome::InvalidDownloadUrl));
    }

    #[tokio::test]
    async fn html_error_page_is_rejected() {
        let url = spawn_http_server(http_response(
            "200 OK",
            "text/html; charset=utf-8",
            b"<html>blocked</html>",
        ));
        let (fetcher, _) = fetcher();
        let dir = tempfile::tempdir().unwrap();
        let download_file = dir.path().join("ep1.mp3");

        let outcome = fetcher
            .download(
                &episode_with_url(&url),
                &download_file,
                &dir.path().join("ep1.part"),
                &CancellationToken::new(),
            )
            .await;

        assert!(
            matches!(outcome, FetchOutcome::InvalidContentType { ref content_type } if content_type == "text/html")
        );
        assert!(!download_file.exists());
    }

    #[tokio::test]
    async fn tiny_body_is_suspicious() {
        let url = spawn_http_server(http_response("200 OK", "audio/mpeg", &[0u8; 512]));
        let (fetcher, _) = fetcher();
        let dir = tempfile::tempdir().unwrap();

        let outcome = fetcher
            .download(
                &episode_with_url(&url),
                &dir.path().join("ep1.mp3"),
                &dir.path().join("ep1.part"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            FetchOutcome::SuspiciousFileSize { bytes: 512 }
        ));
    }

    #[tokio::test]
    async fn progress_is_monotonic_for_a_successful_download() {
        let body = vec![1u8; 256 * 1024];
        let url = spawn_http_server(http_response("200 OK", "audio/mpeg", &body));
        let (fetcher, progress) = fetcher();
        let dir = tempfile::tempdir().unwrap();

        let mut stream = progress.progress_stream("ep1");
        let outcome = fetcher
            .download(
                &episode_with_url(&url),
                &dir.path().join("ep1.mp3"),
                &dir.path().join("ep1.part"),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, FetchOutcome::Success { .. }));

        let mut previous = -1.0;
        let mut last = None;
        while let Some(percent) = tokio_stream::StreamExt::next(&mut stream).await {
            let percent = percent.expect("total is known for this download");
            assert!(percent >= previous);
            previous = percent;
            last = Some(percent);
            if percent >= 100.0 {
                break;
            }
        }
        assert_eq!(last, Some(100.0));
    }
}
