//! File layout for downloaded episodes
//!
//! Finished downloads live under `<root>/episodes`, in-flight writes under
//! `<root>/tmp`. A half-written file is never visible in the episodes
//! directory; the fetcher promotes the temp file only on success.

use castload_types::Episode;
use std::path::{Path, PathBuf};

const DEFAULT_EXTENSION: &str = "mp3";

/// Resolves download and temp file paths for episodes under a data root.
#[derive(Debug, Clone)]
pub struct DownloadPaths {
    root: PathBuf,
}

impl DownloadPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn episodes_dir(&self) -> PathBuf {
        self.root.join("episodes")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn show_notes_dir(&self) -> PathBuf {
        self.root.join("show_notes")
    }

    /// Final path for an episode's media file.
    pub fn download_file(&self, episode: &Episode) -> PathBuf {
        let extension = episode
            .download_url
            .as_deref()
            .and_then(url_file_extension)
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        self.episodes_dir()
            .join(format!("{}.{}", episode.uuid, extension))
    }

    /// Scratch path the fetcher streams into before promotion.
    pub fn temp_file(&self, episode: &Episode) -> PathBuf {
        self.temp_dir().join(format!("{}.part", episode.uuid))
    }

    pub fn show_notes_file(&self, episode: &Episode) -> PathBuf {
        self.show_notes_dir().join(format!("{}.html", episode.uuid))
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.episodes_dir()).await?;
        tokio::fs::create_dir_all(self.temp_dir()).await?;
        tokio::fs::create_dir_all(self.show_notes_dir()).await?;
        Ok(())
    }
}

fn url_file_extension(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let file_name = parsed.path_segments()?.last()?.to_string();
    let extension = Path::new(&file_name).extension()?.to_str()?;
    if extension.is_empty() {
        None
    } else {
        Some(extension.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_comes_from_the_url() {
        let paths = DownloadPaths::new("/data");
        let episode =
            Episode::podcast_episode("ep1", "pod1", "Title", "https://host/feed/episode-1.M4A");
        assert_eq!(
            paths.download_file(&episode),
            PathBuf::from("/data/episodes/ep1.m4a")
        );
    }

    #[test]
    fn extension_falls_back_to_mp3() {
        let paths = DownloadPaths::new("/data");
        let episode = Episode::podcast_episode("ep1", "pod1", "Title", "https://host/stream");
        assert_eq!(
            paths.download_file(&episode),
            PathBuf::from("/data/episodes/ep1.mp3")
        );
    }

    #[test]
    fn temp_file_lives_outside_the_episodes_dir() {
        let paths = DownloadPaths::new("/data");
        let episode = Episode::podcast_episode("ep1", "pod1", "Title", "https://host/a.mp3");
        assert_eq!(
            paths.temp_file(&episode),
            PathBuf::from("/data/tmp/ep1.part")
        );
    }
}
