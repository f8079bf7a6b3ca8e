//! Shared types for Castload
//!
//! This crate contains the data model shared between the download core,
//! the CLI, and any embedding host: episodes, download statuses, constraint
//! snapshots, settings, and the events the core broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Episode Types
// ============================================================================

/// A downloadable unit: a podcast episode or a user-uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Stable identity across the episode's lifetime.
    pub uuid: String,
    /// Owning podcast, or `None` for standalone user files.
    pub podcast_uuid: Option<String>,
    pub kind: EpisodeKind,
    pub title: String,
    pub download_url: Option<String>,
    /// Optional URL for the episode's show notes, prefetched best-effort
    /// alongside the download.
    pub show_notes_url: Option<String>,
    /// Best-effort expected size in bytes, from the feed.
    pub size_hint: Option<u64>,
    pub status: DownloadStatus,
    /// Final path of the downloaded media, once downloaded.
    pub download_file: Option<PathBuf>,
    /// Episodes can opt out of automatic downloads (e.g. archived ones).
    pub is_exempt_from_auto_download: bool,
    pub last_download_attempt_at: Option<DateTime<Utc>>,
}

impl Episode {
    pub fn podcast_episode(
        uuid: impl Into<String>,
        podcast_uuid: impl Into<String>,
        title: impl Into<String>,
        download_url: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            podcast_uuid: Some(podcast_uuid.into()),
            kind: EpisodeKind::Podcast,
            title: title.into(),
            download_url: Some(download_url.into()),
            show_notes_url: None,
            size_hint: None,
            status: DownloadStatus::NotQueued,
            download_file: None,
            is_exempt_from_auto_download: false,
            last_download_attempt_at: None,
        }
    }

    pub fn user_file(
        uuid: impl Into<String>,
        title: impl Into<String>,
        download_url: impl Into<String>,
        is_uploaded: bool,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            podcast_uuid: None,
            kind: EpisodeKind::UserFile { is_uploaded },
            title: title.into(),
            download_url: Some(download_url.into()),
            show_notes_url: None,
            size_hint: None,
            status: DownloadStatus::NotQueued,
            download_file: None,
            is_exempt_from_auto_download: false,
            last_download_attempt_at: None,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self.status, DownloadStatus::Downloaded)
    }

    /// User files only become downloadable once their upload finished.
    pub fn is_file_available(&self) -> bool {
        match self.kind {
            EpisodeKind::Podcast => true,
            EpisodeKind::UserFile { is_uploaded } => is_uploaded,
        }
    }
}

/// What sort of item an [`Episode`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EpisodeKind {
    Podcast,
    UserFile { is_uploaded: bool },
}

// ============================================================================
// Download Status
// ============================================================================

/// Persisted download state of an episode. Exactly one value at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadStatus {
    NotQueued,
    Queued,
    WaitingForNetwork,
    WaitingForPower,
    WaitingForStorage,
    InProgress,
    Downloaded,
    Failed { reason: String },
}

impl DownloadStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> DownloadStatusKind {
        match self {
            Self::NotQueued => DownloadStatusKind::NotQueued,
            Self::Queued => DownloadStatusKind::Queued,
            Self::WaitingForNetwork => DownloadStatusKind::WaitingForNetwork,
            Self::WaitingForPower => DownloadStatusKind::WaitingForPower,
            Self::WaitingForStorage => DownloadStatusKind::WaitingForStorage,
            Self::InProgress => DownloadStatusKind::InProgress,
            Self::Downloaded => DownloadStatusKind::Downloaded,
            Self::Failed { .. } => DownloadStatusKind::Failed,
        }
    }

    /// Whether this status means "the scheduler should be tracking work for
    /// this episode". Statuses in this group with no matching work record
    /// are orphans and get reset to [`DownloadStatus::NotQueued`].
    pub fn is_pending_group(&self) -> bool {
        self.kind().is_pending_group()
    }
}

/// Payload-free discriminant of [`DownloadStatus`], used for persistence
/// and status-set queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatusKind {
    NotQueued,
    Queued,
    WaitingForNetwork,
    WaitingForPower,
    WaitingForStorage,
    InProgress,
    Downloaded,
    Failed,
}

impl DownloadStatusKind {
    pub const PENDING_GROUP: [DownloadStatusKind; 5] = [
        DownloadStatusKind::Queued,
        DownloadStatusKind::WaitingForNetwork,
        DownloadStatusKind::WaitingForPower,
        DownloadStatusKind::WaitingForStorage,
        DownloadStatusKind::InProgress,
    ];

    pub fn is_pending_group(self) -> bool {
        Self::PENDING_GROUP.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotQueued => "not_queued",
            Self::Queued => "queued",
            Self::WaitingForNetwork => "waiting_for_network",
            Self::WaitingForPower => "waiting_for_power",
            Self::WaitingForStorage => "waiting_for_storage",
            Self::InProgress => "in_progress",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "not_queued" => Self::NotQueued,
            "queued" => Self::Queued,
            "waiting_for_network" => Self::WaitingForNetwork,
            "waiting_for_power" => Self::WaitingForPower,
            "waiting_for_storage" => Self::WaitingForStorage,
            "in_progress" => Self::InProgress,
            "downloaded" => Self::Downloaded,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

// ============================================================================
// Download Requests
// ============================================================================

/// How a download was requested. Determines which constraint profile
/// applies: user-triggered requests never wait on network type or power,
/// automatic ones honor the user's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    UserTriggered,
    Automatic,
}

// ============================================================================
// Constraints
// ============================================================================

/// A point-in-time read of device state, replaced wholesale whenever any
/// field changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    pub is_network_available: bool,
    pub is_unmetered_available: bool,
    pub is_power_available: bool,
    pub is_storage_available: bool,
}

impl ConstraintSnapshot {
    /// Snapshot with everything available. Useful as an initial value and
    /// for hosts without any constraint sources.
    pub fn unconstrained() -> Self {
        Self {
            is_network_available: true,
            is_unmetered_available: true,
            is_power_available: true,
            is_storage_available: true,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Download subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Automatic podcast downloads only run on unmetered networks.
    pub auto_download_unmetered_only: bool,
    /// Automatic podcast downloads only run while charging.
    pub auto_download_on_power_only: bool,
    /// Automatic user-file downloads only run on unmetered networks.
    pub user_file_downloads_unmetered_only: bool,
    /// Ceiling on scheduler run attempts before a download is treated as
    /// permanently stuck.
    pub max_download_attempts: u32,
    /// Base delay for exponential retry backoff, in seconds.
    pub retry_initial_backoff_secs: u64,
    /// Maximum number of episodes downloading concurrently.
    pub max_concurrent_downloads: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            auto_download_unmetered_only: true,
            auto_download_on_power_only: false,
            user_file_downloads_unmetered_only: true,
            max_download_attempts: 3,
            retry_initial_backoff_secs: 30,
            max_concurrent_downloads: 4,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to observers such as UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadStatusChanged {
        uuid: String,
        status: DownloadStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_kind_round_trips_through_str() {
        let statuses = [
            DownloadStatus::NotQueued,
            DownloadStatus::Queued,
            DownloadStatus::WaitingForNetwork,
            DownloadStatus::WaitingForPower,
            DownloadStatus::WaitingForStorage,
            DownloadStatus::InProgress,
            DownloadStatus::Downloaded,
            DownloadStatus::failed("boom"),
        ];
        for status in statuses {
            let kind = status.kind();
            assert_eq!(DownloadStatusKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn pending_group_excludes_terminal_statuses() {
        assert!(DownloadStatus::Queued.is_pending_group());
        assert!(DownloadStatus::WaitingForNetwork.is_pending_group());
        assert!(DownloadStatus::InProgress.is_pending_group());
        assert!(!DownloadStatus::NotQueued.is_pending_group());
        assert!(!DownloadStatus::Downloaded.is_pending_group());
        assert!(!DownloadStatus::failed("x").is_pending_group());
    }

    #[test]
    fn user_file_availability_tracks_upload_state() {
        let pending = Episode::user_file("u1", "Recording", "https://host/file.mp3", false);
        let uploaded = Episode::user_file("u2", "Recording", "https://host/file.mp3", true);
        assert!(!pending.is_file_available());
        assert!(uploaded.is_file_available());
    }
}
