//! Episode record store
//!
//! The persistence collaborator: a keyed record store supporting
//! read-by-id, batch-read-by-ids, and atomic batch status updates. The
//! download core only ever writes statuses through [`EpisodeStore::update_statuses`]
//! so readers never observe a half-updated generation of statuses.

use crate::error::DownloadError;
use async_trait::async_trait;
use castload_types::{DownloadStatus, DownloadStatusKind, Episode, EpisodeKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One entry of a reconciliation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: DownloadStatus,
    /// Set when the status is [`DownloadStatus::Downloaded`]: the final
    /// path of the media file.
    pub download_file: Option<PathBuf>,
}

impl StatusUpdate {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status,
            download_file: None,
        }
    }

    pub fn downloaded(download_file: PathBuf) -> Self {
        Self {
            status: DownloadStatus::Downloaded,
            download_file: Some(download_file),
        }
    }
}

/// Keyed episode record store.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn episode(&self, uuid: &str) -> Result<Option<Episode>, DownloadError>;

    async fn episodes(&self, uuids: &[String]) -> Result<Vec<Episode>, DownloadError>;

    async fn episodes_for_podcast(&self, podcast_uuid: &str)
        -> Result<Vec<Episode>, DownloadError>;

    /// Apply a batch of status updates atomically (all-or-nothing).
    async fn update_statuses(
        &self,
        updates: &HashMap<String, StatusUpdate>,
    ) -> Result<(), DownloadError>;

    async fn uuids_with_status(
        &self,
        kinds: &[DownloadStatusKind],
    ) -> Result<Vec<String>, DownloadError>;

    async fn set_last_download_attempt(
        &self,
        uuid: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DownloadError>;
}

// ============================================================================
// SQLite store
// ============================================================================

/// SQLite-backed episode store.
#[derive(Clone, Debug)]
pub struct SqliteEpisodeStore {
    pool: SqlitePool,
}

impl SqliteEpisodeStore {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DownloadError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                uuid TEXT PRIMARY KEY,
                podcast_uuid TEXT,
                kind TEXT NOT NULL,
                is_uploaded INTEGER NOT NULL DEFAULT 1,
                title TEXT NOT NULL,
                download_url TEXT,
                show_notes_url TEXT,
                size_hint INTEGER,
                status TEXT NOT NULL,
                error TEXT,
                download_file TEXT,
                exempt_from_auto_download INTEGER NOT NULL DEFAULT 0,
                last_download_attempt_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_podcast ON episodes(podcast_uuid);
            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert or replace a full episode record. Used by hosts to register
    /// episodes; the download core itself only updates statuses.
    pub async fn upsert_episode(&self, episode: &Episode) -> Result<(), DownloadError> {
        let (kind, is_uploaded) = match episode.kind {
            EpisodeKind::Podcast => ("podcast", true),
            EpisodeKind::UserFile { is_uploaded } => ("user_file", is_uploaded),
        };
        let (status, error) = encode_status(&episode.status);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO episodes (
                uuid, podcast_uuid, kind, is_uploaded, title, download_url,
                show_notes_url, size_hint, status, error, download_file,
                exempt_from_auto_download, last_download_attempt_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&episode.uuid)
        .bind(&episode.podcast_uuid)
        .bind(kind)
        .bind(is_uploaded)
        .bind(&episode.title)
        .bind(&episode.download_url)
        .bind(&episode.show_notes_url)
        .bind(episode.size_hint.map(|size| size as i64))
        .bind(status)
        .bind(error)
        .bind(
            episode
                .download_file
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )
        .bind(episode.is_exempt_from_auto_download)
        .bind(episode.last_download_attempt_at.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn all_episodes(&self) -> Result<Vec<Episode>, DownloadError> {
        let rows = sqlx::query("SELECT * FROM episodes ORDER BY uuid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_episode).collect()
    }
}

#[async_trait]
impl EpisodeStore for SqliteEpisodeStore {
    async fn episode(&self, uuid: &str) -> Result<Option<Episode>, DownloadError> {
        let row = sqlx::query("SELECT * FROM episodes WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_episode).transpose()
    }

    async fn episodes(&self, uuids: &[String]) -> Result<Vec<Episode>, DownloadError> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uuids.len()].join(", ");
        let sql = format!("SELECT * FROM episodes WHERE uuid IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for uuid in uuids {
            query = query.bind(uuid);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_episode).collect()
    }

    async fn episodes_for_podcast(
        &self,
        podcast_uuid: &str,
    ) -> Result<Vec<Episode>, DownloadError> {
        let rows = sqlx::query("SELECT * FROM episodes WHERE podcast_uuid = ?")
            .bind(podcast_uuid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_episode).collect()
    }

    async fn update_statuses(
        &self,
        updates: &HashMap<String, StatusUpdate>,
    ) -> Result<(), DownloadError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (uuid, update) in updates {
            let (status, error) = encode_status(&update.status);
            sqlx::query(
                "UPDATE episodes SET status = ?, error = ?, download_file = COALESCE(?, download_file) WHERE uuid = ?",
            )
            .bind(status)
            .bind(error)
            .bind(
                update
                    .download_file
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
            )
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn uuids_with_status(
        &self,
        kinds: &[DownloadStatusKind],
    ) -> Result<Vec<String>, DownloadError> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!("SELECT uuid FROM episodes WHERE status IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("uuid"))
            .collect())
    }

    async fn set_last_download_attempt(
        &self,
        uuid: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DownloadError> {
        sqlx::query("UPDATE episodes SET last_download_attempt_at = ? WHERE uuid = ?")
            .bind(at.to_rfc3339())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_status(status: &DownloadStatus) -> (&'static str, Option<String>) {
    let error = match status {
        DownloadStatus::Failed { reason } => Some(reason.clone()),
        _ => None,
    };
    (status.kind().as_str(), error)
}

fn decode_status(kind: &str, error: Option<String>) -> Result<DownloadStatus, DownloadError> {
    let kind = DownloadStatusKind::parse(kind)
        .ok_or_else(|| DownloadError::Database(sqlx::Error::Decode(
            format!("unknown download status: {kind}").into(),
        )))?;
    Ok(match kind {
        DownloadStatusKind::NotQueued => DownloadStatus::NotQueued,
        DownloadStatusKind::Queued => DownloadStatus::Queued,
        DownloadStatusKind::WaitingForNetwork => DownloadStatus::WaitingForNetwork,
        DownloadStatusKind::WaitingForPower => DownloadStatus::WaitingForPower,
        DownloadStatusKind::WaitingForStorage => DownloadStatus::WaitingForStorage,
        DownloadStatusKind::InProgress => DownloadStatus::InProgress,
        DownloadStatusKind::Downloaded => DownloadStatus::Downloaded,
        DownloadStatusKind::Failed => DownloadStatus::Failed {
            reason: error.unwrap_or_else(|| "Download failed.".to_string()),
        },
    })
}

fn row_to_episode(row: &sqlx::sqlite::SqliteRow) -> Result<Episode, DownloadError> {
    let kind_text: String = row.get("kind");
    let is_uploaded: bool = row.get("is_uploaded");
    let kind = match kind_text.as_str() {
        "user_file" => EpisodeKind::UserFile { is_uploaded },
        _ => EpisodeKind::Podcast,
    };
    let status = decode_status(&row.get::<String, _>("status"), row.get("error"))?;
    let last_attempt: Option<String> = row.get("last_download_attempt_at");

    Ok(Episode {
        uuid: row.get("uuid"),
        podcast_uuid: row.get("podcast_uuid"),
        kind,
        title: row.get("title"),
        download_url: row.get("download_url"),
        show_notes_url: row.get("show_notes_url"),
        size_hint: row.get::<Option<i64>, _>("size_hint").map(|size| size as u64),
        status,
        download_file: row
            .get::<Option<String>, _>("download_file")
            .map(PathBuf::from),
        is_exempt_from_auto_download: row.get("exempt_from_auto_download"),
        last_download_attempt_at: last_attempt
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc)),
    })
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory episode store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryEpisodeStore {
    episodes: Mutex<HashMap<String, Episode>>,
}

impl MemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_episodes(episodes: impl IntoIterator<Item = Episode>) -> Self {
        let store = Self::new();
        {
            let mut map = store.episodes.lock();
            for episode in episodes {
                map.insert(episode.uuid.clone(), episode);
            }
        }
        store
    }

    pub fn insert(&self, episode: Episode) {
        self.episodes.lock().insert(episode.uuid.clone(), episode);
    }

    pub fn status_of(&self, uuid: &str) -> Option<DownloadStatus> {
        self.episodes
            .lock()
            .get(uuid)
            .map(|episode| episode.status.clone())
    }
}

#[async_trait]
impl EpisodeStore for MemoryEpisodeStore {
    async fn episode(&self, uuid: &str) -> Result<Option<Episode>, DownloadError> {
        Ok(self.episodes.lock().get(uuid).cloned())
    }

    async fn episodes(&self, uuids: &[String]) -> Result<Vec<Episode>, DownloadError> {
        let map = self.episodes.lock();
        Ok(uuids.iter().filter_map(|uuid| map.get(uuid).cloned()).collect())
    }

    async fn episodes_for_podcast(
        &self,
        podcast_uuid: &str,
    ) -> Result<Vec<Episode>, DownloadError> {
        let map = self.episodes.lock();
        Ok(map
            .values()
            .filter(|episode| episode.podcast_uuid.as_deref() == Some(podcast_uuid))
            .cloned()
            .collect())
    }

    async fn update_statuses(
        &self,
        updates: &HashMap<String, StatusUpdate>,
    ) -> Result<(), DownloadError> {
        let mut map = self.episodes.lock();
        for (uuid, update) in updates {
            if let Some(episode) = map.get_mut(uuid) {
                episode.status = update.status.clone();
                if let Some(file) = &update.download_file {
                    episode.download_file = Some(file.clone());
                }
            }
        }
        Ok(())
    }

    async fn uuids_with_status(
        &self,
        kinds: &[DownloadStatusKind],
    ) -> Result<Vec<String>, DownloadError> {
        let map = self.episodes.lock();
        Ok(map
            .values()
            .filter(|episode| kinds.contains(&episode.status.kind()))
            .map(|episode| episode.uuid.clone())
            .collect())
    }

    async fn set_last_download_attempt(
        &self,
        uuid: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DownloadError> {
        if let Some(episode) = self.episodes.lock().get_mut(uuid) {
            episode.last_download_attempt_at = Some(at);
        }
        Ok(())
    }
}
