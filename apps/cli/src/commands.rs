//! CLI command implementations

use crate::output::{format_bytes, status_label};
use crate::OutputFormat;
use anyhow::{bail, Result};
use castload_core::{DownloadManager, EpisodeStore, SqliteEpisodeStore};
use castload_types::{DownloadStatus, DownloadType, Episode};
use console::style;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn add_episodes(
    manager: &DownloadManager,
    store: &SqliteEpisodeStore,
    urls: Vec<String>,
    podcast: Option<String>,
    title: Option<String>,
    automatic: bool,
    format: OutputFormat,
) -> Result<()> {
    if urls.is_empty() {
        bail!("no URLs given");
    }

    let podcast_uuid = podcast.unwrap_or_else(|| "adhoc".to_string());
    let mut uuids = Vec::new();
    for (index, url) in urls.iter().enumerate() {
        let uuid = Uuid::new_v4().to_string();
        let episode_title = match (&title, urls.len()) {
            (Some(title), 1) => title.clone(),
            (Some(title), _) => format!("{title} {}", index + 1),
            (None, _) => url
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or("episode")
                .to_string(),
        };
        let episode = Episode::podcast_episode(&uuid, &podcast_uuid, episode_title, url);
        store.upsert_episode(&episode).await?;
        uuids.push(uuid);
    }

    download_episodes(manager, store, uuids, automatic, format).await
}

pub async fn download_episodes(
    manager: &DownloadManager,
    store: &SqliteEpisodeStore,
    uuids: Vec<String>,
    automatic: bool,
    format: OutputFormat,
) -> Result<()> {
    if uuids.is_empty() {
        bail!("no episodes given");
    }

    let known = store.episodes(&uuids).await?;
    if known.len() != uuids.len() {
        bail!("{} of {} episode uuid(s) not found", uuids.len() - known.len(), uuids.len());
    }

    let download_type = if automatic {
        DownloadType::Automatic
    } else {
        DownloadType::UserTriggered
    };
    manager.enqueue_all(&uuids, download_type).await?;

    // Follow the downloads to a terminal state.
    let episodes = wait_for_terminal(store, &uuids).await?;

    let mut failures = 0;
    for episode in &episodes {
        match &episode.status {
            DownloadStatus::Downloaded => {
                if matches!(format, OutputFormat::Human) {
                    let size = episode
                        .download_file
                        .as_ref()
                        .and_then(|file| std::fs::metadata(file).ok())
                        .map(|meta| format_bytes(meta.len()))
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "{} {} ({})",
                        style("✓").green().bold(),
                        style(&episode.title).cyan(),
                        size
                    );
                }
            }
            DownloadStatus::Failed { reason } => {
                failures += 1;
                if matches!(format, OutputFormat::Human) {
                    println!(
                        "{} {}: {}",
                        style("✗").red().bold(),
                        style(&episode.title).cyan(),
                        reason
                    );
                }
            }
            other => {
                if matches!(format, OutputFormat::Human) {
                    println!(
                        "{} {}: {}",
                        style("○").dim(),
                        style(&episode.title).cyan(),
                        status_label(other)
                    );
                }
            }
        }
    }

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&episodes)?);
    }

    if failures > 0 {
        bail!("{failures} download(s) failed");
    }
    Ok(())
}

pub async fn list_episodes(
    store: &SqliteEpisodeStore,
    status_filter: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let episodes = store.all_episodes().await?;
    let filtered: Vec<Episode> = episodes
        .into_iter()
        .filter(|episode| {
            status_filter
                .as_deref()
                .map(|filter| {
                    status_label(&episode.status)
                        .to_lowercase()
                        .contains(&filter.to_lowercase())
                })
                .unwrap_or(true)
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("No episodes.");
                return Ok(());
            }
            for episode in &filtered {
                println!(
                    "{}  {:<24} {}",
                    style(&episode.uuid[..8.min(episode.uuid.len())]).dim(),
                    status_label(&episode.status),
                    episode.title
                );
            }
        }
    }
    Ok(())
}

pub async fn cancel_downloads(
    manager: &DownloadManager,
    uuids: Vec<String>,
    podcast: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    match (uuids.is_empty(), podcast) {
        (_, Some(podcast_uuid)) => {
            manager.cancel_all_for_podcast(&podcast_uuid).await?;
            if matches!(format, OutputFormat::Human) {
                println!("Cancelled downloads for podcast {podcast_uuid}");
            }
        }
        (false, None) => {
            manager.cancel_all(&uuids).await?;
            if matches!(format, OutputFormat::Human) {
                println!("Cancelled {} download(s)", uuids.len());
            }
        }
        (true, None) => bail!("no episodes or podcast given"),
    }

    // Give the cancellation a moment to settle before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Poll until every episode has left the pending statuses. Requires two
/// consecutive settled reads so a reconciliation pass racing the enqueue
/// does not end the wait early.
async fn wait_for_terminal(
    store: &SqliteEpisodeStore,
    uuids: &[String],
) -> Result<Vec<Episode>> {
    let mut settled_once = false;
    loop {
        let episodes = store.episodes(uuids).await?;
        let settled = episodes.len() == uuids.len()
            && episodes
                .iter()
                .all(|episode| !episode.status.is_pending_group());
        if settled && settled_once {
            return Ok(episodes);
        }
        settled_once = settled;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
