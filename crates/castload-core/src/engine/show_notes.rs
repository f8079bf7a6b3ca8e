//! Show-notes prefetch - best-effort secondary task
//!
//! After a download is scheduled, the episode's show notes are fetched into
//! a local cache so they are available offline alongside the media. This is
//! strictly best-effort: failures are logged and never affect the download.

use crate::paths::DownloadPaths;
use castload_types::Episode;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ShowNotesUpdater {
    client: Client,
    paths: DownloadPaths,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ShowNotesUpdater {
    pub fn new(client: Client, paths: DownloadPaths) -> Self {
        Self {
            client,
            paths,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch the episode's show notes in the background. A no-op for
    /// episodes without a show-notes URL or with a fetch already running.
    pub fn enqueue(&self, episode: &Episode) {
        let url = match &episode.show_notes_url {
            Some(url) => url.clone(),
            None => return,
        };

        let mut tasks = self.tasks.lock();
        if tasks.get(&episode.uuid).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let uuid = episode.uuid.clone();
        let client = self.client.clone();
        let target = self.paths.show_notes_file(episode);
        let handle = tokio::spawn(async move {
            match fetch_notes(&client, &url, &target).await {
                Ok(bytes) => debug!(episode = %uuid, bytes, "cached show notes"),
                Err(error) => warn!(episode = %uuid, %error, "show notes fetch failed"),
            }
        });
        tasks.insert(episode.uuid.clone(), handle);
    }

    /// Abort any in-flight fetch for an episode.
    pub fn cancel(&self, episode_uuid: &str) {
        if let Some(task) = self.tasks.lock().remove(episode_uuid) {
            task.abort();
        }
    }
}

async fn fetch_notes(
    client: &Client,
    url: &str,
    target: &std::path::Path,
) -> Result<usize, crate::error::DownloadError> {
    let response = client.get(url).send().await?;
    let response = response.error_for_status()?;
    let body = response.bytes().await?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, &body).await?;
    Ok(body.len())
}
