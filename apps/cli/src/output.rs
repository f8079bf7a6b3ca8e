//! Output formatting utilities

use castload_types::DownloadStatus;

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Short label for a download status
pub fn status_label(status: &DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::NotQueued => "not queued",
        DownloadStatus::Queued => "queued",
        DownloadStatus::WaitingForNetwork => "waiting for network",
        DownloadStatus::WaitingForPower => "waiting for power",
        DownloadStatus::WaitingForStorage => "waiting for storage",
        DownloadStatus::InProgress => "downloading",
        DownloadStatus::Downloaded => "downloaded",
        DownloadStatus::Failed { .. } => "failed",
    }
}
