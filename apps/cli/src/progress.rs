//! Terminal progress rendering
//!
//! Implements the core's notification sink with indicatif progress bars:
//! one bar per downloading episode, updated with the throttled samples the
//! notification observer pushes.

use castload_core::NotificationSink;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

pub struct TerminalNotificationSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalNotificationSink {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style(percent_known: bool) -> ProgressStyle {
        if percent_known {
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:<32} [{bar:40.cyan/blue}] {pos:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  ")
        } else {
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg:<32} downloading...")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
        }
    }

    fn apply(&self, uuid: &str, text: &str, percent: Option<f64>, create: bool) {
        let mut bars = self.bars.lock();
        let bar = match bars.get(uuid) {
            Some(bar) => bar.clone(),
            None if create => {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_message(text.to_string());
                bars.insert(uuid.to_string(), bar.clone());
                bar
            }
            None => return,
        };
        bar.set_style(Self::bar_style(percent.is_some()));
        if let Some(percent) = percent {
            bar.set_position(percent.round() as u64);
        } else {
            bar.tick();
        }
    }
}

impl Default for TerminalNotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for TerminalNotificationSink {
    fn show(&self, uuid: &str, _title: &str, text: &str, percent: Option<f64>) {
        self.apply(uuid, text, percent, true);
    }

    fn update(&self, uuid: &str, _title: &str, text: &str, percent: Option<f64>) {
        self.apply(uuid, text, percent, false);
    }

    fn clear(&self, uuid: &str) {
        if let Some(bar) = self.bars.lock().remove(uuid) {
            bar.finish_and_clear();
        }
    }
}
