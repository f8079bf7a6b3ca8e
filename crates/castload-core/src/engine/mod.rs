//! Download engine
//!
//! The moving parts behind the queue: the work scheduler (unique work per
//! episode, constraint gating, bounded concurrency, retry accounting), the
//! episode fetcher (one HTTP transfer streamed to a temp file and promoted
//! atomically), and the best-effort show-notes prefetch.

mod fetcher;
mod scheduler;
mod show_notes;

pub use fetcher::*;
pub use scheduler::*;
pub use show_notes::*;
