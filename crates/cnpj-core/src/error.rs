//! Error taxonomy of the pipeline.
//!
//! Row-level conditions are skip-and-log and never surface here; everything
//! that does propagates through the task group, cancels the shared token, and
//! reaches the orchestrator as the run's first error.

use std::path::PathBuf;

/// Errors that abort a batch, a phase, or the whole run.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// A channel between pipeline tasks closed early, meaning the peer task
    /// failed or the run was cancelled.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// No file of the given kind exists under the data directory.
    #[error("no {kind} files found under {}", .dir.display())]
    NoSourceFiles { kind: &'static str, dir: PathBuf },

    /// A national ID that is not exactly 14 digits after non-digit stripping.
    #[error("invalid national id {id:?}: expected 14 digits, found {len}")]
    InvalidNationalId { id: String, len: usize },

    /// The `updated_at.txt` sidecar the downloader leaves next to the CSVs is
    /// missing or unreadable.
    #[error("cannot read the updated-at sidecar at {}", .path.display())]
    MissingUpdatedAt { path: PathBuf },

    /// Generic error wrapper keeping context and backtraces intact.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
