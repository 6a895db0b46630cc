//! Shared types and the crate-level error.

use std::path::PathBuf;

use thiserror::Error;

use crate::distribution::DistributionError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Identity of one execution context (a per-document scheduling unit).
///
/// The embedder assigns these; the scheduler and the frame registry key all
/// per-document state by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Error type for repository and query operations.
///
/// Per-file failures (io, parse) are local: the batch that hit them keeps
/// going and only the offending file is skipped.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Read/copy/mkdir failure for one file or operation.
    #[error("file i/o failed for {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad metadata header, invalid match pattern or run-at value, or
    /// non-UTF8 content.
    #[error("invalid script header: {0}")]
    Parse(String),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    /// The user scripts feature is globally disabled.
    #[error("user scripts are disabled")]
    Disabled,

    /// No stored script with the given key.
    #[error("unknown script \"{0}\"")]
    UnknownScript(String),

    /// Loader queue or response channel is gone.
    #[error("internal: {0}")]
    Internal(String),
}
