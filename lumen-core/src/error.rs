use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a generation run.
///
/// Per-image failures never show up here; they are recorded in the
/// image's [`GenerationOutcome`](crate::GenerationOutcome) instead.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// Invalid or contradictory request options.
    #[error("invalid request: {0}")]
    Config(String),

    /// The requested LoRA did not resolve to a weights file.
    #[error("adapter '{name}' not found (searched: {})", display_paths(.searched))]
    AdapterNotFound { name: String, searched: Vec<PathBuf> },

    /// The adapter resolved but could not be applied to the pipeline.
    #[error("failed to apply adapter '{name}': {source:#}")]
    Adapter {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load pipeline: {0:#}")]
    PipelineLoad(#[source] anyhow::Error),

    /// Unrecoverable filesystem failure.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GenerationError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by the request itself rather than the machine.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::AdapterNotFound { .. })
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, GenerationError>;
