use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by the geometry kernel for a single entity.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("shape construction failed: {0}")]
    Shape(String),

    #[error("entity #{0} is referenced but not present in the model")]
    DanglingReference(u64),
}

#[derive(Debug, Error)]
pub enum Error {
    /// The element carries no representation or the kernel could not mesh it.
    #[error("element {id} has no usable geometry")]
    GeometryUnavailable { id: String },

    #[error("failed to process element {id}: {source}")]
    ElementProcessing {
        id: String,
        #[source]
        source: KernelError,
    },

    #[error("no valid input files found in {total} path(s)")]
    NoValidInput { total: usize },

    #[error("failed to load model {}: {message}", path.display())]
    Model { path: PathBuf, message: String },

    #[error("failed to open run for {}: {source}", path.display())]
    RunOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("corrupt triangle payload: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn model(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Model {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
