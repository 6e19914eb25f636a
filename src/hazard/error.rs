//! Hazard core errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HazardError>;

#[derive(Debug, Error)]
pub enum HazardError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid specification: {0}")]
    InvalidSpec(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("realization not found: {0}")]
    RealizationNotFound(i64),

    #[error("source {source_id} is not part of realization {realization_id}")]
    SourceNotFound {
        realization_id: i64,
        source_id: String,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl HazardError {
    pub(crate) fn shape(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }
}
