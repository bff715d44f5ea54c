use cache_utils::arena::{ArenaError, LayoutError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeakError {
    #[error("invalid arena layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("arena allocation failed: {0}")]
    Arena(#[from] ArenaError),
    #[error("at least one iteration per bit is needed")]
    NoIterations,
    #[error("bit repeat count must be at least 1")]
    NoRepeat,
    #[error("threshold must be finite and positive, got {0}")]
    InvalidThreshold(f64),
}
