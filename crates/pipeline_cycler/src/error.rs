//! # Pipeline Error Types
//!
//! Only configuration can fail recoverably. Misuse of the checkout protocol
//! (double writes, releases without an acquire, out-of-range stages) panics.

use thiserror::Error;

/// Errors raised while configuring a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Stage count outside `1..=MAX_STAGES`.
    #[error("invalid stage count {requested}: must be between 1 and {max}")]
    InvalidStageCount {
        /// The requested count.
        requested: usize,
        /// The largest count supported.
        max: usize,
    },

    /// Threading model string could not be parsed.
    #[error("invalid threading model {model:?}: {reason}")]
    InvalidThreadingModel {
        /// The offending model string.
        model: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Config file could not be read.
    #[error("failed to read pipeline config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for a pipeline.
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for pipeline configuration.
pub type PipelineResult<T> = Result<T, PipelineError>;
