//! # Pipeline Configuration
//!
//! Loaded once at startup from TOML:
//!
//! ```toml
//! name = "render"
//! num_stages = 1
//! threading_model = "cull/draw"
//! ```
//!
//! The threading model wins over a smaller `num_stages`: `"cull/draw"` needs
//! three stages, so the pipeline gets three.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::Pipeline;
use crate::stage::{ThreadingModel, MAX_STAGES};

/// Startup configuration for a [`Pipeline`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name, shown in diagnostics.
    pub name: String,
    /// Minimum number of stages.
    pub num_stages: usize,
    /// Threading model string, e.g. `"cull/draw"`.
    pub threading_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "render".to_owned(),
            num_stages: 1,
            threading_model: String::new(),
        }
    }
}

impl PipelineConfig {
    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml_str(text: &str) -> PipelineResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the file cannot be read, or
    /// [`PipelineError::Parse`] if it is not a valid config.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses the threading model.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidThreadingModel`] if it does not parse.
    pub fn threading_model(&self) -> PipelineResult<ThreadingModel> {
        ThreadingModel::parse(&self.threading_model)
    }

    /// Stage count after accounting for the threading model.
    ///
    /// # Errors
    ///
    /// Fails if the threading model does not parse, or the resulting count
    /// is outside `1..=MAX_STAGES`.
    pub fn effective_stages(&self) -> PipelineResult<usize> {
        let stages = self.num_stages.max(self.threading_model()?.required_stages());
        if self.num_stages == 0 || stages > MAX_STAGES {
            return Err(PipelineError::InvalidStageCount {
                requested: if self.num_stages == 0 { 0 } else { stages },
                max: MAX_STAGES,
            });
        }
        Ok(stages)
    }

    /// Validates the config and creates the pipeline.
    ///
    /// # Errors
    ///
    /// See [`effective_stages`](Self::effective_stages).
    pub fn build(&self) -> PipelineResult<Arc<Pipeline>> {
        let stages = self.effective_stages()?;
        Pipeline::try_new(self.name.clone(), stages)
    }
}
