//! Threading model strings.
//!
//! A model names the threads that run the cull and draw traversals:
//!
//! | model         | cull thread | draw thread | stages |
//! |---------------|-------------|-------------|--------|
//! | `""`          | app         | app         | 1      |
//! | `"cull/draw"` | `cull`      | `draw`      | 3      |
//! | `"/draw"`     | app         | `draw`      | 2      |
//! | `"cull"`      | `cull`      | `cull`      | 2      |
//! | `"-cull"`     | `cull`      | `cull`      | 2      |
//!
//! A leading `-` turns off cull sorting, which forces cull and draw onto the
//! same thread.

use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Parsed threading model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadingModel {
    cull_name: String,
    draw_name: String,
    cull_sorting: bool,
    cull_stage: usize,
    draw_stage: usize,
}

impl ThreadingModel {
    /// Single-threaded model: everything runs on the app thread at stage 0.
    #[must_use]
    pub fn single_threaded() -> Self {
        Self {
            cull_sorting: true,
            ..Self::default()
        }
    }

    /// Parses a model string.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidThreadingModel`] if the string holds
    /// more than one `/` or a thread name with whitespace.
    pub fn parse(model: &str) -> Result<Self, PipelineError> {
        let invalid = |reason: &str| PipelineError::InvalidThreadingModel {
            model: model.to_owned(),
            reason: reason.to_owned(),
        };

        let (cull_sorting, rest) = match model.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, model),
        };

        let (cull_name, draw_name) = match rest.split_once('/') {
            Some((cull, draw)) => {
                if draw.contains('/') {
                    return Err(invalid("more than one '/'"));
                }
                if !cull_sorting {
                    return Err(invalid("'-' models cannot name a separate draw thread"));
                }
                (cull, draw)
            }
            None => (rest, rest),
        };

        if cull_name.chars().chain(draw_name.chars()).any(char::is_whitespace) {
            return Err(invalid("thread names cannot contain whitespace"));
        }

        let mut parsed = Self {
            cull_name: cull_name.to_owned(),
            draw_name: draw_name.to_owned(),
            cull_sorting,
            cull_stage: 0,
            draw_stage: 0,
        };
        parsed.update_stages();
        Ok(parsed)
    }

    fn update_stages(&mut self) {
        self.cull_stage = usize::from(!self.cull_name.is_empty());
        self.draw_stage = if self.draw_name.is_empty() || self.draw_name == self.cull_name {
            self.cull_stage
        } else {
            self.cull_stage + 1
        };
    }

    /// Name of the cull thread; empty means the app thread.
    #[must_use]
    pub fn cull_name(&self) -> &str {
        &self.cull_name
    }

    /// Name of the draw thread; empty means the app thread.
    #[must_use]
    pub fn draw_name(&self) -> &str {
        &self.draw_name
    }

    /// Pipeline stage assigned to the cull thread.
    #[must_use]
    pub fn cull_stage(&self) -> usize {
        self.cull_stage
    }

    /// Pipeline stage assigned to the draw thread.
    #[must_use]
    pub fn draw_stage(&self) -> usize {
        self.draw_stage
    }

    /// Whether cull results are sorted before drawing.
    #[must_use]
    pub fn cull_sorting(&self) -> bool {
        self.cull_sorting
    }

    /// True when cull and draw both run on the app thread.
    #[must_use]
    pub fn is_single_threaded(&self) -> bool {
        self.cull_name.is_empty() && self.draw_name.is_empty()
    }

    /// Number of pipeline stages the model needs.
    #[must_use]
    pub fn required_stages(&self) -> usize {
        self.cull_stage.max(self.draw_stage) + 1
    }
}

impl FromStr for ThreadingModel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ThreadingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.cull_sorting {
            write!(f, "-{}", self.cull_name)
        } else if self.cull_name == self.draw_name {
            f.write_str(&self.cull_name)
        } else {
            write!(f, "{}/{}", self.cull_name, self.draw_name)
        }
    }
}
