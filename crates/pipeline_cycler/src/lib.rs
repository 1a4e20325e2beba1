//! # Pipeline Cycler
//!
//! Stage-versioned state for a multi-threaded render pipeline:
//! - App writes the newest value while Cull and Draw read older ones
//! - Every stage sees one consistent snapshot per frame
//! - No copies and no locks when pipelining is compiled out
//!
//! ## Architecture
//!
//! ```text
//!   StageThread ──► Cycler ──► AccessArbiter ──► StageRing
//!   (which stage)   (API)      (who may touch)   (one snapshot per stage)
//!                     │
//!                     └──► Reader / LockedReader / Writer  (scoped checkouts)
//!
//!   Pipeline::cycle() once per frame: slot[i] ← slot[i-1] for dirty cyclers
//! ```
//!
//! ## Backends
//!
//! Selected by cargo features, see [`DefaultArbiter`]:
//!
//! 1. **`pipelining` + `threads`** - [`ThreadedArbiter`]: N slots, blocking
//!    per-slot locks
//! 2. **`pipelining`** - [`CheckedArbiter`]: one slot, protocol assertions
//! 3. **neither** - [`TrivialArbiter`]: one slot, nothing checked
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipeline_cycler::{Pipeline, PipelineCycler, StageThread};
//!
//! let pipeline = Pipeline::new("render", 3);
//! let transform = PipelineCycler::new([0.0f32; 16], Some(&pipeline));
//!
//! let app = StageThread::new("app", 0);
//! let draw = StageThread::new("draw", 2);
//!
//! transform.write(&app)[12] = 5.0;
//! assert_eq!(transform.read(&draw)[12], 0.0);
//!
//! pipeline.cycle();
//! pipeline.cycle();
//! assert_eq!(transform.read(&draw)[12], 5.0);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod arbiter;
pub mod config;
pub mod cycler;
pub mod error;
pub mod handle;
pub mod pipeline;
pub mod ring;
pub mod stage;

pub use arbiter::{
    AccessArbiter, CheckedArbiter, Outstanding, ThreadedArbiter, TrivialArbiter, Upstream,
    WriteGrant,
};
pub use config::PipelineConfig;
pub use cycler::{Cycler, DefaultArbiter, PipelineCycler};
pub use error::{PipelineError, PipelineResult};
pub use handle::{LockedReader, Reader, Writer};
pub use pipeline::{CycleReport, Pipeline};
pub use ring::StageRing;
pub use stage::{StageSet, StageThread, ThreadToken, ThreadingModel, MAX_STAGES};
