//! # Pipeline Cycler
//!
//! The object embedded in every piece of pipelined state. A `Cycler` is one
//! pointer wide; the ring, the arbiter and the pipeline registration live in
//! a shared core so the [`Pipeline`] can reach dirty cyclers when it cycles.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new("render", 3);
//! let bounds = PipelineCycler::new(Bounds::default(), Some(&pipeline));
//!
//! // App thread
//! {
//!     let mut cdata = bounds.write(&app);
//!     cdata.radius = 4.0;
//! } // committed to stage 0
//!
//! // Draw thread still sees the old radius until two cycles have run.
//! let cdata = bounds.read(&draw);
//! ```

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::arbiter::{AccessArbiter, Outstanding, Upstream};
use crate::handle::{LockedReader, Reader, Sweep, Writer};
use crate::pipeline::{CycleHook, CyclerId, Pipeline};
use crate::stage::{StageSet, StageThread};

#[cfg(all(feature = "pipelining", feature = "threads"))]
/// Backend chosen by the enabled cargo features.
pub type DefaultArbiter<T> = crate::arbiter::ThreadedArbiter<T>;

#[cfg(all(feature = "pipelining", not(feature = "threads")))]
/// Backend chosen by the enabled cargo features.
pub type DefaultArbiter<T> = crate::arbiter::CheckedArbiter<T>;

#[cfg(not(feature = "pipelining"))]
/// Backend chosen by the enabled cargo features.
pub type DefaultArbiter<T> = crate::arbiter::TrivialArbiter<T>;

/// A cycler on the build's default backend.
pub type PipelineCycler<T> = Cycler<T, DefaultArbiter<T>>;

pub(crate) struct CyclerCore<T, A> {
    arbiter: A,
    parent_type: &'static str,
    pipeline: Arc<Pipeline>,
    id: CyclerId,
    _record: PhantomData<fn() -> T>,
}

impl<T, A: AccessArbiter<T>> CycleHook for CyclerCore<T, A> {
    fn cycle(&self) -> bool {
        self.arbiter.cycle()
    }
}

impl<T, A> Drop for CyclerCore<T, A> {
    fn drop(&mut self) {
        self.pipeline.remove_cycler(self.id);
    }
}

/// Stage-versioned storage for a record of type `T`.
pub struct Cycler<T, A: AccessArbiter<T> = DefaultArbiter<T>> {
    core: Arc<CyclerCore<T, A>>,
}

impl<T, A> Cycler<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: AccessArbiter<T> + 'static,
{
    /// Creates a cycler seeded with `initial` in every stage.
    ///
    /// With `None` the cycler joins [`Pipeline::render`].
    #[must_use]
    pub fn new(initial: T, pipeline: Option<&Arc<Pipeline>>) -> Self {
        Self::with_parent_type(initial, pipeline, type_name::<T>())
    }

    /// Creates a cycler that reports `parent_type` as its owner in
    /// diagnostics.
    #[must_use]
    pub fn with_parent_type(initial: T, pipeline: Option<&Arc<Pipeline>>, parent_type: &'static str) -> Self {
        let pipeline = pipeline.map_or_else(Pipeline::render, Arc::clone);
        let core = pipeline.register(parent_type, |num_stages, id| {
            Arc::new(CyclerCore {
                arbiter: A::new(initial, num_stages),
                parent_type,
                pipeline: Arc::clone(&pipeline),
                id,
                _record: PhantomData,
            })
        });
        Self { core }
    }
}

impl<T, A: AccessArbiter<T>> Cycler<T, A> {
    #[inline]
    pub(crate) fn arbiter(&self) -> &A {
        &self.core.arbiter
    }

    /// Records a commit; registers with the pipeline on the clean → dirty
    /// transition.
    pub(crate) fn note_commit(&self, newly_dirty: bool) {
        if newly_dirty {
            self.core.pipeline.mark_dirty(self.core.id);
        }
    }

    /// Unlocked read of the thread's stage. Never blocks.
    #[must_use]
    pub fn read(&self, thread: &StageThread) -> Reader<'_, T, A> {
        self.read_stage(thread.pipeline_stage(), thread)
    }

    /// Unlocked read of an explicit stage. Never blocks.
    #[must_use]
    pub fn read_stage(&self, stage: usize, _thread: &StageThread) -> Reader<'_, T, A> {
        Reader::acquire(self, stage)
    }

    /// Untracked snapshot of the thread's stage, for hot traversal paths
    /// that do not need a handle.
    #[must_use]
    pub fn read_unlocked(&self, thread: &StageThread) -> Arc<T> {
        self.arbiter().snapshot(thread.pipeline_stage())
    }

    /// Locked read of the thread's stage; blocks while another thread holds
    /// the slot. The result can be elevated into a [`Writer`].
    #[must_use]
    pub fn read_locked(&self, thread: &StageThread) -> LockedReader<'_, T, A> {
        self.read_stage_locked(thread.pipeline_stage(), thread)
    }

    /// Locked read of an explicit stage.
    #[must_use]
    pub fn read_stage_locked(&self, stage: usize, thread: &StageThread) -> LockedReader<'_, T, A> {
        LockedReader::acquire(self, stage, thread.token())
    }

    /// Writes the thread's stage only.
    #[must_use]
    pub fn write(&self, thread: &StageThread) -> Writer<'_, T, A> {
        self.write_stage(thread.pipeline_stage(), thread)
    }

    /// Writes the thread's stage and the shallower stages that share its
    /// value; with `force_to_0` every shallower stage down to 0.
    #[must_use]
    pub fn write_upstream(&self, force_to_0: bool, thread: &StageThread) -> Writer<'_, T, A> {
        self.write_stage_upstream(thread.pipeline_stage(), force_to_0, thread)
    }

    /// Writes an explicit stage only.
    #[must_use]
    pub fn write_stage(&self, stage: usize, thread: &StageThread) -> Writer<'_, T, A> {
        Writer::acquire(self, stage, Upstream::None, thread.token())
    }

    /// Upstream write of an explicit stage.
    #[must_use]
    pub fn write_stage_upstream(&self, stage: usize, force_to_0: bool, thread: &StageThread) -> Writer<'_, T, A> {
        Writer::acquire(self, stage, Upstream::from_force(force_to_0), thread.token())
    }

    /// Elevates a locked read (of any stage) into a write of that stage.
    #[must_use]
    pub fn elevate_read_stage<'a>(&'a self, reader: LockedReader<'a, T, A>) -> Writer<'a, T, A> {
        reader.elevate()
    }

    /// Elevates a locked read into an upstream write.
    #[must_use]
    pub fn elevate_read_stage_upstream<'a>(
        &'a self,
        reader: LockedReader<'a, T, A>,
        force_to_0: bool,
    ) -> Writer<'a, T, A> {
        reader.elevate_upstream(force_to_0)
    }

    /// Edits every stage's value in one pass, shallowest first.
    ///
    /// All slots are claimed before `edit` runs and committed after it has
    /// seen them all, so no cycle lands in the middle of the sweep. For
    /// per-stage data that must change everywhere at once, such as a
    /// transform baked into every stage's copy of a record.
    pub fn for_each_stage<F>(&self, thread: &StageThread, edit: F)
    where
        F: FnMut(usize, &mut T),
    {
        self.sweep(StageSet::below(self.num_stages()), thread, edit);
    }

    /// Like [`for_each_stage`](Self::for_each_stage), limited to the
    /// thread's own stage and the shallower ones.
    pub fn for_each_upstream_stage<F>(&self, thread: &StageThread, edit: F)
    where
        F: FnMut(usize, &mut T),
    {
        self.sweep(StageSet::below(thread.pipeline_stage() + 1), thread, edit);
    }

    fn sweep<F>(&self, stages: StageSet, thread: &StageThread, mut edit: F)
    where
        F: FnMut(usize, &mut T),
    {
        let mut sweep = Sweep::acquire(self, stages, thread.token());
        for (stage, value) in sweep.stages_mut() {
            edit(stage, value);
        }
    }

    /// Number of slots this cycler keeps.
    #[inline]
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.arbiter().num_stages()
    }

    /// Raw address of a stage's committed value. Nothing is locked or
    /// counted; the pointer is only meaningful while the caller can prove
    /// nobody commits to that stage.
    #[must_use]
    pub fn cheat(&self, stage: usize) -> *const T {
        self.arbiter().cheat(stage)
    }

    /// Outstanding checkouts across all stages.
    #[must_use]
    pub fn outstanding(&self) -> Outstanding {
        self.arbiter().outstanding()
    }

    /// Type name of the object that owns this cycler.
    #[must_use]
    pub fn parent_type(&self) -> &'static str {
        self.core.parent_type
    }

    /// The pipeline this cycler is registered with.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.core.pipeline
    }
}

impl<T, A: AccessArbiter<T>> fmt::Display for Cycler<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cycler ({} stages, pipeline {})",
            self.core.parent_type,
            self.num_stages(),
            self.core.pipeline.name()
        )
    }
}

impl<T, A: AccessArbiter<T>> fmt::Debug for Cycler<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycler")
            .field("parent_type", &self.core.parent_type)
            .field("num_stages", &self.num_stages())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}
