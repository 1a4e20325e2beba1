//! # Pipeline
//!
//! Owns the stage count and knows every cycler built against it. Once per
//! frame the driver calls [`Pipeline::cycle`], which advances every dirty
//! cycler by one stage:
//!
//! ```text
//! Frame N:   App writes ──► slot 0
//!            Cull reads ◄── slot 1
//!            Draw reads ◄── slot 2
//!
//! cycle():   slot 2 ← slot 1, slot 1 ← slot 0   (dirty cyclers only)
//!
//! Frame N+1: Cull now sees what App wrote in frame N
//! ```
//!
//! A cycler is dirty while its slots disagree. It joins the dirty list on the
//! first commit that makes them diverge and leaves it once a cycle finds
//! every slot caught up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::error::{PipelineError, PipelineResult};
use crate::stage::MAX_STAGES;

/// Identifies a cycler within its pipeline.
pub(crate) type CyclerId = u64;

/// What the pipeline needs from a registered cycler.
pub(crate) trait CycleHook: Send + Sync {
    /// Advances one stage; returns whether the slots still diverge.
    fn cycle(&self) -> bool;
}

struct Registration {
    hook: Weak<dyn CycleHook>,
    parent_type: &'static str,
}

#[derive(Default)]
struct Registry {
    cyclers: HashMap<CyclerId, Registration>,
    dirty: BTreeSet<CyclerId>,
}

/// Outcome of one [`Pipeline::cycle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Frame number completed by this cycle (1 for the first).
    pub frame: u64,
    /// Dirty cyclers that were advanced.
    pub cycled: usize,
    /// Cyclers left on the dirty list afterwards.
    pub still_dirty: usize,
    /// Registrations whose cycler was already gone.
    pub dropped: usize,
}

/// A render pipeline: stage count plus cycler registry.
pub struct Pipeline {
    name: String,
    num_stages: AtomicUsize,
    registry: Mutex<Registry>,
    cycle_lock: Mutex<()>,
    next_id: AtomicU64,
    frames: AtomicU64,
}

static RENDER_PIPELINE: OnceLock<Arc<Pipeline>> = OnceLock::new();

impl Pipeline {
    /// Creates a pipeline.
    ///
    /// # Panics
    ///
    /// Panics if `num_stages` is outside `1..=MAX_STAGES`.
    #[must_use]
    pub fn new(name: impl Into<String>, num_stages: usize) -> Arc<Self> {
        match Self::try_new(name, num_stages) {
            Ok(pipeline) => pipeline,
            Err(err) => panic!("{err}"),
        }
    }

    /// Creates a pipeline, validating the stage count.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidStageCount`] if `num_stages` is outside
    /// `1..=MAX_STAGES`.
    pub fn try_new(name: impl Into<String>, num_stages: usize) -> PipelineResult<Arc<Self>> {
        if !(1..=MAX_STAGES).contains(&num_stages) {
            return Err(PipelineError::InvalidStageCount {
                requested: num_stages,
                max: MAX_STAGES,
            });
        }
        let name = name.into();
        tracing::info!("pipeline {name:?} created with {num_stages} stages");
        Ok(Arc::new(Self {
            name,
            num_stages: AtomicUsize::new(num_stages),
            registry: Mutex::new(Registry::default()),
            cycle_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            frames: AtomicU64::new(0),
        }))
    }

    /// The process-wide default pipeline, used by cyclers built without an
    /// explicit one. Starts with a single stage.
    #[must_use]
    pub fn render() -> Arc<Self> {
        Arc::clone(RENDER_PIPELINE.get_or_init(|| Self::new("render", 1)))
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages new cyclers are built with.
    #[inline]
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.num_stages.load(Ordering::Acquire)
    }

    /// Grows the pipeline to at least `min_stages`. Never shrinks it.
    ///
    /// # Panics
    ///
    /// Panics if `min_stages > MAX_STAGES`, or if growth is needed while
    /// cyclers are registered: rings are never resized.
    pub fn set_min_stages(&self, min_stages: usize) {
        assert!(
            min_stages <= MAX_STAGES,
            "pipeline {:?} cannot have {min_stages} stages (max {MAX_STAGES})",
            self.name
        );
        let registry = self.registry.lock();
        let current = self.num_stages();
        if min_stages <= current {
            return;
        }
        assert!(
            registry.cyclers.is_empty(),
            "pipeline {:?} cannot grow from {current} to {min_stages} stages with {} live cyclers",
            self.name,
            registry.cyclers.len()
        );
        self.num_stages.store(min_stages, Ordering::Release);
        tracing::info!("pipeline {:?} grown to {min_stages} stages", self.name);
    }

    /// Advances every dirty cycler by one stage. Call once per frame, from
    /// the thread that owns the frame loop, while that thread holds no
    /// checkouts itself.
    ///
    /// Blocks while a dirty cycler has a writer or locked reader on a stage
    /// other than 0.
    pub fn cycle(&self) -> CycleReport {
        let _cycling = self.cycle_lock.lock();

        let pending: Vec<(CyclerId, Weak<dyn CycleHook>)> = {
            let mut registry = self.registry.lock();
            let dirty = std::mem::take(&mut registry.dirty);
            dirty
                .into_iter()
                .filter_map(|id| registry.cyclers.get(&id).map(|reg| (id, Weak::clone(&reg.hook))))
                .collect()
        };

        let mut report = CycleReport::default();
        let mut still_dirty = Vec::new();
        for (id, hook) in pending {
            match hook.upgrade() {
                Some(cycler) => {
                    report.cycled += 1;
                    if cycler.cycle() {
                        still_dirty.push(id);
                    }
                }
                None => report.dropped += 1,
            }
        }

        {
            let mut registry = self.registry.lock();
            for id in still_dirty {
                if registry.cyclers.contains_key(&id) {
                    registry.dirty.insert(id);
                }
            }
            report.still_dirty = registry.dirty.len();
        }

        report.frame = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
        if report.dropped > 0 {
            tracing::debug!("pipeline {:?} skipped {} dropped cyclers", self.name, report.dropped);
        }
        tracing::debug!(
            "pipeline {:?} frame {}: cycled {}, {} still dirty",
            self.name,
            report.frame,
            report.cycled,
            report.still_dirty
        );
        report
    }

    /// Number of completed cycles.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Number of registered cyclers.
    #[must_use]
    pub fn num_cyclers(&self) -> usize {
        self.registry.lock().cyclers.len()
    }

    /// Number of cyclers waiting to be cycled.
    #[must_use]
    pub fn num_dirty_cyclers(&self) -> usize {
        self.registry.lock().dirty.len()
    }

    /// Registered cyclers grouped by parent type.
    #[must_use]
    pub fn cycler_types(&self) -> BTreeMap<&'static str, usize> {
        let registry = self.registry.lock();
        let mut counts = BTreeMap::new();
        for reg in registry.cyclers.values() {
            *counts.entry(reg.parent_type).or_insert(0) += 1;
        }
        counts
    }

    /// Dirty cyclers grouped by parent type.
    #[must_use]
    pub fn dirty_cycler_types(&self) -> BTreeMap<&'static str, usize> {
        let registry = self.registry.lock();
        let mut counts = BTreeMap::new();
        for reg in registry.dirty.iter().filter_map(|id| registry.cyclers.get(id)) {
            *counts.entry(reg.parent_type).or_insert(0) += 1;
        }
        counts
    }

    /// Builds a cycler for the current stage count and registers it, both
    /// under the registry lock so [`set_min_stages`](Self::set_min_stages)
    /// cannot grow the pipeline in between.
    pub(crate) fn register<C>(&self, parent_type: &'static str, build: impl FnOnce(usize, CyclerId) -> Arc<C>) -> Arc<C>
    where
        C: CycleHook + 'static,
    {
        let mut registry = self.registry.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cycler = build(self.num_stages(), id);
        let hook: Weak<dyn CycleHook> = Arc::downgrade(&cycler) as Weak<dyn CycleHook>;
        registry.cyclers.insert(id, Registration { hook, parent_type });
        cycler
    }

    pub(crate) fn remove_cycler(&self, id: CyclerId) {
        let mut registry = self.registry.lock();
        registry.cyclers.remove(&id);
        registry.dirty.remove(&id);
    }

    pub(crate) fn mark_dirty(&self, id: CyclerId) {
        let mut registry = self.registry.lock();
        if registry.cyclers.contains_key(&id) {
            registry.dirty.insert(id);
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("num_stages", &self.num_stages())
            .field("frames", &self.frame_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} stages)", self.name, self.num_stages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ThreadedArbiter, TrivialArbiter};
    use crate::cycler::Cycler;
    use crate::stage::StageThread;

    #[test]
    fn test_rejects_bad_stage_counts() {
        assert!(matches!(
            Pipeline::try_new("zero", 0),
            Err(PipelineError::InvalidStageCount { requested: 0, .. })
        ));
        assert!(Pipeline::try_new("huge", MAX_STAGES + 1).is_err());
        assert!(Pipeline::try_new("ok", MAX_STAGES).is_ok());
    }

    #[test]
    fn test_set_min_stages_grows_only() {
        let pipeline = Pipeline::new("grow", 2);
        pipeline.set_min_stages(1);
        assert_eq!(pipeline.num_stages(), 2);
        pipeline.set_min_stages(3);
        assert_eq!(pipeline.num_stages(), 3);
    }

    #[test]
    #[should_panic(expected = "live cyclers")]
    fn test_cannot_grow_with_live_cyclers() {
        let pipeline = Pipeline::new("frozen", 1);
        let _cycler: Cycler<u32, TrivialArbiter<u32>> = Cycler::new(0, Some(&pipeline));
        pipeline.set_min_stages(2);
    }

    #[test]
    fn test_growth_races_registration_consistently() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        for round in 0..100 {
            let pipeline = Pipeline::new(format!("race-{round}"), 1);
            let (grown, cycler) = std::thread::scope(|scope| {
                let grow = scope.spawn(|| catch_unwind(AssertUnwindSafe(|| pipeline.set_min_stages(3))).is_ok());
                let cycler: Cycler<u32, ThreadedArbiter<u32>> = Cycler::new(0, Some(&pipeline));
                (grow.join().unwrap(), cycler)
            });

            // Either the growth happened first and the cycler was built for
            // it, or the cycler was registered first and the growth refused.
            assert_eq!(cycler.num_stages(), pipeline.num_stages());
            assert_eq!(pipeline.num_stages(), if grown { 3 } else { 1 });
        }
    }

    #[test]
    fn test_dirty_cycler_leaves_after_catching_up() {
        let pipeline = Pipeline::new("catch-up", 3);
        let cycler: Cycler<u32, ThreadedArbiter<u32>> = Cycler::new(0, Some(&pipeline));
        let clean: Cycler<u32, ThreadedArbiter<u32>> = Cycler::new(0, Some(&pipeline));
        let app = StageThread::new("app", 0);

        *cycler.write(&app) = 1;
        assert_eq!(pipeline.num_dirty_cyclers(), 1);
        assert_eq!(pipeline.dirty_cycler_types().values().sum::<usize>(), 1);

        let first = pipeline.cycle();
        assert_eq!(first, CycleReport { frame: 1, cycled: 1, still_dirty: 1, dropped: 0 });

        let second = pipeline.cycle();
        assert_eq!(second.still_dirty, 0);
        assert_eq!(pipeline.num_dirty_cyclers(), 0);

        let third = pipeline.cycle();
        assert_eq!(third.cycled, 0);
        assert_eq!(pipeline.frame_count(), 3);
        assert_eq!(pipeline.num_cyclers(), 2);
        drop(clean);
        assert_eq!(pipeline.num_cyclers(), 1);
    }

    #[test]
    fn test_render_pipeline_is_shared() {
        let a = Pipeline::render();
        let b = Pipeline::render();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "render");
    }
}
