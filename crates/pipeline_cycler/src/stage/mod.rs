//! # Pipeline Stage Context
//!
//! Every checkout is made on behalf of a [`StageThread`]: a small handle that
//! names the pipeline stage the caller belongs to and identifies it as a lock
//! owner. Threads are passed explicitly into every cycler operation, so a
//! single test thread can impersonate App, Cull and Draw at once.
//!
//! ```text
//!   App thread ──► stage 0 ──► slot 0  (newest)
//!   Cull thread ─► stage 1 ──► slot 1
//!   Draw thread ─► stage 2 ──► slot 2  (oldest)
//! ```

mod model;

pub use model::ThreadingModel;

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on the number of pipeline stages.
///
/// Stage sets are stored as a single machine word.
pub const MAX_STAGES: usize = 32;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<StageThread>>> = const { RefCell::new(None) };
}

/// Opaque identity of a [`StageThread`], used as the owner of slot locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadToken(u64);

impl ThreadToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw token value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A thread of execution bound to one pipeline stage.
///
/// Cloning the `Arc` shares the identity: two clones are the same lock owner.
/// Two separately constructed `StageThread`s are always distinct owners, even
/// when they run on the same OS thread.
pub struct StageThread {
    token: ThreadToken,
    name: String,
    stage: AtomicUsize,
}

impl StageThread {
    /// Creates a new stage thread handle.
    ///
    /// # Panics
    ///
    /// Panics if `stage >= MAX_STAGES`.
    #[must_use]
    pub fn new(name: impl Into<String>, stage: usize) -> Arc<Self> {
        assert!(stage < MAX_STAGES, "pipeline stage {stage} out of range (max {MAX_STAGES})");
        Arc::new(Self {
            token: ThreadToken::next(),
            name: name.into(),
            stage: AtomicUsize::new(stage),
        })
    }

    /// Returns the handle bound to the calling OS thread.
    ///
    /// The first call on a thread creates a stage-0 handle named after the OS
    /// thread.
    #[must_use]
    pub fn current() -> Arc<Self> {
        CURRENT.with(|current| {
            current
                .borrow_mut()
                .get_or_insert_with(|| {
                    let name = std::thread::current()
                        .name()
                        .unwrap_or("unnamed")
                        .to_owned();
                    Self::new(name, 0)
                })
                .clone()
        })
    }

    /// Binds this handle to the calling OS thread, returning the previous
    /// binding if there was one.
    pub fn bind_current(self: &Arc<Self>) -> Option<Arc<Self>> {
        CURRENT.with(|current| current.borrow_mut().replace(Arc::clone(self)))
    }

    /// Shorthand for `StageThread::current().pipeline_stage()`.
    #[must_use]
    pub fn current_pipeline_stage() -> usize {
        Self::current().pipeline_stage()
    }

    /// Returns the lock-owner identity.
    #[inline]
    #[must_use]
    pub fn token(&self) -> ThreadToken {
        self.token
    }

    /// Returns the thread name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the pipeline stage this thread reads and writes by default.
    #[inline]
    #[must_use]
    pub fn pipeline_stage(&self) -> usize {
        self.stage.load(Ordering::Acquire)
    }

    /// Moves the thread to another stage.
    ///
    /// # Panics
    ///
    /// Panics if `stage >= MAX_STAGES`.
    pub fn set_pipeline_stage(&self, stage: usize) {
        assert!(stage < MAX_STAGES, "pipeline stage {stage} out of range (max {MAX_STAGES})");
        self.stage.store(stage, Ordering::Release);
    }

    /// Raises the thread's stage to at least `stage`; never lowers it.
    ///
    /// # Panics
    ///
    /// Panics if `stage >= MAX_STAGES`.
    pub fn set_min_pipeline_stage(&self, stage: usize) {
        assert!(stage < MAX_STAGES, "pipeline stage {stage} out of range (max {MAX_STAGES})");
        self.stage.fetch_max(stage, Ordering::AcqRel);
    }
}

impl fmt::Debug for StageThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageThread")
            .field("name", &self.name)
            .field("token", &self.token.raw())
            .field("stage", &self.pipeline_stage())
            .finish()
    }
}

impl fmt::Display for StageThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@stage{}", self.name, self.pipeline_stage())
    }
}

/// A set of pipeline stages packed into one word.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StageSet(u32);

impl StageSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Returns a set holding only `stage`.
    #[inline]
    #[must_use]
    pub const fn single(stage: usize) -> Self {
        Self(1 << stage)
    }

    /// Returns the set `0..end`.
    #[inline]
    #[must_use]
    pub const fn below(end: usize) -> Self {
        if end >= MAX_STAGES {
            Self(u32::MAX)
        } else {
            Self((1 << end) - 1)
        }
    }

    /// Adds `stage` to the set.
    #[inline]
    pub fn insert(&mut self, stage: usize) {
        debug_assert!(stage < MAX_STAGES);
        self.0 |= 1 << stage;
    }

    /// Returns whether `stage` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, stage: usize) -> bool {
        stage < MAX_STAGES && self.0 & (1 << stage) != 0
    }

    /// Returns whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the number of stages in the set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns the union of two sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterates the stages in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_STAGES).filter(move |stage| bits & (1 << stage) != 0)
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
