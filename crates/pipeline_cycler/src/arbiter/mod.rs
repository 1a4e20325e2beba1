//! # Access Arbiters
//!
//! An arbiter owns a [`StageRing`](crate::ring::StageRing) and decides who
//! may touch which slot. Three backends implement the same contract:
//!
//! ```text
//! ┌────────────────┬────────┬──────────────────────┬───────────────────────┐
//! │ backend        │ slots  │ checks               │ concurrency           │
//! ├────────────────┼────────┼──────────────────────┼───────────────────────┤
//! │ Trivial        │ 1      │ none                 │ caller's problem      │
//! │ Checked        │ 1      │ protocol assertions  │ conflicts panic       │
//! │ Threaded       │ N      │ protocol assertions  │ blocks per slot       │
//! └────────────────┴────────┴──────────────────────┴───────────────────────┘
//! ```
//!
//! Reads hand out an `Arc` snapshot of the committed value. Writes hand out a
//! private copy in a [`WriteGrant`]; releasing the grant commits the copy to
//! the slot and to any upstream slots claimed with it.
//!
//! Client code is written against [`AccessArbiter`]; the default backend is
//! chosen by cargo features (see [`DefaultArbiter`](crate::DefaultArbiter)).

mod checked;
mod threaded;
mod trivial;

pub use checked::CheckedArbiter;
pub use threaded::ThreadedArbiter;
pub use trivial::TrivialArbiter;

use std::sync::Arc;

use crate::stage::{StageSet, ThreadToken};

/// How far a write propagates into shallower stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Upstream {
    /// Only the target stage.
    #[default]
    None,
    /// The target stage plus every shallower stage that still shares its
    /// current snapshot.
    Shared,
    /// The target stage plus every shallower stage down to stage 0.
    ForceTo0,
}

impl Upstream {
    /// Maps the `force_to_0` flag of an upstream write.
    #[inline]
    #[must_use]
    pub const fn from_force(force_to_0: bool) -> Self {
        if force_to_0 {
            Self::ForceTo0
        } else {
            Self::Shared
        }
    }
}

/// A granted write: the private copy plus the slots it will be committed to.
#[derive(Debug)]
pub struct WriteGrant<T> {
    /// The stage that was asked for.
    pub stage: usize,
    /// Extra shallower stages claimed for upstream propagation.
    pub upstream: StageSet,
    /// The private copy being edited.
    pub value: T,
}

/// Outstanding checkouts, summed over all slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outstanding {
    /// Unlocked readers.
    pub reads: usize,
    /// Locked readers.
    pub locked_reads: usize,
    /// Slots with a writer.
    pub writes: usize,
}

impl Outstanding {
    /// True when nothing is checked out.
    #[inline]
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.reads == 0 && self.locked_reads == 0 && self.writes == 0
    }
}

/// The checkout/checkin contract shared by all backends.
///
/// Stages are slot indices. Backends with a single slot map every stage to
/// slot 0. Lock-taking operations name their owner so reentrant misuse can be
/// told apart from contention.
pub trait AccessArbiter<T>: Send + Sync + Sized {
    /// Creates the arbiter and its ring, seeding every slot from `initial`.
    /// `num_stages` is the pipeline's stage count; single-slot backends
    /// ignore it.
    fn new(initial: T, num_stages: usize) -> Self;

    /// Number of slots actually kept.
    fn num_stages(&self) -> usize;

    /// Counts an unlocked reader of `stage` and returns its snapshot.
    /// Never blocks.
    fn acquire_read(&self, stage: usize) -> Arc<T>;

    /// Releases an unlocked reader of `stage`.
    fn release_read(&self, stage: usize);

    /// Takes the lock on `stage` for reading, blocking while another owner
    /// holds it, and returns the committed snapshot.
    fn acquire_read_locked(&self, stage: usize, owner: ThreadToken) -> Arc<T>;

    /// Releases a locked reader of `stage`.
    fn release_read_locked(&self, stage: usize, owner: ThreadToken);

    /// Takes the write lock on `stage` (and on upstream slots as requested),
    /// blocking while any of them is held by another owner.
    fn acquire_write(&self, stage: usize, upstream: Upstream, owner: ThreadToken) -> WriteGrant<T>;

    /// Converts one locked read of `stage` held by `owner` into a write,
    /// with no window in which another writer can take the slot.
    ///
    /// Upstream slots are claimed while `stage` stays held. Two owners that
    /// each hold a locked read the other's elevation needs will deadlock;
    /// take nested locked reads on one cycler in ascending stage order.
    fn elevate_read(&self, stage: usize, upstream: Upstream, owner: ThreadToken) -> WriteGrant<T>;

    /// Commits the grant's value and releases its write locks.
    ///
    /// Returns true if this commit made the slots diverge where they were
    /// uniform before, i.e. the owning cycler just became dirty.
    fn release_write(&self, grant: WriteGrant<T>, owner: ThreadToken) -> bool;

    /// Releases the grant's write locks without committing: every slot keeps
    /// the snapshot it had before the write was taken.
    fn abandon_write(&self, grant: WriteGrant<T>, owner: ThreadToken);

    /// Takes the write lock on every stage in `stages` in one step and
    /// returns one grant per slot, in ascending stage order.
    ///
    /// Single-slot backends return at most one grant, for slot 0.
    fn acquire_sweep(&self, stages: StageSet, owner: ThreadToken) -> Vec<WriteGrant<T>>;

    /// Commits the grants of a sweep.
    ///
    /// Grants are released in ascending stage order. A cycle needs every
    /// slot from 1 up free, so it cannot run until the deepest claimed slot
    /// is released, by which point every shallower one is committed.
    fn release_sweep(&self, grants: Vec<WriteGrant<T>>, owner: ThreadToken) -> bool {
        grants
            .into_iter()
            .fold(false, |dirty, grant| self.release_write(grant, owner) | dirty)
    }

    /// Releases the grants of a sweep without committing any of them.
    fn abandon_sweep(&self, grants: Vec<WriteGrant<T>>, owner: ThreadToken) {
        for grant in grants {
            self.abandon_write(grant, owner);
        }
    }

    /// Advances the ring by one stage. Returns whether the slots still
    /// diverge afterwards.
    fn cycle(&self) -> bool;

    /// Untracked snapshot of `stage`. Never blocks.
    fn snapshot(&self, stage: usize) -> Arc<T>;

    /// Raw address of the committed value of `stage`, without any locking.
    fn cheat(&self, stage: usize) -> *const T;

    /// Current checkout counts.
    fn outstanding(&self) -> Outstanding;
}
