//! # Checkout Handles
//!
//! Scoped views into one stage of one cycler. Creating a handle checks the
//! slot out; dropping it checks the slot back in, on every exit path.
//!
//! - [`Reader`]: unlocked, never blocks, never writes.
//! - [`LockedReader`]: holds the slot lock; the only way to go from reading
//!   to writing is [`LockedReader::elevate`].
//! - [`Writer`]: edits a private copy that is committed when it drops.
//!
//! Cloning a reader checks the slot out again. Writers are not `Clone`: two
//! live mutable views of one record cannot coexist.
//!
//! A writer dropped while its thread unwinds from a panic releases its slots
//! without committing, so a half-finished edit never becomes visible.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::arbiter::{AccessArbiter, Upstream, WriteGrant};
use crate::cycler::Cycler;
use crate::stage::{StageSet, ThreadToken};

/// Unlocked read checkout of one stage.
pub struct Reader<'a, T, A: AccessArbiter<T>> {
    cycler: &'a Cycler<T, A>,
    stage: usize,
    data: Arc<T>,
}

impl<'a, T, A: AccessArbiter<T>> Reader<'a, T, A> {
    pub(crate) fn acquire(cycler: &'a Cycler<T, A>, stage: usize) -> Self {
        let data = cycler.arbiter().acquire_read(stage);
        Self { cycler, stage, data }
    }

    /// The stage this reader checked out.
    #[inline]
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// The snapshot being read. Outlives the checkout if kept.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> &Arc<T> {
        &self.data
    }
}

impl<T, A: AccessArbiter<T>> Deref for Reader<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T, A: AccessArbiter<T>> Clone for Reader<'_, T, A> {
    fn clone(&self) -> Self {
        Self::acquire(self.cycler, self.stage)
    }
}

impl<T, A: AccessArbiter<T>> Drop for Reader<'_, T, A> {
    fn drop(&mut self) {
        self.cycler.arbiter().release_read(self.stage);
    }
}

impl<T: fmt::Debug, A: AccessArbiter<T>> fmt::Debug for Reader<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("stage", &self.stage)
            .field("data", &*self.data)
            .finish()
    }
}

/// Locked read checkout of one stage.
pub struct LockedReader<'a, T, A: AccessArbiter<T>> {
    cycler: &'a Cycler<T, A>,
    stage: usize,
    owner: ThreadToken,
    data: Arc<T>,
    armed: bool,
}

impl<'a, T, A: AccessArbiter<T>> LockedReader<'a, T, A> {
    pub(crate) fn acquire(cycler: &'a Cycler<T, A>, stage: usize, owner: ThreadToken) -> Self {
        let data = cycler.arbiter().acquire_read_locked(stage, owner);
        Self {
            cycler,
            stage,
            owner,
            data,
            armed: true,
        }
    }

    /// The stage this reader holds.
    #[inline]
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Turns the read into a write of the same stage without letting any
    /// other writer in between.
    #[must_use]
    pub fn elevate(self) -> Writer<'a, T, A> {
        self.elevate_with(Upstream::None)
    }

    /// Like [`elevate`](Self::elevate), also claiming upstream stages.
    ///
    /// This stage stays locked while the upstream stages are awaited. If
    /// another thread holds a locked read on one of those stages and is
    /// itself waiting for this one, neither makes progress: take nested
    /// locked reads of one cycler in ascending stage order.
    #[must_use]
    pub fn elevate_upstream(self, force_to_0: bool) -> Writer<'a, T, A> {
        self.elevate_with(Upstream::from_force(force_to_0))
    }

    fn elevate_with(mut self, upstream: Upstream) -> Writer<'a, T, A> {
        // The locked read is consumed by the elevation, not released.
        self.armed = false;
        let grant = self.cycler.arbiter().elevate_read(self.stage, upstream, self.owner);
        Writer::from_grant(self.cycler, grant, self.owner)
    }
}

impl<T, A: AccessArbiter<T>> Deref for LockedReader<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T, A: AccessArbiter<T>> Clone for LockedReader<'_, T, A> {
    fn clone(&self) -> Self {
        Self::acquire(self.cycler, self.stage, self.owner)
    }
}

impl<T, A: AccessArbiter<T>> Drop for LockedReader<'_, T, A> {
    fn drop(&mut self) {
        if self.armed {
            self.cycler.arbiter().release_read_locked(self.stage, self.owner);
        }
    }
}

impl<T: fmt::Debug, A: AccessArbiter<T>> fmt::Debug for LockedReader<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedReader")
            .field("stage", &self.stage)
            .field("data", &*self.data)
            .finish()
    }
}

/// Write checkout of one stage (plus any upstream stages).
///
/// Derefs to a private copy of the record. Readers keep seeing the previous
/// commit until this handle drops.
pub struct Writer<'a, T, A: AccessArbiter<T>> {
    cycler: &'a Cycler<T, A>,
    owner: ThreadToken,
    grant: Option<WriteGrant<T>>,
}

impl<'a, T, A: AccessArbiter<T>> Writer<'a, T, A> {
    pub(crate) fn acquire(cycler: &'a Cycler<T, A>, stage: usize, upstream: Upstream, owner: ThreadToken) -> Self {
        let grant = cycler.arbiter().acquire_write(stage, upstream, owner);
        Self::from_grant(cycler, grant, owner)
    }

    fn from_grant(cycler: &'a Cycler<T, A>, grant: WriteGrant<T>, owner: ThreadToken) -> Self {
        Self {
            cycler,
            owner,
            grant: Some(grant),
        }
    }

    #[inline]
    fn grant(&self) -> &WriteGrant<T> {
        match &self.grant {
            Some(grant) => grant,
            None => unreachable!("writer used after release"),
        }
    }

    /// The stage being written.
    #[inline]
    #[must_use]
    pub fn stage(&self) -> usize {
        self.grant().stage
    }

    /// Shallower stages this write will also be committed to.
    #[inline]
    #[must_use]
    pub fn upstream(&self) -> StageSet {
        self.grant().upstream
    }
}

impl<'a, T, A: AccessArbiter<T>> From<LockedReader<'a, T, A>> for Writer<'a, T, A> {
    fn from(reader: LockedReader<'a, T, A>) -> Self {
        reader.elevate()
    }
}

impl<T, A: AccessArbiter<T>> Deref for Writer<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.grant().value
    }
}

impl<T, A: AccessArbiter<T>> DerefMut for Writer<'_, T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.grant {
            Some(grant) => &mut grant.value,
            None => unreachable!("writer used after release"),
        }
    }
}

impl<T, A: AccessArbiter<T>> Drop for Writer<'_, T, A> {
    fn drop(&mut self) {
        let Some(grant) = self.grant.take() else {
            return;
        };
        if std::thread::panicking() {
            self.cycler.arbiter().abandon_write(grant, self.owner);
            return;
        }
        let newly_dirty = self.cycler.arbiter().release_write(grant, self.owner);
        self.cycler.note_commit(newly_dirty);
    }
}

/// Write checkout of several stages at once, taken in one claim.
///
/// Committed together on drop, or abandoned together during a panic.
pub(crate) struct Sweep<'a, T, A: AccessArbiter<T>> {
    cycler: &'a Cycler<T, A>,
    owner: ThreadToken,
    grants: Vec<WriteGrant<T>>,
}

impl<'a, T, A: AccessArbiter<T>> Sweep<'a, T, A> {
    pub(crate) fn acquire(cycler: &'a Cycler<T, A>, stages: StageSet, owner: ThreadToken) -> Self {
        let grants = cycler.arbiter().acquire_sweep(stages, owner);
        Self { cycler, owner, grants }
    }

    /// Each claimed stage with its private copy, shallowest first.
    pub(crate) fn stages_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.grants.iter_mut().map(|grant| (grant.stage, &mut grant.value))
    }
}

impl<T, A: AccessArbiter<T>> Drop for Sweep<'_, T, A> {
    fn drop(&mut self) {
        let grants = std::mem::take(&mut self.grants);
        if grants.is_empty() {
            return;
        }
        if std::thread::panicking() {
            self.cycler.arbiter().abandon_sweep(grants, self.owner);
            return;
        }
        let newly_dirty = self.cycler.arbiter().release_sweep(grants, self.owner);
        self.cycler.note_commit(newly_dirty);
    }
}

impl<T: fmt::Debug, A: AccessArbiter<T>> fmt::Debug for Writer<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("stage", &self.stage())
            .field("upstream", &self.upstream())
            .field("data", &**self)
            .finish()
    }
}
