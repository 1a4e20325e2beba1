//! # Threaded Arbiter
//!
//! The real multi-stage backend. Each slot is a small lock with an owner:
//!
//! ```text
//!              acquire_read_locked            elevate_read
//!   ┌──────┐ ─────────────────────► ┌────────────────┐ ──────────► ┌───────────┐
//!   │ Idle │                        │ ReadLockedHeld │             │ WriteHeld │
//!   └──────┘ ◄───────────────────── └────────────────┘             └───────────┘
//!      │  ▲     release_read_locked                                  │     ▲
//!      │  └──────────────────────── release_write ───────────────────┘     │
//!      └─────────────────────────── acquire_write ─────────────────────────┘
//! ```
//!
//! Unlocked readers sit outside the state machine: they only bump a counter
//! and load the committed snapshot, so they never block and never see a
//! half-written value.
//!
//! All slot state lives behind one mutex with one condition variable. Claims
//! that span several slots (upstream writes, stage sweeps) are taken all at
//! once, so a writer never holds one slot while waiting for another it asked
//! for in the same call.
//!
//! Elevation is the exception: the elevated slot stays held while the
//! upstream slots are awaited. Two threads that each hold a locked read on a
//! stage the other's upstream elevation needs wait on each other forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{AccessArbiter, Outstanding, Upstream, WriteGrant};
use crate::ring::StageRing;
use crate::stage::{StageSet, ThreadToken};

#[derive(Clone, Copy, Default)]
struct SlotState {
    owner: Option<ThreadToken>,
    locked_reads: usize,
    writing: bool,
}

impl SlotState {
    #[inline]
    fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    #[inline]
    fn is_free_for(&self, owner: ThreadToken) -> bool {
        self.owner.map_or(true, |current| current == owner)
    }

    fn release_if_unused(&mut self) {
        if self.locked_reads == 0 && !self.writing {
            self.owner = None;
        }
    }
}

struct State {
    slots: Vec<SlotState>,
    dirty: bool,
}

/// Multi-stage backend with per-slot blocking locks.
pub struct ThreadedArbiter<T> {
    ring: StageRing<T>,
    state: Mutex<State>,
    released: Condvar,
    reads: Box<[AtomicUsize]>,
}

impl<T> ThreadedArbiter<T> {
    #[inline]
    fn check_stage(&self, stage: usize) {
        assert!(
            stage < self.ring.len(),
            "pipeline stage {stage} out of range for a {}-stage cycler",
            self.ring.len()
        );
    }

    /// Shallower stages an upstream write of `stage` should also claim.
    fn upstream_targets(&self, stage: usize, upstream: Upstream) -> StageSet {
        match upstream {
            Upstream::None => StageSet::EMPTY,
            Upstream::ForceTo0 => StageSet::below(stage),
            Upstream::Shared => {
                let mut targets = StageSet::EMPTY;
                for shallower in (0..stage).rev() {
                    if !self.ring.shares(shallower, stage) {
                        break;
                    }
                    targets.insert(shallower);
                }
                targets
            }
        }
    }

    /// Panics if `owner` already holds any of `targets`: taking them again
    /// would deadlock on itself.
    fn assert_not_held(state: &State, targets: StageSet, owner: ThreadToken) {
        for stage in targets.iter() {
            let slot = &state.slots[stage];
            if slot.owner != Some(owner) {
                continue;
            }
            assert!(
                !slot.writing,
                "double write: stage {stage} already checked out for writing by this thread"
            );
            panic!("acquire_write on stage {stage} while holding a locked read; elevate the read instead");
        }
    }

    /// Blocks until `extra` (recomputed on every wake-up) plus `fixed` are all
    /// free, then returns the final `extra` set. Still holds the lock.
    fn wait_for_slots(
        &self,
        state: &mut MutexGuard<'_, State>,
        fixed: StageSet,
        owner: ThreadToken,
        extra: impl Fn(&Self) -> StageSet,
    ) -> StageSet {
        let mut contended = false;
        loop {
            let targets = extra(self);
            Self::assert_not_held(state, targets.union(fixed), owner);
            if targets.union(fixed).iter().all(|stage| state.slots[stage].is_free()) {
                return targets;
            }
            if !contended {
                contended = true;
                tracing::trace!(stages = ?targets.union(fixed), "write blocked on contended slot");
            }
            self.released.wait(state);
        }
    }

    fn assert_writing(state: &State, targets: StageSet, owner: ThreadToken) {
        for stage in targets.iter() {
            let slot = &state.slots[stage];
            assert!(
                slot.owner == Some(owner) && slot.writing,
                "release_write on stage {stage} without a matching acquire_write"
            );
        }
    }

    fn claim_for_write(state: &mut State, targets: StageSet, owner: ThreadToken) {
        for stage in targets.iter() {
            let slot = &mut state.slots[stage];
            slot.owner = Some(owner);
            slot.writing = true;
        }
    }
}

impl<T: Clone + Send + Sync> AccessArbiter<T> for ThreadedArbiter<T> {
    fn new(initial: T, num_stages: usize) -> Self {
        let ring = StageRing::new(initial, num_stages);
        let reads: Vec<AtomicUsize> = (0..num_stages).map(|_| AtomicUsize::new(0)).collect();
        Self {
            ring,
            state: Mutex::new(State {
                slots: vec![SlotState::default(); num_stages],
                dirty: false,
            }),
            released: Condvar::new(),
            reads: reads.into_boxed_slice(),
        }
    }

    #[inline]
    fn num_stages(&self) -> usize {
        self.ring.len()
    }

    fn acquire_read(&self, stage: usize) -> Arc<T> {
        self.check_stage(stage);
        self.reads[stage].fetch_add(1, Ordering::AcqRel);
        self.ring.load(stage)
    }

    fn release_read(&self, stage: usize) {
        self.check_stage(stage);
        let released = self.reads[stage]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok();
        assert!(released, "release_read on stage {stage} without a matching acquire_read");
    }

    fn acquire_read_locked(&self, stage: usize, owner: ThreadToken) -> Arc<T> {
        self.check_stage(stage);
        let mut state = self.state.lock();
        let mut contended = false;
        while !state.slots[stage].is_free_for(owner) {
            if !contended {
                contended = true;
                tracing::trace!(stage, "locked read blocked on contended slot");
            }
            self.released.wait(&mut state);
        }
        let slot = &mut state.slots[stage];
        slot.owner = Some(owner);
        slot.locked_reads += 1;
        self.ring.load(stage)
    }

    fn release_read_locked(&self, stage: usize, owner: ThreadToken) {
        self.check_stage(stage);
        let mut state = self.state.lock();
        let slot = &mut state.slots[stage];
        assert!(
            slot.owner == Some(owner) && slot.locked_reads > 0,
            "release_read_locked on stage {stage} without a matching acquire_read_locked"
        );
        slot.locked_reads -= 1;
        slot.release_if_unused();
        drop(state);
        self.released.notify_all();
    }

    fn acquire_write(&self, stage: usize, upstream: Upstream, owner: ThreadToken) -> WriteGrant<T> {
        self.check_stage(stage);
        let main = StageSet::single(stage);
        let mut state = self.state.lock();
        let upstream_set =
            self.wait_for_slots(&mut state, main, owner, |this| this.upstream_targets(stage, upstream));
        Self::claim_for_write(&mut state, upstream_set.union(main), owner);
        let value = T::clone(&self.ring.load(stage));
        WriteGrant {
            stage,
            upstream: upstream_set,
            value,
        }
    }

    fn elevate_read(&self, stage: usize, upstream: Upstream, owner: ThreadToken) -> WriteGrant<T> {
        self.check_stage(stage);
        let mut state = self.state.lock();
        {
            let slot = &mut state.slots[stage];
            assert!(
                slot.owner == Some(owner) && slot.locked_reads > 0,
                "elevate_read on stage {stage} without a locked read"
            );
            assert!(
                !slot.writing,
                "double write: stage {stage} already checked out for writing by this thread"
            );
            // The slot never leaves our hands: the read becomes the write.
            slot.locked_reads -= 1;
            slot.writing = true;
        }
        let upstream_set = self.wait_for_slots(&mut state, StageSet::EMPTY, owner, |this| {
            this.upstream_targets(stage, upstream)
        });
        Self::claim_for_write(&mut state, upstream_set, owner);
        let value = T::clone(&self.ring.load(stage));
        WriteGrant {
            stage,
            upstream: upstream_set,
            value,
        }
    }

    fn release_write(&self, grant: WriteGrant<T>, owner: ThreadToken) -> bool {
        let targets = grant.upstream.union(StageSet::single(grant.stage));
        let mut state = self.state.lock();
        Self::assert_writing(&state, targets, owner);

        let committed = Arc::new(grant.value);
        for stage in targets.iter() {
            self.ring.store(stage, Arc::clone(&committed));
            let slot = &mut state.slots[stage];
            slot.writing = false;
            slot.release_if_unused();
        }

        let newly_dirty = !state.dirty && !self.ring.is_uniform();
        if newly_dirty {
            state.dirty = true;
        }
        drop(state);
        self.released.notify_all();
        newly_dirty
    }

    fn abandon_write(&self, grant: WriteGrant<T>, owner: ThreadToken) {
        let targets = grant.upstream.union(StageSet::single(grant.stage));
        let mut state = self.state.lock();
        Self::assert_writing(&state, targets, owner);
        for stage in targets.iter() {
            let slot = &mut state.slots[stage];
            slot.writing = false;
            slot.release_if_unused();
        }
        drop(state);
        self.released.notify_all();
        tracing::debug!(stage = grant.stage, "write abandoned without commit");
    }

    fn acquire_sweep(&self, stages: StageSet, owner: ThreadToken) -> Vec<WriteGrant<T>> {
        for stage in stages.iter() {
            self.check_stage(stage);
        }
        let mut state = self.state.lock();
        self.wait_for_slots(&mut state, stages, owner, |_| StageSet::EMPTY);
        Self::claim_for_write(&mut state, stages, owner);
        stages
            .iter()
            .map(|stage| WriteGrant {
                stage,
                upstream: StageSet::EMPTY,
                value: T::clone(&self.ring.load(stage)),
            })
            .collect()
    }

    fn cycle(&self) -> bool {
        let mut state = self.state.lock();
        let stages = self.ring.len();
        let mut contended = false;
        while !(1..stages).all(|stage| state.slots[stage].is_free()) {
            if !contended {
                contended = true;
                tracing::trace!("cycle waiting for downstream slots to be released");
            }
            self.released.wait(&mut state);
        }
        self.ring.advance();
        let still_dirty = !self.ring.is_uniform();
        state.dirty = still_dirty;
        still_dirty
    }

    fn snapshot(&self, stage: usize) -> Arc<T> {
        self.check_stage(stage);
        self.ring.load(stage)
    }

    fn cheat(&self, stage: usize) -> *const T {
        self.check_stage(stage);
        self.ring.as_ptr(stage)
    }

    fn outstanding(&self) -> Outstanding {
        let state = self.state.lock();
        Outstanding {
            reads: self.reads.iter().map(|count| count.load(Ordering::Acquire)).sum(),
            locked_reads: state.slots.iter().map(|slot| slot.locked_reads).sum(),
            writes: state.slots.iter().filter(|slot| slot.writing).count(),
        }
    }
}

impl<T> Drop for ThreadedArbiter<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let reads: usize = self.reads.iter().map(|count| count.load(Ordering::Acquire)).sum();
        let held = self.state.get_mut().slots.iter().filter(|slot| !slot.is_free()).count();
        assert!(
            reads == 0 && held == 0,
            "cycler destroyed while checked out ({reads} reads, {held} locked slots)"
        );
    }
}
