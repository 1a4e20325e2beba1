//! Single slot, no bookkeeping.
//!
//! Used when neither pipelining nor threading is wanted. Every stage maps to
//! the one slot and nothing is checked.
//!
//! A write still edits a copy of the record. The slot keeps its own reference
//! to the committed snapshot, and a read taken while a write is open has to
//! see that snapshot, so the value is never moved out to be edited in place.

use std::sync::Arc;

use super::{AccessArbiter, Outstanding, Upstream, WriteGrant};
use crate::ring::StageRing;
use crate::stage::{StageSet, ThreadToken};

/// Backend that keeps one snapshot and checks nothing.
pub struct TrivialArbiter<T> {
    ring: StageRing<T>,
}

impl<T: Clone + Send + Sync> AccessArbiter<T> for TrivialArbiter<T> {
    fn new(initial: T, _num_stages: usize) -> Self {
        Self {
            ring: StageRing::new(initial, 1),
        }
    }

    #[inline]
    fn num_stages(&self) -> usize {
        1
    }

    #[inline]
    fn acquire_read(&self, _stage: usize) -> Arc<T> {
        self.ring.load(0)
    }

    #[inline]
    fn release_read(&self, _stage: usize) {}

    #[inline]
    fn acquire_read_locked(&self, _stage: usize, _owner: ThreadToken) -> Arc<T> {
        self.ring.load(0)
    }

    #[inline]
    fn release_read_locked(&self, _stage: usize, _owner: ThreadToken) {}

    #[inline]
    fn acquire_write(&self, stage: usize, _upstream: Upstream, _owner: ThreadToken) -> WriteGrant<T> {
        WriteGrant {
            stage,
            upstream: StageSet::EMPTY,
            value: T::clone(&self.ring.load(0)),
        }
    }

    #[inline]
    fn elevate_read(&self, stage: usize, upstream: Upstream, owner: ThreadToken) -> WriteGrant<T> {
        self.acquire_write(stage, upstream, owner)
    }

    #[inline]
    fn release_write(&self, grant: WriteGrant<T>, _owner: ThreadToken) -> bool {
        self.ring.store(0, Arc::new(grant.value));
        false
    }

    #[inline]
    fn abandon_write(&self, _grant: WriteGrant<T>, _owner: ThreadToken) {}

    fn acquire_sweep(&self, stages: StageSet, owner: ThreadToken) -> Vec<WriteGrant<T>> {
        if stages.is_empty() {
            return Vec::new();
        }
        vec![self.acquire_write(0, Upstream::None, owner)]
    }

    #[inline]
    fn cycle(&self) -> bool {
        false
    }

    #[inline]
    fn snapshot(&self, _stage: usize) -> Arc<T> {
        self.ring.load(0)
    }

    #[inline]
    fn cheat(&self, _stage: usize) -> *const T {
        self.ring.as_ptr(0)
    }

    #[inline]
    fn outstanding(&self) -> Outstanding {
        Outstanding::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageThread;

    #[test]
    fn test_collapses_to_one_slot() {
        let arbiter = TrivialArbiter::new(5u32, 3);
        assert_eq!(arbiter.num_stages(), 1);

        let app = StageThread::new("app", 0);
        let mut grant = arbiter.acquire_write(2, Upstream::None, app.token());
        grant.value = 9;
        assert!(!arbiter.release_write(grant, app.token()));

        assert_eq!(*arbiter.acquire_read(0), 9);
        assert_eq!(*arbiter.snapshot(2), 9);
        assert!(!arbiter.cycle());
    }

    #[test]
    fn test_abandon_and_sweep() {
        let arbiter = TrivialArbiter::new(5u32, 2);
        let app = StageThread::new("app", 0);

        let mut grant = arbiter.acquire_write(0, Upstream::None, app.token());
        grant.value = 6;
        arbiter.abandon_write(grant, app.token());
        assert_eq!(*arbiter.snapshot(0), 5);

        let mut grants = arbiter.acquire_sweep(StageSet::below(2), app.token());
        assert_eq!(grants.len(), 1);
        grants[0].value = 8;
        arbiter.release_sweep(grants, app.token());
        assert_eq!(*arbiter.snapshot(1), 8);
        assert!(arbiter.acquire_sweep(StageSet::EMPTY, app.token()).is_empty());
    }

    #[test]
    fn test_unbalanced_release_is_ignored() {
        let arbiter = TrivialArbiter::new(1u8, 1);
        arbiter.release_read(0);
        arbiter.release_read(0);
        assert!(arbiter.outstanding().is_idle());
    }
}
