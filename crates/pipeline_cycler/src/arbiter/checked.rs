//! Single slot with protocol assertions.
//!
//! Counts every checkout so misuse is caught where it happens: a second
//! writer, a write taken over a locked read instead of elevating it, a
//! release nobody acquired, or dropping the cycler while something is still
//! checked out. Conflicts panic instead of blocking, so this backend only
//! suits single-threaded pipelines.
//!
//! Every stage maps to the one slot, but stage indices are still checked
//! against the pipeline depth the cycler was built for, so an out-of-range
//! stage fails here the same way it would on the threaded backend.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{AccessArbiter, Outstanding, Upstream, WriteGrant};
use crate::ring::StageRing;
use crate::stage::{StageSet, ThreadToken};

#[derive(Default)]
struct Counters {
    reads: usize,
    locked_reads: usize,
    writing: bool,
}

/// Backend that keeps one snapshot and asserts the checkout protocol.
pub struct CheckedArbiter<T> {
    ring: StageRing<T>,
    stages: usize,
    counters: Mutex<Counters>,
}

impl<T> CheckedArbiter<T> {
    #[inline]
    fn check_stage(&self, stage: usize) {
        assert!(
            stage < self.stages,
            "pipeline stage {stage} out of range for a {}-stage cycler",
            self.stages
        );
    }

    fn grant(&self, stage: usize) -> WriteGrant<T>
    where
        T: Clone,
    {
        WriteGrant {
            stage,
            upstream: StageSet::EMPTY,
            value: T::clone(&self.ring.load(0)),
        }
    }

    fn claim_write(&self) {
        let mut counters = self.counters.lock();
        assert!(!counters.writing, "double write: slot already checked out for writing");
        assert!(
            counters.locked_reads == 0,
            "acquire_write while a locked read is held; elevate the read instead"
        );
        counters.writing = true;
    }
}

impl<T: Clone + Send + Sync> AccessArbiter<T> for CheckedArbiter<T> {
    fn new(initial: T, num_stages: usize) -> Self {
        Self {
            ring: StageRing::new(initial, 1),
            stages: num_stages.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    #[inline]
    fn num_stages(&self) -> usize {
        1
    }

    fn acquire_read(&self, stage: usize) -> Arc<T> {
        self.check_stage(stage);
        self.counters.lock().reads += 1;
        self.ring.load(0)
    }

    fn release_read(&self, stage: usize) {
        self.check_stage(stage);
        let mut counters = self.counters.lock();
        assert!(counters.reads > 0, "release_read without a matching acquire_read");
        counters.reads -= 1;
    }

    fn acquire_read_locked(&self, stage: usize, _owner: ThreadToken) -> Arc<T> {
        self.check_stage(stage);
        self.counters.lock().locked_reads += 1;
        self.ring.load(0)
    }

    fn release_read_locked(&self, stage: usize, _owner: ThreadToken) {
        self.check_stage(stage);
        let mut counters = self.counters.lock();
        assert!(
            counters.locked_reads > 0,
            "release_read_locked without a matching acquire_read_locked"
        );
        counters.locked_reads -= 1;
    }

    fn acquire_write(&self, stage: usize, _upstream: Upstream, _owner: ThreadToken) -> WriteGrant<T> {
        self.check_stage(stage);
        self.claim_write();
        self.grant(stage)
    }

    fn elevate_read(&self, stage: usize, _upstream: Upstream, _owner: ThreadToken) -> WriteGrant<T> {
        self.check_stage(stage);
        let mut counters = self.counters.lock();
        assert!(counters.locked_reads > 0, "elevate_read without a locked read");
        assert!(!counters.writing, "double write: slot already checked out for writing");
        counters.locked_reads -= 1;
        counters.writing = true;
        drop(counters);
        self.grant(stage)
    }

    fn release_write(&self, grant: WriteGrant<T>, _owner: ThreadToken) -> bool {
        self.check_stage(grant.stage);
        let mut counters = self.counters.lock();
        assert!(counters.writing, "release_write without a matching acquire_write");
        self.ring.store(0, Arc::new(grant.value));
        counters.writing = false;
        false
    }

    fn abandon_write(&self, grant: WriteGrant<T>, _owner: ThreadToken) {
        self.check_stage(grant.stage);
        let mut counters = self.counters.lock();
        assert!(counters.writing, "release_write without a matching acquire_write");
        counters.writing = false;
    }

    fn acquire_sweep(&self, stages: StageSet, _owner: ThreadToken) -> Vec<WriteGrant<T>> {
        for stage in stages.iter() {
            self.check_stage(stage);
        }
        if stages.is_empty() {
            return Vec::new();
        }
        self.claim_write();
        vec![self.grant(0)]
    }

    #[inline]
    fn cycle(&self) -> bool {
        false
    }

    #[inline]
    fn snapshot(&self, stage: usize) -> Arc<T> {
        self.check_stage(stage);
        self.ring.load(0)
    }

    #[inline]
    fn cheat(&self, stage: usize) -> *const T {
        self.check_stage(stage);
        self.ring.as_ptr(0)
    }

    fn outstanding(&self) -> Outstanding {
        let counters = self.counters.lock();
        Outstanding {
            reads: counters.reads,
            locked_reads: counters.locked_reads,
            writes: usize::from(counters.writing),
        }
    }
}

impl<T> Drop for CheckedArbiter<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let counters = self.counters.get_mut();
        assert!(
            counters.reads == 0 && counters.locked_reads == 0 && !counters.writing,
            "cycler destroyed while checked out ({} reads, {} locked reads, writing: {})",
            counters.reads,
            counters.locked_reads,
            counters.writing
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageThread;

    fn owner() -> ThreadToken {
        StageThread::new("app", 0).token()
    }

    #[test]
    fn test_counts_checkouts() {
        let arbiter = CheckedArbiter::new(0i32, 3);
        let me = owner();

        let _ = arbiter.acquire_read(0);
        let _ = arbiter.acquire_read_locked(0, me);
        assert_eq!(
            arbiter.outstanding(),
            Outstanding { reads: 1, locked_reads: 1, writes: 0 }
        );

        let mut grant = arbiter.elevate_read(0, Upstream::None, me);
        grant.value = 4;
        assert_eq!(arbiter.outstanding().writes, 1);
        arbiter.release_write(grant, me);
        arbiter.release_read(0);

        assert!(arbiter.outstanding().is_idle());
        assert_eq!(*arbiter.snapshot(0), 4);
    }

    #[test]
    #[should_panic(expected = "double write")]
    fn test_double_write_panics() {
        let arbiter = CheckedArbiter::new(0i32, 1);
        let me = owner();
        let _first = arbiter.acquire_write(0, Upstream::None, me);
        let _second = arbiter.acquire_write(0, Upstream::None, me);
    }

    #[test]
    #[should_panic(expected = "elevate the read instead")]
    fn test_write_over_locked_read_panics() {
        let arbiter = CheckedArbiter::new(0i32, 1);
        let me = owner();
        let _ = arbiter.acquire_read_locked(0, me);
        let _ = arbiter.acquire_write(0, Upstream::None, me);
    }

    #[test]
    #[should_panic(expected = "without a matching acquire_read")]
    fn test_release_without_acquire_panics() {
        let arbiter = CheckedArbiter::new(0i32, 1);
        arbiter.release_read(0);
    }

    #[test]
    #[should_panic(expected = "pipeline stage 3 out of range for a 3-stage cycler")]
    fn test_stage_out_of_range_panics() {
        let arbiter = CheckedArbiter::new(0i32, 3);
        let _ = arbiter.acquire_read(2);
        let _ = arbiter.acquire_read(3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_write_stage_out_of_range_panics() {
        let arbiter = CheckedArbiter::new(0i32, 1);
        let _ = arbiter.acquire_write(1, Upstream::None, owner());
    }

    #[test]
    fn test_abandoned_write_keeps_value() {
        let arbiter = CheckedArbiter::new(7i32, 2);
        let me = owner();
        let mut grant = arbiter.acquire_write(1, Upstream::ForceTo0, me);
        grant.value = -1;
        arbiter.abandon_write(grant, me);

        assert_eq!(*arbiter.snapshot(1), 7);
        assert!(arbiter.outstanding().is_idle());
        let second = arbiter.acquire_write(0, Upstream::None, me);
        arbiter.release_write(second, me);
    }

    #[test]
    fn test_sweep_collapses_to_one_grant() {
        let arbiter = CheckedArbiter::new(1i32, 3);
        let me = owner();
        let mut grants = arbiter.acquire_sweep(StageSet::below(3), me);
        assert_eq!(grants.len(), 1);
        grants[0].value += 1;
        arbiter.release_sweep(grants, me);
        assert_eq!(*arbiter.snapshot(2), 2);
        assert!(arbiter.outstanding().is_idle());
    }

    #[test]
    #[should_panic(expected = "destroyed while checked out")]
    fn test_drop_while_held_panics() {
        let arbiter = CheckedArbiter::new(0i32, 1);
        let _ = arbiter.acquire_read(0);
        drop(arbiter);
    }
}
