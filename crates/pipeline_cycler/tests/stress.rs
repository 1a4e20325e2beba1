//! # Concurrency Stress Tests
//!
//! Hammers a threaded cycler from many stage threads while the frame driver
//! keeps cycling it, and checks:
//!
//! 1. **Mutual exclusion**: never two writers on one slot
//! 2. **No torn values**: every reader sees a record whose halves balance
//! 3. **Elevation atomicity**: read-modify-write through elevation loses no
//!    updates
//! 4. **Slot isolation**: writes to one stage never show up in another
//!    before a cycle
//! 5. **Interrupted writes**: a writer unwinding from a panic commits nothing
//! 6. **Sweep atomicity**: a stage sweep never straddles a cycle
//!
//! Run with: cargo test --test stress -- --nocapture

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pipeline_cycler::{Cycler, Pipeline, StageThread, ThreadedArbiter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STAGES: usize = 3;
const TOTAL: u64 = 1_000;

/// Two halves that must always sum to `TOTAL`.
#[derive(Clone, Debug)]
struct Ledger {
    left: u64,
    right: u64,
}

impl Ledger {
    fn balanced(&self) -> bool {
        self.left + self.right == TOTAL
    }
}

type LedgerCycler = Cycler<Ledger, ThreadedArbiter<Ledger>>;

/// Marks the stages a writer holds as active; panics on overlap.
struct ActiveGuard<'a> {
    active: &'a [AtomicUsize; STAGES],
    stages: Vec<usize>,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a [AtomicUsize; STAGES], stages: Vec<usize>) -> Self {
        for &stage in &stages {
            let before = active[stage].fetch_add(1, Ordering::SeqCst);
            assert_eq!(before, 0, "two writers inside stage {stage}");
        }
        Self { active, stages }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        for &stage in &self.stages {
            self.active[stage].fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn shift(ledger: &mut Ledger, amount: u64) {
    let amount = amount.min(ledger.left);
    ledger.left -= amount;
    std::thread::yield_now();
    ledger.right += amount;
    if ledger.left == 0 {
        std::mem::swap(&mut ledger.left, &mut ledger.right);
    }
}

#[test]
fn stress_mutual_exclusion_and_consistency() {
    let pipeline = Pipeline::new("stress", STAGES);
    let cycler: LedgerCycler = Cycler::new(Ledger { left: TOTAL, right: 0 }, Some(&pipeline));
    let active: [AtomicUsize; STAGES] = Default::default();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8u64)
            .map(|seed| {
                let cycler = &cycler;
                let active = &active;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let thread = StageThread::new(format!("worker-{seed}"), 0);
                    for _ in 0..2_000 {
                        let stage = rng.gen_range(0..STAGES);
                        match rng.gen_range(0..5) {
                            0 => {
                                let reader = cycler.read_stage(stage, &thread);
                                assert!(reader.balanced(), "torn read on stage {stage}: {:?}", *reader);
                            }
                            1 => {
                                let reader = cycler.read_stage_locked(stage, &thread);
                                assert!(reader.balanced());
                                if rng.gen_bool(0.5) {
                                    let mut writer = reader.elevate();
                                    let _inside = ActiveGuard::enter(active, vec![stage]);
                                    shift(&mut writer, rng.gen_range(1..50));
                                }
                            }
                            2 | 3 => {
                                let mut writer = cycler.write_stage(stage, &thread);
                                let _inside = ActiveGuard::enter(active, vec![stage]);
                                shift(&mut writer, rng.gen_range(1..50));
                            }
                            _ => {
                                let force = rng.gen_bool(0.5);
                                let mut writer = cycler.write_stage_upstream(stage, force, &thread);
                                let mut stages: Vec<usize> = writer.upstream().iter().collect();
                                stages.push(stage);
                                let _inside = ActiveGuard::enter(active, stages);
                                shift(&mut writer, rng.gen_range(1..50));
                            }
                        }
                    }
                })
            })
            .collect();

        let driver = scope.spawn(|| {
            let mut frames = 0u64;
            while !done.load(Ordering::Acquire) {
                pipeline.cycle();
                frames += 1;
                std::thread::yield_now();
            }
            frames
        });

        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Release);
        let frames = driver.join().unwrap();
        println!("stress: {frames} frames cycled");
    });

    assert!(cycler.outstanding().is_idle());
    let observer = StageThread::new("observer", 0);
    for stage in 0..STAGES {
        assert!(cycler.read_stage(stage, &observer).balanced());
    }
}

#[test]
fn stress_elevation_loses_no_updates() {
    const THREADS: u64 = 6;
    const ROUNDS: u64 = 500;

    let pipeline = Pipeline::new("elevation", 2);
    let cycler: Cycler<u64, ThreadedArbiter<u64>> = Cycler::new(0, Some(&pipeline));

    std::thread::scope(|scope| {
        for seed in 0..THREADS {
            let cycler = &cycler;
            scope.spawn(move || {
                let thread = StageThread::new(format!("rmw-{seed}"), 1);
                for round in 0..ROUNDS {
                    if (seed + round) % 3 == 0 {
                        *cycler.write(&thread) += 1;
                    } else {
                        let reader = cycler.read_locked(&thread);
                        let seen = *reader;
                        std::thread::yield_now();
                        let mut writer = reader.elevate();
                        assert_eq!(*writer, seen, "another writer slipped in during elevation");
                        *writer = seen + 1;
                    }
                }
            });
        }
    });

    let observer = StageThread::new("observer", 1);
    assert_eq!(*cycler.read(&observer), THREADS * ROUNDS);
}

#[test]
fn stress_slot_isolation() {
    let pipeline = Pipeline::new("isolation", STAGES);
    let cycler: Cycler<u64, ThreadedArbiter<u64>> = Cycler::new(7, Some(&pipeline));
    let done = AtomicBool::new(false);
    let observed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let app = StageThread::new("app", 0);
            for value in 100..2_100 {
                *cycler.write(&app) = value;
            }
            done.store(true, Ordering::Release);
        });

        for stage in 1..STAGES {
            let cycler = &cycler;
            let done = &done;
            let observed = Arc::clone(&observed);
            scope.spawn(move || {
                let reader = StageThread::new(format!("reader-{stage}"), stage);
                while !done.load(Ordering::Acquire) {
                    assert_eq!(*cycler.read(&reader), 7, "stage {stage} saw a stage-0 write");
                    assert_eq!(*cycler.read_locked(&reader), 7);
                    observed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        writer.join().unwrap();
    });

    let app = StageThread::new("app", 0);
    assert_eq!(*cycler.read(&app), 2_099);
    println!("isolation: {} reads checked", observed.load(Ordering::Relaxed));

    pipeline.cycle();
    let cull = StageThread::new("cull", 1);
    assert_eq!(*cycler.read(&cull), 2_099);
}

#[test]
fn stress_interrupted_writes_commit_nothing() {
    let pipeline = Pipeline::new("interrupted", STAGES);
    let cycler: LedgerCycler = Cycler::new(Ledger { left: TOTAL, right: 0 }, Some(&pipeline));
    let done = AtomicBool::new(false);
    let interrupted = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4u64)
            .map(|seed| {
                let cycler = &cycler;
                let interrupted = &interrupted;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(100 + seed);
                    let thread = StageThread::new(format!("writer-{seed}"), 0);
                    for _ in 0..500 {
                        let stage = rng.gen_range(0..STAGES);
                        let force = rng.gen_bool(0.5);
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            let mut writer = cycler.write_stage_upstream(stage, force, &thread);
                            let amount = writer.left.min(400);
                            writer.left -= amount;
                            if amount > 0 && rng.gen_bool(0.3) {
                                panic::resume_unwind(Box::new("ledger update interrupted"));
                            }
                            writer.right += amount;
                            if writer.left == 0 {
                                let ledger = &mut *writer;
                                std::mem::swap(&mut ledger.left, &mut ledger.right);
                            }
                        }));
                        if outcome.is_err() {
                            interrupted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let driver = scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                pipeline.cycle();
                std::thread::yield_now();
            }
        });

        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Release);
        driver.join().unwrap();
    });

    assert!(interrupted.load(Ordering::Relaxed) > 0);
    assert!(cycler.outstanding().is_idle());
    let observer = StageThread::new("observer", 0);
    for stage in 0..STAGES {
        let ledger = cycler.read_stage(stage, &observer);
        assert!(ledger.balanced(), "stage {stage} kept a half-written ledger: {:?}", *ledger);
    }
}

#[test]
fn stress_stage_sweeps_are_atomic() {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 300;

    let pipeline = Pipeline::new("sweeps", STAGES);
    let cycler: Cycler<u64, ThreadedArbiter<u64>> = Cycler::new(0, Some(&pipeline));
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let sweepers: Vec<_> = (0..THREADS)
            .map(|seed| {
                let cycler = &cycler;
                scope.spawn(move || {
                    let thread = StageThread::new(format!("sweeper-{seed}"), 0);
                    for _ in 0..ROUNDS {
                        let mut seen = Vec::with_capacity(STAGES);
                        cycler.for_each_stage(&thread, |_, count| {
                            seen.push(*count);
                            std::thread::yield_now();
                            *count += 1;
                        });
                        assert_eq!(seen.len(), STAGES);
                        assert!(
                            seen.windows(2).all(|pair| pair[0] == pair[1]),
                            "a cycle ran inside a sweep: {seen:?}"
                        );
                    }
                })
            })
            .collect();

        let driver = scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                pipeline.cycle();
                std::thread::yield_now();
            }
        });

        for sweeper in sweepers {
            sweeper.join().unwrap();
        }
        done.store(true, Ordering::Release);
        driver.join().unwrap();
    });

    let observer = StageThread::new("observer", 0);
    for stage in 0..STAGES {
        assert_eq!(*cycler.read_stage(stage, &observer), THREADS * ROUNDS);
    }
    assert!(cycler.outstanding().is_idle());
}
