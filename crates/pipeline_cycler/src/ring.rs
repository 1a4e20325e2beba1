//! # Stage Ring
//!
//! One committed snapshot per pipeline stage. Slot 0 holds the newest value;
//! slot `n` holds the value stage `n` is allowed to see this frame.
//!
//! ```text
//!            write (stage 0)
//!                 │
//!                 ▼
//!   ┌────────┬────────┬────────┐
//!   │ slot 0 │ slot 1 │ slot 2 │     cycle(): slot[i] ← slot[i-1]
//!   └────────┴────────┴────────┘
//!        └──────►└──────►
//! ```
//!
//! Slots hold `Arc` snapshots. Seeding and cycling share one allocation
//! between slots; a write builds a new snapshot and swaps it in, so a view
//! taken before the swap stays valid and unchanged for as long as it is held.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::stage::MAX_STAGES;

/// Fixed-size ring of per-stage snapshots.
pub struct StageRing<T> {
    slots: Box<[ArcSwap<T>]>,
}

impl<T> StageRing<T> {
    /// Creates a ring with `num_stages` slots, all seeded from `initial`.
    ///
    /// # Panics
    ///
    /// Panics if `num_stages` is zero or larger than [`MAX_STAGES`].
    #[must_use]
    pub fn new(initial: T, num_stages: usize) -> Self {
        assert!(
            (1..=MAX_STAGES).contains(&num_stages),
            "stage ring needs 1..={MAX_STAGES} slots, got {num_stages}"
        );
        let seed = Arc::new(initial);
        let slots: Vec<ArcSwap<T>> = (0..num_stages)
            .map(|_| ArcSwap::new(Arc::clone(&seed)))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring has at least one slot.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Loads the committed snapshot of `stage`. Never blocks.
    #[inline]
    #[must_use]
    pub fn load(&self, stage: usize) -> Arc<T> {
        self.slots[stage].load_full()
    }

    /// Raw address of the committed snapshot of `stage`.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self, stage: usize) -> *const T {
        Arc::as_ptr(&self.slots[stage].load())
    }

    /// Replaces the committed snapshot of `stage`.
    #[inline]
    pub fn store(&self, stage: usize, value: Arc<T>) {
        self.slots[stage].store(value);
    }

    /// Whether two slots currently share one snapshot.
    #[must_use]
    pub fn shares(&self, a: usize, b: usize) -> bool {
        Arc::ptr_eq(&self.slots[a].load(), &self.slots[b].load())
    }

    /// Whether every slot holds the same snapshot.
    #[must_use]
    pub fn is_uniform(&self) -> bool {
        (1..self.slots.len()).all(|stage| self.shares(0, stage))
    }

    /// Advances the ring one stage: each slot takes its predecessor's
    /// snapshot, oldest first.
    ///
    /// Callers must hold every slot in `1..len` free of writers.
    pub fn advance(&self) {
        for stage in (1..self.slots.len()).rev() {
            let newer = self.slots[stage - 1].load_full();
            self.slots[stage].store(newer);
        }
    }
}
