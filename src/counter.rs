//! Sharded element counter.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicIsize, AtomicUsize};
use std::thread;

/// [`Counter`] tracks an approximate element count across threads.
///
/// Updates go to a per-thread cell to avoid contending on a single atomic;
/// the total is only materialized when [`Counter::sum`] is called. The sum is
/// monotonically consistent with completed updates but can be stale relative
/// to racing ones.
pub(crate) struct Counter {
    cells: Box<[Cell]>,
}

/// A single counter cell, aligned to a cache line to prevent false sharing.
#[repr(align(64))]
struct Cell(AtomicIsize);

/// Monotonically increasing source of per-thread cell indices.
static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_INDEX: usize = NEXT_THREAD_INDEX.fetch_add(1, Relaxed);
}

impl Counter {
    /// Creates a [`Counter`] with one cell per unit of available parallelism,
    /// rounded up to a power of two.
    pub(crate) fn new() -> Self {
        let num_cells = thread::available_parallelism()
            .map_or(4, usize::from)
            .next_power_of_two();
        Self {
            cells: (0..num_cells).map(|_| Cell(AtomicIsize::new(0))).collect(),
        }
    }

    /// Adds `delta` to the calling thread's cell.
    #[inline]
    pub(crate) fn add(&self, delta: isize) {
        let index = THREAD_INDEX.with(|index| *index) & (self.cells.len() - 1);
        self.cells[index].0.fetch_add(delta, Relaxed);
    }

    /// Returns the current total, clamped at zero.
    ///
    /// Cells are read one by one without synchronization, so the result can
    /// miss updates that race with the traversal.
    #[inline]
    pub(crate) fn sum(&self) -> usize {
        let total: isize = self.cells.iter().map(|cell| cell.0.load(Relaxed)).sum();
        usize::try_from(total).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::Counter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sum_after_quiescence() {
        let counter = Arc::new(Counter::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..4096 {
                        counter.add(1);
                    }
                    for _ in 0..1024 {
                        counter.add(-1);
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| {
            assert!(t.join().is_ok());
        });
        assert_eq!(counter.sum(), 8 * (4096 - 1024));
    }

    #[test]
    fn negative_total_clamped() {
        let counter = Counter::new();
        counter.add(-3);
        assert_eq!(counter.sum(), 0);
        counter.add(5);
        assert_eq!(counter.sum(), 2);
    }
}
