//! [`Tally`] is a scalable concurrent counter.

pub(crate) mod cell_array;

use std::cell::Cell;
use std::fmt::{self, Debug};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicI64, AtomicU32};
use std::sync::OnceLock;

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use self::cell_array::{CellArray, CounterCell};
use super::exit_guard::ExitGuard;

/// Scalable concurrent counter.
///
/// [`Tally`] records signed size deltas from many threads without funneling them through a
/// single memory location. A lone base counter serves as the fast path while no contention has
/// been observed; once a CAS on it fails, updates spread over a lazily allocated table of
/// cache-line-padded counter cells. The table doubles under persistent contention up to a fixed
/// concurrency ceiling and is replaced wholesale on each growth, never mutated in place.
///
/// [`Tally::sum`] is exact whenever no mutation is in flight and otherwise reflects some subset
/// of the in-flight updates; it is not linearizable with respect to concurrent updates.
///
/// ### Examples
///
/// ```
/// use tally::Tally;
///
/// let tally = Tally::new();
///
/// tally.add(1);
/// tally.add(1);
/// tally.add(-1);
///
/// assert_eq!(tally.sum(), 1);
/// assert_eq!(tally.count(), 1);
/// ```
pub struct Tally {
    /// The count accumulated while contention is absent.
    base: AtomicI64,
    /// The lazily allocated cell table; the tag on the pointer serves as the growth mutex.
    cells: AtomicShared<CellArray>,
    /// The maximum cell table length.
    ceiling: usize,
}

/// The number of CAS attempts on a single cell before the probe is rehashed.
const CELL_ATTEMPTS: usize = 4;

/// The length of the first allocated cell table.
const INITIAL_CELLS: usize = 2;

/// The largest allowed concurrency ceiling.
const MAX_CEILING: usize = 1_usize << (usize::BITS - 2);

thread_local! {
    /// The thread-sticky probe value selecting a counter cell; `0` means uninitialized.
    static PROBE: Cell<u32> = const { Cell::new(0) };
}

impl Tally {
    /// Creates a [`Tally`] with the concurrency ceiling set to the number of available hardware
    /// threads.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::Tally;
    ///
    /// let tally = Tally::new();
    /// assert_eq!(tally.sum(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_ceiling(default_ceiling())
    }

    /// Creates a [`Tally`] with the supplied concurrency ceiling.
    ///
    /// The ceiling bounds the cell table length and is rounded up to a power of two; contention
    /// beyond it is absorbed by retrying instead of further growth.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::Tally;
    ///
    /// let tally = Tally::with_ceiling(4);
    /// tally.add(1);
    /// assert_eq!(tally.count(), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            base: AtomicI64::new(0),
            cells: AtomicShared::null(),
            ceiling: ceiling.clamp(1, MAX_CEILING).next_power_of_two(),
        }
    }

    /// Records a signed delta.
    ///
    /// The fast path is a single CAS on the base counter, only attempted while the cell table is
    /// unallocated; once contention has materialized the base counter is assumed busy and the
    /// update goes straight to a cell.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::Tally;
    ///
    /// let tally = Tally::new();
    /// tally.add(2);
    /// tally.add(-3);
    /// assert_eq!(tally.sum(), -1);
    /// ```
    #[inline]
    pub fn add(&self, delta: i64) {
        if self.cells.is_null(Acquire) {
            let current = self.base.load(Relaxed);
            if self
                .base
                .compare_exchange(current, current.wrapping_add(delta), AcqRel, Relaxed)
                .is_ok()
            {
                return;
            }
        }
        self.add_slow(delta);
    }

    /// Returns the aggregated total at the instant of the call.
    ///
    /// The result equals the true count when no mutation is in flight. Under concurrent mutation
    /// it is a valid snapshot reflecting some subset of the in-flight updates: a decrement can be
    /// visible before an earlier increment that landed in a different cell.
    #[inline]
    #[must_use]
    pub fn sum(&self) -> i64 {
        let guard = Guard::new();
        let mut total = self.base.load(Acquire);
        if let Some(cell_array) = self.cells.load(Acquire, &guard).as_ref() {
            total = total.wrapping_add(cell_array.sum(&guard));
        }
        total
    }

    /// Returns the aggregated total clamped to `usize`.
    ///
    /// Transiently negative snapshots clamp to zero.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::Tally;
    ///
    /// let tally = Tally::new();
    /// tally.add(-1);
    /// assert_eq!(tally.count(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        let sum = self.sum();
        if sum <= 0 {
            0
        } else {
            usize::try_from(sum).unwrap_or(usize::MAX)
        }
    }

    /// Returns the current cell table length, or `0` if the table is unallocated.
    pub(crate) fn cells_len(&self) -> usize {
        let guard = Guard::new();
        self.cells
            .load(Acquire, &guard)
            .as_ref()
            .map_or(0, CellArray::len)
    }

    /// Returns the number of times the cell table has been replaced.
    pub(crate) fn cells_generation(&self) -> usize {
        let guard = Guard::new();
        self.cells
            .load(Acquire, &guard)
            .as_ref()
            .map_or(0, CellArray::generation)
    }

    /// Records the delta in a counter cell, growing the cell table under persistent contention.
    fn add_slow(&self, delta: i64) {
        let guard = Guard::new();
        let mut probe = probe();
        let mut contended = false;
        loop {
            let cell_array_ptr = self.cells.load(Acquire, &guard);
            if let Some(cell_array) = cell_array_ptr.as_ref() {
                let slot = cell_array.slot(probe as usize);
                if let Some(cell) = slot.load(Acquire, &guard).as_ref() {
                    if cell.try_add(delta, CELL_ATTEMPTS) {
                        return;
                    }
                    if cell_array.len() >= self.ceiling
                        || self.cells.load(Relaxed, &guard) != cell_array_ptr
                    {
                        // At the ceiling, or the table has already been replaced: spread out.
                        contended = false;
                    } else if contended {
                        // Collisions persisted after a rehash: double the table and retry
                        // against whichever table is current afterwards.
                        self.try_grow(cell_array_ptr, &guard);
                        contended = false;
                        continue;
                    } else {
                        contended = true;
                    }
                    probe = rehash_probe(probe);
                } else if self.try_install(cell_array_ptr, probe, delta) {
                    return;
                }
            } else {
                if self.try_init(delta, probe) {
                    return;
                }
                // Lost the allocation race; the base counter may have become available again.
                let current = self.base.load(Relaxed);
                if self
                    .base
                    .compare_exchange(current, current.wrapping_add(delta), AcqRel, Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }

    /// Allocates the initial cell table with the delta folded into one cell.
    ///
    /// Returns `false` if another thread was already allocating the table.
    fn try_init(&self, delta: i64, probe: u32) -> bool {
        if !self.cells.update_tag_if(
            Tag::First,
            |ptr| ptr.is_null() && ptr.tag() == Tag::None,
            Relaxed,
            Relaxed,
        ) {
            return false;
        }
        let cell_array = CellArray::new(INITIAL_CELLS.min(self.ceiling));
        cell_array.slot(probe as usize).swap(
            (Some(Shared::new(CounterCell::new(delta))), Tag::None),
            Relaxed,
        );
        self.cells
            .swap((Some(Shared::new(cell_array)), Tag::None), Release);
        true
    }

    /// Installs a fresh cell holding `delta` into the unallocated slot the probe maps to.
    ///
    /// Installation takes the same tag that guards growth: growing copies a snapshot of every
    /// slot, so a cell installed behind an in-flight copy would vanish with the superseded
    /// array. Returns `false` if the tag was held, the table was replaced, or another thread
    /// claimed the slot; the caller re-reads the current table and retries.
    fn try_install(&self, current_ptr: Ptr<CellArray>, probe: u32, delta: i64) -> bool {
        debug_assert!(!current_ptr.is_null());
        if !self.cells.update_tag_if(
            Tag::First,
            |ptr| ptr == current_ptr && ptr.tag() == Tag::None,
            Acquire,
            Relaxed,
        ) {
            return false;
        }
        let installed = current_ptr.as_ref().map_or(false, |cell_array| {
            let slot = cell_array.slot(probe as usize);
            if slot.is_null(Relaxed) {
                slot.swap(
                    (Some(Shared::new(CounterCell::new(delta))), Tag::None),
                    Relaxed,
                );
                true
            } else {
                false
            }
        });
        // Release the tag.
        self.cells.update_tag_if(Tag::None, |_| true, Release, Relaxed);
        installed
    }

    /// Grows the cell table to double its current length, capped by the ceiling.
    ///
    /// Cell references are copied, not values, so that threads still updating a cell through the
    /// superseded array keep accumulating into it. The tag on the table pointer makes sure that
    /// only one thread allocates at a time and that no slot is installed mid-copy; losers simply
    /// retry against the current table.
    fn try_grow(&self, current_ptr: Ptr<CellArray>, guard: &Guard) {
        debug_assert!(!current_ptr.is_null());
        if !self.cells.update_tag_if(
            Tag::First,
            |ptr| ptr == current_ptr && ptr.tag() == Tag::None,
            Acquire,
            Relaxed,
        ) {
            // Another thread is growing the table, or it has already been replaced.
            return;
        }

        let allocated: Option<Shared<CellArray>> = None;
        let mut growth_guard = ExitGuard::new(allocated, |allocated| {
            if let Some(new_array) = allocated.take() {
                self.cells.swap((Some(new_array), Tag::None), Release);
            } else {
                // Release the tag.
                self.cells.update_tag_if(Tag::None, |_| true, Release, Relaxed);
            }
        });
        if let Some(current) = current_ptr.as_ref() {
            let new_len = (current.len() * 2).min(self.ceiling);
            growth_guard.captured_mut().replace(Shared::new(
                CellArray::next_generation(current, new_len, guard),
            ));
        }
    }
}

impl Debug for Tally {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tally")
            .field("sum", &self.sum())
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

impl Default for Tally {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Tally {
    /// Compares the aggregated totals of two instances.
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.sum() == other.sum()
    }
}

/// Returns the default concurrency ceiling.
fn default_ceiling() -> usize {
    static CEILING: OnceLock<usize> = OnceLock::new();
    *CEILING.get_or_init(|| {
        std::thread::available_parallelism()
            .map_or(1, usize::from)
            .next_power_of_two()
    })
}

/// Returns the calling thread's probe value, initializing it on first use.
fn probe() -> u32 {
    PROBE.with(|probe| {
        let mut current = probe.get();
        if current == 0 {
            static SEED: AtomicU32 = AtomicU32::new(0);
            current = SEED
                .fetch_add(1, Relaxed)
                .wrapping_add(1)
                .wrapping_mul(0x9E37_79B9);
            if current == 0 {
                current = 0x9E37_79B9;
            }
            probe.set(current);
        }
        current
    })
}

/// Rehashes the probe value after repeated collisions and makes it sticky again.
fn rehash_probe(mut probe: u32) -> u32 {
    probe ^= probe << 13;
    probe ^= probe >> 17;
    probe ^= probe << 5;
    if probe == 0 {
        probe = 0x9E37_79B9;
    }
    PROBE.with(|sticky| sticky.set(probe));
    probe
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn install_stands_down_while_growth_holds_the_tag() {
        let tally = Tally::with_ceiling(8);
        let guard = Guard::new();
        assert!(tally.try_init(1, 1));
        let cell_array_ptr = tally.cells.load(Acquire, &guard);

        // A grower holds the tag while it copies the table; a cell installed during the copy
        // would be dropped with the superseded array, so installation must stand down.
        assert!(tally
            .cells
            .update_tag_if(Tag::First, |_| true, Relaxed, Relaxed));
        assert!(!tally.try_install(cell_array_ptr, 0, 7));
        assert_eq!(tally.sum(), 1);

        // Once the tag is released the slot is claimable again.
        assert!(tally
            .cells
            .update_tag_if(Tag::None, |_| true, Relaxed, Relaxed));
        assert!(tally.try_install(cell_array_ptr, 0, 7));
        assert_eq!(tally.sum(), 8);
    }

    #[test]
    fn install_stands_down_once_the_table_is_replaced() {
        let tally = Tally::with_ceiling(8);
        let guard = Guard::new();
        assert!(tally.try_init(1, 1));
        let stale_ptr = tally.cells.load(Acquire, &guard);
        tally.try_grow(stale_ptr, &guard);
        assert_eq!(tally.cells_len(), 4);

        // An install routed through a superseded snapshot is refused; the caller re-reads the
        // current table and retries, so no delta can land in a retired array.
        assert!(!tally.try_install(stale_ptr, 0, 7));
        assert_eq!(tally.sum(), 1);
    }
}
