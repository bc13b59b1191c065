use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use sdd::{AtomicShared, Guard, Tag};

/// [`CounterCell`] is a single atomically updatable counter slot.
///
/// A cell occupies a full cache line so that two threads updating adjacent cells never
/// invalidate each other's cache line.
#[repr(align(64))]
pub(crate) struct CounterCell {
    value: AtomicI64,
}

/// [`CellArray`] is a power-of-two array of lazily allocated [`CounterCell`] slots.
///
/// The array is immutable once published: growth allocates a longer array, copies the cell
/// *references* so that threads still targeting a cell through a superseded array keep
/// accumulating into it, and replaces the published reference wholesale. The superseded array is
/// reclaimed once no thread holds a reference to it.
pub(crate) struct CellArray {
    cells: Box<[AtomicShared<CounterCell>]>,
    generation: usize,
}

impl CounterCell {
    /// Creates a [`CounterCell`] holding the supplied value.
    #[inline]
    pub(crate) fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
        }
    }

    /// Returns the current value of the cell.
    #[inline]
    pub(crate) fn value(&self) -> i64 {
        self.value.load(Acquire)
    }

    /// Tries to add `delta` to the cell with a bounded number of CAS attempts.
    ///
    /// Returns `false` if every attempt lost to a concurrent update.
    #[inline]
    pub(crate) fn try_add(&self, delta: i64, attempts: usize) -> bool {
        let mut current = self.value.load(Relaxed);
        for _ in 0..attempts {
            match self
                .value
                .compare_exchange(current, current.wrapping_add(delta), AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

impl CellArray {
    /// Creates an empty [`CellArray`] of the supplied length.
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            cells: (0..len).map(|_| AtomicShared::null()).collect(),
            generation: 0,
        }
    }

    /// Creates the [`CellArray`] superseding `old_array`.
    ///
    /// Existing cell references are carried over so that no in-flight update is lost. The copy
    /// is a snapshot: the caller must exclude slot installation in `old_array` while it runs,
    /// which the tag on the published table reference provides.
    pub(crate) fn next_generation(old_array: &CellArray, len: usize, guard: &Guard) -> Self {
        debug_assert!(len.is_power_of_two());
        debug_assert!(len >= old_array.len());
        let cells: Box<[AtomicShared<CounterCell>]> = (0..len)
            .map(|index| {
                let slot = AtomicShared::null();
                if index < old_array.len() {
                    if let Some(cell) = old_array.cells[index].get_shared(Relaxed, guard) {
                        slot.swap((Some(cell), Tag::None), Relaxed);
                    }
                }
                slot
            })
            .collect();
        Self {
            cells,
            generation: old_array.generation + 1,
        }
    }

    /// Returns the number of cell slots.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns the number of times the array has been replaced since the first allocation.
    #[inline]
    pub(crate) fn generation(&self) -> usize {
        self.generation
    }

    /// Returns the slot the supplied probe value maps to.
    #[inline]
    pub(crate) fn slot(&self, probe: usize) -> &AtomicShared<CounterCell> {
        &self.cells[probe & (self.cells.len() - 1)]
    }

    /// Sums every currently allocated cell.
    #[inline]
    pub(crate) fn sum(&self, guard: &Guard) -> i64 {
        self.cells.iter().fold(0_i64, |total, slot| {
            slot.load(Acquire, guard)
                .as_ref()
                .map_or(total, |cell| total.wrapping_add(cell.value()))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use sdd::Shared;

    #[test]
    fn cell_bounded_cas() {
        let cell = CounterCell::new(3);
        assert!(cell.try_add(4, 1));
        assert_eq!(cell.value(), 7);
        assert!(cell.try_add(-7, 4));
        assert_eq!(cell.value(), 0);
    }

    #[test]
    fn generation_carries_cells() {
        let guard = Guard::new();
        let old_array = CellArray::new(2);
        old_array
            .slot(1)
            .swap((Some(Shared::new(CounterCell::new(11))), Tag::None), Relaxed);

        let new_array = CellArray::next_generation(&old_array, 4, &guard);
        assert_eq!(new_array.len(), 4);
        assert_eq!(new_array.generation(), 1);
        assert_eq!(new_array.sum(&guard), 11);

        // The reference is shared, not the value: updates through either array are visible to
        // both.
        if let Some(cell) = old_array.slot(1).load(Acquire, &guard).as_ref() {
            assert!(cell.try_add(1, 1));
        }
        assert_eq!(new_array.sum(&guard), 12);
    }
}
