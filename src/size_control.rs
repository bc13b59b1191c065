//! [`SizeControl`] is the size-tracking boundary of a striped hash table.

use std::fmt::{self, Debug};
use std::ops::Range;

use super::resize::{Directive, ResizeCoordinator};
use super::tally::Tally;

/// Approximate size tracking and resize arbitration behind one boundary.
///
/// [`SizeControl`] owns a [`Tally`] and a [`ResizeCoordinator`] and exposes the three calls the
/// enclosing table structure needs: [`record_delta`](Self::record_delta) after every structural
/// mutation, [`approximate_size`](Self::approximate_size) for the public element-count accessor,
/// and [`maybe_resize`](Self::maybe_resize), which aggregates a fresh total and feeds it to the
/// coordinator. The table implements the actual per-bucket migration and reports back through
/// [`claim_range`](Self::claim_range), [`depart`](Self::depart) and [`finish`](Self::finish).
///
/// ### Examples
///
/// ```
/// use tally::{Directive, SizeControl};
///
/// let control = SizeControl::new();
///
/// for _ in 0..48 {
///     control.record_delta(1);
/// }
/// assert_eq!(control.approximate_size(), 48);
///
/// // 48 entries meet the default 3/4 threshold of a 64-slot table.
/// match control.maybe_resize(64) {
///     Directive::BecomeResizer => {
///         while let Some(range) = control.claim_range() {
///             // Migrate the buckets in `range`.
///             let _ = range;
///         }
///         if control.depart(64) {
///             control.finish(128);
///         }
///     }
///     Directive::AssistResizer | Directive::None => unreachable!(),
/// }
/// ```
pub struct SizeControl {
    tally: Tally,
    coordinator: ResizeCoordinator,
}

impl SizeControl {
    /// Creates a [`SizeControl`] with default counter and coordinator settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            tally: Tally::new(),
            coordinator: ResizeCoordinator::new(),
        }
    }

    /// Creates a [`SizeControl`] from preconfigured components.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::{ResizeCoordinator, SizeControl, Tally};
    ///
    /// let control = SizeControl::from_parts(
    ///     Tally::with_ceiling(8),
    ///     ResizeCoordinator::with_threshold_ratio(7, 8),
    /// );
    /// control.record_delta(1);
    /// assert_eq!(control.approximate_size(), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn from_parts(tally: Tally, coordinator: ResizeCoordinator) -> Self {
        Self { tally, coordinator }
    }

    /// Records a signed size delta after a structural mutation of the table.
    #[inline]
    pub fn record_delta(&self, delta: i64) {
        self.tally.add(delta);
    }

    /// Returns the approximate number of entries, clamped at zero.
    #[inline]
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.tally.count()
    }

    /// Aggregates a fresh total and asks the coordinator whether the caller should resize.
    #[inline]
    pub fn maybe_resize(&self, observed_capacity: usize) -> Directive {
        self.coordinator
            .maybe_resize(self.tally.sum(), observed_capacity)
    }

    /// Claims a disjoint range of old-table indices to migrate.
    #[inline]
    pub fn claim_range(&self) -> Option<Range<usize>> {
        self.coordinator.claim_range()
    }

    /// Departs from the resize generation stamped for the supplied capacity.
    ///
    /// Returns `true` if the caller is the last participant and must publish the new table and
    /// then call [`finish`](Self::finish).
    #[inline]
    #[must_use]
    pub fn depart(&self, capacity: usize) -> bool {
        self.coordinator.depart(capacity)
    }

    /// Completes the resize generation with the new capacity.
    #[inline]
    pub fn finish(&self, new_capacity: usize) {
        self.coordinator.finish(new_capacity);
    }

    /// Returns a reference to the underlying [`Tally`].
    #[inline]
    #[must_use]
    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    /// Returns a reference to the underlying [`ResizeCoordinator`].
    #[inline]
    #[must_use]
    pub fn coordinator(&self) -> &ResizeCoordinator {
        &self.coordinator
    }
}

impl Debug for SizeControl {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeControl")
            .field("tally", &self.tally)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl Default for SizeControl {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
