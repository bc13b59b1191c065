//! [`ResizeCoordinator`] arbitrates cooperative structural resizing.

use std::fmt::{self, Debug};
use std::ops::Range;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

/// The resizing instruction handed back to the caller.
///
/// Contention never surfaces as an error: every outcome of the protocol is one of these values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Directive {
    /// No resize is warranted, or the caller cannot participate in the one in progress.
    None,
    /// The caller initiated a new resize generation and is its first resizer.
    ///
    /// It must claim index ranges with [`ResizeCoordinator::claim_range`] until none remain and
    /// then call [`ResizeCoordinator::depart`].
    BecomeResizer,
    /// The caller joined the resize generation in progress as a helper.
    ///
    /// The obligations are the same as for [`Directive::BecomeResizer`].
    AssistResizer,
}

/// Cooperative resize arbitration over a single control word.
///
/// The control word encodes the state machine of a structural resize. When non-negative, no
/// resize is in progress and the value is the element count at which the next one should begin,
/// or zero if no sizing hint has been recorded. When negative, a resize generation is active: the
/// upper [`RESIZE_STAMP_BITS`] bits hold a stamp unique to the generation and the low bits hold
/// one plus the number of participating threads.
///
/// A second word, the transfer index, is the claim cursor: participants CAS it downwards to
/// claim disjoint index ranges of the old table, tail first. Every transition is a bounded CAS
/// attempt; a participant that loses one re-reads the state and decides again.
///
/// ### Examples
///
/// ```
/// use tally::{Directive, ResizeCoordinator};
///
/// let coordinator = ResizeCoordinator::new();
///
/// // 48 entries meet the default 3/4 threshold of a 64-slot table.
/// assert_eq!(coordinator.maybe_resize(48, 64), Directive::BecomeResizer);
/// while let Some(range) = coordinator.claim_range() {
///     // Migrate the buckets in `range` to the new table.
///     let _ = range;
/// }
/// if coordinator.depart(64) {
///     // The last participant publishes the new table and completes the generation.
///     coordinator.finish(128);
/// }
/// assert!(!coordinator.is_resizing());
/// ```
pub struct ResizeCoordinator {
    /// The resize control word.
    size_ctl: AtomicI64,
    /// The next old-table index (plus one) left to claim.
    transfer_index: AtomicI64,
    /// Resize trigger threshold ratio.
    threshold_numerator: usize,
    threshold_denominator: usize,
}

/// The number of bits used for the generation stamp.
const RESIZE_STAMP_BITS: u32 = 16;

/// The bit shift placing the stamp in the upper bits of the control word.
///
/// The stamp always has its top bit set, so a stamped control word is negative.
const RESIZE_STAMP_SHIFT: u32 = i64::BITS - RESIZE_STAMP_BITS;

/// The maximum number of threads allowed to participate in a single resize generation.
const MAX_HELPERS: i64 = (1_i64 << RESIZE_STAMP_BITS) - 1;

/// The number of old-table indices claimed per [`ResizeCoordinator::claim_range`] call.
const TRANSFER_STRIDE: i64 = 16;

/// The maximum capacity the coordinator grows towards.
pub(crate) const MAXIMUM_CAPACITY: usize = 1_usize << (usize::BITS - 2);

impl ResizeCoordinator {
    /// Creates a [`ResizeCoordinator`] with no sizing hint and the default 3/4 trigger
    /// threshold.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold_ratio(3, 4)
    }

    /// Creates a [`ResizeCoordinator`] with the supplied trigger threshold ratio.
    ///
    /// A resize is warranted once the aggregated element count reaches
    /// `capacity * numerator / denominator`. The ratio is clamped to `(0, 1]`.
    ///
    /// ### Examples
    ///
    /// ```
    /// use tally::{Directive, ResizeCoordinator};
    ///
    /// let coordinator = ResizeCoordinator::with_threshold_ratio(7, 8);
    /// assert_eq!(coordinator.maybe_resize(48, 64), Directive::None);
    /// assert_eq!(coordinator.maybe_resize(56, 64), Directive::BecomeResizer);
    /// ```
    #[must_use]
    pub fn with_threshold_ratio(numerator: usize, denominator: usize) -> Self {
        let denominator = denominator.max(1);
        Self {
            size_ctl: AtomicI64::new(0),
            transfer_index: AtomicI64::new(0),
            threshold_numerator: numerator.clamp(1, denominator),
            threshold_denominator: denominator,
        }
    }

    /// Creates a [`ResizeCoordinator`] with the trigger threshold for the supplied capacity
    /// already recorded as the sizing hint.
    #[must_use]
    pub fn with_capacity_hint(capacity: usize) -> Self {
        let coordinator = Self::new();
        coordinator
            .size_ctl
            .store(coordinator.threshold_for(capacity), Relaxed);
        coordinator
    }

    /// Returns the element count at which a table of the supplied capacity should grow.
    #[inline]
    #[must_use]
    pub fn threshold_for(&self, capacity: usize) -> i64 {
        let scaled = capacity as u128 * self.threshold_numerator as u128
            / self.threshold_denominator as u128;
        i64::try_from(scaled).unwrap_or(i64::MAX)
    }

    /// Interprets the aggregated element count against the observed capacity and decides whether
    /// the caller should resize.
    ///
    /// `capacity` is the length of the table the caller just operated on. The method never
    /// blocks; it loops only over CAS retries and always resolves to a [`Directive`]:
    ///
    /// - [`Directive::BecomeResizer`]: the caller CAS-stamped a fresh generation and is its
    ///   first participant; the claim cursor has been initialized to `capacity`.
    /// - [`Directive::AssistResizer`]: the caller joined the generation matching the stamp of
    ///   the observed capacity.
    /// - [`Directive::None`]: below the threshold, at the maximum capacity, or the active
    ///   generation is saturated, terminating, out of work, or stamped for a different capacity.
    pub fn maybe_resize(&self, num_entries: i64, capacity: usize) -> Directive {
        loop {
            let size_ctl = self.size_ctl.load(Acquire);
            if size_ctl >= 0 {
                // Idle; a positive value is the threshold recorded by the previous generation.
                let threshold = if size_ctl > 0 {
                    size_ctl
                } else {
                    self.threshold_for(capacity)
                };
                if num_entries < threshold || capacity == 0 || capacity >= MAXIMUM_CAPACITY {
                    return Directive::None;
                }
                let transitioning = (resize_stamp(capacity) << RESIZE_STAMP_SHIFT) + 2;
                debug_assert!(transitioning < 0);
                if self
                    .size_ctl
                    .compare_exchange(size_ctl, transitioning, AcqRel, Acquire)
                    .is_ok()
                {
                    // Expose the claim cursor only after the generation is stamped; helpers
                    // observing the stamp before this store see an exhausted cursor and stand
                    // down.
                    self.transfer_index.store(capacity as i64, Release);
                    return Directive::BecomeResizer;
                }
            } else {
                let stamp_bits = resize_stamp(capacity) << RESIZE_STAMP_SHIFT;
                if (size_ctl >> RESIZE_STAMP_SHIFT) != (stamp_bits >> RESIZE_STAMP_SHIFT) {
                    // The active generation was stamped for a different capacity.
                    return Directive::None;
                }
                if size_ctl == stamp_bits + 1
                    || size_ctl - stamp_bits > MAX_HELPERS
                    || self.transfer_index.load(Acquire) <= 0
                {
                    // Terminating, saturated, or nothing left to claim.
                    return Directive::None;
                }
                if self
                    .size_ctl
                    .compare_exchange(size_ctl, size_ctl + 1, AcqRel, Acquire)
                    .is_ok()
                {
                    return Directive::AssistResizer;
                }
            }
        }
    }

    /// Claims a disjoint range of old-table indices to migrate, tail first.
    ///
    /// Returns `None` once the whole table has been claimed; the participant must then
    /// [`depart`](Self::depart).
    pub fn claim_range(&self) -> Option<Range<usize>> {
        let mut next = self.transfer_index.load(Acquire);
        while next > 0 {
            let bound = (next - TRANSFER_STRIDE).max(0);
            match self
                .transfer_index
                .compare_exchange(next, bound, AcqRel, Acquire)
            {
                #[allow(clippy::cast_sign_loss)] // `0 <= bound < next` here.
                Ok(_) => return Some(bound as usize..next as usize),
                Err(actual) => next = actual,
            }
        }
        None
    }

    /// Departs from the resize generation stamped for the supplied capacity.
    ///
    /// Returns `true` for exactly one participant per generation: the last one to leave, which
    /// must publish the new table and then call [`finish`](Self::finish).
    #[must_use]
    pub fn depart(&self, capacity: usize) -> bool {
        let stamp_bits = resize_stamp(capacity) << RESIZE_STAMP_SHIFT;
        let mut size_ctl = self.size_ctl.load(Acquire);
        loop {
            debug_assert!(size_ctl < 0);
            match self
                .size_ctl
                .compare_exchange(size_ctl, size_ctl - 1, AcqRel, Acquire)
            {
                Ok(_) => return size_ctl - 2 == stamp_bits,
                Err(actual) => size_ctl = actual,
            }
        }
    }

    /// Completes the resize generation: returns to idle with the threshold for the new
    /// capacity recorded.
    ///
    /// Only the participant for which [`depart`](Self::depart) returned `true` may call this,
    /// after publishing the new table. The transition is a CAS out of the terminating state; a
    /// redundant call while idle leaves the recorded threshold untouched.
    pub fn finish(&self, new_capacity: usize) {
        let threshold = self.threshold_for(new_capacity);
        let mut size_ctl = self.size_ctl.load(Relaxed);
        while size_ctl < 0 {
            match self
                .size_ctl
                .compare_exchange(size_ctl, threshold, Release, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => size_ctl = actual,
            }
        }
    }

    /// Returns `true` if a resize generation is active.
    #[inline]
    #[must_use]
    pub fn is_resizing(&self) -> bool {
        self.size_ctl.load(Acquire) < 0
    }

    /// Returns the stamp of the active resize generation, or `None` when idle.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // The stamp occupies the upper 16 bits.
    pub fn generation(&self) -> Option<u32> {
        let size_ctl = self.size_ctl.load(Acquire);
        (size_ctl < 0).then(|| ((size_ctl as u64) >> RESIZE_STAMP_SHIFT) as u32)
    }
}

impl Debug for ResizeCoordinator {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizeCoordinator")
            .field("size_ctl", &self.size_ctl.load(Relaxed))
            .field("transfer_index", &self.transfer_index.load(Relaxed))
            .finish()
    }
}

impl Default for ResizeCoordinator {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the generation stamp for resizing a table of the supplied capacity.
///
/// Capacities are powers of two, so the leading-zero count identifies the capacity; the top
/// stamp bit is set so that the stamped control word is negative.
const fn resize_stamp(capacity: usize) -> i64 {
    (capacity.leading_zeros() | (1 << (RESIZE_STAMP_BITS - 1))) as i64
}
