//! Lane-based priority bitset.
//!
//! A lane is one bit in a 31-bit set; lower bit position means higher
//! priority. Lanes are partitioned into bands: sync, input-continuous,
//! default, a rotating pool of transition lanes, retry lanes, and idle.
//! Batches of lanes travel together through a render pass, so most
//! operations work on whole sets rather than single bits.

use std::fmt;

pub type LaneBits = u32;

/// A set of priority lanes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Lanes(pub(crate) LaneBits);

pub const TOTAL_LANES: u32 = 31;

const SYNC_BITS: LaneBits = 0b0000_0000_0000_0000_0000_0000_0000_0001;
const INPUT_CONTINUOUS_BITS: LaneBits = 0b0000_0000_0000_0000_0000_0000_0000_0010;
const DEFAULT_BITS: LaneBits = 0b0000_0000_0000_0000_0000_0000_0000_0100;
const TRANSITION_BITS: LaneBits = 0b0000_0000_0000_0111_1111_1111_1111_1000;
const RETRY_BITS: LaneBits = 0b0000_1111_1000_0000_0000_0000_0000_0000;
const IDLE_BITS: LaneBits = 0b0100_0000_0000_0000_0000_0000_0000_0000;
const NON_IDLE_BITS: LaneBits = 0b0011_1111_1111_1111_1111_1111_1111_1111;

const FIRST_TRANSITION: LaneBits = 1 << 3;

impl Lanes {
    pub const NONE: Lanes = Lanes(0);
    pub const SYNC: Lanes = Lanes(SYNC_BITS);
    pub const INPUT_CONTINUOUS: Lanes = Lanes(INPUT_CONTINUOUS_BITS);
    pub const DEFAULT: Lanes = Lanes(DEFAULT_BITS);
    pub const TRANSITION: Lanes = Lanes(TRANSITION_BITS);
    pub const RETRY: Lanes = Lanes(RETRY_BITS);
    pub const IDLE: Lanes = Lanes(IDLE_BITS);
    pub const ALL: Lanes = Lanes(NON_IDLE_BITS | IDLE_BITS);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn merge(self, other: Lanes) -> Lanes {
        Lanes(self.0 | other.0)
    }

    pub fn remove(self, other: Lanes) -> Lanes {
        Lanes(self.0 & !other.0)
    }

    pub fn intersect(self, other: Lanes) -> Lanes {
        Lanes(self.0 & other.0)
    }

    /// True when every lane of `subset` is also in `self`.
    pub fn contains(self, subset: Lanes) -> bool {
        (self.0 & subset.0) == subset.0
    }

    pub fn intersects(self, other: Lanes) -> bool {
        (self.0 & other.0) != 0
    }

    /// The single highest-priority lane in the set (lowest set bit).
    pub fn highest_priority(self) -> Lanes {
        Lanes(isolate_lowest_set_bit(self.0))
    }

    /// True when some lane outside the idle band is pending.
    pub fn has_non_idle(self) -> bool {
        (self.0 & NON_IDLE_BITS) != 0
    }

    pub fn includes_sync(self) -> bool {
        (self.0 & SYNC_BITS) != 0
    }

    /// Iterate the individual lanes of the set, highest priority first.
    pub fn iter(self) -> LaneIter {
        LaneIter(self.0)
    }

    /// Index of the highest-priority lane, for table lookups.
    pub fn highest_index(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    pub fn bits(self) -> LaneBits {
        self.0
    }
}

/// Isolates the lowest set bit of `bits`.
///
/// Equivalent to `bits & -bits` under two's-complement arithmetic; Rust's
/// unsigned integers lack unary minus, so the wrapping negation spells the
/// same trick portably.
#[inline]
pub fn isolate_lowest_set_bit(bits: LaneBits) -> LaneBits {
    bits & bits.wrapping_neg()
}

pub struct LaneIter(LaneBits);

impl Iterator for LaneIter {
    type Item = Lanes;

    fn next(&mut self) -> Option<Lanes> {
        if self.0 == 0 {
            return None;
        }
        let bit = isolate_lowest_set_bit(self.0);
        self.0 &= !bit;
        Some(Lanes(bit))
    }
}

impl fmt::Debug for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lanes({:#034b})", self.0)
    }
}

/// How far a lane may sit pending before the starvation guard promotes it,
/// in host-clock milliseconds.
fn expiration_delay(lane: Lanes) -> u64 {
    let bits = lane.0;
    if bits & (SYNC_BITS | INPUT_CONTINUOUS_BITS) != 0 {
        250
    } else if bits & DEFAULT_BITS != 0 {
        5_000
    } else if bits & TRANSITION_BITS != 0 {
        5_000
    } else {
        // Retry and idle lanes never expire; they wait for quiet time.
        u64::MAX
    }
}

/// Per-root lane bookkeeping: what is pending, what is suspended, and which
/// pending lanes have waited long enough to be forced into the next batch.
#[derive(Default)]
pub struct LaneState {
    pub pending: Lanes,
    pub suspended: Lanes,
    pub pinged: Lanes,
    pub expired: Lanes,
    expiration_times: [Option<u64>; TOTAL_LANES as usize],
    next_transition: LaneBits,
}

impl LaneState {
    pub fn new() -> Self {
        Self {
            next_transition: FIRST_TRANSITION,
            ..Self::default()
        }
    }

    pub fn mark_pending(&mut self, lane: Lanes) {
        self.pending = self.pending.merge(lane);
        // A fresh update un-suspends the lane it arrives on.
        self.suspended = self.suspended.remove(lane);
    }

    /// Claims the next lane from the transition pool, round robin, so
    /// unrelated concurrent transitions land on distinct bits.
    pub fn claim_transition_lane(&mut self) -> Lanes {
        let lane = self.next_transition;
        let shifted = lane << 1;
        self.next_transition = if shifted & TRANSITION_BITS == 0 {
            FIRST_TRANSITION
        } else {
            shifted
        };
        Lanes(lane)
    }

    /// Stamps expiration times for newly pending lanes and promotes any lane
    /// past its deadline to the expired set. Expired lanes are force-included
    /// in the next batch even when higher-priority lanes are also pending.
    pub fn mark_starved(&mut self, now: u64) {
        let mut lanes = self.pending.remove(self.suspended.remove(self.pinged));
        while let Some(index) = lanes.highest_index() {
            let lane = Lanes(1 << index);
            lanes = lanes.remove(lane);
            match self.expiration_times[index as usize] {
                None => {
                    let delay = expiration_delay(lane);
                    if delay != u64::MAX {
                        self.expiration_times[index as usize] = Some(now.saturating_add(delay));
                    }
                }
                Some(deadline) => {
                    if deadline <= now {
                        log::warn!("lane {index} starved past its deadline, forcing into batch");
                        self.expired = self.expired.merge(lane);
                    }
                }
            }
        }
    }

    /// Computes the next batch of lanes to work on: the band of equal-or-
    /// higher priority lanes around the highest-priority pending lane,
    /// preferring non-idle work unconditionally over idle work.
    pub fn next_lanes(&self) -> Lanes {
        let pending = self.pending;
        if pending.is_none() {
            return Lanes::NONE;
        }
        let unblocked = pending.remove(self.suspended.remove(self.pinged));
        let candidates = if unblocked.has_non_idle() {
            Lanes(unblocked.0 & NON_IDLE_BITS)
        } else if !unblocked.is_none() {
            unblocked
        } else {
            return Lanes::NONE;
        };
        let highest = candidates.highest_priority();
        // Everything at the same or higher priority position rides along.
        let mask = (highest.0 << 1).wrapping_sub(1);
        let mut batch = Lanes(candidates.0 & mask);
        if !self.expired.is_none() {
            batch = batch.merge(self.expired.intersect(pending));
        }
        batch
    }

    /// Clears bookkeeping for lanes that just finished a commit.
    pub fn mark_committed(&mut self, lanes: Lanes) {
        self.pending = self.pending.remove(lanes);
        self.suspended = self.suspended.remove(lanes);
        self.pinged = self.pinged.remove(lanes);
        self.expired = self.expired.remove(lanes);
        let mut cleared = lanes;
        while let Some(index) = cleared.highest_index() {
            cleared = cleared.remove(Lanes(1 << index));
            self.expiration_times[index as usize] = None;
        }
    }

    pub fn has_expired_work(&self) -> bool {
        !self.expired.is_none()
    }
}
