//! Wrap-aware comparison of avatar data sequence numbers
//!
//! Clients stamp every avatar data packet with a `u16` that increments per
//! frame and wraps. A sequence is newer than another when it lies within half
//! of the sequence space ahead of it.

pub type SequenceNumber = u16;

const HALF_RANGE: u16 = 32768;

/// Returns whether `s1` is newer than `s2`
/// sequence_greater_than(2, 1) == true
/// sequence_greater_than(1, 2) == false
/// sequence_greater_than(1, 1) == false
pub fn sequence_greater_than(s1: SequenceNumber, s2: SequenceNumber) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// Number of sequence steps from `from` forward to `to`
pub fn sequence_gap(from: SequenceNumber, to: SequenceNumber) -> u16 {
    to.wrapping_sub(from)
}
