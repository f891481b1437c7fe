use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A 32-bit sequence number (TCP byte sequence number, SCTP TSN, MPTCP data sequence number
///  truncated to 32 bits) in a modular number space.
///
/// There is deliberately no `Ord` / `PartialOrd`: comparison is only meaningful for values
///  less than 2^31 apart, and it is not transitive across the whole space. All comparisons go
///  through the explicit `is_before` / `is_after` family which interprets the difference as a
///  signed 32-bit value.
///
/// Ordered collections can not be keyed by `SeqNum` directly. They are keyed by an *unwrapped*
///  64-bit position instead (see [SeqNum::unwrap_near]), where the lower 32 bits of the
///  position are the sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    /// Offset added to the first anchor of an unwrapped position space, leaving room below it
    ///  for values that precede the anchor (e.g. D-SACK blocks below the cumulative ack)
    pub const UNWRAP_BASE: u64 = 1 << 32;

    pub const fn from_raw(value: u32) -> SeqNum {
        SeqNum(value)
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        *self + 1
    }

    pub fn prev(&self) -> SeqNum {
        *self - 1
    }

    fn diff(&self, other: SeqNum) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// number of steps from `earlier` to `self` - only meaningful if `earlier` is not after `self`
    pub fn distance_from(&self, earlier: SeqNum) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub fn is_before(&self, other: SeqNum) -> bool {
        self.diff(other) < 0
    }

    pub fn is_before_or_eq(&self, other: SeqNum) -> bool {
        self.diff(other) <= 0
    }

    pub fn is_after(&self, other: SeqNum) -> bool {
        self.diff(other) > 0
    }

    pub fn is_after_or_eq(&self, other: SeqNum) -> bool {
        self.diff(other) >= 0
    }

    /// `low <= self <= high`, both bounds inclusive
    pub fn is_between(&self, low: SeqNum, high: SeqNum) -> bool {
        self.is_after_or_eq(low) && self.is_before_or_eq(high)
    }

    pub fn max_seq(self, other: SeqNum) -> SeqNum {
        if self.is_before(other) { other } else { self }
    }

    pub fn min_seq(self, other: SeqNum) -> SeqNum {
        if self.is_after(other) { other } else { self }
    }

    /// Maps this sequence number to the 64-bit position closest to `anchor`. The lower 32 bits
    ///  of the result are always the raw sequence number.
    pub fn unwrap_near(&self, anchor: u64) -> u64 {
        let anchor_seq = SeqNum::from_abs(anchor);
        let delta = self.diff(anchor_seq) as i64;
        if delta < 0 {
            anchor.saturating_sub(delta.unsigned_abs())
        }
        else {
            anchor + delta as u64
        }
    }

    /// the sequence number of an unwrapped position, i.e. its lower 32 bits
    pub fn from_abs(abs: u64) -> SeqNum {
        SeqNum((abs & 0xffff_ffff) as u32)
    }

    /// the initial unwrapped position for a sequence number, to be used as the first anchor
    pub fn initial_abs(&self) -> u64 {
        Self::UNWRAP_BASE + self.0 as u64
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNum {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, false, true, false, true)]
    #[case::smaller(4, 5, true, true, false, false)]
    #[case::bigger(6, 5, false, false, true, true)]
    #[case::wrapped_bigger(2, u32::MAX - 2, false, false, true, true)]
    #[case::wrapped_smaller(u32::MAX - 2, 2, true, true, false, false)]
    #[case::almost_half(0x7fff_ffff, 0, false, false, true, true)]
    fn test_comparisons(
        #[case] a: u32,
        #[case] b: u32,
        #[case] before: bool,
        #[case] before_or_eq: bool,
        #[case] after: bool,
        #[case] after_or_eq: bool,
    ) {
        let a = SeqNum::from_raw(a);
        let b = SeqNum::from_raw(b);
        assert_eq!(a.is_before(b), before);
        assert_eq!(a.is_before_or_eq(b), before_or_eq);
        assert_eq!(a.is_after(b), after);
        assert_eq!(a.is_after_or_eq(b), after_or_eq);
    }

    #[rstest]
    #[case(5, 5, 10, true)]
    #[case(10, 5, 10, true)]
    #[case(4, 5, 10, false)]
    #[case(11, 5, 10, false)]
    #[case(1, u32::MAX - 1, 3, true)]
    #[case(u32::MAX, u32::MAX - 1, 3, true)]
    #[case(4, u32::MAX - 1, 3, false)]
    fn test_is_between(#[case] value: u32, #[case] low: u32, #[case] high: u32, #[case] expected: bool) {
        assert_eq!(SeqNum::from_raw(value).is_between(SeqNum::from_raw(low), SeqNum::from_raw(high)), expected);
    }

    #[test]
    fn test_arithmetic_wraps() {
        assert_eq!(SeqNum::from_raw(u32::MAX) + 1, SeqNum::ZERO);
        assert_eq!(SeqNum::ZERO - 1, SeqNum::from_raw(u32::MAX));
        assert_eq!(SeqNum::from_raw(3).distance_from(SeqNum::from_raw(u32::MAX - 1)), 5);
        assert_eq!(SeqNum::from_raw(u32::MAX).max_seq(SeqNum::from_raw(2)), SeqNum::from_raw(2));
        assert_eq!(SeqNum::from_raw(u32::MAX).min_seq(SeqNum::from_raw(2)), SeqNum::from_raw(u32::MAX));
    }

    #[rstest]
    #[case::same(100, 100, 0)]
    #[case::above(100, 150, 50)]
    #[case::below(100, 40, -60)]
    #[case::across_wrap_above(u32::MAX - 10, 20, 31)]
    #[case::across_wrap_below(20, u32::MAX - 10, -31)]
    fn test_unwrap_near(#[case] anchor_seq: u32, #[case] seq: u32, #[case] expected_delta: i64) {
        let anchor = SeqNum::from_raw(anchor_seq).initial_abs();
        let unwrapped = SeqNum::from_raw(seq).unwrap_near(anchor);
        assert_eq!(unwrapped as i64 - anchor as i64, expected_delta);
        assert_eq!(SeqNum::from_abs(unwrapped), SeqNum::from_raw(seq));
    }
}
