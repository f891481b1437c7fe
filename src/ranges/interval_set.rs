use crate::util::seq_num::SeqNum;
use anyhow::bail;
use std::fmt::{Debug, Formatter};
use tracing::{trace, warn};

/// A closed range `[start, end]` of sequence numbers
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Interval {
    pub start: SeqNum,
    pub end: SeqNum,
}

impl Debug for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

impl Interval {
    pub fn new(start: SeqNum, end: SeqNum) -> Interval {
        debug_assert!(start.is_before_or_eq(end), "interval [{}, {}] is inverted", start, end);
        Interval { start, end }
    }

    pub fn single(seq: SeqNum) -> Interval {
        Interval { start: seq, end: seq }
    }

    pub fn len(&self) -> u32 {
        self.end.distance_from(self.start) + 1
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        seq.is_between(self.start, self.end)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Removal {
    NotPresent,
    Removed,
    /// Removing would have required splitting an interval, and the set was at capacity.
    ///  Nothing was changed.
    Refused,
}

/// An ordered set of disjoint, non-touching closed intervals in modular sequence space.
///
/// Intervals are kept in a sorted `Vec` of at most `max_intervals` entries.
///
/// All intervals must lie within a window of less than 2^31 sequence numbers, which is what
///  makes modular comparison a total order on the stored values.
///
/// Capacity handling: an operation that would need more than `max_intervals` intervals is not
///  performed. A `merge` of a range that neither overlaps nor touches any stored interval is
///  dropped (and reported as 'nothing added'), and a removal that would split an interval is
///  refused. Callers lose precision (a received sequence number is not reported, a removed one
///  stays reported) but the set stays consistent and bounded.
pub struct IntervalSet {
    intervals: Vec<Interval>,
    max_intervals: usize,
}

impl Debug for IntervalSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.intervals.iter()).finish()
    }
}

impl IntervalSet {
    pub fn new(max_intervals: usize) -> IntervalSet {
        assert!(max_intervals >= 1);
        IntervalSet {
            intervals: Vec::new(),
            max_intervals,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn max_intervals(&self) -> usize {
        self.max_intervals
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    pub fn first(&self) -> Option<&Interval> {
        self.intervals.first()
    }

    pub fn last(&self) -> Option<&Interval> {
        self.intervals.last()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// index of the first interval that overlaps or touches a range starting at `begin`, or
    ///  any interval after that
    fn first_candidate(&self, begin: SeqNum) -> usize {
        self.intervals.partition_point(|i| i.end.next().is_before(begin))
    }

    /// returns true iff merging `[begin, end]` would not exceed capacity
    pub fn can_merge(&self, begin: SeqNum, end: SeqNum) -> bool {
        if self.intervals.len() < self.max_intervals {
            return true;
        }
        let idx = self.first_candidate(begin);
        idx < self.intervals.len() && !self.intervals[idx].start.is_after(end.next())
    }

    /// Adds `[begin, end]`, coalescing it with all intervals it overlaps or touches.
    ///
    /// Returns true iff at least one sequence number was added that was not in the set before.
    pub fn merge(&mut self, begin: SeqNum, end: SeqNum) -> bool {
        assert!(begin.is_before_or_eq(end), "merging inverted range [{}, {}]", begin, end);

        let idx = self.first_candidate(begin);
        if idx == self.intervals.len() || self.intervals[idx].start.is_after(end.next()) {
            if self.intervals.len() >= self.max_intervals {
                warn!("interval set at capacity of {} - dropping [{}-{}]", self.max_intervals, begin, end);
                return false;
            }
            trace!("inserting new interval [{}-{}] at index {}", begin, end, idx);
            self.intervals.insert(idx, Interval::new(begin, end));
            return true;
        }

        let existing = self.intervals[idx];
        if existing.start.is_before_or_eq(begin) && existing.end.is_after_or_eq(end) {
            return false;
        }

        let mut merged = Interval::new(existing.start.min_seq(begin), existing.end.max_seq(end));
        let mut absorb_to = idx + 1;
        while absorb_to < self.intervals.len() && self.intervals[absorb_to].start.is_before_or_eq(merged.end.next()) {
            merged.end = merged.end.max_seq(self.intervals[absorb_to].end);
            absorb_to += 1;
        }

        trace!("merged [{}-{}] into {:?}, absorbing {} following interval(s)", begin, end, merged, absorb_to - idx - 1);
        self.intervals[idx] = merged;
        self.intervals.drain(idx + 1..absorb_to);
        true
    }

    pub fn remove(&mut self, point: SeqNum) -> Removal {
        self.remove_range(point, point)
    }

    /// Removes all sequence numbers in `[begin, end]`. Intervals are trimmed at either edge, or
    ///  split if the range lies strictly inside them - unless that would exceed capacity.
    pub fn remove_range(&mut self, begin: SeqNum, end: SeqNum) -> Removal {
        assert!(begin.is_before_or_eq(end), "removing inverted range [{}, {}]", begin, end);

        let idx = self.intervals.partition_point(|i| i.end.is_before(begin));
        let mut num_affected = 0;
        while idx + num_affected < self.intervals.len() && self.intervals[idx + num_affected].start.is_before_or_eq(end) {
            num_affected += 1;
        }
        if num_affected == 0 {
            return Removal::NotPresent;
        }

        let first = self.intervals[idx];
        let last = self.intervals[idx + num_affected - 1];

        let mut remainders = Vec::with_capacity(2);
        if first.start.is_before(begin) {
            remainders.push(Interval::new(first.start, begin.prev()));
        }
        if last.end.is_after(end) {
            remainders.push(Interval::new(end.next(), last.end));
        }

        if self.intervals.len() - num_affected + remainders.len() > self.max_intervals {
            warn!("interval set at capacity of {} - refusing to split {:?} for removing [{}-{}]", self.max_intervals, first, begin, end);
            return Removal::Refused;
        }

        self.intervals.splice(idx..idx + num_affected, remainders);
        Removal::Removed
    }

    /// Drops all sequence numbers up to and including `lower_bound`, returning the removed parts
    pub fn advance_lower_bound(&mut self, lower_bound: SeqNum) -> Vec<Interval> {
        let mut removed = Vec::new();

        let num_covered = self.intervals.partition_point(|i| i.end.is_before_or_eq(lower_bound));
        removed.extend(self.intervals.drain(..num_covered));

        if let Some(first) = self.intervals.first_mut() {
            if first.start.is_before_or_eq(lower_bound) {
                removed.push(Interval::new(first.start, lower_bound));
                first.start = lower_bound.next();
            }
        }

        if !removed.is_empty() {
            trace!("advanced lower bound to {}: removed {:?}", lower_bound, removed);
        }
        removed
    }

    pub fn containing(&self, point: SeqNum) -> Option<Interval> {
        let idx = self.intervals.partition_point(|i| i.end.is_before(point));
        self.intervals.get(idx)
            .filter(|i| i.start.is_before_or_eq(point))
            .copied()
    }

    pub fn contains(&self, point: SeqNum) -> bool {
        self.containing(point).is_some()
    }

    /// If the first interval continues the contiguous sequence ending at `lower_bound`, advance
    ///  `lower_bound` to that interval's end and remove it. Returns true iff `lower_bound` moved.
    pub fn try_advance_contiguous(&mut self, lower_bound: &mut SeqNum) -> bool {
        self.advance_lower_bound(*lower_bound);

        match self.intervals.first() {
            Some(first) if first.start == lower_bound.next() => {
                *lower_bound = first.end;
                self.intervals.remove(0);
                true
            }
            _ => false,
        }
    }

    /// diagnostic invariant check - not part of regular operation
    pub fn check(&self) -> anyhow::Result<()> {
        if self.intervals.len() > self.max_intervals {
            bail!("{} intervals exceed the maximum of {}", self.intervals.len(), self.max_intervals);
        }
        for interval in &self.intervals {
            if interval.end.is_before(interval.start) {
                bail!("inverted interval {:?}", interval);
            }
        }
        for pair in self.intervals.windows(2) {
            if !pair[0].end.next().is_before(pair[1].start) {
                bail!("intervals {:?} and {:?} overlap, touch or are out of order", pair[0], pair[1]);
            }
        }
        if let (Some(first), Some(last)) = (self.intervals.first(), self.intervals.last()) {
            if last.end.distance_from(first.start) >= 0x8000_0000 {
                bail!("intervals span more than half the sequence space: {:?} .. {:?}", first, last);
            }
        }
        Ok(())
    }
}
