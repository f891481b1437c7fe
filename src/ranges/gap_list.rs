use crate::ranges::interval_set::{Interval, IntervalSet, Removal};
use crate::util::seq_num::SeqNum;
use anyhow::bail;
use tracing::{debug, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GapKind {
    /// everything that was received above the cumulative ack
    Combined,
    /// received data the receiver may still discard, i.e. classic SACK semantics
    Revokable,
    /// received data the receiver guarantees to deliver, i.e. NR-SACK semantics
    NonRevokable,
}

/// Received-but-not-cumulatively-acknowledged sequence numbers (TSNs) for one direction of a
///  flow, relative to a cumulative ack pointer.
///
/// Received TSNs are tracked in three interval sets: the revokable and non-revokable ones are
///  disjoint, and `combined` is their union. A TSN that was reported non-revokable never
///  becomes revokable again.
///
/// The gap list does not advance the cumulative ack on its own when new TSNs arrive - that is
///  the caller's decision via [GapList::try_to_advance_cum_ack_tsn].
pub struct GapList {
    cumulative_ack: SeqNum,
    combined: IntervalSet,
    revokable: IntervalSet,
    non_revokable: IntervalSet,
}

impl GapList {
    pub fn new(initial_cumulative_ack: SeqNum, max_gap_count: usize) -> GapList {
        GapList {
            cumulative_ack: initial_cumulative_ack,
            combined: IntervalSet::new(max_gap_count),
            revokable: IntervalSet::new(max_gap_count),
            non_revokable: IntervalSet::new(max_gap_count),
        }
    }

    pub fn cumulative_ack(&self) -> SeqNum {
        self.cumulative_ack
    }

    pub fn gaps(&self, kind: GapKind) -> impl Iterator<Item = &Interval> {
        match kind {
            GapKind::Combined => self.combined.iter(),
            GapKind::Revokable => self.revokable.iter(),
            GapKind::NonRevokable => self.non_revokable.iter(),
        }
    }

    pub fn num_gaps(&self, kind: GapKind) -> usize {
        match kind {
            GapKind::Combined => self.combined.len(),
            GapKind::Revokable => self.revokable.len(),
            GapKind::NonRevokable => self.non_revokable.len(),
        }
    }

    pub fn contains(&self, kind: GapKind, tsn: SeqNum) -> bool {
        match kind {
            GapKind::Combined => self.combined.contains(tsn),
            GapKind::Revokable => self.revokable.contains(tsn),
            GapKind::NonRevokable => self.non_revokable.contains(tsn),
        }
    }

    pub fn highest_tsn_received(&self) -> SeqNum {
        self.combined.last()
            .map(|i| i.end)
            .unwrap_or(self.cumulative_ack)
    }

    pub fn is_tsn_received(&self, tsn: SeqNum) -> bool {
        tsn.is_before_or_eq(self.cumulative_ack) || self.combined.contains(tsn)
    }

    /// Records the arrival of a TSN. Returns true iff the TSN was not received before.
    ///
    /// If a capacity limit prevents recording the TSN, it is treated as not received, i.e. it
    ///  will not be reported and the peer will eventually retransmit it.
    pub fn update_gap_list(&mut self, tsn: SeqNum, revokable: bool) -> bool {
        if tsn.is_before_or_eq(self.cumulative_ack) {
            trace!("TSN {} is at or below the cumulative ack {}", tsn, self.cumulative_ack);
            return false;
        }

        let was_received = self.combined.contains(tsn);

        if revokable {
            if self.non_revokable.contains(tsn) || self.revokable.contains(tsn) {
                return false;
            }
            if !self.revokable.can_merge(tsn, tsn) || !self.combined.can_merge(tsn, tsn) {
                warn!("gap list at capacity - not recording revokable TSN {}", tsn);
                return false;
            }
            self.revokable.merge(tsn, tsn);
        }
        else {
            if self.non_revokable.contains(tsn) {
                return false;
            }
            if !self.non_revokable.can_merge(tsn, tsn) || !self.combined.can_merge(tsn, tsn) {
                warn!("gap list at capacity - not recording non-revokable TSN {}", tsn);
                return false;
            }
            self.non_revokable.merge(tsn, tsn);
            Self::remove_with_fallback(&mut self.revokable, tsn);
        }
        self.combined.merge(tsn, tsn);

        !was_received
    }

    /// Removes a TSN from a set. If that would require a split that the set's capacity does not
    ///  allow, the containing interval is cut off at the TSN instead, dropping the tail.
    fn remove_with_fallback(set: &mut IntervalSet, tsn: SeqNum) -> bool {
        match set.remove(tsn) {
            Removal::NotPresent => false,
            Removal::Removed => true,
            Removal::Refused => {
                let containing = set.containing(tsn)
                    .expect("a refused removal implies a containing interval");
                warn!("gap list at capacity - dropping [{}-{}] instead of splitting", tsn, containing.end);
                let removal = set.remove_range(tsn, containing.end);
                debug_assert_eq!(removal, Removal::Removed);
                true
            }
        }
    }

    /// Moves the cumulative ack forward to `new_cumulative_ack`, dropping all gap information
    ///  up to it. Values that are not ahead of the current cumulative ack are ignored.
    pub fn forward_cum_ack_tsn(&mut self, new_cumulative_ack: SeqNum) {
        if new_cumulative_ack.is_before_or_eq(self.cumulative_ack) {
            return;
        }
        debug!("forwarding cumulative ack from {} to {}", self.cumulative_ack, new_cumulative_ack);

        self.cumulative_ack = new_cumulative_ack;
        self.combined.advance_lower_bound(new_cumulative_ack);
        self.revokable.advance_lower_bound(new_cumulative_ack);
        self.non_revokable.advance_lower_bound(new_cumulative_ack);
    }

    /// Advances the cumulative ack across received TSNs that continue it without a gap.
    ///  Returns true iff the cumulative ack moved.
    pub fn try_to_advance_cum_ack_tsn(&mut self) -> bool {
        let mut cumulative_ack = self.cumulative_ack;
        if !self.combined.try_advance_contiguous(&mut cumulative_ack) {
            return false;
        }

        trace!("advancing cumulative ack from {} to {}", self.cumulative_ack, cumulative_ack);
        self.cumulative_ack = cumulative_ack;
        self.revokable.advance_lower_bound(cumulative_ack);
        self.non_revokable.advance_lower_bound(cumulative_ack);
        true
    }

    /// Retracts a TSN that was reported earlier. Returns true iff it was present.
    ///
    /// If `combined` can not be split at the TSN for capacity reasons, the whole tail of the
    ///  containing interval is retracted from all three sets.
    pub fn remove_from_gap_list(&mut self, tsn: SeqNum) -> bool {
        match self.combined.remove(tsn) {
            Removal::NotPresent => false,
            Removal::Removed => {
                Self::remove_with_fallback(&mut self.revokable, tsn);
                Self::remove_with_fallback(&mut self.non_revokable, tsn);
                true
            }
            Removal::Refused => {
                let containing = self.combined.containing(tsn)
                    .expect("a refused removal implies a containing interval");
                warn!("gap list at capacity - retracting [{}-{}] instead of splitting", tsn, containing.end);
                self.combined.remove_range(tsn, containing.end);
                self.revokable.remove_range(tsn, containing.end);
                self.non_revokable.remove_range(tsn, containing.end);
                true
            }
        }
    }

    /// diagnostic invariant check - not part of regular operation
    pub fn check(&self) -> anyhow::Result<()> {
        self.combined.check()?;
        self.revokable.check()?;
        self.non_revokable.check()?;

        for interval in self.combined.iter().chain(self.revokable.iter()).chain(self.non_revokable.iter()) {
            if interval.start.is_before_or_eq(self.cumulative_ack) {
                bail!("interval {:?} is not above the cumulative ack {}", interval, self.cumulative_ack);
            }
        }
        for interval in self.revokable.iter().chain(self.non_revokable.iter()) {
            if self.combined.containing(interval.start) != self.combined.containing(interval.end) || !self.combined.contains(interval.start) {
                bail!("interval {:?} is not covered by the combined gap list", interval);
            }
        }
        for interval in self.non_revokable.iter() {
            if self.revokable.iter().any(|r| !(r.end.is_before(interval.start) || r.start.is_after(interval.end))) {
                bail!("non-revokable interval {:?} overlaps revokable TSNs", interval);
            }
        }
        Ok(())
    }
}
