use crate::config::SackConfig;
use crate::ranges::gap_list::{GapKind, GapList};
use crate::ranges::interval_set::Interval;
use crate::sctp::sack_chunk::{ChunkType, GapAckBlock, SackChunk};
use crate::util::safe_converter::PrecheckedCast;
use crate::util::seq_num::SeqNum;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The data receiver side of an SCTP-style association: tracks arrived TSNs in a [GapList],
///  collects duplicates and assembles SACK / NR-SACK chunks.
pub struct TsnReceiver {
    config: Arc<SackConfig>,
    gap_list: GapList,
    duplicate_tsns: Vec<SeqNum>,
    use_nr_sack: bool,
}

impl TsnReceiver {
    /// `initial_tsn` is the peer's initial TSN, i.e. the first TSN it will send
    pub fn new(config: Arc<SackConfig>, initial_tsn: SeqNum, use_nr_sack: bool) -> TsnReceiver {
        let gap_list = GapList::new(initial_tsn.prev(), config.max_gap_count);
        TsnReceiver {
            config,
            gap_list,
            duplicate_tsns: Vec::new(),
            use_nr_sack,
        }
    }

    pub fn cumulative_tsn_ack(&self) -> SeqNum {
        self.gap_list.cumulative_ack()
    }

    pub fn gap_list(&self) -> &GapList {
        &self.gap_list
    }

    /// Handles an arriving DATA chunk. Returns true iff the TSN is new, i.e. the chunk's
    ///  payload should be passed on for delivery.
    ///
    /// Without NR-SACK, all data is revokable.
    pub fn on_data_chunk(&mut self, tsn: SeqNum, revokable: bool) -> bool {
        let revokable = revokable || !self.use_nr_sack;

        if self.gap_list.is_tsn_received(tsn) {
            trace!("duplicate TSN {}", tsn);
            if self.duplicate_tsns.len() < self.config.max_duplicate_tsns {
                self.duplicate_tsns.push(tsn);
            }
            return false;
        }

        if !self.gap_list.update_gap_list(tsn, revokable) {
            // capacity exceeded: the TSN is not recorded, and the peer will retransmit it
            return false;
        }
        if self.gap_list.try_to_advance_cum_ack_tsn() {
            trace!("cumulative TSN ack advanced to {}", self.gap_list.cumulative_ack());
        }
        true
    }

    /// The peer abandoned all TSNs up to `new_cumulative_tsn` (PR-SCTP FORWARD-TSN)
    pub fn on_forward_tsn(&mut self, new_cumulative_tsn: SeqNum) {
        debug!("FORWARD-TSN to {}", new_cumulative_tsn);
        self.gap_list.forward_cum_ack_tsn(new_cumulative_tsn);
        self.gap_list.try_to_advance_cum_ack_tsn();
    }

    /// Reneges on a revokable TSN, i.e. discards data that was reported as received but not yet
    ///  delivered. Non-revokable TSNs can not be reneged on. Returns true iff the TSN was
    ///  retracted.
    pub fn renege(&mut self, tsn: SeqNum) -> bool {
        if !self.gap_list.contains(GapKind::Revokable, tsn) {
            warn!("attempting to renege on TSN {} which is not revokable - ignoring", tsn);
            return false;
        }
        self.gap_list.remove_from_gap_list(tsn)
    }

    /// Assembles a SACK (or NR-SACK) chunk for the current state and resets the list of
    ///  duplicate TSNs.
    pub fn create_sack(&mut self, a_rwnd: u32) -> SackChunk {
        let cumulative_tsn_ack = self.gap_list.cumulative_ack();

        let (chunk_type, gap_blocks, nr_gap_blocks) = if self.use_nr_sack {
            (
                ChunkType::NrSack,
                Self::gap_blocks(cumulative_tsn_ack, self.gap_list.gaps(GapKind::Revokable)),
                Self::gap_blocks(cumulative_tsn_ack, self.gap_list.gaps(GapKind::NonRevokable)),
            )
        }
        else {
            (
                ChunkType::Sack,
                Self::gap_blocks(cumulative_tsn_ack, self.gap_list.gaps(GapKind::Combined)),
                Vec::new(),
            )
        };

        SackChunk {
            chunk_type,
            cumulative_tsn_ack,
            a_rwnd,
            gap_blocks,
            nr_gap_blocks,
            duplicate_tsns: std::mem::take(&mut self.duplicate_tsns),
        }
    }

    /// Gap ack blocks are offsets from the cumulative ack encoded as u16 - intervals that can
    ///  not be represented are not reported
    fn gap_blocks<'a>(cumulative_tsn_ack: SeqNum, gaps: impl Iterator<Item = &'a Interval>) -> Vec<GapAckBlock> {
        let mut result = Vec::new();
        for gap in gaps {
            let end_offset = gap.end.distance_from(cumulative_tsn_ack);
            if end_offset > u16::MAX as u32 {
                debug!("gap {:?} is beyond the range of gap ack block offsets - not reporting it or any higher gaps", gap);
                break;
            }
            result.push(GapAckBlock {
                start: gap.start.distance_from(cumulative_tsn_ack).prechecked_cast(),
                end: end_offset.prechecked_cast(),
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn s(raw: u32) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    fn receiver(use_nr_sack: bool) -> TsnReceiver {
        TsnReceiver::new(Arc::new(SackConfig::default_rfc3517()), s(1001), use_nr_sack)
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut receiver = receiver(false);
        assert_eq!(receiver.cumulative_tsn_ack(), s(1000));

        assert!(receiver.on_data_chunk(s(1004), true));
        assert!(receiver.on_data_chunk(s(1005), true));
        let sack = receiver.create_sack(100);
        assert_eq!(sack.cumulative_tsn_ack, s(1000));
        assert_eq!(sack.gap_blocks, vec![GapAckBlock { start: 4, end: 5 }]);

        assert!(receiver.on_data_chunk(s(1002), true));
        assert!(receiver.on_data_chunk(s(1001), true));
        assert!(receiver.on_data_chunk(s(1003), true));

        let sack = receiver.create_sack(100);
        assert_eq!(sack.cumulative_tsn_ack, s(1005));
        assert!(sack.gap_blocks.is_empty());
        assert_eq!(sack.chunk_type, ChunkType::Sack);
    }

    #[test]
    fn test_duplicates_are_reported_once() {
        let mut receiver = receiver(false);
        receiver.on_data_chunk(s(1001), true);
        receiver.on_data_chunk(s(1003), true);

        assert!(!receiver.on_data_chunk(s(1001), true));
        assert!(!receiver.on_data_chunk(s(1003), true));

        let sack = receiver.create_sack(100);
        assert_eq!(sack.duplicate_tsns, vec![s(1001), s(1003)]);
        assert!(receiver.create_sack(100).duplicate_tsns.is_empty());
    }

    #[test]
    fn test_duplicate_list_is_bounded() {
        let mut config = SackConfig::default_rfc3517();
        config.max_duplicate_tsns = 2;
        let mut receiver = TsnReceiver::new(Arc::new(config), s(1), false);
        receiver.on_data_chunk(s(1), true);
        for _ in 0..5 {
            receiver.on_data_chunk(s(1), true);
        }
        assert_eq!(receiver.create_sack(0).duplicate_tsns.len(), 2);
    }

    #[test]
    fn test_nr_sack_separates_gap_kinds() {
        let mut receiver = receiver(true);
        receiver.on_data_chunk(s(1003), true);
        receiver.on_data_chunk(s(1004), false);
        receiver.on_data_chunk(s(1005), true);

        let sack = receiver.create_sack(7);
        assert_eq!(sack.chunk_type, ChunkType::NrSack);
        assert_eq!(sack.gap_blocks, vec![GapAckBlock { start: 3, end: 3 }, GapAckBlock { start: 5, end: 5 }]);
        assert_eq!(sack.nr_gap_blocks, vec![GapAckBlock { start: 4, end: 4 }]);
    }

    #[rstest]
    #[case::revokable(1003, true, false)]
    #[case::non_revokable(1004, false, true)]
    #[case::unknown(1010, false, false)]
    fn test_renege(#[case] tsn: u32, #[case] expected: bool, #[case] received_afterwards: bool) {
        let mut receiver = receiver(true);
        receiver.on_data_chunk(s(1003), true);
        receiver.on_data_chunk(s(1004), false);

        assert_eq!(receiver.renege(s(tsn)), expected);
        assert_eq!(receiver.gap_list().is_tsn_received(s(tsn)), received_afterwards);
        receiver.gap_list().check().unwrap();
    }

    #[test]
    fn test_forward_tsn_skips_gap() {
        let mut receiver = receiver(false);
        receiver.on_data_chunk(s(1003), true);
        receiver.on_data_chunk(s(1004), true);

        receiver.on_forward_tsn(s(1002));
        assert_eq!(receiver.cumulative_tsn_ack(), s(1004));

        receiver.on_forward_tsn(s(1001));
        assert_eq!(receiver.cumulative_tsn_ack(), s(1004));
    }

    #[test]
    fn test_unrepresentable_gaps_are_not_reported() {
        let mut receiver = receiver(false);
        receiver.on_data_chunk(s(1010), true);
        receiver.on_data_chunk(s(1000 + 70_000), true);

        let sack = receiver.create_sack(0);
        assert_eq!(sack.gap_blocks, vec![GapAckBlock { start: 10, end: 10 }]);
    }
}
