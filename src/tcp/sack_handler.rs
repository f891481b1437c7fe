use crate::config::{SackAlgorithm, SackConfig};
use crate::tcp::sack_option::SackBlock;
use crate::tcp::scoreboard::{SackScoreboard, SegmentSender};
use crate::util::seq_num::SeqNum;
use std::sync::Arc;
use tracing::{debug, trace};

/// The sender-side loss recovery capabilities a connection needs, independent of the algorithm
pub trait SackRecovery {
    /// Resets all recovery state for the send window `[snd_una, snd_max)`, e.g. after a
    ///  retransmission timeout
    fn initial(&mut self, snd_una: SeqNum, snd_max: SeqNum);

    /// Returns true iff the block changed the recovery state
    fn on_sack_block(&mut self, block: &SackBlock) -> bool;

    fn on_cumulative_ack(&mut self, snd_una: SeqNum);

    fn on_data_sent(&mut self, seq: SeqNum, len: u32);

    /// true iff the first unacknowledged byte should be considered lost even without reaching
    ///  the duplicate ack threshold
    fn is_lost(&self, seq: SeqNum) -> bool;

    fn enter_recovery(&mut self);
    fn leave_recovery(&mut self);
    fn recovery_point(&self) -> Option<SeqNum>;

    fn next_retransmit_candidate(&self) -> Option<SeqNum>;

    /// Retransmits as much as the congestion window permits, returning the number of bytes sent
    fn send_unacked_segments(&mut self, window: u32, mss: u32, sender: &mut dyn SegmentSender) -> u64;
}

impl SackRecovery for SackScoreboard {
    fn initial(&mut self, snd_una: SeqNum, snd_max: SeqNum) {
        SackScoreboard::initial(self, snd_una, snd_max);
    }

    fn on_sack_block(&mut self, block: &SackBlock) -> bool {
        self.record_duplicate_sack(block.left_edge, block.right_edge)
    }

    fn on_cumulative_ack(&mut self, snd_una: SeqNum) {
        self.discard_up_to(snd_una);
    }

    fn on_data_sent(&mut self, seq: SeqNum, len: u32) {
        self.record_sent(seq, len);
    }

    fn is_lost(&self, seq: SeqNum) -> bool {
        SackScoreboard::is_lost(self, seq)
    }

    fn enter_recovery(&mut self) {
        SackScoreboard::enter_recovery(self);
    }

    fn leave_recovery(&mut self) {
        SackScoreboard::leave_recovery(self);
    }

    fn recovery_point(&self) -> Option<SeqNum> {
        SackScoreboard::recovery_point(self)
    }

    fn next_retransmit_candidate(&self) -> Option<SeqNum> {
        self.next_segment_to_retransmit()
    }

    fn send_unacked_segments(&mut self, window: u32, mss: u32, sender: &mut dyn SegmentSender) -> u64 {
        self.send_unacked_segment(window, mss, sender)
    }
}

/// Loss recovery without SACK information: the first unacknowledged segment is retransmitted
///  once per recovery episode, and again after each partial ack (NewReno style)
pub struct NoSackRecovery {
    snd_una: SeqNum,
    snd_max: SeqNum,
    recovery_point: Option<SeqNum>,
    retransmitted: bool,
}

impl NoSackRecovery {
    pub fn new(snd_una: SeqNum) -> NoSackRecovery {
        NoSackRecovery {
            snd_una,
            snd_max: snd_una,
            recovery_point: None,
            retransmitted: false,
        }
    }
}

impl SackRecovery for NoSackRecovery {
    fn initial(&mut self, snd_una: SeqNum, snd_max: SeqNum) {
        self.snd_una = snd_una;
        self.snd_max = snd_max;
        self.recovery_point = None;
        self.retransmitted = false;
    }

    fn on_sack_block(&mut self, _block: &SackBlock) -> bool {
        false
    }

    fn on_cumulative_ack(&mut self, snd_una: SeqNum) {
        if snd_una.is_after(self.snd_una) {
            self.snd_una = snd_una;
            self.snd_max = self.snd_max.max_seq(snd_una);
            // partial ack: the next hole is due for retransmission
            self.retransmitted = false;
        }
    }

    fn on_data_sent(&mut self, seq: SeqNum, len: u32) {
        self.snd_max = self.snd_max.max_seq(seq + len);
    }

    fn is_lost(&self, _seq: SeqNum) -> bool {
        false
    }

    fn enter_recovery(&mut self) {
        debug!("entering loss recovery without SACK");
        self.recovery_point = Some(self.snd_max.prev());
        self.retransmitted = false;
    }

    fn leave_recovery(&mut self) {
        self.recovery_point = None;
    }

    fn recovery_point(&self) -> Option<SeqNum> {
        self.recovery_point
    }

    fn next_retransmit_candidate(&self) -> Option<SeqNum> {
        if self.retransmitted || self.snd_una == self.snd_max {
            return None;
        }
        Some(self.snd_una)
    }

    fn send_unacked_segments(&mut self, window: u32, mss: u32, sender: &mut dyn SegmentSender) -> u64 {
        let Some(seq) = self.next_retransmit_candidate() else {
            return 0;
        };
        if window < mss {
            return 0;
        }
        let len = mss.min(self.snd_max.distance_from(seq));
        trace!("retransmitting {} bytes at {}", len, seq);
        sender.send_segment(seq, len);
        self.retransmitted = true;
        u64::from(len)
    }
}

/// The loss recovery strategy of a connection, chosen once at connection setup
pub enum SackHandler {
    Rfc3517(SackScoreboard),
    NoSack(NoSackRecovery),
}

impl SackHandler {
    /// RFC 3517 recovery requires both the configuration and the peer (via SACK-permitted) to
    ///  support SACK
    pub fn new(config: Arc<SackConfig>, snd_una: SeqNum, sack_permitted: bool) -> SackHandler {
        match config.sack_algorithm {
            SackAlgorithm::Rfc3517 if sack_permitted => SackHandler::Rfc3517(SackScoreboard::new(config, snd_una)),
            _ => SackHandler::NoSack(NoSackRecovery::new(snd_una)),
        }
    }

    pub fn uses_sack(&self) -> bool {
        matches!(self, SackHandler::Rfc3517(_))
    }
}

impl SackRecovery for SackHandler {
    fn initial(&mut self, snd_una: SeqNum, snd_max: SeqNum) {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::initial(scoreboard, snd_una, snd_max),
            SackHandler::NoSack(no_sack) => SackRecovery::initial(no_sack, snd_una, snd_max),
        }
    }

    fn on_sack_block(&mut self, block: &SackBlock) -> bool {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::on_sack_block(scoreboard, block),
            SackHandler::NoSack(no_sack) => SackRecovery::on_sack_block(no_sack, block),
        }
    }

    fn on_cumulative_ack(&mut self, snd_una: SeqNum) {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::on_cumulative_ack(scoreboard, snd_una),
            SackHandler::NoSack(no_sack) => SackRecovery::on_cumulative_ack(no_sack, snd_una),
        }
    }

    fn on_data_sent(&mut self, seq: SeqNum, len: u32) {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::on_data_sent(scoreboard, seq, len),
            SackHandler::NoSack(no_sack) => SackRecovery::on_data_sent(no_sack, seq, len),
        }
    }

    fn is_lost(&self, seq: SeqNum) -> bool {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::is_lost(scoreboard, seq),
            SackHandler::NoSack(no_sack) => SackRecovery::is_lost(no_sack, seq),
        }
    }

    fn enter_recovery(&mut self) {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::enter_recovery(scoreboard),
            SackHandler::NoSack(no_sack) => SackRecovery::enter_recovery(no_sack),
        }
    }

    fn leave_recovery(&mut self) {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::leave_recovery(scoreboard),
            SackHandler::NoSack(no_sack) => SackRecovery::leave_recovery(no_sack),
        }
    }

    fn recovery_point(&self) -> Option<SeqNum> {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::recovery_point(scoreboard),
            SackHandler::NoSack(no_sack) => SackRecovery::recovery_point(no_sack),
        }
    }

    fn next_retransmit_candidate(&self) -> Option<SeqNum> {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::next_retransmit_candidate(scoreboard),
            SackHandler::NoSack(no_sack) => SackRecovery::next_retransmit_candidate(no_sack),
        }
    }

    fn send_unacked_segments(&mut self, window: u32, mss: u32, sender: &mut dyn SegmentSender) -> u64 {
        match self {
            SackHandler::Rfc3517(scoreboard) => SackRecovery::send_unacked_segments(scoreboard, window, mss, sender),
            SackHandler::NoSack(no_sack) => SackRecovery::send_unacked_segments(no_sack, window, mss, sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::scoreboard::MockSegmentSender;
    use mockall::predicate::eq;
    use rstest::rstest;

    fn s(raw: u32) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    #[rstest]
    #[case::rfc3517(SackAlgorithm::Rfc3517, true, true)]
    #[case::not_permitted(SackAlgorithm::Rfc3517, false, false)]
    #[case::configured_off(SackAlgorithm::NoSack, true, false)]
    fn test_selection(#[case] algorithm: SackAlgorithm, #[case] sack_permitted: bool, #[case] expected: bool) {
        let mut config = SackConfig::default_rfc3517();
        config.sack_algorithm = algorithm;
        let handler = SackHandler::new(Arc::new(config), s(1000), sack_permitted);
        assert_eq!(handler.uses_sack(), expected);
    }

    #[test]
    fn test_no_sack_retransmits_once_per_ack() {
        let mut handler = SackHandler::new(Arc::new(SackConfig::default_rfc3517()), s(1000), false);
        handler.on_data_sent(s(1000), 5000);
        assert!(!handler.on_sack_block(&SackBlock::new(s(2000), s(3000))));

        handler.enter_recovery();
        assert_eq!(handler.recovery_point(), Some(s(5999)));
        assert_eq!(handler.next_retransmit_candidate(), Some(s(1000)));

        let mut sender = MockSegmentSender::new();
        sender.expect_send_segment()
            .with(eq(s(1000)), eq(1460))
            .times(1)
            .return_const(());
        sender.expect_send_segment()
            .with(eq(s(3000)), eq(1460))
            .times(1)
            .return_const(());

        assert_eq!(handler.send_unacked_segments(100_000, 1460, &mut sender), 1460);
        assert_eq!(handler.send_unacked_segments(100_000, 1460, &mut sender), 0);
        assert_eq!(handler.next_retransmit_candidate(), None);

        handler.on_cumulative_ack(s(3000));
        assert_eq!(handler.send_unacked_segments(100_000, 1460, &mut sender), 1460);
    }

    #[test]
    fn test_rfc3517_delegates_to_scoreboard() {
        let mut config = SackConfig::default_rfc3517();
        config.mss = 100;
        let mut handler = SackHandler::new(Arc::new(config), s(1000), true);
        handler.initial(s(1000), s(2000));

        for _ in 0..3 {
            assert!(handler.on_sack_block(&SackBlock::new(s(1500), s(1600))));
        }
        assert!(handler.is_lost(s(1000)));
        assert_eq!(handler.next_retransmit_candidate(), Some(s(1000)));

        handler.on_cumulative_ack(s(1600));
        assert!(!handler.is_lost(s(1600)));
        assert_eq!(handler.next_retransmit_candidate(), Some(s(1600)));
    }
}
