use crate::config::SackConfig;
use crate::reassembly::queue::ReassemblyQueue;
use crate::tcp::connection_table::ConnectionId;
use crate::tcp::sack_handler::{SackHandler, SackRecovery};
use crate::tcp::sack_option::{SackBlock, SackOption, TcpOptionKind};
use crate::tcp::sack_reporter::SackReporter;
use crate::tcp::scoreboard::SegmentSender;
use crate::util::seq_num::SeqNum;
use bytes::{Buf, BufMut};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// in-order data: the next expected sequence number moved to the contained value
    Advanced(SeqNum),
    /// out-of-order data was buffered (or dropped for capacity reasons)
    Gap,
    /// all of the segment's data was received before
    Duplicate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckOutcome {
    /// an old ack, or an ack with nothing outstanding
    Stale,
    Advanced,
    Duplicate,
    EnteredRecovery,
    LeftRecovery,
}

/// SACK-related state of a single TCP connection: the receive side tracks out-of-order data
///  and reports it in SACK options, the send side processes the peer's SACK options and
///  drives loss recovery.
///
/// The connection does not own any payload. Received segments are tracked by coverage only,
///  and retransmissions go through a [SegmentSender] that has access to the send buffer.
pub struct SackConnection {
    id: ConnectionId,
    config: Arc<SackConfig>,
    sack_permitted: bool,

    receive_queue: ReassemblyQueue,
    reporter: SackReporter,

    snd_una: SeqNum,
    snd_max: SeqNum,
    dup_acks: u32,
    handler: SackHandler,
}

impl SackConnection {
    /// `irs` is the peer's first data sequence number, `iss` our own. `sack_permitted` is true
    ///  iff both sides exchanged the SACK-permitted option during the handshake.
    pub fn new(id: ConnectionId, config: Arc<SackConfig>, irs: SeqNum, iss: SeqNum, sack_permitted: bool) -> SackConnection {
        let handler = SackHandler::new(config.clone(), iss, sack_permitted);
        debug!("connection {}: SACK {}", id, if handler.uses_sack() { "enabled" } else { "disabled" });

        SackConnection {
            id,
            receive_queue: ReassemblyQueue::new(irs, config.max_gap_count),
            reporter: SackReporter::new(config.max_sack_blocks),
            config,
            sack_permitted,
            snd_una: iss,
            snd_max: iss,
            dup_acks: 0,
            handler,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn rcv_nxt(&self) -> SeqNum {
        self.receive_queue.virtual_start().next()
    }

    pub fn snd_una(&self) -> SeqNum {
        self.snd_una
    }

    pub fn snd_max(&self) -> SeqNum {
        self.snd_max
    }

    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    pub fn uses_sack(&self) -> bool {
        self.handler.uses_sack()
    }

    pub fn is_in_recovery(&self) -> bool {
        self.handler.recovery_point().is_some()
    }

    /// bytes of out-of-order data held back
    pub fn buffered_bytes(&self) -> u64 {
        self.receive_queue.buffered_bytes()
    }

    /// Registers an arriving data segment `[start, start+len)`, updating the information for
    ///  the next SACK option
    #[instrument(level = "trace", skip(self), fields(id = %self.id))]
    pub fn record_received_segment(&mut self, start: SeqNum, len: u32) -> ReceiveOutcome {
        assert!(len > 0, "segments without data are not registered");

        let rcv_nxt = self.rcv_nxt();
        let end = start + len;

        if end.is_before_or_eq(rcv_nxt) {
            trace!("segment was received before");
            self.reporter.record_duplicate(SackBlock::new(start, end), None);
            return ReceiveOutcome::Duplicate;
        }
        if start.is_before(rcv_nxt) {
            trace!("segment partially overlaps received data");
            self.reporter.record_duplicate(SackBlock::new(start, rcv_nxt), None);
        }
        else if self.receive_queue.is_received(start, len) {
            trace!("segment duplicates buffered out-of-order data");
            let enclosing = self.receive_queue.enclosing_range(start)
                .map(|(left, right)| SackBlock::new(left, right));
            self.reporter.record_duplicate(SackBlock::new(start, end), enclosing);
            return ReceiveOutcome::Duplicate;
        }
        else {
            let overlapping = self.receive_queue.ranges()
                .find(|(left, right)| left.is_before(end) && right.is_after(start));
            if let Some((left, right)) = overlapping {
                trace!("segment partially duplicates buffered out-of-order data");
                let duplicate = SackBlock::new(start.max_seq(left), end.min_seq(right));
                self.reporter.record_duplicate(duplicate, Some(SackBlock::new(left, right)));
            }
        }

        let new_virtual_start = self.receive_queue.insert(start, len, None);
        if new_virtual_start.next() != rcv_nxt {
            while self.receive_queue.extract_up_to(new_virtual_start).is_some() {}
            return ReceiveOutcome::Advanced(self.rcv_nxt());
        }

        if let Some((left, right)) = self.receive_queue.enclosing_range(start) {
            self.reporter.record_received(SackBlock::new(left, right));
        }
        ReceiveOutcome::Gap
    }

    /// Appends a SACK option to an outgoing segment's options if there is anything to report
    ///  and the peer supports SACK. Returns the number of bytes written.
    pub fn add_sack_option_to(&mut self, buf: &mut impl BufMut, available_space: usize) -> usize {
        if !self.sack_permitted {
            return 0;
        }

        let available_space = available_space.min(self.config.tcp_option_space);
        let blocks = self.reporter.build_blocks(&self.receive_queue, available_space);
        if blocks.is_empty() {
            return 0;
        }

        trace!("adding SACK option with blocks {:?}", blocks);
        let option = SackOption { blocks };
        option.ser(buf);
        SackOption::aligned_len(option.blocks.len())
    }

    /// Processes a SACK option from an incoming ACK, optionally preceded by NOP padding.
    ///  Returns true iff any block changed the scoreboard. A malformed option is dropped.
    pub fn process_sack_option(&mut self, buf: &mut impl Buf) -> bool {
        if !self.handler.uses_sack() {
            trace!("ignoring SACK option on a connection without SACK");
            return false;
        }

        while buf.has_remaining() && buf.chunk()[0] == u8::from(TcpOptionKind::Nop) {
            buf.advance(1);
        }

        match SackOption::deser(buf) {
            Ok(option) => {
                let mut changed = false;
                for block in &option.blocks {
                    changed |= self.handler.on_sack_block(block);
                }
                changed
            }
            Err(e) => {
                warn!("connection {}: dropping malformed SACK option: {}", self.id, e);
                false
            }
        }
    }

    /// Processes the cumulative ack of an incoming ACK. SACK options of the same segment should
    ///  be processed before, so loss detection sees them.
    #[instrument(level = "trace", skip(self), fields(id = %self.id))]
    pub fn on_ack(&mut self, ack: SeqNum) -> AckOutcome {
        if ack.is_before(self.snd_una) {
            trace!("stale ack");
            return AckOutcome::Stale;
        }
        if ack.is_after(self.snd_max) {
            warn!("connection {}: ack {} for data that was not sent (snd_max {}) - ignoring", self.id, ack, self.snd_max);
            return AckOutcome::Stale;
        }

        if ack == self.snd_una {
            if self.snd_una == self.snd_max {
                return AckOutcome::Stale;
            }
            self.dup_acks += 1;
            trace!("duplicate ack #{}", self.dup_acks);

            if !self.is_in_recovery() && (self.dup_acks >= self.config.dup_threshold || self.handler.is_lost(self.snd_una)) {
                debug!("connection {}: entering loss recovery after {} duplicate acks", self.id, self.dup_acks);
                self.handler.enter_recovery();
                return AckOutcome::EnteredRecovery;
            }
            return AckOutcome::Duplicate;
        }

        self.snd_una = ack;
        self.dup_acks = 0;
        self.handler.on_cumulative_ack(ack);

        if let Some(recovery_point) = self.handler.recovery_point() {
            if ack.is_after(recovery_point) {
                debug!("connection {}: leaving loss recovery", self.id);
                self.handler.leave_recovery();
                return AckOutcome::LeftRecovery;
            }
        }
        AckOutcome::Advanced
    }

    pub fn on_data_sent(&mut self, seq: SeqNum, len: u32) {
        self.snd_max = self.snd_max.max_seq(seq + len);
        self.handler.on_data_sent(seq, len);
    }

    /// The sequence number that loss recovery would retransmit next, `None` outside of recovery
    pub fn next_retransmit_candidate(&self) -> Option<SeqNum> {
        if !self.is_in_recovery() {
            return None;
        }
        self.handler.next_retransmit_candidate()
    }

    /// Retransmits during loss recovery as far as the congestion window allows, returning the
    ///  number of bytes sent
    pub fn send_unacked_segments(&mut self, window: u32, sender: &mut dyn SegmentSender) -> u64 {
        if !self.is_in_recovery() {
            return 0;
        }
        self.handler.send_unacked_segments(window, self.config.mss, sender)
    }

    /// After a retransmission timeout, SACK information received so far is discarded (RFC 2018
    ///  section 8) and loss recovery starts over from the cumulative ack
    pub fn on_retransmission_timeout(&mut self) {
        debug!("connection {}: retransmission timeout - resetting loss recovery state", self.id);
        self.dup_acks = 0;
        self.handler.initial(self.snd_una, self.snd_max);
    }

    /// Releases the connection's buffered state
    pub fn close(&mut self) {
        debug!("closing connection {}", self.id);
        self.receive_queue.clear();
        self.handler.leave_recovery();
    }
}
