use crate::reassembly::queue::ReassemblyQueue;
use crate::tcp::sack_option::{SackBlock, SackOption};
use std::collections::VecDeque;
use tracing::trace;

/// Receiver-side selection of the SACK blocks to report (RFC 2018, RFC 2883).
///
/// The first reported block is always the one containing the most recently received segment,
///  followed by the blocks reported most recently before. Blocks are refreshed against the
///  receive queue before each report since they may have grown by merging or may have been
///  delivered in the meantime.
///
/// A duplicate segment is reported once as a D-SACK block in front of all other blocks. If the
///  duplicate is part of buffered out-of-order data, the buffered block containing it is
///  reported second.
pub struct SackReporter {
    max_blocks: usize,
    /// most recent first
    recent_blocks: VecDeque<SackBlock>,
    duplicate: Option<(SackBlock, Option<SackBlock>)>,
}

impl SackReporter {
    pub fn new(max_blocks: usize) -> SackReporter {
        assert!((1..=SackOption::MAX_BLOCKS).contains(&max_blocks));
        SackReporter {
            max_blocks,
            recent_blocks: VecDeque::new(),
            duplicate: None,
        }
    }

    /// Records the block of buffered out-of-order data containing a newly arrived segment
    pub fn record_received(&mut self, block: SackBlock) {
        self.recent_blocks.retain(|b| !block.covers(b));
        self.recent_blocks.push_front(block);
        self.recent_blocks.truncate(self.max_blocks);
    }

    /// Records the arrival of duplicate data for the next report. `enclosing` is the buffered
    ///  out-of-order block containing the duplicate, if any.
    pub fn record_duplicate(&mut self, duplicate: SackBlock, enclosing: Option<SackBlock>) {
        trace!("D-SACK for {:?}", duplicate);
        self.duplicate = Some((duplicate, enclosing));
        if let Some(enclosing) = enclosing {
            self.record_received(enclosing);
        }
    }

    pub fn has_pending_report(&self) -> bool {
        self.duplicate.is_some() || !self.recent_blocks.is_empty()
    }

    /// Assembles the blocks for the next SACK option: the D-SACK block (if any) first, then
    ///  the most recent blocks, skipping blocks that are covered by a block already selected.
    ///  The list is limited to what fits into `available_space` bytes of option space.
    ///
    /// A pending D-SACK is reported only once.
    pub fn build_blocks(&mut self, receive_queue: &ReassemblyQueue, available_space: usize) -> Vec<SackBlock> {
        let refreshed = self.recent_blocks.iter()
            .filter_map(|b| receive_queue.enclosing_range(b.left_edge))
            .map(|(left, right)| SackBlock::new(left, right))
            .collect::<Vec<_>>();

        self.recent_blocks.clear();
        for block in refreshed {
            if !self.recent_blocks.iter().any(|b| b.covers(&block)) {
                self.recent_blocks.push_back(block);
            }
        }

        let mut result = Vec::new();
        if let Some((duplicate, _)) = self.duplicate.take() {
            result.push(duplicate);
        }
        result.extend(self.recent_blocks.iter().copied());

        let max_blocks = self.max_blocks.min(SackOption::max_blocks_for(available_space));
        result.truncate(max_blocks);
        result
    }
}
