use crate::config::SackConfig;
use crate::util::safe_converter::PrecheckedCast;
use crate::util::seq_num::SeqNum;
use anyhow::bail;
use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::{debug, instrument, trace, warn};

/// The scoreboard's outlet for retransmissions - implemented by whatever owns the send buffer
#[cfg_attr(test, automock)]
pub trait SegmentSender {
    fn send_segment(&mut self, seq: SeqNum, len: u32);
}

/// A region of the sequence space above the cumulative ack: an un-SACKed hole (possibly empty)
///  followed by a SACKed block. The region is stored with the block's exclusive end as its key,
///  and its hole starts where the previous region ends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct SackRegion {
    /// length of the SACKed block at the end of the region
    len: u64,
    /// how many SACK blocks reported this region's block
    dup_count: u32,
    /// number of SACKed bytes at or above this region's block
    sacked_above_bytes: u64,
    /// classification of the region's hole - sticky until the region is acknowledged cumulatively
    lost: bool,
}

/// Read-only view of a scoreboard region, for diagnostics and tests
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionInfo {
    pub hole_start: SeqNum,
    pub block_start: SeqNum,
    /// exclusive
    pub block_end: SeqNum,
    pub dup_count: u32,
    pub lost: bool,
}

#[derive(Debug, Copy, Clone)]
enum Piece {
    Hole { start: u64, end: u64, lost: bool },
    Block { start: u64, end: u64, dup_count: u32 },
}
impl Piece {
    fn bounds(&self) -> (u64, u64) {
        match *self {
            Piece::Hole { start, end, .. } => (start, end),
            Piece::Block { start, end, .. } => (start, end),
        }
    }

    fn with_bounds(&self, start: u64, end: u64) -> Piece {
        match *self {
            Piece::Hole { lost, .. } => Piece::Hole { start, end, lost },
            Piece::Block { dup_count, .. } => Piece::Block { start, end, dup_count },
        }
    }

    /// the piece as it is after being covered by a newly arrived SACK block
    fn covered(&self) -> Piece {
        match *self {
            Piece::Hole { start, end, .. } => Piece::Block { start, end, dup_count: 1 },
            Piece::Block { start, end, dup_count } => Piece::Block { start, end, dup_count: dup_count + 1 },
        }
    }
}

/// The sender-side SACK scoreboard of a TCP connection, following RFC 3517.
///
/// All sequence numbers are kept as unwrapped 64-bit positions (see [SeqNum::unwrap_near])
///  anchored at the cumulative ack, so the ordered region map follows modular order across
///  wrap-around.
///
/// Pointers are inclusive, i.e. `high_acked` is the highest cumulatively acknowledged byte and
///  `high_data` the highest byte sent. The invariant is
///  `high_acked <= high_retransmitted <= high_data`.
pub struct SackScoreboard {
    config: Arc<SackConfig>,
    regions: BTreeMap<u64, SackRegion>,
    high_acked: u64,
    high_data: u64,
    high_retransmitted: u64,
    recovery_point: Option<u64>,
    pipe: u64,
}

impl SackScoreboard {
    pub fn new(config: Arc<SackConfig>, snd_una: SeqNum) -> SackScoreboard {
        let mut result = SackScoreboard {
            config,
            regions: Default::default(),
            high_acked: 0,
            high_data: 0,
            high_retransmitted: 0,
            recovery_point: None,
            pipe: 0,
        };
        result.initial(snd_una, snd_una);
        result
    }

    /// (Re-)initializes the scoreboard for a send window `[snd_una, snd_max)`
    pub fn initial(&mut self, snd_una: SeqNum, snd_max: SeqNum) {
        assert!(snd_max.is_after_or_eq(snd_una), "snd_max {} is before snd_una {}", snd_max, snd_una);

        self.high_acked = snd_una.prev().initial_abs();
        self.high_data = snd_max.prev().unwrap_near(self.high_acked);
        self.high_retransmitted = self.high_acked;
        self.regions.clear();
        self.recovery_point = None;
        self.pipe = self.high_data - self.high_acked;
    }

    fn abs(&self, seq: SeqNum) -> u64 {
        seq.unwrap_near(self.high_acked)
    }

    pub fn high_acked(&self) -> SeqNum {
        SeqNum::from_abs(self.high_acked)
    }

    pub fn high_data(&self) -> SeqNum {
        SeqNum::from_abs(self.high_data)
    }

    pub fn high_retransmitted(&self) -> SeqNum {
        SeqNum::from_abs(self.high_retransmitted)
    }

    /// the number of bytes in flight as of the last [SackScoreboard::compute_pipe]
    pub fn pipe(&self) -> u64 {
        self.pipe
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> impl Iterator<Item = RegionInfo> + '_ {
        let mut hole_start = self.high_acked + 1;
        self.regions.iter()
            .map(move |(&end, region)| {
                let result = RegionInfo {
                    hole_start: SeqNum::from_abs(hole_start),
                    block_start: SeqNum::from_abs(end - region.len),
                    block_end: SeqNum::from_abs(end),
                    dup_count: region.dup_count,
                    lost: region.lost,
                };
                hole_start = end;
                result
            })
    }

    pub fn is_sacked(&self, seq: SeqNum) -> bool {
        let abs = self.abs(seq);
        self.regions.range(abs+1..).next()
            .map(|(&end, region)| abs >= end - region.len)
            .unwrap_or(false)
    }

    /// true iff the byte lies in a hole that is classified as lost
    pub fn is_lost(&self, seq: SeqNum) -> bool {
        let abs = self.abs(seq);
        if abs <= self.high_acked {
            return false;
        }
        self.regions.range(abs+1..).next()
            .map(|(&end, region)| region.lost && abs < end - region.len)
            .unwrap_or(false)
    }

    pub fn record_sent(&mut self, seq: SeqNum, len: u32) {
        if len == 0 {
            return;
        }
        let last = self.abs(seq) + u64::from(len) - 1;
        if last > self.high_data {
            self.high_data = last;
        }
    }

    /// Records a SACK block `[start, end)` that arrived in an ACK.
    ///
    /// Returns true iff the block was recorded. Blocks at or below the cumulative ack (D-SACK
    ///  blocks) and empty blocks are ignored, blocks reaching beyond the highest byte sent are
    ///  clipped.
    ///
    /// If recording the block would exceed the maximum number of regions, adjacent SACKed
    ///  blocks without a hole between them are coalesced (keeping the higher duplicate count).
    ///  If that is not enough, the block is rejected and the scoreboard is left unchanged.
    #[instrument(level = "trace", skip(self))]
    pub fn record_duplicate_sack(&mut self, start: SeqNum, end: SeqNum) -> bool {
        let block_len = end.distance_from(start);
        if block_len == 0 || !end.is_after(start) {
            trace!("ignoring empty or inverted SACK block");
            return false;
        }

        let s = max(self.abs(start), self.high_acked + 1);
        let e = min(self.abs(start) + u64::from(block_len), self.high_data + 1);
        if s >= e {
            trace!("SACK block is not in the range of outstanding data - ignoring");
            return false;
        }

        // collect the affected regions, split into holes and blocks
        let mut hole_start = self.regions.range(..=s).next_back()
            .map(|(&k, _)| k)
            .unwrap_or(self.high_acked + 1);

        let mut affected_keys = Vec::new();
        let mut pieces = Vec::new();
        for (&key, region) in self.regions.range(s+1..) {
            if hole_start >= e {
                break;
            }
            let block_start = key - region.len;
            if block_start > hole_start {
                pieces.push(Piece::Hole { start: hole_start, end: block_start, lost: region.lost });
            }
            pieces.push(Piece::Block { start: block_start, end: key, dup_count: region.dup_count });
            affected_keys.push(key);
            hole_start = key;
        }
        if hole_start < e {
            pieces.push(Piece::Hole { start: hole_start, end: self.high_data + 1, lost: false });
        }

        // cut the pieces at the new block's boundaries, marking the covered parts
        let mut cut = Vec::with_capacity(pieces.len() + 2);
        for piece in pieces {
            let (a, b) = piece.bounds();
            if a < min(b, s) {
                cut.push(piece.with_bounds(a, min(b, s)));
            }
            if max(a, s) < min(b, e) {
                cut.push(piece.with_bounds(max(a, s), min(b, e)).covered());
            }
            if max(a, e) < b {
                cut.push(piece.with_bounds(max(a, e), b));
            }
        }

        let new_regions = Self::regions_from_pieces(&cut);

        let max_regions = self.config.max_gap_count;
        let num_untouched = self.regions.len() - affected_keys.len();
        if num_untouched + new_regions.len() <= max_regions {
            for key in affected_keys {
                self.regions.remove(&key);
            }
            self.regions.extend(new_regions);
        }
        else {
            let mut all = self.regions.iter()
                .filter(|(k, _)| !affected_keys.contains(*k))
                .map(|(&k, &r)| (k, r))
                .chain(new_regions)
                .collect::<Vec<_>>();
            all.sort_by_key(|(k, _)| *k);

            Self::coalesce(&mut all, max_regions);
            if all.len() > max_regions {
                warn!("SACK scoreboard at capacity ({} regions) - dropping SACK block [{}, {})", max_regions, start, end);
                return false;
            }
            self.regions = all.into_iter().collect();
        }

        self.recompute_lost_flags(self.config.mss);
        true
    }

    /// Hole pieces are accumulated into the next block piece's region. A trailing hole is the
    ///  un-SACKed tail of the outstanding data and does not become a region.
    fn regions_from_pieces(pieces: &[Piece]) -> Vec<(u64, SackRegion)> {
        let mut result = Vec::new();
        let mut pending_lost = false;
        for piece in pieces {
            match *piece {
                Piece::Hole { lost, .. } => {
                    pending_lost |= lost;
                }
                Piece::Block { start, end, dup_count } => {
                    result.push((end, SackRegion {
                        len: end - start,
                        dup_count,
                        sacked_above_bytes: 0,
                        lost: pending_lost,
                    }));
                    pending_lost = false;
                }
            }
        }
        result
    }

    /// Merges adjacent regions whose later region has no hole, until there are at most
    ///  `max_regions` of them or no more candidates
    fn coalesce(regions: &mut Vec<(u64, SackRegion)>, max_regions: usize) {
        let mut i = 1;
        while regions.len() > max_regions && i < regions.len() {
            let (prev_end, prev) = regions[i-1];
            let (end, region) = regions[i];
            if end - region.len == prev_end {
                debug!("coalescing SACKed blocks ending at {} and {}", prev_end, end);
                regions[i-1] = (end, SackRegion {
                    len: prev.len + region.len,
                    dup_count: max(prev.dup_count, region.dup_count),
                    sacked_above_bytes: 0,
                    lost: prev.lost,
                });
                regions.remove(i);
            }
            else {
                i += 1;
            }
        }
    }

    /// Walks the regions from highest to lowest, updating the bytes SACKed above each region
    ///  and marking non-empty holes as lost based on the duplicate threshold
    pub fn recompute_lost_flags(&mut self, mss: u32) {
        let dup_threshold = self.config.dup_threshold;
        let lost_threshold_bytes = u64::from(dup_threshold) * u64::from(mss);

        let num_regions = self.regions.len();
        let hole_starts = std::iter::once(self.high_acked + 1)
            .chain(self.regions.keys().copied())
            .take(num_regions)
            .collect::<Vec<_>>();

        let mut sacked_above = 0;
        for ((&end, region), &hole_start) in self.regions.iter_mut().rev().zip(hole_starts.iter().rev()) {
            sacked_above += region.len;
            region.sacked_above_bytes = sacked_above;

            let has_hole = end - region.len > hole_start;
            if has_hole && !region.lost && (region.dup_count >= dup_threshold || sacked_above >= lost_threshold_bytes) {
                trace!("marking hole below {} as lost: {} duplicate SACKs, {} bytes SACKed above", SeqNum::from_abs(end - region.len), region.dup_count, sacked_above);
                region.lost = true;
            }
        }
    }

    /// RFC 3517 SetPipe: every un-SACKed byte between the cumulative ack and the highest byte
    ///  sent counts as in flight unless it is lost, and counts once more if it was
    ///  retransmitted.
    pub fn compute_pipe(&mut self) -> u64 {
        let mut pipe = 0;
        let mut hole_start = self.high_acked + 1;
        for (&end, region) in &self.regions {
            pipe += self.hole_pipe(hole_start, end - region.len, region.lost);
            hole_start = end;
        }
        pipe += self.hole_pipe(hole_start, self.high_data + 1, false);

        self.pipe = pipe;
        pipe
    }

    fn hole_pipe(&self, start: u64, end: u64, lost: bool) -> u64 {
        if start >= end {
            return 0;
        }
        let original = if lost { 0 } else { end - start };
        let retransmitted = min(end, self.high_retransmitted + 1).saturating_sub(start);
        original + retransmitted
    }

    /// Iterates the un-SACKed runs `(start, end, lost)`, including the tail above the highest
    ///  SACKed byte
    fn holes(&self) -> impl Iterator<Item = (u64, u64, bool)> + '_ {
        let mut hole_start = self.high_acked + 1;
        self.regions.iter()
            .map(move |(&end, region)| {
                let result = (hole_start, end - region.len, region.lost);
                hole_start = end;
                result
            })
            .chain(std::iter::once((
                self.regions.last_key_value().map(|(&k, _)| k).unwrap_or(self.high_acked + 1),
                self.high_data + 1,
                false,
            )))
            .filter(|(start, end, _)| start < end)
    }

    /// Returns the start of the next segment to retransmit, and the end of the un-SACKed run it
    ///  belongs to
    fn next_segment(&self) -> Option<(u64, u64)> {
        let above = self.high_retransmitted + 1;

        // Rule 1: the lowest lost byte that was not retransmitted yet
        for (start, end, lost) in self.holes() {
            if lost && end > above {
                return Some((max(start, above), end));
            }
        }

        // Rule 2: the lowest un-SACKed byte above everything acked or retransmitted
        if self.high_retransmitted < self.high_data {
            let above = max(self.high_acked, self.high_retransmitted) + 1;
            for (start, end, _) in self.holes() {
                if end > above {
                    return Some((max(start, above), end));
                }
            }
        }
        None
    }

    pub fn next_segment_to_retransmit(&self) -> Option<SeqNum> {
        self.next_segment()
            .map(|(start, _)| SeqNum::from_abs(start))
    }

    /// Retransmits segments of at most `mss` bytes while the congestion window leaves room for
    ///  a full segment above the current pipe. Returns the number of bytes sent.
    #[instrument(level = "debug", skip(self, sender))]
    pub fn send_unacked_segment(&mut self, window: u32, mss: u32, sender: &mut dyn SegmentSender) -> u64 {
        assert!(mss > 0);

        let mut bytes_sent = 0;
        loop {
            let pipe = self.compute_pipe();
            if u64::from(window).saturating_sub(pipe) < u64::from(mss) {
                break;
            }
            let Some((start, run_end)) = self.next_segment() else {
                trace!("nothing to retransmit");
                break;
            };

            let len: u32 = min(u64::from(mss), run_end - start).prechecked_cast();
            trace!("retransmitting {} bytes at {}", len, SeqNum::from_abs(start));
            sender.send_segment(SeqNum::from_abs(start), len);

            self.high_retransmitted = max(self.high_retransmitted, start + u64::from(len) - 1);
            bytes_sent += u64::from(len);
        }
        self.compute_pipe();
        bytes_sent
    }

    /// Advances the cumulative ack to `snd_una`, discarding all scoreboard information up to
    ///  it. Cumulative acks that are not ahead of the current one are ignored.
    pub fn discard_up_to(&mut self, snd_una: SeqNum) {
        let new_high_acked = self.abs(snd_una.prev());
        if new_high_acked <= self.high_acked {
            return;
        }
        trace!("discarding scoreboard up to {}", snd_una);

        let mut kept = self.regions.split_off(&(new_high_acked + 2));
        if let Some((&end, region)) = kept.iter_mut().next() {
            region.len = min(region.len, end - (new_high_acked + 1));
        }
        self.regions = kept;

        self.high_acked = new_high_acked;
        self.high_retransmitted = max(self.high_retransmitted, new_high_acked);
        self.high_data = max(self.high_data, new_high_acked);
        self.recompute_lost_flags(self.config.mss);
    }

    pub fn enter_recovery(&mut self) {
        debug!("entering loss recovery, recovery point {}", SeqNum::from_abs(self.high_data));
        self.recovery_point = Some(self.high_data);
    }

    pub fn leave_recovery(&mut self) {
        debug!("leaving loss recovery");
        self.recovery_point = None;
    }

    pub fn recovery_point(&self) -> Option<SeqNum> {
        self.recovery_point
            .map(SeqNum::from_abs)
    }

    pub fn is_in_recovery(&self) -> bool {
        self.recovery_point.is_some()
    }

    /// diagnostic invariant check - not part of regular operation
    pub fn check(&self) -> anyhow::Result<()> {
        if !(self.high_acked <= self.high_retransmitted && self.high_retransmitted <= self.high_data) {
            bail!("pointers out of order: high_acked {}, high_retransmitted {}, high_data {}", self.high_acked, self.high_retransmitted, self.high_data);
        }
        if self.regions.len() > self.config.max_gap_count {
            bail!("{} regions exceed the maximum of {}", self.regions.len(), self.config.max_gap_count);
        }
        let mut hole_start = self.high_acked + 1;
        for (&end, region) in &self.regions {
            if region.len == 0 || end - region.len < hole_start {
                bail!("region ending at {} with length {} overlaps its predecessor", end, region.len);
            }
            if end > self.high_data + 1 {
                bail!("region ending at {} is beyond high_data {}", end, self.high_data);
            }
            hole_start = end;
        }
        Ok(())
    }
}
