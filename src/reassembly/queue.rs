use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::seq_num::SeqNum;
use bytes::Bytes;
use std::cmp::{max, min};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// A contiguous range of received data, as it is returned by [ReassemblyQueue::extract_up_to]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataRange {
    pub start: SeqNum,
    pub len: u32,
    /// `None` if the queue tracks coverage only, or if any of the merged pieces had no payload
    pub payload: Option<Bytes>,
}

#[derive(Debug, Clone)]
struct StoredRange {
    start: u64,
    payload: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct InsertOutcome {
    pub virtual_start: SeqNum,
    /// false if the range was dropped for capacity reasons
    pub accepted: bool,
    /// `(start, end)` of a range that was evicted to make room, end exclusive
    pub evicted: Option<(SeqNum, SeqNum)>,
}

/// Receive-side reassembly of byte ranges arriving out of order, e.g. from several subflows of
///  a multipath connection.
///
/// Stored ranges are keyed by their (exclusive) end as unwrapped 64-bit positions. They never
///  overlap or touch - inserting a range merges it with all ranges it overlaps or touches.
///
/// `virtual_start` is the highest sequence number up to which all data was received. It never
///  moves backwards.
pub struct ReassemblyQueue {
    ranges: BTreeMap<u64, StoredRange>,
    max_ranges: usize,
    virtual_start: u64,
    /// everything below this position was extracted from the queue
    delivered: u64,
    buffered_bytes: u64,
}

impl ReassemblyQueue {
    pub fn new(start_seq: SeqNum, max_ranges: usize) -> ReassemblyQueue {
        assert!(max_ranges > 0);

        let start = start_seq.initial_abs();
        ReassemblyQueue {
            ranges: Default::default(),
            max_ranges,
            virtual_start: start - 1,
            delivered: start,
            buffered_bytes: 0,
        }
    }

    /// Resets the queue for a new initial sequence number
    pub fn init(&mut self, start_seq: SeqNum) {
        self.clear();
        let start = start_seq.initial_abs();
        self.virtual_start = start - 1;
        self.delivered = start;
    }

    fn abs(&self, seq: SeqNum) -> u64 {
        seq.unwrap_near(self.virtual_start)
    }

    pub fn virtual_start(&self) -> SeqNum {
        SeqNum::from_abs(self.virtual_start)
    }

    /// Inserts `len` bytes starting at `start`, returning the new virtual start
    pub fn insert(&mut self, start: SeqNum, len: u32, payload: Option<Bytes>) -> SeqNum {
        self.insert_range(start, len, payload).virtual_start
    }

    pub(crate) fn insert_range(&mut self, start: SeqNum, len: u32, payload: Option<Bytes>) -> InsertOutcome {
        if let Some(payload) = &payload {
            let expected_len: usize = len.safe_cast();
            assert_eq!(payload.len(), expected_len, "payload length must match the range length");
        }

        if len == 0 {
            trace!("empty range at {} - ignoring", start);
            return self.outcome(true, None);
        }

        let mut s = self.abs(start);
        let e = s + u64::from(len);
        let mut payload = payload;

        if e <= self.delivered {
            trace!("range [{}, +{}) was delivered already - ignoring", start, len);
            return self.outcome(true, None);
        }
        if s < self.delivered {
            payload = payload.map(|p| p.slice((self.delivered - s) as usize..));
            s = self.delivered;
        }

        let merged_keys = self.ranges.range(s..)
            .take_while(|(_, r)| r.start <= e)
            .map(|(&k, _)| k)
            .collect::<Vec<_>>();

        let mut evicted = None;
        if merged_keys.is_empty() && self.ranges.len() >= self.max_ranges {
            match self.ranges.last_key_value().map(|(&end, r)| (r.start, end)) {
                Some((highest_start, highest_end)) if s < highest_start => {
                    warn!("reassembly queue at capacity ({} ranges) - evicting [{}, {}) to make room", self.max_ranges, SeqNum::from_abs(highest_start), SeqNum::from_abs(highest_end));
                    self.ranges.remove(&highest_end);
                    self.buffered_bytes -= highest_end - highest_start;
                    evicted = Some((SeqNum::from_abs(highest_start), SeqNum::from_abs(highest_end)));
                }
                _ => {
                    warn!("reassembly queue at capacity ({} ranges) - dropping [{}, +{})", self.max_ranges, start, len);
                    return self.outcome(false, None);
                }
            }
        }

        let mut new_start = s;
        let mut new_end = e;
        let mut pieces = Vec::with_capacity(merged_keys.len() + 1);
        pieces.push((s, payload));
        for key in merged_keys {
            if let Some(r) = self.ranges.remove(&key) {
                self.buffered_bytes -= key - r.start;
                new_start = min(new_start, r.start);
                new_end = max(new_end, key);
                pieces.push((r.start, r.payload));
            }
        }

        let merged_payload = Self::stitch(new_start, new_end, pieces);
        self.ranges.insert(new_end, StoredRange { start: new_start, payload: merged_payload });
        self.buffered_bytes += new_end - new_start;

        if let Some((&end, r)) = self.ranges.range(self.virtual_start + 2..).next() {
            if r.start <= self.virtual_start + 1 {
                trace!("virtual start advances to {}", SeqNum::from_abs(end - 1));
                self.virtual_start = end - 1;
            }
        }

        self.outcome(true, evicted)
    }

    fn outcome(&self, accepted: bool, evicted: Option<(SeqNum, SeqNum)>) -> InsertOutcome {
        InsertOutcome {
            virtual_start: self.virtual_start(),
            accepted,
            evicted,
        }
    }

    /// Combines the payloads of merged pieces. Overlapping parts are taken from whichever piece
    ///  comes last - retransmitted data is identical to the original.
    fn stitch(start: u64, end: u64, pieces: Vec<(u64, Option<Bytes>)>) -> Option<Bytes> {
        if pieces.len() == 1 {
            return pieces.into_iter().next().and_then(|(_, p)| p);
        }
        if pieces.iter().any(|(_, p)| p.is_none()) {
            return None;
        }

        let mut buf = vec![0u8; (end - start) as usize];
        for (piece_start, payload) in pieces {
            if let Some(payload) = payload {
                let offs = (piece_start - start) as usize;
                buf[offs..offs + payload.len()].copy_from_slice(&payload);
            }
        }
        Some(Bytes::from(buf))
    }

    /// Removes and returns the lowest stored range if it starts at or before `seq`.
    ///
    /// Callers drain in-order data by passing the virtual start. Extracting beyond it gives up
    ///  on the data missing below the extracted range.
    pub fn extract_up_to(&mut self, seq: SeqNum) -> Option<DataRange> {
        let limit = self.abs(seq);
        if self.ranges.first_key_value()?.1.start > limit {
            return None;
        }
        let (end, range) = self.ranges.pop_first()?;
        let start = range.start;

        self.buffered_bytes -= end - start;
        self.delivered = max(self.delivered, end);
        if end - 1 > self.virtual_start {
            debug!("extracting beyond the virtual start - skipping to {}", SeqNum::from_abs(end - 1));
            self.virtual_start = end - 1;
        }

        Some(DataRange {
            start: SeqNum::from_abs(start),
            len: (end - start).prechecked_cast(),
            payload: range.payload,
        })
    }

    /// The span of sequence space from the lowest buffered byte to the highest
    pub fn occupied_memory(&self) -> u64 {
        match (self.ranges.first_key_value(), self.ranges.last_key_value()) {
            (Some((_, first)), Some((&last_end, _))) => last_end - first.start,
            _ => 0,
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub fn free_bytes(&self, max_buffer: u64) -> u64 {
        max_buffer.saturating_sub(self.occupied_memory())
    }

    /// number of stored ranges
    pub fn length(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The stored range containing `seq`, as `(start, end)` with `end` exclusive
    pub fn enclosing_range(&self, seq: SeqNum) -> Option<(SeqNum, SeqNum)> {
        let abs = self.abs(seq);
        self.ranges.range(abs+1..).next()
            .filter(|(_, r)| r.start <= abs)
            .map(|(&end, r)| (SeqNum::from_abs(r.start), SeqNum::from_abs(end)))
    }

    pub fn left_edge(&self, seq: SeqNum) -> Option<SeqNum> {
        self.enclosing_range(seq)
            .map(|(start, _)| start)
    }

    /// exclusive
    pub fn right_edge(&self, seq: SeqNum) -> Option<SeqNum> {
        self.enclosing_range(seq)
            .map(|(_, end)| end)
    }

    /// true iff all of `[start, start+len)` was received, i.e. it is buffered or was extracted
    pub fn is_received(&self, start: SeqNum, len: u32) -> bool {
        let s = self.abs(start);
        let e = s + u64::from(len);
        if e <= self.virtual_start + 1 {
            return true;
        }
        self.ranges.range(s+1..).next()
            .map(|(&end, r)| r.start <= s && e <= end)
            .unwrap_or(false)
    }

    /// Iterates the stored ranges as `(start, end)` pairs in sequence order, `end` exclusive
    pub fn ranges(&self) -> impl Iterator<Item = (SeqNum, SeqNum)> + '_ {
        self.ranges.iter()
            .map(|(&end, r)| (SeqNum::from_abs(r.start), SeqNum::from_abs(end)))
    }

    /// Drops all buffered data. The virtual start is unaffected.
    pub fn clear(&mut self) {
        if !self.ranges.is_empty() {
            warn!("discarding {} buffered bytes in {} ranges that were not delivered", self.buffered_bytes, self.ranges.len());
            for (&end, r) in &self.ranges {
                debug!("  pending: [{}, {})", SeqNum::from_abs(r.start), SeqNum::from_abs(end));
            }
        }
        self.ranges.clear();
        self.buffered_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    fn s(raw: u32) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    fn ranges(queue: &ReassemblyQueue) -> Vec<(u32, u32)> {
        queue.ranges()
            .map(|(a, b)| (a.to_raw(), b.to_raw()))
            .collect()
    }

    #[test]
    fn test_gap_keeps_virtual_start() {
        let mut queue = ReassemblyQueue::new(s(100), 16);
        assert_eq!(queue.virtual_start(), s(99));

        assert_eq!(queue.insert(s(110), 10, None), s(99));
        assert_eq!(queue.insert(s(100), 10, None), s(119));
        assert_eq!(queue.insert(s(130), 5, None), s(119));

        assert_eq!(queue.buffered_bytes(), 25);
        assert_eq!(queue.occupied_memory(), 35);
        assert_eq!(queue.length(), 2);
        assert_eq!(ranges(&queue), vec![(100, 120), (130, 135)]);

        assert_eq!(queue.insert(s(125), 5, None), s(119));
        assert_eq!(queue.insert(s(120), 5, None), s(134));
        assert_eq!(ranges(&queue), vec![(100, 135)]);
        assert_eq!(queue.buffered_bytes(), 35);
    }

    #[rstest]
    #[case::overlapping(vec![(100, 10), (105, 10)], vec![(100, 115)], 15)]
    #[case::touching(vec![(100, 10), (110, 10)], vec![(100, 120)], 20)]
    #[case::contained(vec![(100, 10), (102, 3)], vec![(100, 110)], 10)]
    #[case::covering(vec![(102, 3), (108, 1), (100, 10)], vec![(100, 110)], 10)]
    #[case::disjoint(vec![(102, 3), (108, 1)], vec![(102, 105), (108, 109)], 7)]
    fn test_merge(#[case] inserts: Vec<(u32, u32)>, #[case] expected: Vec<(u32, u32)>, #[case] expected_occupied: u64) {
        let mut queue = ReassemblyQueue::new(s(100), 16);
        for (start, len) in inserts {
            queue.insert(s(start), len, None);
        }
        assert_eq!(ranges(&queue), expected);

        let expected_buffered: u32 = expected.iter().map(|(a, b)| b - a).sum();
        assert_eq!(queue.buffered_bytes(), u64::from(expected_buffered));
        assert_eq!(queue.occupied_memory(), expected_occupied);
        assert_eq!(queue.free_bytes(100), 100 - expected_occupied);
        assert_eq!(queue.free_bytes(5), 0);
    }

    #[test]
    fn test_payload_stitching() {
        let mut queue = ReassemblyQueue::new(s(0), 16);
        queue.insert(s(4), 4, Some(Bytes::from_static(b"efgh")));
        queue.insert(s(0), 6, Some(Bytes::from_static(b"abcdef")));

        let range = queue.extract_up_to(queue.virtual_start()).unwrap();
        assert_eq!(range, DataRange { start: s(0), len: 8, payload: Some(Bytes::from_static(b"abcdefgh")) });
        assert!(queue.extract_up_to(queue.virtual_start()).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_payload_dropped_when_a_piece_has_none() {
        let mut queue = ReassemblyQueue::new(s(0), 16);
        queue.insert(s(0), 4, Some(Bytes::from_static(b"abcd")));
        queue.insert(s(4), 4, None);

        let range = queue.extract_up_to(s(7)).unwrap();
        assert_eq!(range.len, 8);
        assert_eq!(range.payload, None);
    }

    #[test]
    fn test_extracted_data_is_clipped() {
        let mut queue = ReassemblyQueue::new(s(0), 16);
        queue.insert(s(0), 4, Some(Bytes::from_static(b"abcd")));
        queue.extract_up_to(s(3)).unwrap();

        assert_eq!(queue.insert(s(0), 4, Some(Bytes::from_static(b"abcd"))), s(3));
        assert!(queue.is_empty());

        queue.insert(s(2), 4, Some(Bytes::from_static(b"cdef")));
        let range = queue.extract_up_to(s(5)).unwrap();
        assert_eq!(range, DataRange { start: s(4), len: 2, payload: Some(Bytes::from_static(b"ef")) });
    }

    #[test]
    fn test_extract_up_to() {
        let mut queue = ReassemblyQueue::new(s(100), 16);
        queue.insert(s(100), 10, None);
        queue.insert(s(130), 5, None);

        assert!(queue.extract_up_to(s(99)).is_none());
        assert_eq!(queue.extract_up_to(s(100)).map(|r| (r.start, r.len)), Some((s(100), 10)));
        assert!(queue.extract_up_to(s(109)).is_none());
        assert_eq!(queue.buffered_bytes(), 5);
        assert_eq!(queue.virtual_start(), s(109));
    }

    #[test]
    fn test_edges() {
        let mut queue = ReassemblyQueue::new(s(100), 16);
        queue.insert(s(120), 10, None);

        assert_eq!(queue.left_edge(s(125)), Some(s(120)));
        assert_eq!(queue.right_edge(s(125)), Some(s(130)));
        assert_eq!(queue.enclosing_range(s(130)), None);
        assert_eq!(queue.enclosing_range(s(119)), None);

        assert!(queue.is_received(s(120), 10));
        assert!(queue.is_received(s(90), 10));
        assert!(!queue.is_received(s(115), 10));
    }

    #[rstest]
    #[case::evict_highest(105, vec![(100, 101), (105, 106), (110, 111)], Some((120, 121)))]
    #[case::drop_new(130, vec![(100, 101), (110, 111), (120, 121)], None)]
    fn test_capacity(#[case] new_start: u32, #[case] expected: Vec<(u32, u32)>, #[case] expected_evicted: Option<(u32, u32)>) {
        let mut queue = ReassemblyQueue::new(s(90), 3);
        for start in [100, 110, 120] {
            queue.insert(s(start), 1, None);
        }

        let outcome = queue.insert_range(s(new_start), 1, None);
        assert_eq!(outcome.accepted, expected_evicted.is_some());
        assert_eq!(outcome.evicted, expected_evicted.map(|(a, b)| (s(a), s(b))));
        assert_eq!(ranges(&queue), expected);
        assert_eq!(queue.length(), 3);
        assert_eq!(queue.buffered_bytes(), 3);
    }

    #[test]
    fn test_merge_at_capacity() {
        let mut queue = ReassemblyQueue::new(s(90), 2);
        queue.insert(s(100), 1, None);
        queue.insert(s(110), 1, None);

        assert!(queue.insert_range(s(101), 9, None).accepted);
        assert_eq!(ranges(&queue), vec![(100, 111)]);
    }

    #[test]
    fn test_empty_ranges_are_not_stored() {
        let mut queue = ReassemblyQueue::new(s(100), 2);
        assert_eq!(queue.insert(s(200), 0, None), s(99));
        assert_eq!(queue.insert(s(300), 0, Some(Bytes::new())), s(99));
        assert_eq!(queue.length(), 0);
        assert_eq!(queue.occupied_memory(), 0);

        assert!(queue.insert_range(s(400), 10, None).accepted);
        assert!(queue.insert_range(s(500), 10, None).accepted);
        assert_eq!(ranges(&queue), vec![(400, 410), (500, 510)]);
        assert_eq!(queue.buffered_bytes(), 20);
    }

    #[test]
    fn test_across_wrap() {
        let mut queue = ReassemblyQueue::new(s(u32::MAX - 9), 16);
        queue.insert(s(5), 5, None);
        assert_eq!(queue.insert(s(u32::MAX - 9), 15, None), s(9));
        assert_eq!(ranges(&queue), vec![(u32::MAX - 9, 10)]);
    }

    #[test]
    fn test_clear() {
        let mut queue = ReassemblyQueue::new(s(100), 16);
        queue.insert(s(100), 10, None);
        queue.insert(s(130), 5, None);
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.buffered_bytes(), 0);
        assert_eq!(queue.virtual_start(), s(109));

        queue.init(s(5000));
        assert_eq!(queue.virtual_start(), s(4999));
    }

    #[rstest]
    #[case(1000, 11)]
    #[case(u32::MAX - 500, 12)]
    fn test_virtual_start_is_monotonic(#[case] initial: u32, #[case] seed: u64) {
        let mut rand = StdRng::seed_from_u64(seed);
        let mut queue = ReassemblyQueue::new(s(initial), 8);
        let mut received = vec![false; 2000];

        let mut prev_virtual_start = queue.virtual_start();
        for _ in 0..2000 {
            let offs = rand.gen_range(0..1990u32);
            let len = rand.gen_range(1..10u32);
            let outcome = queue.insert_range(s(initial) + offs, len, None);
            if let Some((evicted_start, evicted_end)) = outcome.evicted {
                for i in evicted_start.distance_from(s(initial))..evicted_end.distance_from(s(initial)) {
                    received[i as usize] = false;
                }
            }
            if outcome.accepted {
                for i in offs..offs + len {
                    received[i as usize] = true;
                }
            }

            let virtual_start = queue.virtual_start();
            assert!(virtual_start.is_after_or_eq(prev_virtual_start));
            prev_virtual_start = virtual_start;

            let contiguous = received.iter().take_while(|r| **r).count() as u32;
            assert_eq!(virtual_start, s(initial) + contiguous - 1);
            assert!(queue.length() <= 8);
        }
    }
}
