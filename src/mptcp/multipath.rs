use crate::config::SackConfig;
use crate::reassembly::queue::ReassemblyQueue;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::seq_num::SeqNum;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubflowId(pub u32);

impl Display for SubflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SubflowStats {
    pub segments: u64,
    pub bytes: u64,
    /// bytes that were received before, on this or another subflow
    pub duplicate_bytes: u64,
}

/// The data-level receiver of a multipath connection. Segments arrive on several subflows,
///  each carrying a range of the connection-level data sequence space, and are reassembled
///  into a single in-order byte stream.
pub struct MultipathReceiver {
    config: Arc<SackConfig>,
    subflows: FxHashMap<SubflowId, SubflowStats>,
    queue: ReassemblyQueue,
}

impl MultipathReceiver {
    pub fn new(config: Arc<SackConfig>, initial_data_seq: SeqNum) -> MultipathReceiver {
        MultipathReceiver {
            queue: ReassemblyQueue::new(initial_data_seq, config.max_gap_count),
            config,
            subflows: Default::default(),
        }
    }

    /// Returns false if the subflow was registered before
    pub fn add_subflow(&mut self, subflow: SubflowId) -> bool {
        if self.subflows.contains_key(&subflow) {
            return false;
        }
        debug!("adding subflow {}", subflow);
        self.subflows.insert(subflow, SubflowStats::default());
        true
    }

    pub fn subflow_stats(&self, subflow: SubflowId) -> Option<&SubflowStats> {
        self.subflows.get(&subflow)
    }

    /// Registers a segment that arrived on a subflow, returning the data-level ack after
    ///  processing it
    pub fn on_subflow_segment(&mut self, subflow: SubflowId, data_seq: SeqNum, payload: Bytes) -> anyhow::Result<SeqNum> {
        let Some(stats) = self.subflows.get_mut(&subflow) else {
            bail!("segment on unknown subflow {}", subflow);
        };
        let payload_len: u64 = payload.len().safe_cast();
        if payload_len > self.config.receive_buffer_size {
            bail!("segment of {} bytes on subflow {} exceeds the receive buffer", payload.len(), subflow);
        }
        if payload.is_empty() {
            return Ok(self.queue.virtual_start().next());
        }

        let len: u32 = payload.len().prechecked_cast();
        let data_ack = self.queue.virtual_start().next();
        let duplicate_bytes = if self.queue.is_received(data_seq, len) {
            len
        }
        else if data_seq.is_before(data_ack) {
            data_ack.distance_from(data_seq).min(len)
        }
        else {
            0
        };

        stats.segments += 1;
        stats.bytes += u64::from(len);
        stats.duplicate_bytes += u64::from(duplicate_bytes);

        trace!("subflow {}: {} bytes at data sequence {}", subflow, len, data_seq);
        let virtual_start = self.queue.insert(data_seq, len, Some(payload));
        Ok(virtual_start.next())
    }

    /// The next data sequence number expected, i.e. everything before it was received
    pub fn data_ack(&self) -> SeqNum {
        self.queue.virtual_start().next()
    }

    /// Returns the next chunk of in-order data, if any
    pub fn read(&mut self) -> Option<Bytes> {
        let range = self.queue.extract_up_to(self.queue.virtual_start())?;
        range.payload
    }

    /// The receive window to advertise: `receive_buffer_size` minus the span from the lowest to
    ///  the highest buffered byte, gaps included. The window is not anchored at [Self::data_ack],
    ///  so it only tells the peer how much more data fits into the buffer, not where that data
    ///  may start.
    pub fn advertised_window(&self) -> u32 {
        self.queue.free_bytes(self.config.receive_buffer_size)
            .min(u64::from(u32::MAX))
            .prechecked_cast()
    }

    /// Discards all buffered data and subflows
    pub fn close(&mut self) {
        debug!("closing multipath receiver with {} subflows", self.subflows.len());
        self.queue.clear();
        self.subflows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    fn receiver(initial: u32) -> MultipathReceiver {
        let mut receiver = MultipathReceiver::new(Arc::new(SackConfig::default_rfc3517()), SeqNum::from_raw(initial));
        receiver.add_subflow(SubflowId(1));
        receiver.add_subflow(SubflowId(2));
        receiver
    }

    fn read_all(receiver: &mut MultipathReceiver) -> Vec<u8> {
        let mut result = Vec::new();
        while let Some(chunk) = receiver.read() {
            result.extend_from_slice(&chunk);
        }
        result
    }

    #[rstest]
    #[case::regular(1000)]
    #[case::wrap(u32::MAX - 3)]
    fn test_interleaved_subflows(#[case] initial: u32) {
        let mut receiver = receiver(initial);
        let seq = |offs: u32| SeqNum::from_raw(initial) + offs;

        assert_eq!(receiver.on_subflow_segment(SubflowId(2), seq(5), Bytes::from_static(b"world")).unwrap(), seq(0));
        assert!(receiver.read().is_none());

        assert_eq!(receiver.on_subflow_segment(SubflowId(1), seq(0), Bytes::from_static(b"hello")).unwrap(), seq(10));
        assert_eq!(receiver.data_ack(), seq(10));
        assert_eq!(read_all(&mut receiver), b"helloworld".to_vec());
        assert!(receiver.read().is_none());

        assert_eq!(receiver.subflow_stats(SubflowId(1)), Some(&SubflowStats { segments: 1, bytes: 5, duplicate_bytes: 0 }));
    }

    #[test]
    fn test_unknown_subflow() {
        let mut receiver = receiver(0);
        assert!(receiver.on_subflow_segment(SubflowId(3), SeqNum::ZERO, Bytes::from_static(b"abc")).is_err());
        assert!(!receiver.add_subflow(SubflowId(1)));
        assert!(receiver.add_subflow(SubflowId(3)));
        assert!(receiver.on_subflow_segment(SubflowId(3), SeqNum::ZERO, Bytes::from_static(b"abc")).is_ok());
    }

    #[test]
    fn test_oversized_segment() {
        let mut config = SackConfig::default_rfc3517();
        config.mss = 100;
        config.receive_buffer_size = 1000;
        let mut receiver = MultipathReceiver::new(Arc::new(config), SeqNum::ZERO);
        receiver.add_subflow(SubflowId(1));

        assert!(receiver.on_subflow_segment(SubflowId(1), SeqNum::ZERO, Bytes::from(vec![0u8; 1001])).is_err());
        assert_eq!(receiver.subflow_stats(SubflowId(1)), Some(&SubflowStats::default()));
    }

    #[test]
    fn test_duplicates_across_subflows() {
        let mut receiver = receiver(1000);
        let seq = SeqNum::from_raw;

        receiver.on_subflow_segment(SubflowId(1), seq(1000), Bytes::from_static(b"abc")).unwrap();
        receiver.on_subflow_segment(SubflowId(2), seq(1000), Bytes::from_static(b"abc")).unwrap();
        receiver.on_subflow_segment(SubflowId(2), seq(1001), Bytes::from_static(b"bcde")).unwrap();

        assert_eq!(receiver.subflow_stats(SubflowId(2)), Some(&SubflowStats { segments: 2, bytes: 7, duplicate_bytes: 5 }));
        assert_eq!(read_all(&mut receiver), b"abcde".to_vec());

        // data that was read already is ignored
        assert_eq!(receiver.on_subflow_segment(SubflowId(1), seq(1000), Bytes::from_static(b"ab")).unwrap(), seq(1005));
        assert!(receiver.read().is_none());
    }

    #[test]
    fn test_advertised_window() {
        let mut receiver = receiver(1000);
        let seq = SeqNum::from_raw;
        assert_eq!(receiver.advertised_window(), 65536);

        receiver.on_subflow_segment(SubflowId(1), seq(1100), Bytes::from(vec![1u8; 10])).unwrap();
        assert_eq!(receiver.advertised_window(), 65526);

        receiver.on_subflow_segment(SubflowId(2), seq(1000), Bytes::from(vec![2u8; 10])).unwrap();
        assert_eq!(receiver.advertised_window(), 65536 - 110);

        assert_eq!(receiver.read().map(|b| b.len()), Some(10));
        // the gap between data_ack and the out-of-order data does not count
        assert_eq!(receiver.data_ack(), seq(1010));
        assert_eq!(receiver.advertised_window(), 65526);

        receiver.close();
        assert_eq!(receiver.advertised_window(), 65536);
        assert!(receiver.subflow_stats(SubflowId(1)).is_none());
    }

    #[rstest]
    #[case(0, 1)]
    #[case(u32::MAX - 500, 2)]
    #[case(12345, 3)]
    fn test_random_arrival_order(#[case] initial: u32, #[case] seed: u64) {
        let mut rand = StdRng::seed_from_u64(seed);
        let data = (0..3000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let mut segments = Vec::new();
        let mut offs = 0;
        while offs < data.len() {
            let len = rand.gen_range(1..100usize).min(data.len() - offs);
            segments.push((offs, len));
            offs += len;
        }

        let mut receiver = receiver(initial);
        let mut received = Vec::new();
        for chunk in segments.chunks(8) {
            let mut chunk = chunk.to_vec();
            // some segments arrive twice, on different subflows
            let duplicates = chunk.iter().filter(|_| rand.gen_bool(0.2)).copied().collect::<Vec<_>>();
            chunk.extend(duplicates);
            chunk.shuffle(&mut rand);

            for (offs, len) in chunk {
                let subflow = SubflowId(rand.gen_range(1..=2));
                let payload = Bytes::copy_from_slice(&data[offs..offs + len]);
                receiver.on_subflow_segment(subflow, SeqNum::from_raw(initial) + offs as u32, payload).unwrap();
            }
            received.extend(read_all(&mut receiver));
        }

        assert_eq!(received, data);
        assert_eq!(receiver.data_ack(), SeqNum::from_raw(initial) + data.len() as u32);
    }
}
