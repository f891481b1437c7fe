use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::seq_num::SeqNum;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TcpOptionKind {
    EndOfOptions = 0,
    Nop = 1,
    Mss = 2,
    WindowScale = 3,
    SackPermitted = 4,
    Sack = 5,
    Timestamps = 8,
}

/// A SACK block as it is on the wire: `right_edge` is the first sequence number *after* the
///  block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SackBlock {
    pub left_edge: SeqNum,
    pub right_edge: SeqNum,
}
impl SackBlock {
    pub fn new(left_edge: SeqNum, right_edge: SeqNum) -> SackBlock {
        SackBlock { left_edge, right_edge }
    }

    pub fn len(&self) -> u32 {
        self.right_edge.distance_from(self.left_edge)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        seq.is_after_or_eq(self.left_edge) && seq.is_before(self.right_edge)
    }

    /// true iff `other` lies completely inside this block
    pub fn covers(&self, other: &SackBlock) -> bool {
        other.left_edge.is_after_or_eq(self.left_edge) && other.right_edge.is_before_or_eq(self.right_edge)
    }
}

/// TCP SACK option (RFC 2018):
///
/// ```ascii
/// 0: kind (u8) = 5
/// 1: length (u8) = 2 + 8*n
/// 2: (repeated n times) left edge (u32), right edge (u32)
/// ```
///
/// The option carries between 1 and 4 blocks - 4 blocks use up 34 of the 40 bytes of TCP option
///  space, leaving room for the two NOP bytes used for 32-bit alignment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SackOption {
    pub blocks: Vec<SackBlock>,
}

impl SackOption {
    pub const MAX_BLOCKS: usize = 4;
    const HEADER_LEN: usize = 2;
    const BLOCK_LEN: usize = 8;

    /// Space required for an option with the given number of blocks, including two NOPs for
    ///  alignment
    pub fn aligned_len(num_blocks: usize) -> usize {
        2 + Self::HEADER_LEN + Self::BLOCK_LEN * num_blocks
    }

    /// The maximum number of blocks that fit into `available_space` bytes (aligned)
    pub fn max_blocks_for(available_space: usize) -> usize {
        if available_space < Self::aligned_len(1) {
            return 0;
        }
        ((available_space - Self::aligned_len(0)) / Self::BLOCK_LEN).min(Self::MAX_BLOCKS)
    }

    /// Writes the option, preceded by two NOP bytes
    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!((1..=Self::MAX_BLOCKS).contains(&self.blocks.len()), "a SACK option has 1 to 4 blocks");

        buf.put_u8(TcpOptionKind::Nop.into());
        buf.put_u8(TcpOptionKind::Nop.into());
        buf.put_u8(TcpOptionKind::Sack.into());
        buf.put_u8((Self::HEADER_LEN + Self::BLOCK_LEN * self.blocks.len()).prechecked_cast());
        for block in &self.blocks {
            buf.put_u32(block.left_edge.to_raw());
            buf.put_u32(block.right_edge.to_raw());
        }
    }

    /// Reads a SACK option starting at its kind byte (i.e. after any NOP padding)
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SackOption> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("buffer underflow reading SACK option header");
        }
        let raw_kind = buf.get_u8();
        let kind = TcpOptionKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown TCP option kind {}", raw_kind))?;
        if kind != TcpOptionKind::Sack {
            bail!("expected a SACK option, was {:?}", kind);
        }

        let len: usize = buf.get_u8().safe_cast();
        if len < Self::HEADER_LEN || (len - Self::HEADER_LEN) % Self::BLOCK_LEN != 0 {
            bail!("invalid SACK option length {}", len);
        }
        let num_blocks = (len - Self::HEADER_LEN) / Self::BLOCK_LEN;
        if num_blocks == 0 || num_blocks > Self::MAX_BLOCKS {
            bail!("SACK option with {} blocks", num_blocks);
        }
        if buf.remaining() < len - Self::HEADER_LEN {
            bail!("SACK option length {} exceeds the remaining buffer", len);
        }

        let blocks = (0..num_blocks)
            .map(|_| {
                let left_edge = SeqNum::from_raw(buf.get_u32());
                let right_edge = SeqNum::from_raw(buf.get_u32());
                SackBlock { left_edge, right_edge }
            })
            .collect();
        Ok(SackOption { blocks })
    }
}

/// The SACK-permitted option (kind 4, length 2), sent in SYN segments
pub struct SackPermittedOption;
impl SackPermittedOption {
    pub const LEN: usize = 2;

    pub fn ser(buf: &mut impl BufMut) {
        buf.put_u8(TcpOptionKind::SackPermitted.into());
        buf.put_u8(Self::LEN.prechecked_cast());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<()> {
        if buf.remaining() < Self::LEN {
            bail!("buffer underflow reading SACK-permitted option");
        }
        let kind = buf.get_u8();
        let len: usize = buf.get_u8().safe_cast();
        if kind != u8::from(TcpOptionKind::SackPermitted) || len != Self::LEN {
            bail!("invalid SACK-permitted option: kind {}, length {}", kind, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn block(left: u32, right: u32) -> SackBlock {
        SackBlock::new(SeqNum::from_raw(left), SeqNum::from_raw(right))
    }

    #[rstest]
    #[case::single(vec![block(10, 20)], vec![1,1, 5,10, 0,0,0,10, 0,0,0,20])]
    #[case::two(vec![block(1, 2), block(0x01020304, 0x05060708)], vec![1,1, 5,18, 0,0,0,1, 0,0,0,2, 1,2,3,4, 5,6,7,8])]
    #[case::wrapped(vec![block(u32::MAX, 3)], vec![1,1, 5,10, 255,255,255,255, 0,0,0,3])]
    fn test_ser(#[case] blocks: Vec<SackBlock>, #[case] expected: Vec<u8>) {
        let option = SackOption { blocks };
        let mut buf = BytesMut::new();
        option.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), SackOption::aligned_len(option.blocks.len()));

        let mut b: &[u8] = &expected[2..];
        assert_eq!(SackOption::deser(&mut b).unwrap(), option);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::only_kind(vec![5])]
    #[case::wrong_kind(vec![4, 2])]
    #[case::unknown_kind(vec![99, 10, 0,0,0,1, 0,0,0,2])]
    #[case::no_blocks(vec![5, 2])]
    #[case::misaligned_len(vec![5, 9, 0,0,0,1, 0,0,0,2, 0])]
    #[case::too_many_blocks(vec![5, 42, 0,0,0,1, 0,0,0,2, 0,0,0,1, 0,0,0,2, 0,0,0,1, 0,0,0,2, 0,0,0,1, 0,0,0,2, 0,0,0,1, 0,0,0,2])]
    #[case::truncated(vec![5, 18, 0,0,0,1, 0,0,0,2, 0,0,0,1])]
    #[case::len_below_header(vec![5, 1])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(SackOption::deser(&mut b).is_err());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(11, 0)]
    #[case(12, 1)]
    #[case(19, 1)]
    #[case(20, 2)]
    #[case(36, 4)]
    #[case(40, 4)]
    fn test_max_blocks_for(#[case] available_space: usize, #[case] expected: usize) {
        assert_eq!(SackOption::max_blocks_for(available_space), expected);
    }

    #[test]
    fn test_sack_permitted() {
        let mut buf = BytesMut::new();
        SackPermittedOption::ser(&mut buf);
        assert_eq!(buf.as_ref(), &[4, 2]);

        let mut b: &[u8] = &buf;
        SackPermittedOption::deser(&mut b).unwrap();

        let mut b: &[u8] = &[4, 3];
        assert!(SackPermittedOption::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::inside(block(10, 20), block(12, 15), true)]
    #[case::same(block(10, 20), block(10, 20), true)]
    #[case::overlapping(block(10, 20), block(15, 25), false)]
    #[case::across_wrap(block(u32::MAX - 5, 10), block(0, 10), true)]
    fn test_covers(#[case] outer: SackBlock, #[case] inner: SackBlock, #[case] expected: bool) {
        assert_eq!(outer.covers(&inner), expected);
    }
}
