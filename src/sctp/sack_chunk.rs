use crate::ranges::interval_set::Interval;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::seq_num::SeqNum;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ChunkType {
    Sack = 3,
    NrSack = 16,
}

/// A gap ack block, with offsets relative to the cumulative TSN ack (both inclusive)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

/// SCTP SACK chunk (RFC 9260 section 3.3.4) or NR-SACK chunk (non-renegable SACK).
///
/// ```ascii
///  0: chunk type (u8): 3 for SACK, 16 for NR-SACK
///  1: chunk flags (u8), 0
///  2: chunk length (u16), including this header
///  4: cumulative TSN ack (u32)
///  8: advertised receiver window credit (u32)
/// 12: number of gap ack blocks (u16)
///  *: number of NR gap ack blocks (u16) - NR-SACK only
///  *: number of duplicate TSNs (u16)
///  *: reserved (u16) - NR-SACK only
///  *: (repeated) gap ack block start / end offsets (u16 each)
///  *: (repeated) NR gap ack block start / end offsets (u16 each) - NR-SACK only
///  *: (repeated) duplicate TSN (u32)
/// ```
///
/// In a SACK chunk, gap blocks report all received TSNs above the cumulative ack. In an
///  NR-SACK chunk, gap blocks report the revokable and NR gap blocks the non-revokable ones.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SackChunk {
    pub chunk_type: ChunkType,
    pub cumulative_tsn_ack: SeqNum,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<GapAckBlock>,
    pub nr_gap_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<SeqNum>,
}

impl SackChunk {
    const CHUNK_HEADER_LEN: usize = 4;

    fn fixed_len(chunk_type: ChunkType) -> usize {
        match chunk_type {
            ChunkType::Sack => Self::CHUNK_HEADER_LEN + 12,
            ChunkType::NrSack => Self::CHUNK_HEADER_LEN + 16,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::fixed_len(self.chunk_type)
            + 4 * self.gap_blocks.len()
            + 4 * self.nr_gap_blocks.len()
            + 4 * self.duplicate_tsns.len()
    }

    /// Converts gap ack block offsets back to absolute TSN intervals
    pub fn to_intervals(&self, blocks: &[GapAckBlock]) -> Vec<Interval> {
        blocks.iter()
            .map(|b| Interval::new(
                self.cumulative_tsn_ack + b.start as u32,
                self.cumulative_tsn_ack + b.end as u32,
            ))
            .collect()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!(self.chunk_type == ChunkType::NrSack || self.nr_gap_blocks.is_empty(), "NR gap blocks require an NR-SACK chunk");

        buf.put_u8(self.chunk_type.into());
        buf.put_u8(0);
        buf.put_u16(self.serialized_len().prechecked_cast());
        buf.put_u32(self.cumulative_tsn_ack.to_raw());
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.gap_blocks.len().prechecked_cast());
        if self.chunk_type == ChunkType::NrSack {
            buf.put_u16(self.nr_gap_blocks.len().prechecked_cast());
        }
        buf.put_u16(self.duplicate_tsns.len().prechecked_cast());
        if self.chunk_type == ChunkType::NrSack {
            buf.put_u16(0);
        }

        for block in self.gap_blocks.iter().chain(self.nr_gap_blocks.iter()) {
            buf.put_u16(block.start);
            buf.put_u16(block.end);
        }
        for tsn in &self.duplicate_tsns {
            buf.put_u32(tsn.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SackChunk> {
        if buf.remaining() < Self::CHUNK_HEADER_LEN {
            bail!("buffer underflow reading chunk header");
        }
        let raw_type = buf.get_u8();
        let chunk_type = ChunkType::try_from(raw_type)
            .map_err(|_| anyhow!("chunk type {} is not a SACK chunk", raw_type))?;
        let _flags = buf.get_u8();
        let chunk_len: usize = buf.get_u16().safe_cast();

        let body_len = chunk_len.checked_sub(Self::CHUNK_HEADER_LEN)
            .ok_or_else(|| anyhow!("chunk length {} is shorter than the chunk header", chunk_len))?;
        if body_len + Self::CHUNK_HEADER_LEN < Self::fixed_len(chunk_type) {
            bail!("chunk length {} is too short for a {:?} chunk", chunk_len, chunk_type);
        }
        if buf.remaining() < body_len {
            bail!("chunk length {} exceeds the remaining {} bytes", chunk_len, buf.remaining() + Self::CHUNK_HEADER_LEN);
        }

        let cumulative_tsn_ack = SeqNum::from_raw(buf.get_u32());
        let a_rwnd = buf.get_u32();
        let num_gap_blocks: usize = buf.get_u16().safe_cast();
        let num_nr_gap_blocks: usize = if chunk_type == ChunkType::NrSack { buf.get_u16().safe_cast() } else { 0 };
        let num_duplicates: usize = buf.get_u16().safe_cast();
        if chunk_type == ChunkType::NrSack {
            let _reserved = buf.get_u16();
        }

        let expected_len = Self::fixed_len(chunk_type) + 4 * (num_gap_blocks + num_nr_gap_blocks + num_duplicates);
        if expected_len != chunk_len {
            bail!("chunk length {} does not match the {} bytes implied by its block counts", chunk_len, expected_len);
        }

        let gap_blocks = Self::deser_gap_blocks(buf, num_gap_blocks)?;
        let nr_gap_blocks = Self::deser_gap_blocks(buf, num_nr_gap_blocks)?;
        let duplicate_tsns = (0..num_duplicates)
            .map(|_| SeqNum::from_raw(buf.get_u32()))
            .collect();

        Ok(SackChunk {
            chunk_type,
            cumulative_tsn_ack,
            a_rwnd,
            gap_blocks,
            nr_gap_blocks,
            duplicate_tsns,
        })
    }

    fn deser_gap_blocks(buf: &mut impl Buf, num_blocks: usize) -> anyhow::Result<Vec<GapAckBlock>> {
        let mut result = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let start = buf.get_u16();
            let end = buf.get_u16();
            if start == 0 || end < start {
                bail!("invalid gap ack block {}-{}", start, end);
            }
            result.push(GapAckBlock { start, end });
        }
        Ok(result)
    }
}
