use anyhow::bail;

/// The loss recovery algorithm used by a connection. It is chosen once when the connection is
///  set up, based on configuration and on whether the peer sent SACK-permitted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SackAlgorithm {
    /// Conservative SACK-based loss recovery as specified in RFC 3517
    Rfc3517,
    /// No SACK information is available: retransmit the first unacknowledged segment once per
    ///  recovery episode (Reno style)
    NoSack,
}

pub struct SackConfig {
    /// The number of duplicate SACK reports (or of segments' worth of SACKed bytes above a hole)
    ///  after which un-SACKed data is considered lost. RFC 3517 calls this `DupThresh`.
    pub dup_threshold: u32,

    /// Upper bound for the number of disjoint ranges tracked by any single range structure
    ///  (interval set, scoreboard, reassembly queue). This bounds memory under pathological
    ///  interleaving; running into the bound trades precision for memory, see the individual
    ///  structures for their fallback behavior.
    pub max_gap_count: usize,

    /// The maximum number of blocks in a TCP SACK option. RFC 2018 allows for 4 blocks in the
    ///  40 bytes of TCP option space, 3 if the timestamp option is used as well.
    pub max_sack_blocks: usize,

    /// Total TCP option space per segment. This is shared with other options, so the space
    ///  actually available for SACK is passed in per segment.
    pub tcp_option_space: usize,

    /// Sender maximum segment size, used as the retransmission unit and for the 'bytes SACKed
    ///  above' loss heuristic
    pub mss: u32,

    /// Receive buffer size in bytes, the basis for the advertised receive window
    pub receive_buffer_size: u64,

    /// The maximum number of duplicate TSNs reported in a single SCTP SACK chunk
    pub max_duplicate_tsns: usize,

    pub sack_algorithm: SackAlgorithm,
}

impl SackConfig {
    pub const DEFAULT_DUP_THRESHOLD: u32 = 3;

    /// RFC 3517 loss recovery with Ethernet-sized segments and the full TCP option space
    pub fn default_rfc3517() -> SackConfig {
        SackConfig {
            dup_threshold: Self::DEFAULT_DUP_THRESHOLD,
            max_gap_count: 32,
            max_sack_blocks: 4,
            tcp_option_space: 40,
            mss: 1460,
            receive_buffer_size: 64 * 1024,
            max_duplicate_tsns: 16,
            sack_algorithm: SackAlgorithm::Rfc3517,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dup_threshold == 0 {
            bail!("dup threshold must be at least 1");
        }
        if self.max_gap_count < 2 {
            bail!("max gap count must be at least 2 to allow for any out-of-order tracking");
        }
        if self.max_sack_blocks == 0 || self.max_sack_blocks > 4 {
            bail!("a SACK option carries between 1 and 4 blocks, {} were configured", self.max_sack_blocks);
        }
        if self.tcp_option_space > 40 {
            bail!("TCP option space is limited to 40 bytes");
        }
        if self.mss == 0 {
            bail!("MSS must not be 0");
        }
        if self.receive_buffer_size < self.mss as u64 {
            bail!("receive buffer must hold at least one segment");
        }
        Ok(())
    }
}
