//! Loss recovery book-keeping for a suite of transport protocols: the parts of TCP, SCTP and
//!  MPTCP that track which data was received, which was lost, and what to tell the peer about
//!  it.
//!
//! ## Building blocks
//!
//! * Sequence numbers are 32-bit modular values ([util::seq_num::SeqNum]). Ordered state is
//!    keyed by unwrapped 64-bit positions so that map order matches sequence order across
//!    wrap-around.
//! * [ranges::interval_set::IntervalSet] is an ordered set of disjoint closed ranges with a
//!    bounded number of entries. [ranges::gap_list::GapList] combines three of them with a
//!    cumulative ack to track received TSNs (SCTP style, including non-revokable gaps for
//!    NR-SACK).
//! * [reassembly::queue::ReassemblyQueue] reassembles byte ranges arriving out of order,
//!    tracking the highest sequence number up to which everything was received.
//!
//! ## Protocol state
//!
//! * TCP: [tcp::scoreboard::SackScoreboard] is the sender's view of SACKed data (RFC 3517),
//!    [tcp::sack_reporter::SackReporter] the receiver's selection of SACK blocks (RFC 2018 and
//!    RFC 2883). [tcp::connection::SackConnection] ties them to segment and ack arrival, using
//!    the loss recovery strategy chosen per connection ([tcp::sack_handler::SackHandler]).
//! * SCTP: [sctp::tsn_receiver::TsnReceiver] creates SACK and NR-SACK chunks.
//! * MPTCP: [mptcp::multipath::MultipathReceiver] merges the data of several subflows.
//!
//! Everything is single-threaded and synchronous: each connection's state is owned by whoever
//!  drives the connection. Timers, packet I/O and congestion control are the caller's business.
//!
//! ## Capacity
//!
//! The number of disjoint ranges per structure is bounded by
//!  [config::SackConfig::max_gap_count]. Running into the bound never fails an operation -
//!  each structure has a fallback that gives up some precision (coalescing, evicting or
//!  rejecting a range) and logs a warning.

pub mod config;
pub mod mptcp;
pub mod ranges;
pub mod reassembly;
pub mod sctp;
pub mod tcp;
pub mod util;
