pub mod sack_chunk;
pub mod tsn_receiver;
