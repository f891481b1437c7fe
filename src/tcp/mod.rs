pub mod connection;
pub mod connection_table;
pub mod sack_handler;
pub mod sack_option;
pub mod sack_reporter;
pub mod scoreboard;
