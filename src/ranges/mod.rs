pub mod gap_list;
pub mod interval_set;
