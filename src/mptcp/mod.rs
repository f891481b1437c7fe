pub mod multipath;
