pub mod safe_converter;
pub mod seq_num;
