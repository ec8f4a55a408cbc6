#![forbid(unsafe_code)]

pub mod log_stream;
pub mod quality;
