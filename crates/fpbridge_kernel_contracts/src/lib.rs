#![forbid(unsafe_code)]

pub mod common;
pub mod device;
pub mod enrollment;
pub mod logs;

pub use common::{ContractViolation, UnixTimeSec, Validate};
