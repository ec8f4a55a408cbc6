#![forbid(unsafe_code)]

pub mod cancel;
pub mod device;
pub mod enrollment;
pub mod simulated;
