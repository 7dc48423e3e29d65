//! Bootloader targets.

pub mod device;
pub mod stk500;

pub use device::{Device, FlashConfig};
