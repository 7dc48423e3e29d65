//! STK500v1 bootloader support.

pub mod flasher;
pub mod protocol;

pub use flasher::{BootloaderInfo, CancelToken, FlashReport, Phase, Stk500Flasher};
