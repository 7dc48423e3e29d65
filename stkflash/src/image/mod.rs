//! Firmware image handling.

pub mod ihex;
pub mod page;

pub use ihex::{MemoryImage, load};
pub use page::{PADDING_BYTE, Page, check_range, schedule};
