//! Page scheduling.
//!
//! Flash is programmed one page at a time. The scheduler cuts a sparse
//! [`MemoryImage`] into aligned, fixed-size pages covering every address from
//! the lowest to the highest addressed byte:
//!
//! ```text
//!  min                                   max
//!   |  data  |   gap   |      data        |
//! +----------+----------+----------+----------+
//! |  page 0  |  page 1  |  page 2  |  page 3  |
//! +----------+----------+----------+----------+
//! ^ rounded down                   rounded up ^
//! ```
//!
//! Bytes absent from the image are filled with [`PADDING_BYTE`], the value of
//! erased flash.

use crate::error::{Error, Result};
use crate::image::ihex::MemoryImage;
use log::debug;

/// Fill value for bytes not present in the image.
pub const PADDING_BYTE: u8 = 0xFF;

/// One flash page ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    base_address: u32,
    data: Vec<u8>,
}

impl Page {
    /// Create a page from its base address and content.
    pub fn new(base_address: u32, data: Vec<u8>) -> Self {
        Self { base_address, data }
    }

    /// Byte address of the first byte in the page.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Page content, including padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Page length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the page holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte address one past the last byte of the page.
    pub fn end_address(&self) -> u64 {
        u64::from(self.base_address) + self.data.len() as u64
    }
}

/// Fail if any byte of `image` lies at or above `limit`.
///
/// Pages span the whole image range, so run this before [`schedule`].
pub fn check_range(image: &MemoryImage, limit: u32) -> Result<()> {
    match image.max_address() {
        Some(max) if max >= limit => Err(Error::AddressOutOfRange {
            address: max,
            limit,
        }),
        _ => Ok(()),
    }
}

/// Cut an image into aligned pages of `page_size` bytes.
///
/// An empty image yields no pages.
pub fn schedule(image: &MemoryImage, page_size: usize) -> Result<Vec<Page>> {
    if page_size == 0 {
        return Err(Error::Config("page size must be non-zero".into()));
    }
    let (Some(min), Some(max)) = (image.min_address(), image.max_address()) else {
        return Ok(Vec::new());
    };

    let size = page_size as u64;
    let first = u64::from(min) / size * size;
    let end = (u64::from(max) / size + 1) * size;

    let mut pages = Vec::new();
    let mut base = first;
    while base < end {
        let mut data = vec![PADDING_BYTE; page_size];
        #[allow(clippy::cast_possible_truncation)] // base <= max <= u32::MAX
        let base32 = base as u32;
        let last = u32::try_from(base + size - 1).unwrap_or(u32::MAX);
        for (address, value) in image.range(base32..=last) {
            data[(address - base32) as usize] = value;
        }
        pages.push(Page::new(base32, data));
        base += size;
    }

    debug!(
        "Scheduled {} page(s) of {page_size} bytes from 0x{first:05X} to 0x{end:05X}",
        pages.len()
    );
    Ok(pages)
}
