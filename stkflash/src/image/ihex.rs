//! Intel HEX image loader.
//!
//! ## Record Format
//!
//! ```text
//! +-------+--------+---------+------+---------------+----------+
//! | Start | Length | Address | Type |     Data      | Checksum |
//! +-------+--------+---------+------+---------------+----------+
//! |  ':'  |  1 B   |   2 B   | 1 B  |  Length bytes |   1 B    |
//! +-------+--------+---------+------+---------------+----------+
//! ```
//!
//! Every field after the colon is written as hexadecimal digits. The
//! checksum is the two's complement of the sum of all preceding bytes.

use crate::error::{Error, ImageError, Result};
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::ops::{Range, RangeBounds};
use std::path::Path;

/// Data record.
pub const RECORD_DATA: u8 = 0x00;
/// End of file record.
pub const RECORD_EOF: u8 = 0x01;
/// Extended segment address record (base = value * 16).
pub const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
/// Start segment address record (CS:IP, ignored).
pub const RECORD_START_SEGMENT: u8 = 0x03;
/// Extended linear address record (base = value << 16).
pub const RECORD_EXTENDED_LINEAR: u8 = 0x04;
/// Start linear address record (EIP, ignored).
pub const RECORD_START_LINEAR: u8 = 0x05;

/// Sparse firmware image addressed by byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

impl MemoryImage {
    /// Create an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an Intel HEX file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        load(&text)
    }

    /// Get the byte stored at `address`.
    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    /// Number of addressed bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image holds no data.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowest addressed byte.
    pub fn min_address(&self) -> Option<u32> {
        self.bytes.keys().next().copied()
    }

    /// Highest addressed byte.
    pub fn max_address(&self) -> Option<u32> {
        self.bytes.keys().next_back().copied()
    }

    /// Iterate over `(address, value)` pairs in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.iter().map(|(&a, &v)| (a, v))
    }

    /// Iterate over the bytes within an address range.
    pub fn range<R: RangeBounds<u32>>(&self, range: R) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.range(range).map(|(&a, &v)| (a, v))
    }

    /// Contiguous address runs, as half-open ranges.
    pub fn segments(&self) -> Vec<Range<u32>> {
        let mut segments: Vec<Range<u32>> = Vec::new();
        for &address in self.bytes.keys() {
            match segments.last_mut() {
                Some(last) if last.end == address => last.end = address.saturating_add(1),
                _ => segments.push(address..address.saturating_add(1)),
            }
        }
        segments
    }

    /// Store one byte, rejecting a different value for an address already set.
    fn insert(&mut self, address: u32, value: u8, line: usize) -> Result<()> {
        match self.bytes.insert(address, value) {
            Some(previous) if previous != value => {
                Err(ImageError::ConflictingData { line, address }.into())
            },
            _ => Ok(()),
        }
    }
}

/// One decoded record line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    record_type: u8,
    offset: u16,
    data: Vec<u8>,
}

/// Parse Intel HEX text into a memory image.
///
/// Empty lines and lines not starting with `:` are skipped. Parsing stops at
/// the end-of-file record.
pub fn load(text: &str) -> Result<MemoryImage> {
    let mut image = MemoryImage::new();
    let mut base: u32 = 0;
    let mut saw_eof = false;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        let Some(body) = trimmed.strip_prefix(':') else {
            if !trimmed.is_empty() {
                trace!("Skipping non-record line {line}");
            }
            continue;
        };

        let record = parse_record(body, line)?;
        match record.record_type {
            RECORD_DATA => {
                let start = base.checked_add(u32::from(record.offset)).ok_or_else(|| {
                    malformed(line, "address overflows 32 bits")
                })?;
                for (i, &byte) in record.data.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)] // Payload is at most 255 bytes
                    let address = start
                        .checked_add(i as u32)
                        .ok_or_else(|| malformed(line, "address overflows 32 bits"))?;
                    image.insert(address, byte, line)?;
                }
            },
            RECORD_EOF => {
                saw_eof = true;
                break;
            },
            RECORD_EXTENDED_SEGMENT => {
                expect_len(&record, 2, line)?;
                base = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 4;
                debug!("Line {line}: segment base 0x{base:08X}");
            },
            RECORD_EXTENDED_LINEAR => {
                expect_len(&record, 2, line)?;
                base = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 16;
                debug!("Line {line}: linear base 0x{base:08X}");
            },
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {
                expect_len(&record, 4, line)?;
                trace!("Line {line}: ignoring start address record");
            },
            other => {
                return Err(ImageError::UnsupportedRecordType {
                    line,
                    record_type: other,
                }
                .into());
            },
        }
    }

    if !saw_eof {
        warn!("Image has no end-of-file record");
    }
    debug!(
        "Loaded {} bytes in {} segment(s)",
        image.len(),
        image.segments().len()
    );
    Ok(image)
}

fn parse_record(body: &str, line: usize) -> Result<Record> {
    if body.len() % 2 != 0 {
        return Err(malformed(line, "odd number of hex digits"));
    }
    let bytes = (0..body.len())
        .step_by(2)
        .map(|i| {
            body.get(i..i + 2)
                .filter(|pair| pair.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| malformed(line, "invalid hex digit"))
        })
        .collect::<Result<Vec<u8>>>()?;

    // length + address(2) + type + checksum
    if bytes.len() < 5 {
        return Err(malformed(line, "record too short"));
    }
    let length = usize::from(bytes[0]);
    if bytes.len() != length + 5 {
        return Err(malformed(line, "length field does not match payload"));
    }

    let (content, checksum) = bytes.split_at(bytes.len() - 1);
    let expected = checksum_of(content);
    if expected != checksum[0] {
        return Err(ImageError::ChecksumMismatch {
            line,
            expected,
            actual: checksum[0],
        }
        .into());
    }

    Ok(Record {
        record_type: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + length].to_vec(),
    })
}

/// Two's complement of the byte sum.
fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |sum, &b| sum.wrapping_add(b))
        .wrapping_neg()
}

fn expect_len(record: &Record, len: usize, line: usize) -> Result<()> {
    if record.data.len() == len {
        Ok(())
    } else {
        Err(malformed(
            line,
            &format!(
                "record type {:#04x} needs {len} data bytes",
                record.record_type
            ),
        ))
    }
}

fn malformed(line: usize, reason: &str) -> Error {
    ImageError::Malformed {
        line,
        reason: reason.to_string(),
    }
    .into()
}
