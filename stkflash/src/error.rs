//! Error types for stkflash.

use std::io;
use thiserror::Error;

/// Result type for stkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport-level failure (connect, write, peer closed).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid firmware image.
    #[error("Invalid image: {0}")]
    Image(#[from] ImageError),

    /// No reply arrived within the receive timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The bootloader answered with something other than the expected reply.
    #[error("Unexpected response to {command}: {response:02X?}")]
    UnexpectedResponse {
        /// Command that was sent.
        command: &'static str,
        /// Bytes received instead of the expected reply.
        response: Vec<u8>,
    },

    /// The bootloader never answered the synchronization command.
    #[error("Bootloader did not sync after {attempts} attempts")]
    SyncTimeout {
        /// Number of sync commands sent.
        attempts: u32,
    },

    /// A page could not be written within the retry bound.
    #[error("Writing page at 0x{address:05X} failed after {attempts} attempts")]
    PageWriteFailed {
        /// Byte address of the page.
        address: u32,
        /// Number of write attempts made.
        attempts: u32,
    },

    /// A page could not be read back within the retry bound.
    #[error("Reading page at 0x{address:05X} failed after {attempts} attempts")]
    PageReadFailed {
        /// Byte address of the page.
        address: u32,
        /// Number of read attempts made.
        attempts: u32,
    },

    /// Read-back content differs from what was written.
    #[error("Verify mismatch in page 0x{address:05X} at offset {offset}")]
    VerifyMismatch {
        /// Byte address of the page.
        address: u32,
        /// Offset of the first differing byte within the page.
        offset: usize,
    },

    /// The device signature does not match the selected device.
    #[error("Signature mismatch: expected {expected:02X?}, got {actual:02X?}")]
    SignatureMismatch {
        /// Signature of the configured device.
        expected: [u8; 3],
        /// Signature reported by the bootloader.
        actual: [u8; 3],
    },

    /// Data lies outside the flash of the selected device.
    #[error("Address 0x{address:05X} exceeds flash size 0x{limit:05X}")]
    AddressOutOfRange {
        /// Byte address of the offending page or image byte.
        address: u32,
        /// Flash size of the device in bytes.
        limit: u32,
    },

    /// The session was cancelled between pages.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is local to one command/response exchange.
    ///
    /// Such failures are retried by the page loop; everything else ends the
    /// session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::UnexpectedResponse { .. })
    }
}

/// Errors found while parsing an Intel HEX image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The line starts like a record but does not follow the record grammar.
    #[error("line {line}: malformed record ({reason})")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the record.
        reason: String,
    },

    /// The record checksum does not match its content.
    #[error("line {line}: checksum mismatch (expected {expected:#04x}, found {actual:#04x})")]
    ChecksumMismatch {
        /// 1-based line number.
        line: usize,
        /// Checksum computed from the record bytes.
        expected: u8,
        /// Checksum byte stored in the record.
        actual: u8,
    },

    /// The record type is not one of `00`..`05`.
    #[error("line {line}: unsupported record type {record_type:#04x}")]
    UnsupportedRecordType {
        /// 1-based line number.
        line: usize,
        /// Record type byte.
        record_type: u8,
    },

    /// Two records supply different values for the same address.
    #[error("line {line}: conflicting data at address 0x{address:08X}")]
    ConflictingData {
        /// 1-based line number of the second record.
        line: usize,
        /// Address written twice.
        address: u32,
    },
}
