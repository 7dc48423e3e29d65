//! Target device profiles and engine configuration.
//!
//! The profile supplies everything the bootloader needs to know about the
//! part (page size, memory sizes, signature); the engine itself never
//! hard-codes a device.

use crate::error::{Error, Result};
use std::{fmt, time::Duration};

/// Supported AVR devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Device {
    /// ATmega328P (Arduino Uno, Nano).
    #[default]
    Atmega328p,
    /// ATmega328 (non-picoPower variant).
    Atmega328,
    /// ATmega168.
    Atmega168,
    /// ATmega8.
    Atmega8,
}

impl Device {
    /// Every supported device.
    pub const ALL: [Self; 4] = [
        Self::Atmega328p,
        Self::Atmega328,
        Self::Atmega168,
        Self::Atmega8,
    ];

    /// STK500 device code sent in `SET_DEVICE`.
    #[must_use]
    pub fn device_code(self) -> u8 {
        match self {
            Self::Atmega328p | Self::Atmega328 | Self::Atmega168 => 0x86,
            Self::Atmega8 => 0x70,
        }
    }

    /// Flash page size in bytes.
    #[must_use]
    pub fn page_size(self) -> usize {
        match self {
            Self::Atmega8 => 64,
            _ => 128,
        }
    }

    /// Flash size in bytes.
    #[must_use]
    pub fn flash_size(self) -> u32 {
        match self {
            Self::Atmega328p | Self::Atmega328 => 32 * 1024,
            Self::Atmega168 => 16 * 1024,
            Self::Atmega8 => 8 * 1024,
        }
    }

    /// EEPROM size in bytes.
    #[must_use]
    pub fn eeprom_size(self) -> u16 {
        match self {
            Self::Atmega328p | Self::Atmega328 => 1024,
            Self::Atmega168 | Self::Atmega8 => 512,
        }
    }

    /// EEPROM page size in bytes.
    #[must_use]
    pub fn eeprom_page_size(self) -> u8 {
        4
    }

    /// Number of lock bytes.
    #[must_use]
    pub fn lock_bytes(self) -> u8 {
        1
    }

    /// Number of fuse bytes.
    #[must_use]
    pub fn fuse_bytes(self) -> u8 {
        match self {
            Self::Atmega8 => 2,
            _ => 3,
        }
    }

    /// Signature bytes as returned by `READ_SIGN`.
    #[must_use]
    pub fn signature(self) -> [u8; 3] {
        match self {
            Self::Atmega328p => [0x1E, 0x95, 0x0F],
            Self::Atmega328 => [0x1E, 0x95, 0x14],
            Self::Atmega168 => [0x1E, 0x94, 0x06],
            Self::Atmega8 => [0x1E, 0x93, 0x07],
        }
    }

    /// Look up a device by name.
    ///
    /// Accepts full part names and the short avrdude style (`m328p`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "atmega328p" | "m328p" | "328p" => Some(Self::Atmega328p),
            "atmega328" | "m328" | "328" => Some(Self::Atmega328),
            "atmega168" | "m168" | "168" => Some(Self::Atmega168),
            "atmega8" | "m8" | "8" => Some(Self::Atmega8),
            _ => None,
        }
    }

    /// Look up the device reporting `signature`.
    pub fn from_signature(signature: [u8; 3]) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.signature() == signature)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atmega328p => write!(f, "ATmega328P"),
            Self::Atmega328 => write!(f, "ATmega328"),
            Self::Atmega168 => write!(f, "ATmega168"),
            Self::Atmega8 => write!(f, "ATmega8"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::Config(format!("unknown device '{s}'")))
    }
}

/// Flashing policy for one session.
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Target device.
    pub device: Device,
    /// Page size in bytes; defaults to the device's.
    pub page_size: usize,
    /// Number of `GET_SYNC` commands before giving up.
    pub sync_attempts: u32,
    /// How long to wait for each sync reply.
    pub sync_timeout: Duration,
    /// Write (and read-back) attempts per page.
    pub page_attempts: u32,
    /// Reply timeout for every other command.
    pub command_timeout: Duration,
    /// Read every page back after programming.
    pub verify: bool,
    /// Compare the device signature with the profile.
    pub check_signature: bool,
}

impl FlashConfig {
    /// Default number of sync attempts.
    pub const DEFAULT_SYNC_ATTEMPTS: u32 = 30;
    /// Default sync reply timeout.
    pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(100);
    /// Default attempts per page.
    pub const DEFAULT_PAGE_ATTEMPTS: u32 = 3;
    /// Default command reply timeout.
    pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

    /// Create the default policy for `device`.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            page_size: device.page_size(),
            sync_attempts: Self::DEFAULT_SYNC_ATTEMPTS,
            sync_timeout: Self::DEFAULT_SYNC_TIMEOUT,
            page_attempts: Self::DEFAULT_PAGE_ATTEMPTS,
            command_timeout: Self::DEFAULT_COMMAND_TIMEOUT,
            verify: true,
            check_signature: true,
        }
    }

    /// Override the page size, as advertised in `SET_DEVICE` and written by
    /// `PROG_PAGE`.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the number of sync attempts.
    #[must_use]
    pub fn with_sync_attempts(mut self, attempts: u32) -> Self {
        self.sync_attempts = attempts;
        self
    }

    /// Set the sync reply timeout.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the attempts per page.
    #[must_use]
    pub fn with_page_attempts(mut self, attempts: u32) -> Self {
        self.page_attempts = attempts;
        self
    }

    /// Set the command reply timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable read-back verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Enable or disable the signature check.
    #[must_use]
    pub fn with_signature_check(mut self, check: bool) -> Self {
        self.check_signature = check;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sync_attempts == 0 {
            return Err(Error::Config("sync attempts must be at least 1".into()));
        }
        if self.page_attempts == 0 {
            return Err(Error::Config("page attempts must be at least 1".into()));
        }
        // Word addressing needs even pages; PROG_PAGE carries a 16-bit length.
        if self.page_size == 0 || self.page_size % 2 != 0 || self.page_size > usize::from(u16::MAX)
        {
            return Err(Error::Config(format!(
                "invalid page size {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self::new(Device::default())
    }
}
