//! # stkflash
//!
//! A library for flashing AVR microcontrollers running an STK500v1
//! bootloader (optiboot and friends) through a TCP serial bridge.
//!
//! The bridge exposes two TCP ports: a data port forwarded to the target
//! UART and a control port accepting AT commands, one of which toggles the
//! GPIO wired to the target's reset line.
//!
//! This crate provides:
//!
//! - Intel HEX parsing into a sparse memory image
//! - Page scheduling (aligned, `0xFF` padded)
//! - A transport abstraction with a TCP implementation
//! - The STK500v1 protocol engine
//! - Bridge reset control
//!
//! ## Supported Devices
//!
//! - ATmega328P (default), ATmega328, ATmega168, ATmega8
//!
//! ## Features
//!
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{AtBridge, FlashConfig, ResetControl, Stk500Flasher, TcpTransport, image};
//! use std::{thread, time::Duration};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = image::MemoryImage::from_file("firmware.hex")?;
//!     let config = FlashConfig::default();
//!     let pages = image::schedule(&image, config.page_size)?;
//!
//!     let timeout = Duration::from_secs(3);
//!     let mut bridge = AtBridge::connect("192.168.4.1:8881", timeout)?;
//!     bridge.reset()?;
//!     thread::sleep(Duration::from_millis(400));
//!
//!     let transport = TcpTransport::connect("192.168.4.1:8880", timeout)?;
//!     let report = Stk500Flasher::new(transport, config).flash(&pages, |_, _, _| {})?;
//!     bridge.release()?;
//!
//!     println!("Wrote {} pages", report.pages_written);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod error;
pub mod image;
pub mod target;
pub mod transport;

// Re-exports for convenience
pub use {
    bridge::{AtBridge, ResetControl},
    error::{Error, ImageError, Result},
    image::{MemoryImage, PADDING_BYTE, Page},
    target::{
        Device, FlashConfig,
        stk500::{BootloaderInfo, CancelToken, FlashReport, Phase, Stk500Flasher},
    },
    transport::{TcpTransport, Transport},
};
