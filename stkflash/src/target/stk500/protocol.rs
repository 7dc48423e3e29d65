//! STK500 version 1 command grammar (Atmel AVR061).
//!
//! This is the protocol spoken by optiboot and the other Arduino-style
//! bootloaders. It is strictly request/response: the host sends one command
//! and the bootloader answers it before anything else is sent.
//!
//! ## Frame Format
//!
//! ```text
//! Command:
//! +---------+----------------+---------+
//! | Command |   Parameters   | CRC_EOP |
//! +---------+----------------+---------+
//! |   1 B   |    variable    |  0x20   |
//! +---------+----------------+---------+
//!
//! Reply:
//! +--------+----------------+------+
//! | INSYNC |    Payload     |  OK  |
//! +--------+----------------+------+
//! |  0x14  |    variable    | 0x10 |
//! +--------+----------------+------+
//! ```
//!
//! Despite its name, `CRC_EOP` is a fixed end-of-packet marker, not a CRC.

use {
    crate::{
        error::{Error, Result},
        target::device::Device,
    },
    byteorder::{BigEndian, LittleEndian, WriteBytesExt},
};

/// End-of-packet marker closing every command.
pub const CRC_EOP: u8 = 0x20;

/// Reply terminator for a successful command.
pub const RESP_OK: u8 = 0x10;
/// Command understood but failed.
pub const RESP_FAILED: u8 = 0x11;
/// Command not recognized.
pub const RESP_UNKNOWN: u8 = 0x12;
/// No device attached (programmer replies only).
pub const RESP_NODEVICE: u8 = 0x13;
/// Reply header: the command was received intact.
pub const RESP_INSYNC: u8 = 0x14;
/// The command was not terminated by `CRC_EOP`.
pub const RESP_NOSYNC: u8 = 0x15;

/// Memory type selector for flash in page commands.
pub const MEMTYPE_FLASH: u8 = b'F';

/// Reply to a successful `GET_SYNC`.
pub const SYNC_ACK: [u8; 2] = [RESP_INSYNC, RESP_OK];

/// STK500v1 commands used for flash programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Synchronize with the bootloader.
    GetSync = 0x30,
    /// Read a programmer parameter.
    GetParameter = 0x41,
    /// Describe the target device.
    SetDevice = 0x42,
    /// Extended device description.
    SetDeviceExt = 0x45,
    /// Enter programming mode.
    EnterProgmode = 0x50,
    /// Leave programming mode (starts the application).
    LeaveProgmode = 0x51,
    /// Set the address for the next page command.
    LoadAddress = 0x55,
    /// Write one page.
    ProgPage = 0x64,
    /// Read one page.
    ReadPage = 0x74,
    /// Read the three signature bytes.
    ReadSign = 0x75,
}

impl Command {
    /// Name as used in the AVR061 application note.
    pub fn name(self) -> &'static str {
        match self {
            Self::GetSync => "GET_SYNC",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetDevice => "SET_DEVICE",
            Self::SetDeviceExt => "SET_DEVICE_EXT",
            Self::EnterProgmode => "ENTER_PROGMODE",
            Self::LeaveProgmode => "LEAVE_PROGMODE",
            Self::LoadAddress => "LOAD_ADDRESS",
            Self::ProgPage => "PROG_PAGE",
            Self::ReadPage => "READ_PAGE",
            Self::ReadSign => "READ_SIGN",
        }
    }

    /// Decode a command byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x30 => Self::GetSync,
            0x41 => Self::GetParameter,
            0x42 => Self::SetDevice,
            0x45 => Self::SetDeviceExt,
            0x50 => Self::EnterProgmode,
            0x51 => Self::LeaveProgmode,
            0x55 => Self::LoadAddress,
            0x64 => Self::ProgPage,
            0x74 => Self::ReadPage,
            0x75 => Self::ReadSign,
            _ => return None,
        })
    }
}

/// Parameters readable with `GET_PARAMETER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Parameter {
    /// Hardware version.
    HwVersion = 0x80,
    /// Software major version.
    SwMajor = 0x81,
    /// Software minor version.
    SwMinor = 0x82,
}

/// Command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    cmd: Command,
    data: Vec<u8>,
    reply_len: usize,
}

impl CommandFrame {
    /// Create a command frame with no parameters and an empty reply payload.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            data: Vec::new(),
            reply_len: 0,
        }
    }

    /// `GET_SYNC`.
    pub fn get_sync() -> Self {
        Self::new(Command::GetSync)
    }

    /// `GET_PARAMETER`, answered with one value byte.
    pub fn get_parameter(parameter: Parameter) -> Self {
        let mut frame = Self::new(Command::GetParameter);
        frame.data.push(parameter as u8);
        frame.reply_len = 1;
        frame
    }

    /// `SET_DEVICE` describing `device` with `page_size` byte pages.
    ///
    /// Parameter layout: device code, revision, programming type, parallel
    /// mode, polling, self timed, lock bytes, fuse bytes, flash poll values
    /// (2), EEPROM poll values (2), page size (BE16), EEPROM size (BE16),
    /// flash size (BE32).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_device(device: Device, page_size: u16) -> Self {
        let mut frame = Self::new(Command::SetDevice);
        frame.data.extend_from_slice(&[
            device.device_code(),
            0x00, // revision
            0x00, // programming type: both parallel and serial
            0x01, // full parallel interface
            0x01, // polling supported
            0x01, // self timed programming
            device.lock_bytes(),
            device.fuse_bytes(),
            0xFF, // flash poll value 1
            0xFF, // flash poll value 2
            0xFF, // EEPROM poll value 1
            0xFF, // EEPROM poll value 2
        ]);
        frame
            .data
            .write_u16::<BigEndian>(page_size)
            .unwrap();
        frame
            .data
            .write_u16::<BigEndian>(device.eeprom_size())
            .unwrap();
        frame
            .data
            .write_u32::<BigEndian>(device.flash_size())
            .unwrap();
        frame
    }

    /// `SET_DEVICE_EXT` with the values Arduino-style bootloaders expect.
    pub fn set_device_ext(device: Device) -> Self {
        let mut frame = Self::new(Command::SetDeviceExt);
        frame.data.extend_from_slice(&[
            0x05, // command size
            device.eeprom_page_size(),
            0xD7, // PAGEL pin
            0xC2, // BS2 pin
            0x00, // reset disable
        ]);
        frame
    }

    /// `ENTER_PROGMODE`.
    pub fn enter_progmode() -> Self {
        Self::new(Command::EnterProgmode)
    }

    /// `LEAVE_PROGMODE`.
    pub fn leave_progmode() -> Self {
        Self::new(Command::LeaveProgmode)
    }

    /// `LOAD_ADDRESS` with a word address (little-endian on the wire).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn load_address(word_address: u16) -> Self {
        let mut frame = Self::new(Command::LoadAddress);
        frame
            .data
            .write_u16::<LittleEndian>(word_address)
            .unwrap();
        frame
    }

    /// `PROG_PAGE` writing `data` to flash at the loaded address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn prog_page(data: &[u8]) -> Result<Self> {
        let len = u16::try_from(data.len())
            .map_err(|_| Error::Config(format!("page of {} bytes is too large", data.len())))?;
        let mut frame = Self::new(Command::ProgPage);
        frame.data.write_u16::<BigEndian>(len).unwrap();
        frame.data.push(MEMTYPE_FLASH);
        frame.data.extend_from_slice(data);
        Ok(frame)
    }

    /// `READ_PAGE` reading `len` bytes of flash from the loaded address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_page(len: u16) -> Self {
        let mut frame = Self::new(Command::ReadPage);
        frame.data.write_u16::<BigEndian>(len).unwrap();
        frame.data.push(MEMTYPE_FLASH);
        frame.reply_len = usize::from(len);
        frame
    }

    /// `READ_SIGN`, answered with three signature bytes.
    pub fn read_sign() -> Self {
        let mut frame = Self::new(Command::ReadSign);
        frame.reply_len = 3;
        frame
    }

    /// Build the complete frame data.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.data);
        buf.push(CRC_EOP);
        buf
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.cmd
    }

    /// Number of payload bytes between `INSYNC` and `OK` in the reply.
    pub fn reply_len(&self) -> usize {
        self.reply_len
    }

    /// Total reply length including `INSYNC` and `OK`.
    pub fn expected_reply_len(&self) -> usize {
        self.reply_len + 2
    }

    /// Check a complete reply and return its payload.
    pub fn parse_reply<'a>(&self, reply: &'a [u8]) -> Result<&'a [u8]> {
        match reply {
            [RESP_INSYNC, payload @ .., RESP_OK] if payload.len() == self.reply_len => Ok(payload),
            _ => Err(Error::UnexpectedResponse {
                command: self.cmd.name(),
                response: reply.to_vec(),
            }),
        }
    }
}
