//! In-memory STK500 bootloader for tests.
//!
//! Each `send` is treated as one complete command frame. The reply is
//! queued immediately and handed out by `receive`; an empty queue times out
//! at once, so tests never sleep.

use {
    crate::{
        error::{Error, Result},
        target::{
            device::Device,
            stk500::protocol::{
                CRC_EOP, Command, MEMTYPE_FLASH, RESP_FAILED, RESP_INSYNC, RESP_NOSYNC, RESP_OK,
                RESP_UNKNOWN,
            },
        },
        transport::Transport,
    },
    std::{
        collections::{HashMap, VecDeque},
        time::Duration,
    },
};

pub(crate) struct FakeBootloader {
    flash: Vec<u8>,
    signature: [u8; 3],
    address: usize,
    outbound: VecDeque<u8>,
    frames: Vec<Vec<u8>>,
    ignore_syncs: Option<u32>,
    sync_noise: Vec<u8>,
    nak_writes: HashMap<usize, u32>,
    silent_writes: HashMap<usize, u32>,
    silent_reads: HashMap<usize, u32>,
    corrupt_reads: HashMap<usize, usize>,
    fail_after: Option<usize>,
}

impl FakeBootloader {
    /// Blank flash of `device`, answering with its signature.
    pub(crate) fn new(device: Device) -> Self {
        Self {
            flash: vec![0xFF; device.flash_size() as usize],
            signature: device.signature(),
            address: 0,
            outbound: VecDeque::new(),
            frames: Vec::new(),
            ignore_syncs: Some(0),
            sync_noise: Vec::new(),
            nak_writes: HashMap::new(),
            silent_writes: HashMap::new(),
            silent_reads: HashMap::new(),
            corrupt_reads: HashMap::new(),
            fail_after: None,
        }
    }

    pub(crate) fn with_signature(mut self, signature: [u8; 3]) -> Self {
        self.signature = signature;
        self
    }

    /// Never answer `GET_SYNC`.
    pub(crate) fn never_sync(mut self) -> Self {
        self.ignore_syncs = None;
        self
    }

    /// Ignore the first `count` `GET_SYNC` commands.
    pub(crate) fn sync_after(mut self, count: u32) -> Self {
        self.ignore_syncs = Some(count);
        self
    }

    /// Prefix every `GET_SYNC` reply with `bytes`.
    pub(crate) fn sync_noise(mut self, bytes: &[u8]) -> Self {
        self.sync_noise = bytes.to_vec();
        self
    }

    /// Answer `FAILED` to the next `times` writes of the page at `address`.
    pub(crate) fn nak_page(mut self, address: usize, times: u32) -> Self {
        self.nak_writes.insert(address, times);
        self
    }

    /// Stay silent on the next `times` writes of the page at `address`.
    pub(crate) fn drop_page(mut self, address: usize, times: u32) -> Self {
        self.silent_writes.insert(address, times);
        self
    }

    /// Stay silent on the next `times` reads of the page at `address`.
    pub(crate) fn drop_read(mut self, address: usize, times: u32) -> Self {
        self.silent_reads.insert(address, times);
        self
    }

    /// Flip one byte whenever the page at `address` is read back.
    pub(crate) fn corrupt_read(mut self, address: usize, offset: usize) -> Self {
        self.corrupt_reads.insert(address, offset);
        self
    }

    /// Break the connection after `frames` commands.
    pub(crate) fn fail_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Queue bytes as if left over from an earlier conversation.
    pub(crate) fn with_stray(mut self, bytes: &[u8]) -> Self {
        self.outbound.extend(bytes);
        self
    }

    pub(crate) fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Every frame received, in order.
    pub(crate) fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub(crate) fn count(&self, cmd: Command) -> usize {
        self.frames
            .iter()
            .filter(|f| f.first() == Some(&(cmd as u8)))
            .count()
    }

    fn reply(&mut self, payload: &[u8]) {
        self.outbound.push_back(RESP_INSYNC);
        self.outbound.extend(payload);
        self.outbound.push_back(RESP_OK);
    }

    fn handle(&mut self, frame: &[u8]) {
        if frame.last() != Some(&CRC_EOP) {
            self.outbound.push_back(RESP_NOSYNC);
            return;
        }

        let Some(cmd) = frame.first().copied().and_then(Command::from_u8) else {
            self.outbound.extend([RESP_INSYNC, RESP_UNKNOWN]);
            return;
        };

        match cmd {
            Command::GetSync => match self.ignore_syncs {
                Some(0) => {
                    self.outbound.extend(self.sync_noise.iter());
                    self.reply(&[]);
                },
                Some(n) => self.ignore_syncs = Some(n - 1),
                None => {},
            },
            Command::GetParameter => {
                let value = match frame[1] {
                    0x80 => 0x03,
                    0x81 => 0x08,
                    0x82 => 0x03,
                    _ => 0x00,
                };
                self.reply(&[value]);
            },
            Command::SetDevice
            | Command::SetDeviceExt
            | Command::EnterProgmode
            | Command::LeaveProgmode => self.reply(&[]),
            Command::LoadAddress => {
                self.address = usize::from(u16::from_le_bytes([frame[1], frame[2]])) * 2;
                self.reply(&[]);
            },
            Command::ProgPage => {
                let len = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
                assert_eq!(frame[3], MEMTYPE_FLASH);
                assert_eq!(frame.len(), len + 5, "PROG_PAGE length field");

                if let Some(left) = self.silent_writes.get_mut(&self.address) {
                    if *left > 0 {
                        *left -= 1;
                        return;
                    }
                }
                if let Some(left) = self.nak_writes.get_mut(&self.address) {
                    if *left > 0 {
                        *left -= 1;
                        self.outbound.extend([RESP_INSYNC, RESP_FAILED]);
                        return;
                    }
                }

                let start = self.address;
                self.flash[start..start + len].copy_from_slice(&frame[4..4 + len]);
                self.reply(&[]);
            },
            Command::ReadPage => {
                let len = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
                let start = self.address;
                if let Some(left) = self.silent_reads.get_mut(&start) {
                    if *left > 0 {
                        *left -= 1;
                        return;
                    }
                }
                let mut data = self.flash[start..start + len].to_vec();
                if let Some(&offset) = self.corrupt_reads.get(&start) {
                    data[offset] ^= 0x5A;
                }
                self.reply(&data);
            },
            Command::ReadSign => {
                let signature = self.signature;
                self.reply(&signature);
            },
        }
    }
}

impl Transport for FakeBootloader {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.fail_after.is_some_and(|n| self.frames.len() >= n) {
            return Err(Error::Connection("connection reset by peer".into()));
        }
        self.frames.push(bytes.to_vec());
        self.handle(bytes);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.outbound.is_empty() {
            return Err(Error::Timeout("no data".into()));
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
