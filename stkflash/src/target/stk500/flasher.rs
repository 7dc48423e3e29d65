//! STK500 flasher.
//!
//! Drives one programming session against a bootloader reachable through a
//! [`Transport`]:
//!
//! ```text
//! Idle -> Syncing -> Programming -> Verifying -> Done
//!            \            \             \
//!             +------------+-------------+----> Failed
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{FlashConfig, Stk500Flasher, TcpTransport, image};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = image::MemoryImage::from_file("blink.hex")?;
//!     let config = FlashConfig::default();
//!     let pages = image::schedule(&image, config.page_size)?;
//!
//!     let transport = TcpTransport::connect("192.168.4.1:8880", Duration::from_secs(3))?;
//!     let mut flasher = Stk500Flasher::new(transport, config);
//!     let report = flasher.flash(&pages, |phase, done, total| {
//!         println!("{phase}: {done}/{total}");
//!     })?;
//!     println!("{} pages written", report.pages_written);
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        image::Page,
        target::{
            device::FlashConfig,
            stk500::protocol::{CommandFrame, Parameter, SYNC_ACK},
        },
        transport::Transport,
    },
    log::{debug, info, trace, warn},
    std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Instant,
    },
};

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Phase {
    /// Nothing sent yet.
    Idle,
    /// Establishing sync and setting up the device.
    Syncing,
    /// Writing pages.
    Programming,
    /// Reading pages back.
    Verifying,
    /// Every page written (and verified).
    Done,
    /// The session ended with an error.
    Failed,
}

impl Phase {
    /// Whether the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Syncing => "Syncing",
            Self::Programming => "Programming",
            Self::Verifying => "Verifying",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Shared flag that stops a session between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the bootloader reported about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootloaderInfo {
    /// Hardware version parameter.
    pub hw_version: Option<u8>,
    /// Software version as (major, minor).
    pub sw_version: Option<(u8, u8)>,
    /// Device signature.
    pub signature: Option<[u8; 3]>,
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlashReport {
    /// Pages written.
    pub pages_written: usize,
    /// Whether every page was read back and compared.
    pub verified: bool,
    /// `GET_SYNC` commands sent until the bootloader answered.
    pub sync_attempts: u32,
    /// Write attempts needed per page, in page order.
    pub page_attempts: Vec<u32>,
    /// Bootloader details gathered during setup.
    pub info: BootloaderInfo,
}

/// Run-time state of one `flash` call.
struct Session {
    phase: Phase,
    current: usize,
    total: usize,
    sync_attempts: u32,
    page_attempts: Vec<u32>,
    in_progmode: bool,
}

impl Session {
    fn new(total: usize) -> Self {
        Self {
            phase: Phase::Idle,
            current: 0,
            total,
            sync_attempts: 0,
            page_attempts: Vec::with_capacity(total),
            in_progmode: false,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug_assert!(!self.phase.is_terminal(), "session already {}", self.phase);
        debug!("{} -> {phase}", self.phase);
        self.phase = phase;
    }
}

/// Programs pages through an STK500v1 bootloader.
pub struct Stk500Flasher<T: Transport> {
    transport: T,
    config: FlashConfig,
    cancel: Option<CancelToken>,
}

impl<T: Transport> Stk500Flasher<T> {
    /// Create a flasher over `transport`.
    pub fn new(transport: T, config: FlashConfig) -> Self {
        Self {
            transport,
            config,
            cancel: None,
        }
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Get the flashing policy.
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Get a reference to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the flasher and return the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Write `pages` and, when enabled, verify them.
    ///
    /// `progress` receives `(phase, pages_done, pages_total)`.
    ///
    /// Returns a report only when every page was written (and verified);
    /// there is no partial success.
    pub fn flash<F>(&mut self, pages: &[Page], mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(Phase, usize, usize),
    {
        self.config.validate()?;

        if pages.is_empty() {
            info!("Image is empty, nothing to flash");
            progress(Phase::Done, 0, 0);
            return Ok(FlashReport {
                verified: self.config.verify,
                ..FlashReport::default()
            });
        }

        self.check_pages(pages)?;

        let mut session = Session::new(pages.len());
        match self.run(&mut session, pages, &mut progress) {
            Ok(info) => {
                session.enter(Phase::Done);
                progress(Phase::Done, session.total, session.total);
                info!("Flashed {} pages", session.total);
                Ok(FlashReport {
                    pages_written: session.total,
                    verified: self.config.verify,
                    sync_attempts: session.sync_attempts,
                    page_attempts: session.page_attempts,
                    info,
                })
            },
            Err(e) => {
                warn!(
                    "{} failed at page {}/{}: {e}",
                    session.phase,
                    session.current + 1,
                    session.total
                );
                session.enter(Phase::Failed);
                if session.in_progmode && !matches!(e, Error::Connection(_)) {
                    self.leave_progmode();
                }
                Err(e)
            },
        }
    }

    fn run<F>(
        &mut self,
        session: &mut Session,
        pages: &[Page],
        progress: &mut F,
    ) -> Result<BootloaderInfo>
    where
        F: FnMut(Phase, usize, usize),
    {
        session.enter(Phase::Syncing);
        progress(Phase::Syncing, 0, session.total);
        self.sync(session)?;
        let info = self.setup(session)?;

        session.enter(Phase::Programming);
        progress(Phase::Programming, 0, session.total);
        for (index, page) in pages.iter().enumerate() {
            self.check_cancelled()?;
            session.current = index;
            let attempts = self.write_page(page)?;
            session.page_attempts.push(attempts);
            progress(Phase::Programming, index + 1, session.total);
        }

        if self.config.verify {
            session.enter(Phase::Verifying);
            progress(Phase::Verifying, 0, session.total);
            for (index, page) in pages.iter().enumerate() {
                self.check_cancelled()?;
                session.current = index;
                self.verify_page(page)?;
                progress(Phase::Verifying, index + 1, session.total);
            }
            info!("Verified {} pages", session.total);
        }

        self.leave_progmode();
        session.in_progmode = false;
        Ok(info)
    }

    /// Every page must be page-sized, aligned, in ascending order and fit
    /// the device.
    fn check_pages(&self, pages: &[Page]) -> Result<()> {
        let limit = self.config.device.flash_size();
        let page_size = self.config.page_size;
        let mut next = 0u64;
        for page in pages {
            if page.len() != page_size {
                return Err(Error::Config(format!(
                    "page at 0x{:05X} has {} bytes, expected {page_size}",
                    page.base_address(),
                    page.len(),
                )));
            }
            if u64::from(page.base_address()) % page_size as u64 != 0 {
                return Err(Error::Config(format!(
                    "page at 0x{:05X} is not aligned to {page_size} bytes",
                    page.base_address()
                )));
            }
            if u64::from(page.base_address()) < next {
                return Err(Error::Config(format!(
                    "page at 0x{:05X} is out of order",
                    page.base_address()
                )));
            }
            next = page.end_address();
            if page.end_address() > u64::from(limit) || word_address(page).is_none() {
                return Err(Error::AddressOutOfRange {
                    address: page.base_address(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn sync(&mut self, session: &mut Session) -> Result<()> {
        let stale = self.transport.discard_pending()?;
        if stale > 0 {
            debug!("Discarded {stale} stale byte(s) before sync");
        }

        let frame = CommandFrame::get_sync().build();
        let max = self.config.sync_attempts;
        for attempt in 1..=max {
            session.sync_attempts = attempt;
            self.transport.send(&frame)?;
            if self.await_sync_ack()? {
                info!("In sync with bootloader (attempt {attempt}/{max})");
                // The bootloader answers every GET_SYNC still queued on its side.
                self.transport.discard_pending()?;
                return Ok(());
            }
            trace!("No sync reply (attempt {attempt}/{max})");
        }

        Err(Error::SyncTimeout { attempts: max })
    }

    /// Scan for `INSYNC OK` within the sync timeout, skipping other bytes.
    fn await_sync_ack(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.config.sync_timeout;
        let mut byte = [0u8; 1];
        let mut matched = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.transport.receive(&mut byte, remaining) {
                Ok(0) => {},
                Ok(_) if byte[0] == SYNC_ACK[matched] => {
                    matched += 1;
                    if matched == SYNC_ACK.len() {
                        return Ok(true);
                    }
                },
                Ok(_) => {
                    trace!("Skipping {:#04x} while syncing", byte[0]);
                    matched = usize::from(byte[0] == SYNC_ACK[0]);
                },
                Err(Error::Timeout(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read versions, describe the device, enter programming mode and check
    /// the signature.
    fn setup(&mut self, session: &mut Session) -> Result<BootloaderInfo> {
        let device = self.config.device;
        let mut info = BootloaderInfo {
            hw_version: self.read_parameter(Parameter::HwVersion)?,
            ..BootloaderInfo::default()
        };
        let major = self.read_parameter(Parameter::SwMajor)?;
        let minor = self.read_parameter(Parameter::SwMinor)?;
        info.sw_version = major.zip(minor);
        if let Some((major, minor)) = info.sw_version {
            info!("Bootloader version {major}.{minor}");
        }

        let page_size = u16::try_from(self.config.page_size).map_err(|_| {
            Error::Config(format!("invalid page size {}", self.config.page_size))
        })?;
        self.exchange(&CommandFrame::set_device(device, page_size))?;
        self.exchange(&CommandFrame::set_device_ext(device))?;
        self.exchange(&CommandFrame::enter_progmode())?;
        session.in_progmode = true;

        let reply = self.exchange(&CommandFrame::read_sign())?;
        let signature = [reply[0], reply[1], reply[2]];
        info.signature = Some(signature);
        debug!("Signature {signature:02X?}");

        if signature != device.signature() {
            if self.config.check_signature {
                return Err(Error::SignatureMismatch {
                    expected: device.signature(),
                    actual: signature,
                });
            }
            warn!(
                "Signature {signature:02X?} does not match {device}, continuing as requested"
            );
        }

        Ok(info)
    }

    /// Read a version parameter; exchange failures are logged and ignored.
    fn read_parameter(&mut self, parameter: Parameter) -> Result<Option<u8>> {
        match self.exchange(&CommandFrame::get_parameter(parameter)) {
            Ok(reply) => Ok(Some(reply[0])),
            Err(e) if e.is_retryable() => {
                warn!("Reading parameter {parameter:?} failed: {e}");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    fn write_page(&mut self, page: &Page) -> Result<u32> {
        let max = self.config.page_attempts;
        for attempt in 1..=max {
            match self.try_write_page(page) {
                Ok(()) => {
                    debug!("Wrote page 0x{:05X}", page.base_address());
                    return Ok(attempt);
                },
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Writing page 0x{:05X} failed (attempt {attempt}/{max}): {e}",
                        page.base_address()
                    );
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::PageWriteFailed {
            address: page.base_address(),
            attempts: max,
        })
    }

    fn try_write_page(&mut self, page: &Page) -> Result<()> {
        self.load_address(page)?;
        self.exchange(&CommandFrame::prog_page(page.data())?)?;
        Ok(())
    }

    fn verify_page(&mut self, page: &Page) -> Result<()> {
        let max = self.config.page_attempts;
        for attempt in 1..=max {
            match self.try_read_page(page) {
                Ok(data) => {
                    return match data.iter().zip(page.data()).position(|(a, b)| a != b) {
                        None => Ok(()),
                        Some(offset) => Err(Error::VerifyMismatch {
                            address: page.base_address(),
                            offset,
                        }),
                    };
                },
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Reading page 0x{:05X} failed (attempt {attempt}/{max}): {e}",
                        page.base_address()
                    );
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::PageReadFailed {
            address: page.base_address(),
            attempts: max,
        })
    }

    fn try_read_page(&mut self, page: &Page) -> Result<Vec<u8>> {
        let len = u16::try_from(page.len())
            .map_err(|_| Error::Config(format!("page of {} bytes is too large", page.len())))?;
        self.load_address(page)?;
        self.exchange(&CommandFrame::read_page(len))
    }

    fn load_address(&mut self, page: &Page) -> Result<()> {
        let word = word_address(page).ok_or(Error::AddressOutOfRange {
            address: page.base_address(),
            limit: self.config.device.flash_size(),
        })?;
        self.exchange(&CommandFrame::load_address(word))?;
        Ok(())
    }

    fn leave_progmode(&mut self) {
        match self.exchange(&CommandFrame::leave_progmode()) {
            Ok(_) => debug!("Left programming mode"),
            Err(e) => warn!("Leaving programming mode failed: {e}"),
        }
    }

    /// Send one command and return the payload of its reply.
    fn exchange(&mut self, frame: &CommandFrame) -> Result<Vec<u8>> {
        let name = frame.command().name();
        let stale = self.transport.discard_pending()?;
        if stale > 0 {
            debug!("Discarded {stale} stale byte(s) before {name}");
        }

        let data = frame.build();
        debug!("{name} ({} bytes)", data.len());
        self.transport.send(&data)?;

        let reply = self
            .transport
            .receive_exact(frame.expected_reply_len(), self.config.command_timeout)?;
        frame.parse_reply(&reply).map(<[u8]>::to_vec)
    }
}

/// Word address of a page for `LOAD_ADDRESS`.
fn word_address(page: &Page) -> Option<u16> {
    u16::try_from(page.base_address() / 2).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::{self, MemoryImage},
        target::{device::Device, stk500::protocol::Command},
        transport::fake::FakeBootloader,
    };

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// `count` full pages of distinct, non-erased content.
    fn pages(count: usize) -> Vec<Page> {
        (0..count)
            .map(|i| {
                let base = (i * 128) as u32;
                let data = (0..128).map(|b| (i * 31 + b) as u8 ^ 0xA5).collect();
                Page::new(base, data)
            })
            .collect()
    }

    fn flasher(fake: FakeBootloader) -> Stk500Flasher<FakeBootloader> {
        Stk500Flasher::new(fake, FlashConfig::new(Device::Atmega328p))
    }

    #[test]
    fn test_flash_writes_and_verifies_every_page() {
        init_logger();
        let pages = pages(4);
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));

        let report = flasher.flash(&pages, |_, _, _| {}).unwrap();

        assert_eq!(report.pages_written, 4);
        assert!(report.verified);
        assert_eq!(report.sync_attempts, 1);
        assert_eq!(report.page_attempts, vec![1, 1, 1, 1]);
        assert_eq!(report.info.signature, Some([0x1E, 0x95, 0x0F]));
        assert_eq!(report.info.sw_version, Some((8, 3)));

        let fake = flasher.into_transport();
        for page in &pages {
            let start = page.base_address() as usize;
            assert_eq!(&fake.flash()[start..start + 128], page.data());
        }
        assert_eq!(fake.count(Command::ProgPage), 4);
        assert_eq!(fake.count(Command::ReadPage), 4);
        assert_eq!(fake.frames().last().unwrap(), &vec![0x51, 0x20]);
    }

    #[test]
    fn test_flash_from_hex_image() {
        init_logger();
        let hex = [
            image::ihex::tests::record(0x00, 0x0000, &[0x0C, 0x94, 0x34, 0x00]),
            image::ihex::tests::record(0x00, 0x0100, &[0xFF, 0xCF]),
            ":00000001FF".to_string(),
        ]
        .join("\n");
        let image: MemoryImage = image::load(&hex).unwrap();
        let pages = image::schedule(&image, 128).unwrap();

        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let report = flasher.flash(&pages, |_, _, _| {}).unwrap();
        assert_eq!(report.pages_written, 3);

        let fake = flasher.into_transport();
        assert_eq!(&fake.flash()[..4], &[0x0C, 0x94, 0x34, 0x00]);
        assert_eq!(&fake.flash()[0x100..0x102], &[0xFF, 0xCF]);
        // Word address of the page at 0x100.
        assert!(fake.frames().contains(&vec![0x55, 0x80, 0x00, 0x20]));
    }

    #[test]
    fn test_empty_page_list_is_done_without_io() {
        init_logger();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let mut phases = Vec::new();

        let report = flasher.flash(&[], |phase, _, _| phases.push(phase)).unwrap();

        assert_eq!(report.pages_written, 0);
        assert_eq!(phases, vec![Phase::Done]);
        assert!(flasher.transport().frames().is_empty());
    }

    #[test]
    fn test_sync_exhaustion_after_exact_attempt_count() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).never_sync();
        let config = FlashConfig::default().with_sync_attempts(5);
        let mut flasher = Stk500Flasher::new(fake, config);

        let err = flasher.flash(&pages(1), |_, _, _| {}).unwrap_err();

        assert!(matches!(err, Error::SyncTimeout { attempts: 5 }));
        let fake = flasher.into_transport();
        assert_eq!(fake.frames().len(), 5);
        assert!(fake.frames().iter().all(|f| f == &[0x30, 0x20]));
    }

    #[test]
    fn test_sync_waits_for_slow_bootloader() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).sync_after(3);
        let mut flasher = Stk500Flasher::new(fake, FlashConfig::default());

        let report = flasher.flash(&pages(1), |_, _, _| {}).unwrap();
        assert_eq!(report.sync_attempts, 4);
    }

    #[test]
    fn test_stray_bytes_are_discarded_before_sync() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).with_stray(&[0x00, 0xFE, 0x15, 0x14]);
        let mut flasher = flasher(fake);

        let report = flasher.flash(&pages(2), |_, _, _| {}).unwrap();
        assert_eq!(report.sync_attempts, 1);
        assert_eq!(report.page_attempts, vec![1, 1]);
    }

    #[test]
    fn test_sync_reply_found_after_noise() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).sync_noise(&[0x14, 0x00, 0x14, 0x14]);
        let mut flasher = flasher(fake);

        let report = flasher.flash(&pages(1), |_, _, _| {}).unwrap();
        assert_eq!(report.sync_attempts, 1);
    }

    #[test]
    fn test_page_nak_twice_then_ack() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).nak_page(0x80, 2);
        let mut flasher = flasher(fake);

        let report = flasher.flash(&pages(3), |_, _, _| {}).unwrap();

        assert_eq!(report.page_attempts, vec![1, 3, 1]);
        assert_eq!(flasher.transport().count(Command::ProgPage), 5);
    }

    #[test]
    fn test_page_timeout_is_retried() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).drop_page(0x00, 1);
        let config =
            FlashConfig::default().with_command_timeout(std::time::Duration::from_millis(10));
        let mut flasher = Stk500Flasher::new(fake, config);

        let report = flasher.flash(&pages(2), |_, _, _| {}).unwrap();
        assert_eq!(report.page_attempts, vec![2, 1]);
    }

    #[test]
    fn test_page_write_failed_after_retry_bound() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).nak_page(0x80, 3);
        let mut flasher = flasher(fake);

        let err = flasher.flash(&pages(4), |_, _, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::PageWriteFailed {
                address: 0x80,
                attempts: 3
            }
        ));
        let fake = flasher.into_transport();
        // Page 0 once, page 1 three times, nothing after.
        assert_eq!(fake.count(Command::ProgPage), 4);
        assert_eq!(fake.count(Command::ReadPage), 0);
        assert_eq!(fake.frames().last().unwrap(), &vec![0x51, 0x20]);
    }

    #[test]
    fn test_verify_mismatch_stops_at_page() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).corrupt_read(0x80, 5);
        let mut flasher = flasher(fake);

        let err = flasher.flash(&pages(4), |_, _, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::VerifyMismatch {
                address: 0x80,
                offset: 5
            }
        ));
        assert_eq!(flasher.transport().count(Command::ReadPage), 2);
    }

    #[test]
    fn test_read_back_timeout_is_retried() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).drop_read(0x80, 2);
        let mut flasher = flasher(fake);

        let report = flasher.flash(&pages(4), |_, _, _| {}).unwrap();

        assert!(report.verified);
        assert_eq!(flasher.transport().count(Command::ReadPage), 6);
    }

    #[test]
    fn test_page_read_failed_after_retry_bound() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).drop_read(0x80, 3);
        let mut flasher = flasher(fake);

        let err = flasher.flash(&pages(4), |_, _, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::PageReadFailed {
                address: 0x80,
                attempts: 3
            }
        ));
        let fake = flasher.into_transport();
        // Page 0 once, page 1 three times, nothing after.
        assert_eq!(fake.count(Command::ReadPage), 4);
        // The page at 0x100 is addressed once, while programming.
        let page_2 = vec![0x55, 0x80, 0x00, 0x20];
        assert_eq!(fake.frames().iter().filter(|&f| f == &page_2).count(), 1);
        assert_eq!(fake.frames().last().unwrap(), &vec![0x51, 0x20]);
    }

    #[test]
    fn test_verify_disabled_skips_read_back() {
        init_logger();
        let config = FlashConfig::default().with_verify(false);
        let mut flasher = Stk500Flasher::new(FakeBootloader::new(Device::Atmega328p), config);
        let mut phases = Vec::new();

        let report = flasher
            .flash(&pages(2), |phase, _, _| phases.push(phase))
            .unwrap();

        assert!(!report.verified);
        assert!(!phases.contains(&Phase::Verifying));
        assert_eq!(flasher.transport().count(Command::ReadPage), 0);
    }

    #[test]
    fn test_signature_mismatch_is_reported() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).with_signature([0x1E, 0x94, 0x06]);
        let mut flasher = flasher(fake);

        let err = flasher.flash(&pages(1), |_, _, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::SignatureMismatch {
                expected: [0x1E, 0x95, 0x0F],
                actual: [0x1E, 0x94, 0x06],
            }
        ));
        assert_eq!(flasher.transport().count(Command::ProgPage), 0);
        assert_eq!(flasher.transport().count(Command::LeaveProgmode), 1);
    }

    #[test]
    fn test_signature_check_can_be_disabled() {
        init_logger();
        let fake = FakeBootloader::new(Device::Atmega328p).with_signature([0x1E, 0x94, 0x06]);
        let config = FlashConfig::default().with_signature_check(false);
        let mut flasher = Stk500Flasher::new(fake, config);

        let report = flasher.flash(&pages(1), |_, _, _| {}).unwrap();
        assert_eq!(report.info.signature, Some([0x1E, 0x94, 0x06]));
    }

    #[test]
    fn test_cancel_between_pages() {
        init_logger();
        let token = CancelToken::new();
        let trigger = token.clone();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p)).with_cancel(token);

        let err = flasher
            .flash(&pages(4), |phase, done, _| {
                if phase == Phase::Programming && done == 1 {
                    trigger.cancel();
                }
            })
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(flasher.transport().count(Command::ProgPage), 1);
    }

    #[test]
    fn test_connection_error_is_not_retried() {
        init_logger();
        // 1 sync + 3 parameters + 3 setup + 1 signature + 1 LOAD_ADDRESS
        let fake = FakeBootloader::new(Device::Atmega328p).fail_after(9);
        let mut flasher = flasher(fake);

        let err = flasher.flash(&pages(2), |_, _, _| {}).unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(flasher.transport().frames().len(), 9);
    }

    #[test]
    fn test_page_outside_flash_is_rejected_before_io() {
        init_logger();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let page = Page::new(0x8000, vec![0; 128]);

        let err = flasher.flash(&[page], |_, _, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::AddressOutOfRange {
                address: 0x8000,
                limit: 0x8000
            }
        ));
        assert!(flasher.transport().frames().is_empty());
    }

    #[test]
    fn test_unaligned_page_is_rejected_before_io() {
        init_logger();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let page = Page::new(0x40, vec![0xAB; 128]);

        let err = flasher.flash(&[page], |_, _, _| {}).unwrap_err();

        assert!(matches!(err, Error::Config(ref msg) if msg.contains("not aligned")));
        assert!(flasher.transport().frames().is_empty());
    }

    #[test]
    fn test_pages_out_of_order_are_rejected_before_io() {
        init_logger();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let mut reversed = pages(2);
        reversed.reverse();

        let err = flasher.flash(&reversed, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("out of order")));

        let twice = [pages(1), pages(1)].concat();
        let err = flasher.flash(&twice, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("out of order")));

        assert!(flasher.transport().frames().is_empty());
    }

    #[test]
    fn test_set_device_advertises_configured_page_size() {
        init_logger();
        let config = FlashConfig::default().with_page_size(64);
        let mut flasher = Stk500Flasher::new(FakeBootloader::new(Device::Atmega328p), config);
        let pages = [Page::new(0x00, vec![0x11; 64]), Page::new(0x40, vec![0x22; 64])];

        flasher.flash(&pages, |_, _, _| {}).unwrap();

        let fake = flasher.into_transport();
        let set_device = fake
            .frames()
            .iter()
            .find(|f| f[0] == Command::SetDevice as u8)
            .unwrap();
        assert_eq!(&set_device[13..15], &[0x00, 0x40]);
        assert_eq!(&fake.flash()[0x40..0x80], &[0x22; 64]);
    }

    #[test]
    fn test_progress_reports_each_phase() {
        init_logger();
        let mut flasher = flasher(FakeBootloader::new(Device::Atmega328p));
        let mut events = Vec::new();

        flasher
            .flash(&pages(2), |phase, done, total| events.push((phase, done, total)))
            .unwrap();

        assert_eq!(
            events,
            vec![
                (Phase::Syncing, 0, 2),
                (Phase::Programming, 0, 2),
                (Phase::Programming, 1, 2),
                (Phase::Programming, 2, 2),
                (Phase::Verifying, 0, 2),
                (Phase::Verifying, 1, 2),
                (Phase::Verifying, 2, 2),
                (Phase::Done, 2, 2),
            ]
        );
    }

    #[test]
    fn test_phase_terminal_states() {
        assert!(Phase::Done.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Programming.is_terminal());
        assert_eq!(Phase::Verifying.to_string(), "Verifying");
    }
}
