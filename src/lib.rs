//! I2C Register Bootloader.
//!
//! Host side of a register-mapped bootloader protocol: the device exposes a
//! small register file over I2C, through which flash pages are erased,
//! programmed and read back one at a time.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod chip;
pub mod flash;
pub mod protocol;

#[cfg(test)]
mod mock;

pub use flash::Stage;
use protocol::*;

/// I2C bus able to perform register reads and writes
pub trait I2cBus<E>: Write<Error = E> + WriteRead<Error = E> {}

impl<T, E> I2cBus<E> for T where T: Write<Error = E> + WriteRead<Error = E> {}

#[derive(Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("failed to open I2C bus {bus}: {error:?}")]
    BusOpenFailed { bus: u32, error: E },

    #[error("incorrect device signature at address 0: {0:02x?}")]
    SignatureMismatch([u8; 4]),

    #[error("unsupported page size {0} (maximum 4096)")]
    UnsupportedPageSize(u16),

    #[error("transport error: {0:?}")]
    Transport(E),

    #[error("timed out waiting for {0} to execute")]
    OperationTimeout(ProgOp),

    #[error("flash erase failed at 0x{address:08x} for page {page}/{count} with error code 0x{code:02x}")]
    FlashEraseFailed {
        address: u32,
        page: usize,
        count: usize,
        code: u8,
    },

    #[error("flash write failed at 0x{address:08x} with error code 0x{code:02x}")]
    FlashWriteFailed { address: u32, code: u8 },

    #[error(
        "inconsistent flash at 0x{address:08x} (start+{offset}), expected 0x{expected:02x}, found 0x{found:02x} \
         (file 0x{window:08x}: {}, read 0x{window:08x}: {}, error status {status:02x?})",
        hex::encode(.expected_window),
        hex::encode(.found_window)
    )]
    FlashVerifyMismatch {
        /// Absolute flash address of the first differing byte
        address: u32,
        /// Offset of the differing byte in the image
        offset: usize,
        expected: u8,
        found: u8,
        /// 16-byte aligned address of the context windows
        window: u32,
        expected_window: Vec<u8>,
        found_window: Vec<u8>,
        /// Error status byte at the time of the mismatch, if readable
        status: Option<u8>,
    },

    #[error("inconsistent self test at byte {0}")]
    SelfTestMismatch(usize),

    #[error("cannot access more than {available} bytes of flash (requested {requested})")]
    SizeLimitExceeded { requested: usize, available: usize },
}

impl<E: Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Delay between status polls while erasing a page
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub erase_delay_ms: u32,

    /// Delay between status polls while writing a page
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub write_delay_ms: u32,

    /// Delay between status polls while reading a page
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub read_delay_ms: u32,

    /// Number of status polls before an operation times out
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub poll_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            erase_delay_ms: 50,
            write_delay_ms: 3,
            read_delay_ms: 1,
            poll_attempts: 3,
        }
    }
}

/// Descriptor reported by the bootloader at handshake
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct DeviceInfo {
    pub mcu_id: u32,
    pub page_size: u16,
    /// Total flash size in kilobytes
    pub flash_size: u16,
    pub prog_start: u32,
    pub version: u8,
}

impl DeviceInfo {
    /// Decode the little-endian descriptor header
    pub fn parse(header: &[u8; HEADER_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([header[i], header[i + 1]]);
        let u32_at = |i: usize| {
            u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };

        Self {
            mcu_id: u32_at(Register::McuId as usize),
            page_size: u16_at(Register::PageSize as usize),
            flash_size: u16_at(Register::FlashSize as usize),
            prog_start: u32_at(Register::ProgStart as usize),
            version: header[Register::Version as usize],
        }
    }

    pub fn family(&self) -> Option<&'static str> {
        chip::family(self.mcu_id)
    }

    /// Size of the bootloader in kilobytes
    pub fn bootloader_kb(&self) -> u16 {
        ((self.prog_start & 0xffff) / 1024) as u16
    }

    /// Bytes of flash available to the application
    pub fn available_bytes(&self) -> usize {
        self.flash_size.saturating_sub(self.bootloader_kb()) as usize * 1024
    }
}

/// Session with a device in bootloader mode
///
/// A session owns its bus for its whole lifetime and must be driven by a
/// single caller; flash read and write loops rely on the device cursor
/// advancing undisturbed between pages.
pub struct Device<I, D, E> {
    address: u8,
    info: DeviceInfo,
    options: Options,
    i2c: I,
    delay: D,
    /// Device flash cursor as last set or advanced, None when unknown
    cursor: Option<u32>,
    _err: PhantomData<E>,
}

impl<I, D, E> Device<I, D, E>
where
    I: I2cBus<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Connect to the bootloader at `address`, validating its signature
    /// and reading the device descriptor.
    ///
    /// On failure the bus is dropped, releasing it.
    pub fn open(i2c: I, delay: D, address: u8, options: Options) -> Result<Self, Error<E>> {
        let mut s = Self {
            address,
            info: DeviceInfo::default(),
            options,
            i2c,
            delay,
            cursor: None,
            _err: PhantomData,
        };

        debug!("Reading signature from 0x{:02x}", address);

        let mut marker = [0u8; 4];
        s.read_registers(Register::Marker, &mut marker)?;
        if marker != SIGNATURE {
            error!("Incorrect device signature: {:02x?}", marker);
            return Err(Error::SignatureMismatch(marker));
        }

        let mut header = [0u8; HEADER_LEN];
        s.read_registers(Register::Marker, &mut header)?;
        let info = DeviceInfo::parse(&header);

        if info.page_size == 0 || info.page_size as usize > MAX_PAGE_SIZE {
            error!("Device reports unsupported page size {}", info.page_size);
            return Err(Error::UnsupportedPageSize(info.page_size));
        }

        debug!("Connected to bootloader: {:?}", info);
        s.info = info;

        Ok(s)
    }

    /// Close the session, returning the underlying bus
    pub fn close(self) -> I {
        debug!("Closing session with 0x{:02x}", self.address);
        self.i2c
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Host-side view of the device flash cursor
    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    /// Write `data` to consecutive registers starting at `reg`
    pub fn write_registers(&mut self, reg: Register, data: &[u8]) -> Result<(), Error<E>> {
        self.write_at(reg.offset(), data)
    }

    /// Read consecutive registers starting at `reg` into `data`
    pub fn read_registers(&mut self, reg: Register, data: &mut [u8]) -> Result<(), Error<E>> {
        self.read_at(reg.offset(), data)
    }

    pub fn write_register_byte(&mut self, reg: Register, value: u8) -> Result<(), Error<E>> {
        self.write_at(reg.offset(), &[value])
    }

    pub fn read_register_byte(&mut self, reg: Register) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.read_at(reg.offset(), &mut b)?;
        Ok(b[0])
    }

    // Register offsets are a single byte on the wire and wrap past 0xff,
    // so pages larger than the data window rely on the device mapping
    // wrapped offsets back into its page buffer.
    fn write_at(&mut self, mut offset: u8, data: &[u8]) -> Result<(), Error<E>> {
        let mut buff = [0u8; MAX_CHUNK + 1];

        for chunk in data.chunks(MAX_CHUNK) {
            buff[0] = offset;
            buff[1..=chunk.len()].copy_from_slice(chunk);

            trace!("Write {} bytes at register {}", chunk.len(), offset);
            self.i2c.write(self.address, &buff[..=chunk.len()])?;

            offset = offset.wrapping_add(chunk.len() as u8);
        }

        Ok(())
    }

    fn read_at(&mut self, mut offset: u8, data: &mut [u8]) -> Result<(), Error<E>> {
        for chunk in data.chunks_mut(MAX_CHUNK) {
            let n = chunk.len();

            trace!("Read {} bytes at register {}", n, offset);
            self.i2c.write_read(self.address, &[offset], chunk)?;

            offset = offset.wrapping_add(n as u8);
        }

        Ok(())
    }

    /// Read the error status of the last flash operation
    pub fn error_status(&mut self) -> Result<u8, Error<E>> {
        self.read_register_byte(Register::ErrorStatus)
    }

    /// Set the flash target address, moving the device cursor
    pub fn set_address(&mut self, addr: u32) -> Result<(), Error<E>> {
        self.write_registers(Register::Address, &addr.to_le_bytes())?;
        self.cursor = Some(addr);
        Ok(())
    }

    /// Read back the flash target address register
    pub fn read_address(&mut self) -> Result<u32, Error<E>> {
        let mut b = [0u8; 4];
        self.read_registers(Register::Address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Issue a program operation and poll until the device reports it
    /// complete, waiting `gap_ms` before each poll.
    pub fn run_op(&mut self, op: ProgOp, gap_ms: u32) -> Result<(), Error<E>> {
        self.write_register_byte(Register::ProgOp, op.code())?;

        for attempt in 0..self.options.poll_attempts {
            self.delay.delay_ms(gap_ms);

            let v = self.read_register_byte(Register::ProgOp)?;
            if v == ProgOp::None.code() {
                trace!("{} complete after {} polls", op, attempt + 1);
                return Ok(());
            }
        }

        error!("Timed out waiting for {} to execute", op);
        Err(Error::OperationTimeout(op))
    }

    pub(crate) fn advance_cursor(&mut self) {
        let step = self.info.page_size as u32;
        self.cursor = self.cursor.map(|c| c.wrapping_add(step));
    }

    /// Request the device leave bootloader mode
    pub fn exit(&mut self) -> Result<(), Error<E>> {
        debug!("Requesting bootloader exit");
        self.write_register_byte(Register::ProgOp, ProgOp::Exit.code())?;
        self.cursor = None;
        Ok(())
    }

    /// Loopback check of the data window, independent of flash
    pub fn self_test(&mut self) -> Result<(), Error<E>> {
        let mut buff = [0u8; 64];
        for (i, b) in buff.iter_mut().enumerate() {
            *b = (63 - i) as u8;
        }

        self.write_registers(Register::Data, &buff)?;

        let mut check = [0u8; 64];
        self.read_registers(Register::Data, &mut check)?;

        match buff.iter().zip(check.iter()).position(|(a, b)| a != b) {
            Some(i) => {
                error!("Self test mismatch at byte {}: {:02x} != {:02x}", i, check[i], buff[i]);
                Err(Error::SelfTestMismatch(i))
            }
            None => {
                debug!("Self test passed");
                Ok(())
            }
        }
    }
}
