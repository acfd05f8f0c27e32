//! Page-based flash erase, read and write on top of the register protocol.
//!
//! The device keeps its own flash cursor: it is set through the address
//! register and advances by one page after each completed Read or Write
//! operation. Read and write loops set the address once and then depend on
//! that auto-advance, so no other register traffic may be interleaved with
//! a loop in progress.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::*;
use crate::{Device, Error, I2cBus};

/// Phase of a flash operation, reported to progress callbacks
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Erase,
    Write,
    Verify,
    Read,
}

impl<I, D, E> Device<I, D, E>
where
    I: I2cBus<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn page_size(&self) -> usize {
        self.info().page_size as usize
    }

    /// Number of pages spanned by `len` bytes
    pub fn page_count(&self, len: usize) -> usize {
        let ps = self.page_size();
        (len + ps - 1) / ps
    }

    fn check_length(&self, requested: usize) -> Result<(), Error<E>> {
        let available = self.info().available_bytes();
        if requested > available {
            error!("Cannot access more than {} bytes of flash (requested {})", available, requested);
            return Err(Error::SizeLimitExceeded { requested, available });
        }
        Ok(())
    }

    /// Erase `count` pages from the start of application flash
    pub fn erase(&mut self, count: usize) -> Result<(), Error<E>> {
        self.erase_pages(count, &mut |_, _, _| ())
    }

    fn erase_pages<F>(&mut self, count: usize, progress: &mut F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        let prog_start = self.info().prog_start;
        let ps = self.info().page_size as u32;
        let gap = self.options().erase_delay_ms;

        info!("Erasing {} pages from 0x{:08x}", count, prog_start);

        for page in 0..count {
            let address = prog_start + page as u32 * ps;

            self.set_address(address)?;
            self.run_op(ProgOp::ErasePage, gap)?;

            let code = self.error_status()?;
            if code != 0 {
                error!("Flash erase failed at 0x{:08x} for page {}/{} with error code 0x{:02x}", address, page, count, code);
                return Err(Error::FlashEraseFailed { address, page, count, code });
            }

            debug!("Erased page {} at 0x{:08x}", page, address);
            progress(Stage::Erase, page + 1, count);
        }

        Ok(())
    }

    /// Read application flash into `data`, starting at the program start address
    pub fn read(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        self.read_cb(data, |_, _, _| ())
    }

    /// Read application flash into `data`, calling `progress` after each page
    pub fn read_cb<F>(&mut self, data: &mut [u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        self.check_length(data.len())?;
        self.read_pages(data, Stage::Read, &mut progress)
    }

    /// Read `length` bytes of application flash, or all of it when `None`
    pub fn read_flash(&mut self, length: Option<usize>) -> Result<Vec<u8>, Error<E>> {
        let length = length.unwrap_or_else(|| self.info().available_bytes());

        let mut data = vec![0u8; length];
        self.read(&mut data)?;

        Ok(data)
    }

    fn read_pages<F>(&mut self, data: &mut [u8], stage: Stage, progress: &mut F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        let mut page = [0u8; MAX_PAGE_SIZE];
        let prog_start = self.info().prog_start;
        let ps = self.page_size();
        let gap = self.options().read_delay_ms;
        let total = data.len();

        info!("Reading {} bytes from 0x{:08x} in pages of {} bytes", total, prog_start, ps);

        self.set_address(prog_start)?;

        for (index, chunk) in data.chunks_mut(ps).enumerate() {
            self.run_op(ProgOp::Read, gap)?;
            self.advance_cursor();

            self.read_registers(Register::Data, &mut page[..ps])?;
            chunk.copy_from_slice(&page[..chunk.len()]);

            progress(stage, index * ps + chunk.len(), total);
        }

        Ok(())
    }

    fn write_pages<F>(&mut self, image: &[u8], progress: &mut F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        let mut page = [0u8; MAX_PAGE_SIZE];
        let prog_start = self.info().prog_start;
        let ps = self.page_size();
        let gap = self.options().write_delay_ms;
        let total = image.len();

        for (index, chunk) in image.chunks(ps).enumerate() {
            let address = prog_start + (index * ps) as u32;

            // Short final pages are padded with zeros
            page[..ps].iter_mut().for_each(|b| *b = 0);
            page[..chunk.len()].copy_from_slice(chunk);

            self.write_registers(Register::Data, &page[..ps])?;
            self.run_op(ProgOp::Write, gap)?;
            self.advance_cursor();

            let code = self.error_status()?;
            if code != 0 {
                error!("Flash write failed at 0x{:08x} with error code 0x{:02x}", address, code);
                return Err(Error::FlashWriteFailed { address, code });
            }

            debug!("Wrote page {} at 0x{:08x}", index, address);
            progress(Stage::Write, index * ps + chunk.len(), total);
        }

        Ok(())
    }

    /// Erase, program and verify `image` at the program start address
    pub fn write(&mut self, image: &[u8]) -> Result<(), Error<E>> {
        self.write_cb(image, |_, _, _| ())
    }

    /// Erase, program and verify `image`, calling `progress` after each page
    /// of each stage.
    ///
    /// The read-back must match the image exactly, the first differing byte
    /// is reported as [`Error::FlashVerifyMismatch`].
    pub fn write_cb<F>(&mut self, image: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        self.check_length(image.len())?;

        let prog_start = self.info().prog_start;
        let count = self.page_count(image.len());

        self.erase_pages(count, &mut progress)?;

        info!("Writing {} bytes to 0x{:08x}", image.len(), prog_start);
        self.set_address(prog_start)?;
        self.write_pages(image, &mut progress)?;

        let mut readback = vec![0u8; image.len()];
        self.read_pages(&mut readback, Stage::Verify, &mut progress)?;

        let offset = match image.iter().zip(readback.iter()).position(|(a, b)| a != b) {
            Some(i) => i,
            None => {
                info!("Flash content verified");
                return Ok(());
            }
        };

        let start = offset & !0xf;
        let end = usize::min(start + 16, image.len());
        let status = self.error_status().ok();

        let address = prog_start + offset as u32;
        error!(
            "Inconsistent flash at 0x{:08x}, expected 0x{:02x}, found 0x{:02x}",
            address, image[offset], readback[offset]
        );

        Err(Error::FlashVerifyMismatch {
            address,
            offset,
            expected: image[offset],
            found: readback[offset],
            window: prog_start + start as u32,
            expected_window: image[start..end].to_vec(),
            found_window: readback[start..end].to_vec(),
            status,
        })
    }
}
