//! Simulated bootloader for unit tests.
//!
//! Implements the register file and page operations over an in-memory
//! flash array, recording bus traffic for inspection.

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};

use crate::protocol::*;

pub const MCU_ID: u32 = 0x1000_6440;
pub const VERSION: u8 = 3;
pub const PROG_START: u32 = 0x0800_1000;

#[derive(Debug, Clone, PartialEq)]
pub struct MockError;

pub struct State {
    pub regs: [u8; 256],
    /// Application flash, starting at `prog_start`
    pub flash: Vec<u8>,
    pub prog_start: u32,
    pub page_size: usize,
    pub cursor: u32,

    /// Never complete operations
    pub stuck: bool,
    pub erase_error: u8,
    pub write_error: u8,
    /// Replace the byte at this flash offset when loading a page for read
    pub corrupt_read: Option<(usize, u8)>,
    /// Invert this data window byte on register reads
    pub corrupt_data: Option<usize>,
    /// Fail the transaction with this index
    pub fail_at: Option<usize>,

    /// (is_write, register offset, payload length) per transaction
    pub chunks: Vec<(bool, u8, usize)>,
    /// Values written to the address register
    pub addresses: Vec<u32>,
    pub ops: Vec<u8>,
    pub polls: usize,
    pub transactions: usize,
    pub closed: bool,
}

impl State {
    fn check_fail(&mut self) -> Result<(), MockError> {
        let n = self.transactions;
        self.transactions += 1;

        match self.fail_at {
            Some(i) if i == n => Err(MockError),
            _ => Ok(()),
        }
    }

    fn page_range(&self) -> Option<std::ops::Range<usize>> {
        let start = self.cursor.checked_sub(self.prog_start)? as usize;
        let end = start + self.page_size;
        if end <= self.flash.len() {
            Some(start..end)
        } else {
            None
        }
    }

    fn execute(&mut self, op: u8) {
        self.ops.push(op);
        if self.stuck {
            return;
        }

        let data = Register::Data as usize;

        match op {
            x if x == ProgOp::ErasePage.code() => {
                if let Some(r) = self.page_range() {
                    self.flash[r].iter_mut().for_each(|b| *b = 0xff);
                }
                self.regs[Register::ErrorStatus as usize] = self.erase_error;
            }
            x if x == ProgOp::Write.code() => {
                if let Some(r) = self.page_range() {
                    let n = r.len();
                    self.flash[r].copy_from_slice(&self.regs[data..data + n]);
                }
                self.cursor += self.page_size as u32;
                self.regs[Register::ErrorStatus as usize] = self.write_error;
            }
            x if x == ProgOp::Read.code() => {
                if let Some(r) = self.page_range() {
                    let start = r.start;
                    let n = r.len();
                    self.regs[data..data + n].copy_from_slice(&self.flash[r]);

                    if let Some((i, v)) = self.corrupt_read {
                        if i >= start && i < start + n {
                            self.regs[data + i - start] = v;
                        }
                    }
                }
                self.cursor += self.page_size as u32;
            }
            _ => (),
        }

        self.regs[Register::ProgOp as usize] = 0;
    }
}

/// Bus handle onto a simulated device
///
/// Dropping the owning handle marks the bus closed.
pub struct MockBus {
    state: Rc<RefCell<State>>,
    owner: bool,
}

impl MockBus {
    pub fn new(page_size: u16, flash_kb: u16, prog_start: u32) -> Self {
        let mut regs = [0u8; 256];
        regs[0..4].copy_from_slice(&SIGNATURE);
        regs[4..8].copy_from_slice(&MCU_ID.to_le_bytes());
        regs[8..10].copy_from_slice(&page_size.to_le_bytes());
        regs[10..12].copy_from_slice(&flash_kb.to_le_bytes());
        regs[12..16].copy_from_slice(&prog_start.to_le_bytes());
        regs[16] = VERSION;

        let boot_kb = (prog_start & 0xffff) as usize / 1024;
        let flash = vec![0u8; (flash_kb as usize).saturating_sub(boot_kb) * 1024];

        let state = State {
            regs,
            flash,
            prog_start,
            page_size: page_size as usize,
            cursor: 0,
            stuck: false,
            erase_error: 0,
            write_error: 0,
            corrupt_read: None,
            corrupt_data: None,
            fail_at: None,
            chunks: vec![],
            addresses: vec![],
            ops: vec![],
            polls: 0,
            transactions: 0,
            closed: false,
        };

        Self {
            state: Rc::new(RefCell::new(state)),
            owner: true,
        }
    }

    /// Non-owning handle for inspecting the device from a test
    pub fn handle(&self) -> Self {
        Self {
            state: self.state.clone(),
            owner: false,
        }
    }

    pub fn state(&self) -> RefMut<'_, State> {
        self.state.borrow_mut()
    }
}

impl Drop for MockBus {
    fn drop(&mut self) {
        if self.owner {
            self.state.borrow_mut().closed = true;
        }
    }
}

impl Write for MockBus {
    type Error = MockError;

    fn write(&mut self, _address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut s = self.state.borrow_mut();
        assert!(!s.closed, "write on closed bus");
        assert!(bytes.len() - 1 <= MAX_CHUNK, "oversized write");

        let offset = bytes[0];
        let data = &bytes[1..];
        s.chunks.push((true, offset, data.len()));
        s.check_fail()?;

        for (i, b) in data.iter().enumerate() {
            s.regs[offset.wrapping_add(i as u8) as usize] = *b;
        }

        let start = offset as usize;
        let end = start + data.len();
        let covers = |r: Register| start <= r as usize && (r as usize) < end;

        if covers(Register::Address) {
            let a = Register::Address as usize;
            let addr = u32::from_le_bytes([s.regs[a], s.regs[a + 1], s.regs[a + 2], s.regs[a + 3]]);
            s.addresses.push(addr);
            s.cursor = addr;
        }
        if covers(Register::ProgOp) {
            let op = s.regs[Register::ProgOp as usize];
            s.execute(op);
        }

        Ok(())
    }
}

impl WriteRead for MockBus {
    type Error = MockError;

    fn write_read(&mut self, _address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), Self::Error> {
        let mut s = self.state.borrow_mut();
        assert!(!s.closed, "read on closed bus");
        assert!(buffer.len() <= MAX_CHUNK, "oversized read");

        let offset = bytes[0];
        s.chunks.push((false, offset, buffer.len()));
        s.check_fail()?;

        if offset == Register::ProgOp as u8 {
            s.polls += 1;
        }

        for (i, b) in buffer.iter_mut().enumerate() {
            let reg = offset.wrapping_add(i as u8) as usize;
            *b = s.regs[reg];

            if let Some(c) = s.corrupt_data {
                if reg == Register::Data as usize + c {
                    *b ^= 0xff;
                }
            }
        }

        Ok(())
    }
}

/// Delay provider recording requested delays instead of sleeping
#[derive(Default)]
pub struct MockDelay {
    pub calls: Vec<u32>,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms);
    }
}
