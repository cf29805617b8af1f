//! A simulated SPI NAND chip for host side testing.
//!
//! [SimNand] decodes every [SpiDevice] transaction as one command, the way the
//! chip sees a chip select window, and keeps the array in memory. Erased bytes
//! read back as 0xFF, programming can only clear bits, and erase or program
//! without the write enable latch, or with any block locked, sets the matching
//! fail bit in the status register.
//!
//! Every array operation leaves the chip busy for a configurable number of
//! status polls. Commands arriving while busy are counted so tests can assert
//! that the driver waited.
extern crate alloc;

use alloc::{collections::BTreeMap, vec, vec::Vec};
use core::marker::PhantomData;
use embedded_hal::spi::{ErrorKind, ErrorType, Operation, SpiDevice};

use crate::{cmd_blocking::SpiNandBlocking, SpiNand};

const OIP: u8 = 0x01;
const WEL: u8 = 0x02;
const E_FAIL: u8 = 0x04;
const P_FAIL: u8 = 0x08;
const ECC_MASK: u8 = 0x70;
const LOCK_BITS: u8 = 0x7C;
const ECC_ENABLE: u8 = 0x10;

const BLOCK_LOCK: u8 = 0xA0;
const CONFIGURATION: u8 = 0xB0;
const STATUS: u8 = 0xC0;

/// A program execute accepted by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Program {
    pub page: u32,
    /// State of the ECC enable bit when the page was programmed
    pub ecc_enabled: bool,
}

enum Phase<'a> {
    None,
    Transmit(&'a [u8]),
    Receive(&'a mut [u8]),
}

/// In-memory chip with the layout of `D`
pub struct SimNand<D> {
    pages: BTreeMap<u32, Vec<u8>>,
    cache: Vec<u8>,
    block_lock: u8,
    configuration: u8,
    status: u8,
    id: [u8; 2],
    ecc_status: u8,
    busy_polls: u32,
    busy_remaining: u32,
    fail_in: Option<usize>,
    /// Opcode of every command received
    pub commands: Vec<u8>,
    /// Every set feature as (address, value)
    pub feature_writes: Vec<(u8, u8)>,
    /// Every accepted program execute
    pub programs: Vec<Program>,
    /// Commands other than a status poll received while an operation was in progress
    pub busy_violations: usize,
    _device: PhantomData<D>,
}

impl<D: SpiNand> SimNand<D> {
    /// Erased chip in its power on state: all blocks locked, ECC enabled
    pub fn new() -> Self {
        SimNand {
            pages: BTreeMap::new(),
            cache: vec![0xFF; D::RAW_PAGE_SIZE as usize],
            block_lock: LOCK_BITS,
            configuration: ECC_ENABLE,
            status: 0,
            id: [D::JEDEC_MANUFACTURER_ID, D::JEDEC_DEVICE_ID],
            ecc_status: 0,
            busy_polls: 1,
            busy_remaining: 0,
            fail_in: None,
            commands: Vec::new(),
            feature_writes: Vec::new(),
            programs: Vec::new(),
            busy_violations: 0,
            _device: PhantomData,
        }
    }

    /// Number of status polls reporting busy after each array operation
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Report a different part on read ID
    pub fn set_id(&mut self, manufacturer: u8, device: u8) {
        self.id = [manufacturer, device];
    }

    /// ECC status (0 to 7) reported by following page reads
    pub fn set_ecc_status(&mut self, ecc: u8) {
        self.ecc_status = ecc & 0x07;
    }

    /// Let `transactions` transactions succeed, then fail the next one
    pub fn fail_after(&mut self, transactions: usize) {
        self.fail_in = Some(transactions);
    }

    pub fn block_lock(&self) -> u8 {
        self.block_lock
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn set_configuration(&mut self, value: u8) {
        self.configuration = value;
    }

    /// Main and spare bytes of a page as stored in the array
    pub fn raw_page(&self, page: u32) -> Vec<u8> {
        self.pages
            .get(&page)
            .cloned()
            .unwrap_or_else(|| vec![0xFF; D::RAW_PAGE_SIZE as usize])
    }

    /// Store bytes straight into the array, bypassing program rules
    pub fn write_raw(&mut self, page: u32, column: usize, bytes: &[u8]) {
        let stored = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0xFF; D::RAW_PAGE_SIZE as usize]);
        stored[column..column + bytes.len()].copy_from_slice(bytes);
    }

    /// Number of commands received with `opcode`
    pub fn count(&self, opcode: u8) -> usize {
        self.commands.iter().filter(|&&c| c == opcode).count()
    }

    pub fn clear_logs(&mut self) {
        self.commands.clear();
        self.feature_writes.clear();
        self.programs.clear();
        self.busy_violations = 0;
    }

    fn start_busy(&mut self) {
        self.busy_remaining = self.busy_polls;
    }

    fn is_locked(&self) -> bool {
        self.block_lock & LOCK_BITS != 0
    }

    fn page_address(address: &[u8]) -> Result<u32, ErrorKind> {
        let page = u32::from_be_bytes([0, address[0], address[1], address[2]]);
        if page < D::PAGES_PER_BLOCK * D::BLOCK_COUNT {
            Ok(page)
        } else {
            Err(ErrorKind::Other)
        }
    }

    fn column_range(address: &[u8], len: usize) -> Result<core::ops::Range<usize>, ErrorKind> {
        let column = u16::from_be_bytes([address[0], address[1]]) as usize;
        if column + len <= D::RAW_PAGE_SIZE as usize {
            Ok(column..column + len)
        } else {
            Err(ErrorKind::Other)
        }
    }

    fn get_feature(&mut self, address: u8) -> Result<u8, ErrorKind> {
        match address {
            BLOCK_LOCK => Ok(self.block_lock),
            CONFIGURATION => Ok(self.configuration),
            STATUS if self.busy_remaining > 0 => {
                self.busy_remaining -= 1;
                Ok(self.status | OIP)
            }
            STATUS => Ok(self.status),
            _ => Err(ErrorKind::Other),
        }
    }

    fn set_feature(&mut self, address: u8, value: u8) -> Result<(), ErrorKind> {
        self.feature_writes.push((address, value));
        match address {
            BLOCK_LOCK => self.block_lock = value,
            CONFIGURATION => self.configuration = value,
            _ => return Err(ErrorKind::Other),
        }
        Ok(())
    }

    fn page_read(&mut self, page: u32) {
        self.cache = self.raw_page(page);
        self.status &= !ECC_MASK;
        if self.configuration & ECC_ENABLE != 0 {
            self.status |= self.ecc_status << 4;
        }
        self.start_busy();
    }

    fn erase(&mut self, page: u32) {
        if self.status & WEL == 0 || self.is_locked() {
            self.status |= E_FAIL;
        } else {
            self.status &= !E_FAIL;
            let first = page - page % D::PAGES_PER_BLOCK;
            self.pages
                .retain(|&p, _| p < first || p >= first + D::PAGES_PER_BLOCK);
        }
        self.status &= !WEL;
        self.start_busy();
    }

    fn program(&mut self, page: u32) {
        if self.status & WEL == 0 || self.is_locked() {
            self.status |= P_FAIL;
        } else {
            self.status &= !P_FAIL;
            self.programs.push(Program {
                page,
                ecc_enabled: self.configuration & ECC_ENABLE != 0,
            });
            let stored = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0xFF; D::RAW_PAGE_SIZE as usize]);
            for (cell, loaded) in stored.iter_mut().zip(&self.cache) {
                *cell &= *loaded;
            }
        }
        self.status &= !WEL;
        self.start_busy();
    }

    fn command(&mut self, header: &[u8], phase: Phase<'_>) -> Result<(), ErrorKind> {
        let (&opcode, address) = header.split_first().ok_or(ErrorKind::Other)?;
        let address_len = match opcode {
            0xFF | 0x06 | 0x04 => 0,
            0x0F | 0x1F | 0x9F => 1,
            0x02 | 0x84 => 2,
            0x13 | 0xD8 | 0x10 | 0x03 => 3,
            _ => return Err(ErrorKind::Other),
        };
        if address.len() != address_len {
            return Err(ErrorKind::Other);
        }
        let status_poll = opcode == 0x0F && address == [STATUS];
        if self.busy_remaining > 0 && !status_poll {
            self.busy_violations += 1;
        }
        self.commands.push(opcode);

        match (opcode, phase) {
            (0xFF, Phase::None) => {
                self.status = 0;
                self.cache.fill(0xFF);
                self.start_busy();
            }
            (0x0F, Phase::Receive(buf)) if buf.len() == 1 => buf[0] = self.get_feature(address[0])?,
            (0x1F, Phase::Transmit(&[value])) => self.set_feature(address[0], value)?,
            (0x9F, Phase::Receive(buf)) => {
                for (byte, id) in buf.iter_mut().zip(self.id) {
                    *byte = id;
                }
            }
            (0x13, Phase::None) => {
                let page = Self::page_address(address)?;
                self.page_read(page);
            }
            (0x03, Phase::Receive(buf)) => {
                let range = Self::column_range(address, buf.len())?;
                buf.copy_from_slice(&self.cache[range]);
            }
            (0x06, Phase::None) => self.status |= WEL,
            (0x04, Phase::None) => self.status &= !WEL,
            (0xD8, Phase::None) => {
                let page = Self::page_address(address)?;
                self.erase(page);
            }
            (0x02, Phase::Transmit(buf)) => {
                let range = Self::column_range(address, buf.len())?;
                self.cache.fill(0xFF);
                self.cache[range].copy_from_slice(buf);
            }
            (0x84, Phase::Transmit(buf)) => {
                let range = Self::column_range(address, buf.len())?;
                self.cache[range].copy_from_slice(buf);
            }
            (0x10, Phase::None) => {
                let page = Self::page_address(address)?;
                self.program(page);
            }
            _ => return Err(ErrorKind::Other),
        }
        Ok(())
    }
}

impl<D: SpiNand> Default for SimNand<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> ErrorType for SimNand<D> {
    type Error = ErrorKind;
}

impl<D: SpiNand> SpiDevice for SimNand<D> {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        if let Some(remaining) = self.fail_in.as_mut() {
            if *remaining == 0 {
                self.fail_in = None;
                return Err(ErrorKind::Other);
            }
            *remaining -= 1;
        }
        let (header, data) = match operations {
            [Operation::Write(header), data @ ..] => (header.to_vec(), data),
            _ => return Err(ErrorKind::Other),
        };
        let phase = match data {
            [] => Phase::None,
            [Operation::Write(buf)] => Phase::Transmit(*buf),
            [Operation::Read(buf)] => Phase::Receive(&mut **buf),
            _ => return Err(ErrorKind::Other),
        };
        self.command(&header, phase)
    }
}

/// Small part with the Micron command set used by host side tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TestChip;

impl SpiNand for TestChip {
    const PAGE_SIZE: u32 = 2048;
    const OOB_SIZE: u32 = 64;
    const PAGES_PER_BLOCK: u32 = 64;
    const BLOCK_COUNT: u32 = 8;
    const JEDEC_MANUFACTURER_ID: u8 = 0x2C;
    const JEDEC_DEVICE_ID: u8 = 0x14;
    const BUSY_POLL_LIMIT: u32 = 32;
}

impl<SPI: SpiDevice> SpiNandBlocking<SPI> for TestChip {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn send(sim: &mut SimNand<TestChip>, header: &[u8], data: &[u8]) -> Result<(), ErrorKind> {
        if data.is_empty() {
            sim.transaction(&mut [Operation::Write(header)])
        } else {
            sim.transaction(&mut [Operation::Write(header), Operation::Write(data)])
        }
    }

    #[test]
    fn program_only_clears_bits() {
        let mut sim = SimNand::<TestChip>::new().with_busy_polls(0);
        sim.block_lock = 0;
        send(&mut sim, &[0x06], &[]).unwrap();
        send(&mut sim, &[0x02, 0x00, 0x00], &[0x0F, 0xF0]).unwrap();
        send(&mut sim, &[0x10, 0, 0, 3], &[]).unwrap();
        send(&mut sim, &[0x06], &[]).unwrap();
        send(&mut sim, &[0x02, 0x00, 0x00], &[0x3C, 0xFF]).unwrap();
        send(&mut sim, &[0x10, 0, 0, 3], &[]).unwrap();
        assert_eq!(&sim.raw_page(3)[..3], &[0x0C, 0xF0, 0xFF]);
        assert_eq!(sim.programs.len(), 2);
    }

    #[test]
    fn program_without_write_enable_fails() {
        let mut sim = SimNand::<TestChip>::new().with_busy_polls(0);
        sim.block_lock = 0;
        send(&mut sim, &[0x02, 0x00, 0x00], &[0x00]).unwrap();
        send(&mut sim, &[0x10, 0, 0, 0], &[]).unwrap();
        assert_eq!(sim.status & P_FAIL, P_FAIL);
        assert!(sim.programs.is_empty());
        assert_eq!(sim.raw_page(0)[0], 0xFF);
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut sim = SimNand::<TestChip>::new();
        assert_eq!(send(&mut sim, &[0x13, 0, 0], &[]), Err(ErrorKind::Other));
        assert_eq!(send(&mut sim, &[0x42], &[]), Err(ErrorKind::Other));
    }
}
