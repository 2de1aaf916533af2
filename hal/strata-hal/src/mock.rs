//! In-memory mock flash device
//!
//! Deterministic [`FlashDevice`] implementation for host tests. It reproduces
//! the behaviors the storage engine has to cope with: AND-semantics
//! programming, bursts truncated at page boundaries, and power loss that
//! tears the final program operation.

use crate::flash::{FlashDevice, FlashError, FlashGeometry};

/// Upper bound on sectors a mock device can have (for erase bookkeeping)
pub const MAX_MOCK_SECTORS: usize = 256;

/// Mock flash backed by a byte array, starting fully erased.
pub struct MockFlash<const SIZE: usize> {
    mem: [u8; SIZE],
    page_size: u32,
    sector_size: u32,
    erase_counts: [u32; MAX_MOCK_SECTORS],
    flush_count: u32,
    program_ops: u32,
    /// Remaining operations that still complete. `Some(0)` means the next
    /// program op is torn (half applied) and everything after it fails.
    op_budget: Option<u32>,
    report_in_window: bool,
}

impl<const SIZE: usize> MockFlash<SIZE> {
    /// Create a mock device with the given page and sector sizes
    pub fn new(page_size: u32, sector_size: u32) -> Self {
        debug_assert!(SIZE as u32 % sector_size == 0);
        debug_assert!(sector_size % page_size == 0);
        debug_assert!((SIZE as u32 / sector_size) as usize <= MAX_MOCK_SECTORS);
        Self {
            mem: [0xFF; SIZE],
            page_size,
            sector_size,
            erase_counts: [0; MAX_MOCK_SECTORS],
            flush_count: 0,
            program_ops: 0,
            op_budget: None,
            report_in_window: false,
        }
    }

    /// Direct view of the backing memory
    pub fn mem(&self) -> &[u8] {
        &self.mem
    }

    /// Overwrite the backing memory without program semantics (test setup)
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        self.mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    /// How many times a sector has been erased
    pub fn erase_count(&self, sector: u32) -> u32 {
        self.erase_counts[sector as usize]
    }

    /// How many cache flushes the device has seen
    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    /// How many program operations have been issued
    pub fn program_ops(&self) -> u32 {
        self.program_ops
    }

    /// Allow `budget` more operations to complete, then simulate power loss:
    /// the next program op applies only half its data and fails, and every
    /// operation after that fails outright.
    pub fn set_op_budget(&mut self, budget: u32) {
        self.op_budget = Some(budget);
    }

    /// Clear a previously set operation budget
    pub fn clear_op_budget(&mut self) {
        self.op_budget = None;
    }

    /// Make `buffer_in_window` report true, forcing the staged write path
    pub fn set_report_in_window(&mut self, on: bool) {
        self.report_in_window = on;
    }

    fn spend_op(&mut self) -> bool {
        match self.op_budget {
            None => true,
            Some(0) => false,
            Some(ref mut n) => {
                *n -= 1;
                true
            }
        }
    }
}

impl<const SIZE: usize> FlashDevice for MockFlash<SIZE> {
    fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            size: SIZE as u32,
            page_size: self.page_size,
            sector_size: self.sector_size,
        }
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let end = addr as usize + buf.len();
        if end > SIZE {
            return Err(FlashError::OutOfBounds);
        }
        buf.copy_from_slice(&self.mem[addr as usize..end]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<usize, FlashError> {
        let start = addr as usize;
        if start + data.len() > SIZE {
            return Err(FlashError::OutOfBounds);
        }
        // Hardware truncates the burst at the page boundary
        let page_room = self.page_size as usize - (start % self.page_size as usize);
        let chunk = data.len().min(page_room);

        if !self.spend_op() {
            // Torn program: half the burst lands, then the power is gone
            for i in 0..chunk / 2 {
                self.mem[start + i] &= data[i];
            }
            return Err(FlashError::Device);
        }

        for i in 0..chunk {
            self.mem[start + i] &= data[i];
        }
        self.program_ops += 1;
        Ok(chunk)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if addr as usize >= SIZE {
            return Err(FlashError::OutOfBounds);
        }
        if !self.spend_op() {
            return Err(FlashError::Device);
        }
        let sector = addr / self.sector_size;
        let base = (sector * self.sector_size) as usize;
        self.mem[base..base + self.sector_size as usize].fill(0xFF);
        self.erase_counts[sector as usize] += 1;
        Ok(())
    }

    fn chip_erase(&mut self) -> Result<(), FlashError> {
        if !self.spend_op() {
            return Err(FlashError::Device);
        }
        self.mem.fill(0xFF);
        Ok(())
    }

    fn mapped(&self) -> Option<&[u8]> {
        Some(&self.mem)
    }

    fn buffer_in_window(&self, _buf: &[u8]) -> bool {
        self.report_in_window
    }

    fn flush_cache(&mut self) {
        self.flush_count += 1;
    }
}
