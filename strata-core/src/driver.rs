//! Partition driver capability trait and shared sector buffers
//!
//! A partition driver turns partition-relative offsets into flash operations
//! using one of the access strategies in `strata-drivers`. The trait is the
//! uniform capability set; `erase`, `pointer` and `flush` are optional and
//! default to declining.

use embassy_sync::blocking_mutex::raw::RawMutex;
use strata_hal::FlashDevice;

use crate::device::Flash;
use crate::error::{Result, StorageError};

/// Largest sector size the engine supports buffering for
pub const MAX_SECTOR_SIZE: usize = 4096;

/// RAM-buffering policy for read-modify-write cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferPolicy {
    /// Borrow a buffer on demand; may fail under memory pressure
    Dynamic,
    /// Use the permanently reserved buffer; always available
    Static,
    /// No buffering; writes that need an erase fail
    None,
}

/// Sector-sized scratch buffers shared by all drivers.
///
/// One buffer is permanently reserved for the `Static` policy. The `Dynamic`
/// policy borrows a second buffer whose availability tracks memory pressure
/// from the rest of the system; exhaustion surfaces as a normal
/// [`StorageError::NoBuffer`] write failure.
pub struct SectorScratch {
    static_buf: [u8; MAX_SECTOR_SIZE],
    dynamic_buf: [u8; MAX_SECTOR_SIZE],
    dynamic_available: bool,
}

impl Default for SectorScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorScratch {
    /// Create the scratch buffers, dynamic buffer available
    pub fn new() -> Self {
        Self {
            static_buf: [0; MAX_SECTOR_SIZE],
            dynamic_buf: [0; MAX_SECTOR_SIZE],
            dynamic_available: true,
        }
    }

    /// Model external memory pressure on the dynamic buffer
    pub fn set_dynamic_available(&mut self, available: bool) {
        self.dynamic_available = available;
    }

    /// Borrow a sector buffer according to `policy`
    pub fn acquire(&mut self, policy: BufferPolicy) -> Option<&mut [u8; MAX_SECTOR_SIZE]> {
        match policy {
            BufferPolicy::Static => Some(&mut self.static_buf),
            BufferPolicy::Dynamic if self.dynamic_available => Some(&mut self.dynamic_buf),
            _ => None,
        }
    }
}

/// Uniform capability set implemented by partition drivers.
///
/// All offsets are partition-relative. Drivers never retry: a failed
/// operation is reported once.
pub trait PartitionDriver<D: FlashDevice, M: RawMutex> {
    /// Usable partition size in bytes (logical size for log-structured
    /// drivers)
    fn size(&self) -> u32;

    /// Read into `buf` starting at `offset`, returning bytes read
    fn read(&self, flash: &Flash<D, M>, offset: u32, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at `offset`, returning bytes written
    fn write(
        &mut self,
        flash: &mut Flash<D, M>,
        scratch: &mut SectorScratch,
        offset: u32,
        data: &[u8],
    ) -> Result<usize>;

    /// Erase `[offset, offset + len)`; not all drivers support free-form
    /// erase
    fn erase(&mut self, flash: &mut Flash<D, M>, offset: u32, len: u32) -> Result<()> {
        let _ = (flash, offset, len);
        Err(StorageError::Unsupported)
    }

    /// Direct pointer into mapped memory, for drivers backed by it
    fn pointer<'f>(&self, flash: &'f Flash<D, M>, offset: u32, len: u32) -> Option<&'f [u8]> {
        let _ = (flash, offset, len);
        None
    }

    /// Flush driver state; `free_memory` asks the driver to drop any
    /// releasable RAM
    fn flush(&mut self, flash: &mut Flash<D, M>, free_memory: bool) -> Result<()> {
        let _ = (flash, free_memory);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_buffer_always_available() {
        let mut scratch = SectorScratch::new();
        scratch.set_dynamic_available(false);
        assert!(scratch.acquire(BufferPolicy::Static).is_some());
    }

    #[test]
    fn test_dynamic_buffer_exhaustion() {
        let mut scratch = SectorScratch::new();
        assert!(scratch.acquire(BufferPolicy::Dynamic).is_some());
        scratch.set_dynamic_available(false);
        assert!(scratch.acquire(BufferPolicy::Dynamic).is_none());
    }

    #[test]
    fn test_none_policy_never_buffers() {
        let mut scratch = SectorScratch::new();
        assert!(scratch.acquire(BufferPolicy::None).is_none());
    }
}
