//! Raw flash device trait
//!
//! Models a byte-addressed NOR flash: reads have no alignment rules,
//! programming only clears bits (1 -> 0) and may be split by the hardware at
//! page boundaries, and erasing restores whole sectors to 0xFF.

/// Physical layout of a flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashGeometry {
    /// Total device size in bytes
    pub size: u32,
    /// Hardware program page size in bytes
    pub page_size: u32,
    /// Erase sector size in bytes
    pub sector_size: u32,
}

impl FlashGeometry {
    /// Number of erase sectors on the device
    pub fn sector_count(&self) -> u32 {
        self.size / self.sector_size
    }
}

/// Errors from raw flash operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address or length falls outside the device
    OutOfBounds,
    /// The device reported a failure
    Device,
}

/// Trait for raw flash devices
///
/// Implementations expose the three hardware primitives (read, page program,
/// sector erase) plus optional memory-mapped access. Correct sequencing of
/// these primitives - page splitting, erase-before-write analysis, cache
/// flushing - is handled above this trait.
pub trait FlashDevice {
    /// Get the device geometry
    fn geometry(&self) -> FlashGeometry;

    /// Read `buf.len()` bytes starting at `addr`
    ///
    /// No alignment constraints; `addr + buf.len()` must be inside the device.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program bytes starting at `addr`, returning how many were accepted
    ///
    /// Programming can only clear bits. The hardware may silently truncate
    /// the burst at a page boundary; callers must re-issue the remaining
    /// tail until the full length has been programmed.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<usize, FlashError>;

    /// Erase the sector containing `addr` back to all-0xFF
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Erase the entire device
    fn chip_erase(&mut self) -> Result<(), FlashError>;

    /// Memory-mapped read window covering the whole device, if the hardware
    /// provides one
    fn mapped(&self) -> Option<&[u8]> {
        None
    }

    /// Whether `buf` aliases the device's memory-mapped window
    ///
    /// The hardware cannot source page-program data from the region it is
    /// simultaneously programming; when this returns true the caller must
    /// stage the data through RAM first.
    fn buffer_in_window(&self, _buf: &[u8]) -> bool {
        false
    }

    /// Invalidate any read cache in front of the device
    fn flush_cache(&mut self) {}
}
