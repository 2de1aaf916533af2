//! Direct partition driver
//!
//! Write-without-explicit-erase over a raw sector range. Every write first
//! runs the bit-clear feasibility test; data that only clears bits is
//! programmed in place (skipping an already-matching prefix), and only when
//! a byte really needs a 0 -> 1 transition does the driver fall back to a
//! read-overlay-erase-write cycle through a sector buffer.

use embassy_sync::blocking_mutex::raw::RawMutex;
use strata_core::device::{Feasibility, Flash};
use strata_core::driver::{BufferPolicy, PartitionDriver, SectorScratch, MAX_SECTOR_SIZE};
use strata_core::error::{Result, StorageError};
use strata_core::table::{PartitionDescriptor, PartitionFlags};
use strata_hal::{FlashDevice, FlashGeometry};

/// Direct driver state for one bound partition
#[derive(Debug, Clone)]
pub struct DirectDriver {
    base: u32,
    len: u32,
    read_only: bool,
    policy: BufferPolicy,
}

impl DirectDriver {
    /// Try to bind a partition descriptor.
    ///
    /// Declines partitions flagged for the virtual-EEPROM driver; everything
    /// else is accepted.
    pub fn bind(
        geometry: FlashGeometry,
        desc: &PartitionDescriptor,
        policy: BufferPolicy,
    ) -> Option<Self> {
        if desc.flags.contains(PartitionFlags::VES) {
            return None;
        }
        Some(Self {
            base: desc.byte_offset(geometry.sector_size),
            len: desc.byte_len(geometry.sector_size),
            read_only: desc.flags.contains(PartitionFlags::READ_ONLY),
            policy,
        })
    }

    fn clip(&self, offset: u32, len: usize) -> usize {
        if offset >= self.len {
            0
        } else {
            len.min((self.len - offset) as usize)
        }
    }
}

impl<D: FlashDevice, M: RawMutex> PartitionDriver<D, M> for DirectDriver {
    fn size(&self) -> u32 {
        self.len
    }

    fn read(&self, flash: &Flash<D, M>, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let n = self.clip(offset, buf.len());
        if n == 0 {
            return Ok(0);
        }
        flash.read(self.base + offset, &mut buf[..n])
    }

    fn write(
        &mut self,
        flash: &mut Flash<D, M>,
        scratch: &mut SectorScratch,
        offset: u32,
        data: &[u8],
    ) -> Result<usize> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let n = self.clip(offset, data.len());
        if n == 0 {
            return Ok(0);
        }
        let base = self.base;
        let policy = self.policy;

        flash.with_lock(|fl| {
            let sector = fl.erase_size() as usize;
            let mut written = 0usize;
            // The feasibility/RMW cycle runs once per covered sector so an
            // erase in one sector never disturbs its neighbors.
            while written < n {
                let abs = base + offset + written as u32;
                let sec_start = abs - abs % sector as u32;
                let in_sec = (abs - sec_start) as usize;
                let chunk = (n - written).min(sector - in_sec);
                let chunk_data = &data[written..written + chunk];

                match fl.update_possible(abs, chunk_data)? {
                    Feasibility::WritableFrom(skip) => {
                        if skip < chunk {
                            fl.write(abs + skip as u32, &chunk_data[skip..])?;
                        }
                    }
                    Feasibility::NeedsErase => {
                        if sector > MAX_SECTOR_SIZE {
                            return Err(StorageError::NoBuffer);
                        }
                        let buf = scratch.acquire(policy).ok_or(StorageError::NoBuffer)?;
                        let sbuf = &mut buf[..sector];
                        fl.read(sec_start, sbuf)?;
                        sbuf[in_sec..in_sec + chunk].copy_from_slice(chunk_data);
                        fl.erase_region(sec_start, sector as u32)?;
                        fl.write(sec_start, sbuf)?;
                    }
                }
                written += chunk;
            }
            Ok(n)
        })
    }

    fn erase(&mut self, flash: &mut Flash<D, M>, offset: u32, len: u32) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if offset >= self.len || len == 0 {
            return Ok(());
        }
        let len = len.min(self.len - offset);
        flash.erase_region(self.base + offset, len)
    }

    fn pointer<'f>(&self, flash: &'f Flash<D, M>, offset: u32, len: u32) -> Option<&'f [u8]> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        flash.mapped(self.base + offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use strata_core::table::PartitionType;
    use strata_hal::MockFlash;

    type TestFlash = Flash<MockFlash<16384>, NoopRawMutex>;

    fn setup(flags: PartitionFlags, policy: BufferPolicy) -> (TestFlash, DirectDriver, SectorScratch) {
        let flash: TestFlash = Flash::new(MockFlash::new(256, 1024), 0);
        // Sectors 4..16 (12 KiB partition)
        let desc = PartitionDescriptor::new(PartitionType::Generic, flags, 4, 12);
        let driver = DirectDriver::bind(flash.geometry(), &desc, policy).unwrap();
        (flash, driver, SectorScratch::new())
    }

    #[test]
    fn test_declines_ves_partitions() {
        let flash: TestFlash = Flash::new(MockFlash::new(256, 1024), 0);
        let desc =
            PartitionDescriptor::new(PartitionType::Param, PartitionFlags::VES, 0, 2);
        assert!(DirectDriver::bind(flash.geometry(), &desc, BufferPolicy::Static).is_none());
    }

    #[test]
    fn test_write_read_round_trip() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        let data = [1, 2, 3, 4, 5];
        assert_eq!(drv.write(&mut flash, &mut scratch, 10, &data).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(drv.read(&flash, 10, &mut buf).unwrap(), 5);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_clear_only_write_skips_erase() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::None);
        drv.write(&mut flash, &mut scratch, 0, &[0xF0]).unwrap();
        // 0xF0 -> 0x30 only clears bits; works even with no buffer policy
        drv.write(&mut flash, &mut scratch, 0, &[0x30]).unwrap();
        let mut buf = [0u8; 1];
        drv.read(&flash, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x30);
        flash.with_lock(|fl| {
            for s in 0..16 {
                assert_eq!(fl.device().erase_count(s), 0);
            }
        });
    }

    #[test]
    fn test_rmw_preserves_rest_of_sector() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        drv.write(&mut flash, &mut scratch, 0, &[0x11; 64]).unwrap();
        // Forces an erase of the sector; surrounding content must survive
        drv.write(&mut flash, &mut scratch, 8, &[0xFF, 0xFF]).unwrap();
        let mut buf = [0u8; 64];
        drv.read(&flash, 0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert_eq!(&buf[8..10], &[0xFF; 2]);
        assert_eq!(&buf[10..], &[0x11; 54]);
        flash.with_lock(|fl| assert_eq!(fl.device().erase_count(4), 1));
    }

    #[test]
    fn test_write_spanning_sectors() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        let mut data = [0u8; 2000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        assert_eq!(drv.write(&mut flash, &mut scratch, 500, &data).unwrap(), 2000);
        let mut buf = [0u8; 2000];
        drv.read(&flash, 500, &mut buf).unwrap();
        assert_eq!(buf[..], data[..]);
    }

    #[test]
    fn test_no_buffer_policy_fails_on_erase() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::None);
        drv.write(&mut flash, &mut scratch, 0, &[0x00]).unwrap();
        assert_eq!(
            drv.write(&mut flash, &mut scratch, 0, &[0x01]),
            Err(StorageError::NoBuffer)
        );
    }

    #[test]
    fn test_dynamic_buffer_exhaustion_is_recoverable() {
        let (mut flash, mut drv, mut scratch) =
            setup(PartitionFlags::empty(), BufferPolicy::Dynamic);
        drv.write(&mut flash, &mut scratch, 0, &[0x00]).unwrap();
        scratch.set_dynamic_available(false);
        assert_eq!(
            drv.write(&mut flash, &mut scratch, 0, &[0x01]),
            Err(StorageError::NoBuffer)
        );
        // Pressure relieved: the same write now goes through
        scratch.set_dynamic_available(true);
        assert_eq!(drv.write(&mut flash, &mut scratch, 0, &[0x01]).unwrap(), 1);
    }

    #[test]
    fn test_read_only_partition() {
        let (mut flash, mut drv, mut scratch) =
            setup(PartitionFlags::READ_ONLY, BufferPolicy::Static);
        assert_eq!(
            drv.write(&mut flash, &mut scratch, 0, &[1]),
            Err(StorageError::ReadOnly)
        );
        assert_eq!(drv.erase(&mut flash, 0, 16), Err(StorageError::ReadOnly));
    }

    #[test]
    fn test_erase_rounds_to_sectors_within_partition() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        drv.write(&mut flash, &mut scratch, 0, &[0xAA; 3000]).unwrap();
        drv.erase(&mut flash, 1500, 10).unwrap();
        let mut buf = [0u8; 3000];
        drv.read(&flash, 0, &mut buf).unwrap();
        assert!(buf[..1024].iter().all(|&b| b == 0xAA));
        assert!(buf[1024..2048].iter().all(|&b| b == 0xFF));
        assert!(buf[2048..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_clipped_at_partition_end() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        let size = <DirectDriver as PartitionDriver<MockFlash<16384>, NoopRawMutex>>::size(&drv);
        assert_eq!(size, 12 * 1024);
        assert_eq!(
            drv.write(&mut flash, &mut scratch, size - 2, &[1, 2, 3, 4]).unwrap(),
            2
        );
        let mut buf = [0u8; 4];
        assert_eq!(drv.read(&flash, size - 2, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_read_far_past_end_is_empty() {
        let (flash, drv, _scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        // An offset near u32::MAX must clip to zero, not wrap base + offset
        let mut buf = [0u8; 4];
        assert_eq!(drv.read(&flash, u32::MAX - 2, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pointer_into_mapped_window() {
        let (mut flash, mut drv, mut scratch) = setup(PartitionFlags::empty(), BufferPolicy::Static);
        drv.write(&mut flash, &mut scratch, 4, &[9, 8, 7]).unwrap();
        let view = drv.pointer(&flash, 4, 3).unwrap();
        assert_eq!(view, &[9, 8, 7]);
        assert!(drv.pointer(&flash, 12 * 1024 - 1, 2).is_none());
    }
}
