//! Storage manager
//!
//! One explicitly constructed manager instance owns everything the storage
//! stack needs at runtime: the flash adapter (with the external mutex), the
//! shared sector scratch buffer, and the partition arena built from the
//! on-flash table during init. After init the arena is read-only; lookups
//! need no synchronization and handles are plain indexes into it.
//!
//! Handle misuse is a caller contract violation: a stale or fabricated
//! handle trips a `debug_assert!` and fails safe in release (0 bytes, `None`
//! or `false`), it never panics in production.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;
use strata_core::device::{Flash, SKIP_FLUSH_DISABLED};
use strata_core::driver::{BufferPolicy, PartitionDriver, SectorScratch};
use strata_core::error::Result;
use strata_core::table::{
    self, PartitionDescriptor, PartitionType, TableConfig, MAX_PARTITIONS,
};
use strata_drivers::{DirectDriver, VesConfig, VesDriver};
use strata_hal::FlashDevice;

use crate::params::ParameterArea;

/// Everything needed to bring the storage service up
pub struct StorageConfig {
    /// Cache-size register code for the flash adapter (0 = no cache)
    pub cache_code: u8,
    /// Sector-buffer policy handed to direct-driver bindings
    pub buffer_policy: BufferPolicy,
    /// Partition table location and bootstrap layout
    pub table: TableConfig,
    /// Configuration for VES-flagged partitions
    pub ves: VesConfig,
    /// Compiled-in parameter areas served by [`crate::params`]
    pub areas: &'static [ParameterArea],
}

/// Opaque reference to one partition in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionHandle(usize);

/// Driver bound to a partition, or nothing when no driver accepted it
enum DriverState {
    Direct(DirectDriver),
    Ves(VesDriver),
    Unbound,
}

pub(crate) struct Partition {
    pub(crate) desc: PartitionDescriptor,
    driver: DriverState,
}

/// The non-volatile memory service
pub struct StorageManager<D: FlashDevice, M: RawMutex> {
    pub(crate) flash: Flash<D, M>,
    scratch: SectorScratch,
    pub(crate) partitions: Vec<Partition, MAX_PARTITIONS>,
    pub(crate) areas: &'static [ParameterArea],
}

impl<D: FlashDevice, M: RawMutex> StorageManager<D, M> {
    /// Bring the service up: scan the table (seeding the compiled-in layout
    /// on blank flash when configured), then bind a driver to each live
    /// entry. Entries no driver accepts stay unbound.
    pub fn init(device: D, config: &StorageConfig) -> Result<Self> {
        let mut flash = Flash::new(device, config.cache_code);

        let mut live = table::scan(&flash, &config.table)?;
        if live.is_empty() && table::ensure_defaults(&mut flash, &config.table)? > 0 {
            live = table::scan(&flash, &config.table)?;
        }

        let mut partitions = Vec::new();
        for desc in &live {
            let driver =
                match DirectDriver::bind(flash.geometry(), desc, config.buffer_policy) {
                    Some(d) => DriverState::Direct(d),
                    None => match VesDriver::bind(&mut flash, desc, &config.ves)? {
                        Some(v) => DriverState::Ves(v),
                        None => {
                            #[cfg(feature = "defmt")]
                            defmt::warn!(
                                "no driver bound for partition type {}",
                                desc.type_id
                            );
                            DriverState::Unbound
                        }
                    },
                };
            // The scan and the arena share the MAX_PARTITIONS bound
            let _ = partitions.push(Partition { desc: *desc, driver });
        }

        #[cfg(feature = "defmt")]
        defmt::info!("storage up, {} partitions bound", partitions.len());

        Ok(Self {
            flash,
            scratch: SectorScratch::new(),
            partitions,
            areas: config.areas,
        })
    }

    /// Tear the service down and hand the raw device back
    pub fn release(self) -> D {
        self.flash.release()
    }

    /// Handle for the first bound partition of the given type
    pub fn open(&self, ty: PartitionType) -> Option<PartitionHandle> {
        self.partitions
            .iter()
            .position(|p| {
                p.desc.type_id == ty.as_u8() && !matches!(p.driver, DriverState::Unbound)
            })
            .map(PartitionHandle)
    }

    /// Partition size in bytes, 0 for an invalid handle
    pub fn size(&self, handle: PartitionHandle) -> u32 {
        match self.partitions.get(handle.0).map(|p| &p.driver) {
            Some(DriverState::Direct(d)) => <DirectDriver as PartitionDriver<D, M>>::size(d),
            Some(DriverState::Ves(v)) => <VesDriver as PartitionDriver<D, M>>::size(v),
            _ => {
                debug_assert!(false, "size of invalid or unbound partition handle");
                0
            }
        }
    }

    /// Read from a partition; returns bytes read (0 on any failure)
    pub fn read(&self, handle: PartitionHandle, offset: u32, buf: &mut [u8]) -> usize {
        match self.partitions.get(handle.0).map(|p| &p.driver) {
            Some(DriverState::Direct(d)) => count(d.read(&self.flash, offset, buf)),
            Some(DriverState::Ves(v)) => count(v.read(&self.flash, offset, buf)),
            _ => {
                debug_assert!(false, "read through invalid or unbound partition handle");
                0
            }
        }
    }

    /// Write to a partition; returns bytes written (0 on any failure)
    pub fn write(&mut self, handle: PartitionHandle, offset: u32, data: &[u8]) -> usize {
        let Self {
            flash,
            scratch,
            partitions,
            ..
        } = self;
        match partitions.get_mut(handle.0).map(|p| &mut p.driver) {
            Some(DriverState::Direct(d)) => count(d.write(flash, scratch, offset, data)),
            Some(DriverState::Ves(v)) => count(v.write(flash, scratch, offset, data)),
            _ => {
                debug_assert!(false, "write through invalid or unbound partition handle");
                0
            }
        }
    }

    /// Erase a partition-relative region; `true` when it completed
    pub fn erase_region(&mut self, handle: PartitionHandle, offset: u32, len: u32) -> bool {
        let Self {
            flash, partitions, ..
        } = self;
        match partitions.get_mut(handle.0).map(|p| &mut p.driver) {
            Some(DriverState::Direct(d)) => d.erase(flash, offset, len).is_ok(),
            Some(DriverState::Ves(v)) => v.erase(flash, offset, len).is_ok(),
            _ => {
                debug_assert!(false, "erase through invalid or unbound partition handle");
                false
            }
        }
    }

    /// Direct pointer into the partition's mapped window, when available
    pub fn pointer(&self, handle: PartitionHandle, offset: u32, len: u32) -> Option<&[u8]> {
        match self.partitions.get(handle.0).map(|p| &p.driver) {
            Some(DriverState::Direct(d)) => d.pointer(&self.flash, offset, len),
            Some(DriverState::Ves(v)) => v.pointer(&self.flash, offset, len),
            _ => {
                debug_assert!(false, "pointer through invalid or unbound partition handle");
                None
            }
        }
    }

    /// Flush a partition's driver state; `free_memory` additionally asks it
    /// to drop reclaimable buffers
    pub fn flush(&mut self, handle: PartitionHandle, free_memory: bool) -> bool {
        let Self {
            flash, partitions, ..
        } = self;
        match partitions.get_mut(handle.0).map(|p| &mut p.driver) {
            Some(DriverState::Direct(d)) => d.flush(flash, free_memory).is_ok(),
            Some(DriverState::Ves(v)) => v.flush(flash, free_memory).is_ok(),
            _ => {
                debug_assert!(false, "flush through invalid or unbound partition handle");
                false
            }
        }
    }

    /// Exempt a partition-relative window from cache flushing.
    ///
    /// Only meaningful for direct-mapped partitions; an `offset` of
    /// [`SKIP_FLUSH_DISABLED`] removes the exemption again. Returns whether
    /// the request took effect.
    pub fn no_cache_flushing(&mut self, handle: PartitionHandle, offset: u32, len: u32) -> bool {
        let (is_direct, desc) = match self.partitions.get(handle.0) {
            Some(p) => (matches!(p.driver, DriverState::Direct(_)), p.desc),
            None => {
                debug_assert!(false, "invalid partition handle");
                return false;
            }
        };
        if offset == SKIP_FLUSH_DISABLED {
            self.flash.skip_cache_flushing(SKIP_FLUSH_DISABLED, 0);
            return true;
        }
        if !is_direct {
            return false;
        }
        let sector = self.flash.geometry().sector_size;
        if offset.saturating_add(len) > desc.byte_len(sector) {
            return false;
        }
        self.flash
            .skip_cache_flushing(desc.byte_offset(sector) + offset, len);
        true
    }
}

fn count(res: Result<usize>) -> usize {
    match res {
        Ok(n) => n,
        Err(_e) => {
            #[cfg(feature = "defmt")]
            defmt::warn!("storage operation failed: {}", _e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use strata_core::table::PartitionFlags;
    use strata_hal::MockFlash;

    // Sector 0 holds the table, sectors 1..8 a direct partition, 8..16 a
    // wear-leveled one
    static DEFAULT_LAYOUT: [PartitionDescriptor; 2] = [
        PartitionDescriptor::new(PartitionType::Generic, PartitionFlags::empty(), 1, 7),
        PartitionDescriptor::new(PartitionType::Param, PartitionFlags::VES, 8, 8),
    ];

    fn config() -> StorageConfig {
        StorageConfig {
            cache_code: 1,
            buffer_policy: BufferPolicy::Static,
            table: TableConfig {
                address: 0,
                max_entries: 16,
                auto_create: true,
                defaults: &DEFAULT_LAYOUT,
            },
            ves: VesConfig::default(),
            areas: &[],
        }
    }

    type TestManager = StorageManager<MockFlash<16384>, NoopRawMutex>;

    fn setup() -> TestManager {
        StorageManager::init(MockFlash::new(256, 1024), &config()).unwrap()
    }

    #[test]
    fn test_init_bootstraps_default_layout() {
        let mgr = setup();
        assert!(mgr.open(PartitionType::Generic).is_some());
        assert!(mgr.open(PartitionType::Param).is_some());
        assert!(mgr.open(PartitionType::Firmware).is_none());
    }

    #[test]
    fn test_partition_sizes() {
        let mgr = setup();
        let direct = mgr.open(PartitionType::Generic).unwrap();
        assert_eq!(mgr.size(direct), 7 * 1024);
        // 8 sectors x 16 slots, minus the GC reserve, at 60 payload bytes
        let ves = mgr.open(PartitionType::Param).unwrap();
        assert_eq!(mgr.size(ves), 111 * 60);
    }

    #[test]
    fn test_direct_partition_end_to_end() {
        let mut mgr = setup();
        let h = mgr.open(PartitionType::Generic).unwrap();
        assert_eq!(mgr.write(h, 100, b"hello"), 5);
        let mut buf = [0u8; 5];
        assert_eq!(mgr.read(h, 100, &mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(mgr.pointer(h, 100, 5), Some(&b"hello"[..]));

        assert!(mgr.erase_region(h, 0, 1024));
        assert_eq!(mgr.read(h, 100, &mut buf), 5);
        assert_eq!(buf, [0xFF; 5]);
    }

    #[test]
    fn test_ves_partition_end_to_end() {
        let mut mgr = setup();
        let h = mgr.open(PartitionType::Param).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mgr.write(h, 0x10, b"AAAA"), 4);
        mgr.read(h, 0x10, &mut buf);
        assert_eq!(&buf, b"AAAA");
        assert_eq!(mgr.write(h, 0x10, b"BBBB"), 4);
        mgr.read(h, 0x10, &mut buf);
        assert_eq!(&buf, b"BBBB");
        // No memory-mapped access through the log structure
        assert!(mgr.pointer(h, 0x10, 4).is_none());
    }

    #[test]
    fn test_reinit_reuses_existing_table() {
        let mut mgr = setup();
        let h = mgr.open(PartitionType::Generic).unwrap();
        mgr.write(h, 0, b"persist");
        let device = mgr.release();

        let mgr = StorageManager::<_, NoopRawMutex>::init(device, &config()).unwrap();
        let h = mgr.open(PartitionType::Generic).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(mgr.read(h, 0, &mut buf), 7);
        assert_eq!(&buf, b"persist");
    }

    #[test]
    fn test_no_cache_flushing_window() {
        let mut mgr = setup();
        let direct = mgr.open(PartitionType::Generic).unwrap();
        let ves = mgr.open(PartitionType::Param).unwrap();

        // Only direct-mapped partitions can be exempted
        assert!(!mgr.no_cache_flushing(ves, 0, 64));
        assert!(!mgr.no_cache_flushing(direct, 6 * 1024, 2048)); // past the end
        assert!(mgr.no_cache_flushing(direct, 0, 1024));

        let flushes = |mgr: &mut TestManager| {
            mgr.flash.with_lock(|fl| fl.device().flush_count())
        };
        let before = flushes(&mut mgr);
        mgr.write(direct, 0, &[0x11]);
        assert_eq!(flushes(&mut mgr), before, "exempt window must not flush");
        mgr.write(direct, 2048, &[0x11]);
        assert!(flushes(&mut mgr) > before, "outside the window flushes");

        // Sentinel offset removes the exemption
        assert!(mgr.no_cache_flushing(direct, SKIP_FLUSH_DISABLED, 0));
        let before = flushes(&mut mgr);
        mgr.write(direct, 4, &[0x22]);
        assert!(flushes(&mut mgr) > before);
    }
}
