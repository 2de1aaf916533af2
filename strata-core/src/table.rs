//! Append-only partition table
//!
//! The table is a run of fixed-size descriptor slots at a reserved flash
//! region, terminated by the first slot whose type byte is 0xFF. Entries are
//! only ever appended, never rewritten in place: unprogrammed slots read as
//! all-1s, so a new descriptor can be committed into the first slot the
//! bit-clear-only feasibility test accepts, without erasing the region. This
//! lets the table grow across firmware updates.
//!
//! Slot format (16 bytes):
//!
//! ```text
//! ┌────────┬─────────┬────────┬────────┬──────────────┬──────────────┬──────────┐
//! │ magic  │ type_id │ valid  │ flags  │ start_sector │ sector_count │ reserved │
//! │ 0x50   │ 1 byte  │ 0xAA   │ 1 byte │ u16 LE       │ u16 LE       │ 8 x 0xFF │
//! └────────┴─────────┴────────┴────────┴──────────────┴──────────────┴──────────┘
//! ```

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;
use strata_hal::FlashDevice;

use crate::device::{Feasibility, Flash, FlashCore};
use crate::error::Result;

/// Size of one descriptor slot in bytes
pub const DESCRIPTOR_LEN: usize = 16;

/// Sentinel byte identifying a descriptor slot
pub const DESCRIPTOR_MAGIC: u8 = 0x50;

/// Valid-marker value of a live entry
pub const VALID_LIVE: u8 = 0xAA;

/// Type byte terminating the table (also the erased-flash value)
pub const TYPE_TERMINATOR: u8 = 0xFF;

/// Maximum live partitions materialized from a scan
pub const MAX_PARTITIONS: usize = 16;

bitflags! {
    /// Descriptor flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PartitionFlags: u8 {
        /// Partition must never be written
        const READ_ONLY = 0b0000_0001;
        /// Partition is managed by the virtual-EEPROM driver
        const VES = 0b0000_0010;
    }
}

/// Well-known partition type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PartitionType {
    /// Executable firmware image
    Firmware = 1,
    /// Tagged parameter block
    Param = 2,
    /// Opaque binary blob
    Binary = 3,
    /// Event/crash log
    Log = 4,
    /// Generic user data
    Generic = 5,
    /// Platform calibration parameters
    PlatformParams = 15,
    /// The partition table itself
    Table = 16,
    /// Staging area for firmware updates
    FwUpdate = 18,
    /// Product header
    ProductHeader = 19,
    /// Image header
    ImageHeader = 20,
}

impl PartitionType {
    /// Get the identifier as a byte value
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create an identifier from a byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PartitionType::Firmware),
            2 => Some(PartitionType::Param),
            3 => Some(PartitionType::Binary),
            4 => Some(PartitionType::Log),
            5 => Some(PartitionType::Generic),
            15 => Some(PartitionType::PlatformParams),
            16 => Some(PartitionType::Table),
            18 => Some(PartitionType::FwUpdate),
            19 => Some(PartitionType::ProductHeader),
            20 => Some(PartitionType::ImageHeader),
            _ => None,
        }
    }
}

/// One partition descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Partition type identifier (never 0 or 0xFF for a live entry)
    pub type_id: u8,
    /// Access flags
    pub flags: PartitionFlags,
    /// First sector of the partition
    pub start_sector: u16,
    /// Length in sectors
    pub sector_count: u16,
}

/// What a decoded slot turned out to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// End-of-table marker (or erased slot)
    Terminator,
    /// Occupied but not live (retired entry or junk)
    Dead,
    /// A live descriptor
    Live(PartitionDescriptor),
}

impl PartitionDescriptor {
    /// Create a descriptor for a well-known partition type
    pub const fn new(ty: PartitionType, flags: PartitionFlags, start_sector: u16, sector_count: u16) -> Self {
        Self {
            type_id: ty.as_u8(),
            flags,
            start_sector,
            sector_count,
        }
    }

    /// Well-known type of this entry, if any
    pub fn partition_type(&self) -> Option<PartitionType> {
        PartitionType::from_u8(self.type_id)
    }

    /// Absolute byte offset of the partition start
    pub fn byte_offset(&self, sector_size: u32) -> u32 {
        self.start_sector as u32 * sector_size
    }

    /// Partition length in bytes
    pub fn byte_len(&self, sector_size: u32) -> u32 {
        self.sector_count as u32 * sector_size
    }

    /// Serialize into one table slot
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut raw = [0xFF; DESCRIPTOR_LEN];
        raw[0] = DESCRIPTOR_MAGIC;
        raw[1] = self.type_id;
        raw[2] = VALID_LIVE;
        raw[3] = self.flags.bits();
        raw[4..6].copy_from_slice(&self.start_sector.to_le_bytes());
        raw[6..8].copy_from_slice(&self.sector_count.to_le_bytes());
        raw
    }

    /// Classify one table slot
    pub fn decode(raw: &[u8; DESCRIPTOR_LEN]) -> SlotKind {
        let type_id = raw[1];
        if type_id == TYPE_TERMINATOR {
            return SlotKind::Terminator;
        }
        if raw[0] != DESCRIPTOR_MAGIC || raw[2] != VALID_LIVE || type_id == 0 {
            return SlotKind::Dead;
        }
        SlotKind::Live(PartitionDescriptor {
            type_id,
            flags: PartitionFlags::from_bits_truncate(raw[3]),
            start_sector: u16::from_le_bytes([raw[4], raw[5]]),
            sector_count: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }
}

/// Where the table lives and how it bootstraps
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    /// Absolute flash offset of the first slot
    pub address: u32,
    /// Number of slots in the reserved region
    pub max_entries: u16,
    /// Seed the compiled-in default layout when a scan finds nothing
    pub auto_create: bool,
    /// Default layout used for bootstrap
    pub defaults: &'static [PartitionDescriptor],
}

/// Outcome of one append attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppendOutcome {
    /// An identical live entry already exists
    AlreadyPresent,
    /// The entry was committed into a free slot
    Added,
    /// No slot can take the entry without an erase
    TableFull,
}

fn slot_addr(cfg: &TableConfig, slot: u16) -> u32 {
    cfg.address + slot as u32 * DESCRIPTOR_LEN as u32
}

/// Scan the table and materialize all live entries.
///
/// Scanning stops at the first terminator slot; dead slots are skipped.
pub fn scan<D: FlashDevice, M: RawMutex>(
    flash: &Flash<D, M>,
    cfg: &TableConfig,
) -> Result<Vec<PartitionDescriptor, MAX_PARTITIONS>> {
    let mut live = Vec::new();
    let mut raw = [0u8; DESCRIPTOR_LEN];
    for slot in 0..cfg.max_entries {
        flash.read(slot_addr(cfg, slot), &mut raw)?;
        match PartitionDescriptor::decode(&raw) {
            SlotKind::Terminator => break,
            SlotKind::Dead => continue,
            SlotKind::Live(desc) => {
                if live.push(desc).is_err() {
                    break;
                }
            }
        }
    }
    Ok(live)
}

/// Find the first slot of a serialized append log that can take `payload`
/// without an erase.
///
/// `occupied` decides whether a slot's current content must be preserved;
/// unoccupied slots are probed with the bit-clear-only feasibility test.
/// Returns the absolute address of the accepting slot.
pub fn find_appendable_slot<D: FlashDevice>(
    fl: &FlashCore<D>,
    base: u32,
    slot_len: usize,
    max_slots: u16,
    payload: &[u8],
    mut occupied: impl FnMut(&[u8]) -> bool,
) -> Result<Option<u32>> {
    debug_assert!(payload.len() <= slot_len);
    let mut raw = [0u8; DESCRIPTOR_LEN];
    debug_assert!(slot_len <= raw.len());
    for slot in 0..max_slots {
        let addr = base + slot as u32 * slot_len as u32;
        fl.read(addr, &mut raw[..slot_len])?;
        if occupied(&raw[..slot_len]) {
            continue;
        }
        if let Feasibility::WritableFrom(_) = fl.update_possible(addr, payload)? {
            return Ok(Some(addr));
        }
    }
    Ok(None)
}

/// Append a descriptor to the table.
///
/// Idempotent: an existing live entry with the same type, start and length
/// is reported as [`AppendOutcome::AlreadyPresent`] and nothing is written.
pub fn append<D: FlashDevice, M: RawMutex>(
    flash: &mut Flash<D, M>,
    cfg: &TableConfig,
    desc: &PartitionDescriptor,
) -> Result<AppendOutcome> {
    let encoded = desc.encode();
    flash.with_lock(|fl| {
        let mut raw = [0u8; DESCRIPTOR_LEN];
        for slot in 0..cfg.max_entries {
            fl.read(slot_addr(cfg, slot), &mut raw)?;
            if let SlotKind::Live(existing) = PartitionDescriptor::decode(&raw) {
                if existing.type_id == desc.type_id
                    && existing.start_sector == desc.start_sector
                    && existing.sector_count == desc.sector_count
                {
                    return Ok(AppendOutcome::AlreadyPresent);
                }
            }
        }

        let found = find_appendable_slot(
            fl,
            cfg.address,
            DESCRIPTOR_LEN,
            cfg.max_entries,
            &encoded,
            |slot_raw| {
                let mut buf = [0u8; DESCRIPTOR_LEN];
                buf.copy_from_slice(slot_raw);
                matches!(PartitionDescriptor::decode(&buf), SlotKind::Live(_))
            },
        )?;
        match found {
            Some(addr) => {
                fl.write(addr, &encoded)?;
                Ok(AppendOutcome::Added)
            }
            None => Ok(AppendOutcome::TableFull),
        }
    })
}

/// Seed the compiled-in default layout if the table holds no live entry.
///
/// Returns how many defaults were committed.
pub fn ensure_defaults<D: FlashDevice, M: RawMutex>(
    flash: &mut Flash<D, M>,
    cfg: &TableConfig,
) -> Result<usize> {
    if !cfg.auto_create || !scan(flash, cfg)?.is_empty() {
        return Ok(0);
    }
    let mut added = 0;
    for desc in cfg.defaults {
        if append(flash, cfg, desc)? == AppendOutcome::Added {
            added += 1;
        }
    }
    Ok(added)
}

/// Clear the liveness marker of the first live entry with `type_id`.
///
/// Descriptors are immutable once committed except for this one byte; a
/// retired entry is skipped by future scans without disturbing the log.
pub fn retire<D: FlashDevice, M: RawMutex>(
    flash: &mut Flash<D, M>,
    cfg: &TableConfig,
    type_id: u8,
) -> Result<bool> {
    flash.with_lock(|fl| {
        let mut raw = [0u8; DESCRIPTOR_LEN];
        for slot in 0..cfg.max_entries {
            let addr = slot_addr(cfg, slot);
            fl.read(addr, &mut raw)?;
            match PartitionDescriptor::decode(&raw) {
                SlotKind::Terminator => break,
                SlotKind::Live(desc) if desc.type_id == type_id => {
                    fl.write(addr + 2, &[0x00])?;
                    return Ok(true);
                }
                _ => continue,
            }
        }
        Ok(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use strata_hal::MockFlash;

    type TestFlash = Flash<MockFlash<16384>, NoopRawMutex>;

    const TABLE: TableConfig = TableConfig {
        address: 0,
        max_entries: 8,
        auto_create: true,
        defaults: &[],
    };

    fn flash() -> TestFlash {
        Flash::new(MockFlash::new(256, 4096), 0)
    }

    fn generic(start: u16, count: u16) -> PartitionDescriptor {
        PartitionDescriptor::new(PartitionType::Generic, PartitionFlags::empty(), start, count)
    }

    #[test]
    fn test_descriptor_codec_round_trip() {
        let desc = PartitionDescriptor::new(
            PartitionType::Log,
            PartitionFlags::READ_ONLY | PartitionFlags::VES,
            0x0123,
            0x0045,
        );
        let raw = desc.encode();
        assert_eq!(raw[0], DESCRIPTOR_MAGIC);
        assert_eq!(raw[2], VALID_LIVE);
        assert_eq!(&raw[8..], &[0xFF; 8]);
        assert_eq!(PartitionDescriptor::decode(&raw), SlotKind::Live(desc));
    }

    #[test]
    fn test_decode_terminator_and_dead() {
        assert_eq!(
            PartitionDescriptor::decode(&[0xFF; DESCRIPTOR_LEN]),
            SlotKind::Terminator
        );
        let mut retired = generic(1, 1).encode();
        retired[2] = 0x00;
        assert_eq!(PartitionDescriptor::decode(&retired), SlotKind::Dead);
        let mut zero_type = generic(1, 1).encode();
        zero_type[1] = 0x00;
        assert_eq!(PartitionDescriptor::decode(&zero_type), SlotKind::Dead);
    }

    #[test]
    fn test_scan_stops_at_terminator() {
        let mut flash = flash();
        append(&mut flash, &TABLE, &generic(1, 1)).unwrap();
        append(&mut flash, &TABLE, &generic(2, 1)).unwrap();
        // Entry written beyond an erased (terminator) gap must not be found
        flash
            .write(slot_addr(&TABLE, 3), &generic(3, 1).encode())
            .unwrap();
        let live = scan(&flash, &TABLE).unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn test_scan_skips_dead_entries() {
        let mut flash = flash();
        append(&mut flash, &TABLE, &generic(1, 1)).unwrap();
        append(&mut flash, &TABLE, &generic(2, 1)).unwrap();
        retire(&mut flash, &TABLE, PartitionType::Generic.as_u8()).unwrap();
        let live = scan(&flash, &TABLE).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].start_sector, 2);
    }

    #[test]
    fn test_scan_reads_preprovisioned_table() {
        // Table image laid down by an external provisioning tool, not
        // through append()
        let mut dev = MockFlash::<16384>::new(256, 4096);
        let mut image = [0xFFu8; DESCRIPTOR_LEN * 2];
        image[..DESCRIPTOR_LEN].copy_from_slice(&generic(1, 2).encode());
        image[DESCRIPTOR_LEN..].copy_from_slice(&generic(3, 1).encode());
        dev.load(0, &image);
        let flash: TestFlash = Flash::new(dev, 0);
        let live = scan(&flash, &TABLE).unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].start_sector, 1);
        assert_eq!(live[0].sector_count, 2);
        assert_eq!(live[1].start_sector, 3);
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut flash = flash();
        assert_eq!(
            append(&mut flash, &TABLE, &generic(2, 2)).unwrap(),
            AppendOutcome::Added
        );
        assert_eq!(
            append(&mut flash, &TABLE, &generic(2, 2)).unwrap(),
            AppendOutcome::AlreadyPresent
        );
        assert_eq!(scan(&flash, &TABLE).unwrap().len(), 1);
    }

    #[test]
    fn test_append_skips_unwritable_slots() {
        let mut flash = flash();
        // Slot 0 holds junk that is neither live nor bit-compatible
        flash.write(0, &[0x00; DESCRIPTOR_LEN]).unwrap();
        assert_eq!(
            append(&mut flash, &TABLE, &generic(4, 1)).unwrap(),
            AppendOutcome::Added
        );
        let live = scan(&flash, &TABLE).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].start_sector, 4);
    }

    #[test]
    fn test_append_table_full() {
        let mut flash = flash();
        for i in 0..8 {
            assert_eq!(
                append(&mut flash, &TABLE, &generic(10 + i, 1)).unwrap(),
                AppendOutcome::Added
            );
        }
        assert_eq!(
            append(&mut flash, &TABLE, &generic(30, 1)).unwrap(),
            AppendOutcome::TableFull
        );
    }

    #[test]
    fn test_ensure_defaults_bootstraps_empty_table() {
        static DEFAULTS: [PartitionDescriptor; 2] = [
            PartitionDescriptor {
                type_id: PartitionType::Firmware as u8,
                flags: PartitionFlags::READ_ONLY,
                start_sector: 0,
                sector_count: 2,
            },
            PartitionDescriptor {
                type_id: PartitionType::Generic as u8,
                flags: PartitionFlags::empty(),
                start_sector: 2,
                sector_count: 2,
            },
        ];
        let cfg = TableConfig {
            defaults: &DEFAULTS,
            ..TABLE
        };
        let mut flash = flash();
        assert_eq!(ensure_defaults(&mut flash, &cfg).unwrap(), 2);
        assert_eq!(scan(&flash, &cfg).unwrap().len(), 2);
        // Second boot: table already populated, nothing to do
        assert_eq!(ensure_defaults(&mut flash, &cfg).unwrap(), 0);
        assert_eq!(scan(&flash, &cfg).unwrap().len(), 2);
    }
}
