//! Virtual-EEPROM (VES) partition driver
//!
//! Log-structured wear-leveling store. The partition is a run of sectors,
//! each holding fixed-size containers (see [`container`]). A logical write
//! never touches data in place: it appends a new container for the virtual
//! block, dirties the superseded one, and updates an in-RAM index so reads
//! stay O(1). Dirty containers are reclaimed a sector at a time by garbage
//! collection ([`gc`]), always copy-then-erase.
//!
//! Because every container is committed by a single program operation and a
//! sector is only erased after its live containers have been copied out,
//! any power loss leaves the partition recoverable by a full rescan.

pub mod container;
pub mod gc;

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;
use strata_core::device::{Flash, FlashCore};
use strata_core::driver::{PartitionDriver, SectorScratch};
use strata_core::error::{Result, StorageError};
use strata_core::table::{PartitionDescriptor, PartitionFlags};
use strata_hal::FlashDevice;

use container::{ContainerLayout, ContainerState, MAX_CONTAINER_SIZE, STATUS_DIRTY, STATUS_VALID};
pub use gc::{GcPolicy, SectorState};

/// Most sectors a single VES partition may span
pub const MAX_VES_SECTORS: usize = 64;

/// Most virtual blocks a VES partition can expose (u8 keys, 0xFF reserved)
pub const MAX_VIRTUAL_BLOCKS: usize = 255;

const SLOT_NONE: u16 = 0xFFFF;

/// Runtime configuration of one VES driver instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VesConfig {
    /// Container slot size in bytes; must divide the sector size and fit in
    /// one program page
    pub slot_len: u16,
    /// CRC-protect container payloads (costs 2 payload bytes per container)
    pub crc: bool,
    /// Garbage-collection victim policy
    pub policy: GcPolicy,
    /// Virtual blocks to expose; 0 picks the maximum the partition supports
    pub virtual_blocks: u16,
}

impl Default for VesConfig {
    fn default() -> Self {
        Self {
            slot_len: 64,
            crc: true,
            policy: GcPolicy::MostDirty,
            virtual_blocks: 0,
        }
    }
}

/// Aggregate container accounting across the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VesStats {
    /// Committed (or in-flight) containers
    pub live: u32,
    /// Reclaimable containers
    pub dirty: u32,
    /// Free slots
    pub erased: u32,
    /// Sector erases this session
    pub erase_count: u32,
}

/// VES driver state for one bound partition
pub struct VesDriver {
    base: u32,
    sector_size: u32,
    sector_count: u16,
    layout: ContainerLayout,
    policy: GcPolicy,
    blocks: u16,
    /// Virtual block -> slot id of its committed container
    index: [u16; MAX_VIRTUAL_BLOCKS],
    sectors: Vec<SectorState, MAX_VES_SECTORS>,
    /// Round-robin append position, spreads writes across sectors
    cursor: u16,
}

impl VesDriver {
    /// Try to bind a partition descriptor.
    ///
    /// Only partitions carrying the VES flag are accepted. Binding performs
    /// the full recovery rescan: it rebuilds the index, repairs interrupted
    /// writes and discards torn containers.
    pub fn bind<D: FlashDevice, M: RawMutex>(
        flash: &mut Flash<D, M>,
        desc: &PartitionDescriptor,
        cfg: &VesConfig,
    ) -> Result<Option<Self>> {
        if !desc.flags.contains(PartitionFlags::VES) {
            return Ok(None);
        }
        let geometry = flash.geometry();
        let layout = ContainerLayout {
            slot_len: cfg.slot_len,
            crc: cfg.crc,
        };
        let slot_len = cfg.slot_len as u32;
        if cfg.slot_len as usize > MAX_CONTAINER_SIZE
            || layout.payload_len() == 0
            || geometry.sector_size % slot_len != 0
            || slot_len > geometry.page_size
        {
            return Err(StorageError::InvalidConfig);
        }
        let sector_count = desc.sector_count;
        if sector_count < 2 || sector_count as usize > MAX_VES_SECTORS {
            return Err(StorageError::InvalidConfig);
        }

        let slots_per_sector = (geometry.sector_size / slot_len) as u16;
        let total_slots = sector_count as u32 * slots_per_sector as u32;
        // Slot ids are u16 with 0xFFFF reserved for "never written"
        if total_slots > SLOT_NONE as u32 {
            return Err(StorageError::InvalidConfig);
        }
        // Keeping one sector's worth of slots (plus one) out of the logical
        // space guarantees copy-then-erase always has room to run.
        let cap = (total_slots - slots_per_sector as u32 - 1).min(MAX_VIRTUAL_BLOCKS as u32) as u16;
        let blocks = if cfg.virtual_blocks == 0 {
            cap
        } else {
            cfg.virtual_blocks
        };
        if blocks == 0 || blocks > cap {
            return Err(StorageError::InvalidConfig);
        }

        let mut driver = Self {
            base: desc.byte_offset(geometry.sector_size),
            sector_size: geometry.sector_size,
            sector_count,
            layout,
            policy: cfg.policy,
            blocks,
            index: [SLOT_NONE; MAX_VIRTUAL_BLOCKS],
            sectors: Vec::new(),
            cursor: 0,
        };
        flash.with_lock(|fl| driver.recover(fl))?;
        Ok(Some(driver))
    }

    /// Per-sector accounting, for diagnostics and tests
    pub fn sector_states(&self) -> &[SectorState] {
        &self.sectors
    }

    /// Aggregate accounting across the partition
    pub fn stats(&self) -> VesStats {
        let mut s = VesStats {
            live: 0,
            dirty: 0,
            erased: 0,
            erase_count: 0,
        };
        for sec in &self.sectors {
            s.live += sec.live as u32;
            s.dirty += sec.dirty as u32;
            s.erased += sec.erased as u32;
            s.erase_count += sec.erase_count;
        }
        s
    }

    fn slots_per_sector(&self) -> u16 {
        (self.sector_size / self.layout.slot_len as u32) as u16
    }

    fn total_slots(&self) -> u16 {
        // Bind guarantees the product fits in u16 slot ids
        (self.sector_count as u32 * self.slots_per_sector() as u32) as u16
    }

    fn logical_size(&self) -> u32 {
        self.blocks as u32 * self.layout.payload_len() as u32
    }

    fn slot_addr(&self, slot: u16) -> u32 {
        let sps = self.slots_per_sector();
        self.base
            + (slot / sps) as u32 * self.sector_size
            + (slot % sps) as u32 * self.layout.slot_len as u32
    }

    fn sector_of(&self, slot: u16) -> usize {
        (slot / self.slots_per_sector()) as usize
    }

    fn total_erased(&self) -> u32 {
        self.sectors.iter().map(|s| s.erased as u32).sum()
    }

    /// Mark a previously live container dirty, on flash and in the counters
    fn demote<D: FlashDevice>(&mut self, fl: &mut FlashCore<D>, slot: u16) -> Result<()> {
        fl.write(self.slot_addr(slot) + 1, &[STATUS_DIRTY])?;
        let sec = self.sector_of(slot);
        self.sectors[sec].live -= 1;
        self.sectors[sec].dirty += 1;
        Ok(())
    }

    /// Full rescan: rebuild index and sector states, repair in-flight writes
    fn recover<D: FlashDevice>(&mut self, fl: &mut FlashCore<D>) -> Result<()> {
        self.index = [SLOT_NONE; MAX_VIRTUAL_BLOCKS];
        self.sectors.clear();
        for _ in 0..self.sector_count {
            // Arena is bounded by MAX_VES_SECTORS, checked at bind
            let _ = self.sectors.push(SectorState::default());
        }

        let mut pending = [false; MAX_VIRTUAL_BLOCKS];
        let mut raw = [0u8; MAX_CONTAINER_SIZE];
        let slot_len = self.layout.slot_len as usize;
        let mut last_live = None;

        for slot in 0..self.total_slots() {
            fl.read(self.slot_addr(slot), &mut raw[..slot_len])?;
            let sec = self.sector_of(slot);
            match self.layout.parse(&raw[..slot_len]) {
                ContainerState::Erased => self.sectors[sec].erased += 1,
                ContainerState::Dirty => self.sectors[sec].dirty += 1,
                ContainerState::Torn => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ves: discarding torn container in slot {}", slot);
                    self.sectors[sec].dirty += 1;
                }
                ContainerState::Live { key, pending: p } => {
                    self.sectors[sec].live += 1;
                    let k = key as usize;
                    if key as u16 >= self.blocks {
                        // Written under a larger layout; unreachable now
                        self.demote(fl, slot)?;
                        continue;
                    }
                    match self.index[k] {
                        SLOT_NONE => {
                            self.index[k] = slot;
                            pending[k] = p;
                            last_live = Some(slot);
                        }
                        cur if p && !pending[k] => {
                            // Interrupted write: the pending container is the
                            // newer one, its predecessor was never dirtied
                            self.demote(fl, cur)?;
                            self.index[k] = slot;
                            pending[k] = p;
                            last_live = Some(slot);
                        }
                        _ => {
                            // Stale duplicate (crashed GC copy or the loser
                            // of the pending resolution)
                            self.demote(fl, slot)?;
                        }
                    }
                }
            }
        }

        // Finish interrupted commits
        for k in 0..self.blocks as usize {
            if pending[k] && self.index[k] != SLOT_NONE {
                fl.write(self.slot_addr(self.index[k]) + 1, &[STATUS_VALID])?;
            }
        }

        self.cursor = match last_live {
            Some(slot) => (slot + 1) % self.total_slots(),
            None => 0,
        };
        Ok(())
    }

    /// Find an erased slot, round-robin from the cursor
    fn find_erased_slot<D: FlashDevice>(
        &self,
        fl: &FlashCore<D>,
        exclude_sector: Option<usize>,
    ) -> Result<Option<u16>> {
        let total = self.total_slots();
        let slot_len = self.layout.slot_len as usize;
        let mut raw = [0u8; MAX_CONTAINER_SIZE];
        for i in 0..total {
            let slot = (self.cursor + i) % total;
            let sec = self.sector_of(slot);
            if exclude_sector == Some(sec) || self.sectors[sec].erased == 0 {
                continue;
            }
            fl.read(self.slot_addr(slot), &mut raw[..slot_len])?;
            if self.layout.parse(&raw[..slot_len]) == ContainerState::Erased {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Collect one victim sector; returns false when nothing is collectable
    fn collect<D: FlashDevice>(&mut self, fl: &mut FlashCore<D>) -> Result<bool> {
        let victim = match gc::select_victim(&self.sectors, self.policy, self.total_erased()) {
            Some(v) => v,
            None => return Ok(false),
        };

        let sps = self.slots_per_sector();
        let slot_len = self.layout.slot_len as usize;
        let mut raw = [0u8; MAX_CONTAINER_SIZE];

        // Copy every committed container out of the victim first
        for i in 0..sps {
            let slot = victim as u16 * sps + i;
            fl.read(self.slot_addr(slot), &mut raw[..slot_len])?;
            let state = self.layout.parse(&raw[..slot_len]);
            let key = match state {
                ContainerState::Live { key, .. } if self.index[key as usize] == slot => key,
                _ => continue,
            };
            let dest = self
                .find_erased_slot(fl, Some(victim))?
                .ok_or(StorageError::Full)?;
            // The copy is already-committed data; it goes straight to valid
            raw[1] = STATUS_VALID;
            fl.write(self.slot_addr(dest), &raw[..slot_len])?;
            let dsec = self.sector_of(dest);
            self.sectors[dsec].erased -= 1;
            self.sectors[dsec].live += 1;
            self.index[key as usize] = dest;
            // The original dies with the erase below; only counters move
            self.sectors[victim].live -= 1;
            self.sectors[victim].dirty += 1;
        }

        let victim_base = self.base + victim as u32 * self.sector_size;
        fl.erase_region(victim_base, self.sector_size)?;
        self.sectors[victim] = SectorState {
            live: 0,
            dirty: 0,
            erased: sps,
            erase_count: self.sectors[victim].erase_count + 1,
        };
        Ok(true)
    }

    /// Keep at least one sector's worth of erased slots ahead of an append
    fn ensure_free<D: FlashDevice>(&mut self, fl: &mut FlashCore<D>) -> Result<()> {
        while self.total_erased() <= self.slots_per_sector() as u32 {
            if !self.collect(fl)? {
                return Err(StorageError::Full);
            }
        }
        Ok(())
    }

    /// Append a new payload version for `key` and commit it
    fn append_block<D: FlashDevice>(
        &mut self,
        fl: &mut FlashCore<D>,
        key: u8,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_free(fl)?;
        let old = self.index[key as usize];
        let slot = self
            .find_erased_slot(fl, None)?
            .ok_or(StorageError::Full)?;

        let mut cbuf = [0xFFu8; MAX_CONTAINER_SIZE];
        self.layout.build(key, payload, &mut cbuf);
        let addr = self.slot_addr(slot);
        // One program op: the commit point for power-fail recovery
        fl.write(addr, &cbuf[..self.layout.slot_len as usize])?;
        let sec = self.sector_of(slot);
        self.sectors[sec].erased -= 1;
        self.sectors[sec].live += 1;

        if old != SLOT_NONE {
            self.demote(fl, old)?;
        }
        fl.write(addr + 1, &[STATUS_VALID])?;
        self.index[key as usize] = slot;
        self.cursor = (slot + 1) % self.total_slots();
        Ok(())
    }

    /// Shared by write and logical erase: overlay bytes over each touched
    /// block, appending a new container where content actually changes
    fn overlay<D: FlashDevice>(
        &mut self,
        fl: &mut FlashCore<D>,
        offset: u32,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let pl = self.layout.payload_len();
        let mut done = 0usize;
        let mut payload = [0xFFu8; MAX_CONTAINER_SIZE];
        while done < len {
            let off = offset as usize + done;
            let block = off / pl;
            let in_off = off % pl;
            let chunk = (len - done).min(pl - in_off);
            let old = self.index[block];

            if data.is_none() && chunk == pl {
                // Whole-block clear: the block just becomes "never written"
                if old != SLOT_NONE {
                    self.demote(fl, old)?;
                    self.index[block] = SLOT_NONE;
                }
                done += chunk;
                continue;
            }

            payload[..pl].fill(0xFF);
            if old != SLOT_NONE {
                fl.read(
                    self.slot_addr(old) + self.layout.payload_offset() as u32,
                    &mut payload[..pl],
                )?;
            }
            let changed = match data {
                Some(d) => {
                    let src = &d[done..done + chunk];
                    if payload[in_off..in_off + chunk] != *src {
                        payload[in_off..in_off + chunk].copy_from_slice(src);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    if payload[in_off..in_off + chunk].iter().any(|&b| b != 0xFF) {
                        payload[in_off..in_off + chunk].fill(0xFF);
                        true
                    } else {
                        false
                    }
                }
            };
            if changed {
                let version = payload;
                self.append_block(fl, block as u8, &version[..pl])?;
            }
            done += chunk;
        }
        Ok(())
    }

    fn clip(&self, offset: u32, len: usize) -> usize {
        let size = self.logical_size();
        if offset >= size {
            0
        } else {
            len.min((size - offset) as usize)
        }
    }
}

impl<D: FlashDevice, M: RawMutex> PartitionDriver<D, M> for VesDriver {
    fn size(&self) -> u32 {
        self.logical_size()
    }

    fn read(&self, flash: &Flash<D, M>, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let n = self.clip(offset, buf.len());
        let pl = self.layout.payload_len();
        let mut done = 0usize;
        while done < n {
            let off = offset as usize + done;
            let block = off / pl;
            let in_off = off % pl;
            let chunk = (n - done).min(pl - in_off);
            match self.index[block] {
                SLOT_NONE => buf[done..done + chunk].fill(0xFF),
                slot => {
                    let addr =
                        self.slot_addr(slot) + self.layout.payload_offset() as u32 + in_off as u32;
                    flash.read(addr, &mut buf[done..done + chunk])?;
                }
            }
            done += chunk;
        }
        Ok(n)
    }

    fn write(
        &mut self,
        flash: &mut Flash<D, M>,
        _scratch: &mut SectorScratch,
        offset: u32,
        data: &[u8],
    ) -> Result<usize> {
        let n = self.clip(offset, data.len());
        if n == 0 {
            return Ok(0);
        }
        flash.with_lock(|fl| self.overlay(fl, offset, n, Some(data)))?;
        Ok(n)
    }

    fn erase(&mut self, flash: &mut Flash<D, M>, offset: u32, len: u32) -> Result<()> {
        let n = self.clip(offset, len as usize);
        if n == 0 {
            return Ok(());
        }
        flash.with_lock(|fl| self.overlay(fl, offset, n, None))
    }
}
