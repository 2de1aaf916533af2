//! Flash adapter
//!
//! Turns byte-addressed read/write/erase requests into correct sequences of
//! hardware page programs and sector erases, and keeps the read cache
//! coherent while doing so. All operations are clipped to the physical
//! device size.
//!
//! Mutating multi-step sequences (the program loop, erase loops, and the
//! read-modify-write cycles the drivers build on top) are serialized through
//! one external mutex, consumed as an opaque [`RawMutex`] service.

use embassy_sync::blocking_mutex::raw::RawMutex;
use strata_hal::{FlashDevice, FlashError, FlashGeometry};

use crate::error::{Result, StorageError};

/// Staging buffer length for writes sourced from the mapped window
const STAGE_BUF_LEN: usize = 64;

/// Sentinel base address meaning "always flush" (no exemption region)
pub const SKIP_FLUSH_DISABLED: u32 = u32::MAX;

/// A contiguous region of the linear flash address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    /// Start offset in bytes
    pub offset: u32,
    /// Length in bytes
    pub length: u32,
}

impl FlashRegion {
    /// One-past-the-end offset
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.length)
    }

    /// Whether `[addr, addr + len)` lies entirely inside this region
    pub fn covers(&self, addr: u32, len: u32) -> bool {
        addr >= self.offset && addr.saturating_add(len) <= self.end()
    }
}

/// Outcome of the write-feasibility analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Feasibility {
    /// Some byte needs a 0 -> 1 bit transition; a sector erase is required
    NeedsErase,
    /// The data can be programmed in place; the first `n` bytes already
    /// match and may be skipped
    WritableFrom(usize),
}

/// Adapter state: the raw device plus cache bookkeeping.
///
/// Obtained through [`Flash::with_lock`]; driver code holds it for the whole
/// duration of a multi-step sequence so no other task can interleave.
pub struct FlashCore<D> {
    dev: D,
    cache_code: u8,
    skip_flush: Option<FlashRegion>,
}

impl<D: FlashDevice> FlashCore<D> {
    /// Device geometry
    pub fn geometry(&self) -> FlashGeometry {
        self.dev.geometry()
    }

    /// Sector (erase unit) size in bytes
    pub fn erase_size(&self) -> u32 {
        self.dev.geometry().sector_size
    }

    /// Total device size in bytes
    pub fn size(&self) -> u32 {
        self.dev.geometry().size
    }

    /// Direct access to the raw device
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Mutable access to the raw device
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Read bytes starting at `addr`, clipped to the device size.
    ///
    /// Returns the number of bytes read.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if addr >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - addr) as usize);
        self.dev.read(addr, &mut buf[..len])?;
        Ok(len)
    }

    /// Write bytes starting at `addr`, clipped to the device size.
    ///
    /// Loops over page truncation until the full length is programmed. Data
    /// sourced from the device's own mapped window is staged through a small
    /// local buffer first. Returns the number of bytes written.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<usize> {
        let size = self.size();
        if addr >= size {
            return Ok(0);
        }
        let len = data.len().min((size - addr) as usize);
        let data = &data[..len];

        if self.dev.buffer_in_window(data) {
            let mut stage = [0u8; STAGE_BUF_LEN];
            let mut done = 0;
            while done < len {
                let chunk = (len - done).min(STAGE_BUF_LEN);
                stage[..chunk].copy_from_slice(&data[done..done + chunk]);
                self.program_all(addr + done as u32, &stage[..chunk])?;
                done += chunk;
            }
        } else {
            self.program_all(addr, data)?;
        }

        self.maybe_flush(addr, len as u32);
        Ok(len)
    }

    fn program_all(&mut self, mut addr: u32, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.dev.program(addr, data)?;
            if n == 0 {
                return Err(StorageError::Flash(FlashError::Device));
            }
            addr += n as u32;
            data = &data[n..];
        }
        Ok(())
    }

    /// Erase every sector touched by `[addr, addr + len)`.
    ///
    /// The range is expanded down/up to sector boundaries and clipped to the
    /// device.
    pub fn erase_region(&mut self, addr: u32, len: u32) -> Result<()> {
        let g = self.geometry();
        if len == 0 || addr >= g.size {
            return Ok(());
        }
        let start = addr - addr % g.sector_size;
        let end_req = addr.saturating_add(len);
        let end = end_req
            .checked_next_multiple_of(g.sector_size)
            .unwrap_or(g.size)
            .min(g.size);
        let mut a = start;
        while a < end {
            self.dev.erase_sector(a)?;
            a += g.sector_size;
        }
        self.maybe_flush(start, end - start);
        Ok(())
    }

    /// Erase the entire device
    pub fn chip_erase(&mut self) -> Result<()> {
        self.dev.chip_erase()?;
        let size = self.size();
        self.maybe_flush(0, size);
        Ok(())
    }

    /// Test whether `data` can be written at `addr` without a sector erase.
    ///
    /// Flash bits only transition 1 -> 0 when programmed. While stored bytes
    /// match `data` a leading-match counter advances; from the first mismatch
    /// on, every remaining byte must satisfy `old & new == new` or the write
    /// needs an erase.
    pub fn update_possible(&self, addr: u32, data: &[u8]) -> Result<Feasibility> {
        let size = self.size();
        if addr >= size {
            return Ok(Feasibility::WritableFrom(0));
        }
        let len = data.len().min((size - addr) as usize);

        let mut buf = [0u8; STAGE_BUF_LEN];
        let mut same = 0usize;
        let mut matching = true;
        let mut pos = 0usize;
        while pos < len {
            let chunk = (len - pos).min(STAGE_BUF_LEN);
            self.dev.read(addr + pos as u32, &mut buf[..chunk])?;
            for i in 0..chunk {
                let old = buf[i];
                let new = data[pos + i];
                if matching && old == new {
                    same += 1;
                } else {
                    matching = false;
                    if old & new != new {
                        return Ok(Feasibility::NeedsErase);
                    }
                }
            }
            pos += chunk;
        }
        Ok(Feasibility::WritableFrom(same))
    }

    /// Declare the single cache-flush exemption region.
    ///
    /// A `base` of [`SKIP_FLUSH_DISABLED`] removes the exemption. Setting a
    /// new region replaces the previous one.
    pub fn skip_cache_flushing(&mut self, base: u32, size: u32) {
        if base == SKIP_FLUSH_DISABLED {
            self.skip_flush = None;
        } else {
            self.skip_flush = Some(FlashRegion {
                offset: base,
                length: size,
            });
        }
    }

    /// Memory-mapped view of `[addr, addr + len)` if the device provides one
    pub fn mapped(&self, addr: u32, len: u32) -> Option<&[u8]> {
        self.dev
            .mapped()
            .and_then(|m| m.get(addr as usize..(addr as usize).checked_add(len as usize)?))
    }

    fn cache_len(&self) -> u32 {
        // Register code 0 disables caching; otherwise the cache covers the
        // first (N + 1) x 64 KiB of the device.
        if self.cache_code == 0 {
            0
        } else {
            (self.cache_code as u32 + 1) * 64 * 1024
        }
    }

    fn maybe_flush(&mut self, addr: u32, len: u32) {
        let cache = self.cache_len();
        if cache == 0 || addr >= cache {
            return;
        }
        if let Some(exempt) = self.skip_flush {
            if exempt.covers(addr, len) {
                return;
            }
        }
        self.dev.flush_cache();
    }
}

/// Flash device front: adapter state behind the external mutex.
pub struct Flash<D, M: RawMutex> {
    mutex: M,
    core: FlashCore<D>,
}

impl<D: FlashDevice, M: RawMutex> Flash<D, M> {
    /// Wrap a raw device.
    ///
    /// `cache_code` is the cache-size register value: 0 for no caching,
    /// otherwise the cache spans `(code + 1) x 64 KiB`.
    pub fn new(dev: D, cache_code: u8) -> Self {
        Self {
            mutex: M::INIT,
            core: FlashCore {
                dev,
                cache_code,
                skip_flush: None,
            },
        }
    }

    /// Run a multi-step sequence with the flash mutex held.
    ///
    /// Acquisition blocks indefinitely; there is no timeout to configure.
    pub fn with_lock<R>(&mut self, f: impl FnOnce(&mut FlashCore<D>) -> R) -> R {
        let Self { mutex, core } = self;
        mutex.lock(|| f(core))
    }

    /// Device geometry
    pub fn geometry(&self) -> FlashGeometry {
        self.core.geometry()
    }

    /// Sector (erase unit) size in bytes
    pub fn erase_size(&self) -> u32 {
        self.core.erase_size()
    }

    /// Total device size in bytes
    pub fn size(&self) -> u32 {
        self.core.size()
    }

    /// Read without taking the mutex (reads never mutate device state)
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        self.core.read(addr, buf)
    }

    /// Feasibility analysis without taking the mutex
    pub fn update_possible(&self, addr: u32, data: &[u8]) -> Result<Feasibility> {
        self.core.update_possible(addr, data)
    }

    /// Memory-mapped view if the device provides one
    pub fn mapped(&self, addr: u32, len: u32) -> Option<&[u8]> {
        self.core.mapped(addr, len)
    }

    /// Locked single-shot write
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<usize> {
        self.with_lock(|fl| fl.write(addr, data))
    }

    /// Locked sector-rounded erase
    pub fn erase_region(&mut self, addr: u32, len: u32) -> Result<()> {
        self.with_lock(|fl| fl.erase_region(addr, len))
    }

    /// Locked full-device erase
    pub fn chip_erase(&mut self) -> Result<()> {
        self.with_lock(|fl| fl.chip_erase())
    }

    /// Locked update of the cache-flush exemption region
    pub fn skip_cache_flushing(&mut self, base: u32, size: u32) {
        self.with_lock(|fl| fl.skip_cache_flushing(base, size));
    }

    /// Tear down the adapter and hand the raw device back
    pub fn release(self) -> D {
        self.core.dev
    }
}
