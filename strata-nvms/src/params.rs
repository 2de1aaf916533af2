//! Tag-keyed parameter store
//!
//! Parameters live in named areas, each bound to one partition at a fixed
//! offset. The layout is compiled in: an area lists its parameters with tag,
//! kind, maximum length and offset, and every access goes through the bound
//! partition driver, so the same store works over a direct-mapped region or
//! a wear-leveled one.
//!
//! Fixed parameters occupy their full span. Variable parameters start with a
//! 2-byte little-endian length prefix; `0xFFFF` (untouched flash) means
//! empty. A stored length beyond the parameter's capacity is corruption and
//! reads as empty, asserted only in debug builds.

use embassy_sync::blocking_mutex::raw::RawMutex;
use strata_core::table::PartitionType;
use strata_hal::FlashDevice;

use crate::manager::{PartitionHandle, StorageManager};

/// Length prefix value meaning "never written"
const LEN_EMPTY: u16 = 0xFFFF;

/// How a parameter's bytes are laid out in its span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamKind {
    /// Occupies the full `max_len` span
    Fixed,
    /// 2-byte length prefix, then up to `max_len - 2` data bytes
    Variable,
}

/// One parameter in an area's compiled-in layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParameterDescriptor {
    /// Lookup key, a single byte unique within the area
    pub tag: u8,
    pub kind: ParamKind,
    /// Full span in bytes, prefix included for variable parameters
    pub max_len: u16,
    /// Offset from the area base
    pub offset: u32,
}

/// A named run of parameters on one partition
pub struct ParameterArea {
    pub name: &'static str,
    /// Partition the area lives on; must bind at init for the area to open
    pub partition: PartitionType,
    /// Partition-relative offset of the area base
    pub offset: u32,
    pub params: &'static [ParameterDescriptor],
}

/// Opaque reference to one parameter area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParamHandle(usize);

impl<D: FlashDevice, M: RawMutex> StorageManager<D, M> {
    /// Handle for a named parameter area.
    ///
    /// Fails when the name is unknown or the area's partition never bound.
    pub fn param_open(&self, name: &str) -> Option<ParamHandle> {
        let idx = self.areas.iter().position(|a| a.name == name)?;
        self.open(self.areas[idx].partition)?;
        Some(ParamHandle(idx))
    }

    /// Write a parameter; returns bytes stored.
    ///
    /// Data beyond the parameter's capacity is truncated. Variable
    /// parameters store the data first and commit the length prefix last.
    pub fn param_write(&mut self, handle: ParamHandle, tag: u8, data: &[u8]) -> usize {
        let Some((part, off, param)) = self.param_target(handle, tag) else {
            return 0;
        };
        match param.kind {
            ParamKind::Fixed => {
                let n = data.len().min(param.max_len as usize);
                self.write(part, off, &data[..n])
            }
            ParamKind::Variable => {
                if param.max_len < 2 {
                    return 0;
                }
                let n = data.len().min(param.max_len as usize - 2);
                if self.write(part, off + 2, &data[..n]) != n {
                    return 0;
                }
                if self.write(part, off, &(n as u16).to_le_bytes()) != 2 {
                    return 0;
                }
                n
            }
        }
    }

    /// Read a parameter starting `skip` bytes into its value.
    ///
    /// Returns bytes read: at most `max_len - skip` for fixed parameters,
    /// and clamped to the stored length for variable ones (0 when empty).
    pub fn param_read_offset(
        &self,
        handle: ParamHandle,
        tag: u8,
        skip: u32,
        buf: &mut [u8],
    ) -> usize {
        let Some((part, off, param)) = self.param_target(handle, tag) else {
            return 0;
        };
        match param.kind {
            ParamKind::Fixed => {
                let avail = (param.max_len as u32).saturating_sub(skip) as usize;
                let n = buf.len().min(avail);
                self.read(part, off + skip, &mut buf[..n])
            }
            ParamKind::Variable => {
                let stored = self.variable_len(part, off, param.max_len) as u32;
                let avail = stored.saturating_sub(skip) as usize;
                let n = buf.len().min(avail);
                self.read(part, off + 2 + skip, &mut buf[..n])
            }
        }
    }

    /// Current and maximum length of a parameter.
    ///
    /// Fixed parameters always report `max_len`. Unknown tags report (0, 0).
    pub fn param_get_length(&self, handle: ParamHandle, tag: u8) -> (u16, u16) {
        let Some((part, off, param)) = self.param_target(handle, tag) else {
            return (0, 0);
        };
        match param.kind {
            ParamKind::Fixed => (param.max_len, param.max_len),
            ParamKind::Variable => (self.variable_len(part, off, param.max_len), param.max_len),
        }
    }

    /// Clear a parameter's full span back to the erased pattern.
    ///
    /// A logical clear through the bound driver, not a physical sector
    /// erase.
    pub fn param_erase(&mut self, handle: ParamHandle, tag: u8) -> bool {
        let Some((part, off, param)) = self.param_target(handle, tag) else {
            return false;
        };
        let blank = [0xFFu8; 256];
        let mut done = 0usize;
        while done < param.max_len as usize {
            let chunk = (param.max_len as usize - done).min(blank.len());
            if self.write(part, off + done as u32, &blank[..chunk]) != chunk {
                return false;
            }
            done += chunk;
        }
        true
    }

    /// Clear every parameter in the area
    pub fn param_erase_all(&mut self, handle: ParamHandle) -> bool {
        let Some(area) = self.areas.get(handle.0) else {
            debug_assert!(false, "invalid parameter handle");
            return false;
        };
        let mut ok = true;
        for param in area.params {
            ok &= self.param_erase(handle, param.tag);
        }
        ok
    }

    fn param_target(
        &self,
        handle: ParamHandle,
        tag: u8,
    ) -> Option<(PartitionHandle, u32, ParameterDescriptor)> {
        let Some(area) = self.areas.get(handle.0) else {
            debug_assert!(false, "invalid parameter handle");
            return None;
        };
        let param = *area.params.iter().find(|p| p.tag == tag)?;
        let part = self.open(area.partition)?;
        Some((part, area.offset + param.offset, param))
    }

    /// Stored length of a variable parameter, 0 when empty or unreadable.
    /// An out-of-range stored value is corruption: fail safe to empty.
    fn variable_len(&self, part: PartitionHandle, off: u32, max_len: u16) -> u16 {
        if max_len < 2 {
            return 0;
        }
        let mut raw = [0u8; 2];
        if self.read(part, off, &mut raw) != 2 {
            return 0;
        }
        let stored = u16::from_le_bytes(raw);
        if stored == LEN_EMPTY {
            return 0;
        }
        if stored > max_len - 2 {
            debug_assert!(false, "stored parameter length exceeds its span");
            #[cfg(feature = "defmt")]
            defmt::warn!("parameter length {} exceeds span {}, reading as empty", stored, max_len);
            return 0;
        }
        stored
    }
}
