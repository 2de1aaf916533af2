//! VES container layout
//!
//! A container is one fixed-size slot holding one version of one virtual
//! block. Everything needed to judge a slot during recovery lives in the
//! slot itself:
//!
//! ```text
//! ┌──────┬────────┬───────────────┬─────────────────────────┐
//! │ key  │ status │ crc16 LE      │ payload (to end of slot)│
//! │ 1 B  │ 1 B    │ 2 B, optional │ 62 B / 60 B default     │
//! └──────┴────────┴───────────────┴─────────────────────────┘
//! ```
//!
//! The status byte only ever clears bits, so its whole life cycle fits in
//! one slot without an erase:
//! erased (0xFF) -> pending (0xFC) -> valid (0xF0) -> dirty (0x00).
//! A writer programs the full container with status `pending` in a single
//! program operation, dirties the superseded container, then confirms the
//! new one `valid`. Recovery can therefore always order two containers for
//! the same key: a pending one is newer than a valid one.

use crc::{Crc, CRC_16_IBM_3740};

/// Slot never written since the last sector erase
pub const STATUS_ERASED: u8 = 0xFF;
/// Container fully programmed, predecessor not yet dirtied
pub const STATUS_PENDING: u8 = 0xFC;
/// Container is the committed version of its key
pub const STATUS_VALID: u8 = 0xF0;
/// Container superseded; reclaimable by garbage collection
pub const STATUS_DIRTY: u8 = 0x00;

/// Key value reserved for erased slots
pub const KEY_NONE: u8 = 0xFF;

/// Largest supported container slot
pub const MAX_CONTAINER_SIZE: usize = 128;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Geometry of the containers inside one VES partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContainerLayout {
    /// Slot size in bytes (default 64)
    pub slot_len: u16,
    /// Whether payloads are CRC-protected
    pub crc: bool,
}

/// What a scanned slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContainerState {
    /// Fully erased, available for an append
    Erased,
    /// Partially programmed or corrupt; treated as never written
    Torn,
    /// Carrying a payload version for `key`
    Live { key: u8, pending: bool },
    /// Superseded payload
    Dirty,
}

impl ContainerLayout {
    /// Per-container overhead in bytes (2 without CRC, 4 with)
    pub fn overhead(&self) -> usize {
        if self.crc {
            4
        } else {
            2
        }
    }

    /// Payload bytes carried by each container
    pub fn payload_len(&self) -> usize {
        self.slot_len as usize - self.overhead()
    }

    /// Offset of the payload inside the slot
    pub fn payload_offset(&self) -> usize {
        self.overhead()
    }

    fn crc_of(&self, key: u8, payload: &[u8]) -> u16 {
        let mut digest = CRC16.digest();
        digest.update(&[key]);
        digest.update(payload);
        digest.finalize()
    }

    /// Assemble a pending container for `key` into `out[..slot_len]`
    pub fn build(&self, key: u8, payload: &[u8], out: &mut [u8]) {
        debug_assert_eq!(payload.len(), self.payload_len());
        let out = &mut out[..self.slot_len as usize];
        out[0] = key;
        out[1] = STATUS_PENDING;
        if self.crc {
            out[2..4].copy_from_slice(&self.crc_of(key, payload).to_le_bytes());
        }
        out[self.payload_offset()..].copy_from_slice(payload);
    }

    /// Classify a scanned slot
    pub fn parse(&self, raw: &[u8]) -> ContainerState {
        let raw = &raw[..self.slot_len as usize];
        match raw[1] {
            STATUS_ERASED => {
                if raw.iter().all(|&b| b == 0xFF) {
                    ContainerState::Erased
                } else {
                    ContainerState::Torn
                }
            }
            STATUS_DIRTY => ContainerState::Dirty,
            status @ (STATUS_PENDING | STATUS_VALID) => {
                let key = raw[0];
                if key == KEY_NONE {
                    return ContainerState::Torn;
                }
                if self.crc {
                    let stored = u16::from_le_bytes([raw[2], raw[3]]);
                    if stored != self.crc_of(key, &raw[self.payload_offset()..]) {
                        return ContainerState::Torn;
                    }
                }
                ContainerState::Live {
                    key,
                    pending: status == STATUS_PENDING,
                }
            }
            _ => ContainerState::Torn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ContainerLayout = ContainerLayout {
        slot_len: 64,
        crc: true,
    };

    #[test]
    fn test_overhead_matches_contract() {
        assert_eq!(LAYOUT.overhead(), 4);
        assert_eq!(LAYOUT.payload_len(), 60);
        let no_crc = ContainerLayout {
            slot_len: 64,
            crc: false,
        };
        assert_eq!(no_crc.overhead(), 2);
        assert_eq!(no_crc.payload_len(), 62);
    }

    #[test]
    fn test_build_parse_round_trip() {
        let payload = [0x42; 60];
        let mut slot = [0xFF; 64];
        LAYOUT.build(7, &payload, &mut slot);
        assert_eq!(
            LAYOUT.parse(&slot),
            ContainerState::Live {
                key: 7,
                pending: true
            }
        );
        // Confirming clears two more status bits
        slot[1] &= STATUS_VALID;
        assert_eq!(
            LAYOUT.parse(&slot),
            ContainerState::Live {
                key: 7,
                pending: false
            }
        );
        // Dirtying clears the rest
        slot[1] = STATUS_DIRTY;
        assert_eq!(LAYOUT.parse(&slot), ContainerState::Dirty);
    }

    #[test]
    fn test_status_ladder_only_clears_bits() {
        assert_eq!(STATUS_ERASED & STATUS_PENDING, STATUS_PENDING);
        assert_eq!(STATUS_PENDING & STATUS_VALID, STATUS_VALID);
        assert_eq!(STATUS_VALID & STATUS_DIRTY, STATUS_DIRTY);
    }

    #[test]
    fn test_erased_and_torn_slots() {
        assert_eq!(LAYOUT.parse(&[0xFF; 64]), ContainerState::Erased);
        // Status still erased but payload bytes landed: torn program
        let mut torn = [0xFF; 64];
        torn[10] = 0x00;
        assert_eq!(LAYOUT.parse(&torn), ContainerState::Torn);
        // Half-written container: CRC cannot match
        let payload = [0xAB; 60];
        let mut slot = [0xFF; 64];
        LAYOUT.build(3, &payload, &mut slot);
        for b in &mut slot[32..] {
            *b = 0xFF;
        }
        assert_eq!(LAYOUT.parse(&slot), ContainerState::Torn);
        // Unknown status pattern
        let mut bad = [0xFF; 64];
        bad[0] = 1;
        bad[1] = 0xA5;
        assert_eq!(LAYOUT.parse(&bad), ContainerState::Torn);
    }

    #[test]
    fn test_crc_rejects_bit_flips() {
        let payload = [0x11; 60];
        let mut slot = [0xFF; 64];
        LAYOUT.build(9, &payload, &mut slot);
        slot[20] ^= 0x04;
        assert_eq!(LAYOUT.parse(&slot), ContainerState::Torn);
    }
}
