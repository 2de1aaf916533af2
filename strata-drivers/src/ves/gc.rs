//! Garbage-collection policy and victim selection
//!
//! GC reclaims the dirty containers of one sector at a time: live containers
//! are copied forward first, then the victim is erased (never the other way
//! around, so a power loss can only ever leave duplicates, not holes).
//!
//! Victim choice is the wear/cost trade-off knob:
//! - [`GcPolicy::MostDirty`] picks the sector with the most dirty
//!   containers, minimizing the live data that must be copied per reclaimed
//!   slot - the cheapest policy in total erase count.
//! - [`GcPolicy::Threshold`] makes any sector with at least that many dirty
//!   containers eligible and recycles the least-erased one, spending extra
//!   copies and erases to spread wear across all sectors.

/// Per-sector accounting, derived by scanning and kept current in RAM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorState {
    /// Containers holding the committed (or pending) version of a key
    pub live: u16,
    /// Superseded or torn containers, reclaimable by erase
    pub dirty: u16,
    /// Slots available for appends
    pub erased: u16,
    /// Sector erases observed this session
    pub erase_count: u32,
}

/// Victim-sector selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GcPolicy {
    /// Always recycle the sector with the most dirty containers
    MostDirty,
    /// Recycle the least-erased sector whose dirty count meets the
    /// threshold; falls back to most-dirty when none qualifies
    Threshold(u16),
}

/// Pick a victim sector, or `None` when no sector can be collected.
///
/// A victim is only feasible when its live containers fit into the erased
/// slots of the other sectors (`live <= total_erased - erased`), otherwise
/// copy-then-erase could not complete.
pub fn select_victim(sectors: &[SectorState], policy: GcPolicy, total_erased: u32) -> Option<usize> {
    let feasible = |s: &SectorState| {
        s.dirty > 0 && (s.live as u32) <= total_erased.saturating_sub(s.erased as u32)
    };

    let most_dirty = sectors
        .iter()
        .enumerate()
        .filter(|(_, s)| feasible(s))
        .max_by_key(|(_, s)| s.dirty)
        .map(|(i, _)| i);

    match policy {
        GcPolicy::MostDirty => most_dirty,
        GcPolicy::Threshold(t) => sectors
            .iter()
            .enumerate()
            .filter(|(_, s)| feasible(s) && s.dirty >= t.max(1))
            .min_by_key(|(_, s)| s.erase_count)
            .map(|(i, _)| i)
            .or(most_dirty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector(live: u16, dirty: u16, erased: u16, erase_count: u32) -> SectorState {
        SectorState {
            live,
            dirty,
            erased,
            erase_count,
        }
    }

    #[test]
    fn test_most_dirty_picks_max() {
        let sectors = [sector(10, 2, 4, 0), sector(4, 9, 3, 0), sector(12, 4, 0, 0)];
        assert_eq!(select_victim(&sectors, GcPolicy::MostDirty, 7), Some(1));
    }

    #[test]
    fn test_no_dirty_sector_means_no_victim() {
        let sectors = [sector(16, 0, 0, 0), sector(8, 0, 8, 0)];
        assert_eq!(select_victim(&sectors, GcPolicy::MostDirty, 8), None);
    }

    #[test]
    fn test_threshold_prefers_least_erased_eligible() {
        let sectors = [
            sector(4, 10, 2, 9),
            sector(3, 8, 5, 1),
            sector(12, 2, 2, 0), // below threshold
        ];
        assert_eq!(select_victim(&sectors, GcPolicy::Threshold(4), 9), Some(1));
    }

    #[test]
    fn test_threshold_falls_back_to_most_dirty() {
        let sectors = [sector(1, 1, 1, 0), sector(1, 2, 1, 5)];
        assert_eq!(select_victim(&sectors, GcPolicy::Threshold(8), 2), Some(1));
    }

    #[test]
    fn test_infeasible_victim_skipped() {
        // Sector 0 has the most dirt but its live data cannot be copied out
        let sectors = [sector(10, 12, 1, 0), sector(1, 9, 5, 0)];
        assert_eq!(select_victim(&sectors, GcPolicy::MostDirty, 6), Some(1));
    }
}
