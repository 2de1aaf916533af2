//! Storage engine error type

use strata_hal::FlashError;

/// Errors from storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Offset or length falls outside the partition or device
    OutOfBounds,
    /// Partition is flagged read-only
    ReadOnly,
    /// The bound driver does not implement this operation
    Unsupported,
    /// No sector buffer available for a read-modify-write cycle
    NoBuffer,
    /// No free space left (table slots or log containers)
    Full,
    /// Stored data failed validation
    Corrupted,
    /// Partition exists but no driver accepted it
    NotBound,
    /// Configuration rejected at init/bind time
    InvalidConfig,
    /// Raw flash operation failed
    Flash(FlashError),
}

impl From<FlashError> for StorageError {
    fn from(e: FlashError) -> Self {
        StorageError::Flash(e)
    }
}

/// Convenience alias for storage results
pub type Result<T> = core::result::Result<T, StorageError>;
