//! Error types for slot and region allocation.

use crate::region::Region;

/// Errors from [`SlotAllocator`](crate::SlotAllocator).
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// The slot layout constants are unusable on this host.
    #[error("invalid slot layout: {0}")]
    InvalidLayout(String),

    /// The address is not the start of any managed slot.
    #[error("address {0:#x} is not a slot address")]
    NotSlotAddress(usize),

    /// A file-backed mapping was requested at an offset that is not page-aligned.
    #[error("file offset {0:#x} is not page-aligned")]
    MisalignedOffset(u64),

    /// The slot is already in use.
    #[error("slot {0} is already occupied")]
    Occupied(usize),

    /// The OS placed the mapping somewhere other than the requested address.
    #[error("requested mapping at {requested:#x} but the OS placed it at {actual:#x}")]
    Relocated {
        /// The slot address that was requested.
        requested: usize,
        /// Where the kernel put the mapping instead.
        actual: usize,
    },

    /// A memory-mapping call failed.
    #[error("memory mapping failed: {0}")]
    Os(#[from] std::io::Error),
}

/// Errors from [`RegionAllocator`](crate::RegionAllocator).
///
/// Every failing call leaves the allocator exactly as it was before the call.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The region cannot satisfy the request.
    #[error("out of {region} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// The region that was exhausted.
        region: Region,
        /// Bytes requested, excluding alignment padding.
        requested: usize,
        /// Bytes that were still free.
        available: usize,
    },

    /// The alignment is not a power of two.
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    /// The code area is currently executable and cannot be written.
    #[error("code area is not writable")]
    NotWritable,

    /// A function body is open; the call needs it to be finished first.
    #[error("function '{0}' is still being emitted")]
    FunctionInProgress(String),

    /// `end_function` was called without a matching `begin_function`.
    #[error("no function body is open for '{0}'")]
    NoOpenFunction(String),

    /// A function with this name has already been emitted.
    #[error("function '{0}' is already defined")]
    DuplicateFunction(String),

    /// No function with this name has been emitted.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// The global offset table has already been reserved.
    #[error("global offset table is already allocated")]
    GotAlreadyAllocated,

    /// The byte range does not lie inside this allocator's slot.
    #[error("range {addr:#x}+{size} lies outside the slot")]
    OutOfBounds {
        /// Start address of the range.
        addr: usize,
        /// Length of the range.
        size: usize,
    },

    /// Changing page protection failed.
    #[error("changing page protection failed: {0}")]
    Protect(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_relocated() {
        let err = SlotError::Relocated {
            requested: 0x6000_0000_0000,
            actual: 0x7f00_0000_0000,
        };
        assert_eq!(
            format!("{err}"),
            "requested mapping at 0x600000000000 but the OS placed it at 0x7f0000000000"
        );
    }

    #[test]
    fn display_out_of_memory() {
        let err = AllocError::OutOfMemory {
            region: Region::Global,
            requested: 4096,
            available: 100,
        };
        assert_eq!(
            format!("{err}"),
            "out of global data memory: requested 4096 bytes, 100 available"
        );
    }

    #[test]
    fn display_not_slot_address() {
        assert_eq!(
            format!("{}", SlotError::NotSlotAddress(0x1000)),
            "address 0x1000 is not a slot address"
        );
    }
}
