//! Fixed-address memory management for compiled kernels.
//!
//! A compiled kernel is only reusable from the on-disk cache when it can be
//! mapped back at the exact virtual address it was generated for, because the
//! machine code contains absolute addresses into its own data. This crate
//! provides the two allocators that make that possible:
//!
//! - [`SlotAllocator`] reserves a fixed table of equally sized address ranges
//!   ("slots") at well-known addresses, shared by every user in the process.
//! - [`RegionAllocator`] lays out function bodies, stubs, and global data
//!   inside one slot with bump cursors.
//!
//! When every slot is busy, [`SlotAllocator::allocate`] still succeeds with an
//! OS-chosen address; [`SlotHandle::is_fixed`] reports whether the result may
//! be persisted.

#![warn(missing_docs)]

pub mod error;
mod os;
pub mod region;
pub mod slot;

pub use error::{AllocError, SlotError};
pub use os::page_size;
pub use region::{Allocation, FunctionExtent, Region, RegionAllocator};
pub use slot::{SlotAllocator, SlotHandle, SlotLayout};
