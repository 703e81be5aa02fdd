//! The fixed-address slot table.

use crate::error::SlotError;
use crate::os::{self, Protection};
use kiln_config::MemoryConfig;
use std::fmt;
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Geometry of the slot table.
///
/// Slot `i` covers `[base + i * slot_size, base + (i + 1) * slot_size)`. The
/// first `code_size` bytes of a slot hold code and stubs; the rest holds
/// global data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    base: usize,
    slot_count: usize,
    code_size: usize,
    data_size: usize,
    got_size: usize,
}

impl SlotLayout {
    /// Validates the layout against the host page size and address width.
    pub fn new(
        base: usize,
        slot_count: usize,
        code_size: usize,
        data_size: usize,
        got_size: usize,
    ) -> Result<Self, SlotError> {
        let page = os::page_size();
        let invalid = |msg: String| Err(SlotError::InvalidLayout(msg));

        if slot_count == 0 {
            return invalid("slot count must be non-zero".to_string());
        }
        if base == 0 || base % page != 0 {
            return invalid(format!("base address {base:#x} is not page-aligned"));
        }
        if code_size == 0 || code_size % page != 0 {
            return invalid(format!("code size {code_size} is not a multiple of {page}"));
        }
        if data_size == 0 || data_size % page != 0 {
            return invalid(format!("data size {data_size} is not a multiple of {page}"));
        }
        if got_size >= code_size {
            return invalid(format!(
                "GOT size {got_size} does not fit in code size {code_size}"
            ));
        }
        let overflows = (code_size + data_size)
            .checked_mul(slot_count)
            .and_then(|span| span.checked_add(base))
            .is_none();
        if overflows {
            return invalid("slots extend past the end of the address space".to_string());
        }

        Ok(Self {
            base,
            slot_count,
            code_size,
            data_size,
            got_size,
        })
    }

    /// Builds a layout from the `[memory]` section of `kiln.toml`.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, SlotError> {
        let base = usize::try_from(config.base_address).map_err(|_| {
            SlotError::InvalidLayout(format!(
                "base address {:#x} does not fit in a pointer",
                config.base_address
            ))
        })?;
        Self::new(
            base,
            config.slot_count,
            config.code_size,
            config.data_size,
            config.got_size,
        )
    }

    /// Address of slot 0.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Size of the code+stub sub-area.
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Size of the global data sub-area.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Size of the global offset table.
    pub fn got_size(&self) -> usize {
        self.got_size
    }

    /// Total size of one slot.
    pub fn slot_size(&self) -> usize {
        self.code_size + self.data_size
    }

    /// Start address of slot `index`.
    pub fn slot_address(&self, index: usize) -> usize {
        self.base + index * self.slot_size()
    }

    /// Returns the slot index if `addr` is exactly the start of a slot.
    pub fn slot_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let index = offset / self.slot_size();
        (offset % self.slot_size() == 0 && index < self.slot_count).then_some(index)
    }

    /// Returns the slot index containing `addr`, if any.
    fn containing_slot(&self, addr: usize) -> Option<usize> {
        let index = addr.checked_sub(self.base)? / self.slot_size();
        (index < self.slot_count).then_some(index)
    }
}

struct SlotTable {
    layout: SlotLayout,
    occupied: Mutex<Vec<bool>>,
}

impl SlotTable {
    fn lock(&self) -> MutexGuard<'_, Vec<bool>> {
        // A plain flag vector stays consistent even if a holder panicked.
        self.occupied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The process-wide table of fixed-address slots.
///
/// Cloning is cheap and every clone shares the same table, so the allocator
/// can be handed to each compiler instance that needs it. All occupancy
/// changes go through one mutex.
#[derive(Clone)]
pub struct SlotAllocator {
    table: Arc<SlotTable>,
}

impl SlotAllocator {
    /// Creates an allocator with every slot free.
    pub fn new(layout: SlotLayout) -> Self {
        Self {
            table: Arc::new(SlotTable {
                layout,
                occupied: Mutex::new(vec![false; layout.slot_count]),
            }),
        }
    }

    /// The geometry this allocator manages.
    pub fn layout(&self) -> &SlotLayout {
        &self.table.layout
    }

    /// Maps fresh RWX memory for one slot.
    ///
    /// Slots are tried in order; a slot whose address the OS will not grant
    /// (another mapping is in the way) is skipped. When no slot is available
    /// the memory is mapped wherever the OS chooses and the returned handle
    /// reports `is_fixed() == false`.
    pub fn allocate(&self) -> Result<SlotHandle, SlotError> {
        let layout = self.table.layout;
        let len = layout.slot_size();
        {
            let mut occupied = self.table.lock();
            for index in 0..layout.slot_count {
                if occupied[index] {
                    continue;
                }
                let requested = layout.slot_address(index);
                let Ok(actual) = os::map_anonymous(requested, len, Protection::ReadWriteExec)
                else {
                    continue;
                };
                if actual == requested {
                    occupied[index] = true;
                    return Ok(self.handle(actual, Some(index)));
                }
                // SAFETY: the mapping was created just above and never exposed.
                let _ = unsafe { os::unmap(actual, len) };
            }
        }

        let addr = os::map_anonymous(0, len, Protection::ReadWriteExec)?;
        Ok(self.handle(addr, None))
    }

    /// Maps `file` at exactly `address`, which must be a free slot.
    ///
    /// The mapping is private: writes are never carried back to the file.
    /// On any failure the slot stays free.
    pub fn allocate_from_file(
        &self,
        address: usize,
        file: &File,
        offset: u64,
    ) -> Result<SlotHandle, SlotError> {
        let layout = self.table.layout;
        if offset % os::page_size() as u64 != 0 {
            return Err(SlotError::MisalignedOffset(offset));
        }
        let index = layout
            .slot_index(address)
            .ok_or(SlotError::NotSlotAddress(address))?;

        let mut occupied = self.table.lock();
        if occupied[index] {
            return Err(SlotError::Occupied(index));
        }
        let len = layout.slot_size();
        let actual = os::map_file(address, len, Protection::ReadWriteExec, file, offset)?;
        if actual != address {
            // SAFETY: the mapping was created just above and never exposed.
            let _ = unsafe { os::unmap(actual, len) };
            return Err(SlotError::Relocated {
                requested: address,
                actual,
            });
        }
        occupied[index] = true;
        Ok(self.handle(actual, Some(index)))
    }

    /// Releases a slot. Equivalent to dropping the handle.
    pub fn deallocate(&self, handle: SlotHandle) {
        drop(handle);
    }

    /// Whether `addr` lies inside a slot that is currently occupied.
    pub fn is_managing(&self, addr: usize) -> bool {
        match self.table.layout.containing_slot(addr) {
            Some(index) => self.table.lock()[index],
            None => false,
        }
    }

    /// Number of occupied slots.
    pub fn occupied_count(&self) -> usize {
        self.table.lock().iter().filter(|&&taken| taken).count()
    }

    fn handle(&self, addr: usize, slot: Option<usize>) -> SlotHandle {
        SlotHandle {
            addr,
            len: self.table.layout.slot_size(),
            slot,
            table: Arc::clone(&self.table),
        }
    }
}

impl fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("layout", &self.table.layout)
            .field("occupied", &self.occupied_count())
            .finish()
    }
}

/// Exclusive ownership of one mapped slot-sized range.
///
/// Dropping the handle unmaps the memory and, for a fixed slot, returns the
/// slot to the table.
pub struct SlotHandle {
    addr: usize,
    len: usize,
    slot: Option<usize>,
    table: Arc<SlotTable>,
}

impl SlotHandle {
    /// Start address of the mapping.
    pub fn address(&self) -> usize {
        self.addr
    }

    /// Length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; slots are never empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this is a fixed slot, and therefore eligible for caching.
    pub fn is_fixed(&self) -> bool {
        self.slot.is_some()
    }

    /// The slot index, or `None` for an OS-placed fallback mapping.
    pub fn slot_index(&self) -> Option<usize> {
        self.slot
    }

    /// The layout of the table this handle came from.
    pub fn layout(&self) -> &SlotLayout {
        &self.table.layout
    }

    /// Raw pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// The mapped bytes. Every protection mode used here keeps them readable.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is mapped and readable for as long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Whether `addr..addr + size` lies inside this mapping.
    pub fn contains(&self, addr: usize, size: usize) -> bool {
        addr >= self.addr
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.addr + self.len)
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is the sole owner of the mapping, and borrows
        // handed out by `as_slice` cannot outlive it.
        if unsafe { os::unmap(self.addr, self.len) }.is_err() {
            // Keep the slot marked taken; the range is still mapped.
            return;
        }
        if let Some(index) = self.slot {
            self.table.lock()[index] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KIB: usize = 1024;

    fn layout(base: usize, slots: usize) -> SlotLayout {
        SlotLayout::new(base, slots, 16 * KIB, 16 * KIB, KIB).unwrap()
    }

    #[test]
    fn layout_rejects_zero_slots() {
        let err = SlotLayout::new(0x5a10_0000_0000, 0, 16 * KIB, 16 * KIB, KIB).unwrap_err();
        assert!(matches!(err, SlotError::InvalidLayout(_)));
    }

    #[test]
    fn layout_rejects_unaligned_base() {
        let err = SlotLayout::new(0x5a10_0000_0123, 2, 16 * KIB, 16 * KIB, KIB).unwrap_err();
        assert!(matches!(err, SlotError::InvalidLayout(_)));
    }

    #[test]
    fn layout_rejects_unaligned_sizes() {
        assert!(SlotLayout::new(0x5a10_0000_0000, 2, 5000, 16 * KIB, KIB).is_err());
        assert!(SlotLayout::new(0x5a10_0000_0000, 2, 16 * KIB, 5000, KIB).is_err());
    }

    #[test]
    fn layout_slot_index() {
        let layout = layout(0x5a10_0000_0000, 4);
        assert_eq!(layout.slot_index(0x5a10_0000_0000), Some(0));
        assert_eq!(layout.slot_index(layout.slot_address(3)), Some(3));
        assert_eq!(layout.slot_index(layout.slot_address(4)), None);
        assert_eq!(layout.slot_index(0x5a10_0000_0010), None);
        assert_eq!(layout.slot_index(0x1000), None);
    }

    #[test]
    fn layout_from_default_config() {
        let layout = SlotLayout::from_config(&MemoryConfig::default()).unwrap();
        assert_eq!(layout.slot_size(), 256 * KIB);
        assert_eq!(layout.slot_count(), 8);
    }

    #[test]
    fn allocate_takes_first_slot_and_frees_on_drop() {
        let alloc = SlotAllocator::new(layout(0x5a20_0000_0000, 2));
        let handle = alloc.allocate().unwrap();
        assert!(handle.is_fixed());
        assert_eq!(handle.address(), 0x5a20_0000_0000);
        assert_eq!(handle.slot_index(), Some(0));
        assert!(alloc.is_managing(handle.address() + 100));
        assert!(handle.as_slice().iter().all(|&b| b == 0));

        let addr = handle.address();
        alloc.deallocate(handle);
        assert!(!alloc.is_managing(addr));
        assert_eq!(alloc.occupied_count(), 0);
    }

    #[test]
    fn exhausted_table_falls_back_to_os_address() {
        let alloc = SlotAllocator::new(layout(0x5a30_0000_0000, 1));
        let fixed = alloc.allocate().unwrap();
        let floating = alloc.allocate().unwrap();
        assert!(fixed.is_fixed());
        assert!(!floating.is_fixed());
        assert_ne!(floating.address(), fixed.address());
        assert!(!alloc.is_managing(floating.address()));
        drop(floating);
        assert_eq!(alloc.occupied_count(), 1);
    }

    #[test]
    fn foreign_mapping_is_skipped() {
        let layout = layout(0x5a40_0000_0000, 2);
        let blocker =
            os::map_anonymous(layout.slot_address(0), layout.slot_size(), Protection::ReadWrite)
                .unwrap();
        assert_eq!(blocker, layout.slot_address(0));

        let alloc = SlotAllocator::new(layout);
        let handle = alloc.allocate().unwrap();
        assert_eq!(handle.slot_index(), Some(1));

        drop(handle);
        unsafe { os::unmap(blocker, layout.slot_size()).unwrap() };
    }

    #[test]
    fn allocate_from_file_maps_contents() {
        let layout = layout(0x5a50_0000_0000, 2);
        let mut file = tempfile::tempfile().unwrap();
        let mut image = vec![0u8; layout.slot_size()];
        image[0] = 0xAB;
        image[layout.slot_size() - 1] = 0xCD;
        file.write_all(&image).unwrap();

        let alloc = SlotAllocator::new(layout);
        let handle = alloc
            .allocate_from_file(layout.slot_address(1), &file, 0)
            .unwrap();
        assert_eq!(handle.slot_index(), Some(1));
        assert_eq!(handle.as_slice()[0], 0xAB);
        assert_eq!(handle.as_slice()[layout.slot_size() - 1], 0xCD);
    }

    #[test]
    fn allocate_from_file_rejects_bad_requests() {
        let layout = layout(0x5a60_0000_0000, 2);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; layout.slot_size()]).unwrap();
        let alloc = SlotAllocator::new(layout);

        let err = alloc
            .allocate_from_file(layout.slot_address(0) + 4096, &file, 0)
            .unwrap_err();
        assert!(matches!(err, SlotError::NotSlotAddress(_)));

        let err = alloc
            .allocate_from_file(layout.slot_address(0), &file, 100)
            .unwrap_err();
        assert!(matches!(err, SlotError::MisalignedOffset(100)));

        let held = alloc.allocate().unwrap();
        let err = alloc
            .allocate_from_file(held.address(), &file, 0)
            .unwrap_err();
        assert!(matches!(err, SlotError::Occupied(0)));
        assert_eq!(alloc.occupied_count(), 1);
    }

    #[test]
    fn clones_share_the_table() {
        let alloc = SlotAllocator::new(layout(0x5a70_0000_0000, 1));
        let other = alloc.clone();
        let handle = alloc.allocate().unwrap();
        assert!(other.is_managing(handle.address()));
        assert!(!other.allocate().unwrap().is_fixed());
    }
}
