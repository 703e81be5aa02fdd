//! Bump allocation of code, stubs, and global data inside one slot.
//!
//! ```text
//! slot start                         code_size                     slot end
//! |  functions -->      <-- stubs/GOT  |  globals -->                  |
//! ^ code cursor         ^ stub cursor  ^ global cursor
//! ```
//!
//! The code and stub regions share the code sub-area and grow toward each
//! other; global data lives in the disjoint data sub-area. Page protection is
//! only ever changed on the code sub-area.

use crate::error::AllocError;
use crate::os::{self, Protection};
use crate::slot::SlotHandle;
use std::fmt;

/// One of the three allocation regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// Function bodies and other code-area blocks, growing upward.
    Code,
    /// Stubs and the GOT, growing downward from the end of the code area.
    Stub,
    /// Global variables in the data sub-area.
    Global,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Code => write!(f, "code"),
            Region::Stub => write!(f, "stub"),
            Region::Global => write!(f, "global data"),
        }
    }
}

/// A block handed out by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Absolute address of the block.
    pub addr: usize,
    /// Offset of the block from the start of the slot.
    pub offset: usize,
    /// Size of the block in bytes.
    pub size: usize,
}

/// The address range of one emitted function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionExtent {
    /// Function name.
    pub name: String,
    /// First byte of the body.
    pub start: usize,
    /// One past the last byte of the body.
    pub end: usize,
}

impl FunctionExtent {
    /// Size of the body in bytes.
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug)]
struct OpenFunction {
    name: String,
    start: usize,
}

/// Three-region bump allocator owning one slot.
///
/// Function bodies are emitted strictly one at a time: `begin_function`
/// hands out everything between the code and stub cursors, and
/// `end_function` commits the size the code generator actually used. Every
/// operation validates fully before touching a cursor, so a failed call leaves
/// the allocator unchanged.
pub struct RegionAllocator {
    slot: SlotHandle,
    code_size: usize,
    got_size: usize,
    code_cursor: usize,
    stub_cursor: usize,
    global_cursor: usize,
    got: Option<usize>,
    writable: bool,
    open: Option<OpenFunction>,
    functions: Vec<FunctionExtent>,
}

impl RegionAllocator {
    /// Takes ownership of `slot` and makes its code area writable.
    pub fn new(slot: SlotHandle) -> Result<Self, AllocError> {
        let code_size = slot.layout().code_size();
        let got_size = slot.layout().got_size();
        let mut alloc = Self {
            slot,
            code_size,
            got_size,
            code_cursor: 0,
            stub_cursor: code_size,
            global_cursor: code_size,
            got: None,
            writable: false,
            open: None,
            functions: Vec::new(),
        };
        alloc.set_writable()?;
        Ok(alloc)
    }

    /// The slot backing this allocator.
    pub fn slot(&self) -> &SlotHandle {
        &self.slot
    }

    /// Releases the allocator, keeping the memory mapped.
    pub fn into_slot(self) -> SlotHandle {
        self.slot
    }

    fn base(&self) -> usize {
        self.slot.address()
    }

    /// Opens a function body at the code cursor.
    ///
    /// The returned block spans all free code-area space; the generator may
    /// write anywhere in it and reports the size it used to `end_function`.
    pub fn begin_function(&mut self, name: &str) -> Result<Allocation, AllocError> {
        self.ensure_writable()?;
        self.ensure_no_open_function()?;
        if self.lookup(name).is_some() {
            return Err(AllocError::DuplicateFunction(name.to_string()));
        }
        let block = Allocation {
            addr: self.base() + self.code_cursor,
            offset: self.code_cursor,
            size: self.stub_cursor - self.code_cursor,
        };
        self.open = Some(OpenFunction {
            name: name.to_string(),
            start: self.code_cursor,
        });
        Ok(block)
    }

    /// Closes the open function body, committing `actual_size` bytes.
    ///
    /// A size that runs into the stub region is an out-of-memory error; the
    /// function stays open and nothing is truncated.
    pub fn end_function(
        &mut self,
        name: &str,
        actual_size: usize,
    ) -> Result<FunctionExtent, AllocError> {
        let start = match &self.open {
            Some(open) if open.name == name => open.start,
            _ => return Err(AllocError::NoOpenFunction(name.to_string())),
        };
        let available = self.stub_cursor - start;
        if actual_size > available {
            return Err(AllocError::OutOfMemory {
                region: Region::Code,
                requested: actual_size,
                available,
            });
        }
        let extent = FunctionExtent {
            name: name.to_string(),
            start: self.base() + start,
            end: self.base() + start + actual_size,
        };
        self.open = None;
        self.code_cursor = start + actual_size;
        self.functions.push(extent.clone());
        Ok(extent)
    }

    /// Allocates a block in the code region between function bodies.
    pub fn allocate_space(&mut self, size: usize, align: usize) -> Result<Allocation, AllocError> {
        self.ensure_writable()?;
        self.ensure_no_open_function()?;
        let align = normalize_align(align)?;
        let span = align_up(self.base() + self.code_cursor, align)
            .map(|addr| addr - self.base())
            .and_then(|start| start.checked_add(size).map(|end| (start, end)));
        match span {
            Some((start, end)) if end <= self.stub_cursor => {
                self.code_cursor = end;
                Ok(self.block(start, size))
            }
            _ => Err(AllocError::OutOfMemory {
                region: Region::Code,
                requested: size,
                available: self.code_free(),
            }),
        }
    }

    /// Allocates a block in the stub region, which grows downward.
    pub fn allocate_stub(&mut self, size: usize, align: usize) -> Result<Allocation, AllocError> {
        self.ensure_writable()?;
        let align = normalize_align(align)?;
        // While a function is open the code cursor still marks its start.
        let floor = self.code_cursor;
        let available = self.stub_cursor - floor;
        let start = (self.base() + self.stub_cursor)
            .checked_sub(size)
            .map(|addr| align_down(addr, align))
            .and_then(|addr| addr.checked_sub(self.base()))
            .filter(|&start| start >= floor);
        let Some(start) = start else {
            return Err(AllocError::OutOfMemory {
                region: Region::Stub,
                requested: size,
                available,
            });
        };
        self.stub_cursor = start;
        Ok(self.block(start, size))
    }

    /// Allocates a block in the global data region.
    ///
    /// The data sub-area is never made executable, so this works regardless
    /// of the code area's protection.
    pub fn allocate_global(&mut self, size: usize, align: usize) -> Result<Allocation, AllocError> {
        let align = normalize_align(align)?;
        let limit = self.slot.len();
        let available = limit - self.global_cursor;
        let span = align_up(self.base() + self.global_cursor, align)
            .map(|addr| addr - self.base())
            .and_then(|start| start.checked_add(size).map(|end| (start, end)));
        match span {
            Some((start, end)) if end <= limit => {
                self.global_cursor = end;
                Ok(self.block(start, size))
            }
            _ => Err(AllocError::OutOfMemory {
                region: Region::Global,
                requested: size,
                available,
            }),
        }
    }

    /// Reserves the global offset table from the stub region.
    pub fn allocate_got(&mut self) -> Result<Allocation, AllocError> {
        if self.got.is_some() {
            return Err(AllocError::GotAlreadyAllocated);
        }
        let block = self.allocate_stub(self.got_size, std::mem::align_of::<usize>())?;
        self.got = Some(block.addr);
        Ok(block)
    }

    /// Address of the global offset table, once allocated.
    pub fn got_base(&self) -> Option<usize> {
        self.got
    }

    /// Makes the code area writable (and not executable).
    pub fn set_writable(&mut self) -> Result<(), AllocError> {
        // SAFETY: the allocator owns the slot, and `&mut self` rules out any
        // outstanding `bytes_mut` borrow.
        unsafe { os::protect(self.base(), self.code_size, Protection::ReadWrite)? };
        self.writable = true;
        Ok(())
    }

    /// Makes the code area executable (and not writable).
    pub fn set_executable(&mut self) -> Result<(), AllocError> {
        // SAFETY: as in `set_writable`.
        unsafe { os::protect(self.base(), self.code_size, Protection::ReadExec)? };
        self.writable = false;
        Ok(())
    }

    /// Whether the code area is currently writable.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Forgets every allocation. Memory contents and protection are untouched.
    pub fn reset(&mut self) {
        self.code_cursor = 0;
        self.stub_cursor = self.code_size;
        self.global_cursor = self.code_size;
        self.got = None;
        self.open = None;
        self.functions.clear();
    }

    /// Removes a function body, sliding every later code-region byte down
    /// over it.
    ///
    /// Addresses of later functions change; callers must not hold on to them.
    pub fn deallocate_function(&mut self, name: &str) -> Result<(), AllocError> {
        self.ensure_writable()?;
        self.ensure_no_open_function()?;
        let index = self
            .functions
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| AllocError::UnknownFunction(name.to_string()))?;

        let removed = self.functions.remove(index);
        let len = removed.size();
        let tail_end = self.base() + self.code_cursor;
        // SAFETY: both ranges lie in the code area, which is writable.
        unsafe {
            os::move_bytes(removed.end, removed.start, tail_end - removed.end);
            os::zero_bytes(tail_end - len, len);
        }
        for extent in &mut self.functions {
            if extent.start >= removed.end {
                extent.start -= len;
                extent.end -= len;
            }
        }
        self.code_cursor -= len;
        Ok(())
    }

    /// Finds an emitted function by name.
    pub fn lookup(&self, name: &str) -> Option<&FunctionExtent> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// All emitted functions, in emission order.
    pub fn functions(&self) -> &[FunctionExtent] {
        &self.functions
    }

    /// Bytes committed in the code region.
    pub fn code_used(&self) -> usize {
        self.code_cursor
    }

    /// Bytes committed in the stub region.
    pub fn stub_used(&self) -> usize {
        self.code_size - self.stub_cursor
    }

    /// Bytes committed in the global data region.
    pub fn global_used(&self) -> usize {
        self.global_cursor - self.code_size
    }

    /// Free space between the code and stub cursors.
    pub fn code_free(&self) -> usize {
        self.stub_cursor - self.code_cursor
    }

    /// Mutable view of `size` bytes at `addr` inside the slot.
    pub fn bytes_mut(&mut self, addr: usize, size: usize) -> Result<&mut [u8], AllocError> {
        if !self.slot.contains(addr, size) {
            return Err(AllocError::OutOfBounds { addr, size });
        }
        if addr < self.base() + self.code_size && !self.writable {
            return Err(AllocError::NotWritable);
        }
        // SAFETY: the range is inside the slot and writable, and the borrow
        // of `self` keeps protection from changing while it lives.
        Ok(unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, size) })
    }

    /// Copies `bytes` to `addr`.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<(), AllocError> {
        self.bytes_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), AllocError> {
        if self.writable {
            Ok(())
        } else {
            Err(AllocError::NotWritable)
        }
    }

    fn ensure_no_open_function(&self) -> Result<(), AllocError> {
        match &self.open {
            Some(open) => Err(AllocError::FunctionInProgress(open.name.clone())),
            None => Ok(()),
        }
    }

    fn block(&self, offset: usize, size: usize) -> Allocation {
        Allocation {
            addr: self.base() + offset,
            offset,
            size,
        }
    }
}

impl fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("slot", &self.slot)
            .field("code_cursor", &self.code_cursor)
            .field("stub_cursor", &self.stub_cursor)
            .field("global_cursor", &self.global_cursor)
            .field("writable", &self.writable)
            .field("functions", &self.functions.len())
            .finish()
    }
}

fn normalize_align(align: usize) -> Result<usize, AllocError> {
    match align {
        0 => Ok(1),
        a if a.is_power_of_two() => Ok(a),
        a => Err(AllocError::InvalidAlignment(a)),
    }
}

fn align_up(addr: usize, align: usize) -> Option<usize> {
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}
