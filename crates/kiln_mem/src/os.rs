//! Thin wrappers over the `mmap` family.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

/// Returns the host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Page protection modes used by the allocators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protection {
    ReadWriteExec,
    ReadWrite,
    ReadExec,
}

impl Protection {
    fn bits(self) -> libc::c_int {
        match self {
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// Maps `len` bytes of fresh zeroed memory.
///
/// `hint` is advisory: the kernel may place the mapping elsewhere when the
/// range is taken, and the caller must compare the returned address. An
/// existing mapping is never replaced.
pub(crate) fn map_anonymous(hint: usize, len: usize, prot: Protection) -> io::Result<usize> {
    // SAFETY: without MAP_FIXED the kernel never clobbers existing mappings.
    let addr = unsafe {
        libc::mmap(
            /* addr   */ hint as *mut libc::c_void,
            /* length */ len,
            /* prot   */ prot.bits(),
            /* flags  */ libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            /* fd     */ -1,
            /* offset */ 0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as usize)
}

/// Maps `len` bytes of `file` starting at `offset` as a private copy.
pub(crate) fn map_file(
    hint: usize,
    len: usize,
    prot: Protection,
    file: &File,
    offset: u64,
) -> io::Result<usize> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file offset out of range"))?;
    // SAFETY: as above; the descriptor is valid for the duration of the call.
    let addr = unsafe {
        libc::mmap(
            /* addr   */ hint as *mut libc::c_void,
            /* length */ len,
            /* prot   */ prot.bits(),
            /* flags  */ libc::MAP_PRIVATE,
            /* fd     */ file.as_raw_fd(),
            /* offset */ offset,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as usize)
}

/// Unmaps a range previously returned by one of the `map_*` functions.
///
/// # Safety
///
/// No live reference into the range may outlive this call.
pub(crate) unsafe fn unmap(addr: usize, len: usize) -> io::Result<()> {
    if libc::munmap(addr as *mut libc::c_void, len) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Changes the protection of a page-aligned range.
///
/// # Safety
///
/// The range must be owned by the caller, and no outstanding reference may
/// rely on an access mode being removed.
pub(crate) unsafe fn protect(addr: usize, len: usize, prot: Protection) -> io::Result<()> {
    if libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copies `count` bytes within one mapping; the ranges may overlap.
///
/// # Safety
///
/// Both ranges must lie inside a writable mapping owned by the caller.
pub(crate) unsafe fn move_bytes(src: usize, dst: usize, count: usize) {
    ptr::copy(src as *const u8, dst as *mut u8, count);
}

/// Zeroes `count` bytes.
///
/// # Safety
///
/// The range must lie inside a writable mapping owned by the caller.
pub(crate) unsafe fn zero_bytes(addr: usize, count: usize) {
    ptr::write_bytes(addr as *mut u8, 0, count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn anonymous_mapping_is_zeroed_and_unmappable() {
        let len = page_size() * 2;
        let addr = map_anonymous(0, len, Protection::ReadWrite).unwrap();
        assert_ne!(addr, 0);
        // SAFETY: freshly mapped, readable, and unmapped only below.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { unmap(addr, len).unwrap() };
    }

    #[test]
    fn protect_round_trip() {
        let len = page_size();
        let addr = map_anonymous(0, len, Protection::ReadWrite).unwrap();
        unsafe {
            protect(addr, len, Protection::ReadExec).unwrap();
            protect(addr, len, Protection::ReadWrite).unwrap();
            *(addr as *mut u8) = 7;
            assert_eq!(*(addr as *const u8), 7);
            unmap(addr, len).unwrap();
        }
    }
}
