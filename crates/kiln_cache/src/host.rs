//! Properties of the host that a cached artifact must match exactly.

use serde::Serialize;

/// Endianness marker for little-endian hosts.
pub const LITTLE_ENDIAN: u8 = b'e';
/// Endianness marker for big-endian hosts.
pub const BIG_ENDIAN: u8 = b'E';

/// Endianness and word sizes recorded in every metadata header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HostLayout {
    /// `e` or `E`.
    pub endianness: u8,
    /// Size of the file offset type.
    pub off_t_size: u8,
    /// Size of `usize`.
    pub usize_size: u8,
    /// Size of a data pointer.
    pub pointer_size: u8,
}

impl HostLayout {
    /// The layout of the running host.
    pub fn current() -> Self {
        Self {
            endianness: if cfg!(target_endian = "little") {
                LITTLE_ENDIAN
            } else {
                BIG_ENDIAN
            },
            off_t_size: std::mem::size_of::<libc::off_t>() as u8,
            usize_size: std::mem::size_of::<usize>() as u8,
            pointer_size: std::mem::size_of::<*const u8>() as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_matches_target() {
        let host = HostLayout::current();
        assert!(host.endianness == LITTLE_ENDIAN || host.endianness == BIG_ENDIAN);
        assert_eq!(host.usize_size as usize, std::mem::size_of::<usize>());
        assert_eq!(host.pointer_size, host.usize_size);
        assert!(host.off_t_size == 4 || host.off_t_size == 8);
    }
}
