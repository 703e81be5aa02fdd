//! Bit-exact layout of the `.info` metadata file.
//!
//! All multi-byte integers are stored in host byte order; the endianness
//! byte in the header guards against reading them on a mismatched host.
//!
//! | offset | size | field                                   |
//! |-------:|-----:|-----------------------------------------|
//! |      0 |    8 | magic `"\0kilnfo\n"`                     |
//! |      8 |    4 | version `"001\0"`                        |
//! |     12 |    4 | endianness, `off_t`, `usize`, pointer    |
//! |     16 |    8 | artifact address                        |
//! |     24 |    8 | artifact size                           |
//! |     32 |    4 | artifact parity checksum                |
//! |     36 |    4 | flags                                   |
//! |     40 |    4 | string blob size                        |
//! |     44 |   96 | 8 section descriptors                   |

use crate::host::HostLayout;
use serde::Serialize;
use std::fmt;

/// File magic.
pub const MAGIC: [u8; 8] = *b"\0kilnfo\n";
/// Format version. Any other version is rejected outright.
pub const VERSION: [u8; 4] = *b"001\0";
/// Sections start on multiples of this.
pub const WORD: usize = 4;
/// Encoded size of [`CacheHeader`].
pub const HEADER_SIZE: usize = 44 + Section::ALL.len() * SectionDescriptor::SIZE;

/// Header flag: the kernel may run on several threads.
pub const FLAG_THREADABLE: u32 = 1 << 0;
/// Header flag: the kernel was compiled with debug information.
pub const FLAG_DEBUG_INFO: u32 = 1 << 1;

/// The lists stored in a metadata file, in section-table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// `(offset, length)` index entries, followed by the string blob.
    StringPool,
    /// Dependency records.
    Dependency,
    /// `(key, value)` pragma pairs.
    Pragma,
    /// Object slot numbers.
    ObjectSlot,
    /// Exported variables: name and address.
    ExportVar,
    /// Exported function names.
    ExportFunc,
    /// Exported kernel entry points with their signatures.
    ExportForeach,
    /// Emitted function bodies.
    Function,
}

impl Section {
    /// Every section, in table order.
    pub const ALL: [Section; 8] = [
        Section::StringPool,
        Section::Dependency,
        Section::Pragma,
        Section::ObjectSlot,
        Section::ExportVar,
        Section::ExportFunc,
        Section::ExportForeach,
        Section::Function,
    ];

    /// Encoded size of one record of this section.
    pub const fn item_size(self) -> u32 {
        match self {
            Section::StringPool => 8,
            Section::Dependency => 28,
            Section::Pragma => 8,
            Section::ObjectSlot => 4,
            Section::ExportVar => 16,
            Section::ExportFunc => 4,
            Section::ExportForeach => 8,
            Section::Function => 16,
        }
    }

    /// Position in the section table.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Section::StringPool => "string pool",
            Section::Dependency => "dependency table",
            Section::Pragma => "pragma list",
            Section::ObjectSlot => "object slot list",
            Section::ExportVar => "exported variables",
            Section::ExportFunc => "exported functions",
            Section::ExportForeach => "exported kernels",
            Section::Function => "function table",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Location of one section in the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SectionDescriptor {
    /// Byte offset from the start of the file.
    pub offset: u32,
    /// Number of records.
    pub count: u32,
    /// Size of each record.
    pub item_size: u32,
}

impl SectionDescriptor {
    /// Encoded size of a descriptor.
    pub const SIZE: usize = 12;

    /// One past the last byte of the records, computed without overflow.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.count as u64 * self.item_size as u64
    }
}

/// The fixed-size header at the start of every metadata file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheHeader {
    /// Must equal [`MAGIC`].
    pub magic: [u8; 8],
    /// Must equal [`VERSION`].
    pub version: [u8; 4],
    /// Host the artifact was produced on.
    pub host: HostLayout,
    /// Slot address the artifact was generated for.
    pub artifact_address: u64,
    /// Size of the artifact image.
    pub artifact_size: u64,
    /// Parity of the artifact image.
    pub checksum: u32,
    /// [`FLAG_THREADABLE`] and [`FLAG_DEBUG_INFO`].
    pub flags: u32,
    /// Size of the string blob following the string index entries.
    pub string_data_size: u32,
    /// One descriptor per [`Section`], in table order.
    pub sections: [SectionDescriptor; 8],
}

impl CacheHeader {
    /// The descriptor of `section`.
    pub fn section(&self, section: Section) -> &SectionDescriptor {
        &self.sections[section.index()]
    }

    /// Appends the encoded header to `out`.
    pub fn encode(&self, out: &mut ByteWriter) {
        out.bytes(&self.magic);
        out.bytes(&self.version);
        out.u8(self.host.endianness);
        out.u8(self.host.off_t_size);
        out.u8(self.host.usize_size);
        out.u8(self.host.pointer_size);
        out.u64(self.artifact_address);
        out.u64(self.artifact_size);
        out.u32(self.checksum);
        out.u32(self.flags);
        out.u32(self.string_data_size);
        for desc in &self.sections {
            out.u32(desc.offset);
            out.u32(desc.count);
            out.u32(desc.item_size);
        }
    }

    /// Decodes a header. Returns `None` if `input` is too short; field values
    /// are not validated here.
    pub fn decode(input: &mut ByteReader<'_>) -> Option<Self> {
        let magic = input.array()?;
        let version = input.array()?;
        let host = HostLayout {
            endianness: input.u8()?,
            off_t_size: input.u8()?,
            usize_size: input.u8()?,
            pointer_size: input.u8()?,
        };
        let artifact_address = input.u64()?;
        let artifact_size = input.u64()?;
        let checksum = input.u32()?;
        let flags = input.u32()?;
        let string_data_size = input.u32()?;
        let mut sections = [SectionDescriptor::default(); 8];
        for desc in &mut sections {
            *desc = SectionDescriptor {
                offset: input.u32()?,
                count: input.u32()?,
                item_size: input.u32()?,
            };
        }
        Some(Self {
            magic,
            version,
            host,
            artifact_address,
            artifact_size,
            checksum,
            flags,
            string_data_size,
            sections,
        })
    }
}

/// Bounds-checked cursor over a byte buffer.
///
/// Every read returns `None` instead of panicking when the buffer is too
/// short.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Starts reading at `offset`, if it is within the buffer.
    pub fn at(buf: &'a [u8], offset: usize) -> Option<Self> {
        (offset <= buf.len()).then_some(Self { buf, pos: offset })
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    /// Reads a fixed-size byte array.
    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Option<u8> {
        Some(self.array::<1>()?[0])
    }

    /// Reads a host-endian `u32`.
    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_ne_bytes)
    }

    /// Reads a host-endian `u64`.
    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_ne_bytes)
    }
}

/// Growable output buffer with host-endian integer writers.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends one byte.
    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a host-endian `u32`.
    pub fn u32(&mut self, value: u32) {
        self.bytes(&value.to_ne_bytes());
    }

    /// Appends a host-endian `u64`.
    pub fn u64(&mut self, value: u64) {
        self.bytes(&value.to_ne_bytes());
    }

    /// Zero-pads to a multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let padded = self.buf.len().next_multiple_of(align);
        self.buf.resize(padded, 0);
    }

    /// Overwrites previously written bytes at `offset`.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Consumes the writer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> CacheHeader {
        let mut sections = [SectionDescriptor::default(); 8];
        for (i, section) in Section::ALL.iter().enumerate() {
            sections[i] = SectionDescriptor {
                offset: (HEADER_SIZE + i * 8) as u32,
                count: i as u32,
                item_size: section.item_size(),
            };
        }
        CacheHeader {
            magic: MAGIC,
            version: VERSION,
            host: HostLayout::current(),
            artifact_address: 0x6000_0000_0000,
            artifact_size: 256 * 1024,
            checksum: 0xDEAD_BEEF,
            flags: FLAG_THREADABLE,
            string_data_size: 12,
            sections,
        }
    }

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(HEADER_SIZE, 140);
        assert_eq!(HEADER_SIZE % WORD, 0);
        let mut out = ByteWriter::new();
        sample_header().encode(&mut out);
        assert_eq!(out.len(), HEADER_SIZE);
    }

    #[test]
    fn header_field_offsets() {
        let mut out = ByteWriter::new();
        sample_header().encode(&mut out);
        let bytes = out.into_inner();
        assert_eq!(&bytes[0..8], b"\0kilnfo\n");
        assert_eq!(&bytes[8..12], b"001\0");
        assert_eq!(bytes[12], HostLayout::current().endianness);
        assert_eq!(&bytes[16..24], &0x6000_0000_0000u64.to_ne_bytes());
        assert_eq!(&bytes[32..36], &0xDEAD_BEEFu32.to_ne_bytes());
        // Function table descriptor is the last 12 bytes.
        assert_eq!(&bytes[136..140], &16u32.to_ne_bytes());
    }

    #[test]
    fn header_decodes_what_was_encoded() {
        let header = sample_header();
        let mut out = ByteWriter::new();
        header.encode(&mut out);
        let bytes = out.into_inner();
        let decoded = CacheHeader::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn short_header_is_none() {
        let mut out = ByteWriter::new();
        sample_header().encode(&mut out);
        let bytes = out.into_inner();
        assert!(CacheHeader::decode(&mut ByteReader::new(&bytes[..HEADER_SIZE - 1])).is_none());
    }

    #[test]
    fn reader_is_bounds_checked() {
        let mut r = ByteReader::new(&[1, 2, 3]);
        assert_eq!(r.u8(), Some(1));
        assert_eq!(r.u32(), None);
        assert_eq!(r.position(), 1);
        assert!(ByteReader::at(&[1, 2, 3], 4).is_none());
        assert!(r.bytes(usize::MAX).is_none());
    }

    #[test]
    fn writer_pads_to_word() {
        let mut w = ByteWriter::new();
        w.bytes(b"abcde");
        w.pad_to(WORD);
        assert_eq!(w.into_inner(), b"abcde\0\0\0");
    }

    #[test]
    fn descriptor_end_does_not_overflow() {
        let desc = SectionDescriptor {
            offset: u32::MAX,
            count: u32::MAX,
            item_size: u32::MAX,
        };
        assert!(desc.end() > u32::MAX as u64);
    }
}
