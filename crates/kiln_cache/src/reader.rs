//! Loading and validating cached kernels.

use crate::cache::CachePaths;
use crate::checksum;
use crate::format::{
    ByteReader, CacheHeader, Section, FLAG_DEBUG_INFO, FLAG_THREADABLE, HEADER_SIZE, MAGIC,
    VERSION, WORD,
};
use crate::hasher::{DependencyRecord, ResourceKind};
use crate::host::HostLayout;
use crate::metadata::{ArtifactMetadata, ExportVar, ForEachExport, FunctionRecord, Pragma};
use crate::strpool::StringPool;
use kiln_common::{Digest, FloatPrecision, DIGEST_LEN};
use kiln_diagnostics::{Category, Diagnostic, DiagnosticCode, DiagnosticSink, Severity};
use kiln_mem::{SlotAllocator, SlotError, SlotHandle};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::ErrorKind;

/// No cache files for this kernel yet.
pub const CACHE_ABSENT: DiagnosticCode = DiagnosticCode::new(Category::Cache, 101);
/// The metadata file is corrupt or was written by an incompatible host.
pub const CACHE_HEADER_REJECTED: DiagnosticCode = DiagnosticCode::new(Category::Cache, 102);
/// The image could not be mapped back at its recorded address.
pub const CACHE_MAP_FAILED: DiagnosticCode = DiagnosticCode::new(Category::Cache, 103);
/// The mapped image does not match its stored checksum.
pub const CACHE_CHECKSUM_MISMATCH: DiagnosticCode = DiagnosticCode::new(Category::Cache, 104);
/// A recorded dependency no longer matches the current input.
pub const DEPENDENCY_CHANGED: DiagnosticCode = DiagnosticCode::new(Category::Dependency, 201);
/// The cached kernel was compiled for a different float precision.
pub const PRECISION_CHANGED: DiagnosticCode = DiagnosticCode::new(Category::Dependency, 202);
/// The slot the cached kernel needs is held by another kernel.
pub const SLOT_IN_USE: DiagnosticCode = DiagnosticCode::new(Category::Memory, 301);

/// States of the load state machine, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LoadStage {
    /// Nothing validated yet.
    Start,
    /// The metadata file is structurally sound and matches the host.
    HeaderValidated,
    /// Every dependency digest matches.
    DependenciesValidated,
    /// The image is mapped at its recorded address.
    Mapped,
    /// The mapped image matches its checksum.
    ChecksumValidated,
    /// The kernel is ready to run.
    Ready,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a load did not produce a kernel.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MissReason {
    /// A cache file does not exist.
    #[error("{file} file does not exist")]
    Absent {
        /// `metadata` or `object`.
        file: &'static str,
    },
    /// A cache file exists but could not be read.
    #[error("{file} file is unreadable: {message}")]
    Unreadable {
        /// `metadata` or `object`.
        file: &'static str,
        /// The I/O error.
        message: String,
    },
    /// The metadata file is shorter than the header.
    #[error("metadata file is smaller than its header")]
    FileTooSmall,
    /// The file does not start with the expected magic.
    #[error("bad magic")]
    BadMagic,
    /// The format version differs.
    #[error("format version {found:?} is not supported")]
    VersionMismatch {
        /// The version found in the file.
        found: String,
    },
    /// The file was written on a host of the other endianness.
    #[error("endianness mismatch")]
    EndiannessMismatch,
    /// A word size differs from the host's.
    #[error("{what} size {found} does not match host size {expected}")]
    WordSizeMismatch {
        /// Which size.
        what: &'static str,
        /// The host's size.
        expected: u8,
        /// The size found in the file.
        found: u8,
    },
    /// A section descriptor carries the wrong record size.
    #[error("{section} has record size {found}, expected {}", .section.item_size())]
    ItemSizeMismatch {
        /// The section.
        section: Section,
        /// The record size found in the file.
        found: u32,
    },
    /// A section does not start on a word boundary.
    #[error("{section} is not word-aligned")]
    SectionMisaligned {
        /// The section.
        section: Section,
    },
    /// A section extends past the end of the file.
    #[error("{section} lies outside the file")]
    SectionOutOfBounds {
        /// The section.
        section: Section,
    },
    /// The string pool is inconsistent.
    #[error("string pool: {0}")]
    StringPool(String),
    /// A record references a missing string or holds an invalid value.
    #[error("record {index} of the {section} is invalid")]
    InvalidRecord {
        /// The section.
        section: Section,
        /// Position of the record.
        index: usize,
    },
    /// The number of dependencies differs.
    #[error("expected {expected} dependencies, found {found}")]
    DependencyCount {
        /// Dependencies of the current build.
        expected: usize,
        /// Dependencies recorded in the file.
        found: usize,
    },
    /// A dependency entry differs.
    #[error("dependency {index} ('{name}') has a different {field}")]
    DependencyMismatch {
        /// Position in the dependency table.
        index: usize,
        /// The current dependency's name.
        name: String,
        /// `name`, `kind`, or `digest`.
        field: &'static str,
    },
    /// The kernel was compiled for a different float precision.
    #[error("kernel was compiled for {found} precision, {required} is required")]
    PrecisionMismatch {
        /// The configured precision.
        required: FloatPrecision,
        /// The precision the cached kernel asks for.
        found: FloatPrecision,
    },
    /// The recorded address is not a slot of this process's table.
    #[error("artifact address {0:#x} is not a slot address")]
    NotSlotAddress(u64),
    /// The recorded size differs from the slot size.
    #[error("artifact size {found} differs from slot size {expected}")]
    SizeMismatch {
        /// The slot size.
        expected: u64,
        /// The recorded size.
        found: u64,
    },
    /// The object file is shorter than the recorded image.
    #[error("object file holds {found} bytes, {expected} expected")]
    ObjectTruncated {
        /// The recorded image size.
        expected: u64,
        /// The object file's size.
        found: u64,
    },
    /// The slot is occupied in this process.
    #[error("slot {0} is in use")]
    SlotInUse(usize),
    /// Mapping the object file failed.
    #[error("mapping failed: {0}")]
    MapFailed(String),
    /// The image does not match its checksum.
    #[error("image checksum mismatch")]
    ChecksumMismatch,
}

/// A failed load: the stage that could not be reached and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Miss {
    /// The stage whose validation failed.
    pub stage: LoadStage,
    /// What went wrong.
    pub reason: MissReason,
}

impl Miss {
    fn new(stage: LoadStage, reason: MissReason) -> Self {
        Self { stage, reason }
    }

    /// Whether the miss was caused by the target slot being busy. In that case
    /// the files on disk are most likely valid and should not be replaced.
    pub fn is_slot_in_use(&self) -> bool {
        matches!(self.reason, MissReason::SlotInUse(_))
    }

    /// Describes the miss as a diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let (severity, code) = match &self.reason {
            MissReason::Absent { .. } => (Severity::Info, CACHE_ABSENT),
            MissReason::DependencyCount { .. } | MissReason::DependencyMismatch { .. } => {
                (Severity::Info, DEPENDENCY_CHANGED)
            }
            MissReason::PrecisionMismatch { .. } => (Severity::Info, PRECISION_CHANGED),
            MissReason::SlotInUse(_) => (Severity::Info, SLOT_IN_USE),
            MissReason::ChecksumMismatch => (Severity::Warning, CACHE_CHECKSUM_MISMATCH),
            MissReason::NotSlotAddress(_)
            | MissReason::SizeMismatch { .. }
            | MissReason::ObjectTruncated { .. }
            | MissReason::MapFailed(_) => (Severity::Warning, CACHE_MAP_FAILED),
            _ => (Severity::Warning, CACHE_HEADER_REJECTED),
        };
        Diagnostic::new(severity, code, format!("cache miss: {}", self.reason))
            .with_note(format!("rejected at {}", self.stage))
    }
}

impl fmt::Display for Miss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "miss at {}: {}", self.stage, self.reason)
    }
}

/// A decoded metadata file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InfoFile {
    /// The header.
    pub header: CacheHeader,
    /// Everything after the header.
    pub metadata: ArtifactMetadata,
}

impl InfoFile {
    /// Validates and decodes a metadata file against the running host.
    pub fn parse(bytes: &[u8]) -> Result<Self, MissReason> {
        if bytes.len() < HEADER_SIZE {
            return Err(MissReason::FileTooSmall);
        }
        let header =
            CacheHeader::decode(&mut ByteReader::new(bytes)).ok_or(MissReason::FileTooSmall)?;
        check_header(&header, bytes.len() as u64)?;

        let pool = read_string_pool(&header, bytes)?;
        let metadata = read_lists(&header, bytes, &pool)?;
        Ok(Self { header, metadata })
    }
}

fn check_header(header: &CacheHeader, file_len: u64) -> Result<(), MissReason> {
    if header.magic != MAGIC {
        return Err(MissReason::BadMagic);
    }
    if header.version != VERSION {
        return Err(MissReason::VersionMismatch {
            found: String::from_utf8_lossy(&header.version).into_owned(),
        });
    }
    let host = HostLayout::current();
    if header.host.endianness != host.endianness {
        return Err(MissReason::EndiannessMismatch);
    }
    for (what, expected, found) in [
        ("off_t", host.off_t_size, header.host.off_t_size),
        ("usize", host.usize_size, header.host.usize_size),
        ("pointer", host.pointer_size, header.host.pointer_size),
    ] {
        if expected != found {
            return Err(MissReason::WordSizeMismatch {
                what,
                expected,
                found,
            });
        }
    }

    for section in Section::ALL {
        let desc = header.section(section);
        if desc.item_size != section.item_size() {
            return Err(MissReason::ItemSizeMismatch {
                section,
                found: desc.item_size,
            });
        }
        if desc.offset as usize % WORD != 0 {
            return Err(MissReason::SectionMisaligned { section });
        }
        let mut end = desc.end();
        if section == Section::StringPool {
            end += header.string_data_size as u64;
        }
        if (desc.offset as usize) < HEADER_SIZE || end > file_len {
            return Err(MissReason::SectionOutOfBounds { section });
        }
    }
    Ok(())
}

fn section_reader<'a>(header: &CacheHeader, bytes: &'a [u8], section: Section) -> ByteReader<'a> {
    // Offsets were bounds-checked in `check_header`.
    ByteReader::at(bytes, header.section(section).offset as usize)
        .unwrap_or_else(|| ByteReader::new(&[]))
}

fn read_string_pool(header: &CacheHeader, bytes: &[u8]) -> Result<StringPool, MissReason> {
    let count = header.section(Section::StringPool).count as usize;
    let mut input = section_reader(header, bytes, Section::StringPool);
    let truncated = || MissReason::SectionOutOfBounds {
        section: Section::StringPool,
    };
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = input.u32().ok_or_else(truncated)?;
        let len = input.u32().ok_or_else(truncated)?;
        entries.push((offset, len));
    }
    let blob = input
        .bytes(header.string_data_size as usize)
        .ok_or_else(truncated)?;
    StringPool::decode(&entries, blob).map_err(MissReason::StringPool)
}

fn read_lists(
    header: &CacheHeader,
    bytes: &[u8],
    pool: &StringPool,
) -> Result<ArtifactMetadata, MissReason> {
    let mut meta = ArtifactMetadata {
        threadable: header.flags & FLAG_THREADABLE != 0,
        debug_info: header.flags & FLAG_DEBUG_INFO != 0,
        ..ArtifactMetadata::default()
    };

    meta.dependencies = read_records(header, bytes, Section::Dependency, |r| {
        let name = pool.get(r.u32()?)?;
        let kind = ResourceKind::from_u32(r.u32()?)?;
        let digest = Digest::from_raw(r.array::<DIGEST_LEN>()?);
        Some(DependencyRecord::new(name, kind, digest))
    })?;
    meta.pragmas = read_records(header, bytes, Section::Pragma, |r| {
        Some(Pragma::new(pool.get(r.u32()?)?, pool.get(r.u32()?)?))
    })?;
    meta.object_slots = read_records(header, bytes, Section::ObjectSlot, |r| r.u32())?;
    let image_start = header.artifact_address;
    let image_end = image_start.saturating_add(header.artifact_size);
    let in_image = |address: u64, size: u64| {
        address >= image_start && address.checked_add(size).is_some_and(|end| end <= image_end)
    };

    meta.export_vars = read_records(header, bytes, Section::ExportVar, |r| {
        let address = r.u64()?;
        let name = pool.get(r.u32()?)?;
        let _reserved = r.u32()?;
        in_image(address, 1).then(|| ExportVar::new(name, address))
    })?;
    meta.export_funcs = read_records(header, bytes, Section::ExportFunc, |r| {
        pool.get(r.u32()?).map(str::to_string)
    })?;
    meta.export_foreach = read_records(header, bytes, Section::ExportForeach, |r| {
        Some(ForEachExport {
            name: pool.get(r.u32()?)?.to_string(),
            signature: r.u32()?,
        })
    })?;

    meta.functions = read_records(header, bytes, Section::Function, |r| {
        let address = r.u64()?;
        let size = u64::from(r.u32()?);
        let name = pool.get(r.u32()?)?.to_string();
        in_image(address, size).then_some(FunctionRecord {
            name,
            address,
            size,
        })
    })?;
    Ok(meta)
}

fn read_records<T>(
    header: &CacheHeader,
    bytes: &[u8],
    section: Section,
    mut read: impl FnMut(&mut ByteReader<'_>) -> Option<T>,
) -> Result<Vec<T>, MissReason> {
    let count = header.section(section).count as usize;
    let mut input = section_reader(header, bytes, section);
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        let item = read(&mut input).ok_or(MissReason::InvalidRecord { section, index })?;
        out.push(item);
    }
    Ok(out)
}

/// A kernel mapped back from the cache.
#[derive(Debug)]
pub struct LoadedArtifact {
    /// The validated header.
    pub header: CacheHeader,
    /// The decoded metadata.
    pub metadata: ArtifactMetadata,
    /// The slot holding the image.
    pub slot: SlotHandle,
}

/// Result of [`CacheReader::load`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// The kernel is mapped and verified.
    Ready(LoadedArtifact),
    /// The cache could not be used.
    Miss(Miss),
}

impl LoadOutcome {
    /// Whether the load succeeded.
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadOutcome::Ready(_))
    }

    /// The miss, if the load failed.
    pub fn miss(&self) -> Option<&Miss> {
        match self {
            LoadOutcome::Ready(_) => None,
            LoadOutcome::Miss(miss) => Some(miss),
        }
    }
}

/// Validates cached kernels against the current build inputs.
pub struct CacheReader<'a> {
    slots: &'a SlotAllocator,
    dependencies: &'a [DependencyRecord],
    precision: Option<FloatPrecision>,
    sink: Option<&'a DiagnosticSink>,
}

impl<'a> CacheReader<'a> {
    /// Creates a reader that expects exactly `dependencies`, in order.
    pub fn new(slots: &'a SlotAllocator, dependencies: &'a [DependencyRecord]) -> Self {
        Self {
            slots,
            dependencies,
            precision: None,
            sink: None,
        }
    }

    /// Only accept kernels compiled for `precision`.
    pub fn with_precision(mut self, precision: Option<FloatPrecision>) -> Self {
        self.precision = precision;
        self
    }

    /// Reports every miss into `sink`.
    pub fn with_sink(mut self, sink: &'a DiagnosticSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs the full load state machine.
    pub fn load(&self, paths: &CachePaths) -> LoadOutcome {
        match self.try_load(paths) {
            Ok(artifact) => LoadOutcome::Ready(artifact),
            Err(miss) => {
                self.report(&miss);
                LoadOutcome::Miss(miss)
            }
        }
    }

    /// Validates the metadata file and dependencies without mapping the
    /// image.
    pub fn check(&self, paths: &CachePaths) -> Result<InfoFile, Miss> {
        self.validate(paths).inspect_err(|miss| self.report(miss))
    }

    fn try_load(&self, paths: &CachePaths) -> Result<LoadedArtifact, Miss> {
        let info = self.validate(paths)?;
        let slot = self
            .map(&info.header, paths)
            .map_err(|reason| Miss::new(LoadStage::Mapped, reason))?;
        if !checksum::verify(slot.as_slice(), info.header.checksum) {
            return Err(Miss::new(
                LoadStage::ChecksumValidated,
                MissReason::ChecksumMismatch,
            ));
        }
        Ok(LoadedArtifact {
            header: info.header,
            metadata: info.metadata,
            slot,
        })
    }

    fn validate(&self, paths: &CachePaths) -> Result<InfoFile, Miss> {
        let header_miss = |reason| Miss::new(LoadStage::HeaderValidated, reason);
        let bytes = std::fs::read(&paths.info)
            .map_err(|e| header_miss(io_reason("metadata", e)))?;
        let info = InfoFile::parse(&bytes).map_err(header_miss)?;
        self.check_dependencies(&info.metadata)
            .map_err(|reason| Miss::new(LoadStage::DependenciesValidated, reason))?;
        Ok(info)
    }

    fn check_dependencies(&self, metadata: &ArtifactMetadata) -> Result<(), MissReason> {
        let recorded = &metadata.dependencies;
        if recorded.len() != self.dependencies.len() {
            return Err(MissReason::DependencyCount {
                expected: self.dependencies.len(),
                found: recorded.len(),
            });
        }
        for (index, (want, have)) in self.dependencies.iter().zip(recorded).enumerate() {
            let field = if want.name != have.name {
                "name"
            } else if want.kind != have.kind {
                "kind"
            } else if want.digest != have.digest {
                "digest"
            } else {
                continue;
            };
            return Err(MissReason::DependencyMismatch {
                index,
                name: want.name.clone(),
                field,
            });
        }
        if let Some(required) = self.precision {
            let found = metadata.float_precision();
            if found != required {
                return Err(MissReason::PrecisionMismatch { required, found });
            }
        }
        Ok(())
    }

    fn map(&self, header: &CacheHeader, paths: &CachePaths) -> Result<SlotHandle, MissReason> {
        let layout = self.slots.layout();
        let address = usize::try_from(header.artifact_address)
            .ok()
            .filter(|&addr| layout.slot_index(addr).is_some())
            .ok_or(MissReason::NotSlotAddress(header.artifact_address))?;
        let slot_size = layout.slot_size() as u64;
        if header.artifact_size != slot_size {
            return Err(MissReason::SizeMismatch {
                expected: slot_size,
                found: header.artifact_size,
            });
        }

        let file = File::open(&paths.object).map_err(|e| io_reason("object", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| io_reason("object", e))?
            .len();
        // Touching a mapped page past EOF raises SIGBUS, so never map short files.
        if file_len < header.artifact_size {
            return Err(MissReason::ObjectTruncated {
                expected: header.artifact_size,
                found: file_len,
            });
        }

        self.slots
            .allocate_from_file(address, &file, 0)
            .map_err(|e| match e {
                SlotError::Occupied(index) => MissReason::SlotInUse(index),
                other => MissReason::MapFailed(other.to_string()),
            })
    }

    fn report(&self, miss: &Miss) {
        if let Some(sink) = self.sink {
            sink.emit(miss.to_diagnostic());
        }
    }
}

fn io_reason(file: &'static str, err: std::io::Error) -> MissReason {
    if err.kind() == ErrorKind::NotFound {
        MissReason::Absent { file }
    } else {
        MissReason::Unreadable {
            file,
            message: err.to_string(),
        }
    }
}
