//! Writing a kernel's `.info`/`.o` pair.

use crate::cache::CachePaths;
use crate::checksum;
use crate::error::CacheError;
use crate::format::{
    ByteWriter, CacheHeader, Section, SectionDescriptor, FLAG_DEBUG_INFO, FLAG_THREADABLE,
    HEADER_SIZE, MAGIC, VERSION, WORD,
};
use crate::host::HostLayout;
use crate::metadata::ArtifactMetadata;
use crate::strpool::{StrIndex, StringPoolBuilder};
use kiln_mem::SlotHandle;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Persists compiled kernels into a cache directory.
pub struct CacheWriter<'a> {
    paths: &'a CachePaths,
}

impl<'a> CacheWriter<'a> {
    /// Creates a writer for one `.info`/`.o` pair.
    pub fn new(paths: &'a CachePaths) -> Self {
        Self { paths }
    }

    /// Writes the metadata file and the slot image.
    ///
    /// Existing files are unlinked first rather than overwritten, so a process
    /// that still has the old image mapped keeps seeing the old bytes. If any
    /// write fails, both files are truncated and removed; the in-memory kernel
    /// is unaffected.
    pub fn write(&self, slot: &SlotHandle, metadata: &ArtifactMetadata) -> Result<(), CacheError> {
        if !slot.is_fixed() {
            return Err(CacheError::NotCacheable);
        }
        let image = slot.as_slice();
        let info = encode_info(metadata, slot.address() as u64, image)?;

        for path in [&self.paths.info, &self.paths.object] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| CacheError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
            }
            unlink(path);
        }

        let result = create_and_write(&self.paths.info, &info)
            .and_then(|()| create_and_write(&self.paths.object, image));
        if result.is_err() {
            discard(&self.paths.info);
            discard(&self.paths.object);
        }
        result
    }
}

/// Encodes the metadata file for an artifact image mapped at `address`.
pub fn encode_info(
    metadata: &ArtifactMetadata,
    address: u64,
    image: &[u8],
) -> Result<Vec<u8>, CacheError> {
    let mut pool = StringPoolBuilder::new();
    let deps: Vec<StrIndex> = metadata
        .dependencies
        .iter()
        .map(|d| pool.intern(&d.name))
        .collect();
    let pragmas: Vec<(StrIndex, StrIndex)> = metadata
        .pragmas
        .iter()
        .map(|p| (pool.intern(&p.key), pool.intern(&p.value)))
        .collect();
    let vars: Vec<StrIndex> = metadata
        .export_vars
        .iter()
        .map(|v| pool.intern(&v.name))
        .collect();
    let funcs: Vec<StrIndex> = metadata.export_funcs.iter().map(|n| pool.intern(n)).collect();
    let foreach: Vec<StrIndex> = metadata
        .export_foreach
        .iter()
        .map(|e| pool.intern(&e.name))
        .collect();
    let functions: Vec<StrIndex> = metadata
        .functions
        .iter()
        .map(|f| pool.intern(&f.name))
        .collect();
    let (entries, blob) = pool.layout();

    let mut out = ByteWriter::new();
    out.bytes(&[0; HEADER_SIZE]);
    let mut sections = [SectionDescriptor::default(); 8];

    sections[Section::StringPool.index()] = open_section(&mut out, Section::StringPool, entries.len())?;
    for &(offset, len) in &entries {
        out.u32(fit_u32("string offset", offset)?);
        out.u32(fit_u32("string length", len)?);
    }
    out.bytes(&blob);

    sections[Section::Dependency.index()] = open_section(&mut out, Section::Dependency, deps.len())?;
    for (record, name) in metadata.dependencies.iter().zip(&deps) {
        out.u32(name.as_raw());
        out.u32(record.kind.as_u32());
        out.bytes(record.digest.as_bytes());
    }

    sections[Section::Pragma.index()] = open_section(&mut out, Section::Pragma, pragmas.len())?;
    for (key, value) in &pragmas {
        out.u32(key.as_raw());
        out.u32(value.as_raw());
    }

    sections[Section::ObjectSlot.index()] =
        open_section(&mut out, Section::ObjectSlot, metadata.object_slots.len())?;
    for &slot in &metadata.object_slots {
        out.u32(slot);
    }

    sections[Section::ExportVar.index()] = open_section(&mut out, Section::ExportVar, vars.len())?;
    for (var, name) in metadata.export_vars.iter().zip(&vars) {
        out.u64(var.address);
        out.u32(name.as_raw());
        out.u32(0);
    }

    sections[Section::ExportFunc.index()] = open_section(&mut out, Section::ExportFunc, funcs.len())?;
    for name in &funcs {
        out.u32(name.as_raw());
    }

    sections[Section::ExportForeach.index()] =
        open_section(&mut out, Section::ExportForeach, foreach.len())?;
    for (export, name) in metadata.export_foreach.iter().zip(&foreach) {
        out.u32(name.as_raw());
        out.u32(export.signature);
    }

    sections[Section::Function.index()] =
        open_section(&mut out, Section::Function, functions.len())?;
    for (function, name) in metadata.functions.iter().zip(&functions) {
        out.u64(function.address);
        out.u32(
            u32::try_from(function.size).map_err(|_| CacheError::TooLarge {
                what: "function size",
                value: function.size,
            })?,
        );
        out.u32(name.as_raw());
    }

    let mut flags = 0;
    if metadata.threadable {
        flags |= FLAG_THREADABLE;
    }
    if metadata.debug_info {
        flags |= FLAG_DEBUG_INFO;
    }
    let header = CacheHeader {
        magic: MAGIC,
        version: VERSION,
        host: HostLayout::current(),
        artifact_address: address,
        artifact_size: image.len() as u64,
        checksum: checksum::parity(image),
        flags,
        string_data_size: fit_u32("string blob", blob.len())?,
        sections,
    };
    let mut head = ByteWriter::new();
    header.encode(&mut head);
    out.patch(0, &head.into_inner());
    Ok(out.into_inner())
}

fn open_section(
    out: &mut ByteWriter,
    section: Section,
    count: usize,
) -> Result<SectionDescriptor, CacheError> {
    out.pad_to(WORD);
    Ok(SectionDescriptor {
        offset: fit_u32("metadata file", out.len())?,
        count: fit_u32(section.name(), count)?,
        item_size: section.item_size(),
    })
}

fn fit_u32(what: &'static str, value: usize) -> Result<u32, CacheError> {
    u32::try_from(value).map_err(|_| CacheError::TooLarge {
        what,
        value: value as u64,
    })
}

fn create_and_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io = |e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io)?;
    file.write_all(bytes).map_err(io)
}

fn unlink(path: &Path) {
    // A path that cannot be removed makes `create_new` fail and report it.
    let _ = fs::remove_file(path);
}

fn discard(path: &Path) {
    if let Ok(file) = OpenOptions::new().write(true).open(path) {
        let _ = file.set_len(0);
    }
    let _ = fs::remove_file(path);
}
