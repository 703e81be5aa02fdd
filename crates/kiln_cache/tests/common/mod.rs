#![allow(dead_code)]

use kiln_cache::{
    ArtifactMetadata, CodeGenerator, CompileRequest, DependencyHasher, DependencyRecord,
    ExportVar, ForEachExport, KernelCache, Pragma, ResourceKind, SourceInput,
};
use kiln_common::{FloatPrecision, InternalError, KilnResult};
use kiln_config::CacheToggles;
use kiln_mem::{RegionAllocator, SlotAllocator, SlotLayout};
use std::path::Path;

pub const KIB: usize = 1024;
pub const CODE_LEN: usize = 4 * KIB;
pub const DATA_LEN: usize = KIB;

/// 8 slots of 256 KiB: 128 KiB code+stub, 128 KiB data.
pub fn layout(base: usize) -> SlotLayout {
    SlotLayout::new(base, 8, 128 * KIB, 128 * KIB, KIB).unwrap()
}

pub fn toggles() -> CacheToggles {
    CacheToggles {
        enabled: true,
        force_recompile: false,
        float_precision: None,
    }
}

pub fn runtime() -> Vec<DependencyRecord> {
    vec![DependencyRecord::new(
        "libkiln_rt.so",
        ResourceKind::Runtime,
        DependencyHasher::hash(b"runtime library v1"),
    )]
}

pub fn cache(base: usize, dir: &Path, toggles: CacheToggles) -> KernelCache {
    KernelCache::new(SlotAllocator::new(layout(base)), dir, toggles, runtime())
}

pub fn request(source: &[u8]) -> CompileRequest {
    CompileRequest::new("blur", vec![SourceInput::new("blur.bc", source.to_vec())])
}

/// Emits one 4 KiB function and 1 KiB of globals.
pub struct FakeBackend {
    pub calls: usize,
    pub pragmas: Vec<Pragma>,
    pub fail: bool,
    /// The precision each call was asked to compile for.
    pub requested_precision: Vec<Option<FloatPrecision>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            calls: 0,
            pragmas: vec![Pragma::new("version", "1")],
            fail: false,
            requested_precision: Vec::new(),
        }
    }
}

fn internal(e: impl std::fmt::Display) -> InternalError {
    InternalError::new(e.to_string())
}

impl CodeGenerator for FakeBackend {
    fn generate(
        &mut self,
        request: &CompileRequest,
        region: &mut RegionAllocator,
    ) -> KilnResult<ArtifactMetadata> {
        self.calls += 1;
        self.requested_precision.push(request.float_precision);
        if self.fail {
            return Err(InternalError::new("backend rejected the input"));
        }
        let seed = request.sources[0].contents.first().copied().unwrap_or(0);

        region.allocate_got().map_err(internal)?;
        let body = region.begin_function("root").map_err(internal)?;
        let code: Vec<u8> = (0..CODE_LEN).map(|i| (i as u8).wrapping_add(seed)).collect();
        region.write(body.addr, &code).map_err(internal)?;
        region.end_function("root", CODE_LEN).map_err(internal)?;

        let global = region.allocate_global(DATA_LEN, 16).map_err(internal)?;
        region.write(global.addr, &[0x5A; DATA_LEN]).map_err(internal)?;

        Ok(ArtifactMetadata {
            threadable: true,
            pragmas: self.pragmas.clone(),
            object_slots: vec![0],
            export_vars: vec![ExportVar::new("radius", global.addr as u64)],
            export_foreach: vec![ForEachExport {
                name: "root".into(),
                signature: 0x1f,
            }],
            ..ArtifactMetadata::default()
        })
    }
}
