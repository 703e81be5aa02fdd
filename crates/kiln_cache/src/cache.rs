//! Compile-or-load orchestration.
//!
//! [`KernelCache`] ties together the slot table, the reader, the writer, and
//! an external [`CodeGenerator`]. A request is served from the cache when the
//! stored kernel validates, and compiled into a fresh slot otherwise.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kiln_common::{Digest, FloatPrecision, KilnResult};
use kiln_config::{CacheToggles, KilnConfig};
use kiln_diagnostics::{Category, Diagnostic, DiagnosticCode, DiagnosticSink};
use kiln_mem::{RegionAllocator, SlotAllocator, SlotHandle, SlotLayout};

use crate::error::CacheError;
use crate::hasher::{DependencyHasher, DependencyRecord, ResourceKind};
use crate::metadata::{ArtifactMetadata, FunctionRecord};
use crate::reader::{CacheReader, LoadOutcome};
use crate::writer::CacheWriter;

/// Extension of the metadata file.
pub const INFO_EXT: &str = "info";
/// Extension of the image file.
pub const OBJECT_EXT: &str = "o";

/// No fixed slot was free; the kernel runs from an OS-chosen address.
pub const SLOT_FALLBACK: DiagnosticCode = DiagnosticCode::new(Category::Memory, 302);
/// Writing the cache files failed.
pub const PERSIST_FAILED: DiagnosticCode = DiagnosticCode::new(Category::Write, 401);
/// The cache files were deliberately left alone.
pub const PERSIST_SKIPPED: DiagnosticCode = DiagnosticCode::new(Category::Write, 402);

/// Locations of one kernel's cache files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePaths {
    /// `<dir>/<name>.info`
    pub info: PathBuf,
    /// `<dir>/<name>.o`
    pub object: PathBuf,
}

impl CachePaths {
    /// Paths for kernel `name` in `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            info: dir.join(format!("{name}.{INFO_EXT}")),
            object: dir.join(format!("{name}.{OBJECT_EXT}")),
        }
    }
}

/// One source input of a compile request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInput {
    /// Name recorded in the dependency table.
    pub name: String,
    /// Raw bitcode.
    pub contents: Vec<u8>,
}

impl SourceInput {
    /// Wraps an in-memory input.
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }

    /// Reads an input from disk, naming it after the file.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, contents })
    }

    /// Content digest of the input.
    pub fn digest(&self) -> Digest {
        DependencyHasher::hash(&self.contents)
    }
}

/// A request to produce one kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileRequest {
    /// Kernel name; also the stem of its cache files.
    pub name: String,
    /// Inputs, in the order they are recorded as dependencies.
    pub sources: Vec<SourceInput>,
    /// Precision the kernel must be compiled for. `None` lets the kernel's
    /// own pragmas decide.
    pub float_precision: Option<FloatPrecision>,
}

impl CompileRequest {
    /// Creates a request.
    pub fn new(name: impl Into<String>, sources: Vec<SourceInput>) -> Self {
        Self {
            name: name.into(),
            sources,
            float_precision: None,
        }
    }

    /// Requires the kernel to be compiled for `precision`.
    pub fn with_float_precision(mut self, precision: FloatPrecision) -> Self {
        self.float_precision = Some(precision);
        self
    }
}

/// The backend that turns a request into machine code.
///
/// The generator emits functions, stubs, and globals through the region
/// allocator and returns the metadata describing them. When
/// `request.float_precision` is set it must compile for that precision; the
/// cache records it in the returned pragmas. The function table it returns is
/// replaced with the allocator's own record of emitted bodies, and the
/// dependency table is filled in by the cache.
pub trait CodeGenerator {
    /// Generates code for `request` into `region`.
    fn generate(
        &mut self,
        request: &CompileRequest,
        region: &mut RegionAllocator,
    ) -> KilnResult<ArtifactMetadata>;
}

/// Where a kernel came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelOrigin {
    /// Mapped back from the cache directory.
    Cache,
    /// Freshly compiled.
    Compiled {
        /// Whether the result was written to the cache directory.
        persisted: bool,
    },
}

/// A kernel ready to run.
#[derive(Debug)]
pub struct Kernel {
    /// The kernel's metadata.
    pub metadata: ArtifactMetadata,
    /// The slot holding its code and data.
    pub slot: SlotHandle,
    /// Where it came from.
    pub origin: KernelOrigin,
}

impl Kernel {
    /// Entry address of function `name`.
    pub fn function_address(&self, name: &str) -> Option<usize> {
        let record = self.metadata.function(name)?;
        usize::try_from(record.address).ok()
    }

    /// Address of exported variable `name`.
    pub fn export_var_address(&self, name: &str) -> Option<usize> {
        let var = self.metadata.export_var(name)?;
        usize::try_from(var.address).ok()
    }
}

/// Compile-or-load front end for one cache directory.
pub struct KernelCache {
    slots: SlotAllocator,
    dir: PathBuf,
    toggles: CacheToggles,
    runtime: Vec<DependencyRecord>,
}

impl KernelCache {
    /// Creates a cache over `dir`. `runtime` lists the runtime-library
    /// dependencies recorded ahead of every request's sources.
    pub fn new(
        slots: SlotAllocator,
        dir: impl Into<PathBuf>,
        toggles: CacheToggles,
        runtime: Vec<DependencyRecord>,
    ) -> Self {
        Self {
            slots,
            dir: dir.into(),
            toggles,
            runtime,
        }
    }

    /// Builds the slot table and runtime dependencies from configuration.
    pub fn from_config(config: &KilnConfig, toggles: CacheToggles) -> Result<Self, CacheError> {
        let layout = SlotLayout::from_config(&config.memory)?;
        let runtime = DependencyHasher::runtime_dependencies(&config.cache.runtime);
        Ok(Self::new(
            SlotAllocator::new(layout),
            config.cache.dir.clone(),
            toggles,
            runtime,
        ))
    }

    /// The slot table.
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The effective toggles.
    pub fn toggles(&self) -> CacheToggles {
        self.toggles
    }

    /// Cache file locations for kernel `name`.
    pub fn paths(&self, name: &str) -> CachePaths {
        CachePaths::new(&self.dir, name)
    }

    /// The full dependency table for `request`: runtime libraries first, then
    /// sources in request order.
    pub fn dependencies(&self, request: &CompileRequest) -> Vec<DependencyRecord> {
        let mut deps = self.runtime.clone();
        deps.extend(request.sources.iter().map(|src| {
            DependencyRecord::new(src.name.clone(), ResourceKind::Source, src.digest())
        }));
        deps
    }

    /// The precision `request` must be served at: the configured override,
    /// else the request's own.
    pub fn precision_for(&self, request: &CompileRequest) -> Option<FloatPrecision> {
        self.toggles.float_precision.or(request.float_precision)
    }

    /// Attempts a cache load, ignoring the enable and force toggles.
    pub fn load(&self, request: &CompileRequest, sink: &DiagnosticSink) -> LoadOutcome {
        let deps = self.dependencies(request);
        CacheReader::new(&self.slots, &deps)
            .with_precision(self.precision_for(request))
            .with_sink(sink)
            .load(&self.paths(&request.name))
    }

    /// Returns the cached kernel for `request`, compiling it on a miss.
    ///
    /// Loading is skipped when the cache is disabled or recompilation is
    /// forced. A compiled kernel is written back only when the cache is
    /// enabled, it landed in a fixed slot, and the miss was not caused by its
    /// slot being busy. Write failures are reported to `sink` and do not fail
    /// the call.
    pub fn load_or_compile<G>(
        &self,
        request: &CompileRequest,
        generator: &mut G,
        sink: &DiagnosticSink,
    ) -> Result<Kernel, CacheError>
    where
        G: CodeGenerator + ?Sized,
    {
        let deps = self.dependencies(request);
        let paths = self.paths(&request.name);
        let precision = self.precision_for(request);

        let mut slot_busy = false;
        if self.toggles.enabled && !self.toggles.force_recompile {
            let outcome = CacheReader::new(&self.slots, &deps)
                .with_precision(precision)
                .with_sink(sink)
                .load(&paths);
            match outcome {
                LoadOutcome::Ready(artifact) => {
                    return Ok(Kernel {
                        metadata: artifact.metadata,
                        slot: artifact.slot,
                        origin: KernelOrigin::Cache,
                    });
                }
                LoadOutcome::Miss(miss) => slot_busy = miss.is_slot_in_use(),
            }
        }

        let slot = self.slots.allocate()?;
        if !slot.is_fixed() {
            sink.emit(
                Diagnostic::warning(
                    SLOT_FALLBACK,
                    format!("no free slot for '{}'", request.name),
                )
                .with_note(format!("kernel placed at {:#x} and will not be cached", slot.address())),
            );
        }

        let request = if precision == request.float_precision {
            Cow::Borrowed(request)
        } else {
            Cow::Owned(CompileRequest {
                float_precision: precision,
                ..request.clone()
            })
        };
        let mut region = RegionAllocator::new(slot)?;
        let mut metadata = generator.generate(&request, &mut region)?;
        region.set_executable()?;
        if let Some(precision) = precision {
            metadata.set_float_precision(precision);
        }
        metadata.functions = region.functions().iter().map(FunctionRecord::from).collect();
        metadata.dependencies = deps;
        let slot = region.into_slot();

        let persisted = if !self.toggles.enabled || !slot.is_fixed() {
            false
        } else if slot_busy {
            sink.emit(Diagnostic::info(
                PERSIST_SKIPPED,
                format!(
                    "not replacing cache files for '{}' while their slot is in use",
                    request.name
                ),
            ));
            false
        } else {
            match CacheWriter::new(&paths).write(&slot, &metadata) {
                Ok(()) => true,
                Err(e) => {
                    sink.emit(
                        Diagnostic::warning(
                            PERSIST_FAILED,
                            format!("failed to cache '{}'", request.name),
                        )
                        .with_note(e.to_string()),
                    );
                    false
                }
            }
        };

        Ok(Kernel {
            metadata,
            slot,
            origin: KernelOrigin::Compiled { persisted },
        })
    }
}
