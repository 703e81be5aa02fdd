//! Configuration types deserialized from `kiln.toml`.

use kiln_common::FloatPrecision;
use serde::Deserialize;
use std::path::PathBuf;

/// Smallest page size any supported host uses. Layout sizes must be multiples
/// of it; the memory crate re-checks against the real page size at runtime.
pub const MIN_PAGE_SIZE: u64 = 4096;

/// Default fixed base address of the first slot.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_BASE_ADDRESS: u64 = 0x6000_0000_0000;
/// Default fixed base address of the first slot.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_BASE_ADDRESS: u64 = 0x7e00_0000;

/// Default number of fixed-address slots.
pub const DEFAULT_SLOT_COUNT: usize = 8;
/// Default size of the code+stub sub-area of a slot.
pub const DEFAULT_CODE_SIZE: usize = 128 * 1024;
/// Default size of the global data sub-area of a slot.
pub const DEFAULT_DATA_SIZE: usize = 128 * 1024;
/// Default size of the global offset table carved from the stub region.
pub const DEFAULT_GOT_SIZE: usize = 1024;

/// The top-level configuration parsed from `kiln.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KilnConfig {
    /// Slot layout constants.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Cache location, toggles, and runtime-library dependencies.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Fixed-address slot layout.
///
/// Every process that wants to share cached artifacts must agree on these
/// values: a cached artifact is only reusable when it maps back at the address
/// it was generated for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemoryConfig {
    /// Address of slot 0; slot `i` starts at `base_address + i * slot_size`.
    #[serde(default = "default_base_address")]
    pub base_address: u64,
    /// Number of fixed-address slots.
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
    /// Size of the code+stub sub-area at the start of each slot.
    #[serde(default = "default_code_size")]
    pub code_size: usize,
    /// Size of the global data sub-area following the code sub-area.
    #[serde(default = "default_data_size")]
    pub data_size: usize,
    /// Size of the global offset table reserved from the stub region.
    #[serde(default = "default_got_size")]
    pub got_size: usize,
}

impl MemoryConfig {
    /// Total size of one slot.
    pub fn slot_size(&self) -> usize {
        self.code_size + self.data_size
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            slot_count: DEFAULT_SLOT_COUNT,
            code_size: DEFAULT_CODE_SIZE,
            data_size: DEFAULT_DATA_SIZE,
            got_size: DEFAULT_GOT_SIZE,
        }
    }
}

fn default_base_address() -> u64 {
    DEFAULT_BASE_ADDRESS
}

fn default_slot_count() -> usize {
    DEFAULT_SLOT_COUNT
}

fn default_code_size() -> usize {
    DEFAULT_CODE_SIZE
}

fn default_data_size() -> usize {
    DEFAULT_DATA_SIZE
}

fn default_got_size() -> usize {
    DEFAULT_GOT_SIZE
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `<name>.info` / `<name>.o` pairs.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Whether cached artifacts are loaded and written at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip loading, but still write fresh artifacts.
    #[serde(default)]
    pub force_recompile: bool,
    /// Only accept cached artifacts compiled for this precision.
    #[serde(default)]
    pub float_precision: Option<FloatPrecision>,
    /// Shared runtime libraries every artifact implicitly depends on.
    #[serde(default)]
    pub runtime: Vec<RuntimeLibrary>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            enabled: true,
            force_recompile: false,
            float_precision: None,
            runtime: Vec::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".kiln-cache")
}

fn default_true() -> bool {
    true
}

/// A shared runtime library recorded as a fixed dependency of every artifact.
///
/// The digest is either computed from `path` or, when the library ships a
/// precomputed digest next to it, read from `digest_file`. If both are given
/// the stored digest wins, since hashing a large shared object on every load
/// is what the stored digest exists to avoid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeLibrary {
    /// Name recorded in the dependency table.
    pub name: String,
    /// Library file to hash.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// File holding the library's raw 20-byte digest.
    #[serde(default)]
    pub digest_file: Option<PathBuf>,
}
