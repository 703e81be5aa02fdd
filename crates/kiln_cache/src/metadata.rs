//! In-memory form of the `.info` metadata.

use crate::hasher::DependencyRecord;
use kiln_common::FloatPrecision;
use kiln_mem::FunctionExtent;
use serde::Serialize;

/// A `#pragma` key/value pair carried through from the kernel source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Pragma {
    /// Pragma name.
    pub key: String,
    /// Pragma value, possibly empty.
    pub value: String,
}

impl Pragma {
    /// Creates a pragma.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An exported global variable and where it lives in the image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportVar {
    /// Variable name.
    pub name: String,
    /// Absolute address of the variable's storage.
    pub address: u64,
}

impl ExportVar {
    /// Creates an export record.
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// An exported kernel entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ForEachExport {
    /// Entry point name.
    pub name: String,
    /// Opaque bitmask describing which arguments the entry point takes.
    pub signature: u32,
}

/// One function body in the artifact image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionRecord {
    /// Function name.
    pub name: String,
    /// Absolute address of the first byte.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

impl From<&FunctionExtent> for FunctionRecord {
    fn from(extent: &FunctionExtent) -> Self {
        Self {
            name: extent.name.clone(),
            address: extent.start as u64,
            size: extent.size() as u64,
        }
    }
}

/// Everything stored in a metadata file besides the header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactMetadata {
    /// The kernel may run on several threads.
    pub threadable: bool,
    /// The kernel was compiled with debug information.
    pub debug_info: bool,
    /// Inputs the artifact was built from; runtime libraries come first.
    pub dependencies: Vec<DependencyRecord>,
    /// Pragmas from the kernel source.
    pub pragmas: Vec<Pragma>,
    /// Object slot numbers, in the order the runtime expects them.
    pub object_slots: Vec<u32>,
    /// Exported variables with their addresses.
    pub export_vars: Vec<ExportVar>,
    /// Exported function names.
    pub export_funcs: Vec<String>,
    /// Exported kernel entry points.
    pub export_foreach: Vec<ForEachExport>,
    /// Function bodies emitted into the image.
    pub functions: Vec<FunctionRecord>,
}

impl ArtifactMetadata {
    /// The float precision the kernel's pragmas ask for.
    pub fn float_precision(&self) -> FloatPrecision {
        FloatPrecision::from_pragma_keys(self.pragmas.iter().map(|p| p.key.as_str()))
    }

    /// Rewrites the precision pragmas so the artifact records `precision`.
    ///
    /// Other pragmas keep their order.
    pub fn set_float_precision(&mut self, precision: FloatPrecision) {
        self.pragmas.retain(|p| {
            p.key != FloatPrecision::RELAXED_PRAGMA && p.key != FloatPrecision::IMPRECISE_PRAGMA
        });
        if let Some(key) = precision.pragma_key() {
            self.pragmas.push(Pragma::new(key, ""));
        }
    }

    /// Finds an exported variable by name.
    pub fn export_var(&self, name: &str) -> Option<&ExportVar> {
        self.export_vars.iter().find(|v| v.name == name)
    }

    /// Finds a function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.iter().find(|f| f.name == name)
    }
}
