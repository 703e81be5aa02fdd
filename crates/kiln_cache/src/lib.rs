//! Persistent cache for compiled kernels.
//!
//! A cached kernel is a pair of files in the cache directory:
//!
//! - `<name>.info` holds the metadata: a fixed header, a string pool, the
//!   dependency table, and the export and function lists.
//! - `<name>.o` holds the raw slot image the kernel was generated into.
//!
//! Loading validates the header against the host, compares the recorded
//! dependency digests against the current inputs, maps the image back at its
//! original slot address, and checks its parity checksum. Any failure is a
//! [`Miss`], never an error; [`KernelCache`] then recompiles through a
//! [`CodeGenerator`] and writes a fresh pair.

#![warn(missing_docs)]

pub mod cache;
pub mod checksum;
pub mod error;
pub mod format;
pub mod hasher;
pub mod host;
pub mod metadata;
pub mod reader;
pub mod strpool;
pub mod writer;

pub use cache::{
    CachePaths, CodeGenerator, CompileRequest, Kernel, KernelCache, KernelOrigin, SourceInput,
};
pub use error::CacheError;
pub use hasher::{DependencyHasher, DependencyRecord, ResourceKind};
pub use metadata::{ArtifactMetadata, ExportVar, ForEachExport, FunctionRecord, Pragma};
pub use reader::{CacheReader, LoadOutcome, LoadStage, LoadedArtifact, Miss, MissReason};
pub use writer::CacheWriter;
