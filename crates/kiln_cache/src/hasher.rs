//! Content digests of the inputs an artifact depends on.

use kiln_common::{Digest, DIGEST_LEN};
use kiln_config::RuntimeLibrary;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// What kind of input a dependency record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A shared runtime library every kernel links against.
    Runtime,
    /// A kernel source (bitcode) input.
    Source,
}

impl ResourceKind {
    /// Value stored in the dependency table.
    pub fn as_u32(self) -> u32 {
        match self {
            ResourceKind::Runtime => 0,
            ResourceKind::Source => 1,
        }
    }

    /// Parses a stored value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ResourceKind::Runtime),
            1 => Some(ResourceKind::Source),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Runtime => f.pad("runtime"),
            ResourceKind::Source => f.pad("source"),
        }
    }
}

/// One entry of an artifact's dependency table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DependencyRecord {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Content digest at the time the artifact was produced.
    pub digest: Digest,
}

impl DependencyRecord {
    /// Creates a record.
    pub fn new(name: impl Into<String>, kind: ResourceKind, digest: Digest) -> Self {
        Self {
            name: name.into(),
            kind,
            digest,
        }
    }
}

/// Computes the digests recorded in dependency tables.
///
/// Unreadable inputs hash to [`Digest::ZERO`]. A zero digest still takes part
/// in comparison, so an input that vanishes after an artifact was cached
/// invalidates it, while an input that was missing both times does not.
pub struct DependencyHasher;

impl DependencyHasher {
    /// Digest of an in-memory buffer.
    pub fn hash(bytes: &[u8]) -> Digest {
        Digest::from_bytes(bytes)
    }

    /// Digest of a file's contents, or [`Digest::ZERO`] if it cannot be read.
    pub fn hash_file(path: &Path) -> Digest {
        File::open(path)
            .and_then(|file| Digest::from_reader(file))
            .unwrap_or(Digest::ZERO)
    }

    /// Digests of several files, computed in parallel. Output order matches
    /// input order.
    pub fn hash_files(paths: &[PathBuf]) -> Vec<Digest> {
        paths.par_iter().map(|p| Self::hash_file(p)).collect()
    }

    /// Reads a precomputed raw 20-byte digest, or [`Digest::ZERO`] if the
    /// file is missing or too short.
    pub fn read_stored_digest(path: &Path) -> Digest {
        let mut raw = [0u8; DIGEST_LEN];
        match File::open(path).and_then(|mut f| f.read_exact(&mut raw)) {
            Ok(()) => Digest::from_raw(raw),
            Err(_) => Digest::ZERO,
        }
    }

    /// Dependency records for the configured runtime libraries, in
    /// configuration order.
    pub fn runtime_dependencies(libraries: &[RuntimeLibrary]) -> Vec<DependencyRecord> {
        libraries
            .par_iter()
            .map(|lib| {
                let digest = match (&lib.digest_file, &lib.path) {
                    (Some(stored), _) => Self::read_stored_digest(stored),
                    (None, Some(path)) => Self::hash_file(path),
                    (None, None) => Digest::ZERO,
                };
                DependencyRecord::new(lib.name.clone(), ResourceKind::Runtime, digest)
            })
            .collect()
    }
}
