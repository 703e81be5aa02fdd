//! Content digests for dependency invalidation.

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use std::fmt;
use std::io::{self, Read};

/// Length in bytes of a [`Digest`].
pub const DIGEST_LEN: usize = 20;

/// A 160-bit SHA-1 content digest recorded for every cache dependency.
///
/// Two inputs with the same `Digest` are assumed to have identical content.
/// The all-zero digest is reserved for "could not be computed": it never
/// matches a real file hash, so a dependency that failed to hash always
/// invalidates the cache instead of aborting the build.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Digest = Digest([0; DIGEST_LEN]);

    /// Computes the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let out = Sha1::digest(data);
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// Computes the digest of everything readable from `reader`.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
        }
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(Self(bytes))
    }

    /// Wraps raw digest bytes, e.g. as read back from a cache file.
    pub const fn from_raw(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Returns `true` for the all-zero "unavailable" digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; DIGEST_LEN]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
