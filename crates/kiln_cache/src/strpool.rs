//! The metadata string pool.
//!
//! Every name in the metadata file is stored once in a NUL-terminated blob
//! and referenced by its index. On disk the pool is `count` index entries of
//! `{offset u32, length u32}` followed immediately by the blob; `offset` is
//! relative to the start of the blob and byte `offset + length` must be NUL.

use lasso::Rodeo;

/// Index of a string in the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StrIndex(u32);

impl StrIndex {
    /// Returns the raw index as stored in records.
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

// SAFETY: `StrIndex` wraps a `u32`, and `try_from_usize` rejects values that
// don't fit in one.
unsafe impl lasso::Key for StrIndex {
    fn into_usize(self) -> usize {
        self.0 as usize
    }

    fn try_from_usize(int: usize) -> Option<Self> {
        u32::try_from(int).ok().map(StrIndex)
    }
}

/// Deduplicating builder used while writing a metadata file.
pub struct StringPoolBuilder {
    rodeo: Rodeo<StrIndex>,
}

impl StringPoolBuilder {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            rodeo: Rodeo::new(),
        }
    }

    /// Interns `s`, returning the index of the existing copy if there is one.
    pub fn intern(&mut self, s: &str) -> StrIndex {
        self.rodeo.get_or_intern(s)
    }

    /// Number of distinct strings.
    pub fn len(&self) -> usize {
        self.rodeo.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.rodeo.is_empty()
    }

    /// Strings in index order.
    pub fn strings(&self) -> impl Iterator<Item = &str> {
        (0..self.rodeo.len()).filter_map(|i| {
            let key = <StrIndex as lasso::Key>::try_from_usize(i)?;
            self.rodeo.try_resolve(&key)
        })
    }

    /// Returns `(index entries, blob)` as `(offset, length)` pairs and the
    /// NUL-terminated blob.
    pub fn layout(&self) -> (Vec<(usize, usize)>, Vec<u8>) {
        let mut entries = Vec::with_capacity(self.len());
        let mut blob = Vec::new();
        for s in self.strings() {
            entries.push((blob.len(), s.len()));
            blob.extend_from_slice(s.as_bytes());
            blob.push(0);
        }
        (entries, blob)
    }
}

impl Default for StringPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded, validated string pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    /// Validates index entries against `blob` and collects the strings.
    ///
    /// Fails if an entry points outside the blob, is not followed by a NUL, or
    /// is not UTF-8.
    pub fn decode(entries: &[(u32, u32)], blob: &[u8]) -> Result<Self, String> {
        let mut strings = Vec::with_capacity(entries.len());
        for (i, &(offset, len)) in entries.iter().enumerate() {
            let start = offset as usize;
            let end = start
                .checked_add(len as usize)
                .filter(|&end| end < blob.len())
                .ok_or_else(|| format!("string {i} lies outside the string blob"))?;
            if blob[end] != 0 {
                return Err(format!("string {i} is not NUL-terminated"));
            }
            let s = std::str::from_utf8(&blob[start..end])
                .map_err(|_| format!("string {i} is not valid UTF-8"))?;
            strings.push(s.to_string());
        }
        Ok(Self { strings })
    }

    /// Resolves a raw index from a record.
    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    /// Number of strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
