//! Shared foundational types used across the Kiln kernel cache.
//!
//! This crate provides the fixed-length content digest used for dependency
//! invalidation, the floating-point precision requirement of a compiled kernel,
//! and the internal result type used at the code-generator boundary.

#![warn(missing_docs)]

pub mod hash;
pub mod precision;
pub mod result;

pub use hash::{Digest, DIGEST_LEN};
pub use precision::FloatPrecision;
pub use result::{InternalError, KilnResult};
