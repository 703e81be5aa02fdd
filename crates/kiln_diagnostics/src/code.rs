//! Diagnostic codes with category prefixes for structured event identification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category of a diagnostic code, determining its prefix letter.
///
/// Each category maps to a single-character prefix used in diagnostic code
/// display (e.g., `C101` for a cache header rejection, `M201` for slot
/// contention).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Category {
    /// Cache validation events, prefixed with `C`.
    Cache,
    /// Dependency invalidation events, prefixed with `D`.
    Dependency,
    /// Slot and region allocator events, prefixed with `M`.
    Memory,
    /// Cache persistence events, prefixed with `W`.
    Write,
}

impl Category {
    /// Returns the single-character prefix for this category.
    pub fn prefix(self) -> char {
        match self {
            Category::Cache => 'C',
            Category::Dependency => 'D',
            Category::Memory => 'M',
            Category::Write => 'W',
        }
    }
}

/// A structured diagnostic code combining a category prefix and a numeric identifier.
///
/// Displayed as the category prefix followed by a zero-padded 3-digit number,
/// e.g., `C101`, `D203`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct DiagnosticCode {
    /// The category of this diagnostic.
    pub category: Category,
    /// The numeric identifier within the category.
    pub number: u16,
}

impl DiagnosticCode {
    /// Creates a new diagnostic code.
    pub const fn new(category: Category, number: u16) -> Self {
        Self { category, number }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.category.prefix(), self.number)
    }
}
