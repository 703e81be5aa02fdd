//! Structured diagnostics for cache, allocator, and persistence events.
//!
//! Cache misses are never errors, but callers still want to know *why* a cached
//! kernel was rejected. Components emit structured [`Diagnostic`] values into a
//! thread-safe [`DiagnosticSink`], and a [`DiagnosticRenderer`] formats them for
//! the terminal or as JSON.

#![warn(missing_docs)]

pub mod code;
pub mod diagnostic;
pub mod renderer;
pub mod severity;
pub mod sink;

pub use code::{Category, DiagnosticCode};
pub use diagnostic::Diagnostic;
pub use renderer::{DiagnosticRenderer, JsonRenderer, TerminalRenderer};
pub use severity::Severity;
pub use sink::DiagnosticSink;
