//! Shared collector for cache diagnostics.

use crate::code::DiagnosticCode;
use crate::diagnostic::Diagnostic;
use crate::severity::Severity;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Collects the diagnostics produced while loading, compiling and persisting
/// kernels.
///
/// Several compile-or-load requests may run concurrently on different slots
/// and report into one sink. Nothing kiln emits is fatal, so consumers filter
/// by severity threshold or look for a specific code rather than asking
/// whether anything failed.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Diagnostic>> {
        // Pushing a diagnostic cannot leave the vector half-updated.
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a diagnostic.
    pub fn emit(&self, diag: Diagnostic) {
        self.lock().push(diag);
    }

    /// Number of diagnostics at `min` severity or above.
    pub fn count_at_least(&self, min: Severity) -> usize {
        self.lock().iter().filter(|d| d.severity >= min).count()
    }

    /// Whether a diagnostic with `code` has been emitted.
    pub fn contains(&self, code: DiagnosticCode) -> bool {
        self.lock().iter().any(|d| d.code == code)
    }

    /// Drains the sink, returning only diagnostics at `min` severity or above.
    pub fn take_at_least(&self, min: Severity) -> Vec<Diagnostic> {
        let mut taken = std::mem::take(&mut *self.lock());
        taken.retain(|d| d.severity >= min);
        taken
    }

    /// Drains the sink.
    pub fn take_all(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.lock())
    }

    /// Copies the current contents without draining.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }
}
