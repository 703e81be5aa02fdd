//! Diagnostic rendering backends for human-readable and machine-readable output.

use crate::diagnostic::Diagnostic;

/// Trait for rendering diagnostics into formatted output strings.
pub trait DiagnosticRenderer {
    /// Renders a single diagnostic into a formatted string.
    fn render(&self, diag: &Diagnostic) -> String;
}

/// Renders diagnostics in a rustc-style terminal format.
///
/// Produces output like:
/// ```text
/// info[D201]: cache miss: dependency 1 ('blur.bc') has a different digest
///    = note: rejected at DependenciesValidated
/// ```
pub struct TerminalRenderer {
    /// Whether to use ANSI color codes in output.
    pub color: bool,
}

impl TerminalRenderer {
    /// Creates a new terminal renderer.
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn severity_prefix(&self, diag: &Diagnostic) -> String {
        if !self.color {
            return diag.severity.to_string();
        }
        let ansi = match diag.severity {
            crate::Severity::Error => "31",
            crate::Severity::Warning => "33",
            crate::Severity::Info => "36",
        };
        format!("\x1b[1;{ansi}m{}\x1b[0m", diag.severity)
    }
}

impl DiagnosticRenderer for TerminalRenderer {
    fn render(&self, diag: &Diagnostic) -> String {
        let mut out = format!(
            "{}[{}]: {}",
            self.severity_prefix(diag),
            diag.code,
            diag.message
        );
        for note in &diag.notes {
            out.push_str(&format!("\n   = note: {note}"));
        }
        out
    }
}

/// Renders each diagnostic as a single-line JSON object.
pub struct JsonRenderer;

impl DiagnosticRenderer for JsonRenderer {
    fn render(&self, diag: &Diagnostic) -> String {
        serde_json::to_string(diag).unwrap_or_else(|e| {
            format!("{{\"error\":\"failed to serialize diagnostic: {e}\"}}")
        })
    }
}
