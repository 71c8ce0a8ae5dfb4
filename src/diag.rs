//! Internal diagnostic model for compile-phase errors, warnings, and notes.
//!
//! The middle end never holds source text; diagnostics carry file/line/column
//! positions and are converted to [`miette::Report`] values at the boundary
//! for rendering.

use crate::ast::pos::OptPos;
use miette::{Diagnostic, Report, Severity};
use std::fmt;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagSeverity {
    /// A fatal error; compilation continues to batch further errors but the
    /// pipeline stops before code generation.
    Error,
    /// A warning about potentially problematic code.
    Warning,
    /// An informational note or advice.
    Note,
}

impl fmt::Display for DiagSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagSeverity::Error => write!(f, "error"),
            DiagSeverity::Warning => write!(f, "warning"),
            DiagSeverity::Note => write!(f, "note"),
        }
    }
}

/// The abstract kind of a user-level problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    /// Malformed declaration accepted from upstream; the declaration is
    /// dropped.
    Syntax,
    /// Unknown identifier or ambiguous import; the reference is an
    /// unresolved hole downstream passes skip.
    NameResolution,
    /// Incompatible types or unification failure; the proc is not lowered
    /// past flattening.
    Type,
    /// Output parameter read before bound, or input parameter written; the
    /// proc is dropped.
    FlowMode,
    /// General problem with no finer classification.
    General,
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagKind::Syntax => write!(f, "syntax"),
            DiagKind::NameResolution => write!(f, "name"),
            DiagKind::Type => write!(f, "type"),
            DiagKind::FlowMode => write!(f, "flow"),
            DiagKind::General => write!(f, "general"),
        }
    }
}

/// A structured diagnostic message.
///
/// This is the internal representation used throughout the compiler. It
/// captures everything needed to render reports: severity, kind, message,
/// source position, help text, and notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diag {
    /// The severity level of this diagnostic.
    pub severity: DiagSeverity,
    /// The kind of problem reported.
    pub kind: DiagKind,
    /// The main diagnostic message.
    pub message: String,
    /// Where the problem was detected, if known.
    pub pos: OptPos,
    /// Optional help text suggesting how to fix the issue.
    pub help: Option<String>,
    /// Additional notes providing context.
    pub notes: Vec<String>,
}

impl Diag {
    /// Creates a new diagnostic with the given severity and message.
    pub fn new(severity: DiagSeverity, kind: DiagKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            pos: None,
            help: None,
            notes: Vec::new(),
        }
    }

    /// Creates a new error diagnostic.
    pub fn error(kind: DiagKind, message: impl Into<String>) -> Self {
        Self::new(DiagSeverity::Error, kind, message)
    }

    /// Creates a new warning diagnostic.
    pub fn warning(kind: DiagKind, message: impl Into<String>) -> Self {
        Self::new(DiagSeverity::Warning, kind, message)
    }

    /// Creates a new note diagnostic.
    pub fn note(message: impl Into<String>) -> Self {
        Self::new(DiagSeverity::Note, DiagKind::General, message)
    }

    /// Attaches a source position.
    pub fn at(mut self, pos: OptPos) -> Self {
        self.pos = pos;
        self
    }

    /// Sets the help text for this diagnostic.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Adds a note to this diagnostic.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Renders this diagnostic into a [`miette::Report`].
    pub fn to_report(&self) -> Report {
        Report::new(BuiltDiagnostic::from(self))
    }
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = &self.pos {
            write!(f, "{pos}: ")?;
        }
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Converts internal diagnostics to miette Reports.
pub fn diags_to_reports(diagnostics: &[Diag]) -> Vec<Report> {
    diagnostics.iter().map(Diag::to_report).collect()
}

/// An unrecoverable compiler failure.
///
/// User-level problems are [`Diag`] values in the driver's buffer; this type
/// covers the failures that abort the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An internal invariant was violated; always a compiler bug.
    Internal(String),
    /// A persisted module artifact could not be decoded.
    Artifact(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Internal(msg) => write!(f, "internal compiler error: {msg}"),
            CompileError::Artifact(msg) => write!(f, "bad module artifact: {msg}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Shorthand constructor for internal invariant violations.
pub fn internal_error<T>(msg: impl Into<String>) -> Result<T, CompileError> {
    Err(CompileError::Internal(msg.into()))
}

/// The final diagnostic type implementing miette's Diagnostic trait.
#[derive(Debug)]
struct BuiltDiagnostic {
    message: String,
    severity: Severity,
    code: String,
    help: Option<String>,
    related: Vec<NoteDiagnostic>,
}

impl From<&Diag> for BuiltDiagnostic {
    fn from(diag: &Diag) -> Self {
        let message = match &diag.pos {
            Some(pos) => format!("{pos}: {}", diag.message),
            None => diag.message.clone(),
        };
        Self {
            message,
            severity: match diag.severity {
                DiagSeverity::Error => Severity::Error,
                DiagSeverity::Warning => Severity::Warning,
                DiagSeverity::Note => Severity::Advice,
            },
            code: format!("wybe::{}", diag.kind),
            help: diag.help.clone(),
            related: diag.notes.iter().cloned().map(NoteDiagnostic).collect(),
        }
    }
}

#[derive(Debug)]
struct NoteDiagnostic(String);

impl fmt::Display for NoteDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BuiltDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BuiltDiagnostic {}
impl std::error::Error for NoteDiagnostic {}

impl Diagnostic for BuiltDiagnostic {
    fn severity(&self) -> Option<Severity> {
        Some(self.severity)
    }

    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(&self.code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display>)
    }

    fn related<'a>(&'a self) -> Option<Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>> {
        if self.related.is_empty() {
            None
        } else {
            Some(Box::new(
                self.related.iter().map(|diag| diag as &dyn Diagnostic),
            ))
        }
    }
}

impl Diagnostic for NoteDiagnostic {
    fn severity(&self) -> Option<Severity> {
        Some(Severity::Advice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::pos::SourcePos;

    #[test]
    fn severity_display() {
        assert_eq!(DiagSeverity::Error.to_string(), "error");
        assert_eq!(DiagSeverity::Warning.to_string(), "warning");
        assert_eq!(DiagSeverity::Note.to_string(), "note");
    }

    #[test]
    fn diag_builder_error() {
        let diag = Diag::error(DiagKind::Type, "type mismatch")
            .at(Some(SourcePos::new("main.wybe", 3, 7)))
            .with_help("add a type ascription");

        assert_eq!(diag.severity, DiagSeverity::Error);
        assert_eq!(diag.kind, DiagKind::Type);
        assert_eq!(diag.message, "type mismatch");
        assert_eq!(diag.help, Some("add a type ascription".to_string()));
        assert_eq!(diag.to_string(), "main.wybe:3:7: error: type mismatch");
    }

    #[test]
    fn diag_without_position() {
        let diag = Diag::warning(DiagKind::General, "unused import");
        assert_eq!(diag.to_string(), "warning: unused import");
    }

    #[test]
    fn convert_to_report() {
        let diag = Diag::error(DiagKind::NameResolution, "unknown proc `foo`")
            .at(Some(SourcePos::new("m.wybe", 1, 2)))
            .with_note("did you mean `for`?");
        let report = diag.to_report();
        assert_eq!(report.to_string(), "m.wybe:1:2: unknown proc `foo`");
    }

    #[test]
    fn built_diagnostic_carries_kind_code() {
        let diag = Diag::error(DiagKind::FlowMode, "output read before bound");
        let built = BuiltDiagnostic::from(&diag);
        assert_eq!(built.code, "wybe::flow");
        assert_eq!(built.severity, Severity::Error);
    }

    #[test]
    fn notes_become_related_diagnostics() {
        let diag = Diag::error(DiagKind::General, "root issue")
            .with_note("first note")
            .with_note("second note");
        let built = BuiltDiagnostic::from(&diag);
        let related = built.related().expect("related diagnostics").count();
        assert_eq!(related, 2);
    }

    #[test]
    fn internal_error_display() {
        let err = CompileError::Internal("fork after seal".into());
        assert_eq!(err.to_string(), "internal compiler error: fork after seal");
    }
}
