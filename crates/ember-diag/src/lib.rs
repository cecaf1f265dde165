//! Error reporting and diagnostics for Ember.
//!
//! Diagnostics are created by the typing and lowering crates and accumulated in
//! a [`DiagnosticSink`]. Every diagnostic carries a stable code so tooling can
//! match on it; the codes are part of the public contract and never change
//! meaning.

use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Diagnostic severity and categories
// ---------------------------------------------------------------------------

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Broad category for diagnostics. Each category owns one stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Type mismatch: expected X, got Y.
    TypeMismatch,
    /// Undefined variable, operation, or function.
    UndefinedName,
    /// Arity mismatch in a call, perform, or handler clause.
    ArityMismatch,
    /// General type error.
    TypeError,
    /// Missing type annotation needed for disambiguation.
    MissingAnnotation,
    /// An expression performs operations nothing handles.
    UnhandledEffects,
    /// A `tail` clause does not call its continuation exactly once.
    TailResumeCount,
    /// Perform sites of one generic operation disagree on its instantiation.
    GenericInstantiationMismatch,
    /// An overloaded operation clause matches zero or several signatures.
    AmbiguousHandlerClause,
    /// A clause resumes an operation that can never be resumed.
    ResumeCount,
    /// An exported effectful function returns a type the boundary cannot carry.
    EffectfulExportReturn,
    /// An exported generic function has no concrete instantiation.
    MissingExportInstantiation,
    /// An effect without a declared id fell back to a hashed id.
    MissingEffectId,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::TypeMismatch,
        Category::UndefinedName,
        Category::ArityMismatch,
        Category::TypeError,
        Category::MissingAnnotation,
        Category::UnhandledEffects,
        Category::TailResumeCount,
        Category::GenericInstantiationMismatch,
        Category::AmbiguousHandlerClause,
        Category::ResumeCount,
        Category::EffectfulExportReturn,
        Category::MissingExportInstantiation,
        Category::MissingEffectId,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::TypeMismatch => "type_mismatch",
            Category::UndefinedName => "undefined_name",
            Category::ArityMismatch => "arity_mismatch",
            Category::TypeError => "type_error",
            Category::MissingAnnotation => "missing_annotation",
            Category::UnhandledEffects => "unhandled_effects",
            Category::TailResumeCount => "tail_resume_count",
            Category::GenericInstantiationMismatch => "generic_instantiation_mismatch",
            Category::AmbiguousHandlerClause => "ambiguous_handler_clause",
            Category::ResumeCount => "resume_count",
            Category::EffectfulExportReturn => "effectful_export_return",
            Category::MissingExportInstantiation => "missing_export_instantiation",
            Category::MissingEffectId => "missing_effect_id",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Category::TypeMismatch => "E0001",
            Category::UndefinedName => "E0005",
            Category::ArityMismatch => "E0009",
            Category::TypeError => "E0012",
            Category::MissingAnnotation => "E0801",
            Category::UnhandledEffects => "E0401",
            Category::TailResumeCount => "E0402",
            Category::GenericInstantiationMismatch => "E0403",
            Category::AmbiguousHandlerClause => "E0404",
            Category::ResumeCount => "E0405",
            Category::EffectfulExportReturn => "E0406",
            Category::MissingExportInstantiation => "E0407",
            Category::MissingEffectId => "W0408",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::TypeMismatch => "Expression type does not match expected type.",
            Category::UndefinedName => "A referenced variable, operation, or name is undefined.",
            Category::ArityMismatch => "An operation or clause has the wrong number of parameters.",
            Category::TypeError => "General type checking error.",
            Category::MissingAnnotation => {
                "A type annotation is required to pick between overloaded operations."
            }
            Category::UnhandledEffects => "An expression performs operations that are never handled.",
            Category::TailResumeCount => {
                "A tail-resumptive clause does not call its continuation exactly once."
            }
            Category::GenericInstantiationMismatch => {
                "Perform sites of a generic operation disagree on its type arguments."
            }
            Category::AmbiguousHandlerClause => {
                "A handler clause matches no overload, or more than one."
            }
            Category::ResumeCount => "A clause resumes an operation that never returns.",
            Category::EffectfulExportReturn => {
                "An exported effectful function returns a non-scalar value."
            }
            Category::MissingExportInstantiation => {
                "An exported generic function has no concrete instantiation."
            }
            Category::MissingEffectId => "An effect has no declared runtime id.",
        }
    }

    pub fn example_fix(self) -> &'static str {
        match self {
            Category::TypeMismatch => {
                "Adjust the expression or add a conversion to match expected type."
            }
            Category::UndefinedName => "Declare the missing name or fix the spelling.",
            Category::ArityMismatch => "Match the operation's declared parameter count.",
            Category::TypeError => {
                "Follow the labeled spans and help text to align involved types."
            }
            Category::MissingAnnotation => "Annotate every value parameter of the clause.",
            Category::UnhandledEffects => {
                "Add a handler clause for the operation or declare it in the function's effects."
            }
            Category::TailResumeCount => {
                "Call the continuation exactly once on every path through the clause."
            }
            Category::GenericInstantiationMismatch => {
                "Use one instantiation per handler, or split the body across two handlers."
            }
            Category::AmbiguousHandlerClause => {
                "Annotate the clause parameters with the exact types of one overload."
            }
            Category::ResumeCount => "Drop the continuation call; the operation never returns.",
            Category::EffectfulExportReturn => {
                "Return Int, Float, Bool or () from exported effectful functions."
            }
            Category::MissingExportInstantiation => {
                "List at least one concrete instantiation for the exported function."
            }
            Category::MissingEffectId => "Declare an explicit effect id to keep it stable.",
        }
    }
}

// ---------------------------------------------------------------------------
// Source locations
// ---------------------------------------------------------------------------

/// A source location for diagnostics, in byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLocation {
    pub file_id: u32,
    pub start: u32,
    pub end: u32,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic message.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Stable diagnostic code (e.g. E0401).
    pub code: Option<String>,
    pub severity: Severity,
    pub category: Category,
    /// Primary message: what went wrong.
    pub message: String,
    /// Where it went wrong.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// Additional labeled spans (e.g., "perform site is here").
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<DiagLabel>,
    /// Suggested fix, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

/// A labeled source span within a diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct DiagLabel {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn error(category: Category, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    pub fn warning(category: Category, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    fn new(severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity,
            category,
            message: message.into(),
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_label(mut self, location: SourceLocation, message: impl Into<String>) -> Self {
        self.labels.push(DiagLabel {
            location,
            message: message.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        if let Some(code) = &self.code {
            write!(f, "{prefix}[{code}]: {}", self.message)?;
        } else {
            write!(f, "{prefix}: {}", self.message)?;
        }
        if let Some(loc) = &self.location {
            write!(f, "\n  --> file {}:{}..{}", loc.file_id, loc.start, loc.end)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Ordered accumulator for diagnostics produced by one phase.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn extend(&mut self, diags: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diags);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    pub fn with_category(&self, category: Category) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(move |d| d.category == category)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

// ---------------------------------------------------------------------------
// Error type for crates that produce diagnostics
// ---------------------------------------------------------------------------

/// Error type wrapping one or more diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
pub struct DiagnosticError(pub Vec<Diagnostic>);

impl DiagnosticError {
    pub fn single(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }

    pub fn multiple(diags: Vec<Diagnostic>) -> Self {
        Self(diags)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}
