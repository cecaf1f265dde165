//! Effect typing for Ember.
//!
//! This crate implements:
//! - Effect-row inference over typed HIR, composing rows through the shared
//!   [`EffectRowTable`](ember_types::EffectRowTable)
//! - Handler typing: clause overload resolution, generic instantiation
//!   agreement, continuation types, residual rows and unhandled-effect checks
//! - Continuation usage analysis and the resumption-count rules built on it
//! - Export surface checks
//!
//! Problems are reported as [`Diagnostic`]s per function; a function with
//! errors is skipped by lowering but does not stop the rest of the module.

pub mod effects;
pub mod exports;
mod handler;
mod overload;
pub mod tail;
pub mod trace;
pub mod usage;

#[cfg(test)]
mod handler_tests;

use ember_hir::HirModule;
use ember_types::EffectRowId;

pub use ember_diag::{Category, Diagnostic};
pub use effects::EffectChecker;
pub use exports::check_export;
pub use tail::{ResumeViolation, enforce_tail_resumption};
pub use trace::{HandlerStep, HandlerTrace};
pub use usage::{ContinuationUsage, analyze_continuation_usage};

#[derive(Debug, Clone, Copy, Default)]
pub struct TypingOptions {
    /// Record a [`HandlerTrace`] for every handler expression.
    pub trace: bool,
}

/// Effect typing result for one function.
#[derive(Debug, Clone)]
pub struct FunctionTyping {
    pub name: String,
    /// Inferred row of the body.
    pub row: EffectRowId,
    pub diagnostics: Vec<Diagnostic>,
}

impl FunctionTyping {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleTyping {
    pub functions: Vec<FunctionTyping>,
    pub traces: Vec<HandlerTrace>,
}

impl ModuleTyping {
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.functions.iter().flat_map(|f| f.diagnostics.iter())
    }

    pub fn has_errors(&self) -> bool {
        self.functions.iter().any(FunctionTyping::has_errors)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionTyping> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Names of functions lowering must skip.
    pub fn failed_functions(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.has_errors())
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// Type every function of `module` in place, annotating handler expressions
/// and clauses for lowering.
pub fn check_module(module: &mut HirModule, options: &TypingOptions) -> ModuleTyping {
    let HirModule {
        catalog,
        rows,
        symbols,
        functions,
    } = module;
    let mut checker = EffectChecker::new(catalog, rows, symbols);
    if options.trace {
        checker = checker.with_tracing();
    }

    let mut typing = ModuleTyping::default();
    for function in functions.iter_mut() {
        let row = checker.check_function(function);
        let mut diagnostics = checker.take_diagnostics();
        diagnostics.extend(check_export(function, checker.rows()));
        typing.functions.push(FunctionTyping {
            name: function.name.clone(),
            row,
            diagnostics,
        });
    }
    typing.traces = checker.take_traces();
    typing
}
