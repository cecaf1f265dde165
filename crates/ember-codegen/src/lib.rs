//! Backend interface and the WASM-target lowering of typed HIR.
//!
//! The backend consumes a HIR module that effect typing has annotated and
//! produces a MIR module that implements algebraic effects without any
//! stack-switching primitive: handler frames are heap records chained through
//! a global, effectful functions return outcomes, and bodies that can suspend
//! are compiled into re-entrant state machines. See [`abi`] for the runtime
//! contract.

pub mod abi;
mod context;
mod error;
mod handlers;
mod lower;
mod stats;
mod wrappers;

#[cfg(test)]
mod lower_tests;

use std::collections::BTreeSet;

use ember_diag::Diagnostic;
use ember_hir::{Callee, HirExprKind, HirModule};
use ember_infer::ModuleTyping;
use ember_mir::{MirModule, validate_module};
use ember_types::Type;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use abi::Abi;
pub use context::{label_hash, mangle, mir_type};
pub use error::CodegenError;
pub use stats::{FunctionPassStats, PassStats, collect_pass_stats};

use context::CodegenContext;

/// Targets this backend can lower for.
pub const SUPPORTED_TARGETS: &[&str] = &["wasm32"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub target: String,
    pub tail_guards: TailGuardPolicy,
    /// Emit a `$export` wrapper for every exported function.
    pub export_wrappers: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            target: "wasm32".to_string(),
            tail_guards: TailGuardPolicy::AsAnalyzed,
            export_wrappers: true,
        }
    }
}

/// Which `tail` clauses check their continuation count at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailGuardPolicy {
    /// Only clauses typing could not prove exactly-once.
    #[default]
    AsAnalyzed,
    /// Every `tail` clause.
    AlwaysRuntime,
}

#[derive(Debug, Clone)]
pub struct CodegenOutput {
    pub module: MirModule,
    /// Warnings raised while lowering, such as missing effect ids.
    pub diagnostics: Vec<Diagnostic>,
    pub stats: PassStats,
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile_module(
        &self,
        hir: &HirModule,
        typing: &ModuleTyping,
        config: &BackendConfig,
    ) -> Result<CodegenOutput, CodegenError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WasmBackend;

impl Backend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn compile_module(
        &self,
        hir: &HirModule,
        typing: &ModuleTyping,
        config: &BackendConfig,
    ) -> Result<CodegenOutput, CodegenError> {
        if !SUPPORTED_TARGETS.contains(&config.target.as_str()) {
            return Err(CodegenError::UnsupportedTarget {
                target: config.target.clone(),
            });
        }
        lower_module(hir, typing, config)
    }
}

/// Lower every function of `hir` that typing accepted. Functions with typing
/// errors are skipped, and so is every function that calls one of them.
pub fn lower_module(
    hir: &HirModule,
    typing: &ModuleTyping,
    config: &BackendConfig,
) -> Result<CodegenOutput, CodegenError> {
    let skipped = skipped_functions(hir, typing);
    let mut cx = CodegenContext::new(hir, config);
    for function in &hir.functions {
        if skipped.contains(function.name.as_str()) {
            warn!(function = %function.name, "not lowering function with typing errors");
            continue;
        }
        let instantiations: Vec<Vec<Type>> = if function.is_generic() {
            function.instantiations.clone()
        } else {
            vec![Vec::new()]
        };
        if instantiations.is_empty() {
            debug!(function = %function.name, "generic function has no instantiations");
        }
        for args in &instantiations {
            wrappers::emit_function(&mut cx, function, args)?;
        }
    }

    let (module, diagnostics, recorded) = cx.finish();
    let problems = validate_module(&module);
    if let Some(first) = problems.first() {
        return Err(CodegenError::InvalidMir {
            count: problems.len(),
            first: first.to_string(),
        });
    }
    let stats = collect_pass_stats(&module, &recorded);
    info!(
        functions = module.functions.len(),
        layouts = module.layouts.len(),
        "lowered module"
    );
    Ok(CodegenOutput {
        module,
        diagnostics,
        stats,
    })
}

/// Functions with typing errors plus, transitively, their callers.
fn skipped_functions<'a>(hir: &'a HirModule, typing: &'a ModuleTyping) -> BTreeSet<&'a str> {
    let mut skipped: BTreeSet<&str> = typing.failed_functions().into_iter().collect();
    loop {
        let before = skipped.len();
        for function in &hir.functions {
            if skipped.contains(function.name.as_str()) {
                continue;
            }
            let mut calls_skipped = false;
            function.body.walk(&mut |expr| {
                let callee = match &expr.kind {
                    HirExprKind::Call {
                        callee: Callee::Function(fref),
                        ..
                    } => Some(fref.name.as_str()),
                    HirExprKind::MethodCall { method, .. } => Some(method.name.as_str()),
                    _ => None,
                };
                if callee.is_some_and(|name| skipped.contains(name)) {
                    calls_skipped = true;
                }
            });
            if calls_skipped {
                skipped.insert(function.name.as_str());
            }
        }
        if skipped.len() == before {
            return skipped;
        }
    }
}
