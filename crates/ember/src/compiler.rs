use std::fs;
use std::path::Path;

use ember_codegen::{Backend, BackendConfig, PassStats, WasmBackend};
use ember_diag::{Diagnostic, Severity};
use ember_hir::HirModule;
use ember_infer::{HandlerTrace, ModuleTyping, TypingOptions};
use ember_mir::MirModule;
use tracing::{debug, info};

/// A typed module together with everything typing reported.
#[derive(Debug)]
pub struct CheckResult {
    pub hir: HirModule,
    pub typing: ModuleTyping,
    pub diagnostics: Vec<Diagnostic>,
}

impl CheckResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }

    pub fn traces(&self) -> &[HandlerTrace] {
        &self.typing.traces
    }
}

#[derive(Debug)]
pub struct CompileResult {
    pub mir: MirModule,
    pub stats: PassStats,
    /// Typing diagnostics followed by lowering warnings.
    pub diagnostics: Vec<Diagnostic>,
    /// Functions typing rejected. They and their callers are left out of `mir`.
    pub failed: Vec<String>,
}

impl CompileResult {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }
}

pub fn parse_module(source: &str) -> Result<HirModule, String> {
    serde_json::from_str(source).map_err(|err| format!("invalid HIR module: {err}"))
}

pub fn load_module(input: &Path) -> Result<HirModule, String> {
    let source = fs::read_to_string(input)
        .map_err(|err| format!("failed to read `{}`: {err}", input.display()))?;
    parse_module(&source)
}

/// Run effect typing over every function of `hir`.
pub fn check_module(mut hir: HirModule, options: &TypingOptions) -> CheckResult {
    let typing = ember_infer::check_module(&mut hir, options);
    let diagnostics: Vec<Diagnostic> = typing.diagnostics().cloned().collect();
    debug!(
        functions = hir.functions.len(),
        diagnostics = diagnostics.len(),
        "typed module"
    );
    CheckResult {
        hir,
        typing,
        diagnostics,
    }
}

/// Type `hir` and lower it for `config.target`. Typing errors only keep the
/// affected functions out of the output; lowering errors abort.
pub fn compile_module(
    hir: HirModule,
    options: &TypingOptions,
    config: &BackendConfig,
) -> Result<CompileResult, String> {
    let checked = check_module(hir, options);
    emit_mir(&checked, config)
}

pub fn emit_mir(checked: &CheckResult, config: &BackendConfig) -> Result<CompileResult, String> {
    let backend = WasmBackend;
    let output = backend
        .compile_module(&checked.hir, &checked.typing, config)
        .map_err(|err| format!("codegen failed: {err}"))?;
    let failed: Vec<String> = checked
        .typing
        .failed_functions()
        .into_iter()
        .map(str::to_string)
        .collect();
    info!(
        backend = backend.name(),
        functions = output.module.functions.len(),
        failed = failed.len(),
        "compiled module"
    );

    let mut diagnostics = checked.diagnostics.clone();
    diagnostics.extend(output.diagnostics);
    Ok(CompileResult {
        mir: output.module,
        stats: output.stats,
        diagnostics,
        failed,
    })
}

pub fn compile_file(
    input: &Path,
    options: &TypingOptions,
    config: &BackendConfig,
) -> Result<CompileResult, String> {
    let hir = load_module(input)?;
    compile_module(hir, options, config)
}

pub fn emit_diagnostics(diags: &[Diagnostic]) {
    for diag in diags {
        eprintln!("{diag}");
    }
}

pub fn format_diagnostics(prefix: &str, diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return prefix.to_string();
    }

    let rendered = diagnostics
        .iter()
        .map(|d| format!("  - {d}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{prefix}:\n{rendered}")
}

fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| matches!(d.severity, Severity::Error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_hir::HirBuilder;
    use ember_types::{EffectRowId, FunctionType, OperationSpec, ResumeKind, Type};

    fn builder() -> HirBuilder {
        let b = HirBuilder::new();
        b.effect("Tick", Some(1), vec![OperationSpec::new("tick", ResumeKind::Tail)]);
        b.effect("Abort", Some(3), vec![OperationSpec::new("abort", ResumeKind::Resume)]);
        b
    }

    fn counter_module() -> HirModule {
        let b = builder();
        let k = b.continuation("k");
        let body = b.handle(
            b.block(vec![b.perform("tick", vec![]), b.int(7)]),
            vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
            Some(b.unit()),
        );
        let mut counter = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
        counter.exported = true;
        b.finish(vec![counter])
    }

    #[test]
    fn clean_module_compiles() {
        let result = compile_module(
            counter_module(),
            &TypingOptions::default(),
            &BackendConfig::default(),
        )
        .unwrap();
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert!(result.failed.is_empty());
        assert!(result.mir.function("counter$export").is_some());
        assert_eq!(result.stats.function("counter").unwrap().handler_installs, 1);
    }

    #[test]
    fn typing_errors_gate_only_affected_functions() {
        let b = builder();
        let broken = b.function(
            "broken",
            vec![],
            Type::Unit,
            EffectRowId::PURE,
            b.perform("abort", vec![]),
        );
        let caller = b.function(
            "caller",
            vec![],
            Type::Unit,
            EffectRowId::PURE,
            b.call_fn("broken", FunctionType::pure(vec![], Type::Unit), vec![]),
        );
        let fine = b.function("fine", vec![], Type::Int, EffectRowId::PURE, b.int(1));
        let hir = b.finish(vec![broken, caller, fine]);

        let result =
            compile_module(hir, &TypingOptions::default(), &BackendConfig::default()).unwrap();
        assert!(result.has_errors());
        assert_eq!(result.failed, vec!["broken".to_string()]);
        assert!(result.mir.function("caller").is_none());
        assert!(result.mir.function("fine").is_some());
    }

    #[test]
    fn check_records_traces_on_request() {
        let checked = check_module(counter_module(), &TypingOptions { trace: true });
        assert!(!checked.has_errors());
        assert_eq!(checked.traces().len(), 1);
        assert_eq!(checked.traces()[0].function, "counter");
    }

    #[test]
    fn modules_load_from_json() {
        let json = serde_json::to_string(&counter_module()).unwrap();
        let hir = parse_module(&json).unwrap();
        assert_eq!(hir.functions[0].name, "counter");
        assert!(
            parse_module("{ not json")
                .unwrap_err()
                .starts_with("invalid HIR module")
        );
    }

    #[test]
    fn codegen_errors_are_reported_as_strings() {
        let config = BackendConfig {
            target: "riscv64".to_string(),
            ..BackendConfig::default()
        };
        let err = compile_module(counter_module(), &TypingOptions::default(), &config).unwrap_err();
        assert_eq!(err, "codegen failed: unsupported target `riscv64`");
    }

    #[test]
    fn diagnostics_format_as_a_list() {
        assert_eq!(format_diagnostics("typing failed", &[]), "typing failed");
    }
}
