//! End-to-end lowering tests.
//!
//! Each test builds a module with the HIR builder, types it, lowers it with
//! the WASM backend and inspects the generated functions. Lowering already
//! validates the MIR, so a successful compile also means the output is
//! well formed.

use ember_hir::{HirBuilder, HirExpr, HirFunction, HirModule, SymbolId};
use ember_infer::{ModuleTyping, TypingOptions, check_module};
use ember_mir::{
    FunctionKind, MirFunction, MirInst, MirModule, MirTerminator, MirType, MirValueId, TrapCode,
};
use ember_types::{EffectRowId, FunctionType, OperationSpec, ResumeKind, Type, TypeVarId};

use crate::{Backend, BackendConfig, CodegenError, CodegenOutput, TailGuardPolicy, WasmBackend};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn builder() -> HirBuilder {
    let b = HirBuilder::new();
    b.effect("Tick", Some(1), vec![OperationSpec::new("tick", ResumeKind::Tail)]);
    b.effect(
        "Foo",
        Some(2),
        vec![OperationSpec::new("foo", ResumeKind::Resume).returns(Type::Int)],
    );
    b.effect("Abort", Some(3), vec![OperationSpec::new("abort", ResumeKind::Resume)]);
    b
}

fn typed(b: HirBuilder, functions: Vec<HirFunction>) -> (HirModule, ModuleTyping) {
    let mut module = b.finish(functions);
    let typing = check_module(&mut module, &TypingOptions { trace: false });
    (module, typing)
}

fn compile_with(
    b: HirBuilder,
    functions: Vec<HirFunction>,
    config: &BackendConfig,
) -> Result<CodegenOutput, CodegenError> {
    let (module, typing) = typed(b, functions);
    WasmBackend.compile_module(&module, &typing, config)
}

fn compile(b: HirBuilder, functions: Vec<HirFunction>) -> CodegenOutput {
    compile_with(b, functions, &BackendConfig::default()).unwrap()
}

fn function<'m>(module: &'m MirModule, name: &str) -> &'m MirFunction {
    module
        .function(name)
        .unwrap_or_else(|| panic!("no function `{name}` in {:?}", names(module)))
}

fn names(module: &MirModule) -> Vec<&str> {
    module.functions.iter().map(|f| f.name.as_str()).collect()
}

/// Generated functions whose name starts with `prefix` and ends with `suffix`.
fn matching<'m>(module: &'m MirModule, prefix: &str, suffix: &str) -> Vec<&'m MirFunction> {
    module
        .functions
        .iter()
        .filter(|f| f.name.starts_with(prefix) && f.name.ends_with(suffix))
        .collect()
}

fn traps<'m>(functions: impl IntoIterator<Item = &'m MirFunction>) -> Vec<TrapCode> {
    functions
        .into_iter()
        .flat_map(|f| &f.blocks)
        .filter_map(|block| match block.terminator {
            MirTerminator::Trap(code) => Some(code),
            _ => None,
        })
        .collect()
}

/// Handler-relevant steps of `f` in block order: calls, and writes to the
/// handler-top global tagged by where the written value came from.
fn handler_steps(module: &MirModule, f: &MirFunction) -> Vec<String> {
    let mut blocks: Vec<_> = f.blocks.iter().collect();
    blocks.sort_by_key(|block| block.id);
    let insts: Vec<&MirInst> = blocks.iter().flat_map(|b| &b.instructions).collect();
    let source = |value: MirValueId| {
        let named = f.locals[value.0 as usize].name.as_deref().unwrap_or("");
        if named.ends_with(".top") {
            return "frames".to_string();
        }
        insts
            .iter()
            .find_map(|inst| match inst {
                MirInst::StructGet {
                    dest,
                    layout,
                    field,
                    ..
                } if *dest == value => {
                    let layout = module.layout(*layout).map_or("", |l| l.name.as_str());
                    if layout.ends_with("$env") && *field == crate::abi::env::SAVED {
                        Some("env.saved".to_string())
                    } else if layout.contains("$state") && *field == crate::abi::state::TOP {
                        Some("state.top".to_string())
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .unwrap_or_else(|| "other".to_string())
    };
    insts
        .iter()
        .filter_map(|inst| match inst {
            MirInst::Call { callee, .. } => Some(format!("call {callee}")),
            MirInst::GlobalSet { value, .. } => Some(format!("top <- {}", source(*value))),
            _ => None,
        })
        .collect()
}

/// Assert `expected` occurs in `steps` in order, allowing other steps between.
fn assert_in_order(steps: &[String], expected: &[String]) {
    let mut rest = steps.iter();
    for want in expected {
        assert!(
            rest.any(|step| step == want),
            "`{want}` missing or out of order in {steps:#?}"
        );
    }
}

fn note(b: &HirBuilder) -> HirExpr {
    b.call_fn("note", FunctionType::pure(vec![], Type::Unit), vec![])
}

fn note_fn(b: &HirBuilder) -> HirFunction {
    b.function("note", vec![], Type::Unit, EffectRowId::PURE, b.unit())
}

/// `handle { tick(); 7 } with tick(k) -> <clause> finally ()`
fn counter(b: &HirBuilder, clause_body: impl FnOnce(SymbolId) -> HirExpr) -> HirExpr {
    let k = b.continuation("k");
    b.handle(
        b.block(vec![b.perform("tick", vec![]), b.int(7)]),
        vec![b.clause("tick", Some(k), vec![], clause_body(k))],
        Some(b.unit()),
    )
}

// ---------------------------------------------------------------------------
// Plain functions
// ---------------------------------------------------------------------------

#[test]
fn pure_function_lowers_directly() {
    let b = builder();
    let x = b.param("x", Type::Int);
    let body = b.add(b.var(x), b.int(1));
    let f = b.function("inc", vec![x], Type::Int, EffectRowId::PURE, body);
    let out = compile(b, vec![f]);

    let inc = function(&out.module, "inc");
    assert_eq!(inc.kind, FunctionKind::User);
    assert!(!inc.signature.effectful);
    assert_eq!(inc.signature.params, vec![MirType::I64]);
    assert!(matching(&out.module, "inc$", "").is_empty());
    assert_eq!(out.stats.function("inc").unwrap().handler_installs, 0);
}

#[test]
fn generic_function_is_emitted_per_instantiation() {
    let b = builder();
    let t = TypeVarId(0);
    let x = b.param("x", Type::Var(t));
    let mut id = b.function("id", vec![x], Type::Var(t), EffectRowId::PURE, b.var(x));
    id.type_params = vec![t];
    id.instantiations = vec![vec![Type::Int], vec![Type::Bool]];
    let out = compile(b, vec![id]);

    assert!(out.module.function("id").is_none());
    assert_eq!(function(&out.module, "id<Int>").signature.ret, MirType::I64);
    assert!(out.module.function("id<Bool>").is_some());
}

#[test]
fn effectful_function_with_site_becomes_state_machine() {
    let b = builder();
    let row = b.row(&["foo"]);
    let body = b.add(b.perform("foo", vec![]), b.int(1));
    let g = b.function("g", vec![], Type::Int, row, body);
    let out = compile(b, vec![g]);

    let entry = function(&out.module, "g");
    assert_eq!(entry.kind, FunctionKind::User);
    assert!(entry.signature.effectful);
    assert_eq!(entry.signature.params, vec![MirType::Ref]);
    assert_eq!(function(&out.module, "g$sm").kind, FunctionKind::StateMachine);
    assert_eq!(function(&out.module, "g$resume").kind, FunctionKind::Resume);
    assert!(out.module.table.iter().any(|f| f == "g$resume"));
    assert!(out.module.layout_named("g$state0").is_some());

    let stats = out.stats.function("g").unwrap();
    assert_eq!(stats.sites, 1);
    assert_eq!(stats.suspension_points, 1);
    assert!(traps([function(&out.module, "g$sm")]).contains(&TrapCode::MalformedResume));
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[test]
fn tail_handler_lowers_to_handler_functions() {
    let b = builder();
    let body = counter(&b, |k| b.resume(k, b.unit()));
    let f = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
    let out = compile(b, vec![f]);
    let module = &out.module;

    assert!(!function(module, "counter").signature.effectful);
    assert_eq!(matching(module, "counter$h", "$body").len(), 1);
    assert_eq!(matching(module, "counter$h", "$clause0").len(), 1);
    assert_eq!(matching(module, "counter$h", "$run")[0].kind, FunctionKind::HandlerRun);
    let rerun = matching(module, "counter$h", "$rerun");
    assert_eq!(rerun[0].kind, FunctionKind::HandlerRerun);
    assert!(module.table.contains(&rerun[0].name));

    let stats = out.stats.function("counter").unwrap();
    assert_eq!(stats.handler_installs, 1);
    assert_eq!(stats.frames, 1);
    assert_eq!(out.stats.total().tail_guard_checks, 0);
    assert!(traps(matching(module, "counter$h", "")).contains(&TrapCode::OperationMismatch));
}

#[test]
fn always_runtime_policy_guards_proven_tail_clauses() {
    let b = builder();
    let body = counter(&b, |k| b.resume(k, b.unit()));
    let f = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
    let config = BackendConfig {
        tail_guards: TailGuardPolicy::AlwaysRuntime,
        ..BackendConfig::default()
    };
    let out = compile_with(b, vec![f], &config).unwrap();

    assert_eq!(out.stats.total().tail_guard_checks, 1);
    assert!(traps(matching(&out.module, "counter$h", "")).contains(&TrapCode::TailGuardMismatch));
}

#[test]
fn conditional_tail_resume_gets_runtime_guard() {
    let b = builder();
    let c = b.param("c", Type::Bool);
    let body = counter(&b, |k| b.if_(b.var(c), b.resume(k, b.unit()), None));
    let f = b.function("f", vec![c], Type::Int, EffectRowId::PURE, body);
    let out = compile(b, vec![f]);

    assert_eq!(out.stats.total().tail_guard_checks, 1);
    assert!(traps(matching(&out.module, "f$h", "")).contains(&TrapCode::TailGuardMismatch));
}

#[test]
fn resumable_handler_suspends_body_and_clause() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.add(b.perform("foo", vec![]), b.int(1)),
        vec![b.clause("foo", Some(k), vec![], b.resume(k, b.int(41)))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let out = compile(b, vec![f]);
    let module = &out.module;

    assert_eq!(matching(module, "f$h", "$body$sm").len(), 1);
    let body_resume = matching(module, "f$h", "$body$resume");
    assert_eq!(body_resume.len(), 1);
    assert!(module.table.contains(&body_resume[0].name));
    assert_eq!(matching(module, "f$h", "$clause0$sm").len(), 1);
    assert_eq!(
        matching(module, "f$h", "$clause0")[0].kind,
        FunctionKind::HandlerClause
    );
    assert!(out.stats.total().suspension_points >= 2);
    assert_eq!(out.stats.function("f").unwrap().handler_installs, 1);
}

#[test]
fn finally_runs_after_the_handler_scope_is_left() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.int(7)]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        Some(note(&b)),
    );
    let f = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
    let note_f = note_fn(&b);
    let out = compile(b, vec![f, note_f]);
    let module = &out.module;

    let base = matching(module, "counter$h", "$body")[0]
        .name
        .trim_end_matches("$body")
        .to_string();
    let steps = handler_steps(module, function(module, "counter"));
    assert_in_order(
        &steps,
        &[
            "top <- frames".to_string(),
            format!("call {base}$body"),
            format!("call {base}$run"),
            "top <- env.saved".to_string(),
            "call note".to_string(),
        ],
    );
    // Nothing reinstalls this handler's frames once `finally` starts.
    let finally_at = steps.iter().position(|s| s == "call note").unwrap();
    assert!(!steps[finally_at..].iter().any(|s| s == "top <- frames"));
}

#[test]
fn resumed_handler_site_leaves_scope_before_finally() {
    let b = builder();
    let row = b.row(&["foo"]);
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.perform("foo", vec![])]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        Some(note(&b)),
    );
    let f = b.function("outer", vec![], Type::Int, row, body);
    let note_f = note_fn(&b);
    let out = compile(b, vec![f, note_f]);
    let module = &out.module;

    let machine = function(module, "outer$sm");
    assert_eq!(machine.kind, FunctionKind::StateMachine);
    let base = matching(module, "outer$h", "$body")[0]
        .name
        .trim_end_matches("$body")
        .to_string();
    let steps = handler_steps(module, machine);
    assert_in_order(
        &steps,
        &[
            "top <- frames".to_string(),
            format!("call {base}$body"),
            format!("call {base}$run"),
            "top <- state.top".to_string(),
            "top <- env.saved".to_string(),
            "call note".to_string(),
        ],
    );
    assert_eq!(out.stats.function("outer").unwrap().handler_installs, 1);
}

#[test]
fn missing_handler_meta_is_reported() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.perform("foo", vec![]),
        vec![b.clause("foo", Some(k), vec![], b.resume(k, b.int(1)))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    // Skip typing so the handler carries no metadata.
    let module = b.finish(vec![f]);
    let typing = ModuleTyping::default();
    let err = WasmBackend
        .compile_module(&module, &typing, &BackendConfig::default())
        .unwrap_err();
    assert!(matches!(err, CodegenError::MissingHandlerMeta { .. }), "{err:?}");
}

// ---------------------------------------------------------------------------
// Exports and module-level behaviour
// ---------------------------------------------------------------------------

#[test]
fn effectful_export_gets_wrapper() {
    let b = builder();
    let row = b.row(&["tick"]);
    let body = b.block(vec![b.perform("tick", vec![]), b.int(1)]);
    let mut run = b.function("run", vec![], Type::Int, row, body);
    run.exported = true;
    let out = compile(b, vec![run]);

    let wrapper = function(&out.module, "run$export");
    assert_eq!(wrapper.kind, FunctionKind::Export);
    assert!(!wrapper.signature.effectful);
    assert_eq!(wrapper.signature.ret, MirType::I64);
    assert!(traps([wrapper]).contains(&TrapCode::SuspendedExport));
    assert_eq!(out.module.exports.len(), 1);
    assert_eq!(out.module.exports[0].name, "run");
    assert_eq!(out.module.exports[0].function, "run$export");
}

#[test]
fn export_wrapper_restores_the_callers_handler_top() {
    let b = builder();
    let row = b.row(&["tick"]);
    let body = b.block(vec![b.perform("tick", vec![]), b.int(1)]);
    let mut run = b.function("run", vec![], Type::Int, row, body);
    run.exported = true;
    let out = compile(b, vec![run]);

    let wrapper = function(&out.module, "run$export");
    let insts: Vec<&MirInst> = wrapper.blocks.iter().flat_map(|b| &b.instructions).collect();
    let previous = insts
        .iter()
        .find_map(|inst| match inst {
            MirInst::GlobalGet { dest, .. } => Some(*dest),
            _ => None,
        })
        .expect("wrapper reads the handler top");
    let call = insts
        .iter()
        .position(|inst| matches!(inst, MirInst::Call { callee, .. } if callee == "run"))
        .unwrap();
    let restore = insts
        .iter()
        .position(|inst| matches!(inst, MirInst::GlobalSet { value, .. } if *value == previous))
        .expect("wrapper restores the handler top");
    assert!(restore > call);
}

#[test]
fn wrappers_can_be_disabled() {
    let b = builder();
    let mut one = b.function("one", vec![], Type::Int, EffectRowId::PURE, b.int(1));
    one.exported = true;
    let config = BackendConfig {
        export_wrappers: false,
        ..BackendConfig::default()
    };
    let out = compile_with(b, vec![one], &config).unwrap();
    assert!(out.module.function("one$export").is_none());
    assert!(out.module.exports.is_empty());
}

#[test]
fn functions_with_typing_errors_and_their_callers_are_skipped() {
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
    let fine = b.function("fine", vec![], Type::Int, EffectRowId::PURE, b.int(2));
    let (module, typing) = typed(b, vec![broken, caller, fine]);
    assert!(typing.has_errors());

    let out = WasmBackend
        .compile_module(&module, &typing, &BackendConfig::default())
        .unwrap();
    assert!(out.module.function("broken").is_none());
    assert!(out.module.function("caller").is_none());
    assert!(out.module.function("fine").is_some());
}

#[test]
fn break_inside_lambda_is_unsupported() {
    let b = builder();
    let body = b.loop_(b.block(vec![
        b.lambda(vec![], b.break_(None)),
        b.break_(None),
    ]));
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let err = compile_with(b, vec![f], &BackendConfig::default()).unwrap_err();
    assert!(matches!(err, CodegenError::Unsupported { .. }), "{err:?}");
}

#[test]
fn unknown_target_is_rejected() {
    let b = builder();
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, b.int(0));
    let config = BackendConfig {
        target: "x86_64".to_string(),
        ..BackendConfig::default()
    };
    let err = compile_with(b, vec![f], &config).unwrap_err();
    assert!(
        matches!(&err, CodegenError::UnsupportedTarget { target } if target == "x86_64"),
        "{err:?}"
    );
}

#[test]
fn pure_export_wrapper_calls_through() {
    let b = builder();
    let x = b.param("x", Type::Int);
    let mut one = b.function("one", vec![x], Type::Int, EffectRowId::PURE, b.var(x));
    one.exported = true;
    let out = compile(b, vec![one]);

    insta::assert_snapshot!(function(&out.module, "one$export").to_string(), @r"
    fn one$export(%0: i64) -> i64 {
      locals %1: i64
    b0:
      %1 = call one(%0)
      return %1
    }
    ");
}
