//! Tests for handler typing.
//!
//! Each test builds a small module with the HIR builder, types it with
//! [`check_module`], and inspects diagnostics and the handler metadata
//! written back onto the tree.

use ember_hir::{
    HandleExpr, HirBuilder, HirExpr, HirExprKind, HirFunction, HirModule, SymbolId,
    TailEnforcement,
};
use ember_types::{EffectRowId, OperationSpec, ResumeKind, Type, TypeVarId};

use crate::{HandlerStep, ModuleTyping, TypingOptions, check_module};

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
    let typing = check_module(&mut module, &TypingOptions { trace: true });
    (module, typing)
}

fn codes(typing: &ModuleTyping) -> Vec<&str> {
    typing
        .diagnostics()
        .filter_map(|d| d.code.as_deref())
        .collect()
}

fn handler(function: &HirFunction) -> &HandleExpr {
    match &function.body.kind {
        HirExprKind::Handle(handle) => handle,
        other => panic!("expected a handler body, got {other:?}"),
    }
}

/// `handle { tick(); <tail> } with tick(k) -> <clause>`
fn tick_handler(b: &HirBuilder, clause_body: impl FnOnce(SymbolId) -> HirExpr) -> HirExpr {
    let k = b.continuation("k");
    b.handle(
        b.perform("tick", vec![]),
        vec![b.clause("tick", Some(k), vec![], clause_body(k))],
        None,
    )
}

// ---------------------------------------------------------------------------
// Unhandled effects
// ---------------------------------------------------------------------------

#[test]
fn operation_without_clause_is_unhandled() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.perform("foo", vec![])]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);

    let handler_diag = typing
        .diagnostics()
        .find(|d| d.message.starts_with("handler leaves"))
        .expect("handler-level diagnostic");
    assert_eq!(handler_diag.code.as_deref(), Some("E0401"));
    assert!(handler_diag.message.contains("`foo`"));
}

#[test]
fn matching_clause_handles_operation() {
    let b = builder();
    let k = b.continuation("k");
    let j = b.continuation("j");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.perform("foo", vec![])]),
        vec![
            b.clause("tick", Some(k), vec![], b.resume(k, b.unit())),
            b.clause("foo", Some(j), vec![], b.resume(j, b.int(1))),
        ],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    assert_eq!(typing.functions[0].row, EffectRowId::PURE);

    let meta = handler(&module.functions[0]).meta.as_ref().unwrap();
    assert_eq!(module.rows.display(meta.body_row), "[foo, tick]");
    assert_eq!(meta.row, EffectRowId::PURE);
    // A resumed computation no longer carries the intercepted operations.
    let foo_k = &meta.continuation_types[1];
    assert_eq!(foo_k.params, vec![Type::Int]);
    assert_eq!(*foo_k.ret, Type::Int);
    assert_eq!(foo_k.effects, EffectRowId::PURE);
    assert_eq!(module.symbols.ty(j), Some(&Type::Function(foo_k.clone())));
}

#[test]
fn reraising_clause_is_exempt_from_unhandled_check() {
    let b = builder();
    let body = b.handle(
        b.perform("foo", vec![]),
        vec![b.clause(
            "foo",
            None,
            vec![],
            b.add(b.perform("foo", vec![]), b.int(1)),
        )],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(
        typing
            .diagnostics()
            .all(|d| !d.message.starts_with("handler leaves")),
        "{:?}",
        codes(&typing)
    );
    let meta = handler(&module.functions[0]).meta.as_ref().unwrap();
    assert_eq!(meta.reraised, vec!["foo".to_string()]);
    assert!(module.rows.contains(meta.row, "foo"));
    // The re-raise still escapes the function, which declares no effects.
    assert!(
        typing
            .diagnostics()
            .any(|d| d.message.starts_with("function `f` performs unhandled"))
    );
}

#[test]
fn open_rows_skip_the_unhandled_check() {
    let b = builder();
    let open = b.open_row(&["foo"], 1);
    let callee = ember_types::FunctionType::with_effects(vec![], Type::Int, open);
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.call_fn("g", callee, vec![])]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, open, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let meta = handler(&module.functions[0]).meta.as_ref().unwrap();
    assert!(module.rows.is_open(meta.row));
}

#[test]
fn nested_handler_may_leave_operations_to_outer_handler() {
    let b = builder();
    let k = b.continuation("k");
    let j = b.continuation("j");
    let inner = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.perform("foo", vec![])]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        None,
    );
    let outer = b.handle(
        inner,
        vec![b.clause("foo", Some(j), vec![], b.resume(j, b.int(3)))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, outer);
    let (_, typing) = typed(b, vec![f]);
    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
}

// ---------------------------------------------------------------------------
// End to end: tail operation resumed exactly once
// ---------------------------------------------------------------------------

#[test]
fn tail_clause_resuming_once_is_static() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.int(7)]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        Some(b.unit()),
    );
    let f = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(!typing.has_errors(), "{:?}", codes(&typing));
    let handle = handler(&module.functions[0]);
    let meta = handle.meta.as_ref().unwrap();
    assert!(!module.rows.contains(meta.row, "tick"));
    let info = handle.clauses[0].tail_resumption.unwrap();
    assert_eq!(info.enforcement, TailEnforcement::Static);
    assert_eq!(info.min_calls, 1);
    assert!(!info.escapes);
    assert_eq!(handle.clauses[0].operation.effect.as_deref(), Some("Tick"));
}

#[test]
fn conditional_resume_defers_to_runtime() {
    let b = builder();
    let c = b.param("c", Type::Bool);
    let body = tick_handler(&b, |k| b.if_(b.var(c), b.resume(k, b.unit()), None));
    let f = b.function("f", vec![c], Type::Unit, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let info = handler(&module.functions[0]).clauses[0]
        .tail_resumption
        .unwrap();
    assert_eq!(info.enforcement, TailEnforcement::Runtime);
}

#[test]
fn resume_after_conditional_return_defers_to_runtime() {
    let b = builder();
    let c = b.param("c", Type::Bool);
    let body = tick_handler(&b, |k| {
        b.block(vec![
            b.if_(b.var(c), b.return_(Some(b.unit())), None),
            b.resume(k, b.unit()),
        ])
    });
    let f = b.function("f", vec![c], Type::Unit, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let info = handler(&module.functions[0]).clauses[0]
        .tail_resumption
        .unwrap();
    assert_eq!(info.enforcement, TailEnforcement::Runtime);
    assert_eq!(info.min_calls, 0);
}

#[test]
fn tail_clause_that_never_resumes_is_rejected() {
    let b = builder();
    let body = tick_handler(&b, |_| b.unit());
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert_eq!(codes(&typing), vec!["E0402"]);
}

#[test]
fn tail_clause_that_resumes_twice_is_rejected() {
    let b = builder();
    let body = tick_handler(&b, |k| {
        b.block(vec![b.resume(k, b.unit()), b.resume(k, b.unit())])
    });
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);

    let diag = typing.diagnostics().next().unwrap();
    assert_eq!(diag.code.as_deref(), Some("E0402"));
    assert!(diag.message.contains("at least 2 times"));
}

#[test]
fn looping_resume_is_traced_as_runtime() {
    let b = builder();
    let body = tick_handler(&b, |k| b.loop_(b.resume(k, b.unit())));
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);

    assert_eq!(typing.traces.len(), 1);
    let trace = &typing.traces[0];
    assert_eq!(trace.function, "f");
    let enforcement = trace.steps.iter().find_map(|step| match step {
        HandlerStep::TailEnforcement { enforcement, .. } => Some(*enforcement),
        _ => None,
    });
    assert_eq!(enforcement, Some(TailEnforcement::Runtime));
}

#[test]
fn resuming_a_non_returning_operation_is_rejected() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("abort", vec![]), b.int(1)]),
        vec![b.clause("abort", Some(k), vec![], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert!(codes(&typing).contains(&"E0405"), "{:?}", codes(&typing));
}

#[test]
fn aborting_clause_without_resume_is_fine() {
    let b = builder();
    let body = b.handle(
        b.block(vec![b.perform("abort", vec![]), b.int(1)]),
        vec![b.clause("abort", None, vec![], b.int(0))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
}

// ---------------------------------------------------------------------------
// Generic instantiation
// ---------------------------------------------------------------------------

fn state_builder() -> HirBuilder {
    let b = HirBuilder::new();
    b.effect(
        "State",
        Some(9),
        vec![
            OperationSpec::new("get", ResumeKind::Tail)
                .generic(vec![TypeVarId(0)])
                .returns(Type::Var(TypeVarId(0))),
        ],
    );
    b
}

#[test]
fn perform_sites_must_agree_on_instantiation() {
    let b = state_builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![
            b.perform_generic("get", vec![Type::Int], vec![]),
            b.perform_generic("get", vec![Type::String], vec![]),
        ]),
        vec![b.clause("get", Some(k), vec![], b.resume(k, b.int(0)))],
        None,
    );
    let f = b.function("f", vec![], Type::String, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);

    let diag = typing
        .diagnostics()
        .find(|d| d.code.as_deref() == Some("E0403"))
        .expect("instantiation mismatch");
    assert!(diag.message.contains("<String>"));
    assert_eq!(diag.labels.len(), 1);
}

#[test]
fn agreed_instantiation_types_the_continuation() {
    let b = state_builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.add(
            b.perform_generic("get", vec![Type::Int], vec![]),
            b.perform_generic("get", vec![Type::Int], vec![]),
        ),
        vec![b.clause("get", Some(k), vec![], b.resume(k, b.int(0)))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let meta = handler(&module.functions[0]).meta.as_ref().unwrap();
    let get = module.catalog.overloads("get")[0].id;
    assert_eq!(meta.instantiations.get(&get), Some(&vec![Type::Int]));
    assert_eq!(meta.continuation_types[0].params, vec![Type::Int]);
}

// ---------------------------------------------------------------------------
// Overloaded clauses
// ---------------------------------------------------------------------------

fn emit_builder() -> HirBuilder {
    let b = HirBuilder::new();
    b.effect(
        "Out",
        Some(1),
        vec![OperationSpec::new("emit", ResumeKind::Tail).params(vec![Type::Int])],
    );
    b.effect(
        "Err",
        Some(2),
        vec![OperationSpec::new("emit", ResumeKind::Tail).params(vec![Type::String])],
    );
    b
}

#[test]
fn overloaded_clause_needs_annotations() {
    let b = emit_builder();
    let k = b.continuation("k");
    let x = b.local("x", b.fresh_type_var());
    let body = b.handle(
        b.perform("emit", vec![b.int(1)]),
        vec![b.clause("emit", Some(k), vec![x], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert!(codes(&typing).contains(&"E0801"), "{:?}", codes(&typing));
}

#[test]
fn annotated_clause_selects_one_overload() {
    let b = emit_builder();
    let k = b.continuation("k");
    let x = b.local("x", b.fresh_type_var());
    let body = b.handle(
        b.perform("emit", vec![b.int(1)]),
        vec![b.clause_annotated("emit", Some(k), vec![(x, Type::Int)], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let clause = &handler(&module.functions[0]).clauses[0];
    assert_eq!(clause.operation.effect.as_deref(), Some("Out"));
    assert!(clause.operation.resolved.is_some());
    assert_eq!(module.symbols.ty(x), Some(&Type::Int));
}

#[test]
fn annotation_matching_no_overload_is_ambiguous() {
    let b = emit_builder();
    let k = b.continuation("k");
    let x = b.local("x", b.fresh_type_var());
    let body = b.handle(
        b.perform("emit", vec![b.int(1)]),
        vec![b.clause_annotated("emit", Some(k), vec![(x, Type::Float)], b.resume(k, b.unit()))],
        None,
    );
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);

    let diag = typing
        .diagnostics()
        .find(|d| d.code.as_deref() == Some("E0404"))
        .expect("no-match diagnostic");
    assert!(diag.help.as_deref().unwrap_or_default().contains("candidates"));
}

// ---------------------------------------------------------------------------
// Clause shape and result types
// ---------------------------------------------------------------------------

#[test]
fn duplicate_clause_is_reported() {
    let b = builder();
    let k = b.continuation("k");
    let j = b.continuation("j");
    let body = b.handle(
        b.perform("tick", vec![]),
        vec![
            b.clause("tick", Some(k), vec![], b.resume(k, b.unit())),
            b.clause("tick", Some(j), vec![], b.resume(j, b.unit())),
        ],
        None,
    );
    let f = b.function("f", vec![], Type::Unit, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert_eq!(codes(&typing), vec!["E0012"]);
}

#[test]
fn clause_result_must_match_handler_result() {
    let b = builder();
    let body = b.handle(
        b.block(vec![b.perform("abort", vec![]), b.int(1)]),
        vec![b.clause("abort", None, vec![], b.string("oops"))],
        None,
    );
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert_eq!(codes(&typing), vec!["E0001"]);
}

#[test]
fn finally_must_be_unit_or_body_type() {
    let b = builder();
    let body = b.handle(b.int(1), vec![], Some(b.string("cleanup")));
    let f = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
    let (_, typing) = typed(b, vec![f]);
    assert_eq!(codes(&typing), vec!["E0001"]);
}

#[test]
fn finally_effects_compose_into_handler_row() {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.perform("tick", vec![]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        Some(b.block(vec![b.perform("foo", vec![]), b.unit()])),
    );
    let row = b.row(&["foo"]);
    let f = b.function("f", vec![], Type::Unit, row, body);
    let (module, typing) = typed(b, vec![f]);

    assert!(codes(&typing).is_empty(), "{:?}", codes(&typing));
    let meta = handler(&module.functions[0]).meta.as_ref().unwrap();
    assert_eq!(module.rows.display(meta.row), "[foo]");
}
