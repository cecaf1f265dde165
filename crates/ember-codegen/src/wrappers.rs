//! Module functions and their host-facing export wrappers.

use ember_hir::{BinOp, HirFunction};
use ember_mir::{FunctionBuilder, FunctionKind, MirExport, MirType, TrapCode};
use ember_types::{EffectRow, Substitution, Type};
use tracing::debug;

use crate::CodegenError;
use crate::abi;
use crate::context::{CodegenContext, Scope, mangle};
use crate::lower::{BodyPlan, Prologue, emit_body};

/// Emit one instantiation of `function`, plus its export wrapper when the
/// function is exported.
pub(crate) fn emit_function<'h>(
    cx: &mut CodegenContext<'h>,
    function: &'h HirFunction,
    args: &[Type],
) -> Result<(), CodegenError> {
    let scope = Scope {
        instance: mangle(&function.name, args),
        subst: Substitution::from_pairs(&function.type_params, args),
    };
    let params = signature(cx, &scope, function);
    let ret = scope.apply(&function.ret);
    let effectful = !function.effects.is_pure();
    debug!(function = %scope.instance, effectful, "lowering function");
    emit_body(
        cx,
        &scope,
        BodyPlan {
            name: scope.instance.clone(),
            kind: FunctionKind::User,
            params,
            ret: scope.mir(&ret),
            unit_result: ret.is_unit(),
            effectful,
            row: function.effects,
            body: &function.body,
            prologue: Prologue::Params(function.params.iter().map(|p| p.symbol).collect()),
        },
    )?;
    if function.exported && cx.config.export_wrappers {
        emit_export(cx, &scope, function, effectful);
    }
    Ok(())
}

fn signature(cx: &CodegenContext<'_>, scope: &Scope, function: &HirFunction) -> Vec<(Option<String>, MirType)> {
    function
        .params
        .iter()
        .map(|p| {
            (
                Some(cx.hir.symbols.name(p.symbol).to_string()),
                scope.mir(&p.ty),
            )
        })
        .collect()
}

/// `{name}$export`: the host entry point. Effectful functions start with an
/// empty handler stack and must finish without suspending.
fn emit_export(cx: &mut CodegenContext<'_>, scope: &Scope, function: &HirFunction, effectful: bool) {
    let name = format!("{}$export", scope.instance);
    let params = signature(cx, scope, function);
    let ret = scope.mir(&function.ret);
    let count = params.len();
    let mut b = FunctionBuilder::new(
        &name,
        FunctionKind::Export,
        params,
        ret,
        false,
        EffectRow::default(),
    );
    let mut args: Vec<_> = (0..count).map(|i| b.param(i)).collect();
    let value = if effectful {
        let previous = b.global_get(cx.abi.handler_top, MirType::Ref);
        let no_frame = b.null();
        b.global_set(cx.abi.handler_top, no_frame);
        args.insert(0, no_frame);
        let outcome = b.call(&scope.instance, args, MirType::Ref);
        b.global_set(cx.abi.handler_top, previous);
        let tag = b.struct_get(cx.abi.outcome, outcome, abi::outcome::TAG, MirType::I32);
        let done = b.const_i32(abi::OUTCOME_DONE);
        let finished = b.binary(BinOp::Eq, tag, done, MirType::I32);
        b.trap_unless(finished, TrapCode::SuspendedExport);
        let value = b.struct_get(cx.abi.outcome, outcome, abi::outcome::VALUE, MirType::Any);
        b.unboxed(value, ret)
    } else {
        b.call(&scope.instance, args, ret)
    };
    b.ret(Some(value));
    cx.push_function(b.finish());
    cx.module.exports.push(MirExport {
        name: scope.instance.clone(),
        function: name,
    });
}
