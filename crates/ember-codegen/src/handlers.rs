//! Handler lowering.
//!
//! A `handle` expression becomes a handful of functions named after it
//! (`{owner}$h{id}`):
//!
//! * `$body` runs the handled computation under the new frames;
//! * `$clause{i}` runs one operation clause;
//! * `$run` inspects the body's outcome, dispatches resumable requests for
//!   this handler to their clause and forwards the rest outward;
//! * `$rerun` re-enters the handler when a continuation captured by `$run`
//!   is resumed.
//!
//! The inline install code builds one frame per clause, chained onto the
//! current handler top, unless the innermost frame already carries this
//! handler's label.

use ember_hir::{ExprId, HandleExpr, HandlerMeta, HirExpr, SymbolId, TailEnforcement, handler_captures};
use ember_mir::{FunctionBuilder, FunctionKind, LayoutId, MirField, MirType, MirValueId, TrapCode};
use ember_types::ResumeKind;
use tracing::debug;

use crate::CodegenError;
use crate::TailGuardPolicy;
use crate::abi;
use crate::context::label_hash;
use crate::lower::{BodyLowerer, BodyPlan, ClausePrologue, Prologue, emit_body};

type Result<T> = std::result::Result<T, CodegenError>;

struct HandlerShape {
    base: String,
    env_layout: LayoutId,
    captures: Vec<SymbolId>,
    clauses: Vec<ClauseSite>,
    label: i64,
}

/// A clause as the install and dispatch code see it.
struct ClauseSite {
    function: String,
    effect_id: u32,
    op_index: u32,
    kind: ResumeKind,
}

impl<'c, 'h> BodyLowerer<'c, 'h> {
    pub(crate) fn handle(&mut self, e: &'h HirExpr, handle: &'h HandleExpr) -> Result<MirValueId> {
        let meta = handle
            .meta
            .as_ref()
            .ok_or_else(|| CodegenError::MissingHandlerMeta {
                function: self.owner.clone(),
                expr: e.id,
            })?;
        let base = format!("{}$h{}", self.owner, e.id.0);
        let captures: Vec<SymbolId> = handler_captures(handle).into_iter().collect();
        let mut fields = vec![
            MirField::new("saved", MirType::Ref),
            MirField::new("top", MirType::Ref),
        ];
        fields.extend(
            captures
                .iter()
                .map(|s| MirField::new(self.hir.symbols.name(*s), self.symbol_type(*s))),
        );
        let env_layout =
            self.cx
                .env_layout(e.id, &self.scope.instance, format!("{base}$env"), fields);
        let label = match &handle.label {
            Some(label) => label_hash(label),
            None => label_hash(&default_label(&self.scope.instance, e.id)),
        };

        let clauses = self.emit_clauses(&base, handle, meta, env_layout, &captures)?;
        emit_body(
            self.cx,
            self.scope,
            BodyPlan {
                name: format!("{base}$body"),
                kind: FunctionKind::HandlerBody,
                params: vec![(Some("env".to_string()), MirType::Ref)],
                ret: self.scope.mir(&meta.result_ty),
                unit_result: self.scope.apply(&meta.result_ty).is_unit(),
                effectful: true,
                row: meta.body_row,
                body: &handle.body,
                prologue: Prologue::HandlerBody {
                    env_layout,
                    captures: captures.clone(),
                },
            },
        )?;
        self.emit_run(&base, env_layout, &clauses, meta);
        self.emit_rerun(&base, env_layout, meta);

        let shape = HandlerShape {
            base,
            env_layout,
            captures,
            clauses,
            label,
        };
        self.install(e, handle, meta, &shape)
    }

    fn emit_clauses(
        &mut self,
        base: &str,
        handle: &'h HandleExpr,
        meta: &HandlerMeta,
        env_layout: LayoutId,
        captures: &[SymbolId],
    ) -> Result<Vec<ClauseSite>> {
        let mut sites = Vec::with_capacity(handle.clauses.len());
        for (i, clause) in handle.clauses.iter().enumerate() {
            let unresolved = || CodegenError::UnresolvedOperation {
                function: self.owner.clone(),
                operation: clause.operation.name.clone(),
            };
            let op_id = clause.operation.resolved.ok_or_else(unresolved)?;
            let op = self.hir.catalog.operation(op_id).ok_or_else(unresolved)?;
            let (bundle, bundle_types) = self.cx.bundle_layout(op);
            let effect_id = self.cx.effect_id(&op.effect);
            let guard_check = op.resumable == ResumeKind::Tail
                && (self.cx.config.tail_guards == TailGuardPolicy::AlwaysRuntime
                    || clause
                        .tail_resumption
                        .as_ref()
                        .is_none_or(|info| info.enforcement == TailEnforcement::Runtime));
            let (ret, unit_result) = match op.resumable {
                ResumeKind::Tail => (MirType::Any, false),
                ResumeKind::Resume => (
                    self.scope.mir(&meta.result_ty),
                    self.scope.apply(&meta.result_ty).is_unit(),
                ),
            };
            let function = format!("{base}$clause{i}");
            emit_body(
                self.cx,
                self.scope,
                BodyPlan {
                    name: function.clone(),
                    kind: FunctionKind::HandlerClause,
                    params: vec![
                        (Some("env".to_string()), MirType::Ref),
                        (Some("request".to_string()), MirType::Ref),
                    ],
                    ret,
                    unit_result,
                    effectful: true,
                    row: meta.row,
                    body: &clause.body,
                    prologue: Prologue::Clause(ClausePrologue {
                        env_layout,
                        captures: captures.to_vec(),
                        effect_id,
                        op_index: op.index,
                        bundle,
                        bundle_types,
                        params: clause.params.iter().map(|p| p.symbol).collect(),
                        continuation: clause.continuation,
                        resumable: op.resumable,
                        guard_check,
                        rerun: format!("{base}$rerun"),
                    }),
                },
            )?;
            self.cx.module.table_index(&function);
            sites.push(ClauseSite {
                function,
                effect_id,
                op_index: op.index,
                kind: op.resumable,
            });
        }
        Ok(sites)
    }

    /// Bind a clause's request, continuation and arguments.
    pub(crate) fn clause_prologue(&mut self, clause: &ClausePrologue) -> Result<()> {
        let abi = self.abi();
        let env = self.b.param(self.param_base);
        let request = self.b.param(self.param_base + 1);

        let effect = self
            .b
            .struct_get(abi.request, request, abi::request::EFFECT, MirType::I32);
        let expected = self.b.const_i32(clause.effect_id as i32);
        let same_effect = self.eq(effect, expected);
        self.b.trap_unless(same_effect, TrapCode::OperationMismatch);
        let op = self
            .b
            .struct_get(abi.request, request, abi::request::OP, MirType::I32);
        let expected = self.b.const_i32(clause.op_index as i32);
        let same_op = self.eq(op, expected);
        self.b.trap_unless(same_op, TrapCode::OperationMismatch);

        self.load_captures(
            clause.env_layout,
            env,
            &clause.captures,
            abi::env::FIRST_CAPTURE,
        )?;

        let guard = self
            .b
            .struct_get(abi.request, request, abi::request::GUARD, MirType::Ref);
        let token = match clause.resumable {
            ResumeKind::Resume => {
                let chain = self
                    .b
                    .struct_get(abi.request, request, abi::request::CONT, MirType::Ref);
                let run = self.b.func_ref(&clause.rerun);
                self.b.struct_new(abi.token, vec![chain, run, env, guard])
            }
            ResumeKind::Tail => {
                let chain = self.b.null();
                let run = self.b.zero(MirType::FuncRef);
                self.b.struct_new(abi.token, vec![chain, run, env, guard])
            }
        };
        if let Some(k) = clause.continuation {
            self.bind(k, token)?;
        }

        let args = self
            .b
            .struct_get(abi.request, request, abi::request::ARGS, MirType::Ref);
        for (i, (symbol, ty)) in clause.params.iter().zip(&clause.bundle_types).enumerate() {
            let value = self.b.struct_get(clause.bundle, args, i as u32, *ty);
            self.bind(*symbol, value)?;
        }

        if clause.guard_check {
            self.guard = Some(guard);
            self.held.push(guard);
            self.cx.stats_mut(&self.owner).tail_guard_checks += 1;
        }
        Ok(())
    }

    fn emit_run(&mut self, base: &str, env_layout: LayoutId, clauses: &[ClauseSite], meta: &HandlerMeta) {
        let abi = self.abi();
        let name = format!("{base}$run");
        let rerun = format!("{base}$rerun");
        let mut b = FunctionBuilder::new(
            &name,
            FunctionKind::HandlerRun,
            vec![
                (Some("frame".to_string()), MirType::Ref),
                (Some("env".to_string()), MirType::Ref),
                (Some("outcome".to_string()), MirType::Ref),
            ],
            MirType::Ref,
            true,
            self.hir.rows.get(meta.row).clone(),
        );
        let (env, outcome) = (b.param(1), b.param(2));

        let tag = b.struct_get(abi.outcome, outcome, abi::outcome::TAG, MirType::I32);
        let done_tag = b.const_i32(abi::OUTCOME_DONE);
        let finished = b.binary(ember_hir::BinOp::Eq, tag, done_tag, MirType::I32);
        let done = b.new_block();
        let check = b.new_block();
        b.branch(finished, done, check);

        b.switch_to(done);
        b.ret(Some(outcome));

        b.switch_to(check);
        let request = b.struct_get(abi.outcome, outcome, abi::outcome::REQUEST, MirType::Ref);
        let effect = b.struct_get(abi.request, request, abi::request::EFFECT, MirType::I32);
        let op = b.struct_get(abi.request, request, abi::request::OP, MirType::I32);
        for clause in clauses.iter().filter(|c| c.kind == ResumeKind::Resume) {
            let want_effect = b.const_i32(clause.effect_id as i32);
            let effect_ok = b.binary(ember_hir::BinOp::Eq, effect, want_effect, MirType::I32);
            let want_op = b.const_i32(clause.op_index as i32);
            let op_ok = b.binary(ember_hir::BinOp::Eq, op, want_op, MirType::I32);
            let ours = b.binary(ember_hir::BinOp::And, effect_ok, op_ok, MirType::I32);
            let hit = b.new_block();
            let miss = b.new_block();
            b.branch(ours, hit, miss);

            b.switch_to(hit);
            let saved = b.struct_get(env_layout, env, abi::env::SAVED, MirType::Ref);
            b.global_set(abi.handler_top, saved);
            let result = b.call(&clause.function, vec![saved, env, request], MirType::Ref);
            b.ret(Some(result));

            b.switch_to(miss);
        }

        // Not ours: capture the rest of the body as a continuation record and
        // pass the request outward.
        let saved = b.struct_get(env_layout, env, abi::env::SAVED, MirType::Ref);
        b.global_set(abi.handler_top, saved);
        let chain = b.struct_get(abi.request, request, abi::request::CONT, MirType::Ref);
        let args = b.struct_get(abi.request, request, abi::request::ARGS, MirType::Ref);
        let guard = b.struct_get(abi.request, request, abi::request::GUARD, MirType::Ref);
        let run = b.func_ref(&rerun);
        let no_guard = b.null();
        let token = b.struct_new(abi.token, vec![chain, run, env, no_guard]);
        let no_next = b.null();
        let record = b.struct_new(abi.record, vec![token, run, no_next]);
        let forwarded = b.struct_new(abi.request, vec![effect, op, args, record, guard]);
        let outcome = b.call(abi::SUSPENDED, vec![forwarded], MirType::Ref);
        b.ret(Some(outcome));

        self.cx.push_function(b.finish());
    }

    fn emit_rerun(&mut self, base: &str, env_layout: LayoutId, meta: &HandlerMeta) {
        let abi = self.abi();
        let name = format!("{base}$rerun");
        let mut b = FunctionBuilder::new(
            &name,
            FunctionKind::HandlerRerun,
            vec![
                (Some("frame".to_string()), MirType::Ref),
                (Some("token".to_string()), MirType::Ref),
                (Some("input".to_string()), MirType::Any),
            ],
            MirType::Ref,
            true,
            self.hir.rows.get(meta.row).clone(),
        );
        let (token, input) = (b.param(1), b.param(2));
        let env = b.struct_get(abi.token, token, abi::token::ENV, MirType::Ref);
        let top = b.struct_get(env_layout, env, abi::env::TOP, MirType::Ref);
        b.global_set(abi.handler_top, top);
        let chain = b.struct_get(abi.token, token, abi::token::CHAIN, MirType::Ref);
        let outcome = b.call(abi::RESUME, vec![chain, input], MirType::Ref);
        let result = b.call(format!("{base}$run"), vec![top, env, outcome], MirType::Ref);
        b.ret(Some(result));
        self.cx.push_function(b.finish());
        self.cx.module.table_index(&name);
    }

    fn install(
        &mut self,
        e: &'h HirExpr,
        handle: &'h HandleExpr,
        meta: &HandlerMeta,
        shape: &HandlerShape,
    ) -> Result<MirValueId> {
        let abi = self.abi();
        let HandlerShape {
            base,
            env_layout,
            captures,
            clauses,
            label,
        } = shape;
        let (env_layout, label) = (*env_layout, *label);
        let saved = self.current_top();
        let pending_top = self.b.null();
        let mut values = vec![saved, pending_top];
        values.extend(captures.iter().map(|s| self.symbol_local(*s)));
        let env = self.b.struct_new(env_layout, values);

        let top = self.b.named_local(format!("h{}.top", e.id.0), MirType::Ref);
        let fresh = self.b.new_block();
        let check = self.b.new_block();
        let reuse = self.b.new_block();
        let installed = self.b.new_block();
        let outermost = self.b.is_null(saved);
        self.b.branch(outermost, fresh, check);

        self.b.switch_to(check);
        let current = self
            .b
            .struct_get(abi.frame, saved, abi::frame::LABEL, MirType::I64);
        let ours = self.b.const_i64(label);
        let same = self.eq(current, ours);
        self.b.branch(same, reuse, fresh);

        self.b.switch_to(reuse);
        self.b.copy(top, saved);
        self.b.jump_if_open(installed);

        self.b.switch_to(fresh);
        let label_value = self.b.const_i64(label);
        let mut prev = saved;
        for clause in clauses {
            let effect = self.b.const_i32(clause.effect_id as i32);
            let op = self.b.const_i32(clause.op_index as i32);
            let kind = self.b.const_i32(clause.kind.tag() as i32);
            let function = self.b.func_ref(&clause.function);
            prev = self.b.struct_new(
                abi.frame,
                vec![prev, effect, op, kind, function, env, label_value, saved],
            );
        }
        self.b.copy(top, prev);
        self.b.jump_if_open(installed);

        self.b.switch_to(installed);
        self.b.struct_set(env_layout, env, abi::env::TOP, top);
        self.set_top(top);
        let body = self
            .b
            .call(format!("{base}$body"), vec![top, env], MirType::Ref);
        let outcome = self
            .b
            .call(format!("{base}$run"), vec![top, env, body], MirType::Ref);
        {
            let stats = self.cx.stats_mut(&self.owner);
            stats.handler_installs += 1;
            stats.frames += clauses.len();
        }
        debug!(handler = %base, clauses = clauses.len(), "lowered handler");

        self.held.push(env);
        let ty = self.scope.mir(&meta.result_ty);
        let result = self.outcome(e, outcome, saved, ty);
        self.held.pop();
        let result = result?;

        // `finally` runs outside this handler on every path.
        let outer = self
            .b
            .struct_get(env_layout, env, abi::env::SAVED, MirType::Ref);
        self.set_top(outer);
        if let Some(finally) = &handle.finally {
            self.held.push(result);
            let ran = self.expr(finally);
            self.held.pop();
            ran?;
        }
        Ok(result)
    }
}

/// Identity of a handler expression when it has no explicit label.
fn default_label(instance: &str, expr: ExprId) -> String {
    format!("{instance}#{}", expr.0)
}
