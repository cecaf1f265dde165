//! Lowering of one HIR body into MIR.
//!
//! Every body is emitted in one of three shapes:
//!
//! * a plain function when it is not compiled with the effect ABI;
//! * an effect-ABI entry plus a direct `_impl` twin when no expression in it
//!   can suspend;
//! * a state machine otherwise: `f$sm` holds the code, `f` starts it and
//!   `f$resume` re-enters it from a saved state record.
//!
//! Inside a state machine every site branches on the callee's outcome. The
//! suspended path spills whatever liveness reports into a per-site state
//! record and appends it to the travelling request; the resume path reloads
//! those values into the same registers and joins the done path.

use std::collections::{BTreeMap, BTreeSet};

use ember_hir::{
    BinOp, Callee, CondArm, ExprId, FunctionRef, HirExpr, HirExprKind, HirLit, HirModule,
    HirParam, HirPattern, MatchArm, OperationRef, SymbolId, free_symbols,
};
use ember_mir::{
    FunctionBuilder, FunctionKind, LayoutId, LivenessResult, MirBlockId, MirField, MirFunction,
    MirInst, MirLiteral, MirTerminator, MirType, MirValueId, TrapCode, analyze_liveness,
};
use ember_types::{EffectRowId, ResumeKind, Type};
use tracing::trace;

use crate::CodegenError;
use crate::abi::{self, Abi};
use crate::context::{CodegenContext, Scope, SiteRules, mir_type};

type Result<T> = std::result::Result<T, CodegenError>;

/// Machine parameters ahead of a body's own: frame, state record, resume input.
const MACHINE_PARAMS: usize = 3;
const STATE_PARAM: usize = 1;
const INPUT_PARAM: usize = 2;

/// How a body binds its symbols before the first expression runs.
pub(crate) enum Prologue {
    /// Parameters bind one-to-one.
    Params(Vec<SymbolId>),
    HandlerBody {
        env_layout: LayoutId,
        captures: Vec<SymbolId>,
    },
    Clause(ClausePrologue),
    Lambda {
        env_layout: LayoutId,
        captures: Vec<SymbolId>,
        params: Vec<SymbolId>,
    },
}

pub(crate) struct ClausePrologue {
    pub env_layout: LayoutId,
    pub captures: Vec<SymbolId>,
    pub effect_id: u32,
    pub op_index: u32,
    pub bundle: LayoutId,
    pub bundle_types: Vec<MirType>,
    pub params: Vec<SymbolId>,
    pub continuation: Option<SymbolId>,
    pub resumable: ResumeKind,
    /// Check at return that the continuation ran exactly once.
    pub guard_check: bool,
    /// Handler re-entry used by resumable continuation tokens.
    pub rerun: String,
}

/// Everything needed to emit one body.
pub(crate) struct BodyPlan<'h> {
    pub name: String,
    pub kind: FunctionKind,
    /// Parameters after the frame parameter of the effect ABI.
    pub params: Vec<(Option<String>, MirType)>,
    pub ret: MirType,
    /// The body's value is `()` and is returned as such.
    pub unit_result: bool,
    pub effectful: bool,
    pub row: EffectRowId,
    pub body: &'h HirExpr,
    pub prologue: Prologue,
}

/// Emit `plan` into the module in whichever shape it needs.
pub(crate) fn emit_body<'h>(
    cx: &mut CodegenContext<'h>,
    scope: &Scope,
    plan: BodyPlan<'h>,
) -> Result<()> {
    let liveness = if plan.effectful {
        let rules = SiteRules {
            hir: cx.hir,
            tail_continuations: &cx.tail_continuations,
            effect_abi: true,
        };
        analyze_liveness(plan.body, &BTreeSet::new(), &rules)
    } else {
        LivenessResult::default()
    };
    trace!(
        body = %plan.name,
        sites = liveness.sites.len(),
        nodes = liveness.stats.nodes,
        "analyzed liveness"
    );
    cx.stats_mut(&plan.name).sites += liveness.sites.len();
    let row = cx.hir.rows.get(plan.row).clone();

    if !plan.effectful {
        let b = FunctionBuilder::new(
            &plan.name,
            plan.kind,
            plan.params.clone(),
            plan.ret,
            false,
            row,
        );
        let function = BodyLowerer::new(cx, scope, &plan, b, 0, None, liveness).run(&plan)?;
        cx.push_function(function);
        return Ok(());
    }

    let mut entry_params = vec![(Some("frame".to_string()), MirType::Ref)];
    entry_params.extend(plan.params.iter().cloned());

    if liveness.sites.is_empty() {
        let impl_name = format!("{}_impl", plan.name);
        let b = FunctionBuilder::new(
            &impl_name,
            FunctionKind::Impl,
            plan.params.clone(),
            plan.ret,
            false,
            row.clone(),
        );
        let function = BodyLowerer::new(cx, scope, &plan, b, 0, None, liveness).run(&plan)?;
        cx.push_function(function);

        let mut b = FunctionBuilder::new(&plan.name, plan.kind, entry_params, MirType::Ref, true, row);
        let args = (1..=plan.params.len()).map(|i| b.param(i)).collect();
        let value = b.call(&impl_name, args, plan.ret);
        let boxed = b.boxed(value);
        let outcome = b.call(abi::DONE, vec![boxed], MirType::Ref);
        b.ret(Some(outcome));
        cx.push_function(b.finish());
        return Ok(());
    }

    let sm_name = format!("{}$sm", plan.name);
    let resume_name = format!("{}$resume", plan.name);
    let machine_head = vec![
        (Some("frame".to_string()), MirType::Ref),
        (Some("state".to_string()), MirType::Ref),
        (Some("input".to_string()), MirType::Any),
    ];

    let mut sm_params = machine_head.clone();
    sm_params.extend(plan.params.iter().cloned());
    let b = FunctionBuilder::new(
        &sm_name,
        FunctionKind::StateMachine,
        sm_params,
        MirType::Ref,
        true,
        row.clone(),
    );
    let machine = Machine {
        resume_name: resume_name.clone(),
        dispatch: None,
        resumes: Vec::new(),
    };
    let function =
        BodyLowerer::new(cx, scope, &plan, b, MACHINE_PARAMS, Some(machine), liveness).run(&plan)?;
    cx.push_function(function);

    let mut b = FunctionBuilder::new(
        &resume_name,
        FunctionKind::Resume,
        machine_head,
        MirType::Ref,
        true,
        row.clone(),
    );
    let mut args: Vec<MirValueId> = (0..MACHINE_PARAMS).map(|i| b.param(i)).collect();
    for (_, ty) in &plan.params {
        args.push(b.zero(*ty));
    }
    let outcome = b.call(&sm_name, args, MirType::Ref);
    b.ret(Some(outcome));
    cx.push_function(b.finish());
    cx.module.table_index(&resume_name);

    let mut b = FunctionBuilder::new(&plan.name, plan.kind, entry_params, MirType::Ref, true, row);
    let frame = b.param(0);
    let state = b.null();
    let input = b.zero(MirType::Any);
    let mut args = vec![frame, state, input];
    args.extend((1..=plan.params.len()).map(|i| b.param(i)));
    let outcome = b.call(&sm_name, args, MirType::Ref);
    b.ret(Some(outcome));
    cx.push_function(b.finish());
    Ok(())
}

pub(crate) struct Machine {
    pub resume_name: String,
    pub dispatch: Option<MirBlockId>,
    /// Resume block of each site, indexed by the site number in its state.
    pub resumes: Vec<MirBlockId>,
}

/// An operand evaluated into a register while its siblings are still pending.
pub(crate) struct PendingOperand {
    pub owner: ExprId,
    pub index: usize,
    pub value: MirValueId,
}

pub(crate) struct LoopTarget {
    pub head: MirBlockId,
    pub exit: MirBlockId,
}

pub(crate) struct BodyLowerer<'c, 'h> {
    pub cx: &'c mut CodegenContext<'h>,
    pub scope: &'c Scope,
    pub hir: &'h HirModule,
    pub b: FunctionBuilder,
    /// Name of the body; nested functions and state layouts derive from it.
    pub owner: String,
    pub param_base: usize,
    pub ret: MirType,
    pub unit_result: bool,
    pub machine: Option<Machine>,
    pub liveness: LivenessResult,
    pub symbols: BTreeMap<SymbolId, MirValueId>,
    pub pending: Vec<PendingOperand>,
    /// Registers outside any symbol that must survive every site.
    pub held: Vec<MirValueId>,
    pub loops: Vec<LoopTarget>,
    pub guard: Option<MirValueId>,
}

impl<'c, 'h> BodyLowerer<'c, 'h> {
    fn new(
        cx: &'c mut CodegenContext<'h>,
        scope: &'c Scope,
        plan: &BodyPlan<'h>,
        b: FunctionBuilder,
        param_base: usize,
        machine: Option<Machine>,
        liveness: LivenessResult,
    ) -> Self {
        let hir = cx.hir;
        Self {
            cx,
            scope,
            hir,
            b,
            owner: plan.name.clone(),
            param_base,
            ret: plan.ret,
            unit_result: plan.unit_result,
            machine,
            liveness,
            symbols: BTreeMap::new(),
            pending: Vec::new(),
            held: Vec::new(),
            loops: Vec::new(),
            guard: None,
        }
    }

    fn run(mut self, plan: &BodyPlan<'h>) -> Result<MirFunction> {
        if self.machine.is_some() {
            let state = self.b.param(STATE_PARAM);
            let fresh = self.b.is_null(state);
            let start = self.b.new_block();
            let dispatch = self.b.new_block();
            self.b.branch(fresh, start, dispatch);
            if let Some(machine) = &mut self.machine {
                machine.dispatch = Some(dispatch);
            }
            self.b.switch_to(start);
        }

        self.prologue(&plan.prologue)?;
        let value = self.expr(plan.body)?;
        if !self.b.is_terminated() {
            self.emit_return(value)?;
        }

        if let Some(machine) = self.machine.take()
            && let Some(dispatch) = machine.dispatch
        {
            self.b.switch_to(dispatch);
            let state = self.b.param(STATE_PARAM);
            let site = self
                .b
                .struct_get(self.cx.abi.state, state, abi::state::SITE, MirType::I32);
            let malformed = self.b.new_block();
            self.b.terminate(MirTerminator::Switch {
                value: site,
                targets: machine.resumes,
                default: malformed,
            });
            self.b.switch_to(malformed);
            self.b.trap(TrapCode::MalformedResume);
        }
        Ok(self.b.finish())
    }

    fn prologue(&mut self, prologue: &Prologue) -> Result<()> {
        match prologue {
            Prologue::Params(symbols) => {
                for (i, symbol) in symbols.iter().enumerate() {
                    let param = self.b.param(self.param_base + i);
                    self.bind(*symbol, param)?;
                }
                Ok(())
            }
            Prologue::HandlerBody {
                env_layout,
                captures,
            } => {
                let env = self.b.param(self.param_base);
                self.load_captures(*env_layout, env, captures, abi::env::FIRST_CAPTURE)
            }
            Prologue::Lambda {
                env_layout,
                captures,
                params,
            } => {
                let env = self.b.param(self.param_base);
                self.load_captures(*env_layout, env, captures, 0)?;
                for (i, symbol) in params.iter().enumerate() {
                    let param = self.b.param(self.param_base + 1 + i);
                    self.bind(*symbol, param)?;
                }
                Ok(())
            }
            Prologue::Clause(clause) => self.clause_prologue(clause),
        }
    }

    pub(crate) fn load_captures(
        &mut self,
        layout: LayoutId,
        env: MirValueId,
        captures: &[SymbolId],
        first: u32,
    ) -> Result<()> {
        for (i, symbol) in captures.iter().enumerate() {
            let ty = self.symbol_type(*symbol);
            let value = self.b.struct_get(layout, env, first + i as u32, ty);
            self.bind(*symbol, value)?;
        }
        Ok(())
    }

    // -- values -------------------------------------------------------------

    pub(crate) fn abi(&self) -> Abi {
        self.cx.abi
    }

    pub(crate) fn unit(&mut self) -> MirValueId {
        self.b.const_i32(0)
    }

    pub(crate) fn current_top(&mut self) -> MirValueId {
        let top = self.abi().handler_top;
        self.b.global_get(top, MirType::Ref)
    }

    pub(crate) fn set_top(&mut self, value: MirValueId) {
        let top = self.abi().handler_top;
        self.b.global_set(top, value);
    }

    pub(crate) fn symbol_type(&self, symbol: SymbolId) -> MirType {
        self.hir
            .symbols
            .ty(symbol)
            .map(|ty| self.scope.mir(ty))
            .unwrap_or(MirType::Any)
    }

    pub(crate) fn symbol_local(&mut self, symbol: SymbolId) -> MirValueId {
        if let Some(local) = self.symbols.get(&symbol) {
            return *local;
        }
        let ty = self.symbol_type(symbol);
        let local = self.b.named_local(self.hir.symbols.name(symbol), ty);
        self.symbols.insert(symbol, local);
        local
    }

    pub(crate) fn bind(&mut self, symbol: SymbolId, value: MirValueId) -> Result<()> {
        let local = self.symbol_local(symbol);
        let ty = self.b.local_type(local);
        let value = self.coerce(value, ty)?;
        self.b.copy(local, value);
        Ok(())
    }

    pub(crate) fn coerce(&mut self, value: MirValueId, to: MirType) -> Result<MirValueId> {
        let from = self.b.local_type(value);
        if from == to {
            return Ok(value);
        }
        if to == MirType::Any {
            return Ok(self.b.boxed(value));
        }
        if from == MirType::Any {
            return Ok(self.b.unboxed(value, to));
        }
        Err(CodegenError::AbiMismatch {
            function: self.owner.clone(),
            detail: format!("cannot use a {from} value as {to}"),
        })
    }

    pub(crate) fn eq(&mut self, left: MirValueId, right: MirValueId) -> MirValueId {
        self.b.binary(BinOp::Eq, left, right, MirType::I32)
    }

    fn literal(&mut self, lit: &HirLit) -> MirValueId {
        match lit {
            HirLit::Int(v) => self.b.const_i64(*v),
            HirLit::Float(v) => self.b.const_literal(MirLiteral::F64(*v), MirType::F64),
            HirLit::Bool(v) => self.b.const_i32(i32::from(*v)),
            HirLit::String(v) => self
                .b
                .const_literal(MirLiteral::String(v.clone()), MirType::Ref),
            HirLit::Unit => self.unit(),
        }
    }

    /// Result register of a branching expression, or `None` when its value
    /// is `()` or it never produces one.
    fn result_slot(&mut self, e: &HirExpr) -> Option<MirValueId> {
        match self.scope.apply(&e.ty) {
            Type::Unit | Type::Never => None,
            ty => Some(self.b.local(mir_type(&ty))),
        }
    }

    fn assign(&mut self, slot: Option<MirValueId>, value: MirValueId) -> Result<()> {
        if let Some(slot) = slot
            && !self.b.is_terminated()
        {
            let ty = self.b.local_type(slot);
            let value = self.coerce(value, ty)?;
            self.b.copy(slot, value);
        }
        Ok(())
    }

    fn slot_value(&mut self, slot: Option<MirValueId>, e: &HirExpr) -> MirValueId {
        match slot {
            Some(slot) => slot,
            None if matches!(e.ty, Type::Never) => self.b.local(MirType::Any),
            None => self.unit(),
        }
    }

    // -- expressions ----------------------------------------------------------

    pub(crate) fn expr(&mut self, e: &'h HirExpr) -> Result<MirValueId> {
        match &e.kind {
            HirExprKind::Lit(lit) => Ok(self.literal(lit)),
            HirExprKind::Var(symbol) => Ok(self.var(*symbol)),
            HirExprKind::Let { symbol, value } | HirExprKind::Assign { symbol, value } => {
                let value = self.expr(value)?;
                self.bind(*symbol, value)?;
                Ok(self.unit())
            }
            HirExprKind::Block(items) => {
                let mut last = None;
                for item in items {
                    last = Some(self.expr(item)?);
                }
                Ok(match last {
                    Some(value) => value,
                    None => self.unit(),
                })
            }
            HirExprKind::Tuple(items) => self.tuple(e, items),
            HirExprKind::Binary { op, left, right } => {
                let values = self.operands(e.id, &[&**left, &**right])?;
                let operand = self.scope.mir(&left.ty);
                let l = self.coerce(values[0], operand)?;
                let r = self.coerce(values[1], operand)?;
                let ty = if op.is_comparison() {
                    MirType::I32
                } else {
                    self.scope.mir(&e.ty)
                };
                Ok(self.b.binary(*op, l, r, ty))
            }
            HirExprKind::Call { callee, args } => match callee {
                Callee::Function(fref) => self.direct_call(e, fref, None, args),
                Callee::Expr(callee) => self.indirect_call(e, callee, args),
            },
            HirExprKind::MethodCall {
                receiver,
                method,
                args,
            } => self.direct_call(e, method, Some(&**receiver), args),
            HirExprKind::Perform {
                operation, args, ..
            } => self.perform(e, operation, args),
            HirExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.if_(e, condition, then_branch, else_branch.as_deref()),
            HirExprKind::Match { scrutinee, arms } => self.match_(e, scrutinee, arms),
            HirExprKind::Cond { arms, default } => self.cond(e, arms, default.as_deref()),
            HirExprKind::Loop { body } => {
                let head = self.b.new_block();
                let exit = self.b.new_block();
                self.b.jump_if_open(head);
                self.b.switch_to(head);
                self.loops.push(LoopTarget { head, exit });
                let result = self.expr(body);
                self.loops.pop();
                result?;
                self.b.jump_if_open(head);
                self.b.switch_to(exit);
                Ok(self.unit())
            }
            HirExprKind::While { condition, body } => {
                let head = self.b.new_block();
                let inner = self.b.new_block();
                let exit = self.b.new_block();
                self.b.jump_if_open(head);
                self.b.switch_to(head);
                let test = self.expr(condition)?;
                let test = self.coerce(test, MirType::I32)?;
                self.b.branch(test, inner, exit);
                self.b.switch_to(inner);
                self.loops.push(LoopTarget { head, exit });
                let result = self.expr(body);
                self.loops.pop();
                result?;
                self.b.jump_if_open(head);
                self.b.switch_to(exit);
                Ok(self.unit())
            }
            HirExprKind::Break(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
                let target = self.loop_target("break")?.exit;
                self.b.terminate(MirTerminator::Jump { target });
                Ok(self.b.local(MirType::Any))
            }
            HirExprKind::Continue => {
                let target = self.loop_target("continue")?.head;
                self.b.terminate(MirTerminator::Jump { target });
                Ok(self.b.local(MirType::Any))
            }
            HirExprKind::Return(value) => {
                let value = match value {
                    Some(value) => self.expr(value)?,
                    None => self.unit(),
                };
                self.emit_return(value)?;
                Ok(self.b.local(MirType::Any))
            }
            HirExprKind::Lambda { params, body } => self.lambda(e, params, body),
            HirExprKind::Handle(handle) => self.handle(e, handle),
        }
    }

    fn loop_target(&self, what: &str) -> Result<&LoopTarget> {
        self.loops.last().ok_or_else(|| CodegenError::Unsupported {
            function: self.owner.clone(),
            detail: format!("`{what}` outside a loop of the same function body"),
        })
    }

    fn var(&mut self, symbol: SymbolId) -> MirValueId {
        let local = self.symbol_local(symbol);
        if self.hir.symbols.is_continuation(symbol) {
            // A continuation used as a value escapes as a closure over its token.
            let effectful = self
                .hir
                .symbols
                .ty(symbol)
                .and_then(Type::as_function)
                .is_some_and(|ft| !ft.effects.is_pure());
            let body = if effectful {
                abi::CONTINUE_CLOSURE
            } else {
                abi::CONTINUE_VALUE
            };
            let function = self.b.func_ref(body);
            let closure = self.abi().closure;
            return self.b.struct_new(closure, vec![function, local]);
        }
        let ty = self.b.local_type(local);
        let copy = self.b.local(ty);
        self.b.copy(copy, local);
        copy
    }

    fn operands(&mut self, owner: ExprId, ops: &[&'h HirExpr]) -> Result<Vec<MirValueId>> {
        self.operands_from(owner, Vec::new(), ops)
    }

    /// Evaluate `ops` left to right after the already evaluated `values`,
    /// keeping each result visible to sites in later operands.
    fn operands_from(
        &mut self,
        owner: ExprId,
        mut values: Vec<MirValueId>,
        ops: &[&'h HirExpr],
    ) -> Result<Vec<MirValueId>> {
        let mark = self.pending.len();
        for (index, value) in values.iter().enumerate() {
            self.pending.push(PendingOperand {
                owner,
                index,
                value: *value,
            });
        }
        let base = values.len();
        for (i, op) in ops.iter().enumerate() {
            let value = self.expr(op)?;
            self.pending.push(PendingOperand {
                owner,
                index: base + i,
                value,
            });
            values.push(value);
        }
        self.pending.truncate(mark);
        Ok(values)
    }

    fn tuple(&mut self, e: &'h HirExpr, items: &'h [HirExpr]) -> Result<MirValueId> {
        let ops: Vec<&HirExpr> = items.iter().collect();
        let values = self.operands(e.id, &ops)?;
        let types: Vec<MirType> = items.iter().map(|item| self.scope.mir(&item.ty)).collect();
        let layout = self.cx.tuple_layout(&types);
        let mut fields = Vec::with_capacity(values.len());
        for (value, ty) in values.into_iter().zip(types) {
            fields.push(self.coerce(value, ty)?);
        }
        Ok(self.b.struct_new(layout, fields))
    }

    fn direct_call(
        &mut self,
        e: &'h HirExpr,
        fref: &FunctionRef,
        receiver: Option<&'h HirExpr>,
        args: &'h [HirExpr],
    ) -> Result<MirValueId> {
        let mut ops: Vec<&'h HirExpr> = receiver.into_iter().collect();
        ops.extend(args.iter());
        let values = self.operands(e.id, &ops)?;
        let target = self.cx.resolve_call(fref, self.scope)?;
        let mut call_args = Vec::with_capacity(values.len() + 1);
        if target.effectful {
            call_args.push(self.current_top());
        }
        for (value, ty) in values.into_iter().zip(target.params.iter().copied()) {
            call_args.push(self.coerce(value, ty)?);
        }
        let want = self.scope.mir(&e.ty);
        let value = if target.effectful {
            let top = call_args[0];
            let outcome = self.b.call(&target.name, call_args, MirType::Ref);
            self.outcome(e, outcome, top, target.ret)?
        } else {
            self.b.call(&target.name, call_args, target.ret)
        };
        self.coerce(value, want)
    }

    fn indirect_call(
        &mut self,
        e: &'h HirExpr,
        callee: &'h HirExpr,
        args: &'h [HirExpr],
    ) -> Result<MirValueId> {
        if let HirExprKind::Var(k) = &callee.kind
            && self.hir.symbols.is_continuation(*k)
        {
            return self.continuation_call(e, *k, args);
        }

        let mut ops = vec![callee];
        ops.extend(args.iter());
        let values = self.operands(e.id, &ops)?;
        let closure = self.coerce(values[0], MirType::Ref)?;
        let layout = self.abi().closure;
        let function = self
            .b
            .struct_get(layout, closure, abi::closure::FN, MirType::FuncRef);
        let env = self
            .b
            .struct_get(layout, closure, abi::closure::ENV, MirType::Ref);
        let mut call_args = vec![env];
        for value in &values[1..] {
            call_args.push(self.b.boxed(*value));
        }

        let want = self.scope.mir(&e.ty);
        let effectful = callee
            .ty
            .as_function()
            .is_some_and(|ft| !ft.effects.is_pure());
        if effectful {
            let top = self.current_top();
            call_args.insert(0, top);
            let outcome = self.b.call_indirect(function, call_args, MirType::Ref);
            self.outcome(e, outcome, top, want)
        } else {
            let value = self.b.call_indirect(function, call_args, MirType::Any);
            Ok(self.b.unboxed(value, want))
        }
    }

    fn continuation_call(
        &mut self,
        e: &'h HirExpr,
        k: SymbolId,
        args: &'h [HirExpr],
    ) -> Result<MirValueId> {
        let local = self.symbol_local(k);
        let token = self.b.local(MirType::Ref);
        self.b.copy(token, local);
        let ops: Vec<&HirExpr> = args.iter().collect();
        let values = self.operands_from(e.id, vec![token], &ops)?;
        let input = match values.get(1) {
            Some(value) => self.b.boxed(*value),
            None => {
                let unit = self.unit();
                self.b.boxed(unit)
            }
        };
        let top = self.current_top();
        let outcome = self
            .b
            .call(abi::CONTINUE, vec![values[0], input], MirType::Ref);
        if self.cx.tail_continuations.contains(&k) {
            return Ok(self.unwrap_outcome(outcome, MirType::Any));
        }
        let want = self.scope.mir(&e.ty);
        self.outcome(e, outcome, top, want)
    }

    fn perform(
        &mut self,
        e: &'h HirExpr,
        operation: &OperationRef,
        args: &'h [HirExpr],
    ) -> Result<MirValueId> {
        let unresolved = || CodegenError::UnresolvedOperation {
            function: self.owner.clone(),
            operation: operation.name.clone(),
        };
        let op_id = operation.resolved.ok_or_else(unresolved)?;
        let op = self.hir.catalog.operation(op_id).ok_or_else(unresolved)?;

        let ops: Vec<&HirExpr> = args.iter().collect();
        let values = self.operands(e.id, &ops)?;
        let (bundle, types) = self.cx.bundle_layout(op);
        let mut fields = Vec::with_capacity(values.len());
        for (value, ty) in values.into_iter().zip(types) {
            fields.push(self.coerce(value, ty)?);
        }
        let bundle = self.b.struct_new(bundle, fields);

        let abi = self.abi();
        let effect_id = self.cx.effect_id(&op.effect);
        let effect = self.b.const_i32(effect_id as i32);
        let op_index = self.b.const_i32(op.index as i32);
        let top = self.current_top();
        let frame = self
            .b
            .call(abi::FIND_FRAME, vec![top, effect, op_index], MirType::Ref);
        let missing = self.b.is_null(frame);
        let no = self.b.const_i32(0);
        let present = self.eq(missing, no);
        self.b.trap_unless(present, TrapCode::UnhandledOperation);

        let want = self.scope.mir(&e.ty);
        match op.resumable {
            ResumeKind::Tail => {
                // The clause runs in place, outside its own handler; the value
                // it passes to the continuation lands in the guard.
                let expected = self.b.const_i32(1);
                let observed = self.b.const_i32(0);
                let nothing = self.b.zero(MirType::Any);
                let guard = self
                    .b
                    .struct_new(abi.guard, vec![expected, observed, nothing]);
                let no_chain = self.b.null();
                let request = self
                    .b
                    .struct_new(abi.request, vec![effect, op_index, bundle, no_chain, guard]);
                let outer = self
                    .b
                    .struct_get(abi.frame, frame, abi::frame::OUTER, MirType::Ref);
                let clause = self
                    .b
                    .struct_get(abi.frame, frame, abi::frame::CLAUSE, MirType::FuncRef);
                let env = self
                    .b
                    .struct_get(abi.frame, frame, abi::frame::ENV, MirType::Ref);
                self.set_top(outer);
                let outcome = self
                    .b
                    .call_indirect(clause, vec![outer, env, request], MirType::Ref);
                self.set_top(top);
                self.held.push(guard);
                let finished = self.outcome(e, outcome, top, MirType::Any);
                self.held.pop();
                finished?;
                let value = self
                    .b
                    .struct_get(abi.guard, guard, abi::guard::VALUE, MirType::Any);
                Ok(self.b.unboxed(value, want))
            }
            ResumeKind::Resume => {
                let no_chain = self.b.null();
                let no_guard = self.b.null();
                let request = self.b.struct_new(
                    abi.request,
                    vec![effect, op_index, bundle, no_chain, no_guard],
                );
                let outcome = self.b.call(abi::SUSPENDED, vec![request], MirType::Ref);
                self.outcome(e, outcome, top, want)
            }
        }
    }

    fn if_(
        &mut self,
        e: &'h HirExpr,
        condition: &'h HirExpr,
        then_branch: &'h HirExpr,
        else_branch: Option<&'h HirExpr>,
    ) -> Result<MirValueId> {
        let test = self.expr(condition)?;
        let test = self.coerce(test, MirType::I32)?;
        let slot = match else_branch {
            Some(_) => self.result_slot(e),
            None => None,
        };
        let then_block = self.b.new_block();
        let else_block = self.b.new_block();
        let join = self.b.new_block();
        self.b.branch(test, then_block, else_block);

        self.b.switch_to(then_block);
        let value = self.expr(then_branch)?;
        self.assign(slot, value)?;
        self.b.jump_if_open(join);

        self.b.switch_to(else_block);
        if let Some(else_branch) = else_branch {
            let value = self.expr(else_branch)?;
            self.assign(slot, value)?;
        }
        self.b.jump_if_open(join);

        self.b.switch_to(join);
        Ok(self.slot_value(slot, e))
    }

    fn match_(
        &mut self,
        e: &'h HirExpr,
        scrutinee: &'h HirExpr,
        arms: &'h [MatchArm],
    ) -> Result<MirValueId> {
        let value = self.expr(scrutinee)?;
        let slot = self.result_slot(e);
        let join = self.b.new_block();
        for arm in arms {
            let next = self.b.new_block();
            match &arm.pattern {
                HirPattern::Wildcard => {}
                HirPattern::Bind(symbol) => self.bind(*symbol, value)?,
                HirPattern::Lit(lit) => {
                    let expected = self.literal(lit);
                    let ty = self.b.local_type(expected);
                    let actual = self.coerce(value, ty)?;
                    let same = self.eq(actual, expected);
                    let body = self.b.new_block();
                    self.b.branch(same, body, next);
                    self.b.switch_to(body);
                }
            }
            if let Some(guard) = &arm.guard {
                self.held.push(value);
                let test = self.expr(guard);
                self.held.pop();
                let test = self.coerce(test?, MirType::I32)?;
                let body = self.b.new_block();
                self.b.branch(test, body, next);
                self.b.switch_to(body);
            }
            let result = self.expr(&arm.body)?;
            self.assign(slot, result)?;
            self.b.jump_if_open(join);
            self.b.switch_to(next);
        }
        self.b.trap(TrapCode::Unreachable);
        self.b.switch_to(join);
        Ok(self.slot_value(slot, e))
    }

    fn cond(
        &mut self,
        e: &'h HirExpr,
        arms: &'h [CondArm],
        default: Option<&'h HirExpr>,
    ) -> Result<MirValueId> {
        let slot = self.result_slot(e);
        let join = self.b.new_block();
        for arm in arms {
            let test = self.expr(&arm.condition)?;
            let test = self.coerce(test, MirType::I32)?;
            let body = self.b.new_block();
            let next = self.b.new_block();
            self.b.branch(test, body, next);
            self.b.switch_to(body);
            let value = self.expr(&arm.body)?;
            self.assign(slot, value)?;
            self.b.jump_if_open(join);
            self.b.switch_to(next);
        }
        if let Some(default) = default {
            let value = self.expr(default)?;
            self.assign(slot, value)?;
        }
        self.b.jump_if_open(join);
        self.b.switch_to(join);
        Ok(self.slot_value(slot, e))
    }

    fn lambda(
        &mut self,
        e: &'h HirExpr,
        params: &'h [HirParam],
        body: &'h HirExpr,
    ) -> Result<MirValueId> {
        let captures: Vec<SymbolId> = free_symbols(e).into_iter().collect();
        let name = format!("{}$lambda{}", self.owner, e.id.0);
        let fields = captures
            .iter()
            .map(|s| MirField::new(self.hir.symbols.name(*s), self.symbol_type(*s)))
            .collect();
        let env_layout =
            self.cx
                .env_layout(e.id, &self.scope.instance, format!("{name}$env"), fields);
        let row = e
            .ty
            .as_function()
            .map(|ft| ft.effects)
            .unwrap_or(EffectRowId::PURE);

        let mut entry = vec![(Some("env".to_string()), MirType::Ref)];
        entry.extend(
            params
                .iter()
                .map(|p| (Some(self.hir.symbols.name(p.symbol).to_string()), MirType::Any)),
        );
        let plan = BodyPlan {
            name: name.clone(),
            kind: FunctionKind::Lambda,
            params: entry,
            ret: MirType::Any,
            unit_result: self.scope.apply(&body.ty).is_unit(),
            effectful: !row.is_pure(),
            row,
            body,
            prologue: Prologue::Lambda {
                env_layout,
                captures: captures.clone(),
                params: params.iter().map(|p| p.symbol).collect(),
            },
        };
        emit_body(self.cx, self.scope, plan)?;
        self.cx.module.table_index(&name);

        let values = captures.iter().map(|s| self.symbol_local(*s)).collect();
        let env = self.b.struct_new(env_layout, values);
        let function = self.b.func_ref(&name);
        let closure = self.abi().closure;
        Ok(self.b.struct_new(closure, vec![function, env]))
    }

    // -- outcomes -------------------------------------------------------------

    pub(crate) fn emit_return(&mut self, value: MirValueId) -> Result<()> {
        let value = if self.unit_result {
            self.unit()
        } else {
            self.coerce(value, self.ret)?
        };
        if let Some(guard) = self.guard {
            let layout = self.abi().guard;
            let expected = self
                .b
                .struct_get(layout, guard, abi::guard::EXPECTED, MirType::I32);
            let observed = self
                .b
                .struct_get(layout, guard, abi::guard::OBSERVED, MirType::I32);
            let same = self.eq(expected, observed);
            self.b.trap_unless(same, TrapCode::TailGuardMismatch);
        }
        if self.machine.is_some() {
            let boxed = self.b.boxed(value);
            let outcome = self.b.call(abi::DONE, vec![boxed], MirType::Ref);
            self.b.ret(Some(outcome));
        } else {
            self.b.ret(Some(value));
        }
        Ok(())
    }

    /// Value of a callee's outcome. At a site of a state machine this may
    /// suspend the whole body; anywhere else a suspension is a bug and traps.
    pub(crate) fn outcome(
        &mut self,
        e: &HirExpr,
        outcome: MirValueId,
        top: MirValueId,
        ty: MirType,
    ) -> Result<MirValueId> {
        if self.machine.is_some() && self.liveness.site(e.id).is_some() {
            return self.suspension(e, outcome, top, ty);
        }
        Ok(self.unwrap_outcome(outcome, ty))
    }

    pub(crate) fn unwrap_outcome(&mut self, outcome: MirValueId, ty: MirType) -> MirValueId {
        let layout = self.abi().outcome;
        let tag = self
            .b
            .struct_get(layout, outcome, abi::outcome::TAG, MirType::I32);
        let done = self.b.const_i32(abi::OUTCOME_DONE);
        let finished = self.eq(tag, done);
        self.b.trap_unless(finished, TrapCode::UnexpectedSuspension);
        let value = self
            .b
            .struct_get(layout, outcome, abi::outcome::VALUE, MirType::Any);
        self.b.unboxed(value, ty)
    }

    fn suspension(
        &mut self,
        e: &HirExpr,
        outcome: MirValueId,
        top: MirValueId,
        ty: MirType,
    ) -> Result<MirValueId> {
        let Some(site) = self.liveness.site(e.id).cloned() else {
            return Ok(self.unwrap_outcome(outcome, ty));
        };

        let mut saved: Vec<MirValueId> = site
            .live_out
            .iter()
            .map(|symbol| self.symbol_local(*symbol))
            .collect();
        for draft in site.captures.iter().chain(&site.held_results) {
            let value = self
                .pending
                .iter()
                .rev()
                .find(|p| p.owner == draft.owner && p.index == draft.index)
                .map(|p| p.value)
                .ok_or_else(|| CodegenError::Internal {
                    function: self.owner.clone(),
                    detail: format!("operand {} of {} was not evaluated", draft.index, draft.owner),
                })?;
            saved.push(value);
        }
        saved.extend(self.held.iter().copied());
        let mut seen = BTreeSet::new();
        saved.retain(|value| seen.insert(*value));

        let (index, resume_name) = match &self.machine {
            Some(machine) => (machine.resumes.len(), machine.resume_name.clone()),
            None => return Ok(self.unwrap_outcome(outcome, ty)),
        };
        let mut fields = vec![
            MirField::new("site", MirType::I32),
            MirField::new("top", MirType::Ref),
        ];
        fields.extend(
            saved
                .iter()
                .enumerate()
                .map(|(i, value)| MirField::new(format!("s{i}"), self.b.local_type(*value))),
        );
        let layout = self
            .cx
            .module
            .add_layout(format!("{}$state{index}", self.owner), fields);

        let abi = self.abi();
        let tag = self
            .b
            .struct_get(abi.outcome, outcome, abi::outcome::TAG, MirType::I32);
        let done_tag = self.b.const_i32(abi::OUTCOME_DONE);
        let finished = self.eq(tag, done_tag);
        let result = self.b.local(ty);
        let done = self.b.new_block();
        let suspend = self.b.new_block();
        let resume = self.b.new_block();
        let join = self.b.new_block();
        self.b.branch(finished, done, suspend);

        self.b.switch_to(suspend);
        let site_no = self.b.const_i32(index as i32);
        let mut values = vec![site_no, top];
        values.extend(saved.iter().copied());
        let state = self.b.struct_new(layout, values);
        let request = self
            .b
            .struct_get(abi.outcome, outcome, abi::outcome::REQUEST, MirType::Ref);
        let resume_fn = self.b.func_ref(&resume_name);
        self.b
            .call_void(abi::APPEND, vec![request, state, resume_fn]);
        self.b.ret(Some(outcome));

        self.b.switch_to(done);
        let value = self
            .b
            .struct_get(abi.outcome, outcome, abi::outcome::VALUE, MirType::Any);
        let value = self.b.unboxed(value, ty);
        self.b.copy(result, value);
        self.b.jump_if_open(join);

        self.b.switch_to(resume);
        let state = self.b.param(STATE_PARAM);
        for (i, register) in saved.iter().enumerate() {
            self.b.push(MirInst::StructGet {
                dest: *register,
                layout,
                object: state,
                field: abi::state::FIRST_SAVED + i as u32,
            });
        }
        let outer = self
            .b
            .struct_get(layout, state, abi::state::TOP, MirType::Ref);
        self.set_top(outer);
        let input = self.b.param(INPUT_PARAM);
        let value = self.b.unboxed(input, ty);
        self.b.copy(result, value);
        self.b.jump_if_open(join);

        if let Some(machine) = &mut self.machine {
            machine.resumes.push(resume);
        }
        self.b.switch_to(join);
        self.cx.stats_mut(&self.owner).suspension_points += 1;
        trace!(body = %self.owner, site = %e.id, saved = saved.len(), "lowered suspension point");
        Ok(result)
    }
}
