//! Programmatic HIR construction.
//!
//! Upstream stages hand the effect subsystem fully built HIR; tests, benches
//! and fixtures use this builder instead. Methods take `&self` so nested
//! expressions can be written inline.

use std::cell::{Cell, RefCell};

use ember_types::{
    EffectCatalog, EffectRowId, EffectRowTable, FunctionType, Label, OperationId, OperationSpec,
    RowVarId, Substitution, Type, TypeVarId, types_match_exactly,
};

use crate::{
    BinOp, Callee, ClauseParam, CondArm, ExprId, FunctionRef, HandleExpr, HandlerClause,
    HirExpr, HirExprKind, HirFunction, HirLit, HirModule, HirParam, HirPattern, MatchArm,
    OperationRef, Span, SymbolId, SymbolKind, SymbolTable,
};

/// First type variable handed out for results the builder cannot know yet.
const FRESH_TYPE_VAR_BASE: u32 = 10_000;

#[derive(Debug)]
pub struct HirBuilder {
    next_expr: Cell<u32>,
    next_type_var: Cell<u32>,
    catalog: RefCell<EffectCatalog>,
    rows: RefCell<EffectRowTable>,
    symbols: RefCell<SymbolTable>,
}

impl Default for HirBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HirBuilder {
    pub fn new() -> Self {
        Self {
            next_expr: Cell::new(0),
            next_type_var: Cell::new(FRESH_TYPE_VAR_BASE),
            catalog: RefCell::new(EffectCatalog::new()),
            rows: RefCell::new(EffectRowTable::new()),
            symbols: RefCell::new(SymbolTable::new()),
        }
    }

    // -- declarations -------------------------------------------------------

    pub fn effect(
        &self,
        name: &str,
        effect_id: Option<u32>,
        operations: Vec<OperationSpec>,
    ) -> Vec<OperationId> {
        self.catalog
            .borrow_mut()
            .declare_effect(name, effect_id, operations)
    }

    pub fn row(&self, ops: &[&str]) -> EffectRowId {
        self.rows.borrow_mut().intern_ops(ops)
    }

    pub fn open_row(&self, ops: &[&str], tail: u32) -> EffectRowId {
        self.rows
            .borrow_mut()
            .intern_row(ops.iter().map(|op| Label::new(*op)), Some(RowVarId(tail)))
    }

    pub fn local(&self, name: &str, ty: Type) -> SymbolId {
        self.symbols.borrow_mut().define(name, ty, SymbolKind::Local)
    }

    pub fn param(&self, name: &str, ty: Type) -> SymbolId {
        self.symbols.borrow_mut().define(name, ty, SymbolKind::Param)
    }

    /// Continuation symbol; its type is assigned during effect typing.
    pub fn continuation(&self, name: &str) -> SymbolId {
        let ty = self.fresh_type_var();
        self.symbols
            .borrow_mut()
            .define(name, ty, SymbolKind::Continuation)
    }

    pub fn fresh_type_var(&self) -> Type {
        let id = self.next_type_var.get();
        self.next_type_var.set(id + 1);
        Type::Var(TypeVarId(id))
    }

    fn symbol_type(&self, symbol: SymbolId) -> Type {
        self.symbols
            .borrow()
            .ty(symbol)
            .cloned()
            .unwrap_or_else(|| self.fresh_type_var())
    }

    // -- expressions --------------------------------------------------------

    pub fn expr(&self, kind: HirExprKind, ty: Type) -> HirExpr {
        let id = self.next_expr.get();
        self.next_expr.set(id + 1);
        HirExpr {
            id: ExprId(id),
            kind,
            ty,
            span: Span::new(0, id, id + 1),
        }
    }

    pub fn int(&self, value: i64) -> HirExpr {
        self.expr(HirExprKind::Lit(HirLit::Int(value)), Type::Int)
    }

    pub fn float(&self, value: f64) -> HirExpr {
        self.expr(HirExprKind::Lit(HirLit::Float(value)), Type::Float)
    }

    pub fn bool(&self, value: bool) -> HirExpr {
        self.expr(HirExprKind::Lit(HirLit::Bool(value)), Type::Bool)
    }

    pub fn string(&self, value: &str) -> HirExpr {
        self.expr(
            HirExprKind::Lit(HirLit::String(value.to_string())),
            Type::String,
        )
    }

    pub fn unit(&self) -> HirExpr {
        self.expr(HirExprKind::Lit(HirLit::Unit), Type::Unit)
    }

    pub fn var(&self, symbol: SymbolId) -> HirExpr {
        self.expr(HirExprKind::Var(symbol), self.symbol_type(symbol))
    }

    pub fn let_(&self, symbol: SymbolId, value: HirExpr) -> HirExpr {
        self.expr(
            HirExprKind::Let {
                symbol,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn assign(&self, symbol: SymbolId, value: HirExpr) -> HirExpr {
        self.expr(
            HirExprKind::Assign {
                symbol,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn block(&self, items: Vec<HirExpr>) -> HirExpr {
        let ty = items.last().map(|e| e.ty.clone()).unwrap_or(Type::Unit);
        self.expr(HirExprKind::Block(items), ty)
    }

    pub fn tuple(&self, items: Vec<HirExpr>) -> HirExpr {
        let ty = Type::Tuple(items.iter().map(|e| e.ty.clone()).collect());
        self.expr(HirExprKind::Tuple(items), ty)
    }

    pub fn binary(&self, op: BinOp, left: HirExpr, right: HirExpr) -> HirExpr {
        let ty = if op.is_comparison() || matches!(op, BinOp::And | BinOp::Or) {
            Type::Bool
        } else {
            left.ty.clone()
        };
        self.expr(
            HirExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn add(&self, left: HirExpr, right: HirExpr) -> HirExpr {
        self.binary(BinOp::Add, left, right)
    }

    pub fn call_fn(&self, name: &str, ty: FunctionType, args: Vec<HirExpr>) -> HirExpr {
        let ret = (*ty.ret).clone();
        self.expr(
            HirExprKind::Call {
                callee: Callee::Function(FunctionRef {
                    name: name.to_string(),
                    ty,
                }),
                args,
            },
            ret,
        )
    }

    /// Call through a value. Continuation calls get a fresh result type.
    pub fn call(&self, callee: HirExpr, args: Vec<HirExpr>) -> HirExpr {
        let ret = callee
            .ty
            .as_function()
            .map(|ft| (*ft.ret).clone())
            .unwrap_or_else(|| self.fresh_type_var());
        self.expr(
            HirExprKind::Call {
                callee: Callee::Expr(Box::new(callee)),
                args,
            },
            ret,
        )
    }

    /// `k(value)` for a continuation symbol.
    pub fn resume(&self, k: SymbolId, value: HirExpr) -> HirExpr {
        let callee = self.var(k);
        self.call(callee, vec![value])
    }

    pub fn method_call(
        &self,
        receiver: HirExpr,
        method: &str,
        ty: FunctionType,
        args: Vec<HirExpr>,
    ) -> HirExpr {
        let ret = (*ty.ret).clone();
        self.expr(
            HirExprKind::MethodCall {
                receiver: Box::new(receiver),
                method: FunctionRef {
                    name: method.to_string(),
                    ty,
                },
                args,
            },
            ret,
        )
    }

    pub fn perform(&self, name: &str, args: Vec<HirExpr>) -> HirExpr {
        self.perform_generic(name, Vec::new(), args)
    }

    /// Perform with inferred type arguments for a generic operation.
    pub fn perform_generic(&self, name: &str, type_args: Vec<Type>, args: Vec<HirExpr>) -> HirExpr {
        let ty = self.perform_result_type(name, &type_args, &args);
        self.expr(
            HirExprKind::Perform {
                operation: OperationRef::named(name),
                type_args,
                args,
            },
            ty,
        )
    }

    fn perform_result_type(&self, name: &str, type_args: &[Type], args: &[HirExpr]) -> Type {
        let catalog = self.catalog.borrow();
        let candidates: Vec<_> = catalog
            .overloads(name)
            .into_iter()
            .filter(|op| {
                op.params.len() == args.len()
                    && (op.is_generic()
                        || op
                            .params
                            .iter()
                            .zip(args)
                            .all(|(p, a)| types_match_exactly(p, &a.ty)))
            })
            .collect();
        match candidates.as_slice() {
            [op] => Substitution::from_pairs(&op.type_params, type_args).apply(&op.result_type()),
            _ => self.fresh_type_var(),
        }
    }

    pub fn if_(
        &self,
        condition: HirExpr,
        then_branch: HirExpr,
        else_branch: Option<HirExpr>,
    ) -> HirExpr {
        let ty = if else_branch.is_some() {
            then_branch.ty.clone()
        } else {
            Type::Unit
        };
        self.expr(
            HirExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            ty,
        )
    }

    pub fn arm(&self, pattern: HirPattern, guard: Option<HirExpr>, body: HirExpr) -> MatchArm {
        MatchArm {
            pattern,
            guard,
            body,
        }
    }

    pub fn match_(&self, scrutinee: HirExpr, arms: Vec<MatchArm>) -> HirExpr {
        let ty = arms
            .first()
            .map(|arm| arm.body.ty.clone())
            .unwrap_or(Type::Unit);
        self.expr(
            HirExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
            },
            ty,
        )
    }

    pub fn cond(&self, arms: Vec<(HirExpr, HirExpr)>, default: Option<HirExpr>) -> HirExpr {
        let ty = arms
            .first()
            .map(|(_, body)| body.ty.clone())
            .unwrap_or(Type::Unit);
        let arms = arms
            .into_iter()
            .map(|(condition, body)| CondArm { condition, body })
            .collect();
        self.expr(
            HirExprKind::Cond {
                arms,
                default: default.map(Box::new),
            },
            ty,
        )
    }

    pub fn loop_(&self, body: HirExpr) -> HirExpr {
        self.expr(
            HirExprKind::Loop {
                body: Box::new(body),
            },
            Type::Unit,
        )
    }

    pub fn while_(&self, condition: HirExpr, body: HirExpr) -> HirExpr {
        self.expr(
            HirExprKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
            Type::Unit,
        )
    }

    pub fn break_(&self, value: Option<HirExpr>) -> HirExpr {
        self.expr(HirExprKind::Break(value.map(Box::new)), Type::Never)
    }

    pub fn continue_(&self) -> HirExpr {
        self.expr(HirExprKind::Continue, Type::Never)
    }

    pub fn return_(&self, value: Option<HirExpr>) -> HirExpr {
        self.expr(HirExprKind::Return(value.map(Box::new)), Type::Never)
    }

    pub fn lambda(&self, params: Vec<SymbolId>, body: HirExpr) -> HirExpr {
        self.lambda_with_effects(params, body, EffectRowId::PURE)
    }

    pub fn lambda_with_effects(
        &self,
        params: Vec<SymbolId>,
        body: HirExpr,
        effects: EffectRowId,
    ) -> HirExpr {
        let params = self.hir_params(&params);
        let ty = Type::Function(FunctionType::with_effects(
            params.iter().map(|p| p.ty.clone()).collect(),
            body.ty.clone(),
            effects,
        ));
        self.expr(
            HirExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            ty,
        )
    }

    // -- handlers -----------------------------------------------------------

    /// Clause whose value parameters take their types from the operation.
    pub fn clause(
        &self,
        operation: &str,
        continuation: Option<SymbolId>,
        params: Vec<SymbolId>,
        body: HirExpr,
    ) -> HandlerClause {
        let params = params
            .into_iter()
            .map(|symbol| ClauseParam {
                symbol,
                annotation: None,
            })
            .collect();
        self.build_clause(operation, continuation, params, body)
    }

    /// Clause with explicit parameter annotations, as needed for overloads.
    pub fn clause_annotated(
        &self,
        operation: &str,
        continuation: Option<SymbolId>,
        params: Vec<(SymbolId, Type)>,
        body: HirExpr,
    ) -> HandlerClause {
        let params = params
            .into_iter()
            .map(|(symbol, ty)| ClauseParam {
                symbol,
                annotation: Some(ty),
            })
            .collect();
        self.build_clause(operation, continuation, params, body)
    }

    fn build_clause(
        &self,
        operation: &str,
        continuation: Option<SymbolId>,
        params: Vec<ClauseParam>,
        body: HirExpr,
    ) -> HandlerClause {
        let span = body.span;
        HandlerClause {
            operation: OperationRef::named(operation),
            continuation,
            params,
            body,
            tail_resumption: None,
            span,
        }
    }

    pub fn handle(
        &self,
        body: HirExpr,
        clauses: Vec<HandlerClause>,
        finally: Option<HirExpr>,
    ) -> HirExpr {
        self.handle_labeled(body, clauses, finally, None)
    }

    pub fn handle_labeled(
        &self,
        body: HirExpr,
        clauses: Vec<HandlerClause>,
        finally: Option<HirExpr>,
        label: Option<&str>,
    ) -> HirExpr {
        let ty = body.ty.clone();
        self.expr(
            HirExprKind::Handle(Box::new(HandleExpr {
                body,
                clauses,
                finally,
                label: label.map(str::to_string),
                meta: None,
            })),
            ty,
        )
    }

    // -- functions and modules ----------------------------------------------

    fn hir_params(&self, params: &[SymbolId]) -> Vec<HirParam> {
        params
            .iter()
            .map(|symbol| HirParam {
                symbol: *symbol,
                ty: self.symbol_type(*symbol),
            })
            .collect()
    }

    pub fn function(
        &self,
        name: &str,
        params: Vec<SymbolId>,
        ret: Type,
        effects: EffectRowId,
        body: HirExpr,
    ) -> HirFunction {
        HirFunction {
            name: name.to_string(),
            params: self.hir_params(&params),
            ret,
            effects,
            span: body.span,
            body,
            exported: false,
            type_params: Vec::new(),
            instantiations: Vec::new(),
        }
    }

    pub fn finish(self, functions: Vec<HirFunction>) -> HirModule {
        HirModule {
            catalog: self.catalog.into_inner(),
            rows: self.rows.into_inner(),
            symbols: self.symbols.into_inner(),
            functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::ResumeKind;

    #[test]
    fn perform_takes_operation_result_type() {
        let b = HirBuilder::new();
        b.effect(
            "Ask",
            Some(1),
            vec![OperationSpec::new("ask", ResumeKind::Tail).returns(Type::Int)],
        );
        let ask = b.perform("ask", vec![]);
        assert_eq!(ask.ty, Type::Int);
    }

    #[test]
    fn generic_perform_substitutes_type_args() {
        let b = HirBuilder::new();
        b.effect(
            "State",
            None,
            vec![
                OperationSpec::new("get", ResumeKind::Tail)
                    .generic(vec![TypeVarId(0)])
                    .returns(Type::Var(TypeVarId(0))),
            ],
        );
        let get = b.perform_generic("get", vec![Type::String], vec![]);
        assert_eq!(get.ty, Type::String);
    }

    #[test]
    fn expression_ids_are_dense_and_unique() {
        let b = HirBuilder::new();
        let x = b.int(1);
        let y = b.int(2);
        let sum = b.add(x, y);
        assert_eq!(sum.id, ExprId(2));
        assert_eq!(sum.children()[0].id, ExprId(0));
    }

    #[test]
    fn module_round_trips_through_json() {
        let b = HirBuilder::new();
        b.effect(
            "Log",
            None,
            vec![OperationSpec::new("log", ResumeKind::Tail).params(vec![Type::String])],
        );
        let row = b.row(&["log"]);
        let msg = b.param("msg", Type::String);
        let body = b.perform("log", vec![b.var(msg)]);
        let function = b.function("write", vec![msg], Type::Unit, row, body);
        let module = b.finish(vec![function]);

        let json = serde_json::to_string(&module).unwrap();
        let back: HirModule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, module);
        assert_eq!(back.rows.display(back.functions[0].effects), "[log]");
    }
}
