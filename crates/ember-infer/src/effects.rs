//! Effect-row inference over typed HIR.
//!
//! [`EffectChecker`] walks an expression tree bottom-up, composing the rows of
//! subexpressions, resolving perform sites to operation signatures, and
//! delegating handler expressions to the handler typer. Diagnostics accumulate
//! on the checker; callers drain them per function.

use std::collections::BTreeSet;

use ember_diag::{Category, Diagnostic};
use ember_hir::{Callee, HirExpr, HirExprKind, HirFunction, SymbolTable};
use ember_types::{EffectCatalog, EffectRowId, EffectRowTable, Label, Type};
use tracing::debug;

use crate::trace::HandlerTrace;

/// Operations a handler may leave unhandled without a diagnostic: those
/// covered by the enclosing function's declared row or by an enclosing
/// handler's clauses.
#[derive(Debug, Clone, Default)]
pub(crate) struct Allowance {
    ops: BTreeSet<String>,
    open: bool,
}

impl Allowance {
    pub(crate) fn from_row(rows: &EffectRowTable, row: EffectRowId) -> Self {
        let row = rows.get(row);
        Self {
            ops: row.ops.iter().map(|l| l.as_str().to_string()).collect(),
            open: row.is_open(),
        }
    }

    pub(crate) fn extended<'a>(&self, ops: impl IntoIterator<Item = &'a str>) -> Self {
        let mut next = self.clone();
        next.ops.extend(ops.into_iter().map(str::to_string));
        next
    }

    pub(crate) fn permits(&self, op: &str) -> bool {
        self.open || self.ops.contains(op)
    }
}

pub struct EffectChecker<'m> {
    pub(crate) catalog: &'m EffectCatalog,
    pub(crate) rows: &'m mut EffectRowTable,
    pub(crate) symbols: &'m mut SymbolTable,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) allowances: Vec<Allowance>,
    pub(crate) traces: Option<Vec<HandlerTrace>>,
    pub(crate) function: String,
}

impl<'m> EffectChecker<'m> {
    pub fn new(
        catalog: &'m EffectCatalog,
        rows: &'m mut EffectRowTable,
        symbols: &'m mut SymbolTable,
    ) -> Self {
        Self {
            catalog,
            rows,
            symbols,
            diagnostics: Vec::new(),
            allowances: Vec::new(),
            traces: None,
            function: String::new(),
        }
    }

    /// Record a [`HandlerTrace`] for every handler typed from now on.
    pub fn with_tracing(mut self) -> Self {
        self.traces = Some(Vec::new());
        self
    }

    pub fn rows(&self) -> &EffectRowTable {
        self.rows
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn take_traces(&mut self) -> Vec<HandlerTrace> {
        self.traces.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn current_allowance(&self) -> Allowance {
        self.allowances.last().cloned().unwrap_or_default()
    }

    /// Infer the function body's row and check it against the declared row.
    pub fn check_function(&mut self, function: &mut HirFunction) -> EffectRowId {
        let _span = tracing::debug_span!("check_function", name = %function.name).entered();
        self.function = function.name.clone();
        self.allowances = vec![Allowance::from_row(self.rows, function.effects)];
        let row = self.infer_expr_effect_row(&mut function.body);
        self.allowances.clear();

        if !self.rows.is_covered_by(row, function.effects) {
            let declared = self.rows.get(function.effects).clone();
            let inferred = self.rows.get(row);
            let mut missing: Vec<String> = inferred
                .ops
                .iter()
                .filter(|op| !declared.ops.contains(*op))
                .map(|op| format!("`{op}`"))
                .collect();
            if inferred.is_open() && !declared.is_open() {
                missing.push("an open effect row".to_string());
            }
            self.diagnostics.push(
                Diagnostic::error(
                    Category::UnhandledEffects,
                    format!(
                        "function `{}` performs unhandled effects: {}",
                        function.name,
                        missing.join(", ")
                    ),
                )
                .at(function.span.location())
                .with_help(format!(
                    "declared effects are {}; handle the rest or add them to the declaration",
                    self.rows.display(function.effects)
                )),
            );
        }
        debug!(
            function = %function.name,
            row = %self.rows.display(row),
            "inferred function effects"
        );
        row
    }

    /// Effect row of evaluating `expr` once. Handler expressions inside are
    /// typed and annotated as a side effect.
    pub fn infer_expr_effect_row(&mut self, expr: &mut HirExpr) -> EffectRowId {
        let span = expr.span;
        let id = expr.id;
        let lambda_allowance = match &expr.ty {
            Type::Function(ft) if matches!(expr.kind, HirExprKind::Lambda { .. }) => {
                Some(Allowance::from_row(self.rows, ft.effects))
            }
            _ => None,
        };
        let mut retype: Option<Type> = None;

        let row = match &mut expr.kind {
            HirExprKind::Lit(_) | HirExprKind::Continue => EffectRowId::PURE,
            HirExprKind::Var(symbol) => {
                if self.symbols.is_continuation(*symbol) {
                    retype = self.symbols.ty(*symbol).cloned();
                }
                EffectRowId::PURE
            }
            HirExprKind::Let { value, .. } | HirExprKind::Assign { value, .. } => {
                self.infer_expr_effect_row(value)
            }
            HirExprKind::Block(items) | HirExprKind::Tuple(items) => self.infer_all(items),
            HirExprKind::Binary { left, right, .. } => {
                let l = self.infer_expr_effect_row(left);
                let r = self.infer_expr_effect_row(right);
                self.rows.compose2(l, r)
            }
            HirExprKind::Call { callee, args } => {
                let mut parts = Vec::with_capacity(args.len() + 2);
                let latent = match callee {
                    Callee::Function(fref) => fref.ty.effects,
                    Callee::Expr(callee) => {
                        parts.push(self.infer_expr_effect_row(callee));
                        match callee.ty.as_function() {
                            Some(ft) => {
                                if expr_ty_is_unknown(&expr.ty) {
                                    retype = Some((*ft.ret).clone());
                                }
                                ft.effects
                            }
                            None => EffectRowId::PURE,
                        }
                    }
                };
                parts.push(self.infer_all(args));
                parts.push(latent);
                self.rows.compose_effect_rows(&parts)
            }
            HirExprKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                let r = self.infer_expr_effect_row(receiver);
                let a = self.infer_all(args);
                self.rows.compose_effect_rows(&[r, a, method.ty.effects])
            }
            HirExprKind::Perform {
                operation,
                type_args,
                args,
            } => {
                let a = self.infer_all(args);
                self.resolve_perform(operation, type_args, args, span);
                let label = self
                    .rows
                    .intern_row([Label::new(operation.name.as_str())], None);
                self.rows.compose2(a, label)
            }
            HirExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let mut parts = vec![
                    self.infer_expr_effect_row(condition),
                    self.infer_expr_effect_row(then_branch),
                ];
                if let Some(else_branch) = else_branch {
                    parts.push(self.infer_expr_effect_row(else_branch));
                }
                self.rows.compose_effect_rows(&parts)
            }
            HirExprKind::Match { scrutinee, arms } => {
                let mut parts = vec![self.infer_expr_effect_row(scrutinee)];
                for arm in arms {
                    if let Some(guard) = &mut arm.guard {
                        parts.push(self.infer_expr_effect_row(guard));
                    }
                    parts.push(self.infer_expr_effect_row(&mut arm.body));
                }
                self.rows.compose_effect_rows(&parts)
            }
            HirExprKind::Cond { arms, default } => {
                let mut parts = Vec::new();
                for arm in arms {
                    parts.push(self.infer_expr_effect_row(&mut arm.condition));
                    parts.push(self.infer_expr_effect_row(&mut arm.body));
                }
                if let Some(default) = default {
                    parts.push(self.infer_expr_effect_row(default));
                }
                self.rows.compose_effect_rows(&parts)
            }
            HirExprKind::Loop { body } => self.infer_expr_effect_row(body),
            HirExprKind::While { condition, body } => {
                let c = self.infer_expr_effect_row(condition);
                let b = self.infer_expr_effect_row(body);
                self.rows.compose2(c, b)
            }
            HirExprKind::Break(value) | HirExprKind::Return(value) => match value {
                Some(value) => self.infer_expr_effect_row(value),
                None => EffectRowId::PURE,
            },
            HirExprKind::Lambda { body, .. } => {
                // The body's effects are latent in the lambda's type.
                self.allowances
                    .push(lambda_allowance.unwrap_or_default());
                self.infer_expr_effect_row(body);
                self.allowances.pop();
                EffectRowId::PURE
            }
            HirExprKind::Handle(handle) => {
                let result_ty = expr.ty.clone();
                self.type_handler(handle, &result_ty, id, span)
            }
        };

        if let Some(ty) = retype {
            expr.ty = ty;
        }
        row
    }

    fn infer_all(&mut self, items: &mut [HirExpr]) -> EffectRowId {
        let parts: Vec<EffectRowId> = items
            .iter_mut()
            .map(|item| self.infer_expr_effect_row(item))
            .collect();
        self.rows.compose_effect_rows(&parts)
    }
}

fn expr_ty_is_unknown(ty: &Type) -> bool {
    matches!(ty, Type::Var(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_hir::HirBuilder;
    use ember_types::{FunctionType, OperationSpec, ResumeKind};

    fn log_builder() -> HirBuilder {
        let b = HirBuilder::new();
        b.effect(
            "Log",
            Some(1),
            vec![OperationSpec::new("log", ResumeKind::Tail).params(vec![Type::String])],
        );
        b.effect(
            "Ask",
            Some(2),
            vec![OperationSpec::new("ask", ResumeKind::Tail).returns(Type::Int)],
        );
        b
    }

    #[test]
    fn sequencing_composes_rows() {
        let b = log_builder();
        let row = b.row(&["ask", "log"]);
        let body = b.block(vec![
            b.perform("log", vec![b.string("hi")]),
            b.perform("ask", vec![]),
        ]);
        let function = b.function("f", vec![], Type::Int, row, body);
        let mut module = b.finish(vec![function]);

        let mut checker =
            EffectChecker::new(&module.catalog, &mut module.rows, &mut module.symbols);
        let inferred = checker.check_function(&mut module.functions[0]);
        assert!(checker.take_diagnostics().is_empty());
        assert_eq!(inferred, row);
    }

    #[test]
    fn uncovered_function_effects_are_reported() {
        let b = log_builder();
        let body = b.perform("ask", vec![]);
        let function = b.function("f", vec![], Type::Int, EffectRowId::PURE, body);
        let mut module = b.finish(vec![function]);

        let mut checker =
            EffectChecker::new(&module.catalog, &mut module.rows, &mut module.symbols);
        checker.check_function(&mut module.functions[0]);
        let diags = checker.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code.as_deref(), Some("E0401"));
        assert!(diags[0].message.contains("`ask`"));
    }

    #[test]
    fn calls_carry_callee_effects_and_lambdas_are_latent() {
        let b = log_builder();
        let log_row = b.row(&["log"]);
        let callee_ty = FunctionType::with_effects(vec![], Type::Unit, log_row);
        let call = b.call_fn("write", callee_ty, vec![]);
        let lambda = b.lambda_with_effects(vec![], b.perform("ask", vec![]), b.row(&["ask"]));
        let body = b.block(vec![lambda, call]);
        let function = b.function("g", vec![], Type::Unit, log_row, body);
        let mut module = b.finish(vec![function]);

        let mut checker =
            EffectChecker::new(&module.catalog, &mut module.rows, &mut module.symbols);
        let row = checker.check_function(&mut module.functions[0]);
        assert!(checker.take_diagnostics().is_empty());
        assert_eq!(checker.rows().display(row), "[log]");
    }

    #[test]
    fn unknown_operation_is_undefined_name() {
        let b = log_builder();
        let body = b.perform("missing", vec![]);
        let row = b.row(&["missing"]);
        let function = b.function("h", vec![], Type::Unit, row, body);
        let mut module = b.finish(vec![function]);

        let mut checker =
            EffectChecker::new(&module.catalog, &mut module.rows, &mut module.symbols);
        checker.check_function(&mut module.functions[0]);
        let diags = checker.take_diagnostics();
        assert_eq!(diags[0].code.as_deref(), Some("E0005"));
    }
}
