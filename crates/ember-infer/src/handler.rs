//! Typing of handler expressions.
//!
//! A handler expression `handle body with clauses finally f` is typed in a
//! fixed order: the body first (so perform sites are resolved), then clause
//! overloads, generic instantiations, continuation types, clause bodies, the
//! residual row, `finally`, and last the resumption-count enforcement. The
//! results are written back onto the HIR as [`HandlerMeta`] and per-clause
//! [`TailResumptionInfo`](ember_hir::TailResumptionInfo).

use std::collections::BTreeMap;

use ember_diag::{Category, Diagnostic};
use ember_hir::{ExprId, HandleExpr, HandlerMeta, HirExpr, HirExprKind, Span};
use ember_types::{
    EffectOperation, EffectRowId, FunctionType, OperationId, Substitution, Type, types_compatible,
    types_match_exactly,
};
use tracing::debug;

use crate::effects::EffectChecker;
use crate::tail::{ResumeViolation, enforce_tail_resumption};
use crate::trace::{HandlerStep, HandlerTrace};
use crate::usage::{ContinuationUsage, analyze_continuation_usage};

impl<'m> EffectChecker<'m> {
    /// Type one handler expression whose result type is `result_ty`, returning
    /// the effect row of the whole expression.
    pub(crate) fn type_handler(
        &mut self,
        handle: &mut HandleExpr,
        result_ty: &Type,
        id: ExprId,
        span: Span,
    ) -> EffectRowId {
        let tracing_enabled = self.traces.is_some();
        let mut steps = Vec::new();
        let outer = self.current_allowance();

        // 1. The handled body. Nested handlers may leave this handler's
        //    operations to it.
        let inner = outer.extended(handle.clauses.iter().map(|c| c.operation.name.as_str()));
        self.allowances.push(inner);
        let body_row = self.infer_expr_effect_row(&mut handle.body);
        self.allowances.pop();
        if tracing_enabled {
            steps.push(HandlerStep::BodyRow {
                row: self.rows.display(body_row),
            });
        }
        if !types_compatible(result_ty, &handle.body.ty) {
            self.diagnostics.push(
                Diagnostic::error(
                    Category::TypeMismatch,
                    format!(
                        "handled body has type `{}`, but the handler produces `{result_ty}`",
                        handle.body.ty
                    ),
                )
                .at(handle.body.span.location()),
            );
        }

        // 2. Clause overloads.
        let mut ops: Vec<Option<&'m EffectOperation>> = Vec::with_capacity(handle.clauses.len());
        let mut seen: BTreeMap<OperationId, usize> = BTreeMap::new();
        for (index, clause) in handle.clauses.iter_mut().enumerate() {
            let op = self.resolve_clause(clause);
            if let Some(op) = op {
                if let Some(first) = seen.get(&op.id) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Category::TypeError,
                            format!(
                                "duplicate clause for `{}` (already handled by clause {})",
                                op.qualified_name(),
                                first + 1
                            ),
                        )
                        .at(clause.span.location()),
                    );
                    ops.push(None);
                    continue;
                }
                seen.insert(op.id, index);
                if tracing_enabled {
                    steps.push(HandlerStep::OverloadResolved {
                        clause: index,
                        operation: op.qualified_name(),
                        candidates: self.catalog.overloads(&op.name).len(),
                    });
                }
            }
            ops.push(op);
        }

        // 3. Generic instantiations, agreed across every perform site of the
        //    same operation in the handled body.
        let mut instantiations: BTreeMap<OperationId, Vec<Type>> = BTreeMap::new();
        for op in ops.iter().flatten() {
            if !op.is_generic() || instantiations.contains_key(&op.id) {
                continue;
            }
            let mut sites = Vec::new();
            collect_perform_sites(&handle.body, op, &mut sites);
            if let Some(type_args) = self.agree_on_instantiation(op, &sites) {
                if tracing_enabled {
                    steps.push(HandlerStep::Instantiation {
                        operation: op.qualified_name(),
                        type_args: type_args.iter().map(ToString::to_string).collect(),
                        sites: sites.len(),
                    });
                }
                instantiations.insert(op.id, type_args);
            }
        }

        // 4. Continuation and parameter types. A resumed computation no
        //    longer carries any operation this handler intercepts.
        let intercepted: Vec<&str> = ops.iter().flatten().map(|op| op.name.as_str()).collect();
        let continuation_row = self
            .rows
            .drop_handled_operations(body_row, intercepted.iter().copied());
        let mut continuation_types = Vec::with_capacity(handle.clauses.len());
        for (index, (clause, op)) in handle.clauses.iter().zip(&ops).enumerate() {
            let subst = op
                .and_then(|op| {
                    instantiations
                        .get(&op.id)
                        .map(|args| Substitution::from_pairs(&op.type_params, args))
                })
                .unwrap_or_default();
            let resume_ty = op
                .map(|op| subst.apply(&op.result_type()))
                .unwrap_or(Type::Never);
            let continuation =
                FunctionType::with_effects(vec![resume_ty], result_ty.clone(), continuation_row);
            if let Some(k) = clause.continuation {
                self.symbols
                    .set_type(k, Type::Function(continuation.clone()));
            }
            if let Some(op) = op {
                for (param, declared) in clause.params.iter().zip(&op.params) {
                    let ty = param
                        .annotation
                        .clone()
                        .unwrap_or_else(|| subst.apply(declared));
                    self.symbols.set_type(param.symbol, ty);
                }
            }
            if tracing_enabled {
                steps.push(HandlerStep::ContinuationType {
                    clause: index,
                    ty: self.render_function(&continuation),
                });
            }
            continuation_types.push(continuation);
        }

        // 5. Clause bodies run outside this handler.
        let mut clause_rows = Vec::with_capacity(handle.clauses.len());
        let mut reraised: Vec<String> = Vec::new();
        self.allowances.push(outer.clone());
        for (index, (clause, op)) in handle.clauses.iter_mut().zip(&ops).enumerate() {
            let row = self.infer_expr_effect_row(&mut clause.body);
            if !types_compatible(result_ty, &clause.body.ty) {
                self.diagnostics.push(
                    Diagnostic::error(
                        Category::TypeMismatch,
                        format!(
                            "clause for `{}` has type `{}`, but the handler produces `{result_ty}`",
                            clause.operation.name, clause.body.ty
                        ),
                    )
                    .at(clause.body.span.location()),
                );
            }
            let reraises = op.is_some_and(|op| self.rows.contains(row, &op.name));
            if let Some(op) = op
                && reraises
                && !reraised.contains(&op.name)
            {
                reraised.push(op.name.clone());
            }
            if tracing_enabled {
                steps.push(HandlerStep::ClauseRow {
                    clause: index,
                    row: self.rows.display(row),
                    reraises,
                });
            }
            clause_rows.push(row);
        }
        self.allowances.pop();

        // 6. Residual row and the unhandled-effects check.
        let handled: Vec<&str> = intercepted
            .iter()
            .copied()
            .filter(|name| !reraised.iter().any(|r| r == name))
            .collect();
        let remaining = self
            .rows
            .drop_handled_operations(body_row, handled.iter().copied());
        if tracing_enabled {
            steps.push(HandlerStep::RemainingRow {
                row: self.rows.display(remaining),
            });
        }
        if !self.rows.is_open(remaining) {
            let unhandled: Vec<String> = self
                .rows
                .ops(remaining)
                .map(|label| label.as_str())
                .filter(|op| {
                    !reraised.iter().any(|r| r == op)
                        && !outer.permits(op)
                        && !handle.clauses.iter().any(|c| c.operation.name == *op)
                })
                .map(|op| format!("`{op}`"))
                .collect();
            if !unhandled.is_empty() {
                self.diagnostics.push(
                    Diagnostic::error(
                        Category::UnhandledEffects,
                        format!("handler leaves {} unhandled", unhandled.join(", ")),
                    )
                    .at(span.location())
                    .with_help("add a clause for each operation, or declare it on the enclosing function"),
                );
            }
        }

        // 7. `finally` runs whatever the outcome.
        let finally_row = match &mut handle.finally {
            Some(finally) => {
                self.allowances.push(outer.clone());
                let row = self.infer_expr_effect_row(finally);
                self.allowances.pop();
                if !finally.ty.is_unit() && !types_compatible(&handle.body.ty, &finally.ty) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Category::TypeMismatch,
                            format!(
                                "`finally` has type `{}`; expected `()` or `{}`",
                                finally.ty, handle.body.ty
                            ),
                        )
                        .at(finally.span.location()),
                    );
                }
                row
            }
            None => EffectRowId::PURE,
        };

        // 8. Resumption counts.
        for (index, (clause, op)) in handle.clauses.iter_mut().zip(&ops).enumerate() {
            let Some(op) = op else {
                continue;
            };
            let usage = clause
                .continuation
                .map(|k| analyze_continuation_usage(&clause.body, k))
                .unwrap_or(ContinuationUsage::NONE);
            let (info, violation) = enforce_tail_resumption(op, usage);
            if let Some(violation) = violation {
                self.diagnostics
                    .push(resume_count_diagnostic(op, violation).at(clause.span.location()));
            }
            debug!(
                operation = %op.qualified_name(),
                min = usage.min,
                max = %usage.max,
                escapes = usage.escapes,
                enforcement = ?info.enforcement,
                "clause resumption"
            );
            if tracing_enabled {
                steps.push(HandlerStep::TailEnforcement {
                    clause: index,
                    usage,
                    enforcement: info.enforcement,
                });
            }
            clause.tail_resumption = Some(info);
        }

        let mut parts = Vec::with_capacity(clause_rows.len() + 2);
        parts.push(remaining);
        parts.extend(clause_rows.iter().copied());
        parts.push(finally_row);
        let row = self.rows.compose_effect_rows(&parts);
        debug!(
            handler = %id,
            body = %self.rows.display(body_row),
            row = %self.rows.display(row),
            "typed handler"
        );

        handle.meta = Some(HandlerMeta {
            body_row,
            row,
            result_ty: result_ty.clone(),
            continuation_types,
            reraised,
            instantiations,
        });
        if let Some(traces) = &mut self.traces {
            traces.push(HandlerTrace {
                function: self.function.clone(),
                handler: id,
                steps,
            });
        }
        row
    }

    /// Every site that supplied type arguments must supply the same ones.
    fn agree_on_instantiation(
        &mut self,
        op: &EffectOperation,
        sites: &[&HirExpr],
    ) -> Option<Vec<Type>> {
        let mut agreed: Option<(&[Type], Span)> = None;
        for site in sites {
            let HirExprKind::Perform { type_args, .. } = &site.kind else {
                continue;
            };
            if type_args.is_empty() {
                continue;
            }
            match agreed {
                None => agreed = Some((type_args.as_slice(), site.span)),
                Some((first, first_span)) => {
                    let same = first.len() == type_args.len()
                        && first
                            .iter()
                            .zip(type_args)
                            .all(|(a, b)| types_match_exactly(a, b));
                    if !same {
                        let render = |args: &[Type]| {
                            args.iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        };
                        self.diagnostics.push(
                            Diagnostic::error(
                                Category::GenericInstantiationMismatch,
                                format!(
                                    "`{}` is performed at <{}> here but at <{}> elsewhere in the same handler",
                                    op.qualified_name(),
                                    render(type_args.as_slice()),
                                    render(first)
                                ),
                            )
                            .at(site.span.location())
                            .with_label(first_span.location(), "first instantiation is here"),
                        );
                        return None;
                    }
                }
            }
        }
        agreed.map(|(args, _)| args.to_vec())
    }

    fn render_function(&self, ft: &FunctionType) -> String {
        let params: Vec<String> = ft.params.iter().map(ToString::to_string).collect();
        format!(
            "({}) -{}> {}",
            params.join(", "),
            self.rows.display(ft.effects),
            ft.ret
        )
    }
}

/// Perform sites of `op` in `expr` that a handler around `expr` would see.
/// Sites under a nested handler that intercepts the same name belong to it.
fn collect_perform_sites<'a>(expr: &'a HirExpr, op: &EffectOperation, out: &mut Vec<&'a HirExpr>) {
    match &expr.kind {
        HirExprKind::Perform { operation, .. } if operation.resolved == Some(op.id) => {
            out.push(expr);
        }
        HirExprKind::Handle(inner) if inner.clauses.iter().any(|c| c.operation.name == op.name) => {
            for clause in &inner.clauses {
                collect_perform_sites(&clause.body, op, out);
            }
            if let Some(finally) = &inner.finally {
                collect_perform_sites(finally, op, out);
            }
            return;
        }
        _ => {}
    }
    for child in expr.children() {
        collect_perform_sites(child, op, out);
    }
}

fn resume_count_diagnostic(op: &EffectOperation, violation: ResumeViolation) -> Diagnostic {
    match violation {
        ResumeViolation::NeverResumes => Diagnostic::error(
            Category::TailResumeCount,
            format!(
                "tail clause for `{}` never calls its continuation",
                op.qualified_name()
            ),
        )
        .with_help("a `tail` operation must resume exactly once"),
        ResumeViolation::ResumesRepeatedly { min } => Diagnostic::error(
            Category::TailResumeCount,
            format!(
                "tail clause for `{}` calls its continuation at least {min} times",
                op.qualified_name()
            ),
        )
        .with_help("a `tail` operation must resume exactly once; declare it `resume` for multi-shot use"),
        ResumeViolation::ResumesNonReturning => Diagnostic::error(
            Category::ResumeCount,
            format!(
                "`{}` declares no return type and never resumes, but its clause calls the continuation",
                op.qualified_name()
            ),
        ),
    }
}
