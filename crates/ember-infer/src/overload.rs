//! Overload resolution for perform sites and handler clauses.

use ember_diag::{Category, Diagnostic};
use ember_hir::{HandlerClause, HirExpr, OperationRef, Span};
use ember_types::{EffectOperation, Substitution, Type, types_compatible, types_match_exactly};
use tracing::debug;

use crate::effects::EffectChecker;

impl<'m> EffectChecker<'m> {
    /// Bind a perform site to exactly one operation signature, by arity and
    /// then by argument types.
    pub(crate) fn resolve_perform(
        &mut self,
        operation: &mut OperationRef,
        type_args: &[Type],
        args: &[HirExpr],
        span: Span,
    ) {
        if operation.resolved.is_some() {
            return;
        }
        let candidates = self
            .catalog
            .lookup(&operation.name, operation.effect.as_deref());
        if candidates.is_empty() {
            self.diagnostics.push(
                Diagnostic::error(
                    Category::UndefinedName,
                    format!("unknown effect operation `{}`", operation.name),
                )
                .at(span.location()),
            );
            return;
        }

        let by_arity: Vec<&EffectOperation> = candidates
            .iter()
            .copied()
            .filter(|op| op.params.len() == args.len())
            .collect();
        if by_arity.is_empty() {
            let expected: Vec<String> = candidates.iter().map(|op| op.params.len().to_string()).collect();
            self.diagnostics.push(
                Diagnostic::error(
                    Category::ArityMismatch,
                    format!(
                        "`{}` takes {} argument(s), but {} were supplied",
                        operation.name,
                        expected.join(" or "),
                        args.len()
                    ),
                )
                .at(span.location()),
            );
            return;
        }

        let accepting: Vec<&EffectOperation> = by_arity
            .into_iter()
            .filter(|op| {
                let subst = Substitution::from_pairs(&op.type_params, type_args);
                op.params
                    .iter()
                    .zip(args)
                    .all(|(param, arg)| types_compatible(&subst.apply(param), &arg.ty))
            })
            .collect();
        match accepting.as_slice() {
            [op] => {
                operation.resolved = Some(op.id);
                operation.effect = Some(op.effect.clone());
            }
            [] => {
                let found: Vec<String> = args.iter().map(|a| a.ty.to_string()).collect();
                self.diagnostics.push(
                    Diagnostic::error(
                        Category::TypeMismatch,
                        format!(
                            "no signature of `{}` accepts arguments ({})",
                            operation.name,
                            found.join(", ")
                        ),
                    )
                    .at(span.location()),
                );
            }
            many => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Category::AmbiguousHandlerClause,
                        format!(
                            "perform of `{}` matches {} signatures",
                            operation.name,
                            many.len()
                        ),
                    )
                    .at(span.location())
                    .with_help("qualify the operation with its effect"),
                );
            }
        }
    }

    /// Bind a handler clause to one operation. Overloaded names require every
    /// value parameter to be annotated, and exactly one signature must match
    /// the annotations in both directions. On success the clause's operation
    /// reference is rewritten to the resolved operation.
    pub(crate) fn resolve_clause(
        &mut self,
        clause: &mut HandlerClause,
    ) -> Option<&'m EffectOperation> {
        let catalog = self.catalog;
        let candidates = catalog.lookup(&clause.operation.name, clause.operation.effect.as_deref());
        let location = clause.span.location();
        let resolved = match candidates.as_slice() {
            [] => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Category::UndefinedName,
                        format!(
                            "handler clause names unknown operation `{}`",
                            clause.operation.name
                        ),
                    )
                    .at(location),
                );
                return None;
            }
            [op] => {
                let op = *op;
                if clause.params.len() != op.params.len() {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Category::ArityMismatch,
                            format!(
                                "clause for `{}` binds {} parameter(s), but the operation takes {}",
                                op.name,
                                clause.params.len(),
                                op.params.len()
                            ),
                        )
                        .at(location),
                    );
                    return None;
                }
                for (param, declared) in clause.params.iter().zip(&op.params) {
                    if let Some(annotation) = &param.annotation
                        && !types_match_exactly(declared, annotation)
                    {
                        self.diagnostics.push(
                            Diagnostic::error(
                                Category::TypeMismatch,
                                format!(
                                    "clause parameter annotated `{annotation}`, but `{}` declares `{declared}`",
                                    op.name
                                ),
                            )
                            .at(location),
                        );
                    }
                }
                op
            }
            overloads => {
                let missing: Vec<&str> = clause
                    .params
                    .iter()
                    .filter(|p| p.annotation.is_none())
                    .map(|p| self.symbols.name(p.symbol))
                    .collect();
                if !missing.is_empty() {
                    let message = format!(
                        "`{}` is overloaded; annotate clause parameter(s) {} to pick a signature",
                        clause.operation.name,
                        missing
                            .iter()
                            .map(|n| format!("`{n}`"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    self.diagnostics.push(
                        Diagnostic::error(Category::MissingAnnotation, message).at(location),
                    );
                    return None;
                }
                let matching: Vec<&EffectOperation> = overloads
                    .iter()
                    .copied()
                    .filter(|op| {
                        op.params.len() == clause.params.len()
                            && op.params.iter().zip(&clause.params).all(|(declared, param)| {
                                param
                                    .annotation
                                    .as_ref()
                                    .is_some_and(|ann| types_match_exactly(declared, ann))
                            })
                    })
                    .collect();
                match matching.as_slice() {
                    [op] => *op,
                    none_or_many => {
                        let signatures: Vec<String> =
                            overloads.iter().map(|op| op.to_string()).collect();
                        self.diagnostics.push(
                            Diagnostic::error(
                                Category::AmbiguousHandlerClause,
                                if none_or_many.is_empty() {
                                    format!(
                                        "no overload of `{}` matches the clause annotations",
                                        clause.operation.name
                                    )
                                } else {
                                    format!(
                                        "clause annotations match {} overloads of `{}`",
                                        none_or_many.len(),
                                        clause.operation.name
                                    )
                                },
                            )
                            .at(location)
                            .with_help(format!("candidates: {}", signatures.join("; "))),
                        );
                        return None;
                    }
                }
            }
        };

        debug!(
            operation = %resolved.qualified_name(),
            candidates = candidates.len(),
            "resolved handler clause"
        );
        clause.operation.resolved = Some(resolved.id);
        clause.operation.effect = Some(resolved.effect.clone());
        Some(resolved)
    }
}
