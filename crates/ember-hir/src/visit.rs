//! Structural traversal helpers over HIR expressions.

use std::collections::BTreeSet;

use crate::{Callee, HandleExpr, HirExpr, HirExprKind, HirPattern, SymbolId};

impl HirExpr {
    /// Direct subexpressions in evaluation order. Handler clause bodies follow
    /// the handled body; `finally` comes last.
    pub fn children(&self) -> Vec<&HirExpr> {
        let mut out = Vec::new();
        match &self.kind {
            HirExprKind::Lit(_)
            | HirExprKind::Var(_)
            | HirExprKind::Continue
            | HirExprKind::Break(None)
            | HirExprKind::Return(None) => {}
            HirExprKind::Let { value, .. } | HirExprKind::Assign { value, .. } => out.push(&**value),
            HirExprKind::Block(items) | HirExprKind::Tuple(items) => out.extend(items),
            HirExprKind::Binary { left, right, .. } => {
                out.push(&**left);
                out.push(&**right);
            }
            HirExprKind::Call { callee, args } => {
                if let Callee::Expr(callee) = callee {
                    out.push(&**callee);
                }
                out.extend(args);
            }
            HirExprKind::MethodCall { receiver, args, .. } => {
                out.push(&**receiver);
                out.extend(args);
            }
            HirExprKind::Perform { args, .. } => out.extend(args),
            HirExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                out.push(&**condition);
                out.push(&**then_branch);
                if let Some(else_branch) = else_branch {
                    out.push(&**else_branch);
                }
            }
            HirExprKind::Match { scrutinee, arms } => {
                out.push(&**scrutinee);
                for arm in arms {
                    if let Some(guard) = &arm.guard {
                        out.push(guard);
                    }
                    out.push(&arm.body);
                }
            }
            HirExprKind::Cond { arms, default } => {
                for arm in arms {
                    out.push(&arm.condition);
                    out.push(&arm.body);
                }
                if let Some(default) = default {
                    out.push(&**default);
                }
            }
            HirExprKind::Loop { body } | HirExprKind::Lambda { body, .. } => out.push(&**body),
            HirExprKind::While { condition, body } => {
                out.push(&**condition);
                out.push(&**body);
            }
            HirExprKind::Break(Some(value)) | HirExprKind::Return(Some(value)) => {
                out.push(&**value)
            }
            HirExprKind::Handle(handle) => {
                out.push(&handle.body);
                out.extend(handle.clauses.iter().map(|clause| &clause.body));
                if let Some(finally) = &handle.finally {
                    out.push(finally);
                }
            }
        }
        out
    }

    /// Pre-order walk over this expression and every descendant.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a HirExpr)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Number of expression nodes in this tree.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }
}

/// Symbols introduced inside `expr`: lets, lambda and clause parameters,
/// continuation parameters, and match bindings.
pub fn bound_symbols(expr: &HirExpr) -> BTreeSet<SymbolId> {
    let mut bound = BTreeSet::new();
    expr.walk(&mut |e| match &e.kind {
        HirExprKind::Let { symbol, .. } => {
            bound.insert(*symbol);
        }
        HirExprKind::Lambda { params, .. } => {
            bound.extend(params.iter().map(|p| p.symbol));
        }
        HirExprKind::Match { arms, .. } => {
            for arm in arms {
                if let HirPattern::Bind(symbol) = arm.pattern {
                    bound.insert(symbol);
                }
            }
        }
        HirExprKind::Handle(handle) => {
            for clause in &handle.clauses {
                bound.extend(clause.continuation);
                bound.extend(clause.params.iter().map(|p| p.symbol));
            }
        }
        _ => {}
    });
    bound
}

/// Symbols read or assigned inside `expr` that are not bound inside it.
///
/// Symbol ids are unique per binding, so a symbol is free exactly when it is
/// mentioned but never bound within the subtree.
pub fn free_symbols(expr: &HirExpr) -> BTreeSet<SymbolId> {
    let mut used = BTreeSet::new();
    expr.walk(&mut |e| match &e.kind {
        HirExprKind::Var(symbol) | HirExprKind::Assign { symbol, .. } => {
            used.insert(*symbol);
        }
        _ => {}
    });
    let bound = bound_symbols(expr);
    used.retain(|symbol| !bound.contains(symbol));
    used
}

/// Outer symbols a handler's body and clauses read or assign. `finally` runs
/// in the enclosing scope and is not included.
pub fn handler_captures(handle: &HandleExpr) -> BTreeSet<SymbolId> {
    let mut captured = free_symbols(&handle.body);
    for clause in &handle.clauses {
        let mut free = free_symbols(&clause.body);
        if let Some(k) = clause.continuation {
            free.remove(&k);
        }
        for param in &clause.params {
            free.remove(&param.symbol);
        }
        captured.extend(free);
    }
    captured
}

pub fn mentions_symbol(expr: &HirExpr, target: SymbolId) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let HirExprKind::Var(symbol) = e.kind
            && symbol == target
        {
            found = true;
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HirBuilder;
    use ember_types::Type;

    #[test]
    fn free_symbols_exclude_locally_bound() {
        let b = HirBuilder::new();
        let outer = b.local("outer", Type::Int);
        let inner = b.local("inner", Type::Int);
        let let_inner = b.let_(inner, b.int(1));
        let sum = b.add(b.var(outer), b.var(inner));
        let body = b.block(vec![let_inner, sum]);

        let free = free_symbols(&body);
        assert_eq!(free.into_iter().collect::<Vec<_>>(), vec![outer]);
    }

    #[test]
    fn lambda_params_are_bound() {
        let b = HirBuilder::new();
        let x = b.local("x", Type::Int);
        let y = b.local("y", Type::Int);
        let body = b.add(b.var(x), b.var(y));
        let lambda = b.lambda(vec![x], body);
        assert_eq!(free_symbols(&lambda).into_iter().collect::<Vec<_>>(), vec![y]);
        assert!(mentions_symbol(&lambda, x));
    }

    #[test]
    fn children_follow_evaluation_order() {
        let b = HirBuilder::new();
        let x = b.local("x", Type::Int);
        let cond = b.bool(true);
        let then_branch = b.var(x);
        let else_branch = b.int(2);
        let expr = b.if_(cond, then_branch, Some(else_branch));
        let kinds: Vec<_> = expr
            .children()
            .iter()
            .map(|c| matches!(c.kind, HirExprKind::Var(_)))
            .collect();
        assert_eq!(kinds, vec![false, true, false]);
        assert_eq!(expr.node_count(), 4);
    }

    #[test]
    fn handler_captures_skip_clause_bindings_and_finally() {
        let b = HirBuilder::new();
        b.effect(
            "Ask",
            None,
            vec![ember_types::OperationSpec::new("ask", ember_types::ResumeKind::Tail).returns(Type::Int)],
        );
        let base = b.local("base", Type::Int);
        let offset = b.local("offset", Type::Int);
        let done = b.local("done", Type::Unit);
        let k = b.continuation("k");
        let handled = b.handle(
            b.add(b.perform("ask", vec![]), b.var(base)),
            vec![b.clause("ask", Some(k), vec![], b.resume(k, b.var(offset)))],
            Some(b.var(done)),
        );
        let HirExprKind::Handle(handle) = &handled.kind else {
            panic!("expected a handler");
        };
        let captured: Vec<_> = handler_captures(handle).into_iter().collect();
        assert_eq!(captured, vec![base, offset]);
    }
}
