//! Continuation usage analysis.
//!
//! A structural abstract interpretation over a clause body that bounds how
//! many times the clause's continuation symbol is called. The result is a
//! conservative approximation: `min` never overstates, `max` never
//! understates, and any use the analysis cannot follow sets `escapes`.

use ember_hir::{CallBound, Callee, HirExpr, HirExprKind, SymbolId};
use serde::Serialize;

/// Bounds on continuation calls for one subexpression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContinuationUsage {
    pub min: u32,
    pub max: CallBound,
    pub escapes: bool,
}

impl Default for ContinuationUsage {
    fn default() -> Self {
        Self::NONE
    }
}

impl ContinuationUsage {
    pub const NONE: Self = Self {
        min: 0,
        max: CallBound::Finite(0),
        escapes: false,
    };

    pub const ONCE: Self = Self {
        min: 1,
        max: CallBound::Finite(1),
        escapes: false,
    };

    /// Both subexpressions run, one after the other.
    pub fn then(self, next: Self) -> Self {
        Self {
            min: self.min.saturating_add(next.min),
            max: self.max.saturating_add(next.max),
            escapes: self.escapes || next.escapes,
        }
    }

    /// Exactly one of the two alternatives runs.
    pub fn branch(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            escapes: self.escapes || other.escapes,
        }
    }

    /// The subexpression runs an unknown number of times, possibly zero.
    pub fn repeated(self) -> Self {
        Self {
            min: 0,
            max: if self.max.is_zero() {
                CallBound::Finite(0)
            } else {
                CallBound::Unbounded
            },
            escapes: self.escapes,
        }
    }

    /// Any use at all is an escape; the count no longer matters.
    pub fn captured(self) -> Self {
        if self.is_unused() {
            self
        } else {
            Self {
                min: 0,
                max: CallBound::Finite(0),
                escapes: true,
            }
        }
    }

    pub fn is_unused(&self) -> bool {
        self.max.is_zero() && !self.escapes
    }

    pub fn is_exactly_once(&self) -> bool {
        self.min == 1 && self.max == CallBound::Finite(1) && !self.escapes
    }

    /// Proven to never call the continuation.
    pub fn definitely_zero(&self) -> bool {
        self.max.is_zero() && !self.escapes
    }

    /// Proven to call the continuation at least twice.
    pub fn definitely_many(&self) -> bool {
        self.min > 1 && !self.escapes
    }
}

/// Bound the calls to `target` made while evaluating `expr`.
pub fn analyze_continuation_usage(expr: &HirExpr, target: SymbolId) -> ContinuationUsage {
    Analyzer { target }.expr(expr).usage
}

/// Usage of a subexpression together with how control can leave it.
///
/// `leaves` is set when some path exits early through `break`, `continue` or
/// `return`; code sequenced after such a subexpression only runs on some
/// paths, so its calls no longer contribute to `min`. `diverges` is set when
/// no path falls through at all.
#[derive(Debug, Clone, Copy, Default)]
struct Flow {
    usage: ContinuationUsage,
    leaves: bool,
    breaks: bool,
    returns: bool,
    diverges: bool,
}

impl Flow {
    fn plain(usage: ContinuationUsage) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    fn then(self, next: Self) -> Self {
        if self.diverges {
            return self;
        }
        let next_usage = if self.leaves {
            ContinuationUsage {
                min: 0,
                ..next.usage
            }
        } else {
            next.usage
        };
        Self {
            usage: self.usage.then(next_usage),
            leaves: self.leaves || next.leaves,
            breaks: self.breaks || next.breaks,
            returns: self.returns || next.returns,
            diverges: next.diverges,
        }
    }

    fn branch(self, other: Self) -> Self {
        Self {
            usage: self.usage.branch(other.usage),
            leaves: self.leaves || other.leaves,
            breaks: self.breaks || other.breaks,
            returns: self.returns || other.returns,
            diverges: self.diverges && other.diverges,
        }
    }

    /// Wrap a loop body: `break` and `continue` stop at the loop, and a loop
    /// without `break` never falls through.
    fn looped(self, usage: ContinuationUsage) -> Self {
        Self {
            usage,
            leaves: self.returns,
            breaks: false,
            returns: self.returns,
            diverges: !self.breaks,
        }
    }
}

struct Analyzer {
    target: SymbolId,
}

impl Analyzer {
    fn expr(&self, expr: &HirExpr) -> Flow {
        match &expr.kind {
            HirExprKind::Lit(_) => Flow::default(),
            HirExprKind::Continue => Flow {
                leaves: true,
                diverges: true,
                ..Flow::default()
            },
            HirExprKind::Var(symbol) => {
                if *symbol == self.target {
                    Flow::plain(ContinuationUsage {
                        escapes: true,
                        ..ContinuationUsage::NONE
                    })
                } else {
                    Flow::default()
                }
            }
            HirExprKind::Let { value, .. } | HirExprKind::Assign { value, .. } => self.expr(value),
            HirExprKind::Block(items) | HirExprKind::Tuple(items) => self.sequence(items),
            HirExprKind::Binary { left, right, .. } => self.expr(left).then(self.expr(right)),
            HirExprKind::Call { callee, args } => {
                let args = self.sequence(args);
                match callee {
                    Callee::Expr(callee)
                        if matches!(callee.kind, HirExprKind::Var(symbol) if symbol == self.target) =>
                    {
                        args.then(Flow::plain(ContinuationUsage::ONCE))
                    }
                    Callee::Expr(callee) => self.expr(callee).then(args),
                    Callee::Function(_) => args,
                }
            }
            HirExprKind::MethodCall { receiver, args, .. } => {
                self.expr(receiver).then(self.sequence(args))
            }
            HirExprKind::Perform { args, .. } => self.sequence(args),
            HirExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let taken = self.expr(then_branch);
                let other = else_branch
                    .as_ref()
                    .map(|e| self.expr(e))
                    .unwrap_or_default();
                self.expr(condition).then(taken.branch(other))
            }
            HirExprKind::Match { scrutinee, arms } => {
                let merged = arms
                    .iter()
                    .map(|arm| {
                        let guard = arm
                            .guard
                            .as_ref()
                            .map(|g| self.expr(g))
                            .unwrap_or_default();
                        guard.then(self.expr(&arm.body))
                    })
                    .reduce(Flow::branch)
                    .unwrap_or_default();
                self.expr(scrutinee).then(merged)
            }
            HirExprKind::Cond { arms, default } => {
                // Path i evaluates conditions 0..=i and then body i; the
                // fall-through path evaluates every condition.
                let mut tested = Flow::default();
                let mut merged: Option<Flow> = None;
                for arm in arms {
                    tested = tested.then(self.expr(&arm.condition));
                    let path = tested.then(self.expr(&arm.body));
                    merged = Some(merged.map_or(path, |m| m.branch(path)));
                }
                let fallthrough =
                    tested.then(default.as_ref().map(|d| self.expr(d)).unwrap_or_default());
                merged.map_or(fallthrough, |m| m.branch(fallthrough))
            }
            HirExprKind::Loop { body } => {
                let body = self.expr(body);
                body.looped(body.usage.repeated())
            }
            HirExprKind::While { condition, body } => {
                // The condition runs at least once; further iterations may not.
                let first = self.expr(condition);
                let iteration = first.then(self.expr(body));
                let usage = first.usage.then(iteration.usage.repeated());
                Flow {
                    diverges: false,
                    ..iteration.looped(usage)
                }
            }
            HirExprKind::Break(value) => self.exit(value.as_deref(), true),
            HirExprKind::Return(value) => self.exit(value.as_deref(), false),
            HirExprKind::Lambda { body, .. } => Flow::plain(self.expr(body).usage.captured()),
            HirExprKind::Handle(handle) => {
                let clauses = handle
                    .clauses
                    .iter()
                    .map(|clause| {
                        let body = self.expr(&clause.body);
                        Flow {
                            usage: body.usage.repeated(),
                            leaves: body.leaves,
                            returns: body.returns,
                            ..Flow::default()
                        }
                    })
                    .fold(Flow::default(), Flow::then);
                let finally = handle
                    .finally
                    .as_ref()
                    .map(|f| self.expr(f))
                    .unwrap_or_default();
                self.expr(&handle.body).then(clauses).then(finally)
            }
        }
    }

    fn exit(&self, value: Option<&HirExpr>, is_break: bool) -> Flow {
        let value = value.map(|v| self.expr(v)).unwrap_or_default();
        if value.diverges {
            return value;
        }
        Flow {
            usage: value.usage,
            leaves: true,
            breaks: value.breaks || is_break,
            returns: value.returns || !is_break,
            diverges: true,
        }
    }

    fn sequence(&self, items: &[HirExpr]) -> Flow {
        items
            .iter()
            .fold(Flow::default(), |acc, item| acc.then(self.expr(item)))
    }
}
