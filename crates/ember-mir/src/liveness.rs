//! Liveness over suspension sites.
//!
//! Lowering turns every site (a `perform`, an effectful call, or a handler
//! whose residual row is non-empty) into a point where the running function
//! may return a suspended outcome and be re-entered later. Whatever is live
//! across that point has to be saved into heap state first. This module builds
//! an explicit CFG over one HIR body and solves backward liveness on it.
//!
//! Nested lambdas and handler bodies are compiled as separate functions, so
//! the graph treats them as single nodes that read their captured symbols.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ember_hir::{
    Callee, ExprId, HirExpr, HirExprKind, HirPattern, SymbolId, free_symbols, handler_captures,
};
use ember_types::Type;
use fixedbitset::FixedBitSet;
use serde::Serialize;
use tracing::debug;

/// Decides which expressions are suspension sites.
pub trait SiteOracle {
    fn is_site(&self, expr: &HirExpr) -> bool;
}

impl<F> SiteOracle for F
where
    F: Fn(&HirExpr) -> bool,
{
    fn is_site(&self, expr: &HirExpr) -> bool {
        self(expr)
    }
}

/// An operand already evaluated into a register when a later operand of the
/// same expression reaches a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TempCaptureDraft {
    pub key: String,
    /// Call, method call, perform, tuple or binary expression owning the operand.
    pub owner: ExprId,
    /// Operand position, counting a callee expression or receiver as operand 0.
    pub index: usize,
    pub ty: Type,
}

pub fn temp_key(owner: ExprId, index: usize) -> String {
    format!("__tmp_{}_{index}", owner.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteLiveness {
    pub site: ExprId,
    /// Symbols that must survive a suspension at this site.
    pub live_out: BTreeSet<SymbolId>,
    /// Earlier operands without a site of their own.
    pub captures: Vec<TempCaptureDraft>,
    /// Results of earlier operands that were themselves sites. These are not
    /// temp captures: the operand is never recomputed, but its value is
    /// already in a register and must be held across this suspension.
    pub held_results: Vec<TempCaptureDraft>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessStats {
    pub nodes: usize,
    pub reachable: usize,
    pub iterations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivenessResult {
    /// Reachable sites in the order the graph created them.
    pub sites: Vec<SiteLiveness>,
    pub stats: LivenessStats,
}

impl LivenessResult {
    pub fn site(&self, id: ExprId) -> Option<&SiteLiveness> {
        self.sites.iter().find(|s| s.site == id)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

type NodeId = usize;

#[derive(Debug, Default)]
struct CfgNode {
    uses: BTreeSet<SymbolId>,
    defs: BTreeSet<SymbolId>,
    successors: Vec<NodeId>,
    site: Option<ExprId>,
    captures: Vec<TempCaptureDraft>,
    held: Vec<TempCaptureDraft>,
}

/// Piece of graph for one expression. `exits` is empty when control never
/// falls through (break, continue, return).
#[derive(Debug)]
struct Subgraph {
    entry: NodeId,
    exits: Vec<NodeId>,
    sites: Vec<NodeId>,
}

struct LoopTargets {
    head: NodeId,
    break_join: NodeId,
}

struct CfgBuilder<'o, O: ?Sized> {
    oracle: &'o O,
    nodes: Vec<CfgNode>,
    loops: Vec<LoopTargets>,
    exit: NodeId,
}

impl<'o, O: SiteOracle + ?Sized> CfgBuilder<'o, O> {
    fn new(oracle: &'o O) -> Self {
        let mut builder = Self {
            oracle,
            nodes: Vec::new(),
            loops: Vec::new(),
            exit: 0,
        };
        builder.exit = builder.node();
        builder
    }

    fn node(&mut self) -> NodeId {
        self.nodes.push(CfgNode::default());
        self.nodes.len() - 1
    }

    fn edge(&mut self, from: NodeId, to: NodeId) {
        if !self.nodes[from].successors.contains(&to) {
            self.nodes[from].successors.push(to);
        }
    }

    fn wire(&mut self, exits: &[NodeId], to: NodeId) {
        for &exit in exits {
            self.edge(exit, to);
        }
    }

    fn single(&mut self) -> Subgraph {
        let n = self.node();
        Subgraph {
            entry: n,
            exits: vec![n],
            sites: Vec::new(),
        }
    }

    /// Chain `parts` in order. An empty chain is a single pass-through node.
    fn sequence(&mut self, parts: Vec<Subgraph>) -> Subgraph {
        let mut iter = parts.into_iter();
        let Some(mut acc) = iter.next() else {
            return self.single();
        };
        for next in iter {
            self.wire(&acc.exits, next.entry);
            acc.exits = next.exits;
            acc.sites.extend(next.sites);
        }
        acc
    }

    /// Evaluate `operands` left to right, then a final node for `owner`.
    fn operands(&mut self, owner: &HirExpr, operands: &[&HirExpr]) -> Subgraph {
        let graphs: Vec<Subgraph> = operands.iter().map(|op| self.expr(op)).collect();

        for (i, later) in graphs.iter().enumerate() {
            if later.sites.is_empty() {
                continue;
            }
            for (j, earlier) in graphs.iter().enumerate().take(i) {
                let draft = TempCaptureDraft {
                    key: temp_key(owner.id, j),
                    owner: owner.id,
                    index: j,
                    ty: operands[j].ty.clone(),
                };
                for &site in &later.sites {
                    let node = &mut self.nodes[site];
                    if earlier.sites.is_empty() {
                        node.captures.push(draft.clone());
                    } else {
                        node.held.push(draft.clone());
                    }
                }
            }
        }

        let last = self.node();
        let mut chain = graphs;
        let is_site = self.oracle.is_site(owner);
        if is_site {
            self.nodes[last].site = Some(owner.id);
        }
        chain.push(Subgraph {
            entry: last,
            exits: vec![last],
            sites: if is_site { vec![last] } else { Vec::new() },
        });
        self.sequence(chain)
    }

    fn expr(&mut self, expr: &HirExpr) -> Subgraph {
        match &expr.kind {
            HirExprKind::Lit(_) => self.single(),
            HirExprKind::Var(symbol) => {
                let g = self.single();
                self.nodes[g.entry].uses.insert(*symbol);
                g
            }
            HirExprKind::Let { symbol, value } | HirExprKind::Assign { symbol, value } => {
                let value = self.expr(value);
                let bind = self.single();
                self.nodes[bind.entry].defs.insert(*symbol);
                self.sequence(vec![value, bind])
            }
            HirExprKind::Block(items) => {
                let parts = items.iter().map(|item| self.expr(item)).collect();
                self.sequence(parts)
            }
            HirExprKind::Tuple(items) => {
                let operands: Vec<&HirExpr> = items.iter().collect();
                self.operands(expr, &operands)
            }
            HirExprKind::Binary { left, right, .. } => self.operands(expr, &[&**left, &**right]),
            HirExprKind::Call { callee, args } => {
                let mut operands: Vec<&HirExpr> = Vec::with_capacity(args.len() + 1);
                if let Callee::Expr(callee) = callee {
                    operands.push(callee);
                }
                operands.extend(args);
                self.operands(expr, &operands)
            }
            HirExprKind::MethodCall { receiver, args, .. } => {
                let mut operands: Vec<&HirExpr> = vec![&**receiver];
                operands.extend(args);
                self.operands(expr, &operands)
            }
            HirExprKind::Perform { args, .. } => {
                let operands: Vec<&HirExpr> = args.iter().collect();
                self.operands(expr, &operands)
            }
            HirExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(condition);
                let then_g = self.expr(then_branch);
                let join = self.node();
                self.wire(&cond.exits, then_g.entry);
                self.wire(&then_g.exits, join);
                let mut sites = cond.sites;
                sites.extend(then_g.sites);
                match else_branch {
                    Some(else_branch) => {
                        let else_g = self.expr(else_branch);
                        self.wire(&cond.exits, else_g.entry);
                        self.wire(&else_g.exits, join);
                        sites.extend(else_g.sites);
                    }
                    None => self.wire(&cond.exits, join),
                }
                Subgraph {
                    entry: cond.entry,
                    exits: vec![join],
                    sites,
                }
            }
            HirExprKind::Match { scrutinee, arms } => {
                let scrut = self.expr(scrutinee);
                let join = self.node();
                let mut sites = scrut.sites;
                let mut pending = scrut.exits;
                for arm in arms {
                    let test = self.node();
                    self.wire(&pending, test);
                    if let HirPattern::Bind(symbol) = arm.pattern {
                        self.nodes[test].defs.insert(symbol);
                    }
                    let mut next = Vec::new();
                    if matches!(arm.pattern, HirPattern::Lit(_)) {
                        next.push(test);
                    }
                    let guard = arm.guard.as_ref().map(|guard| self.expr(guard));
                    let body = self.expr(&arm.body);
                    match guard {
                        Some(guard_g) => {
                            self.edge(test, guard_g.entry);
                            self.wire(&guard_g.exits, body.entry);
                            next.extend(guard_g.exits.iter().copied());
                            sites.extend(guard_g.sites);
                        }
                        None => self.edge(test, body.entry),
                    }
                    self.wire(&body.exits, join);
                    sites.extend(body.sites);
                    pending = next;
                }
                // Falling off the last arm traps; those paths never reach the join.
                Subgraph {
                    entry: scrut.entry,
                    exits: vec![join],
                    sites,
                }
            }
            HirExprKind::Cond { arms, default } => {
                let entry = self.node();
                let join = self.node();
                let mut sites = Vec::new();
                let mut pending = vec![entry];
                for arm in arms {
                    let cond = self.expr(&arm.condition);
                    let body = self.expr(&arm.body);
                    self.wire(&pending, cond.entry);
                    self.wire(&cond.exits, body.entry);
                    self.wire(&body.exits, join);
                    sites.extend(cond.sites);
                    sites.extend(body.sites);
                    pending = cond.exits;
                }
                match default {
                    Some(default) => {
                        let default_g = self.expr(default);
                        self.wire(&pending, default_g.entry);
                        self.wire(&default_g.exits, join);
                        sites.extend(default_g.sites);
                    }
                    None => self.wire(&pending, join),
                }
                Subgraph {
                    entry,
                    exits: vec![join],
                    sites,
                }
            }
            HirExprKind::Loop { body } => {
                let head = self.node();
                let break_join = self.node();
                self.loops.push(LoopTargets { head, break_join });
                let body_g = self.expr(body);
                self.loops.pop();
                self.edge(head, body_g.entry);
                self.wire(&body_g.exits, head);
                Subgraph {
                    entry: head,
                    exits: vec![break_join],
                    sites: body_g.sites,
                }
            }
            HirExprKind::While { condition, body } => {
                let head = self.node();
                let break_join = self.node();
                let cond = self.expr(condition);
                self.loops.push(LoopTargets { head, break_join });
                let body_g = self.expr(body);
                self.loops.pop();
                self.edge(head, cond.entry);
                self.wire(&cond.exits, body_g.entry);
                self.wire(&cond.exits, break_join);
                self.wire(&body_g.exits, head);
                let mut sites = cond.sites;
                sites.extend(body_g.sites);
                Subgraph {
                    entry: head,
                    exits: vec![break_join],
                    sites,
                }
            }
            HirExprKind::Break(value) => {
                let target = self.loops.last().map(|l| l.break_join);
                self.jump(value.as_deref(), target)
            }
            HirExprKind::Continue => {
                let target = self.loops.last().map(|l| l.head);
                self.jump(None, target)
            }
            HirExprKind::Return(value) => {
                let exit = self.exit;
                self.jump(value.as_deref(), Some(exit))
            }
            HirExprKind::Lambda { .. } => {
                let g = self.single();
                self.nodes[g.entry].uses = free_symbols(expr);
                g
            }
            HirExprKind::Handle(handle) => {
                let install = self.node();
                self.nodes[install].uses = handler_captures(handle);
                let mut sites = Vec::new();
                if self.oracle.is_site(expr) {
                    self.nodes[install].site = Some(expr.id);
                    sites.push(install);
                }
                let mut g = Subgraph {
                    entry: install,
                    exits: vec![install],
                    sites,
                };
                if let Some(finally) = &handle.finally {
                    let finally_g = self.expr(finally);
                    g = self.sequence(vec![g, finally_g]);
                }
                g
            }
        }
    }

    /// Optional value, then an unconditional transfer. No fall-through exits.
    fn jump(&mut self, value: Option<&HirExpr>, target: Option<NodeId>) -> Subgraph {
        let transfer = self.single();
        let g = match value {
            Some(value) => {
                let value_g = self.expr(value);
                self.sequence(vec![value_g, transfer])
            }
            None => transfer,
        };
        if let Some(target) = target {
            for &exit in &g.exits {
                self.edge(exit, target);
            }
        }
        Subgraph {
            entry: g.entry,
            exits: Vec::new(),
            sites: g.sites,
        }
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Dense numbering of every symbol the graph mentions.
struct SymbolIndex {
    ids: Vec<SymbolId>,
    slots: BTreeMap<SymbolId, usize>,
}

impl SymbolIndex {
    fn build(nodes: &[CfgNode], live_after: &BTreeSet<SymbolId>) -> Self {
        let mut all: BTreeSet<SymbolId> = live_after.clone();
        for node in nodes {
            all.extend(node.uses.iter().copied());
            all.extend(node.defs.iter().copied());
        }
        let ids: Vec<SymbolId> = all.into_iter().collect();
        let slots = ids.iter().enumerate().map(|(i, s)| (*s, i)).collect();
        Self { ids, slots }
    }

    fn set(&self, symbols: &BTreeSet<SymbolId>) -> FixedBitSet {
        let mut bits = FixedBitSet::with_capacity(self.ids.len());
        for symbol in symbols {
            if let Some(&slot) = self.slots.get(symbol) {
                bits.insert(slot);
            }
        }
        bits
    }

    fn symbols(&self, bits: &FixedBitSet) -> BTreeSet<SymbolId> {
        bits.ones().map(|slot| self.ids[slot]).collect()
    }
}

fn reachable_from(nodes: &[CfgNode], entry: NodeId) -> FixedBitSet {
    let mut seen = FixedBitSet::with_capacity(nodes.len());
    let mut stack = vec![entry];
    while let Some(n) = stack.pop() {
        if seen.put(n) {
            continue;
        }
        stack.extend(nodes[n].successors.iter().copied());
    }
    seen
}

/// Build the CFG for `body`, solve backward liveness with `live_after` live
/// at the exit, and report every reachable site.
pub fn analyze_liveness<O>(
    body: &HirExpr,
    live_after: &BTreeSet<SymbolId>,
    oracle: &O,
) -> LivenessResult
where
    O: SiteOracle + ?Sized,
{
    let mut builder = CfgBuilder::new(oracle);
    let graph = builder.expr(body);
    let exit = builder.exit;
    builder.wire(&graph.exits, exit);
    builder.nodes[exit].uses = live_after.clone();
    let nodes = builder.nodes;

    let reachable = reachable_from(&nodes, graph.entry);
    let index = SymbolIndex::build(&nodes, live_after);

    let mut predecessors: Vec<Vec<NodeId>> = vec![Vec::new(); nodes.len()];
    for (n, node) in nodes.iter().enumerate() {
        if !reachable.contains(n) {
            continue;
        }
        for &succ in &node.successors {
            predecessors[succ].push(n);
        }
    }

    let uses: Vec<FixedBitSet> = nodes.iter().map(|n| index.set(&n.uses)).collect();
    let defs: Vec<FixedBitSet> = nodes.iter().map(|n| index.set(&n.defs)).collect();
    let empty = FixedBitSet::with_capacity(index.ids.len());
    let mut live_in = vec![empty.clone(); nodes.len()];
    let mut live_out = vec![empty; nodes.len()];

    // Nodes are created roughly in program order; seeding in reverse visits
    // later nodes first, which suits a backward problem.
    let mut worklist: VecDeque<NodeId> = reachable.ones().collect::<Vec<_>>().into_iter().rev().collect();
    let mut in_worklist = reachable.clone();
    let mut iterations = 0;

    while let Some(n) = worklist.pop_front() {
        in_worklist.set(n, false);
        iterations += 1;

        let mut out = FixedBitSet::with_capacity(index.ids.len());
        for &succ in &nodes[n].successors {
            out.union_with(&live_in[succ]);
        }
        let mut input = out.clone();
        input.difference_with(&defs[n]);
        input.union_with(&uses[n]);
        live_out[n] = out;

        if input != live_in[n] {
            live_in[n] = input;
            for &pred in &predecessors[n] {
                if !in_worklist.contains(pred) {
                    in_worklist.insert(pred);
                    worklist.push_back(pred);
                }
            }
        }
    }

    let sites = nodes
        .iter()
        .enumerate()
        .filter(|(n, _)| reachable.contains(*n))
        .filter_map(|(n, node)| {
            node.site.map(|site| SiteLiveness {
                site,
                live_out: index.symbols(&live_out[n]),
                captures: node.captures.clone(),
                held_results: node.held.clone(),
            })
        })
        .collect::<Vec<_>>();

    let stats = LivenessStats {
        nodes: nodes.len(),
        reachable: reachable.count_ones(..),
        iterations,
    };
    debug!(
        nodes = stats.nodes,
        reachable = stats.reachable,
        iterations = stats.iterations,
        sites = sites.len(),
        "liveness solved"
    );
    LivenessResult { sites, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_hir::HirBuilder;
    use ember_types::{FunctionType, OperationSpec, ResumeKind};

    fn performs(expr: &HirExpr) -> bool {
        matches!(expr.kind, HirExprKind::Perform { .. })
            || expr.callee_type().is_some_and(|ft| !ft.effects.is_pure())
    }

    fn builder() -> HirBuilder {
        let b = HirBuilder::new();
        b.effect(
            "Io",
            Some(7),
            vec![
                OperationSpec::new("op", ResumeKind::Resume).returns(Type::Int),
                OperationSpec::new("tick", ResumeKind::Tail),
            ],
        );
        b
    }

    fn set(symbols: &[SymbolId]) -> BTreeSet<SymbolId> {
        symbols.iter().copied().collect()
    }

    #[test]
    fn later_operands_stay_live_and_earlier_sites_are_held() {
        let b = builder();
        let effectful = b.row(&["op"]);
        let a_fn = FunctionType::with_effects(vec![], Type::Int, effectful);
        let f_ty = FunctionType::pure(vec![Type::Int, Type::Int, Type::Int], Type::Int);
        let b_pure = b.local("b_pure", Type::Int);

        let a_call = b.call_fn("a_with_effect", a_fn, vec![]);
        let a_site = a_call.id;
        let perform = b.perform("op", vec![]);
        let perform_site = perform.id;
        let call = b.call_fn("f", f_ty, vec![a_call, perform, b.var(b_pure)]);
        let call_id = call.id;

        let result = analyze_liveness(&call, &BTreeSet::new(), &performs);
        let site = result.site(perform_site).expect("perform is a site");

        assert!(site.live_out.contains(&b_pure));
        assert!(site.captures.is_empty());
        assert_eq!(site.held_results.len(), 1);
        assert_eq!(site.held_results[0].owner, call_id);
        assert_eq!(site.held_results[0].index, 0);
        assert_eq!(site.held_results[0].key, temp_key(call_id, 0));

        let first = result.site(a_site).expect("effectful call is a site");
        assert!(first.captures.is_empty());
        assert!(first.held_results.is_empty());
        assert!(first.live_out.contains(&b_pure));
    }

    #[test]
    fn pure_earlier_operand_becomes_a_temp_capture() {
        let b = builder();
        let x = b.local("x", Type::Int);
        let f_ty = FunctionType::pure(vec![Type::Int, Type::Int], Type::Int);
        let perform = b.perform("op", vec![]);
        let site_id = perform.id;
        let call = b.call_fn("f", f_ty, vec![b.add(b.var(x), b.int(1)), perform]);

        let result = analyze_liveness(&call, &BTreeSet::new(), &performs);
        let site = result.site(site_id).expect("site");
        assert_eq!(site.captures.len(), 1);
        assert_eq!(site.captures[0].index, 0);
        assert_eq!(site.captures[0].ty, Type::Int);
        // The sum was computed before the site; `x` itself is dead.
        assert!(site.live_out.is_empty());
    }

    #[test]
    fn straight_line_last_site_sees_exactly_live_after() {
        let b = builder();
        let x = b.local("x", Type::Int);
        let y = b.local("y", Type::Int);
        let outer = b.local("outer", Type::Int);
        let last = b.perform("tick", vec![]);
        let last_id = last.id;
        let body = b.block(vec![
            b.let_(x, b.perform("op", vec![])),
            b.let_(y, b.add(b.var(x), b.int(2))),
            b.perform("tick", vec![]),
            last,
        ]);

        let live_after = set(&[outer, y]);
        let result = analyze_liveness(&body, &live_after, &performs);
        assert_eq!(result.sites.len(), 3);
        assert_eq!(result.sites.last().map(|s| s.site), Some(last_id));
        assert_eq!(result.site(last_id).map(|s| &s.live_out), Some(&live_after));
        // The first site defines `x`, which is needed afterwards but not across it.
        assert_eq!(result.sites[0].live_out, set(&[outer]));
    }

    #[test]
    fn branches_join_liveness() {
        let b = builder();
        let c = b.local("c", Type::Bool);
        let x = b.local("x", Type::Int);
        let y = b.local("y", Type::Int);
        let perform = b.perform("op", vec![]);
        let site_id = perform.id;
        let body = b.block(vec![
            perform,
            b.if_(b.var(c), b.var(x), Some(b.var(y))),
        ]);
        let result = analyze_liveness(&body, &BTreeSet::new(), &performs);
        assert_eq!(result.site(site_id).map(|s| &s.live_out), Some(&set(&[c, x, y])));
    }

    #[test]
    fn code_after_break_is_dropped() {
        let b = builder();
        let dead = b.perform("tick", vec![]);
        let dead_id = dead.id;
        let live = b.perform("tick", vec![]);
        let live_id = live.id;
        let body = b.loop_(b.block(vec![live, b.break_(None), dead]));

        let result = analyze_liveness(&body, &BTreeSet::new(), &performs);
        assert!(result.site(live_id).is_some());
        assert!(result.site(dead_id).is_none());
        assert!(result.stats.reachable < result.stats.nodes);
    }

    #[test]
    fn loop_carried_symbols_are_live_at_the_site() {
        let b = builder();
        let acc = b.local("acc", Type::Int);
        let perform = b.perform("op", vec![]);
        let site_id = perform.id;
        let body = b.block(vec![
            b.let_(acc, b.int(0)),
            b.while_(
                b.var(acc),
                b.assign(acc, b.add(b.var(acc), perform)),
            ),
            b.var(acc),
        ]);
        let result = analyze_liveness(&body, &BTreeSet::new(), &performs);
        let site = result.site(site_id).expect("site");
        // `acc` is reassigned right after the site, so only the operand read
        // before it survives, as a temp capture.
        assert!(site.live_out.is_empty());
        assert_eq!(site.captures.len(), 1);
        assert!(result.stats.iterations >= result.stats.reachable);
    }

    #[test]
    fn lambdas_and_handlers_read_their_captures() {
        let b = builder();
        let x = b.local("x", Type::Int);
        let y = b.local("y", Type::Int);
        let k = b.continuation("k");
        let lambda = b.lambda(vec![], b.var(x));
        let handled = b.handle(
            b.perform("op", vec![]),
            vec![b.clause("op", Some(k), vec![], b.resume(k, b.var(y)))],
            None,
        );
        let handled_id = handled.id;
        let perform = b.perform("tick", vec![]);
        let site_id = perform.id;
        let body = b.block(vec![perform, lambda, handled]);

        let is_site = |e: &HirExpr| performs(e) || e.id == handled_id;
        let result = analyze_liveness(&body, &BTreeSet::new(), &is_site);
        assert_eq!(result.site(site_id).map(|s| &s.live_out), Some(&set(&[x, y])));
        assert_eq!(result.sites.len(), 2);
    }
}
