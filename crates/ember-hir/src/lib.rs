//! Typed high-level IR (HIR) for Ember.
//!
//! HIR is the boundary between the upstream frontend (parsing, binding and
//! general inference) and the effect subsystem. Every expression carries a
//! stable [`ExprId`], a resolved type and a span; every local carries a
//! [`SymbolId`] into the module's [`SymbolTable`]. Effect typing mutates handler
//! clauses in place (overload rewrite, tail-resumption info, handler metadata);
//! lowering reads them back.

mod builder;
mod visit;

use std::collections::BTreeMap;
use std::fmt;

use ember_diag::SourceLocation;
use ember_types::{
    EffectCatalog, EffectRowId, EffectRowTable, FunctionType, OperationId, Type, TypeVarId,
};
use serde::{Deserialize, Serialize};

pub use builder::HirBuilder;
pub use visit::{bound_symbols, free_symbols, handler_captures, mentions_symbol};

// ---------------------------------------------------------------------------
// Ids and spans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub u32);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Byte-offset source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub file: u32,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file: u32, start: u32, end: u32) -> Self {
        Self { file, start, end }
    }

    pub fn synthetic() -> Self {
        Self::default()
    }

    pub fn location(self) -> SourceLocation {
        SourceLocation {
            file_id: self.file,
            start: self.start,
            end: self.end,
        }
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Local,
    Param,
    /// Continuation parameter of a handler clause.
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub ty: Type,
    pub kind: SymbolKind,
}

/// Module-wide table of locals, parameters and continuation symbols.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolTable {
    symbols: Vec<SymbolInfo>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>, ty: Type, kind: SymbolKind) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(SymbolInfo {
            name: name.into(),
            ty,
            kind,
        });
        id
    }

    pub fn get(&self, id: SymbolId) -> Option<&SymbolInfo> {
        self.symbols.get(id.0 as usize)
    }

    pub fn ty(&self, id: SymbolId) -> Option<&Type> {
        self.get(id).map(|info| &info.ty)
    }

    pub fn name(&self, id: SymbolId) -> &str {
        self.get(id).map(|info| info.name.as_str()).unwrap_or("?")
    }

    pub fn is_continuation(&self, id: SymbolId) -> bool {
        self.get(id)
            .is_some_and(|info| info.kind == SymbolKind::Continuation)
    }

    pub fn set_type(&mut self, id: SymbolId, ty: Type) {
        if let Some(info) = self.symbols.get_mut(id.0 as usize) {
            info.ty = ty;
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Module and functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HirModule {
    pub catalog: EffectCatalog,
    pub rows: EffectRowTable,
    pub symbols: SymbolTable,
    pub functions: Vec<HirFunction>,
}

impl HirModule {
    pub fn function(&self, name: &str) -> Option<&HirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Declared type of a module-level function.
    pub fn function_type(&self, name: &str) -> Option<FunctionType> {
        self.function(name).map(HirFunction::function_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HirFunction {
    pub name: String,
    pub params: Vec<HirParam>,
    pub ret: Type,
    /// Declared effect row.
    pub effects: EffectRowId,
    pub body: HirExpr,
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub type_params: Vec<TypeVarId>,
    /// Concrete type arguments this function is compiled for, when generic.
    #[serde(default)]
    pub instantiations: Vec<Vec<Type>>,
    #[serde(default)]
    pub span: Span,
}

impl HirFunction {
    pub fn function_type(&self) -> FunctionType {
        FunctionType::with_effects(
            self.params.iter().map(|p| p.ty.clone()).collect(),
            self.ret.clone(),
            self.effects,
        )
    }

    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HirParam {
    pub symbol: SymbolId,
    pub ty: Type,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HirExpr {
    pub id: ExprId,
    pub kind: HirExprKind,
    pub ty: Type,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HirLit {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

/// A module-level function referenced by name, with its resolved type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
    pub ty: FunctionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    /// Direct call to a module function.
    Function(FunctionRef),
    /// Call through a value: closures and continuations.
    Expr(Box<HirExpr>),
}

/// Reference to an effect operation by name. `resolved` is filled by effect
/// typing once overloads are disambiguated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub name: String,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default)]
    pub resolved: Option<OperationId>,
}

impl OperationRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            effect: None,
            resolved: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HirPattern {
    Wildcard,
    Lit(HirLit),
    Bind(SymbolId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: HirPattern,
    #[serde(default)]
    pub guard: Option<HirExpr>,
    pub body: HirExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondArm {
    pub condition: HirExpr,
    pub body: HirExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HirExprKind {
    Lit(HirLit),
    Var(SymbolId),
    /// Binds `symbol` for the remainder of the enclosing block.
    Let {
        symbol: SymbolId,
        value: Box<HirExpr>,
    },
    Assign {
        symbol: SymbolId,
        value: Box<HirExpr>,
    },
    Block(Vec<HirExpr>),
    Tuple(Vec<HirExpr>),
    Binary {
        op: BinOp,
        left: Box<HirExpr>,
        right: Box<HirExpr>,
    },
    Call {
        callee: Callee,
        args: Vec<HirExpr>,
    },
    /// Statically dispatched method call; the receiver is the first argument.
    MethodCall {
        receiver: Box<HirExpr>,
        method: FunctionRef,
        args: Vec<HirExpr>,
    },
    Perform {
        operation: OperationRef,
        /// Type arguments inferred upstream for generic operations.
        #[serde(default)]
        type_args: Vec<Type>,
        args: Vec<HirExpr>,
    },
    If {
        condition: Box<HirExpr>,
        then_branch: Box<HirExpr>,
        else_branch: Option<Box<HirExpr>>,
    },
    Match {
        scrutinee: Box<HirExpr>,
        arms: Vec<MatchArm>,
    },
    Cond {
        arms: Vec<CondArm>,
        default: Option<Box<HirExpr>>,
    },
    Loop {
        body: Box<HirExpr>,
    },
    While {
        condition: Box<HirExpr>,
        body: Box<HirExpr>,
    },
    Break(Option<Box<HirExpr>>),
    Continue,
    Return(Option<Box<HirExpr>>),
    Lambda {
        params: Vec<HirParam>,
        body: Box<HirExpr>,
    },
    Handle(Box<HandleExpr>),
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleExpr {
    pub body: HirExpr,
    pub clauses: Vec<HandlerClause>,
    #[serde(default)]
    pub finally: Option<HirExpr>,
    /// Stable identity used to detect re-entry of the same handler.
    #[serde(default)]
    pub label: Option<String>,
    /// Filled by effect typing; lowering requires it.
    #[serde(default)]
    pub meta: Option<HandlerMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseParam {
    pub symbol: SymbolId,
    /// Explicit annotation from source, required for overloaded operations.
    #[serde(default)]
    pub annotation: Option<Type>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerClause {
    pub operation: OperationRef,
    #[serde(default)]
    pub continuation: Option<SymbolId>,
    pub params: Vec<ClauseParam>,
    pub body: HirExpr,
    #[serde(default)]
    pub tail_resumption: Option<TailResumptionInfo>,
    #[serde(default)]
    pub span: Span,
}

/// Results of typing one handler expression, consumed by lowering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerMeta {
    pub body_row: EffectRowId,
    /// Row of the whole handler expression: unhandled body ops, clause rows,
    /// and the finally row.
    pub row: EffectRowId,
    pub result_ty: Type,
    /// Continuation type per clause, in clause order.
    pub continuation_types: Vec<FunctionType>,
    /// Operations whose clause performs them again.
    pub reraised: Vec<String>,
    /// Agreed type arguments per generic operation.
    pub instantiations: BTreeMap<OperationId, Vec<Type>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailEnforcement {
    /// Proven exactly-once; no runtime guard.
    Static,
    /// Guarded at runtime by the tail-guard counters.
    Runtime,
}

/// Upper bound on continuation calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallBound {
    Finite(u32),
    Unbounded,
}

impl CallBound {
    pub fn saturating_add(self, other: CallBound) -> CallBound {
        match (self, other) {
            (CallBound::Finite(a), CallBound::Finite(b)) => CallBound::Finite(a.saturating_add(b)),
            _ => CallBound::Unbounded,
        }
    }

    pub fn max(self, other: CallBound) -> CallBound {
        match (self, other) {
            (CallBound::Finite(a), CallBound::Finite(b)) => CallBound::Finite(a.max(b)),
            _ => CallBound::Unbounded,
        }
    }

    pub fn is_zero(self) -> bool {
        self == CallBound::Finite(0)
    }
}

impl fmt::Display for CallBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallBound::Finite(n) => write!(f, "{n}"),
            CallBound::Unbounded => write!(f, "inf"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailResumptionInfo {
    pub enforcement: TailEnforcement,
    pub calls: CallBound,
    pub min_calls: u32,
    pub escapes: bool,
}

impl HirExpr {
    pub fn new(id: ExprId, kind: HirExprKind, ty: Type) -> Self {
        Self {
            id,
            kind,
            ty,
            span: Span::synthetic(),
        }
    }

    pub fn is_unit_literal(&self) -> bool {
        matches!(self.kind, HirExprKind::Lit(HirLit::Unit))
    }

    /// Function type of the callee of a call or method call.
    pub fn callee_type(&self) -> Option<&FunctionType> {
        match &self.kind {
            HirExprKind::Call {
                callee: Callee::Function(fref),
                ..
            } => Some(&fref.ty),
            HirExprKind::Call {
                callee: Callee::Expr(callee),
                ..
            } => callee.ty.as_function(),
            HirExprKind::MethodCall { method, .. } => Some(&method.ty),
            _ => None,
        }
    }
}
