//! Type representations for the Ember effect subsystem.
//!
//! This crate defines the semantic types consumed by effect typing and
//! lowering, the effect-operation catalog, and the interned effect-row table.
//! General (non-effect) inference happens upstream; the types here arrive
//! already annotated on HIR nodes.

mod catalog;
mod row;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use catalog::{EffectCatalog, EffectDecl, EffectOperation, OperationId, OperationSpec, ResumeKind};
pub use row::{EffectRow, EffectRowId, EffectRowTable, RowTableError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a type variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeVarId(pub u32);

/// Unique identifier for an open effect-row tail variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVarId(pub u32);

/// An effect-row label: the name of an effect operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub String);

impl Label {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A semantic type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Bool,
    String,
    Unit,
    Never,
    /// Unresolved or generic type variable.
    Var(TypeVarId),
    /// Nominal type with arguments (records, sums, opaque handles).
    Named { name: String, args: Vec<Type> },
    Tuple(Vec<Type>),
    Function(FunctionType),
}

/// Function type: `(params) -[effects]> ret`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub ret: Box<Type>,
    pub effects: EffectRowId,
}

impl FunctionType {
    pub fn pure(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret: Box::new(ret),
            effects: EffectRowId::PURE,
        }
    }

    pub fn with_effects(params: Vec<Type>, ret: Type, effects: EffectRowId) -> Self {
        Self {
            params,
            ret: Box::new(ret),
            effects,
        }
    }
}

impl Type {
    pub fn named(name: impl Into<String>) -> Self {
        Type::Named {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(ft) => Some(ft),
            _ => None,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Unit)
    }

    /// Scalars that can cross an exported (host-visible) function boundary.
    pub fn is_boundary_scalar(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Bool | Type::Unit)
    }

    pub fn has_type_vars(&self) -> bool {
        match self {
            Type::Var(_) => true,
            Type::Named { args, .. } => args.iter().any(Type::has_type_vars),
            Type::Tuple(elems) => elems.iter().any(Type::has_type_vars),
            Type::Function(ft) => {
                ft.params.iter().any(Type::has_type_vars) || ft.ret.has_type_vars()
            }
            Type::Int | Type::Float | Type::Bool | Type::String | Type::Unit | Type::Never => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::Bool => write!(f, "Bool"),
            Type::String => write!(f, "String"),
            Type::Unit => write!(f, "()"),
            Type::Never => write!(f, "Never"),
            Type::Var(var) => write!(f, "t{}", var.0),
            Type::Named { name, args } => {
                write!(f, "{name}")?;
                if !args.is_empty() {
                    write!(f, "(")?;
                    write_comma_separated(f, args)?;
                    write!(f, ")")?;
                }
                Ok(())
            }
            Type::Tuple(elems) => {
                write!(f, "#(")?;
                write_comma_separated(f, elems)?;
                write!(f, ")")
            }
            Type::Function(ft) => {
                write!(f, "(")?;
                write_comma_separated(f, &ft.params)?;
                if ft.effects.is_pure() {
                    write!(f, ") -> {}", ft.ret)
                } else {
                    write!(f, ") -[#{}]> {}", ft.effects.0, ft.ret)
                }
            }
        }
    }
}

fn write_comma_separated(f: &mut fmt::Formatter<'_>, types: &[Type]) -> fmt::Result {
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{ty}")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Substitution and compatibility
// ---------------------------------------------------------------------------

/// Mapping from generic type variables to concrete instantiations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitution {
    pub types: BTreeMap<TypeVarId, Type>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair each type parameter with the argument at the same position.
    pub fn from_pairs(params: &[TypeVarId], args: &[Type]) -> Self {
        Self {
            types: params.iter().copied().zip(args.iter().cloned()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn apply(&self, ty: &Type) -> Type {
        if self.types.is_empty() {
            return ty.clone();
        }
        match ty {
            Type::Var(var) => self.types.get(var).cloned().unwrap_or(Type::Var(*var)),
            Type::Named { name, args } => Type::Named {
                name: name.clone(),
                args: args.iter().map(|arg| self.apply(arg)).collect(),
            },
            Type::Tuple(elems) => Type::Tuple(elems.iter().map(|e| self.apply(e)).collect()),
            Type::Function(ft) => Type::Function(FunctionType {
                params: ft.params.iter().map(|p| self.apply(p)).collect(),
                ret: Box::new(self.apply(&ft.ret)),
                effects: ft.effects,
            }),
            Type::Int | Type::Float | Type::Bool | Type::String | Type::Unit | Type::Never => {
                ty.clone()
            }
        }
    }
}

/// Check whether a value of type `actual` is acceptable where `expected` is required.
///
/// Type variables on either side are treated as unresolved and accept anything;
/// `Never` is accepted everywhere. Effect rows of function types are checked by
/// the effect typer, not here.
pub fn types_compatible(expected: &Type, actual: &Type) -> bool {
    match (expected, actual) {
        (Type::Var(_), _) | (_, Type::Var(_)) | (_, Type::Never) => true,
        (Type::Named { name: a, args: xs }, Type::Named { name: b, args: ys }) => {
            a == b && xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| types_compatible(x, y))
        }
        (Type::Tuple(xs), Type::Tuple(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| types_compatible(x, y))
        }
        (Type::Function(f), Type::Function(g)) => {
            f.params.len() == g.params.len()
                && f.params
                    .iter()
                    .zip(&g.params)
                    .all(|(x, y)| types_compatible(y, x))
                && types_compatible(&f.ret, &g.ret)
        }
        _ => expected == actual,
    }
}

/// Parameter-type equality used for overload matching: compatible in both directions.
pub fn types_match_exactly(left: &Type, right: &Type) -> bool {
    types_compatible(left, right) && types_compatible(right, left)
}
