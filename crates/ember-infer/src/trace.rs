//! Tracing types for handler typing.
//!
//! These capture the decisions made while typing each handler expression so
//! tooling can show why a clause resolved the way it did. Tracing is opt-in
//! via [`crate::EffectChecker::with_tracing`]; nothing is recorded otherwise.

use ember_hir::{ExprId, TailEnforcement};
use serde::Serialize;

use crate::usage::ContinuationUsage;

/// Every step taken while typing one handler expression.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerTrace {
    pub function: String,
    pub handler: ExprId,
    pub steps: Vec<HandlerStep>,
}

/// A single typing step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum HandlerStep {
    /// Effect row of the handled body.
    BodyRow { row: String },
    /// A clause was bound to one operation signature.
    OverloadResolved {
        clause: usize,
        operation: String,
        candidates: usize,
    },
    /// Perform sites of a generic operation agreed on type arguments.
    Instantiation {
        operation: String,
        type_args: Vec<String>,
        sites: usize,
    },
    ContinuationType { clause: usize, ty: String },
    ClauseRow {
        clause: usize,
        row: String,
        reraises: bool,
    },
    /// Body row after removing handled, non-re-raised operations.
    RemainingRow { row: String },
    TailEnforcement {
        clause: usize,
        usage: ContinuationUsage,
        enforcement: TailEnforcement,
    },
}
