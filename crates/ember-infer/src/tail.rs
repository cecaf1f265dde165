//! Resumption-count enforcement for handler clauses.

use ember_hir::{TailEnforcement, TailResumptionInfo};
use ember_types::{EffectOperation, ResumeKind};

use crate::usage::ContinuationUsage;

/// A resumption count the analysis proved wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeViolation {
    /// A `tail` clause never calls its continuation.
    NeverResumes,
    /// A `tail` clause calls its continuation at least `min` (> 1) times.
    ResumesRepeatedly { min: u32 },
    /// A clause calls the continuation of an operation that never returns.
    ResumesNonReturning,
}

/// Classify a clause's continuation usage for `op`.
///
/// `tail` operations get static enforcement only when the clause provably
/// calls its continuation exactly once without escaping; everything else is
/// guarded at runtime. A definite miscount is additionally reported. `resume`
/// operations never need a guard.
pub fn enforce_tail_resumption(
    op: &EffectOperation,
    usage: ContinuationUsage,
) -> (TailResumptionInfo, Option<ResumeViolation>) {
    let (enforcement, violation) = match op.resumable {
        ResumeKind::Tail => {
            let enforcement = if usage.is_exactly_once() {
                TailEnforcement::Static
            } else {
                TailEnforcement::Runtime
            };
            let violation = if usage.definitely_zero() {
                Some(ResumeViolation::NeverResumes)
            } else if usage.definitely_many() {
                Some(ResumeViolation::ResumesRepeatedly { min: usage.min })
            } else {
                None
            };
            (enforcement, violation)
        }
        ResumeKind::Resume => {
            let violation = (op.never_resumes() && !usage.escapes && !usage.max.is_zero())
                .then_some(ResumeViolation::ResumesNonReturning);
            (TailEnforcement::Static, violation)
        }
    };
    let info = TailResumptionInfo {
        enforcement,
        calls: usage.max,
        min_calls: usage.min,
        escapes: usage.escapes,
    };
    (info, violation)
}
