//! Checks on the surface of exported functions.

use ember_diag::{Category, Diagnostic};
use ember_hir::HirFunction;
use ember_types::EffectRowTable;

/// Exported functions cross the host boundary through a surface wrapper that
/// only understands scalar results, and generic exports need at least one
/// concrete instantiation to emit.
pub fn check_export(function: &HirFunction, rows: &EffectRowTable) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if !function.exported {
        return diagnostics;
    }
    let location = function.span.location();

    if !rows.get(function.effects).is_pure() && !function.ret.is_boundary_scalar() {
        diagnostics.push(
            Diagnostic::error(
                Category::EffectfulExportReturn,
                format!(
                    "exported effectful function `{}` returns `{}`",
                    function.name, function.ret
                ),
            )
            .at(location)
            .with_help("exports that perform effects may only return Int, Float, Bool or ()"),
        );
    }

    if function.is_generic() && function.instantiations.is_empty() {
        diagnostics.push(
            Diagnostic::error(
                Category::MissingExportInstantiation,
                format!(
                    "exported generic function `{}` lists no instantiation",
                    function.name
                ),
            )
            .at(location),
        );
    }
    diagnostics
}
