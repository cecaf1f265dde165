use std::collections::BTreeMap;

use ember_mir::{FunctionKind, MirFunction, MirModule, MirTerminator};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PassStats {
    pub per_function: Vec<FunctionPassStats>,
}

impl PassStats {
    pub fn function(&self, name: &str) -> Option<&FunctionPassStats> {
        self.per_function.iter().find(|f| f.function == name)
    }

    /// Sum over every function.
    pub fn total(&self) -> FunctionPassStats {
        self.per_function
            .iter()
            .fold(FunctionPassStats::default(), |mut acc, f| {
                acc.handler_installs += f.handler_installs;
                acc.frames += f.frames;
                acc.sites += f.sites;
                acc.suspension_points += f.suspension_points;
                acc.traps += f.traps;
                acc.tail_guard_checks += f.tail_guard_checks;
                acc.allocations += f.allocations;
                acc
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FunctionPassStats {
    pub function: String,
    pub handler_installs: usize,
    /// Handler frames built by inline installs.
    pub frames: usize,
    /// Suspension sites found by liveness.
    pub sites: usize,
    pub suspension_points: usize,
    pub traps: usize,
    pub tail_guard_checks: usize,
    pub allocations: usize,
}

/// Per-function stats for every generated function, merging the counts
/// lowering recorded with the ones read off the finished MIR. Runtime
/// helpers are left out.
pub fn collect_pass_stats(
    module: &MirModule,
    recorded: &BTreeMap<String, FunctionPassStats>,
) -> PassStats {
    let per_function = module
        .functions
        .iter()
        .filter(|f| f.kind != FunctionKind::Runtime)
        .map(|f| {
            let mut stats = recorded
                .get(&f.name)
                .cloned()
                .unwrap_or_else(|| FunctionPassStats {
                    function: f.name.clone(),
                    ..FunctionPassStats::default()
                });
            collect_function_stats(f, &mut stats);
            stats
        })
        .collect();
    PassStats { per_function }
}

fn collect_function_stats(function: &MirFunction, stats: &mut FunctionPassStats) {
    for block in &function.blocks {
        if matches!(block.terminator, MirTerminator::Trap(_)) {
            stats.traps += 1;
        }
        stats.allocations += block
            .instructions
            .iter()
            .filter(|inst| inst.is_allocation())
            .count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_mir::{FunctionBuilder, MirType, TrapCode};
    use ember_types::EffectRow;

    #[test]
    fn merges_recorded_and_observed_counts() {
        let mut module = MirModule::new();
        let pair = module.add_layout("pair", vec![]);
        let mut b = FunctionBuilder::new(
            "f",
            FunctionKind::User,
            vec![],
            MirType::Ref,
            false,
            EffectRow::default(),
        );
        let value = b.struct_new(pair, vec![]);
        let present = b.is_null(value);
        b.trap_unless(present, TrapCode::Unreachable);
        b.ret(Some(value));
        module.functions.push(b.finish());

        let mut recorded = BTreeMap::new();
        recorded.insert(
            "f".to_string(),
            FunctionPassStats {
                function: "f".to_string(),
                handler_installs: 2,
                ..FunctionPassStats::default()
            },
        );
        let stats = collect_pass_stats(&module, &recorded);
        let f = stats.function("f").unwrap();
        assert_eq!(f.handler_installs, 2);
        assert_eq!(f.traps, 1);
        assert_eq!(f.allocations, 1);
        assert_eq!(stats.total().traps, 1);
    }
}
