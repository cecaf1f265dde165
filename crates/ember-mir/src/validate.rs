//! Structural checks over a finished [`MirModule`].

use std::collections::BTreeSet;

use crate::{MirFunction, MirInst, MirModule, MirValueId};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MirError {
    #[error("duplicate function `{function}`")]
    DuplicateFunction { function: String },
    #[error("`{function}` jumps to missing block b{block}")]
    UnknownBlock { function: String, block: u32 },
    #[error("`{function}` references unknown local %{value}")]
    UnknownLocal { function: String, value: u32 },
    #[error("`{function}` references unknown layout #{layout}")]
    UnknownLayout { function: String, layout: u32 },
    #[error("`{function}` references unknown function `{callee}`")]
    UnknownFunction { function: String, callee: String },
    #[error("`{function}` references unknown global g{global}")]
    UnknownGlobal { function: String, global: u32 },
    #[error("`{function}` accesses field {field} of `{layout}` which has {count} fields")]
    FieldOutOfRange {
        function: String,
        layout: String,
        field: u32,
        count: usize,
    },
    #[error("`{function}` builds `{layout}` with {actual} fields, expected {expected}")]
    FieldCountMismatch {
        function: String,
        layout: String,
        expected: usize,
        actual: usize,
    },
    #[error("export `{export}` names unknown function `{function}`")]
    UnknownExport { export: String, function: String },
}

/// Every problem found, in function order. An empty list means the module is
/// well formed.
pub fn validate_module(module: &MirModule) -> Vec<MirError> {
    let mut errors = Vec::new();
    let mut names = BTreeSet::new();
    for function in &module.functions {
        if !names.insert(function.name.as_str()) {
            errors.push(MirError::DuplicateFunction {
                function: function.name.clone(),
            });
        }
    }

    for function in &module.functions {
        validate_function(module, &names, function, &mut errors);
    }

    for export in &module.exports {
        if !names.contains(export.function.as_str()) {
            errors.push(MirError::UnknownExport {
                export: export.name.clone(),
                function: export.function.clone(),
            });
        }
    }
    errors
}

fn validate_function(
    module: &MirModule,
    names: &BTreeSet<&str>,
    function: &MirFunction,
    errors: &mut Vec<MirError>,
) {
    let name = || function.name.clone();
    let check_local = |value: MirValueId, errors: &mut Vec<MirError>| {
        if value.0 as usize >= function.locals.len() {
            errors.push(MirError::UnknownLocal {
                function: name(),
                value: value.0,
            });
        }
    };

    for block in &function.blocks {
        for inst in &block.instructions {
            for value in inst.operands().into_iter().chain(inst.dest()) {
                check_local(value, errors);
            }
            match inst {
                MirInst::Call { callee, .. } | MirInst::FuncRef { function: callee, .. } => {
                    if !names.contains(callee.as_str()) {
                        errors.push(MirError::UnknownFunction {
                            function: name(),
                            callee: callee.clone(),
                        });
                    }
                }
                MirInst::StructNew { layout, fields, .. } => match module.layout(*layout) {
                    Some(decl) if decl.fields.len() != fields.len() => {
                        errors.push(MirError::FieldCountMismatch {
                            function: name(),
                            layout: decl.name.clone(),
                            expected: decl.fields.len(),
                            actual: fields.len(),
                        });
                    }
                    Some(_) => {}
                    None => errors.push(MirError::UnknownLayout {
                        function: name(),
                        layout: layout.0,
                    }),
                },
                MirInst::StructGet { layout, field, .. }
                | MirInst::StructSet { layout, field, .. } => match module.layout(*layout) {
                    Some(decl) if *field as usize >= decl.fields.len() => {
                        errors.push(MirError::FieldOutOfRange {
                            function: name(),
                            layout: decl.name.clone(),
                            field: *field,
                            count: decl.fields.len(),
                        });
                    }
                    Some(_) => {}
                    None => errors.push(MirError::UnknownLayout {
                        function: name(),
                        layout: layout.0,
                    }),
                },
                MirInst::GlobalGet { global, .. } | MirInst::GlobalSet { global, .. } => {
                    if module.global(*global).is_none() {
                        errors.push(MirError::UnknownGlobal {
                            function: name(),
                            global: global.0,
                        });
                    }
                }
                _ => {}
            }
        }

        for value in block.terminator.operands() {
            check_local(value, errors);
        }
        for target in block.terminator.successors() {
            if function.block(target).is_none() {
                errors.push(MirError::UnknownBlock {
                    function: name(),
                    block: target.0,
                });
            }
        }
    }
}
