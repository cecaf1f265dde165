//! Backend-neutral mid-level IR (MIR) for Ember.
//!
//! MIR is a WASM-like block IR: functions own typed local slots, blocks end in
//! explicit terminators, and heap data lives in struct layouts declared at the
//! module level. Effect lowering targets this IR; it has no coroutine or
//! stack-switching primitive, so suspensions are expressed as ordinary data.
//!
//! The crate also hosts the liveness CFG ([`liveness`]) used to decide which
//! values survive a suspension.

pub mod builder;
mod display;
pub mod liveness;
mod validate;

use ember_hir::BinOp;
use ember_types::EffectRow;
use serde::Serialize;

pub use builder::FunctionBuilder;
pub use liveness::{
    LivenessResult, SiteLiveness, SiteOracle, TempCaptureDraft, analyze_liveness, temp_key,
};
pub use validate::{MirError, validate_module};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MirValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MirBlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LayoutId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GlobalId(pub u32);

/// Value representation. `Any` is the uniform boxed representation used at
/// ABI boundaries (outcome payloads, resume inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirType {
    I32,
    I64,
    F64,
    Ref,
    FuncRef,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirModule {
    pub functions: Vec<MirFunction>,
    pub layouts: Vec<StructLayout>,
    pub globals: Vec<MirGlobal>,
    /// Functions addressable through `FuncRef`, in table order.
    pub table: Vec<String>,
    pub exports: Vec<MirExport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StructLayout {
    pub id: LayoutId,
    pub name: String,
    pub fields: Vec<MirField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MirField {
    pub name: String,
    pub ty: MirType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirGlobal {
    pub id: GlobalId,
    pub name: String,
    pub ty: MirType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirExport {
    /// Host-visible name.
    pub name: String,
    pub function: String,
}

/// What produced a function; used by stats and the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Entry point with the function's own name.
    User,
    /// State machine body `f$sm`.
    StateMachine,
    /// Re-entry `f$resume`.
    Resume,
    /// Pure-surface twin `f_impl`.
    Impl,
    HandlerBody,
    HandlerClause,
    HandlerRun,
    HandlerRerun,
    Lambda,
    Export,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirFunction {
    pub name: String,
    pub kind: FunctionKind,
    pub signature: MirFunctionSignature,
    /// Parameters occupy the first `signature.params.len()` slots.
    pub locals: Vec<MirLocal>,
    pub entry: MirBlockId,
    pub blocks: Vec<MirBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirFunctionSignature {
    pub params: Vec<MirType>,
    pub ret: MirType,
    /// Compiled with the effect ABI: a leading handler-frame parameter and an
    /// outcome result.
    pub effectful: bool,
    pub effects: EffectRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirLocal {
    pub ty: MirType,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirBlock {
    pub id: MirBlockId,
    pub instructions: Vec<MirInst>,
    pub terminator: MirTerminator,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MirInst {
    Const {
        dest: MirValueId,
        literal: MirLiteral,
    },
    Move {
        dest: MirValueId,
        src: MirValueId,
    },
    Binary {
        dest: MirValueId,
        op: BinOp,
        left: MirValueId,
        right: MirValueId,
    },
    Call {
        dest: Option<MirValueId>,
        callee: String,
        args: Vec<MirValueId>,
    },
    CallIndirect {
        dest: Option<MirValueId>,
        callee: MirValueId,
        args: Vec<MirValueId>,
    },
    FuncRef {
        dest: MirValueId,
        function: String,
    },
    StructNew {
        dest: MirValueId,
        layout: LayoutId,
        fields: Vec<MirValueId>,
    },
    StructGet {
        dest: MirValueId,
        layout: LayoutId,
        object: MirValueId,
        field: u32,
    },
    StructSet {
        layout: LayoutId,
        object: MirValueId,
        field: u32,
        value: MirValueId,
    },
    RefNull {
        dest: MirValueId,
    },
    IsNull {
        dest: MirValueId,
        value: MirValueId,
    },
    GlobalGet {
        dest: MirValueId,
        global: GlobalId,
    },
    GlobalSet {
        global: GlobalId,
        value: MirValueId,
    },
    Box {
        dest: MirValueId,
        value: MirValueId,
    },
    Unbox {
        dest: MirValueId,
        value: MirValueId,
        ty: MirType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MirLiteral {
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MirTerminator {
    Jump {
        target: MirBlockId,
    },
    Branch {
        condition: MirValueId,
        then_block: MirBlockId,
        else_block: MirBlockId,
    },
    Switch {
        value: MirValueId,
        targets: Vec<MirBlockId>,
        default: MirBlockId,
    },
    Return {
        value: Option<MirValueId>,
    },
    Trap(TrapCode),
}

/// Reasons generated code aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapCode {
    /// A clause was entered with a request for a different operation.
    OperationMismatch,
    /// A runtime-guarded `tail` clause resumed other than exactly once.
    TailGuardMismatch,
    /// Re-entry with a state record the function does not recognize.
    MalformedResume,
    /// No installed frame handles the performed operation.
    UnhandledOperation,
    /// A computation typed as pure suspended.
    UnexpectedSuspension,
    /// An exported function suspended at the host boundary.
    SuspendedExport,
    /// No match arm applied, or control reached dead code.
    Unreachable,
}

impl TrapCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapCode::OperationMismatch => "operation_mismatch",
            TrapCode::TailGuardMismatch => "tail_guard_mismatch",
            TrapCode::MalformedResume => "malformed_resume",
            TrapCode::UnhandledOperation => "unhandled_operation",
            TrapCode::UnexpectedSuspension => "unexpected_suspension",
            TrapCode::SuspendedExport => "suspended_export",
            TrapCode::Unreachable => "unreachable",
        }
    }
}

impl MirModule {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            layouts: Vec::new(),
            globals: Vec::new(),
            table: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&MirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn layout(&self, id: LayoutId) -> Option<&StructLayout> {
        self.layouts.get(id.0 as usize)
    }

    pub fn layout_named(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.iter().find(|l| l.name == name)
    }

    pub fn global(&self, id: GlobalId) -> Option<&MirGlobal> {
        self.globals.get(id.0 as usize)
    }

    /// Declare a layout, returning its id.
    pub fn add_layout(&mut self, name: impl Into<String>, fields: Vec<MirField>) -> LayoutId {
        let id = LayoutId(self.layouts.len() as u32);
        self.layouts.push(StructLayout {
            id,
            name: name.into(),
            fields,
        });
        id
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: MirType, mutable: bool) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(MirGlobal {
            id,
            name: name.into(),
            ty,
            mutable,
        });
        id
    }

    /// Index of `function` in the function table, registering it if needed.
    pub fn table_index(&mut self, function: &str) -> u32 {
        match self.table.iter().position(|f| f == function) {
            Some(index) => index as u32,
            None => {
                self.table.push(function.to_string());
                (self.table.len() - 1) as u32
            }
        }
    }
}

impl Default for MirModule {
    fn default() -> Self {
        Self::new()
    }
}

impl MirField {
    pub fn new(name: impl Into<String>, ty: MirType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl MirFunction {
    pub fn block(&self, id: MirBlockId) -> Option<&MirBlock> {
        self.blocks.get(id.0 as usize)
    }

    pub fn param_count(&self) -> usize {
        self.signature.params.len()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &MirInst> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Names of every function this one calls directly or takes a reference to.
    pub fn referenced_functions(&self) -> Vec<&str> {
        self.instructions()
            .filter_map(|inst| match inst {
                MirInst::Call { callee, .. } => Some(callee.as_str()),
                MirInst::FuncRef { function, .. } => Some(function.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl MirInst {
    /// Local written by this instruction, if any.
    pub fn dest(&self) -> Option<MirValueId> {
        match self {
            MirInst::Const { dest, .. }
            | MirInst::Move { dest, .. }
            | MirInst::Binary { dest, .. }
            | MirInst::FuncRef { dest, .. }
            | MirInst::StructNew { dest, .. }
            | MirInst::StructGet { dest, .. }
            | MirInst::RefNull { dest }
            | MirInst::IsNull { dest, .. }
            | MirInst::GlobalGet { dest, .. }
            | MirInst::Box { dest, .. }
            | MirInst::Unbox { dest, .. } => Some(*dest),
            MirInst::Call { dest, .. } | MirInst::CallIndirect { dest, .. } => *dest,
            MirInst::StructSet { .. } | MirInst::GlobalSet { .. } => None,
        }
    }

    /// Locals read by this instruction.
    pub fn operands(&self) -> Vec<MirValueId> {
        match self {
            MirInst::Const { .. }
            | MirInst::FuncRef { .. }
            | MirInst::RefNull { .. }
            | MirInst::GlobalGet { .. } => Vec::new(),
            MirInst::Move { src, .. } => vec![*src],
            MirInst::Binary { left, right, .. } => vec![*left, *right],
            MirInst::Call { args, .. } => args.clone(),
            MirInst::CallIndirect { callee, args, .. } => {
                let mut out = vec![*callee];
                out.extend(args);
                out
            }
            MirInst::StructNew { fields, .. } => fields.clone(),
            MirInst::StructGet { object, .. } => vec![*object],
            MirInst::StructSet { object, value, .. } => vec![*object, *value],
            MirInst::IsNull { value, .. }
            | MirInst::Box { value, .. }
            | MirInst::Unbox { value, .. } => vec![*value],
            MirInst::GlobalSet { value, .. } => vec![*value],
        }
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self, MirInst::StructNew { .. } | MirInst::Box { .. })
    }
}

impl MirTerminator {
    pub fn successors(&self) -> Vec<MirBlockId> {
        match self {
            MirTerminator::Jump { target } => vec![*target],
            MirTerminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            MirTerminator::Switch {
                targets, default, ..
            } => {
                let mut out = targets.clone();
                out.push(*default);
                out
            }
            MirTerminator::Return { .. } | MirTerminator::Trap(_) => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<MirValueId> {
        match self {
            MirTerminator::Branch { condition, .. } => vec![*condition],
            MirTerminator::Switch { value, .. } => vec![*value],
            MirTerminator::Return { value } => value.iter().copied().collect(),
            MirTerminator::Jump { .. } | MirTerminator::Trap(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_is_stable() {
        let mut module = MirModule::new();
        assert_eq!(module.table_index("a"), 0);
        assert_eq!(module.table_index("b"), 1);
        assert_eq!(module.table_index("a"), 0);
        assert_eq!(module.table, vec!["a", "b"]);
    }

    #[test]
    fn instruction_classifiers() {
        let call = MirInst::CallIndirect {
            dest: Some(MirValueId(3)),
            callee: MirValueId(0),
            args: vec![MirValueId(1), MirValueId(2)],
        };
        assert_eq!(call.dest(), Some(MirValueId(3)));
        assert_eq!(call.operands().len(), 3);
        assert!(!call.is_allocation());

        let set = MirInst::StructSet {
            layout: LayoutId(0),
            object: MirValueId(0),
            field: 1,
            value: MirValueId(2),
        };
        assert_eq!(set.dest(), None);
    }

    #[test]
    fn switch_successors_include_default() {
        let term = MirTerminator::Switch {
            value: MirValueId(0),
            targets: vec![MirBlockId(1), MirBlockId(2)],
            default: MirBlockId(3),
        };
        assert_eq!(
            term.successors(),
            vec![MirBlockId(1), MirBlockId(2), MirBlockId(3)]
        );
    }
}
