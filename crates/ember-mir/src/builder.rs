//! Incremental construction of [`MirFunction`]s.

use ember_hir::BinOp;
use ember_types::EffectRow;

use crate::{
    FunctionKind, GlobalId, LayoutId, MirBlock, MirBlockId, MirFunction, MirFunctionSignature,
    MirInst, MirLiteral, MirLocal, MirTerminator, MirType, MirValueId, TrapCode,
};

struct PendingBlock {
    instructions: Vec<MirInst>,
    terminator: Option<MirTerminator>,
}

/// Builds one function block by block. Instructions always go to the current
/// block; emitting after a terminator opens a fresh unreachable block so
/// lowering never has to special-case dead code.
pub struct FunctionBuilder {
    name: String,
    kind: FunctionKind,
    signature: MirFunctionSignature,
    locals: Vec<MirLocal>,
    blocks: Vec<PendingBlock>,
    current: MirBlockId,
}

impl FunctionBuilder {
    pub fn new(
        name: impl Into<String>,
        kind: FunctionKind,
        params: Vec<(Option<String>, MirType)>,
        ret: MirType,
        effectful: bool,
        effects: EffectRow,
    ) -> Self {
        let signature = MirFunctionSignature {
            params: params.iter().map(|(_, ty)| *ty).collect(),
            ret,
            effectful,
            effects,
        };
        let locals = params
            .into_iter()
            .map(|(name, ty)| MirLocal { ty, name })
            .collect();
        Self {
            name: name.into(),
            kind,
            signature,
            locals,
            blocks: vec![PendingBlock {
                instructions: Vec::new(),
                terminator: None,
            }],
            current: MirBlockId(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param(&self, index: usize) -> MirValueId {
        MirValueId(index as u32)
    }

    pub fn local(&mut self, ty: MirType) -> MirValueId {
        self.locals.push(MirLocal { ty, name: None });
        MirValueId((self.locals.len() - 1) as u32)
    }

    pub fn named_local(&mut self, name: impl Into<String>, ty: MirType) -> MirValueId {
        self.locals.push(MirLocal {
            ty,
            name: Some(name.into()),
        });
        MirValueId((self.locals.len() - 1) as u32)
    }

    pub fn local_type(&self, value: MirValueId) -> MirType {
        self.locals
            .get(value.0 as usize)
            .map(|l| l.ty)
            .unwrap_or(MirType::Any)
    }

    pub fn new_block(&mut self) -> MirBlockId {
        self.blocks.push(PendingBlock {
            instructions: Vec::new(),
            terminator: None,
        });
        MirBlockId((self.blocks.len() - 1) as u32)
    }

    pub fn switch_to(&mut self, block: MirBlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> MirBlockId {
        self.current
    }

    pub fn is_terminated(&self) -> bool {
        self.blocks[self.current.0 as usize].terminator.is_some()
    }

    fn ensure_open(&mut self) {
        if self.is_terminated() {
            let dead = self.new_block();
            self.current = dead;
        }
    }

    pub fn push(&mut self, inst: MirInst) {
        self.ensure_open();
        self.blocks[self.current.0 as usize].instructions.push(inst);
    }

    pub fn terminate(&mut self, terminator: MirTerminator) {
        self.ensure_open();
        self.blocks[self.current.0 as usize].terminator = Some(terminator);
    }

    /// Jump to `target` unless the current block already ended.
    pub fn jump_if_open(&mut self, target: MirBlockId) {
        if !self.is_terminated() {
            self.terminate(MirTerminator::Jump { target });
        }
    }

    // -- instruction helpers ------------------------------------------------

    pub fn const_i32(&mut self, value: i32) -> MirValueId {
        let dest = self.local(MirType::I32);
        self.push(MirInst::Const {
            dest,
            literal: MirLiteral::I32(value),
        });
        dest
    }

    pub fn const_i64(&mut self, value: i64) -> MirValueId {
        let dest = self.local(MirType::I64);
        self.push(MirInst::Const {
            dest,
            literal: MirLiteral::I64(value),
        });
        dest
    }

    pub fn const_literal(&mut self, literal: MirLiteral, ty: MirType) -> MirValueId {
        let dest = self.local(ty);
        self.push(MirInst::Const { dest, literal });
        dest
    }

    pub fn binary(&mut self, op: BinOp, left: MirValueId, right: MirValueId, ty: MirType) -> MirValueId {
        let dest = self.local(ty);
        self.push(MirInst::Binary {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    pub fn copy(&mut self, dest: MirValueId, src: MirValueId) {
        if dest != src {
            self.push(MirInst::Move { dest, src });
        }
    }

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<MirValueId>, ret: MirType) -> MirValueId {
        let dest = self.local(ret);
        self.push(MirInst::Call {
            dest: Some(dest),
            callee: callee.into(),
            args,
        });
        dest
    }

    /// Call for effect only; any result is dropped.
    pub fn call_void(&mut self, callee: impl Into<String>, args: Vec<MirValueId>) {
        self.push(MirInst::Call {
            dest: None,
            callee: callee.into(),
            args,
        });
    }

    pub fn call_indirect(&mut self, callee: MirValueId, args: Vec<MirValueId>, ret: MirType) -> MirValueId {
        let dest = self.local(ret);
        self.push(MirInst::CallIndirect {
            dest: Some(dest),
            callee,
            args,
        });
        dest
    }

    pub fn func_ref(&mut self, function: impl Into<String>) -> MirValueId {
        let dest = self.local(MirType::FuncRef);
        self.push(MirInst::FuncRef {
            dest,
            function: function.into(),
        });
        dest
    }

    pub fn struct_new(&mut self, layout: LayoutId, fields: Vec<MirValueId>) -> MirValueId {
        let dest = self.local(MirType::Ref);
        self.push(MirInst::StructNew {
            dest,
            layout,
            fields,
        });
        dest
    }

    pub fn struct_get(&mut self, layout: LayoutId, object: MirValueId, field: u32, ty: MirType) -> MirValueId {
        let dest = self.local(ty);
        self.push(MirInst::StructGet {
            dest,
            layout,
            object,
            field,
        });
        dest
    }

    pub fn struct_set(&mut self, layout: LayoutId, object: MirValueId, field: u32, value: MirValueId) {
        self.push(MirInst::StructSet {
            layout,
            object,
            field,
            value,
        });
    }

    pub fn null(&mut self) -> MirValueId {
        self.zero(MirType::Ref)
    }

    /// Zero value of `ty`: numeric zero, or a null reference.
    pub fn zero(&mut self, ty: MirType) -> MirValueId {
        match ty {
            MirType::I32 => self.const_i32(0),
            MirType::I64 => self.const_i64(0),
            MirType::F64 => self.const_literal(MirLiteral::F64(0.0), MirType::F64),
            MirType::Ref | MirType::FuncRef | MirType::Any => {
                let dest = self.local(ty);
                self.push(MirInst::RefNull { dest });
                dest
            }
        }
    }

    pub fn is_null(&mut self, value: MirValueId) -> MirValueId {
        let dest = self.local(MirType::I32);
        self.push(MirInst::IsNull { dest, value });
        dest
    }

    pub fn global_get(&mut self, global: GlobalId, ty: MirType) -> MirValueId {
        let dest = self.local(ty);
        self.push(MirInst::GlobalGet { dest, global });
        dest
    }

    pub fn global_set(&mut self, global: GlobalId, value: MirValueId) {
        self.push(MirInst::GlobalSet { global, value });
    }

    /// Box `value` into the uniform representation. `Any` values pass through.
    pub fn boxed(&mut self, value: MirValueId) -> MirValueId {
        if self.local_type(value) == MirType::Any {
            return value;
        }
        let dest = self.local(MirType::Any);
        self.push(MirInst::Box { dest, value });
        dest
    }

    /// Unbox a uniform value to `ty`. Requesting `Any` is a no-op.
    pub fn unboxed(&mut self, value: MirValueId, ty: MirType) -> MirValueId {
        if ty == MirType::Any {
            return value;
        }
        let dest = self.local(ty);
        self.push(MirInst::Unbox { dest, value, ty });
        dest
    }

    pub fn ret(&mut self, value: Option<MirValueId>) {
        self.terminate(MirTerminator::Return { value });
    }

    pub fn trap(&mut self, code: TrapCode) {
        self.terminate(MirTerminator::Trap(code));
    }

    pub fn branch(&mut self, condition: MirValueId, then_block: MirBlockId, else_block: MirBlockId) {
        self.terminate(MirTerminator::Branch {
            condition,
            then_block,
            else_block,
        });
    }

    /// Continue in a fresh block when `condition` holds; trap otherwise.
    pub fn trap_unless(&mut self, condition: MirValueId, code: TrapCode) {
        let ok = self.new_block();
        let fail = self.new_block();
        self.branch(condition, ok, fail);
        self.switch_to(fail);
        self.trap(code);
        self.switch_to(ok);
    }

    pub fn finish(self) -> MirFunction {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, block)| MirBlock {
                id: MirBlockId(index as u32),
                instructions: block.instructions,
                terminator: block
                    .terminator
                    .unwrap_or(MirTerminator::Trap(TrapCode::Unreachable)),
            })
            .collect();
        MirFunction {
            name: self.name,
            kind: self.kind,
            signature: self.signature,
            locals: self.locals,
            entry: MirBlockId(0),
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitting_after_terminator_opens_dead_block() {
        let mut b = FunctionBuilder::new(
            "f",
            FunctionKind::User,
            vec![(Some("x".into()), MirType::I64)],
            MirType::I64,
            false,
            EffectRow::default(),
        );
        let x = b.param(0);
        b.ret(Some(x));
        let one = b.const_i64(1);
        let function = b.finish();

        assert_eq!(function.blocks.len(), 2);
        assert_eq!(function.blocks[1].instructions.len(), 1);
        assert_eq!(
            function.blocks[1].terminator,
            MirTerminator::Trap(TrapCode::Unreachable)
        );
        assert_eq!(function.locals[one.0 as usize].ty, MirType::I64);
    }

    #[test]
    fn boxing_any_is_identity() {
        let mut b = FunctionBuilder::new(
            "g",
            FunctionKind::Runtime,
            vec![(None, MirType::Any)],
            MirType::Any,
            false,
            EffectRow::default(),
        );
        let v = b.param(0);
        assert_eq!(b.boxed(v), v);
        assert_eq!(b.unboxed(v, MirType::Any), v);
        let n = b.unboxed(v, MirType::I64);
        assert_ne!(n, v);
    }
}
