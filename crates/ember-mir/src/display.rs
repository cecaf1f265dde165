//! Deterministic text rendering of MIR, used by the CLI and snapshot tests.

use std::fmt;

use crate::{
    MirFunction, MirInst, MirLiteral, MirModule, MirTerminator, MirType, MirValueId,
};

impl fmt::Display for MirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirType::I32 => "i32",
            MirType::I64 => "i64",
            MirType::F64 => "f64",
            MirType::Ref => "ref",
            MirType::FuncRef => "funcref",
            MirType::Any => "any",
        };
        f.write_str(name)
    }
}

impl fmt::Display for MirValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for MirLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirLiteral::I32(v) => write!(f, "{v}:i32"),
            MirLiteral::I64(v) => write!(f, "{v}"),
            MirLiteral::F64(v) => write!(f, "{v:?}"),
            MirLiteral::String(v) => write!(f, "{v:?}"),
        }
    }
}

fn values(values: &[MirValueId]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for MirInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirInst::Const { dest, literal } => write!(f, "{dest} = const {literal}"),
            MirInst::Move { dest, src } => write!(f, "{dest} = {src}"),
            MirInst::Binary {
                dest,
                op,
                left,
                right,
            } => write!(f, "{dest} = {} {left}, {right}", op.as_str()),
            MirInst::Call { dest, callee, args } => {
                if let Some(dest) = dest {
                    write!(f, "{dest} = ")?;
                }
                write!(f, "call {callee}({})", values(args))
            }
            MirInst::CallIndirect { dest, callee, args } => {
                if let Some(dest) = dest {
                    write!(f, "{dest} = ")?;
                }
                write!(f, "call_indirect {callee}({})", values(args))
            }
            MirInst::FuncRef { dest, function } => write!(f, "{dest} = func_ref {function}"),
            MirInst::StructNew {
                dest,
                layout,
                fields,
            } => write!(f, "{dest} = new #{}({})", layout.0, values(fields)),
            MirInst::StructGet {
                dest,
                layout,
                object,
                field,
            } => write!(f, "{dest} = get #{}.{field} {object}", layout.0),
            MirInst::StructSet {
                layout,
                object,
                field,
                value,
            } => write!(f, "set #{}.{field} {object}, {value}", layout.0),
            MirInst::RefNull { dest } => write!(f, "{dest} = null"),
            MirInst::IsNull { dest, value } => write!(f, "{dest} = is_null {value}"),
            MirInst::GlobalGet { dest, global } => write!(f, "{dest} = global.get g{}", global.0),
            MirInst::GlobalSet { global, value } => write!(f, "global.set g{}, {value}", global.0),
            MirInst::Box { dest, value } => write!(f, "{dest} = box {value}"),
            MirInst::Unbox { dest, value, ty } => write!(f, "{dest} = unbox.{ty} {value}"),
        }
    }
}

impl fmt::Display for MirTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirTerminator::Jump { target } => write!(f, "jump b{}", target.0),
            MirTerminator::Branch {
                condition,
                then_block,
                else_block,
            } => write!(f, "br {condition}, b{}, b{}", then_block.0, else_block.0),
            MirTerminator::Switch {
                value,
                targets,
                default,
            } => {
                let targets = targets
                    .iter()
                    .map(|t| format!("b{}", t.0))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "switch {value} [{targets}] default b{}", default.0)
            }
            MirTerminator::Return { value: Some(value) } => write!(f, "return {value}"),
            MirTerminator::Return { value: None } => write!(f, "return"),
            MirTerminator::Trap(code) => write!(f, "trap {}", code.as_str()),
        }
    }
}

impl fmt::Display for MirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .signature
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("%{i}: {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "fn {}({params}) -> {}", self.name, self.signature.ret)?;
        if self.signature.effectful {
            write!(f, " effectful {}", self.signature.effects)?;
        }
        writeln!(f, " {{")?;

        let extra = &self.locals[self.param_count().min(self.locals.len())..];
        if !extra.is_empty() {
            let locals = extra
                .iter()
                .enumerate()
                .map(|(i, local)| format!("%{}: {}", i + self.param_count(), local.ty))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "  locals {locals}")?;
        }
        for block in &self.blocks {
            writeln!(f, "b{}:", block.id.0)?;
            for inst in &block.instructions {
                writeln!(f, "  {inst}")?;
            }
            writeln!(f, "  {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for MirModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            let mutability = if global.mutable { " mut" } else { "" };
            writeln!(
                f,
                "global g{} {}: {}{mutability}",
                global.id.0, global.name, global.ty
            )?;
        }
        for layout in &self.layouts {
            let fields = layout
                .fields
                .iter()
                .map(|field| format!("{}: {}", field.name, field.ty))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "layout #{} {} {{ {fields} }}", layout.id.0, layout.name)?;
        }
        if !self.table.is_empty() {
            writeln!(f, "table [{}]", self.table.join(", "))?;
        }
        for export in &self.exports {
            writeln!(f, "export {:?} = {}", export.name, export.function)?;
        }
        for (i, function) in self.functions.iter().enumerate() {
            if i > 0 || !self.globals.is_empty() || !self.layouts.is_empty() {
                writeln!(f)?;
            }
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{FunctionBuilder, FunctionKind, MirField, MirModule, MirType, TrapCode};
    use ember_hir::BinOp;
    use ember_types::EffectRow;

    #[test]
    fn renders_a_function() {
        let mut b = FunctionBuilder::new(
            "add_one",
            FunctionKind::User,
            vec![(Some("x".into()), MirType::I64)],
            MirType::I64,
            false,
            EffectRow::default(),
        );
        let x = b.param(0);
        let one = b.const_i64(1);
        let sum = b.binary(BinOp::Add, x, one, MirType::I64);
        b.ret(Some(sum));
        let function = b.finish();

        insta::assert_snapshot!(function.to_string(), @r"
        fn add_one(%0: i64) -> i64 {
          locals %1: i64, %2: i64
        b0:
          %1 = const 1
          %2 = add %0, %1
          return %2
        }
        ");
    }

    #[test]
    fn renders_module_header_and_traps() {
        let mut module = MirModule::new();
        let top = module.add_global("ember_handler_top", MirType::Ref, true);
        module.add_layout(
            "tail_guard",
            vec![
                MirField::new("expected", MirType::I32),
                MirField::new("observed", MirType::I32),
            ],
        );
        let mut b = FunctionBuilder::new(
            "fail",
            FunctionKind::Runtime,
            vec![],
            MirType::I32,
            false,
            EffectRow::default(),
        );
        let frame = b.global_get(top, MirType::Ref);
        let missing = b.is_null(frame);
        b.trap_unless(missing, TrapCode::UnhandledOperation);
        b.trap(TrapCode::Unreachable);
        module.functions.push(b.finish());

        insta::assert_snapshot!(module.to_string(), @r"
        global g0 ember_handler_top: ref mut
        layout #0 tail_guard { expected: i32, observed: i32 }

        fn fail() -> i32 {
          locals %0: ref, %1: i32
        b0:
          %0 = global.get g0
          %1 = is_null %0
          br %1, b1, b2
        b1:
          trap unreachable
        b2:
          trap unhandled_operation
        }
        ");
    }
}
