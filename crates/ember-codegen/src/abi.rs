//! The effect runtime ABI: heap layouts shared by all lowered code, the
//! handler-top global, and the runtime helper functions emitted into every
//! module.
//!
//! An effectful function takes the current handler frame as a leading
//! parameter and returns an *outcome*: either `done(value)` or
//! `suspended(request)`. A request names the operation, carries its argument
//! bundle, and accumulates a persistent list of continuation records as it
//! travels outward. Resuming replays that list innermost first.

use ember_hir::BinOp;
use ember_mir::{
    FunctionBuilder, FunctionKind, GlobalId, LayoutId, MirField, MirFunction, MirModule, MirType,
    TrapCode,
};
use ember_types::EffectRow;

pub const HANDLER_TOP: &str = "ember_handler_top";

pub const DONE: &str = "$ember_done";
pub const SUSPENDED: &str = "$ember_suspended";
pub const FIND_FRAME: &str = "$ember_find_frame";
pub const APPEND: &str = "$ember_append";
pub const RESUME: &str = "$ember_resume";
pub const CONTINUE: &str = "$ember_continue";
/// Body of a continuation escaped as a pure closure.
pub const CONTINUE_VALUE: &str = "$ember_continue_value";
/// Body of a continuation escaped as an effectful closure.
pub const CONTINUE_CLOSURE: &str = "$ember_continue_closure";

pub const OUTCOME_DONE: i32 = 0;
pub const OUTCOME_SUSPENDED: i32 = 1;

pub mod outcome {
    pub const TAG: u32 = 0;
    pub const VALUE: u32 = 1;
    pub const REQUEST: u32 = 2;
}

pub mod request {
    pub const EFFECT: u32 = 0;
    pub const OP: u32 = 1;
    pub const ARGS: u32 = 2;
    pub const CONT: u32 = 3;
    pub const GUARD: u32 = 4;
}

pub mod record {
    pub const STATE: u32 = 0;
    pub const RESUME_FN: u32 = 1;
    pub const NEXT: u32 = 2;
}

pub mod token {
    pub const CHAIN: u32 = 0;
    /// Null for tail continuations, which resume in place.
    pub const RUN_FN: u32 = 1;
    pub const ENV: u32 = 2;
    pub const GUARD: u32 = 3;
}

pub mod frame {
    pub const PREV: u32 = 0;
    pub const EFFECT: u32 = 1;
    pub const OP: u32 = 2;
    pub const KIND: u32 = 3;
    pub const CLAUSE: u32 = 4;
    pub const ENV: u32 = 5;
    pub const LABEL: u32 = 6;
    pub const OUTER: u32 = 7;
}

pub mod guard {
    pub const EXPECTED: u32 = 0;
    pub const OBSERVED: u32 = 1;
    /// Value the clause resumed with.
    pub const VALUE: u32 = 2;
}

pub mod closure {
    pub const FN: u32 = 0;
    pub const ENV: u32 = 1;
}

/// Every per-site state layout starts with these two fields.
pub mod state {
    pub const SITE: u32 = 0;
    pub const TOP: u32 = 1;
    pub const FIRST_SAVED: u32 = 2;
}

/// Handler environments: the saved outer top, this handler's top, then
/// captured symbols.
pub mod env {
    pub const SAVED: u32 = 0;
    pub const TOP: u32 = 1;
    pub const FIRST_CAPTURE: u32 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi {
    pub outcome: LayoutId,
    pub request: LayoutId,
    pub record: LayoutId,
    pub token: LayoutId,
    pub frame: LayoutId,
    pub guard: LayoutId,
    pub closure: LayoutId,
    pub state: LayoutId,
    pub handler_top: GlobalId,
}

impl Abi {
    /// Declare the shared layouts and the handler-top global in `module`.
    pub fn install(module: &mut MirModule) -> Abi {
        use MirType::{Any, FuncRef, I32, I64, Ref};
        let field = MirField::new;
        let handler_top = module.add_global(HANDLER_TOP, Ref, true);
        Abi {
            outcome: module.add_layout(
                "outcome",
                vec![field("tag", I32), field("value", Any), field("request", Ref)],
            ),
            request: module.add_layout(
                "request",
                vec![
                    field("effect", I32),
                    field("op", I32),
                    field("args", Ref),
                    field("cont", Ref),
                    field("guard", Ref),
                ],
            ),
            record: module.add_layout(
                "cont_record",
                vec![field("state", Ref), field("resume_fn", FuncRef), field("next", Ref)],
            ),
            token: module.add_layout(
                "continuation",
                vec![
                    field("chain", Ref),
                    field("run_fn", FuncRef),
                    field("env", Ref),
                    field("guard", Ref),
                ],
            ),
            frame: module.add_layout(
                "handler_frame",
                vec![
                    field("prev", Ref),
                    field("effect", I32),
                    field("op", I32),
                    field("kind", I32),
                    field("clause", FuncRef),
                    field("env", Ref),
                    field("label", I64),
                    field("outer", Ref),
                ],
            ),
            guard: module.add_layout(
                "tail_guard",
                vec![field("expected", I32), field("observed", I32), field("value", Any)],
            ),
            closure: module.add_layout("closure", vec![field("fn", FuncRef), field("env", Ref)]),
            state: module.add_layout("state", vec![field("site", I32), field("top", Ref)]),
            handler_top,
        }
    }

    /// Emit the runtime helpers every lowered module links against.
    pub fn emit_runtime(&self, module: &mut MirModule) {
        let functions = [
            self.done(),
            self.suspended(),
            self.find_frame(),
            self.append(),
            self.resume(),
            self.continue_(),
            self.continue_value(),
            self.continue_closure(),
        ];
        module.functions.extend(functions);
        module.table_index(CONTINUE_VALUE);
        module.table_index(CONTINUE_CLOSURE);
    }

    fn runtime(name: &str, params: Vec<(&str, MirType)>, ret: MirType) -> FunctionBuilder {
        FunctionBuilder::new(
            name,
            FunctionKind::Runtime,
            params
                .into_iter()
                .map(|(name, ty)| (Some(name.to_string()), ty))
                .collect(),
            ret,
            false,
            EffectRow::default(),
        )
    }

    fn done(&self) -> MirFunction {
        let mut b = Self::runtime(DONE, vec![("value", MirType::Any)], MirType::Ref);
        let tag = b.const_i32(OUTCOME_DONE);
        let value = b.param(0);
        let request = b.null();
        let outcome = b.struct_new(self.outcome, vec![tag, value, request]);
        b.ret(Some(outcome));
        b.finish()
    }

    fn suspended(&self) -> MirFunction {
        let mut b = Self::runtime(SUSPENDED, vec![("request", MirType::Ref)], MirType::Ref);
        let tag = b.const_i32(OUTCOME_SUSPENDED);
        let value = b.zero(MirType::Any);
        let request = b.param(0);
        let outcome = b.struct_new(self.outcome, vec![tag, value, request]);
        b.ret(Some(outcome));
        b.finish()
    }

    /// Innermost frame handling `(effect, op)`, or null.
    fn find_frame(&self) -> MirFunction {
        let mut b = Self::runtime(
            FIND_FRAME,
            vec![("top", MirType::Ref), ("effect", MirType::I32), ("op", MirType::I32)],
            MirType::Ref,
        );
        let (top, effect, op) = (b.param(0), b.param(1), b.param(2));
        let cursor = b.named_local("cursor", MirType::Ref);
        b.copy(cursor, top);

        let head = b.new_block();
        let miss = b.new_block();
        let check = b.new_block();
        let check_op = b.new_block();
        let found = b.new_block();
        let next = b.new_block();
        b.jump_if_open(head);

        b.switch_to(head);
        let empty = b.is_null(cursor);
        b.branch(empty, miss, check);

        b.switch_to(miss);
        let null = b.null();
        b.ret(Some(null));

        b.switch_to(check);
        let frame_effect = b.struct_get(self.frame, cursor, frame::EFFECT, MirType::I32);
        let same_effect = b.binary(BinOp::Eq, frame_effect, effect, MirType::I32);
        b.branch(same_effect, check_op, next);

        b.switch_to(check_op);
        let frame_op = b.struct_get(self.frame, cursor, frame::OP, MirType::I32);
        let same_op = b.binary(BinOp::Eq, frame_op, op, MirType::I32);
        b.branch(same_op, found, next);

        b.switch_to(found);
        b.ret(Some(cursor));

        b.switch_to(next);
        let prev = b.struct_get(self.frame, cursor, frame::PREV, MirType::Ref);
        b.copy(cursor, prev);
        b.jump_if_open(head);
        b.finish()
    }

    /// Push `{state, resume_fn}` as the new outermost record of `request`.
    fn append(&self) -> MirFunction {
        let mut b = Self::runtime(
            APPEND,
            vec![
                ("request", MirType::Ref),
                ("state", MirType::Ref),
                ("resume_fn", MirType::FuncRef),
            ],
            MirType::I32,
        );
        let (request, state, resume_fn) = (b.param(0), b.param(1), b.param(2));
        let old = b.struct_get(self.request, request, request::CONT, MirType::Ref);
        let record = b.struct_new(self.record, vec![state, resume_fn, old]);
        b.struct_set(self.request, request, request::CONT, record);
        let unit = b.const_i32(0);
        b.ret(Some(unit));
        b.finish()
    }

    /// Replay a record chain with `input`, innermost record first. A record
    /// whose inner part suspends again is copied onto the new request, so the
    /// original chain stays intact for later resumptions.
    fn resume(&self) -> MirFunction {
        let mut b = Self::runtime(
            RESUME,
            vec![("record", MirType::Ref), ("input", MirType::Any)],
            MirType::Ref,
        );
        let (record, input) = (b.param(0), b.param(1));
        let empty = b.new_block();
        let replay = b.new_block();
        let is_empty = b.is_null(record);
        b.branch(is_empty, empty, replay);

        b.switch_to(empty);
        let done = b.call(DONE, vec![input], MirType::Ref);
        b.ret(Some(done));

        b.switch_to(replay);
        let inner = b.struct_get(self.record, record, record::NEXT, MirType::Ref);
        let outcome = b.call(RESUME, vec![inner, input], MirType::Ref);
        let tag = b.struct_get(self.outcome, outcome, outcome::TAG, MirType::I32);
        let done_tag = b.const_i32(OUTCOME_DONE);
        let finished = b.binary(BinOp::Eq, tag, done_tag, MirType::I32);
        let continue_block = b.new_block();
        let again = b.new_block();
        b.branch(finished, continue_block, again);

        b.switch_to(again);
        let request = b.struct_get(self.outcome, outcome, outcome::REQUEST, MirType::Ref);
        let state = b.struct_get(self.record, record, record::STATE, MirType::Ref);
        let resume_fn = b.struct_get(self.record, record, record::RESUME_FN, MirType::FuncRef);
        b.call_void(APPEND, vec![request, state, resume_fn]);
        b.ret(Some(outcome));

        b.switch_to(continue_block);
        let value = b.struct_get(self.outcome, outcome, outcome::VALUE, MirType::Any);
        let state = b.struct_get(self.record, record, record::STATE, MirType::Ref);
        let resume_fn = b.struct_get(self.record, record, record::RESUME_FN, MirType::FuncRef);
        let top = b.global_get(self.handler_top, MirType::Ref);
        let result = b.call_indirect(resume_fn, vec![top, state, value], MirType::Ref);
        b.ret(Some(result));
        b.finish()
    }

    /// Call a continuation token. Tail tokens only count the call and record
    /// the value; others re-enter their handler through `run_fn`.
    fn continue_(&self) -> MirFunction {
        let mut b = Self::runtime(
            CONTINUE,
            vec![("token", MirType::Ref), ("input", MirType::Any)],
            MirType::Ref,
        );
        let (token, input) = (b.param(0), b.param(1));
        let run_fn = b.struct_get(self.token, token, token::RUN_FN, MirType::FuncRef);
        let in_place = b.is_null(run_fn);
        let tail = b.new_block();
        let rerun = b.new_block();
        b.branch(in_place, tail, rerun);

        b.switch_to(tail);
        let guard = b.struct_get(self.token, token, token::GUARD, MirType::Ref);
        let unguarded = b.is_null(guard);
        let count = b.new_block();
        let finish = b.new_block();
        b.branch(unguarded, finish, count);

        b.switch_to(count);
        let observed = b.struct_get(self.guard, guard, guard::OBSERVED, MirType::I32);
        let one = b.const_i32(1);
        let bumped = b.binary(BinOp::Add, observed, one, MirType::I32);
        b.struct_set(self.guard, guard, guard::OBSERVED, bumped);
        b.struct_set(self.guard, guard, guard::VALUE, input);
        b.jump_if_open(finish);

        b.switch_to(finish);
        let done = b.call(DONE, vec![input], MirType::Ref);
        b.ret(Some(done));

        b.switch_to(rerun);
        let saved = b.global_get(self.handler_top, MirType::Ref);
        let outcome = b.call_indirect(run_fn, vec![saved, token, input], MirType::Ref);
        b.global_set(self.handler_top, saved);
        b.ret(Some(outcome));
        b.finish()
    }

    fn continue_value(&self) -> MirFunction {
        let mut b = Self::runtime(
            CONTINUE_VALUE,
            vec![("token", MirType::Ref), ("input", MirType::Any)],
            MirType::Any,
        );
        let (token, input) = (b.param(0), b.param(1));
        let outcome = b.call(CONTINUE, vec![token, input], MirType::Ref);
        let tag = b.struct_get(self.outcome, outcome, outcome::TAG, MirType::I32);
        let done_tag = b.const_i32(OUTCOME_DONE);
        let finished = b.binary(BinOp::Eq, tag, done_tag, MirType::I32);
        b.trap_unless(finished, TrapCode::UnexpectedSuspension);
        let value = b.struct_get(self.outcome, outcome, outcome::VALUE, MirType::Any);
        b.ret(Some(value));
        b.finish()
    }

    fn continue_closure(&self) -> MirFunction {
        let mut b = Self::runtime(
            CONTINUE_CLOSURE,
            vec![("frame", MirType::Ref), ("token", MirType::Ref), ("input", MirType::Any)],
            MirType::Ref,
        );
        let (token, input) = (b.param(1), b.param(2));
        let outcome = b.call(CONTINUE, vec![token, input], MirType::Ref);
        b.ret(Some(outcome));
        b.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_mir::{MirTerminator, validate_module};

    fn runtime_module() -> MirModule {
        let mut module = MirModule::new();
        let abi = Abi::install(&mut module);
        abi.emit_runtime(&mut module);
        module
    }

    #[test]
    fn runtime_helpers_are_well_formed() {
        let module = runtime_module();
        assert_eq!(validate_module(&module), Vec::new());
        for name in [DONE, SUSPENDED, FIND_FRAME, APPEND, RESUME, CONTINUE] {
            let function = module.function(name).expect(name);
            assert_eq!(function.kind, FunctionKind::Runtime);
        }
        assert_eq!(module.global(GlobalId(0)).map(|g| g.name.as_str()), Some(HANDLER_TOP));
    }

    #[test]
    fn resume_replays_inner_records_before_outer_ones() {
        let module = runtime_module();
        let resume = module.function(RESUME).unwrap();
        // Blocks: empty chain, recursive replay of `next`, this record's own
        // resume function, re-suspension.
        let order: Vec<&str> = resume
            .instructions()
            .filter_map(|inst| match inst {
                ember_mir::MirInst::Call { callee, .. } => Some(callee.as_str()),
                ember_mir::MirInst::CallIndirect { .. } => Some("indirect"),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![DONE, RESUME, "indirect", APPEND]);
    }

    #[test]
    fn continue_value_traps_on_suspension() {
        let module = runtime_module();
        let function = module.function(CONTINUE_VALUE).unwrap();
        assert!(function.blocks.iter().any(|block| {
            block.terminator == MirTerminator::Trap(TrapCode::UnexpectedSuspension)
        }));
    }
}
