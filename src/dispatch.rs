// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! The instruction/terminator dispatcher (spec §4.H). `exec_instr` and
//! `exec_terminator` evaluate exactly one step and hand back an effect
//! enum; the step loop in `vm.rs` interprets those effects (pushing
//! frames, routing intrinsics, driving the async executor) the same
//! way the teacher's command-dispatch loop matches on an enum rather
//! than calling back into itself.

use crate::error::{PanicKind, VmError, VmResult};
use crate::frame::Frame;
use crate::module::{BlockId, CalleeRef, FuncSym, Instr, Place, Terminator};
use crate::place::EvalContext;
use crate::tagunion;
use crate::value::Value;

/// What a plain call instruction asks the caller to do next.
pub enum CallTarget {
    Symbol(FuncSym),
    Intrinsic(String),
}

/// A request to hand to the async executor (spec §4.I); `exec_instr`
/// never itself schedules tasks.
pub enum AsyncRequest {
    Spawn { poll_fn: FuncSym, args: Vec<Value>, dst: Place },
    Await { task: Value, dst: Place },
    Poll { task: Value, ready_bb: BlockId, pend_bb: BlockId, dst: Place },
    JoinAll { scope: Value, ready_bb: BlockId, pend_bb: BlockId, dst: Place },
    Select { waiters: Vec<Value>, ready_bb: BlockId, pend_bb: BlockId, dst: Place },
}

pub enum StepEffect {
    /// The instruction fully completed; advance to the next one.
    Continue,
    Call { target: CallTarget, args: Vec<Value>, dst: Option<Place> },
    Async(AsyncRequest),
}

pub enum TermEffect {
    Goto(BlockId),
    Return(Option<Value>),
}

/// Executes one `Instr` against the current frame (spec §4.H "execInstr").
pub fn exec_instr(ctx: &mut EvalContext, frame: &mut Frame, instr: &Instr) -> VmResult<StepEffect> {
    match instr {
        Instr::Nop => Ok(StepEffect::Continue),
        Instr::Assign(place, rvalue) => {
            let value = ctx.eval_rvalue(frame, rvalue)?;
            let resolved = ctx.eval_place(frame, place)?;
            let value = materialize_nothing_if_needed(ctx, resolved.type_id, value)?;
            ctx.store(frame, &resolved, value)?;
            Ok(StepEffect::Continue)
        }
        Instr::Call { callee, args, dst } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(ctx.eval_operand(frame, a)?);
            }
            let target = match callee {
                CalleeRef::Symbol(sym) => CallTarget::Symbol(*sym),
                CalleeRef::Intrinsic(name) => CallTarget::Intrinsic(name.clone()),
            };
            Ok(StepEffect::Call { target, args: values, dst: dst.clone() })
        }
        Instr::Drop(place) => {
            drop_place(ctx, frame, place)?;
            Ok(StepEffect::Continue)
        }
        Instr::EndBorrow(_place) => {
            // Borrow tracking is a compile-time-only concept upstream of
            // the core (spec §4.D); at runtime this is a no-op marker.
            Ok(StepEffect::Continue)
        }
        Instr::Spawn { poll_fn, args, dst } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(ctx.eval_operand(frame, a)?);
            }
            Ok(StepEffect::Async(AsyncRequest::Spawn { poll_fn: *poll_fn, args: values, dst: dst.clone() }))
        }
        Instr::Await { task, dst } => {
            let task = ctx.eval_operand(frame, task)?;
            Ok(StepEffect::Async(AsyncRequest::Await { task, dst: dst.clone() }))
        }
        Instr::Poll { task, ready_bb, pend_bb, dst } => {
            let task = ctx.eval_operand(frame, task)?;
            Ok(StepEffect::Async(AsyncRequest::Poll {
                task,
                ready_bb: *ready_bb,
                pend_bb: *pend_bb,
                dst: dst.clone(),
            }))
        }
        Instr::JoinAll { scope, ready_bb, pend_bb, dst } => {
            let scope = ctx.eval_operand(frame, scope)?;
            Ok(StepEffect::Async(AsyncRequest::JoinAll {
                scope,
                ready_bb: *ready_bb,
                pend_bb: *pend_bb,
                dst: dst.clone(),
            }))
        }
        Instr::Select { waiters, ready_bb, pend_bb, dst } => {
            let mut values = Vec::with_capacity(waiters.len());
            for w in waiters {
                values.push(ctx.eval_operand(frame, w)?);
            }
            Ok(StepEffect::Async(AsyncRequest::Select {
                waiters: values,
                ready_bb: *ready_bb,
                pend_bb: *pend_bb,
                dst: dst.clone(),
            }))
        }
    }
}

/// Executes a block's terminator (spec §4.H "execTerminator").
pub fn exec_terminator(ctx: &mut EvalContext, frame: &mut Frame, term: &Terminator) -> VmResult<TermEffect> {
    match term {
        Terminator::Return(operand) => {
            let value = operand.as_ref().map(|o| ctx.eval_operand(frame, o)).transpose()?;
            frame.drop_all_locals(ctx.heap)?;
            Ok(TermEffect::Return(value))
        }
        Terminator::Goto(bb) => Ok(TermEffect::Goto(*bb)),
        Terminator::If(cond, then_bb, else_bb) => {
            let v = ctx.eval_operand(frame, cond)?;
            let b = match v {
                Value::Bool(b, _) => b,
                _ => return Err(VmError::new(PanicKind::TypeMismatch, "if terminator condition is not a bool")),
            };
            Ok(TermEffect::Goto(if b { *then_bb } else { *else_bb }))
        }
        Terminator::SwitchTag(scrutinee, cases, default_bb) => {
            let v = ctx.eval_operand(frame, scrutinee)?;
            let bb = tagunion::switch_tag(ctx.heap, &v, cases, *default_bb)?;
            ctx.heap.release_value(&v)?;
            Ok(TermEffect::Goto(bb))
        }
        Terminator::Unreachable => Err(VmError::new(PanicKind::Unimplemented, "reached an `unreachable` terminator")),
    }
}

fn drop_place(ctx: &mut EvalContext, frame: &mut Frame, place: &Place) -> VmResult<()> {
    use crate::module::PlaceBase;
    if place.projections.is_empty() {
        if let PlaceBase::Local(id) = place.base {
            return frame.drop_local(ctx.heap, id);
        }
    }
    let resolved = ctx.eval_place(frame, place)?;
    let value = ctx.load(frame, &resolved)?;
    ctx.heap.release_value(&value)?;
    ctx.store(frame, &resolved, Value::Invalid)
}

/// Assigning `Nothing` into a nullable-union-typed place materializes
/// the case tag rather than storing a bare `Nothing` (spec §4.F).
fn materialize_nothing_if_needed(ctx: &mut EvalContext, expected_type: crate::layout::TypeId, value: Value) -> VmResult<Value> {
    if !matches!(value, Value::Nothing) {
        return Ok(value);
    }
    match tagunion::materialize_nothing(ctx.heap, ctx.types, expected_type)? {
        Some(handle) => Ok(Value::HandleTag(handle, expected_type)),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::GlobalSlot;
    use crate::heap::Heap;
    use crate::layout::{TypeInterner, TYPE_INT};
    use crate::module::{BinOp, ConstValue, Operand, RValue};

    fn ctx<'a>(heap: &'a Heap, types: &'a TypeInterner, globals: &'a mut Vec<GlobalSlot>) -> EvalContext<'a> {
        EvalContext { heap, types, globals }
    }

    #[test]
    fn assign_stores_computed_value() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![crate::frame::LocalSlot::empty("x", TYPE_INT)]);
        let mut c = ctx(&heap, &types, &mut globals);
        let instr = Instr::Assign(
            Place::local(0),
            RValue::BinOp(BinOp::Add, Operand::Const(ConstValue::Int(2, TYPE_INT)), Operand::Const(ConstValue::Int(3, TYPE_INT))),
        );
        let effect = exec_instr(&mut c, &mut frame, &instr).unwrap();
        assert!(matches!(effect, StepEffect::Continue));
        assert_eq!(frame.local_value_ref(0).unwrap(), &Value::Int(5, TYPE_INT));
    }

    #[test]
    fn return_drops_locals_and_yields_value() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![crate::frame::LocalSlot::empty("x", TYPE_INT)]);
        frame.write_local(&heap, 0, Value::Int(7, TYPE_INT)).unwrap();
        let mut c = ctx(&heap, &types, &mut globals);
        let effect = exec_terminator(&mut c, &mut frame, &Terminator::Return(Some(Operand::Copy(Place::local(0))))).unwrap();
        match effect {
            TermEffect::Return(Some(v)) => assert_eq!(v, Value::Int(7, TYPE_INT)),
            _ => panic!("expected Return"),
        }
    }

    #[test]
    fn if_terminator_requires_bool_condition() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let err = exec_terminator(&mut c, &mut frame, &Terminator::If(Operand::Const(ConstValue::Int(1, TYPE_INT)), BlockId(0), BlockId(1)))
            .unwrap_err();
        assert_eq!(err.kind, PanicKind::TypeMismatch);
    }

    #[test]
    fn unreachable_terminator_panics() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let err = exec_terminator(&mut c, &mut frame, &Terminator::Unreachable).unwrap_err();
        assert_eq!(err.kind, PanicKind::Unimplemented);
    }
}
