// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Per-function frames, local slots and the call stack (spec §4.C).

use crate::error::{PanicKind, Span, VmError, VmResult};
use crate::heap::Heap;
use crate::layout::TypeId;
use crate::value::{LocalId, Value};

#[derive(Clone, Debug)]
pub struct LocalSlot {
    pub name: String,
    pub type_id: TypeId,
    pub value: Value,
    pub is_init: bool,
    pub is_moved: bool,
    pub is_dropped: bool,
}

impl LocalSlot {
    pub fn empty(name: impl Into<String>, type_id: TypeId) -> Self {
        LocalSlot {
            name: name.into(),
            type_id,
            value: Value::Invalid,
            is_init: false,
            is_moved: false,
            is_dropped: false,
        }
    }
}

/// A per-call record: current function/block/instruction pointer,
/// current span (for panics), and local slots (spec §3 "Frame").
pub struct Frame {
    pub func_sym: u32,
    pub block: u32,
    pub ip: u32,
    pub span: Span,
    pub locals: Vec<LocalSlot>,
}

impl Frame {
    pub fn new(func_sym: u32, entry_block: u32, locals: Vec<LocalSlot>) -> Self {
        Frame { func_sym, block: entry_block, ip: 0, span: Span::default(), locals }
    }

    fn slot(&self, id: LocalId) -> VmResult<&LocalSlot> {
        self.locals
            .get(id as usize)
            .ok_or_else(|| VmError::new(PanicKind::OutOfBounds, format!("no local slot {}", id)))
    }

    fn slot_mut(&mut self, id: LocalId) -> VmResult<&mut LocalSlot> {
        self.locals
            .get_mut(id as usize)
            .ok_or_else(|| VmError::new(PanicKind::OutOfBounds, format!("no local slot {}", id)))
    }

    /// Reads a local by `Copy`: retains any heap handle it carries.
    pub fn read_local_copy(&self, heap: &Heap, id: LocalId) -> VmResult<Value> {
        let slot = self.slot(id)?;
        self.check_readable(slot)?;
        heap.retain_value(slot.value.clone())
    }

    /// Reads a local by `Move`: transfers ownership, marks the slot
    /// moved.
    pub fn read_local_move(&mut self, id: LocalId) -> VmResult<Value> {
        let slot = self.slot(id)?;
        self.check_readable(slot)?;
        let slot = self.slot_mut(id)?;
        slot.is_moved = true;
        Ok(std::mem::replace(&mut slot.value, Value::Invalid))
    }

    fn check_readable(&self, slot: &LocalSlot) -> VmResult<()> {
        if slot.is_dropped {
            return Err(VmError::new(PanicKind::UseAfterFree, format!("local `{}` used after drop", slot.name)));
        }
        if slot.is_moved {
            return Err(VmError::new(PanicKind::UseAfterMove, format!("local `{}` used after move", slot.name)));
        }
        if !slot.is_init {
            return Err(VmError::new(PanicKind::UseBeforeInit, format!("local `{}` used before init", slot.name)));
        }
        Ok(())
    }

    /// Stores into a local slot, first releasing any prior owned
    /// value (spec §4.A "Ownership transfer").
    pub fn write_local(&mut self, heap: &Heap, id: LocalId, value: Value) -> VmResult<()> {
        let slot = self.slot_mut(id)?;
        if slot.is_init && !slot.is_moved && !slot.is_dropped {
            heap.release_value(&slot.value)?;
        }
        slot.value = value;
        slot.is_init = true;
        slot.is_moved = false;
        slot.is_dropped = false;
        Ok(())
    }

    pub fn local_type(&self, id: LocalId) -> VmResult<TypeId> {
        Ok(self.slot(id)?.type_id)
    }

    pub fn local_value_ref(&self, id: LocalId) -> VmResult<&Value> {
        let slot = self.slot(id)?;
        self.check_readable(slot)?;
        Ok(&slot.value)
    }

    /// Explicit `Drop(place)`: release the heap value, if any, and
    /// mark the slot dropped.
    pub fn drop_local(&mut self, heap: &Heap, id: LocalId) -> VmResult<()> {
        let slot = self.slot_mut(id)?;
        if slot.is_init && !slot.is_moved && !slot.is_dropped {
            heap.release_value(&slot.value)?;
        }
        slot.is_dropped = true;
        slot.value = Value::Invalid;
        Ok(())
    }

    /// On `Return`: release every local that is init, not moved and
    /// not dropped, in reverse declaration order (spec invariant 5).
    pub fn drop_all_locals(&mut self, heap: &Heap) -> VmResult<()> {
        for slot in self.locals.iter_mut().rev() {
            if slot.is_init && !slot.is_moved && !slot.is_dropped {
                heap.release_value(&slot.value)?;
                slot.is_dropped = true;
            }
        }
        Ok(())
    }
}

/// Module-wide slot, same shape as a local but life-of-program.
pub struct GlobalSlot {
    pub name: String,
    pub type_id: TypeId,
    pub value: Value,
    pub is_init: bool,
}

impl GlobalSlot {
    pub fn empty(name: impl Into<String>, type_id: TypeId) -> Self {
        GlobalSlot { name: name.into(), type_id, value: Value::Invalid, is_init: false }
    }
}

/// The VM's call stack.
#[derive(Default)]
pub struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_at(&self, depth_from_top: usize) -> Option<&Frame> {
        let len = self.frames.len();
        if depth_from_top >= len {
            None
        } else {
            Some(&self.frames[len - 1 - depth_from_top])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TYPE_INT;

    #[test]
    fn use_before_init_panics() {
        let frame = Frame::new(0, 0, vec![LocalSlot::empty("x", TYPE_INT)]);
        let heap = Heap::new();
        let err = frame.read_local_copy(&heap, 0).unwrap_err();
        assert_eq!(err.kind, PanicKind::UseBeforeInit);
    }

    #[test]
    fn use_after_move_panics() {
        let heap = Heap::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("x", TYPE_INT)]);
        frame.write_local(&heap, 0, Value::Int(1, TYPE_INT)).unwrap();
        frame.read_local_move(0).unwrap();
        let err = frame.read_local_copy(&heap, 0).unwrap_err();
        assert_eq!(err.kind, PanicKind::UseAfterMove);
    }

    #[test]
    fn return_drops_owned_locals_in_reverse_order() {
        use crate::layout::TYPE_STRING;

        let heap = Heap::new();
        let a = heap.alloc_string(TYPE_STRING, b"a".to_vec());
        let b = heap.alloc_string(TYPE_STRING, b"b".to_vec());
        let mut frame = Frame::new(
            0,
            0,
            vec![LocalSlot::empty("a", TYPE_STRING), LocalSlot::empty("b", TYPE_STRING)],
        );
        frame.write_local(&heap, 0, Value::HandleString(a, TYPE_STRING)).unwrap();
        frame.write_local(&heap, 1, Value::HandleString(b, TYPE_STRING)).unwrap();
        assert_eq!(heap.live_object_count(), 2);
        frame.drop_all_locals(&heap).unwrap();
        assert_eq!(heap.live_object_count(), 0);
    }
}
