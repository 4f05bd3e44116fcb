// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Operand/rvalue evaluation and place-projection resolution (spec
//! §4.D).

use smallvec::SmallVec;

use crate::arith::{self, width_of};
use crate::collections;
use crate::error::{PanicKind, VmError, VmResult};
use crate::frame::{Frame, GlobalSlot};
use crate::heap::{Heap, ObjectPayload};
use crate::layout::{TypeId, TypeInterner, TypeKind, Width};
use crate::module::{BinOp, ConstValue, Operand, Place, PlaceBase, Projection, RValue, UnaryOp};
use crate::tagunion;
use crate::value::{Handle, Location, PlaceRef, Value};

/// Bundles the shared, cross-cutting state the evaluator needs without
/// owning the call stack itself — mirrors the teacher's `Context`
/// being threaded through every component instead of each one holding
/// its own copy.
pub struct EvalContext<'a> {
    pub heap: &'a Heap,
    pub types: &'a TypeInterner,
    pub globals: &'a mut Vec<GlobalSlot>,
}

impl<'a> EvalContext<'a> {
    pub fn eval_operand(&mut self, frame: &mut Frame, operand: &Operand) -> VmResult<Value> {
        match operand {
            Operand::Const(c) => Ok(self.eval_const(c)),
            Operand::Copy(place) => {
                let loc = self.eval_place(frame, place)?;
                self.load(frame, &loc)
            }
            Operand::Move(place) => self.move_place(frame, place),
        }
    }

    fn eval_const(&self, c: &ConstValue) -> Value {
        match c {
            ConstValue::Nothing => Value::Nothing,
            ConstValue::Bool(b) => Value::Bool(*b, crate::layout::TYPE_BOOL),
            ConstValue::Int(i, ty) => Value::Int(*i, *ty),
            ConstValue::Str(s, ty) => Value::HandleString(self.heap.alloc_string(*ty, s.clone().into_bytes()), *ty),
        }
    }

    /// Resolves a `Place` to a `PlaceRef` (spec §4.D "EvalPlace").
    pub fn eval_place(&mut self, frame: &mut Frame, place: &Place) -> VmResult<PlaceRef> {
        let (mut location, mut is_mut, mut type_id) = match place.base {
            PlaceBase::Local(id) => (
                Location::Local { frame: 0, local: id },
                true,
                frame.local_type(id)?,
            ),
            PlaceBase::Global(id) => {
                let slot = self
                    .globals
                    .get(id as usize)
                    .ok_or_else(|| VmError::new(PanicKind::InvalidLocation, "unknown global id"))?;
                (Location::Global { id }, true, slot.type_id)
            }
        };

        for proj in &place.projections {
            let (next_location, next_mut, next_type) =
                self.apply_projection(frame, &location, is_mut, type_id, proj)?;
            location = next_location;
            is_mut = next_mut;
            type_id = next_type;
        }

        Ok(PlaceRef { location, is_mut, type_id })
    }

    fn apply_projection(
        &mut self,
        frame: &mut Frame,
        base: &Location,
        base_mut: bool,
        base_type: TypeId,
        proj: &Projection,
    ) -> VmResult<(Location, bool, TypeId)> {
        match proj {
            Projection::Deref => {
                let base_value = self.load(frame, &PlaceRef { location: base.clone(), is_mut: base_mut, type_id: base_type })?;
                match base_value {
                    Value::Ref(p) => Ok((p.location, false, p.type_id)),
                    Value::RefMut(p) | Value::Ptr(p) => Ok((p.location, true, p.type_id)),
                    _ => Err(VmError::new(PanicKind::DerefOnNonRef, "deref on a non-reference value")),
                }
            }
            Projection::Field(index) => {
                let handle = self.location_handle(frame, base, base_mut, base_type)?;
                let field_ty = self.heap.with_object(handle, |obj| match &obj.payload {
                    ObjectPayload::Struct(fields) => {
                        if *index as usize >= fields.len() {
                            return Err(VmError::new(PanicKind::FieldIndexOutOfRange, "struct field index out of range"));
                        }
                        Ok(self.types.struct_info(obj.type_id).ok().and_then(|si| si.fields.get(*index as usize).map(|(_, t)| *t)).unwrap_or(base_type))
                    }
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "field projection on a non-struct value")),
                })?;
                Ok((Location::StructField { handle, index: *index }, base_mut, field_ty))
            }
            Projection::Index(operand) => {
                let handle = self.location_handle(frame, base, base_mut, base_type)?;
                let idx_value = self.eval_operand(frame, operand)?;
                let idx = match idx_value {
                    Value::Int(i, _) => i,
                    _ => return Err(VmError::new(PanicKind::TypeMismatch, "array index must be an int")),
                };
                let loc = collections::array_elem_location(self.heap, handle, idx)?;
                let elem_ty = self
                    .types
                    .value_type(base_type)
                    .and_then(|c| self.types.array_info(c))
                    .unwrap_or(base_type);
                Ok((loc, base_mut, elem_ty))
            }
            Projection::TagPayload(tag_name, index) => {
                let handle = self.location_handle(frame, base, base_mut, base_type)?;
                let payload_ty = self.heap.with_object(handle, |obj| match &obj.payload {
                    ObjectPayload::Tag { tag_name: actual, fields, .. } => {
                        if actual != tag_name {
                            return Err(VmError::new(PanicKind::TagPayloadTagMismatch, "tag_payload case mismatch"));
                        }
                        if *index as usize >= fields.len() {
                            return Err(VmError::new(PanicKind::TagPayloadIndexOutOfRange, "tag_payload index out of range"));
                        }
                        let layout = self.types.union_info(obj.type_id).ok();
                        Ok(layout
                            .and_then(|l| l.case_by_name(tag_name))
                            .and_then(|c| c.payload_types.get(*index as usize).copied())
                            .unwrap_or(base_type))
                    }
                    _ => Err(VmError::new(PanicKind::TagPayloadOnNonTag, "tag_payload on a non-tag value")),
                })?;
                Ok((Location::TagPayload { handle, index: *index }, base_mut, payload_ty))
            }
        }
    }

    fn location_handle(&mut self, frame: &mut Frame, loc: &Location, is_mut: bool, type_id: TypeId) -> VmResult<Handle> {
        let v = self.load(frame, &PlaceRef { location: loc.clone(), is_mut, type_id })?;
        let handle = v.handle().ok_or_else(|| VmError::new(PanicKind::InvalidLocation, "projection base is not a heap handle"));
        self.heap.release_value(&v)?;
        handle
    }

    /// Loads the value at a resolved location, applying the union
    /// retagging rule on reference-typed loads (spec §4.D).
    pub fn load(&mut self, frame: &mut Frame, place: &PlaceRef) -> VmResult<Value> {
        let raw = match &place.location {
            Location::Local { local, .. } => frame.read_local_copy(self.heap, *local)?,
            Location::Global { id } => {
                let slot = self
                    .globals
                    .get(*id as usize)
                    .ok_or_else(|| VmError::new(PanicKind::InvalidLocation, "unknown global id"))?;
                if !slot.is_init {
                    return Err(VmError::new(PanicKind::UseBeforeInit, format!("global `{}` read before init", slot.name)));
                }
                self.heap.retain_value(slot.value.clone())?
            }
            Location::StructField { handle, index } => self.heap.with_object(*handle, |obj| match &obj.payload {
                ObjectPayload::Struct(fields) => fields
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::new(PanicKind::FieldIndexOutOfRange, "struct field index out of range")),
                _ => Err(VmError::new(PanicKind::TypeMismatch, "not a struct")),
            })
            .and_then(|v| self.heap.retain_value(v))?,
            Location::ArrayElem { handle, index } => self.heap.with_object(*handle, |obj| match &obj.payload {
                ObjectPayload::Array(elems) => {
                    let i = collections::normalize_index(elems.len() as u64, *index)?;
                    Ok(elems[i as usize].clone())
                }
                _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array")),
            })
            .and_then(|v| self.heap.retain_value(v))?,
            Location::TagPayload { handle, index } => self.heap.with_object(*handle, |obj| match &obj.payload {
                ObjectPayload::Tag { fields, .. } => fields
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::new(PanicKind::TagPayloadIndexOutOfRange, "tag payload index out of range")),
                _ => Err(VmError::new(PanicKind::TagPayloadOnNonTag, "not a tag")),
            })
            .and_then(|v| self.heap.retain_value(v))?,
            Location::MapElem { handle, entry_index } => self.heap.with_object(*handle, |obj| match &obj.payload {
                ObjectPayload::Map { entries, .. } => entries
                    .get(*entry_index as usize)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| VmError::new(PanicKind::OutOfBounds, "stale map entry reference")),
                _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
            })
            .and_then(|v| self.heap.retain_value(v))?,
            Location::RawBytes { .. } => {
                return Err(VmError::new(PanicKind::InvalidLocation, "raw bytes are not a Value-typed location"))
            }
        };
        tagunion::retag_on_load(self.heap, self.types, raw, place.type_id)
    }

    /// `storeLocation`: enforces `is_mut` (spec §4.D "Mutability
    /// rule" — storing through a `Ref`-derived place panics
    /// `StoreThroughNonMutRef`).
    pub fn store(&mut self, frame: &mut Frame, place: &PlaceRef, value: Value) -> VmResult<()> {
        if !place.is_mut {
            return Err(VmError::new(PanicKind::StoreThroughNonMutRef, "store through a non-mut reference"));
        }
        match &place.location {
            Location::Local { local, .. } => frame.write_local(self.heap, *local, value)?,
            Location::Global { id } => {
                let slot = self
                    .globals
                    .get_mut(*id as usize)
                    .ok_or_else(|| VmError::new(PanicKind::InvalidLocation, "unknown global id"))?;
                if slot.is_init {
                    self.heap.release_value(&slot.value)?;
                }
                slot.value = value;
                slot.is_init = true;
            }
            Location::StructField { handle, index } => {
                let index = *index;
                // `with_object_mut` holds the heap lock for the closure's
                // duration, so the overwritten value is handed back and
                // released only after the lock is dropped (spec invariant
                // 3: an overwritten owned slot must be released, not
                // merely discarded).
                let old = self.heap.with_object_mut(*handle, |obj| match &mut obj.payload {
                    ObjectPayload::Struct(fields) => {
                        let slot = fields
                            .get_mut(index as usize)
                            .ok_or_else(|| VmError::new(PanicKind::FieldIndexOutOfRange, "struct field index out of range"))?;
                        Ok(std::mem::replace(slot, value))
                    }
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "not a struct")),
                })?;
                self.heap.release_value(&old)?;
            }
            Location::ArrayElem { handle, index } => {
                let index = *index;
                let old = self.heap.with_object_mut(*handle, |obj| match &mut obj.payload {
                    ObjectPayload::Array(elems) => {
                        let i = collections::normalize_index(elems.len() as u64, index)?;
                        Ok(std::mem::replace(&mut elems[i as usize], value))
                    }
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array")),
                })?;
                self.heap.release_value(&old)?;
            }
            Location::TagPayload { handle, index } => {
                let index = *index;
                let old = self.heap.with_object_mut(*handle, |obj| match &mut obj.payload {
                    ObjectPayload::Tag { fields, .. } => {
                        let slot = fields
                            .get_mut(index as usize)
                            .ok_or_else(|| VmError::new(PanicKind::TagPayloadIndexOutOfRange, "tag payload index out of range"))?;
                        Ok(std::mem::replace(slot, value))
                    }
                    _ => Err(VmError::new(PanicKind::TagPayloadOnNonTag, "not a tag")),
                })?;
                self.heap.release_value(&old)?;
            }
            Location::MapElem { handle, entry_index } => {
                let entry_index = *entry_index;
                let old = self.heap.with_object_mut(*handle, |obj| match &mut obj.payload {
                    ObjectPayload::Map { entries, .. } => {
                        let slot = entries
                            .get_mut(entry_index as usize)
                            .ok_or_else(|| VmError::new(PanicKind::OutOfBounds, "stale map entry reference"))?;
                        Ok(std::mem::replace(&mut slot.1, value))
                    }
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
                })?;
                self.heap.release_value(&old)?;
            }
            Location::RawBytes { .. } => {
                return Err(VmError::new(PanicKind::InvalidLocation, "raw bytes are not a Value-typed location"))
            }
        }
        Ok(())
    }

    fn move_place(&mut self, frame: &mut Frame, place: &Place) -> VmResult<Value> {
        // A bare local move is the common, zero-copy path; a projected
        // move (e.g. moving out of a struct field) reads-then-clears
        // via an explicit load + store of `Invalid`, matching the
        // ownership-transfer contract of spec §4.A.
        if place.projections.is_empty() {
            if let PlaceBase::Local(id) = place.base {
                return frame.read_local_move(id);
            }
        }
        let loc = self.eval_place(frame, place)?;
        let value = self.load(frame, &loc)?;
        self.store(frame, &loc, Value::Invalid)?;
        Ok(value)
    }

    /// Evaluates an rvalue into an owned `Value` (spec §4.D "RValue
    /// kinds").
    pub fn eval_rvalue(&mut self, frame: &mut Frame, rvalue: &RValue) -> VmResult<Value> {
        match rvalue {
            RValue::Use(op) => self.eval_operand(frame, op),
            RValue::BinOp(op, l, r) => self.eval_binop(frame, *op, l, r),
            RValue::UnaryOp(op, e) => self.eval_unaryop(frame, *op, e),
            RValue::TypeTest(v, target) => {
                let value = self.eval_operand(frame, v)?;
                let vty = value
                    .type_id()
                    .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "value has no type id"))?;
                let result = self.types.value_type(vty)? == self.types.value_type(*target)?;
                self.heap.release_value(&value)?;
                Ok(Value::Bool(result, crate::layout::TYPE_BOOL))
            }
            RValue::HeirTest(v, target) => {
                let value = self.eval_operand(frame, v)?;
                let vty = value
                    .type_id()
                    .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "value has no type id"))?;
                let result = self.types.heir_of(vty, *target)?;
                self.heap.release_value(&value)?;
                Ok(Value::Bool(result, crate::layout::TYPE_BOOL))
            }
            RValue::TagPayload(v, tag_name, index) => {
                let value = self.eval_operand(frame, v)?;
                let result = tagunion::tag_payload(self.heap, &value, tag_name, *index);
                self.heap.release_value(&value)?;
                result
            }
            RValue::Cast(v, target) => {
                let value = self.eval_operand(frame, v)?;
                self.eval_cast(value, *target)
            }
            RValue::MakeStruct(ty, fields) => {
                let mut values: SmallVec<[Value; 4]> = SmallVec::new();
                for f in fields {
                    values.push(self.eval_operand(frame, f)?);
                }
                Ok(Value::HandleStruct(self.heap.alloc(*ty, ObjectPayload::Struct(values)), *ty))
            }
            RValue::MakeTag(ty, tag_name, fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for f in fields {
                    values.push(self.eval_operand(frame, f)?);
                }
                Ok(Value::HandleTag(tagunion::make_tag(self.heap, self.types, *ty, tag_name, values)?, *ty))
            }
            RValue::MakeArray(ty, elems) => {
                let mut values = Vec::with_capacity(elems.len());
                for e in elems {
                    values.push(self.eval_operand(frame, e)?);
                }
                Ok(Value::HandleArray(collections::new_array(self.heap, *ty, values), *ty))
            }
            RValue::MakeTuple(elems) => {
                let mut values: SmallVec<[Value; 4]> = SmallVec::new();
                for e in elems {
                    values.push(self.eval_operand(frame, e)?);
                }
                let ty = self.types_tuple_type(&values);
                Ok(Value::HandleStruct(self.heap.alloc(ty, ObjectPayload::Struct(values)), ty))
            }
            RValue::MakeRange { start, end, inclusive } => {
                let start_v = start.as_ref().map(|o| self.eval_operand(frame, o)).transpose()?;
                let end_v = end.as_ref().map(|o| self.eval_operand(frame, o)).transpose()?;
                let start_i = start_v.as_ref().and_then(value_as_int);
                let end_i = end_v.as_ref().and_then(value_as_int);
                Ok(Value::HandleRange(
                    collections::new_range_descriptor(self.heap, crate::layout::TYPE_INT, start_i, end_i, *inclusive),
                    crate::layout::TYPE_INT,
                ))
            }
        }
    }

    // Tuples reuse the struct representation; the type id is advisory
    // here since no front-end-registered layout exists for ad hoc
    // tuple arities in this standalone evaluator.
    fn types_tuple_type(&self, _values: &[Value]) -> TypeId {
        crate::layout::TYPE_NOTHING
    }

    fn eval_binop(&mut self, frame: &mut Frame, op: BinOp, l: &Operand, r: &Operand) -> VmResult<Value> {
        let lv = self.eval_operand(frame, l)?;
        let rv = self.eval_operand(frame, r)?;
        let result = self.apply_binop(op, &lv, &rv);
        self.heap.release_value(&lv)?;
        self.heap.release_value(&rv)?;
        result
    }

    fn apply_binop(&mut self, op: BinOp, lv: &Value, rv: &Value) -> VmResult<Value> {
        match op {
            BinOp::And => {
                let (l, r) = (as_bool(lv)?, as_bool(rv)?);
                return Ok(Value::Bool(l && r, crate::layout::TYPE_BOOL));
            }
            BinOp::Or => {
                let (l, r) = (as_bool(lv)?, as_bool(rv)?);
                return Ok(Value::Bool(l || r, crate::layout::TYPE_BOOL));
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                return self.compare(op, lv, rv);
            }
            _ => {}
        }
        match (lv, rv) {
            (Value::Int(l, lty), Value::Int(r, rty)) => {
                if self.types.value_type(*lty)? != self.types.value_type(*rty)? {
                    return Err(VmError::new(PanicKind::NumericOpTypeMismatch, "operand width/signedness mismatch"));
                }
                let kind = &self.types.lookup(*lty)?.kind;
                let width = width_of(kind).unwrap_or(crate::layout::Width::W64);
                let result = match kind {
                    TypeKind::Uint(_) => arith::unsigned_binop(op, *l as u64, *r as u64, width)? as i64,
                    _ => arith::signed_binop(op, *l, *r, width)?,
                };
                Ok(Value::Int(result, *lty))
            }
            _ => Err(VmError::new(PanicKind::NumericOpTypeMismatch, "binop operands are not both ints")),
        }
    }

    fn compare(&self, op: BinOp, lv: &Value, rv: &Value) -> VmResult<Value> {
        let ordering = match (lv, rv) {
            (Value::Int(l, _), Value::Int(r, _)) => l.cmp(r),
            (Value::Bool(l, _), Value::Bool(r, _)) => l.cmp(r),
            (Value::HandleString(lh, _), Value::HandleString(rh, _)) => {
                let lb = flatten_string_bytes(self.heap, *lh)?;
                let rb = flatten_string_bytes(self.heap, *rh)?;
                lb.cmp(&rb)
            }
            (Value::Nothing, Value::Nothing) => std::cmp::Ordering::Equal,
            _ => {
                if std::mem::discriminant(lv) == std::mem::discriminant(rv) {
                    // Aggregates without structural comparison compare by handle identity.
                    match (lv.handle(), rv.handle()) {
                        (Some(a), Some(b)) => a.0.cmp(&b.0),
                        _ => return Err(VmError::new(PanicKind::TypeMismatch, "values are not comparable")),
                    }
                } else {
                    return Err(VmError::new(PanicKind::TypeMismatch, "comparison kind mismatch"));
                }
            }
        };
        use std::cmp::Ordering::*;
        let result = match op {
            BinOp::Eq => ordering == Equal,
            BinOp::Ne => ordering != Equal,
            BinOp::Lt => ordering == Less,
            BinOp::Le => ordering != Greater,
            BinOp::Gt => ordering == Greater,
            BinOp::Ge => ordering != Less,
            _ => unreachable!(),
        };
        Ok(Value::Bool(result, crate::layout::TYPE_BOOL))
    }

    fn eval_unaryop(&mut self, frame: &mut Frame, op: UnaryOp, e: &Operand) -> VmResult<Value> {
        let v = self.eval_operand(frame, e)?;
        let result = match (op, &v) {
            (UnaryOp::Not, Value::Bool(b, ty)) => Ok(Value::Bool(!b, *ty)),
            (UnaryOp::Neg, Value::Int(i, ty)) => {
                let width = self.types.lookup(*ty).ok().and_then(|d| width_of(&d.kind)).unwrap_or(crate::layout::Width::W64);
                Ok(Value::Int(arith::signed_binop(BinOp::Sub, 0, *i, width)?, *ty))
            }
            (UnaryOp::BitNot, Value::Int(i, ty)) => Ok(Value::Int(!*i, *ty)),
            _ => Err(VmError::new(PanicKind::NumericOpTypeMismatch, "unary op on incompatible value")),
        };
        self.heap.release_value(&v)?;
        result
    }

    fn eval_cast(&mut self, value: Value, target: TypeId) -> VmResult<Value> {
        let canonical = self.types.value_type(target)?;
        let target_kind = self.types.lookup(canonical)?.kind.clone();
        let result = self.eval_cast_to(&value, canonical, &target_kind);
        self.heap.release_value(&value)?;
        result
    }

    /// The `__to` conversion matrix (spec §4.E). Kept separate from
    /// `eval_cast` so the source value's release on the way out isn't
    /// tangled with the (fallible) construction of the destination.
    fn eval_cast_to(&mut self, value: &Value, canonical: TypeId, target_kind: &TypeKind) -> VmResult<Value> {
        match (value, target_kind) {
            (Value::Int(i, _), TypeKind::String) => Ok(self.alloc_string_value(i.to_string())),
            (Value::Bool(b, _), TypeKind::String) => Ok(self.alloc_string_value(b.to_string())),
            (Value::BigInt(h, _), TypeKind::String) => {
                let decimal = crate::bignum::bigint_to_decimal(&self.heap.read_bigint(*h)?);
                Ok(self.alloc_string_value(decimal))
            }
            (Value::BigUint(h, _), TypeKind::String) => {
                let decimal = crate::bignum::bigint_to_decimal(&num_bigint::BigInt::from(self.heap.read_biguint(*h)?));
                Ok(self.alloc_string_value(decimal))
            }
            (Value::BigFloat(h, _), TypeKind::String) => {
                let decimal = self.heap.read_bigfloat(*h)?.to_string();
                Ok(self.alloc_string_value(decimal))
            }

            // int/uint of WidthAny: bignum-backed, not range-checked.
            (Value::Int(i, _), TypeKind::Int(Width::Any)) => {
                Ok(Value::BigInt(self.heap.alloc_bigint(canonical, &num_bigint::BigInt::from(*i)), canonical))
            }
            (Value::Int(i, _), TypeKind::Uint(Width::Any)) => {
                if *i < 0 {
                    return Err(VmError::new(PanicKind::InvalidNumericConversion, "negative value cannot convert to unsigned"));
                }
                Ok(Value::BigUint(self.heap.alloc_biguint(canonical, &num_bigint::BigUint::from(*i as u64)), canonical))
            }
            (Value::Int(i, _), TypeKind::Int(w)) => Ok(Value::Int(arith::range_check_to_signed(*i, *w)?, canonical)),
            (Value::Int(i, _), TypeKind::Uint(w)) => Ok(Value::Int(arith::range_check_to_unsigned(*i, *w)? as i64, canonical)),

            (Value::HandleString(h, _), TypeKind::Int(Width::Any)) => {
                let bytes = flatten_string_bytes(self.heap, *h)?;
                let parsed = crate::bignum::parse_bigint(&String::from_utf8_lossy(&bytes))?;
                Ok(Value::BigInt(self.heap.alloc_bigint(canonical, &parsed), canonical))
            }
            (Value::HandleString(h, _), TypeKind::Uint(Width::Any)) => {
                let bytes = flatten_string_bytes(self.heap, *h)?;
                let parsed = crate::bignum::parse_biguint(&String::from_utf8_lossy(&bytes))?;
                Ok(Value::BigUint(self.heap.alloc_biguint(canonical, &parsed), canonical))
            }
            (Value::HandleString(h, _), TypeKind::Int(_)) | (Value::HandleString(h, _), TypeKind::Uint(_)) => {
                let bytes = flatten_string_bytes(self.heap, *h)?;
                let s = String::from_utf8_lossy(&bytes);
                let parsed = crate::bignum::parse_bigint(&s)?;
                let i = crate::bignum::bigint_to_i64_checked(&parsed)?;
                Ok(Value::Int(i, canonical))
            }

            // to float: bignum conversion, width-checked on the destination.
            (Value::Int(i, _), TypeKind::Float(w)) => {
                let checked = crate::bignum::check_float_width(*i as f64, *w)?;
                Ok(Value::BigFloat(self.heap.alloc_bigfloat(canonical, checked), canonical))
            }
            (Value::HandleString(h, _), TypeKind::Float(w)) => {
                let bytes = flatten_string_bytes(self.heap, *h)?;
                let s = String::from_utf8_lossy(&bytes);
                let parsed = s
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| VmError::new(PanicKind::TypeMismatch, format!("cannot parse `{}` as float: {}", s, e)))?;
                let checked = crate::bignum::check_float_width(parsed, *w)?;
                Ok(Value::BigFloat(self.heap.alloc_bigfloat(canonical, checked), canonical))
            }
            (Value::BigInt(h, _), TypeKind::Float(w)) => {
                let checked = crate::bignum::check_float_width(crate::bignum::bigint_to_f64(&self.heap.read_bigint(*h)?), *w)?;
                Ok(Value::BigFloat(self.heap.alloc_bigfloat(canonical, checked), canonical))
            }
            (Value::BigUint(h, _), TypeKind::Float(w)) => {
                let as_bigint = num_bigint::BigInt::from(self.heap.read_biguint(*h)?);
                let checked = crate::bignum::check_float_width(crate::bignum::bigint_to_f64(&as_bigint), *w)?;
                Ok(Value::BigFloat(self.heap.alloc_bigfloat(canonical, checked), canonical))
            }
            (Value::BigFloat(h, _), TypeKind::Float(w)) => {
                let checked = crate::bignum::check_float_width(self.heap.read_bigfloat(*h)?, *w)?;
                Ok(Value::BigFloat(self.heap.alloc_bigfloat(canonical, checked), canonical))
            }

            // Legacy compatibility: struct { code: int } -> int.
            (Value::HandleStruct(h, struct_type), TypeKind::Int(w)) => {
                let struct_type = self.types.value_type(*struct_type)?;
                let info = self.types.struct_info(struct_type)?;
                let index = info
                    .index_by_name("code")
                    .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "struct has no `code` field to convert to int"))?;
                let field_type = self.types.value_type(info.fields[index as usize].1)?;
                if !matches!(self.types.lookup(field_type)?.kind, TypeKind::Int(_)) {
                    return Err(VmError::new(PanicKind::TypeMismatch, "struct `code` field is not an int"));
                }
                let code = self.heap.with_object(*h, |obj| match &obj.payload {
                    ObjectPayload::Struct(fields) => match fields.get(index as usize) {
                        Some(Value::Int(i, _)) => Ok(*i),
                        _ => Err(VmError::new(PanicKind::TypeMismatch, "struct `code` field is not an int")),
                    },
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "not a struct")),
                })?;
                Ok(Value::Int(arith::range_check_to_signed(code, *w)?, canonical))
            }

            _ => Err(VmError::new(PanicKind::TypeMismatch, "unsupported __to conversion")),
        }
    }

    fn alloc_string_value(&self, s: String) -> Value {
        Value::HandleString(self.heap.alloc_string(crate::layout::TYPE_STRING, s.into_bytes()), crate::layout::TYPE_STRING)
    }
}

fn as_bool(v: &Value) -> VmResult<bool> {
    match v {
        Value::Bool(b, _) => Ok(*b),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a bool")),
    }
}

fn value_as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i, _) => Some(*i),
        _ => None,
    }
}

pub fn flatten_string_bytes(heap: &Heap, handle: Handle) -> VmResult<Vec<u8>> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::String(s) => Ok(s.clone()),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a string object")),
    })
    .and_then(|s| flatten_rep(heap, &s.rep))
}

fn flatten_rep(heap: &Heap, rep: &crate::heap::StringRep) -> VmResult<Vec<u8>> {
    use crate::heap::StringRep::*;
    match rep {
        Flat { bytes } => Ok(bytes.to_vec()),
        Concat { left, right, .. } => {
            let mut l = flatten_string_bytes(heap, *left)?;
            let r = flatten_string_bytes(heap, *right)?;
            l.extend_from_slice(&r);
            Ok(l)
        }
        Slice { base, start_cp, len } => {
            let base_bytes = flatten_string_bytes(heap, *base)?;
            let s = String::from_utf8_lossy(&base_bytes);
            let sliced: String = s.chars().skip(*start_cp as usize).take(*len as usize).collect();
            Ok(sliced.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::LocalSlot;
    use crate::layout::{TypeKind, TYPE_INT};
    use crate::module::ConstValue;

    fn ctx<'a>(heap: &'a Heap, types: &'a TypeInterner, globals: &'a mut Vec<GlobalSlot>) -> EvalContext<'a> {
        EvalContext { heap, types, globals }
    }

    #[test]
    fn copy_operand_retains_handle() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("s", crate::layout::TYPE_STRING)]);
        let h = heap.alloc_string(crate::layout::TYPE_STRING, b"hi".to_vec());
        frame.write_local(&heap, 0, Value::HandleString(h, crate::layout::TYPE_STRING)).unwrap();
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c.eval_operand(&mut frame, &Operand::Copy(Place::local(0))).unwrap();
        assert_eq!(v, Value::HandleString(h, crate::layout::TYPE_STRING));
        // Object now has refcount 2: original local + the copy.
        heap.release_value(&v).unwrap();
        assert_eq!(heap.live_object_count(), 1);
    }

    #[test]
    fn move_operand_marks_source_moved() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("x", TYPE_INT)]);
        frame.write_local(&heap, 0, Value::Int(9, TYPE_INT)).unwrap();
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c.eval_operand(&mut frame, &Operand::Move(Place::local(0))).unwrap();
        assert_eq!(v, Value::Int(9, TYPE_INT));
        let err = frame.read_local_copy(&heap, 0).unwrap_err();
        assert_eq!(err.kind, PanicKind::UseAfterMove);
    }

    #[test]
    fn store_through_ref_panics() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("x", TYPE_INT)]);
        frame.write_local(&heap, 0, Value::Int(1, TYPE_INT)).unwrap();
        let place = PlaceRef { location: Location::Local { frame: 0, local: 0 }, is_mut: false, type_id: TYPE_INT };
        let mut c = ctx(&heap, &types, &mut globals);
        let err = c.store(&mut frame, &place, Value::Int(2, TYPE_INT)).unwrap_err();
        assert_eq!(err.kind, PanicKind::StoreThroughNonMutRef);
    }

    #[test]
    fn binop_add_int() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c
            .eval_rvalue(
                &mut frame,
                &RValue::BinOp(
                    BinOp::Add,
                    Operand::Const(ConstValue::Int(2, TYPE_INT)),
                    Operand::Const(ConstValue::Int(3, TYPE_INT)),
                ),
            )
            .unwrap();
        assert_eq!(v, Value::Int(5, TYPE_INT));
    }

    /// Moving a heap-owning value out of a struct field must conserve
    /// the refcount: the struct's own ownership of the field is
    /// released exactly once, and the moved-out value carries the
    /// single retain `load` took for the caller (spec §8 refcount
    /// conservation).
    #[test]
    fn move_out_of_struct_field_does_not_leak_the_overwritten_slot() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let inner = heap.alloc_string(crate::layout::TYPE_STRING, b"hi".to_vec());
        let s = heap.alloc(
            crate::layout::TYPE_STRING,
            ObjectPayload::Struct(SmallVec::from_vec(vec![Value::HandleString(inner, crate::layout::TYPE_STRING)])),
        );
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("s", crate::layout::TYPE_STRING)]);
        frame.write_local(&heap, 0, Value::HandleStruct(s, crate::layout::TYPE_STRING)).unwrap();

        let mut c = ctx(&heap, &types, &mut globals);
        let place = Place::local(0).project(Projection::Field(0));
        let moved = c.eval_operand(&mut frame, &Operand::Move(place)).unwrap();
        assert_eq!(moved, Value::HandleString(inner, crate::layout::TYPE_STRING));

        // The struct is still live (frame owns it); the field's only
        // surviving owner is `moved`, which the caller now releases.
        assert_eq!(heap.live_object_count(), 2);
        heap.release_value(&moved).unwrap();
        assert_eq!(heap.live_object_count(), 1);
        frame.drop_all_locals(&heap).unwrap();
        assert_eq!(heap.live_object_count(), 0);
    }

    #[test]
    fn type_test_is_identity_after_stripping_own() {
        let heap = Heap::new();
        let mut types = TypeInterner::new();
        let owned = types.intern(TypeKind::Own(TYPE_INT));
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c
            .eval_rvalue(&mut frame, &RValue::TypeTest(Operand::Const(ConstValue::Int(1, TYPE_INT)), owned))
            .unwrap();
        assert_eq!(v, Value::Bool(true, crate::layout::TYPE_BOOL));
    }

    #[test]
    fn cast_int_to_float_produces_a_bigfloat() {
        let heap = Heap::new();
        let types = TypeInterner::new();
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c
            .eval_rvalue(
                &mut frame,
                &RValue::Cast(Operand::Const(ConstValue::Int(7, TYPE_INT)), crate::layout::TYPE_FLOAT),
            )
            .unwrap();
        match v {
            Value::BigFloat(h, _) => assert_eq!(heap.read_bigfloat(h).unwrap(), 7.0),
            other => panic!("expected a bigfloat, got {:?}", other),
        }
    }

    #[test]
    fn cast_to_int_of_width_any_is_bignum_backed() {
        let heap = Heap::new();
        let mut types = TypeInterner::new();
        let any_int = types.intern(TypeKind::Int(crate::layout::Width::Any));
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![]);
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c
            .eval_rvalue(&mut frame, &RValue::Cast(Operand::Const(ConstValue::Int(42, TYPE_INT)), any_int))
            .unwrap();
        match v {
            Value::BigInt(h, _) => assert_eq!(heap.read_bigint(h).unwrap(), num_bigint::BigInt::from(42)),
            other => panic!("expected a bigint, got {:?}", other),
        }
    }

    #[test]
    fn cast_bigint_to_string_is_canonical_decimal() {
        let heap = Heap::new();
        let mut types = TypeInterner::new();
        let any_int = types.intern(TypeKind::Int(crate::layout::Width::Any));
        let bignum = heap.alloc_bigint(any_int, &num_bigint::BigInt::from(-123i64));
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("n", any_int)]);
        frame.write_local(&heap, 0, Value::BigInt(bignum, any_int)).unwrap();
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c
            .eval_rvalue(
                &mut frame,
                &RValue::Cast(Operand::Move(Place::local(0)), crate::layout::TYPE_STRING),
            )
            .unwrap();
        match v {
            Value::HandleString(h, _) => {
                assert_eq!(flatten_string_bytes(&heap, h).unwrap(), b"-123");
            }
            other => panic!("expected a string, got {:?}", other),
        }
    }

    #[test]
    fn cast_struct_with_code_field_to_int_extracts_the_field() {
        let heap = Heap::new();
        let mut types = TypeInterner::new();
        let struct_ty = types.intern(TypeKind::Struct(crate::layout::StructInfo { fields: vec![] }));
        types.register_struct_layout(struct_ty, crate::layout::StructInfo { fields: vec![("code".into(), TYPE_INT)] });
        let s = heap.alloc(struct_ty, ObjectPayload::Struct(SmallVec::from_vec(vec![Value::Int(99, TYPE_INT)])));
        let mut globals = Vec::new();
        let mut frame = Frame::new(0, 0, vec![LocalSlot::empty("s", struct_ty)]);
        frame.write_local(&heap, 0, Value::HandleStruct(s, struct_ty)).unwrap();
        let mut c = ctx(&heap, &types, &mut globals);
        let v = c.eval_rvalue(&mut frame, &RValue::Cast(Operand::Move(Place::local(0)), TYPE_INT)).unwrap();
        assert_eq!(v, Value::Int(99, TYPE_INT));
    }
}
