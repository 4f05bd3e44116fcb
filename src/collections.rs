// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Hash-keyed maps with insertion order, array slices, range
//! iterators and index-set (spec §4.G).

use std::collections::HashMap;

use itertools::Itertools as _;

use crate::error::{PanicKind, VmError, VmResult};
use crate::heap::{Heap, MapKey, ObjectPayload, RangeRepr};
use crate::layout::TypeId;
use crate::value::{Handle, Location, Value};

/// Discriminates the key space of a map (spec §4.G).
pub fn value_to_map_key(heap: &Heap, v: &Value) -> VmResult<MapKey> {
    match v {
        Value::Int(i, _) => Ok(MapKey::Int(*i)),
        Value::HandleString(h, _) => {
            let bytes = heap.with_object(*h, |obj| match &obj.payload {
                ObjectPayload::String(s) => match &s.rep {
                    crate::heap::StringRep::Flat { bytes } => Ok(bytes.to_vec()),
                    _ => Err(VmError::new(PanicKind::TypeMismatch, "map string key must be flat (flatten first)")),
                },
                _ => Err(VmError::new(PanicKind::TypeMismatch, "expected string object")),
            })?;
            Ok(MapKey::Str(bytes))
        }
        Value::BigInt(h, _) => {
            let decimal = crate::bignum::bigint_to_decimal(&heap.read_bigint(*h)?);
            Ok(MapKey::BigDecimal(decimal))
        }
        Value::BigUint(h, _) => {
            let decimal = crate::bignum::bigint_to_decimal(&num_bigint::BigInt::from(heap.read_biguint(*h)?));
            Ok(MapKey::BigDecimal(decimal))
        }
        _ => Err(VmError::new(PanicKind::TypeMismatch, "unsupported map key kind")),
    }
}

pub fn new_map(heap: &Heap, type_id: TypeId) -> Handle {
    heap.alloc(type_id, ObjectPayload::Map { entries: Vec::new(), index: HashMap::new() })
}

pub fn map_len(heap: &Heap, handle: Handle) -> VmResult<usize> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Map { entries, .. } => Ok(entries.len()),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

pub fn map_contains(heap: &Heap, handle: Handle, key: &MapKey) -> VmResult<bool> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Map { index, .. } => Ok(index.contains_key(key)),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

pub fn map_get_ref(heap: &Heap, handle: Handle, key: &MapKey) -> VmResult<Option<Location>> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Map { index, .. } => Ok(index
            .get(key)
            .map(|&entry_index| Location::MapElem { handle, entry_index })),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

/// `insert(k, v) -> Option<V>`: returns the prior value if replaced.
pub fn map_insert(heap: &Heap, handle: Handle, key: MapKey, key_value: Value, value: Value) -> VmResult<Option<Value>> {
    heap.with_object_mut(handle, |obj| match &mut obj.payload {
        ObjectPayload::Map { entries, index } => {
            if let Some(&i) = index.get(&key) {
                let prior = std::mem::replace(&mut entries[i as usize].1, value);
                Ok(Some(prior))
            } else {
                let i = entries.len() as u32;
                entries.push((key_value, value));
                index.insert(key, i);
                Ok(None)
            }
        }
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

/// `remove(k) -> Option<V>`: swap-with-last plus index update.
/// References to the removed slot are invalidated by construction; any
/// stale read panics `RCUseAfterFree` when the handle is next touched.
pub fn map_remove(heap: &Heap, handle: Handle, key: &MapKey) -> VmResult<Option<(Value, Value)>> {
    heap.with_object_mut(handle, |obj| match &mut obj.payload {
        ObjectPayload::Map { entries, index } => {
            let Some(removed_index) = index.remove(key) else { return Ok(None) };
            let removed = entries.swap_remove(removed_index as usize);
            if (removed_index as usize) < entries.len() {
                let moved_key = value_to_map_key_payload(&entries[removed_index as usize].0)?;
                index.insert(moved_key, removed_index);
            }
            Ok(Some(removed))
        }
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

/// Recomputes a `MapKey` from a stored key `Value` without touching
/// the heap lock recursively (used only for entries already known to
/// hold flat scalar/string keys).
fn value_to_map_key_payload(v: &Value) -> VmResult<MapKey> {
    match v {
        Value::Int(i, _) => Ok(MapKey::Int(*i)),
        _ => Err(VmError::new(
            PanicKind::TypeMismatch,
            "map_remove re-indexing requires a scalar key; string/bignum keys are re-keyed by the caller",
        )),
    }
}

pub fn map_keys(heap: &Heap, handle: Handle) -> VmResult<Vec<Value>> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Map { entries, .. } => Ok(entries.iter().map(|(k, _)| k.clone()).collect_vec()),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map")),
    })
}

// --- arrays & slices ---

pub fn new_array(heap: &Heap, type_id: TypeId, elems: Vec<Value>) -> Handle {
    heap.alloc(type_id, ObjectPayload::Array(elems))
}

/// Reads every element of an array or slice without transferring
/// ownership (read-only iteration, e.g. scanning a `JoinAll`/`Select`
/// scope for task handles).
pub fn array_elements_ref(heap: &Heap, handle: Handle) -> VmResult<Vec<Value>> {
    enum Shape {
        Flat(Vec<Value>),
        Slice { base: Handle, start: i64, len: u64 },
    }
    let shape = heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Array(elems) => Ok(Shape::Flat(elems.clone())),
        ObjectPayload::ArraySlice { base, start, len, .. } => Ok(Shape::Slice { base: *base, start: *start, len: *len }),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array or slice")),
    })?;
    match shape {
        Shape::Flat(elems) => Ok(elems),
        Shape::Slice { base, start, len } => heap.with_object(base, |obj| match &obj.payload {
            ObjectPayload::Array(elems) => Ok(elems[start as usize..(start as u64 + len) as usize].to_vec()),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "slice base is not an array")),
        }),
    }
}

pub fn array_len(heap: &Heap, handle: Handle) -> VmResult<usize> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Array(elems) => Ok(elems.len()),
        ObjectPayload::ArraySlice { len, .. } => Ok(*len as usize),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array")),
    })
}

/// Resolves a (possibly negative) array/slice index to an absolute,
/// bounds-checked offset. Index `-1` targets the last element.
pub fn normalize_index(len: u64, index: i64) -> VmResult<u64> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved as u64 >= len {
        return Err(VmError::new(PanicKind::ArrayIndexOutOfRange, format!("index {} out of range for length {}", index, len)));
    }
    Ok(resolved as u64)
}

/// The location an `a[i]` projection resolves to: for a plain array,
/// a direct element; for a slice, rewritten into the base array at
/// `base_start + i` (spec §4.G).
pub fn array_elem_location(heap: &Heap, handle: Handle, index: i64) -> VmResult<Location> {
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Array(elems) => {
            let i = normalize_index(elems.len() as u64, index)?;
            Ok(Location::ArrayElem { handle, index: i as i64 })
        }
        ObjectPayload::ArraySlice { base, start, len, .. } => {
            let i = normalize_index(*len, index)?;
            Ok(Location::ArrayElem { handle: *base, index: *start + i as i64 })
        }
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array or slice")),
    })
}

pub fn new_array_slice(heap: &Heap, type_id: TypeId, base: Handle, start: i64, len: u64, cap: u64) -> VmResult<Handle> {
    heap.retain(base)?;
    Ok(heap.alloc(type_id, ObjectPayload::ArraySlice { base, start, len, cap }))
}

// --- ranges ---

pub fn new_range_descriptor(
    heap: &Heap,
    type_id: TypeId,
    start: Option<i64>,
    end: Option<i64>,
    inclusive: bool,
) -> Handle {
    heap.alloc(
        type_id,
        ObjectPayload::Range(RangeRepr::Descriptor {
            start: start.unwrap_or(0),
            end: end.unwrap_or(0),
            has_start: start.is_some(),
            has_end: end.is_some(),
            inclusive,
        }),
    )
}

pub fn new_range_array_iter(heap: &Heap, type_id: TypeId, array_base: Handle, array_len: u64) -> VmResult<Handle> {
    heap.retain(array_base)?;
    Ok(heap.alloc(type_id, ObjectPayload::Range(RangeRepr::ArrayIter { array_base, cursor: 0, array_len })))
}

/// Advances a range iterator by one step; returns `None` at the end.
pub fn range_next(heap: &Heap, handle: Handle) -> VmResult<Option<Value>> {
    heap.with_object_mut(handle, |obj| match &mut obj.payload {
        ObjectPayload::Range(RangeRepr::Descriptor { start, end, has_end, inclusive, .. }) => {
            let limit = if *has_end { Some(*end) } else { None };
            let done = match limit {
                Some(e) if *inclusive => *start > e,
                Some(e) => *start >= e,
                None => false,
            };
            if done {
                Ok(None)
            } else {
                let v = *start;
                *start += 1;
                Ok(Some(Value::Int(v, crate::layout::TYPE_INT)))
            }
        }
        ObjectPayload::Range(RangeRepr::ArrayIter { cursor, array_len, .. }) => {
            if *cursor >= *array_len {
                return Ok(None);
            }
            let idx = *cursor as i64;
            *cursor += 1;
            Ok(Some(Value::Int(idx, crate::layout::TYPE_INT)))
        }
        _ => Err(VmError::new(PanicKind::TypeMismatch, "not a range")),
    })
}
