// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted heap objects, the handle allocator and the raw
//! memory arena (spec §4.A).

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{PanicKind, VmError, VmResult};
use crate::layout::TypeId;
use crate::value::{Handle, Value};

/// A flat string leaf's bytes. `Bytes` gives cheap, refcounted clones
/// when a rope node is read through without flattening the whole rope.
#[derive(Clone, Debug)]
pub enum StringRep {
    Flat { bytes: Bytes },
    Concat { left: Handle, right: Handle, byte_len: u64, cp_len: u64, cp_len_known: bool },
    Slice { base: Handle, start_cp: u64, len: u64 },
}

#[derive(Clone, Debug)]
pub struct StringObj {
    pub rep: StringRep,
    pub byte_len: u64,
    pub cp_len: u64,
    pub cp_len_known: bool,
}

#[derive(Clone, Debug)]
pub enum RangeRepr {
    Descriptor { start: i64, end: i64, has_start: bool, has_end: bool, inclusive: bool },
    ArrayIter { array_base: Handle, cursor: u64, array_len: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapKey {
    Int(i64),
    Uint(u64),
    Str(Vec<u8>),
    BigDecimal(String),
}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            MapKey::Int(i) => (0u8, i).hash(state),
            MapKey::Uint(u) => (1u8, u).hash(state),
            MapKey::Str(s) => (2u8, s).hash(state),
            MapKey::BigDecimal(s) => (3u8, s).hash(state),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ObjectPayload {
    String(StringObj),
    Array(Vec<Value>),
    ArraySlice { base: Handle, start: i64, len: u64, cap: u64 },
    Map { entries: Vec<(Value, Value)>, index: HashMap<MapKey, u32> },
    Struct(SmallVec<[Value; 4]>),
    Tag { tag_sym: u32, tag_name: String, fields: SmallVec<[Value; 2]> },
    Range(RangeRepr),
    /// Little-endian 64-bit limbs of the magnitude, plus sign.
    BigInt(Vec<u64>, bool),
    /// Little-endian 64-bit limbs; always non-negative.
    BigUint(Vec<u64>),
    /// A single limb holding `f64::to_bits()` (spec §4.E bignum-backed
    /// float; `num-bigint` has no float type of its own to stand in).
    BigFloat(Vec<u64>),
    /// A refcount-shared handle naming an executor-owned task record
    /// (spec §3 "Task values are refcount-shared handles"); the actual
    /// scheduling state lives in `Vm`/`AsyncExecutor`, keyed by the
    /// `TaskId` carried here.
    Task(u64),
    /// Payload already released on `Free`; kept so double-free is
    /// detectable without reusing the handle.
    Freed,
}

#[derive(Clone, Debug)]
pub struct Object {
    pub ref_count: u64,
    pub freed: bool,
    pub type_id: TypeId,
    pub alloc_id: u64,
    pub payload: ObjectPayload,
}

/// A parallel arena for C-ABI intrinsics (`rt_alloc`/`rt_free`/...).
struct RawBlock {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    align: u64,
}

struct HeapInner {
    next_handle: u64,
    objects: HashMap<u64, Object>,
    raw_arena: HashMap<u64, RawBlock>,
    alloc_counter: u64,
}

/// Owns all heap objects for one VM run. Every operation validates the
/// handle first; invalid/freed access panics (spec invariant 1).
pub struct Heap {
    inner: Mutex<HeapInner>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            inner: Mutex::new(HeapInner {
                next_handle: 1,
                objects: HashMap::new(),
                raw_arena: HashMap::new(),
                alloc_counter: 0,
            }),
        }
    }

    fn fresh_handle(inner: &mut HeapInner) -> Handle {
        let h = Handle(inner.next_handle);
        inner.next_handle += 1;
        h
    }

    pub fn alloc(&self, type_id: TypeId, payload: ObjectPayload) -> Handle {
        let mut inner = self.inner.lock();
        let handle = Self::fresh_handle(&mut inner);
        inner.alloc_counter += 1;
        let alloc_id = inner.alloc_counter;
        inner.objects.insert(
            handle.0,
            Object { ref_count: 1, freed: false, type_id, alloc_id, payload },
        );
        tracing::trace!(?handle, "heap alloc");
        handle
    }

    pub fn alloc_string(&self, type_id: TypeId, bytes: Vec<u8>) -> Handle {
        let byte_len = bytes.len() as u64;
        let cp_len = String::from_utf8_lossy(&bytes).chars().count() as u64;
        self.alloc(
            type_id,
            ObjectPayload::String(StringObj {
                rep: StringRep::Flat { bytes: Bytes::from(bytes) },
                byte_len,
                cp_len,
                cp_len_known: true,
            }),
        )
    }

    pub fn alloc_string_concat(
        &self,
        type_id: TypeId,
        left: Handle,
        right: Handle,
        byte_len: u64,
        cp_len: u64,
        cp_len_known: bool,
    ) -> VmResult<Handle> {
        self.retain(left)?;
        self.retain(right)?;
        Ok(self.alloc(
            type_id,
            ObjectPayload::String(StringObj {
                rep: StringRep::Concat { left, right, byte_len, cp_len, cp_len_known },
                byte_len,
                cp_len,
                cp_len_known,
            }),
        ))
    }

    pub fn alloc_string_slice(
        &self,
        type_id: TypeId,
        base: Handle,
        start_cp: u64,
        cp_len: u64,
        byte_len: u64,
    ) -> VmResult<Handle> {
        self.retain(base)?;
        Ok(self.alloc(
            type_id,
            ObjectPayload::String(StringObj {
                rep: StringRep::Slice { base, start_cp, len: cp_len },
                byte_len,
                cp_len,
                cp_len_known: true,
            }),
        ))
    }

    // --- bignum objects (spec §4.E) ---

    pub fn alloc_bigint(&self, type_id: TypeId, v: &num_bigint::BigInt) -> Handle {
        let (limbs, sign) = crate::bignum::bigint_to_limbs(v);
        self.alloc(type_id, ObjectPayload::BigInt(limbs, sign == num_bigint::Sign::Minus))
    }

    pub fn alloc_biguint(&self, type_id: TypeId, v: &num_bigint::BigUint) -> Handle {
        self.alloc(type_id, ObjectPayload::BigUint(v.to_u64_digits()))
    }

    pub fn alloc_bigfloat(&self, type_id: TypeId, v: f64) -> Handle {
        self.alloc(type_id, ObjectPayload::BigFloat(vec![v.to_bits()]))
    }

    pub fn read_bigint(&self, handle: Handle) -> VmResult<num_bigint::BigInt> {
        self.with_object(handle, |obj| match &obj.payload {
            ObjectPayload::BigInt(limbs, negative) => {
                let sign = if *negative { num_bigint::Sign::Minus } else { num_bigint::Sign::Plus };
                Ok(crate::bignum::limbs_to_bigint(limbs, sign))
            }
            _ => Err(VmError::new(PanicKind::TypeMismatch, "handle does not hold a bigint object")),
        })
    }

    pub fn read_biguint(&self, handle: Handle) -> VmResult<num_bigint::BigUint> {
        self.with_object(handle, |obj| match &obj.payload {
            ObjectPayload::BigUint(limbs) => Ok(num_bigint::BigUint::new(
                limbs.iter().flat_map(|limb| [*limb as u32, (*limb >> 32) as u32]).collect(),
            )),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "handle does not hold a biguint object")),
        })
    }

    pub fn read_bigfloat(&self, handle: Handle) -> VmResult<f64> {
        self.with_object(handle, |obj| match &obj.payload {
            ObjectPayload::BigFloat(limbs) => {
                Ok(f64::from_bits(*limbs.first().ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "empty bigfloat limbs"))?))
            }
            _ => Err(VmError::new(PanicKind::TypeMismatch, "handle does not hold a bigfloat object")),
        })
    }

    /// `Get(handle) -> Object`: panics `InvalidHandle` if 0/unknown,
    /// `RCUseAfterFree` if freed or refcount 0.
    pub fn get(&self, handle: Handle) -> VmResult<Object> {
        if !handle.is_valid() {
            return Err(VmError::new(PanicKind::InvalidHandle, "handle is zero"));
        }
        let inner = self.inner.lock();
        let obj = inner
            .objects
            .get(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, format!("unknown handle {}", handle)))?;
        if obj.freed || obj.ref_count == 0 {
            return Err(VmError::new(PanicKind::RcUseAfterFree, format!("handle {} already freed", handle)));
        }
        Ok(obj.clone())
    }

    pub fn with_object<R>(&self, handle: Handle, f: impl FnOnce(&Object) -> VmResult<R>) -> VmResult<R> {
        if !handle.is_valid() {
            return Err(VmError::new(PanicKind::InvalidHandle, "handle is zero"));
        }
        let inner = self.inner.lock();
        let obj = inner
            .objects
            .get(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, format!("unknown handle {}", handle)))?;
        if obj.freed || obj.ref_count == 0 {
            return Err(VmError::new(PanicKind::RcUseAfterFree, format!("handle {} already freed", handle)));
        }
        f(obj)
    }

    pub fn with_object_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut Object) -> VmResult<R>) -> VmResult<R> {
        if !handle.is_valid() {
            return Err(VmError::new(PanicKind::InvalidHandle, "handle is zero"));
        }
        let mut inner = self.inner.lock();
        let obj = inner
            .objects
            .get_mut(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, format!("unknown handle {}", handle)))?;
        if obj.freed || obj.ref_count == 0 {
            return Err(VmError::new(PanicKind::RcUseAfterFree, format!("handle {} already freed", handle)));
        }
        f(obj)
    }

    /// Overflow-checked increment (spec invariant 2).
    pub fn retain(&self, handle: Handle) -> VmResult<()> {
        self.with_object_mut(handle, |obj| {
            obj.ref_count = obj
                .ref_count
                .checked_add(1)
                .ok_or_else(|| VmError::new(PanicKind::IntOverflow, "refcount overflow on retain"))?;
            Ok(())
        })
    }

    /// Decrement; on zero, mark freed and recursively release
    /// contained values (spec invariant 4).
    pub fn release(&self, handle: Handle) -> VmResult<()> {
        if !handle.is_valid() {
            return Ok(());
        }
        let should_free = {
            let mut inner = self.inner.lock();
            let obj = inner
                .objects
                .get_mut(&handle.0)
                .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, format!("unknown handle {}", handle)))?;
            if obj.freed || obj.ref_count == 0 {
                return Err(VmError::new(PanicKind::RcUseAfterFree, format!("double release of {}", handle)));
            }
            obj.ref_count -= 1;
            obj.ref_count == 0
        };
        if should_free {
            self.free(handle)?;
        }
        Ok(())
    }

    fn free(&self, handle: Handle) -> VmResult<()> {
        let payload = {
            let mut inner = self.inner.lock();
            let obj = inner
                .objects
                .get_mut(&handle.0)
                .expect("free called on handle validated by release");
            if obj.freed {
                return Err(VmError::new(PanicKind::DoubleFree, format!("double free of {}", handle)));
            }
            obj.freed = true;
            std::mem::replace(&mut obj.payload, ObjectPayload::Freed)
        };
        tracing::trace!(?handle, "heap free");
        match payload {
            ObjectPayload::String(s) => match s.rep {
                StringRep::Concat { left, right, .. } => {
                    self.release(left)?;
                    self.release(right)?;
                }
                StringRep::Slice { base, .. } => self.release(base)?,
                StringRep::Flat { .. } => {}
            },
            ObjectPayload::Array(elems) => {
                for v in elems {
                    self.release_value(&v)?;
                }
            }
            ObjectPayload::ArraySlice { base, .. } => self.release(base)?,
            ObjectPayload::Map { entries, .. } => {
                for (k, v) in entries {
                    self.release_value(&k)?;
                    self.release_value(&v)?;
                }
            }
            ObjectPayload::Struct(fields) => {
                for v in fields {
                    self.release_value(&v)?;
                }
            }
            ObjectPayload::Tag { fields, .. } => {
                for v in fields {
                    self.release_value(&v)?;
                }
            }
            ObjectPayload::Range(RangeRepr::ArrayIter { array_base, .. }) => {
                self.release(array_base)?;
            }
            ObjectPayload::Range(RangeRepr::Descriptor { .. }) => {}
            ObjectPayload::BigInt(_, _) | ObjectPayload::BigUint(_) | ObjectPayload::BigFloat(_) => {}
            ObjectPayload::Task(_) => {}
            ObjectPayload::Freed => {
                return Err(VmError::new(PanicKind::DoubleFree, format!("double free of {}", handle)))
            }
        }
        Ok(())
    }

    /// Releases a value's handle if it owns one; a pure no-op for
    /// primitive/ref-family values (spec invariant 3).
    pub fn release_value(&self, value: &Value) -> VmResult<()> {
        if value.is_heap_owning() {
            if let Some(h) = value.handle() {
                self.release(h)?;
            }
        }
        Ok(())
    }

    /// Retains a value's handle if it owns one; returns the same value
    /// (used by `Copy` operands, spec §4.D).
    pub fn retain_value(&self, value: Value) -> VmResult<Value> {
        if value.is_heap_owning() {
            if let Some(h) = value.handle() {
                self.retain(h)?;
            }
        }
        Ok(value)
    }

    pub fn alloc_task(&self, type_id: TypeId, task_id: u64) -> Handle {
        self.alloc(type_id, ObjectPayload::Task(task_id))
    }

    pub fn task_id_of(&self, handle: Handle) -> VmResult<u64> {
        self.with_object(handle, |obj| match obj.payload {
            ObjectPayload::Task(id) => Ok(id),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "handle does not hold a task object")),
        })
    }

    // --- raw memory arena (rt_alloc/rt_free/rt_memcpy/rt_memmove) ---

    pub fn rt_alloc(&self, size: u64, align: u64) -> Handle {
        let mut inner = self.inner.lock();
        let handle = Self::fresh_handle(&mut inner);
        inner.raw_arena.insert(handle.0, RawBlock { bytes: vec![0u8; size as usize], align });
        handle
    }

    pub fn rt_free(&self, handle: Handle) -> VmResult<()> {
        let mut inner = self.inner.lock();
        inner
            .raw_arena
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "rt_free on unknown raw handle"))
    }

    /// Grows or shrinks a block in place, zero-filling any newly added
    /// tail bytes and truncating on shrink; the handle identity never
    /// changes (spec §4.L `rt_realloc`).
    pub fn rt_realloc(&self, handle: Handle, new_size: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let block = inner
            .raw_arena
            .get_mut(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "rt_realloc on unknown raw handle"))?;
        block.bytes.resize(new_size as usize, 0);
        Ok(())
    }

    pub fn raw_size(&self, handle: Handle) -> VmResult<u64> {
        let inner = self.inner.lock();
        inner
            .raw_arena
            .get(&handle.0)
            .map(|b| b.bytes.len() as u64)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw handle"))
    }

    pub fn rt_memcpy(&self, dst: Handle, dst_off: u64, src: Handle, src_off: u64, len: u64) -> VmResult<()> {
        if dst == src {
            let inner = self.inner.lock();
            let block = inner
                .raw_arena
                .get(&dst.0)
                .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw handle"))?;
            let (a0, a1) = (dst_off, dst_off + len);
            let (b0, b1) = (src_off, src_off + len);
            let _ = &block.bytes;
            if a0 < b1 && b0 < a1 {
                return Err(VmError::new(
                    PanicKind::InvalidLocation,
                    "rt_memcpy overlapping ranges within the same handle",
                ));
            }
        }
        self.raw_copy(dst, dst_off, src, src_off, len)
    }

    pub fn rt_memmove(&self, dst: Handle, dst_off: u64, src: Handle, src_off: u64, len: u64) -> VmResult<()> {
        self.raw_copy(dst, dst_off, src, src_off, len)
    }

    fn raw_copy(&self, dst: Handle, dst_off: u64, src: Handle, src_off: u64, len: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let src_bytes = inner
            .raw_arena
            .get(&src.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw src handle"))?
            .bytes[src_off as usize..(src_off + len) as usize]
            .to_vec();
        let dst_block = inner
            .raw_arena
            .get_mut(&dst.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw dst handle"))?;
        if (dst_off + len) as usize > dst_block.bytes.len() {
            return Err(VmError::new(PanicKind::OutOfBounds, "raw copy exceeds destination block"));
        }
        dst_block.bytes[dst_off as usize..(dst_off + len) as usize].copy_from_slice(&src_bytes);
        Ok(())
    }

    pub fn raw_read(&self, handle: Handle, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        let inner = self.inner.lock();
        let block = inner
            .raw_arena
            .get(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw handle"))?;
        if (offset + len) as usize > block.bytes.len() {
            return Err(VmError::new(PanicKind::OutOfBounds, "raw read out of bounds"));
        }
        Ok(block.bytes[offset as usize..(offset + len) as usize].to_vec())
    }

    pub fn raw_write(&self, handle: Handle, offset: u64, data: &[u8]) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let block = inner
            .raw_arena
            .get_mut(&handle.0)
            .ok_or_else(|| VmError::new(PanicKind::InvalidHandle, "unknown raw handle"))?;
        if offset as usize + data.len() > block.bytes.len() {
            return Err(VmError::new(PanicKind::OutOfBounds, "raw write out of bounds"));
        }
        block.bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Count of live (non-freed) objects — used by the refcount
    /// conservation property test (spec §8).
    pub fn live_object_count(&self) -> usize {
        self.inner.lock().objects.values().filter(|o| !o.freed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TYPE_STRING;

    #[test]
    fn retain_release_round_trip_frees_at_zero() {
        let heap = Heap::new();
        let h = heap.alloc_string(TYPE_STRING, b"hi".to_vec());
        heap.retain(h).unwrap();
        assert_eq!(heap.live_object_count(), 1);
        heap.release(h).unwrap();
        assert_eq!(heap.live_object_count(), 1); // still refcount 1
        heap.release(h).unwrap();
        assert_eq!(heap.live_object_count(), 0);
        let err = heap.get(h).unwrap_err();
        assert_eq!(err.kind, PanicKind::RcUseAfterFree);
    }

    #[test]
    fn double_release_panics() {
        let heap = Heap::new();
        let h = heap.alloc_string(TYPE_STRING, b"hi".to_vec());
        heap.release(h).unwrap();
        let err = heap.release(h).unwrap_err();
        assert_eq!(err.kind, PanicKind::RcUseAfterFree);
    }

    #[test]
    fn invalid_handle_is_rejected() {
        let heap = Heap::new();
        let err = heap.get(Handle::INVALID).unwrap_err();
        assert_eq!(err.kind, PanicKind::InvalidHandle);
    }

    #[test]
    fn freeing_array_releases_contained_handles() {
        let heap = Heap::new();
        let inner_str = heap.alloc_string(TYPE_STRING, b"x".to_vec());
        let arr = heap.alloc(
            TYPE_STRING,
            ObjectPayload::Array(vec![Value::HandleString(inner_str, TYPE_STRING)]),
        );
        assert_eq!(heap.live_object_count(), 2);
        heap.release(arr).unwrap();
        assert_eq!(heap.live_object_count(), 0);
        assert_eq!(heap.get(inner_str).unwrap_err().kind, PanicKind::RcUseAfterFree);
    }

    #[test]
    fn memcpy_overlap_within_same_handle_panics() {
        let heap = Heap::new();
        let h = heap.rt_alloc(16, 1);
        let err = heap.rt_memcpy(h, 0, h, 4, 8).unwrap_err();
        assert_eq!(err.kind, PanicKind::InvalidLocation);
    }

    #[test]
    fn memmove_tolerates_overlap() {
        let heap = Heap::new();
        let h = heap.rt_alloc(16, 1);
        heap.raw_write(h, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        heap.rt_memmove(h, 4, h, 0, 8).unwrap();
        let out = heap.raw_read(h, 4, 8).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
