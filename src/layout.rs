// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Type interner and layout cache (spec §3 "Type identifier", §4.B).

use std::collections::HashMap;

use crate::error::{PanicKind, VmError, VmResult};

/// An interned, opaque type id. The core never interprets types
/// structurally except through `TypeInterner`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TypeId(pub u32);

pub const TYPE_NOTHING: TypeId = TypeId(0);
pub const TYPE_BOOL: TypeId = TypeId(1);
pub const TYPE_INT: TypeId = TypeId(2);
pub const TYPE_UINT: TypeId = TypeId(3);
pub const TYPE_FLOAT: TypeId = TypeId(4);
pub const TYPE_STRING: TypeId = TypeId(5);
/// Builtin type of a `Task` handle value returned by `Spawn` (spec
/// §4.I, §3 "Task values are refcount-shared handles").
pub const TYPE_TASK: TypeId = TypeId(6);
/// Builtin type of the opaque pointer `rt_alloc` hands back (spec
/// §4.A raw memory arena, §4.L `rt_alloc`/`rt_free`/`rt_memcpy`).
pub const TYPE_RAWPTR: TypeId = TypeId(7);

/// Bound on alias/own/reference/pointer unwrapping to break cycles
/// (spec §3).
const MAX_CANONICALIZE_STEPS: u32 = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
    Any,
}

impl Width {
    /// Bit width for masking/sign-extension; `Any` is pointer-sized
    /// (8 bytes on the x86-64 Linux default target, per spec §4.B).
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
            Width::Any => 64,
        }
    }

    pub fn mask(self) -> u64 {
        if self.bits() == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }
}

#[derive(Clone, Debug)]
pub enum TypeKind {
    Nothing,
    Bool,
    Int(Width),
    Uint(Width),
    Float(Width),
    String,
    Task,
    Alias(TypeId),
    Own(TypeId),
    Reference { target: TypeId, mutable: bool },
    Pointer(TypeId),
    Struct(StructInfo),
    Tuple(Vec<TypeId>),
    Union(TagLayout),
    Map { key: TypeId, value: TypeId },
    Array(TypeId),
    ArrayFixed { elem: TypeId, count: u64 },
    Fn { params: Vec<TypeId>, ret: TypeId },
}

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    pub kind: TypeKind,
}

#[derive(Clone, Debug)]
pub struct StructInfo {
    pub fields: Vec<(String, TypeId)>,
}

impl StructInfo {
    pub fn index_by_name(&self, name: &str) -> Option<u32> {
        self.fields.iter().position(|(n, _)| n == name).map(|i| i as u32)
    }
}

#[derive(Clone, Debug)]
pub struct TagCase {
    pub tag_name: String,
    pub tag_sym: u32,
    pub payload_types: Vec<TypeId>,
}

#[derive(Clone, Debug, Default)]
pub struct TagLayout {
    pub cases: Vec<TagCase>,
    pub nullable: bool,
}

impl TagLayout {
    pub fn case_by_name(&self, name: &str) -> Option<&TagCase> {
        self.cases.iter().find(|c| c.tag_name == name)
    }

    pub fn case_by_sym(&self, sym: u32) -> Option<&TagCase> {
        self.cases.iter().find(|c| c.tag_sym == sym)
    }

    pub fn nothing_case(&self) -> Option<&TagCase> {
        if self.nullable {
            self.case_by_name("nothing")
        } else {
            None
        }
    }
}

/// Read-only, append-only table of type descriptors produced by the
/// front end and consumed verbatim (spec: "the core never interprets
/// types structurally except through a read-only type interner").
#[derive(Default)]
pub struct TypeInterner {
    types: Vec<TypeDescriptor>,
    struct_layouts: HashMap<TypeId, StructInfo>,
    tag_layouts: HashMap<TypeId, TagLayout>,
}

impl TypeInterner {
    pub fn new() -> Self {
        let mut me = Self::default();
        me.types.push(TypeDescriptor { kind: TypeKind::Nothing }); // TYPE_NOTHING
        me.types.push(TypeDescriptor { kind: TypeKind::Bool }); // TYPE_BOOL
        me.types.push(TypeDescriptor { kind: TypeKind::Int(Width::W64) }); // TYPE_INT
        me.types.push(TypeDescriptor { kind: TypeKind::Uint(Width::W64) }); // TYPE_UINT
        me.types.push(TypeDescriptor { kind: TypeKind::Float(Width::W64) }); // TYPE_FLOAT
        me.types.push(TypeDescriptor { kind: TypeKind::String }); // TYPE_STRING
        me.types.push(TypeDescriptor { kind: TypeKind::Task }); // TYPE_TASK
        me.types.push(TypeDescriptor { kind: TypeKind::Pointer(TYPE_NOTHING) }); // TYPE_RAWPTR
        me
    }

    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDescriptor { kind });
        id
    }

    pub fn register_struct_layout(&mut self, id: TypeId, info: StructInfo) {
        self.struct_layouts.insert(id, info);
    }

    pub fn register_tag_layout(&mut self, id: TypeId, layout: TagLayout) {
        self.tag_layouts.insert(id, layout);
    }

    pub fn lookup(&self, id: TypeId) -> VmResult<&TypeDescriptor> {
        self.types
            .get(id.0 as usize)
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, format!("unknown type id {:?}", id)))
    }

    pub fn alias_target(&self, id: TypeId) -> Option<TypeId> {
        match self.lookup(id).ok()?.kind {
            TypeKind::Alias(t) => Some(t),
            _ => None,
        }
    }

    pub fn struct_info(&self, id: TypeId) -> VmResult<&StructInfo> {
        self.struct_layouts
            .get(&id)
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "not a struct type"))
    }

    pub fn tuple_info(&self, id: TypeId) -> VmResult<&[TypeId]> {
        match &self.lookup(id)?.kind {
            TypeKind::Tuple(elems) => Ok(elems),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "not a tuple type")),
        }
    }

    pub fn union_info(&self, id: TypeId) -> VmResult<&TagLayout> {
        self.tag_layouts
            .get(&id)
            .ok_or_else(|| VmError::new(PanicKind::UnknownTagLayout, "no tag layout registered for union"))
    }

    pub fn map_info(&self, id: TypeId) -> VmResult<(TypeId, TypeId)> {
        match self.lookup(id)?.kind {
            TypeKind::Map { key, value } => Ok((key, value)),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "not a map type")),
        }
    }

    pub fn fn_info(&self, id: TypeId) -> VmResult<(&[TypeId], TypeId)> {
        match &self.lookup(id)?.kind {
            TypeKind::Fn { params, ret } => Ok((params, *ret)),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "not a function type")),
        }
    }

    pub fn array_info(&self, id: TypeId) -> VmResult<TypeId> {
        match self.lookup(id)?.kind {
            TypeKind::Array(elem) => Ok(elem),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "not an array type")),
        }
    }

    pub fn array_fixed_info(&self, id: TypeId) -> VmResult<(TypeId, u64)> {
        match self.lookup(id)?.kind {
            TypeKind::ArrayFixed { elem, count } => Ok((elem, count)),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "not a fixed array type")),
        }
    }

    /// Canonicalize a type by unwrapping `Alias`, `Own`, `Reference`,
    /// `Pointer` layers, bounded by `MAX_CANONICALIZE_STEPS` to break
    /// cycles (spec §3).
    pub fn value_type(&self, mut id: TypeId) -> VmResult<TypeId> {
        for _ in 0..MAX_CANONICALIZE_STEPS {
            let desc = self.lookup(id)?;
            match desc.kind {
                TypeKind::Alias(t) | TypeKind::Own(t) | TypeKind::Pointer(t) => id = t,
                TypeKind::Reference { target, .. } => id = target,
                _ => return Ok(id),
            }
        }
        Err(VmError::new(
            PanicKind::TypeMismatch,
            "type canonicalization exceeded the cycle-breaking bound",
        ))
    }

    /// `HeirTest`: additionally walks alias targets and struct base
    /// chains and checks union membership (spec §4.D).
    pub fn heir_of(&self, value_ty: TypeId, target: TypeId) -> VmResult<bool> {
        let canonical_value = self.value_type(value_ty)?;
        let canonical_target = self.value_type(target)?;
        if canonical_value == canonical_target {
            return Ok(true);
        }
        // A tag/variant value "heirs" its union type when the union's
        // tag layout lists a case whose payload matches the variant.
        if let Ok(layout) = self.union_info(canonical_target) {
            if layout.cases.iter().any(|c| {
                c.payload_types.len() == 1 && self.value_type(c.payload_types[0]).ok() == Some(canonical_value)
            }) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Recursive payload-type compatibility across monomorphization
    /// (spec §4.F): arrays same elem; tuples same arity and children;
    /// tagged unions same case names and payload types.
    pub fn payload_types_compatible(&self, a: TypeId, b: TypeId) -> VmResult<bool> {
        let a = self.value_type(a)?;
        let b = self.value_type(b)?;
        if a == b {
            return Ok(true);
        }
        let (ka, kb) = (&self.lookup(a)?.kind, &self.lookup(b)?.kind);
        match (ka, kb) {
            (TypeKind::Array(ea), TypeKind::Array(eb)) => self.payload_types_compatible(*ea, *eb),
            (TypeKind::Tuple(ta), TypeKind::Tuple(tb)) => {
                if ta.len() != tb.len() {
                    return Ok(false);
                }
                for (x, y) in ta.iter().zip(tb.iter()) {
                    if !self.payload_types_compatible(*x, *y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (TypeKind::Union(la), TypeKind::Union(lb)) => {
                if la.cases.len() != lb.cases.len() {
                    return Ok(false);
                }
                for ca in &la.cases {
                    let Some(cb) = lb.case_by_name(&ca.tag_name) else {
                        return Ok(false);
                    };
                    if ca.payload_types.len() != cb.payload_types.len() {
                        return Ok(false);
                    }
                    for (x, y) in ca.payload_types.iter().zip(cb.payload_types.iter()) {
                        if !self.payload_types_compatible(*x, *y)? {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
