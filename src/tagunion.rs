// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Tag-case layout, `switch_tag` dispatch and `tag_payload` projection
//! (spec §4.F).

use smallvec::SmallVec;

use crate::error::{PanicKind, VmError, VmResult};
use crate::heap::{Heap, ObjectPayload};
use crate::layout::{TagLayout, TypeId, TypeInterner};
use crate::module::BlockId;
use crate::value::{Handle, Value};

/// Allocates a new `Tag` object for case `tag_name` with `fields`.
pub fn make_tag(
    heap: &Heap,
    interner: &TypeInterner,
    union_ty: TypeId,
    tag_name: &str,
    fields: Vec<Value>,
) -> VmResult<Handle> {
    let layout = interner.union_info(union_ty)?;
    let case = layout
        .case_by_name(tag_name)
        .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, format!("union has no case `{}`", tag_name)))?;
    if fields.len() != case.payload_types.len() {
        return Err(VmError::new(
            PanicKind::TagPayloadIndexOutOfRange,
            format!("case `{}` expects {} fields, got {}", tag_name, case.payload_types.len(), fields.len()),
        ));
    }
    let tag_sym = case.tag_sym;
    let fields: SmallVec<[Value; 2]> = fields.into();
    Ok(heap.alloc(union_ty, ObjectPayload::Tag { tag_sym, tag_name: tag_name.to_string(), fields }))
}

/// Assigning `Nothing` to a union-typed slot with a `nothing` case
/// auto-allocates a tag carrying that case's symbol (spec §4.F).
pub fn materialize_nothing(heap: &Heap, interner: &TypeInterner, union_ty: TypeId) -> VmResult<Option<Handle>> {
    let layout = interner.union_info(union_ty);
    let Ok(layout) = layout else { return Ok(None) };
    let Some(case) = layout.nothing_case() else { return Ok(None) };
    let tag_sym = case.tag_sym;
    let name = case.tag_name.clone();
    Ok(Some(heap.alloc(union_ty, ObjectPayload::Tag { tag_sym, tag_name: name, fields: SmallVec::new() })))
}

/// `switch_tag(value)`: picks the matching case's block, or the
/// default block, or panics `SwitchTagMissingDefault`.
pub fn switch_tag(
    heap: &Heap,
    value: &Value,
    cases: &[(String, BlockId)],
    default_bb: Option<BlockId>,
) -> VmResult<BlockId> {
    let handle = match value {
        Value::HandleTag(h, _) => *h,
        _ => return Err(VmError::new(PanicKind::SwitchTagOnNonTag, "switch_tag on a non-tag value")),
    };
    let tag_name = heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Tag { tag_name, .. } => Ok(tag_name.clone()),
        _ => Err(VmError::new(PanicKind::SwitchTagOnNonTag, "handle does not hold a tag object")),
    })?;
    for (name, bb) in cases {
        if *name == tag_name {
            return Ok(*bb);
        }
    }
    default_bb.ok_or_else(|| {
        VmError::new(
            PanicKind::SwitchTagMissingDefault,
            format!("no case matched `{}` and no default block", tag_name),
        )
    })
}

/// `tag_payload(value, tag_name, index)` (spec §4.F).
pub fn tag_payload(heap: &Heap, value: &Value, tag_name: &str, index: u32) -> VmResult<Value> {
    let handle = match value {
        Value::HandleTag(h, _) => *h,
        _ => return Err(VmError::new(PanicKind::TagPayloadOnNonTag, "tag_payload on a non-tag value")),
    };
    heap.with_object(handle, |obj| match &obj.payload {
        ObjectPayload::Tag { tag_name: actual, fields, .. } => {
            if actual != tag_name {
                return Err(VmError::new(
                    PanicKind::TagPayloadTagMismatch,
                    format!("value holds case `{}`, expected `{}`", actual, tag_name),
                ));
            }
            fields.get(index as usize).cloned().ok_or_else(|| {
                VmError::new(
                    PanicKind::TagPayloadIndexOutOfRange,
                    format!("case `{}` has no payload index {}", tag_name, index),
                )
            })
        }
        _ => Err(VmError::new(PanicKind::TagPayloadOnNonTag, "handle does not hold a tag object")),
    })
    .and_then(|v| heap.retain_value(v))
}

/// Retagging on reference-typed load: if the loaded value is a tag and
/// the expected type is a union the tag is a member of, the value's
/// type id is updated to the union's id (spec §4.D "Retagging").
/// Inputs that would require narrowing a tag to a union it is *not* a
/// member of are rejected with `TypeMismatch` (spec §9 open question).
pub fn retag_on_load(
    heap: &Heap,
    interner: &TypeInterner,
    mut value: Value,
    expected_type: TypeId,
) -> VmResult<Value> {
    let Value::HandleTag(handle, current_ty) = &value else {
        return Ok(value);
    };
    let expected_canonical = interner.value_type(expected_type)?;
    if *current_ty == expected_canonical {
        return Ok(value);
    }
    let Ok(layout) = interner.union_info(expected_canonical) else {
        return Ok(value);
    };
    let tag_name = heap.with_object(*handle, |obj| match &obj.payload {
        ObjectPayload::Tag { tag_name, .. } => Ok(tag_name.clone()),
        _ => Err(VmError::new(PanicKind::SwitchTagOnNonTag, "unreachable: HandleTag without Tag payload")),
    })?;
    if tag_layout_has_case(layout, &tag_name) {
        if let Value::HandleTag(_, ty) = &mut value {
            *ty = expected_canonical;
        }
        Ok(value)
    } else {
        Err(VmError::new(
            PanicKind::TypeMismatch,
            format!("tag case `{}` is not a member of the expected union", tag_name),
        ))
    }
}

fn tag_layout_has_case(layout: &TagLayout, name: &str) -> bool {
    layout.case_by_name(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{TagCase, TypeKind};

    fn option_union(interner: &mut TypeInterner) -> TypeId {
        let inner = crate::layout::TYPE_INT;
        let union_ty = interner.intern(TypeKind::Union(TagLayout::default()));
        interner.register_tag_layout(
            union_ty,
            TagLayout {
                cases: vec![
                    TagCase { tag_name: "Some".into(), tag_sym: 1, payload_types: vec![inner] },
                    TagCase { tag_name: "nothing".into(), tag_sym: 0, payload_types: vec![] },
                ],
                nullable: true,
            },
        );
        union_ty
    }

    #[test]
    fn tag_payload_round_trips() {
        let heap = Heap::new();
        let mut interner = TypeInterner::new();
        let union_ty = option_union(&mut interner);
        let h = make_tag(&heap, &interner, union_ty, "Some", vec![Value::Int(41, crate::layout::TYPE_INT)]).unwrap();
        let v = tag_payload(&heap, &Value::HandleTag(h, union_ty), "Some", 0).unwrap();
        assert_eq!(v, Value::Int(41, crate::layout::TYPE_INT));
    }

    #[test]
    fn switch_tag_selects_matching_case() {
        let heap = Heap::new();
        let mut interner = TypeInterner::new();
        let union_ty = option_union(&mut interner);
        let h = make_tag(&heap, &interner, union_ty, "nothing", vec![]).unwrap();
        let bb = switch_tag(
            &heap,
            &Value::HandleTag(h, union_ty),
            &[("Some".into(), BlockId(1)), ("nothing".into(), BlockId(2))],
            None,
        )
        .unwrap();
        assert_eq!(bb, BlockId(2));
    }

    #[test]
    fn switch_tag_without_default_panics() {
        let heap = Heap::new();
        let mut interner = TypeInterner::new();
        let union_ty = option_union(&mut interner);
        let h = make_tag(&heap, &interner, union_ty, "nothing", vec![]).unwrap();
        let err = switch_tag(&heap, &Value::HandleTag(h, union_ty), &[("Some".into(), BlockId(1))], None).unwrap_err();
        assert_eq!(err.kind, PanicKind::SwitchTagMissingDefault);
    }

    #[test]
    fn tag_payload_mismatch_panics() {
        let heap = Heap::new();
        let mut interner = TypeInterner::new();
        let union_ty = option_union(&mut interner);
        let h = make_tag(&heap, &interner, union_ty, "nothing", vec![]).unwrap();
        let err = tag_payload(&heap, &Value::HandleTag(h, union_ty), "Some", 0).unwrap_err();
        assert_eq!(err.kind, PanicKind::TagPayloadTagMismatch);
    }
}
