// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Whole-program refcount conservation (spec §8 universal invariant:
//! "sum(Retain) - sum(Release) over reachable objects equals the count
//! of handles held by live locals/globals at exit"). These run a real
//! `__surge_start` through `Vm::run()` and check the heap is fully
//! drained afterwards, complementing `heap.rs`'s unit-level alloc/
//! retain/release tests with an end-to-end check that cascading
//! release through arrays, structs and strings actually balances out.

use surge_vm::layout::{StructInfo, TypeInterner, TypeKind, TYPE_INT, TYPE_STRING};
use surge_vm::module::{BasicBlock, BlockId, ConstValue, Func, FuncSym, Instr, LocalDecl, Module, Operand, Place, RValue, Terminator};
use surge_vm::runtime::TestRuntime;
use surge_vm::vm::{Vm, VmConfig};

fn local(name: &str, ty: surge_vm::layout::TypeId) -> LocalDecl {
    LocalDecl { name: name.into(), type_id: ty, span: Default::default() }
}

fn start_with(locals: Vec<LocalDecl>, instrs: Vec<Instr>) -> Module {
    let mut module = Module::new();
    module.add_func(Func {
        sym: FuncSym(0),
        name: "__surge_start".into(),
        params: vec![],
        locals,
        blocks: vec![BasicBlock {
            id: BlockId(0),
            instrs,
            terminator: Terminator::Return(Some(Operand::Const(ConstValue::Int(0, TYPE_INT)))),
        }],
        entry: BlockId(0),
    });
    module
}

fn run(module: Module, types: TypeInterner) -> Vm {
    let runtime = Box::new(TestRuntime::new(vec![], vec![]));
    let mut vm = Vm::new(module, types, runtime, VmConfig::default());
    assert_eq!(vm.run().unwrap(), 0);
    vm
}

#[test]
fn a_string_dropped_at_return_leaves_no_live_objects() {
    let types = TypeInterner::new();
    let module = start_with(
        vec![local("s", TYPE_STRING)],
        vec![Instr::Assign(Place::local(0), RValue::Use(Operand::Const(ConstValue::Str("hi".into()))))],
    );
    let vm = run(module, types);
    assert_eq!(vm.heap().live_object_count(), 0);
}

#[test]
fn an_array_that_retains_a_copied_string_releases_both_on_return() {
    let mut types = TypeInterner::new();
    let array_ty = types.intern(TypeKind::Array(TYPE_STRING));
    let module = start_with(
        vec![local("s", TYPE_STRING), local("arr", array_ty)],
        vec![
            Instr::Assign(Place::local(0), RValue::Use(Operand::Const(ConstValue::Str("a".into())))),
            Instr::Assign(Place::local(1), RValue::MakeArray(array_ty, vec![Operand::Copy(Place::local(0))])),
        ],
    );
    let vm = run(module, types);
    // `arr` holds a retained copy of `s`'s handle (refcount 2 while both
    // locals are alive); dropping both locals at the end of the frame
    // must release the array, which in turn releases its element.
    assert_eq!(vm.heap().live_object_count(), 0);
}

#[test]
fn a_struct_holding_an_array_of_strings_cascades_release_through_three_levels() {
    let mut types = TypeInterner::new();
    let array_ty = types.intern(TypeKind::Array(TYPE_STRING));
    let struct_ty = types.intern(TypeKind::Struct(StructInfo { fields: vec![] }));
    types.register_struct_layout(struct_ty, StructInfo { fields: vec![("items".into(), array_ty)] });
    let module = start_with(
        vec![local("s0", TYPE_STRING), local("s1", TYPE_STRING), local("arr", array_ty), local("wrapper", struct_ty)],
        vec![
            Instr::Assign(Place::local(0), RValue::Use(Operand::Const(ConstValue::Str("a".into())))),
            Instr::Assign(Place::local(1), RValue::Use(Operand::Const(ConstValue::Str("b".into())))),
            Instr::Assign(
                Place::local(2),
                RValue::MakeArray(array_ty, vec![Operand::Copy(Place::local(0)), Operand::Copy(Place::local(1))]),
            ),
            Instr::Assign(Place::local(3), RValue::MakeStruct(struct_ty, vec![Operand::Copy(Place::local(2))])),
        ],
    );
    let vm = run(module, types);
    assert_eq!(vm.heap().live_object_count(), 0);
}

#[test]
fn an_explicit_drop_releases_before_the_frame_unwinds() {
    let types = TypeInterner::new();
    let module = start_with(
        vec![local("s", TYPE_STRING)],
        vec![
            Instr::Assign(Place::local(0), RValue::Use(Operand::Const(ConstValue::Str("hi".into())))),
            Instr::Drop(Place::local(0)),
        ],
    );
    let vm = run(module, types);
    assert_eq!(vm.heap().live_object_count(), 0);
}
