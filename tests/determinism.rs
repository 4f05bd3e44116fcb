// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Scenario 6 (spec §8): a program spawning several tasks produces the
//! same task completion order across independent runs in deterministic
//! mode, and equal seeds in the seeded multi-threaded scheduler produce
//! equal `SCHED_TRACE` hashes.

use surge_vm::layout::{TypeInterner, TYPE_BOOL, TYPE_INT, TYPE_TASK};
use surge_vm::module::{BasicBlock, BlockId, Func, FuncSym, Instr, LocalDecl, Module, Operand, Place, RValue, Terminator};
use surge_vm::runtime::TestRuntime;
use surge_vm::vm::{SchedulerMode, Vm, VmConfig};

fn const_int(v: i64) -> Operand {
    Operand::Const(surge_vm::module::ConstValue::Int(v, TYPE_INT))
}

/// `__surge_start` spawns `n` children, then `JoinAll`s the whole scope
/// before returning the number of children (as a smoke value).
fn fan_out_and_join_module(n: i64) -> (Module, TypeInterner) {
    let types = TypeInterner::new();
    let mut module = Module::new();
    module.add_func(Func {
        sym: FuncSym(1),
        name: "child".into(),
        params: vec![],
        locals: vec![],
        blocks: vec![BasicBlock { id: BlockId(0), instrs: vec![], terminator: Terminator::Return(Some(const_int(1))) }],
        entry: BlockId(0),
    });

    let mut locals = Vec::new();
    let mut instrs = Vec::new();
    for i in 0..n {
        locals.push(LocalDecl { name: format!("t{i}"), type_id: TYPE_TASK, span: Default::default() });
        instrs.push(Instr::Spawn { poll_fn: FuncSym(1), args: vec![], dst: Place::local(i as u32) });
    }
    locals.push(LocalDecl { name: "scope".into(), type_id: TYPE_TASK, span: Default::default() });
    locals.push(LocalDecl { name: "any_cancelled".into(), type_id: TYPE_BOOL, span: Default::default() });
    let scope_local = n as u32;
    let result_local = scope_local + 1;

    instrs.push(Instr::Assign(
        Place::local(scope_local),
        RValue::MakeArray(TYPE_TASK, (0..n).map(|i| Operand::Move(Place::local(i as u32))).collect()),
    ));

    module.add_func(Func {
        sym: FuncSym(0),
        name: "__surge_start".into(),
        params: vec![],
        locals,
        blocks: vec![
            BasicBlock { id: BlockId(0), instrs, terminator: Terminator::Goto(BlockId(1)) },
            BasicBlock {
                id: BlockId(1),
                instrs: vec![Instr::JoinAll {
                    scope: Operand::Move(Place::local(scope_local)),
                    ready_bb: BlockId(2),
                    pend_bb: BlockId(1),
                    dst: Place::local(result_local),
                }],
                terminator: Terminator::Unreachable,
            },
            BasicBlock { id: BlockId(2), instrs: vec![], terminator: Terminator::Return(Some(const_int(n))) },
        ],
        entry: BlockId(0),
    });
    (module, types)
}

#[test]
fn deterministic_mode_same_program_produces_the_same_trace_twice() {
    let (module_a, types_a) = fan_out_and_join_module(5);
    let mut vm_a = Vm::new(module_a, types_a, Box::new(TestRuntime::new(vec![], vec![])), VmConfig::default());
    let exit_a = vm_a.run().unwrap();
    let trace_a = vm_a.scheduler_trace();

    let (module_b, types_b) = fan_out_and_join_module(5);
    let mut vm_b = Vm::new(module_b, types_b, Box::new(TestRuntime::new(vec![], vec![])), VmConfig::default());
    let exit_b = vm_b.run().unwrap();
    let trace_b = vm_b.scheduler_trace();

    assert_eq!(exit_a, 5);
    assert_eq!(exit_a, exit_b);
    assert_eq!(trace_a, trace_b, "identical deterministic-mode runs must produce identical schedule traces");
}

#[test]
fn seeded_multithreaded_scheduler_same_seed_same_trace_hash() {
    let seeded_config = |seed: u64| VmConfig {
        threads: 4,
        scheduler_mode: SchedulerMode::Seeded,
        scheduler_seed: seed,
        ..VmConfig::default()
    };

    let (module_a, types_a) = fan_out_and_join_module(8);
    let mut vm_a = Vm::new(module_a, types_a, Box::new(TestRuntime::new(vec![], vec![])), seeded_config(42));
    assert_eq!(vm_a.run().unwrap(), 8);
    let trace_a = vm_a.scheduler_trace();

    let (module_b, types_b) = fan_out_and_join_module(8);
    let mut vm_b = Vm::new(module_b, types_b, Box::new(TestRuntime::new(vec![], vec![])), seeded_config(42));
    assert_eq!(vm_b.run().unwrap(), 8);
    let trace_b = vm_b.scheduler_trace();

    assert_eq!(trace_a, trace_b, "equal seeds must reproduce an identical SCHED_TRACE hash");

    let (module_c, types_c) = fan_out_and_join_module(8);
    let mut vm_c = Vm::new(module_c, types_c, Box::new(TestRuntime::new(vec![], vec![])), seeded_config(7));
    assert_eq!(vm_c.run().unwrap(), 8);
    assert_ne!(vm_c.scheduler_trace(), trace_a, "a different seed is not required to collide");
}
