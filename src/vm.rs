// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Top-level VM wiring: config, the `__surge_start` startup contract,
//! the closed intrinsic dispatch table, the task table that drives the
//! async executor (§4.I), and the main scheduler loop tying the
//! dispatcher (§4.H) to the heap, frames, and host runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::async_exec::{AsyncExecutor, SchedConfig, SchedMode, TaskId, WakerKey};
use crate::collections;
use crate::dispatch::{self, AsyncRequest, CallTarget, StepEffect, TermEffect};
use crate::error::{PanicKind, VmError, VmResult};
use crate::frame::{Frame, GlobalSlot, LocalSlot, Stack};
use crate::heap::Heap;
use crate::layout::{TagCase, TagLayout, TypeId, TypeInterner, TypeKind, TYPE_BOOL, TYPE_INT, TYPE_RAWPTR, TYPE_STRING, TYPE_TASK};
use crate::module::{FuncSym, Module, Place};
use crate::place::EvalContext;
use crate::replay::{Recorder, Replayer};
use crate::runtime::Runtime;
use crate::tagunion;
use crate::value::{Handle, Location, PlaceRef, Value};

/// Immutable for the run, shared the way the teacher shares
/// `Arc<Context>` across every task (spec §10.3).
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub threads: u32,
    pub timer_mode: TimerMode,
    pub scheduler_mode: SchedulerMode,
    pub scheduler_seed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    Deterministic,
    Real,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerMode {
    Default,
    Seeded,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { threads: 1, timer_mode: TimerMode::Deterministic, scheduler_mode: SchedulerMode::Default, scheduler_seed: 0 }
    }
}

impl VmConfig {
    pub fn from_env() -> Self {
        let mut cfg = VmConfig::default();
        if let Ok(v) = std::env::var("SURGE_THREADS") {
            if let Ok(n) = v.parse() {
                cfg.threads = n;
            }
        }
        if let Ok(v) = std::env::var("SURGE_TIMER_MODE") {
            cfg.timer_mode = if v == "real" { TimerMode::Real } else { TimerMode::Deterministic };
        }
        if let Ok(v) = std::env::var("SURGE_SCHED_MODE") {
            cfg.scheduler_mode = if v == "seeded" { SchedulerMode::Seeded } else { SchedulerMode::Default };
        }
        if let Ok(v) = std::env::var("SURGE_SCHED_SEED") {
            if let Ok(n) = v.parse() {
                cfg.scheduler_seed = n;
            }
        }
        cfg
    }

    fn sched_config(&self) -> SchedConfig {
        SchedConfig {
            mode: match self.scheduler_mode {
                SchedulerMode::Default => SchedMode::Deterministic,
                SchedulerMode::Seeded => SchedMode::Seeded,
            },
            workers: self.threads,
            seed: self.scheduler_seed,
            real_timers: self.timer_mode == TimerMode::Real,
        }
    }
}

/// The outcome a completed task carries (spec GLOSSARY "Poll outcome":
/// `DoneSuccess(Value)` / `DoneCancelled`).
#[derive(Clone, Debug)]
enum TaskResult {
    Success(Option<Value>),
    Cancelled,
}

/// Bookkeeping for `Timeout`'s internal watcher task (spec §4.I): it
/// owns no MIR frames, only a race between a timer and its target.
#[derive(Clone, Copy, Debug)]
struct TimeoutState {
    target: TaskId,
    result_type: TypeId,
}

/// Per-task call stack plus the scheduling-adjacent bits `vm.rs` (not
/// `async_exec.rs`) is responsible for, per the module's own doc
/// comment: "`vm.rs` owns the actual `Frame` for each task".
struct TaskRecord {
    stack: Stack,
    call_dsts: Vec<Option<Place>>,
    cancelled: bool,
    done: bool,
    result: Option<TaskResult>,
    timeout: Option<TimeoutState>,
}

impl TaskRecord {
    fn for_call(stack: Stack) -> Self {
        TaskRecord { stack, call_dsts: vec![None], cancelled: false, done: false, result: None, timeout: None }
    }

    fn watcher(timeout: TimeoutState) -> Self {
        TaskRecord {
            stack: Stack::default(),
            call_dsts: Vec::new(),
            cancelled: false,
            done: false,
            result: None,
            timeout: Some(timeout),
        }
    }
}

/// What one trip around `run_task_step` produced.
enum TaskLoopOutcome {
    KeepGoing,
    Exit(i32),
}

/// Outcome of executing a single instruction/terminator of a task's
/// top frame.
enum StepOutcome {
    Continue,
    Parked,
    Exit(i32),
    Finished(Option<Value>),
}

pub struct Vm {
    config: Arc<VmConfig>,
    module: Module,
    types: TypeInterner,
    heap: Heap,
    globals: Vec<GlobalSlot>,
    runtime: Box<dyn Runtime>,
    scheduler: AsyncExecutor,
    tasks: HashMap<TaskId, TaskRecord>,
    main_task: Option<TaskId>,
    /// Watchers (`Timeout` internals) keyed by the *target* task they
    /// race against; woken directly when the target completes first
    /// (spec §4.I "Timeout ... cancels the target").
    watchers_by_target: HashMap<TaskId, Vec<TaskId>>,
    next_timer_id: u64,
    /// `Success(T) | Cancelled` union, synthesized once per inner type
    /// and cached (spec §4.I "awaited results encode `Cancelled()` as
    /// a tag").
    outcome_unions: HashMap<TypeId, TypeId>,
    recorder: Option<Recorder>,
    replayer: Option<Replayer>,
}

impl Vm {
    pub fn new(module: Module, types: TypeInterner, runtime: Box<dyn Runtime>, config: VmConfig) -> Self {
        let scheduler = AsyncExecutor::new(config.sched_config());
        Vm {
            config: Arc::new(config),
            module,
            types,
            heap: Heap::new(),
            globals: Vec::new(),
            runtime,
            scheduler,
            tasks: HashMap::new(),
            main_task: None,
            watchers_by_target: HashMap::new(),
            next_timer_id: 1,
            outcome_unions: HashMap::new(),
            recorder: None,
            replayer: None,
        }
    }

    pub fn with_recorder(mut self, module_hash: u64) -> Self {
        self.recorder = Some(Recorder::new(module_hash));
        self
    }

    pub fn with_replayer(mut self, replayer: Replayer) -> Self {
        self.replayer = Some(replayer);
        self
    }

    pub fn into_replay_log(mut self) -> VmResult<Option<String>> {
        match self.recorder.take() {
            Some(rec) => Ok(Some(rec.into_log()?)),
            None => Ok(None),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Exposes the run's heap so callers (and the refcount-conservation
    /// property test, spec §8) can inspect live object counts after
    /// `run()` returns.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// `SCHED_TRACE ...` line for the seeded multi-threaded scheduler
    /// (spec §4.I, §5 "equal seeds yield identical trace hashes").
    pub fn scheduler_trace(&self) -> String {
        self.scheduler.trace_summary()
    }

    /// Runs `__surge_start` to completion. If the entrypoint is
    /// missing, the VM halts with a clean exit (spec §6 "Startup
    /// contract").
    pub fn run(&mut self) -> VmResult<i32> {
        let result = self.run_inner();
        if let Err(err) = &result {
            tracing::error!(code = err.kind.code(), "{}", err.message);
        }
        result
    }

    fn run_inner(&mut self) -> VmResult<i32> {
        tracing::debug!("Started __surge_start");
        let Some(entry) = self.module.func_by_name("__surge_start") else {
            return Ok(0);
        };
        let sym = entry.sym;
        let stack = self.build_call_stack(sym, Vec::new())?;
        let main_id = self.scheduler.spawn();
        self.tasks.insert(main_id, TaskRecord::for_call(stack));
        self.main_task = Some(main_id);

        loop {
            match self.scheduler.next_scheduled() {
                crate::async_exec::Scheduled::Task(id) => match self.run_task_step(id)? {
                    TaskLoopOutcome::Exit(code) => {
                        if let Some(rec) = &mut self.recorder {
                            rec.record_exit(code);
                        }
                        if let Some(replayer) = &mut self.replayer {
                            replayer.expect_exit(code)?;
                        }
                        return Ok(code);
                    }
                    TaskLoopOutcome::KeepGoing => {
                        if Some(id) == self.main_task && self.tasks.get(&id).is_some_and(|t| t.done) {
                            let code = self.main_exit_code(id);
                            if let Some(rec) = &mut self.recorder {
                                rec.record_exit(code);
                            }
                            if let Some(replayer) = &mut self.replayer {
                                replayer.expect_exit(code)?;
                            }
                            return Ok(code);
                        }
                    }
                },
                crate::async_exec::Scheduled::Idle => {
                    // Nothing ready and nothing parked: the only way to
                    // reach here is if the main task never terminated
                    // normally (e.g. it spawned children and exited via
                    // `rt_exit` already handled above), which is a
                    // logic error in this loop rather than a guest panic.
                    return Err(VmError::new(PanicKind::Unimplemented, "scheduler went idle before the main task finished"));
                }
                crate::async_exec::Scheduled::Deadlocked => {
                    return Err(VmError::new(
                        PanicKind::Unimplemented,
                        "deadlock: every task is parked and no waker can ever fire",
                    ));
                }
            }
        }
    }

    fn main_exit_code(&self, id: TaskId) -> i32 {
        match self.tasks.get(&id).and_then(|t| t.result.as_ref()) {
            Some(TaskResult::Success(Some(Value::Int(i, _)))) => *i as i32,
            _ => 0,
        }
    }

    fn build_call_stack(&mut self, sym: FuncSym, args: Vec<Value>) -> VmResult<Stack> {
        let func = self
            .module
            .func(sym)
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, format!("unknown function symbol {:?}", sym)))?;
        let decls = func.all_local_decls();
        if args.len() > decls.len() {
            return Err(VmError::new(PanicKind::TypeMismatch, "more arguments than declared locals"));
        }
        let mut locals: Vec<LocalSlot> = decls.iter().map(|d| LocalSlot::empty(d.name.clone(), d.type_id)).collect();
        for (i, arg) in args.into_iter().enumerate() {
            locals[i].value = arg;
            locals[i].is_init = true;
        }
        let frame = Frame::new(sym.0, func.entry.0, locals);
        let mut stack = Stack::default();
        stack.push(frame);
        Ok(stack)
    }

    /// Runs a scheduled task until it parks, finishes, or the whole
    /// program exits — a task "runs until its poll returns `Parked` or
    /// `Done*`" (spec §4.I, §5 "Instructions never preempt mid-step").
    fn run_task_step(&mut self, id: TaskId) -> VmResult<TaskLoopOutcome> {
        loop {
            let rec = self.tasks.get(&id).expect("scheduled task has a record");
            if rec.done {
                return Ok(TaskLoopOutcome::KeepGoing);
            }
            if rec.cancelled {
                self.finish_task(id, TaskResult::Cancelled)?;
                return Ok(TaskLoopOutcome::KeepGoing);
            }
            if rec.stack.is_empty() {
                if let Some(ts) = rec.timeout {
                    self.resolve_timeout_watcher(id, ts)?;
                } else {
                    self.finish_task(id, TaskResult::Success(None))?;
                }
                return Ok(TaskLoopOutcome::KeepGoing);
            }
            match self.step_task(id)? {
                StepOutcome::Continue => continue,
                StepOutcome::Parked => return Ok(TaskLoopOutcome::KeepGoing),
                StepOutcome::Exit(code) => return Ok(TaskLoopOutcome::Exit(code)),
                StepOutcome::Finished(value) => {
                    self.finish_task(id, TaskResult::Success(value))?;
                    return Ok(TaskLoopOutcome::KeepGoing);
                }
            }
        }
    }

    /// Executes exactly one instruction or terminator of task `id`'s
    /// top frame (spec §4.H "`Step` processes exactly one instruction
    /// or one terminator of the top frame").
    fn step_task(&mut self, id: TaskId) -> VmResult<StepOutcome> {
        let _scope = crate::metrics::scope("Vm::step");
        let (func_sym, block, ip) = {
            let rec = self.tasks.get(&id).unwrap();
            let frame = rec.stack.top().ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "step with an empty call stack"))?;
            (FuncSym(frame.func_sym), frame.block, frame.ip)
        };
        tracing::trace!(task = id.0, func = func_sym.0, block, ip, "step");
        let func = self
            .module
            .func(func_sym)
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "current frame's function vanished from the module"))?;
        let block_id = crate::module::BlockId(block);
        let bb = func
            .block(block_id)
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, format!("unknown block {:?}", block_id)))?;

        if let Some(instr) = bb.instrs.get(ip as usize).cloned() {
            let mut ctx = eval_ctx(&self.heap, &self.types, &mut self.globals);
            let rec = self.tasks.get_mut(&id).unwrap();
            let frame = rec.stack.top_mut().unwrap();
            let effect = dispatch::exec_instr(&mut ctx, frame, &instr)?;
            match effect {
                StepEffect::Continue => {
                    self.tasks.get_mut(&id).unwrap().stack.top_mut().unwrap().ip += 1;
                    Ok(StepOutcome::Continue)
                }
                StepEffect::Call { target, args, dst } => {
                    self.tasks.get_mut(&id).unwrap().stack.top_mut().unwrap().ip += 1;
                    match target {
                        CallTarget::Symbol(sym) => {
                            let mut call_stack = self.build_call_stack(sym, args)?;
                            let callee_frame = call_stack.pop().expect("build_call_stack always pushes one frame");
                            let rec = self.tasks.get_mut(&id).unwrap();
                            rec.stack.push(callee_frame);
                            rec.call_dsts.push(dst);
                            Ok(StepOutcome::Continue)
                        }
                        CallTarget::Intrinsic(name) => self.dispatch_intrinsic(id, &name, args, dst),
                    }
                }
                StepEffect::Async(req) => self.handle_async_request(id, req),
            }
        } else {
            let terminator = bb.terminator.clone();
            let mut ctx = eval_ctx(&self.heap, &self.types, &mut self.globals);
            let rec = self.tasks.get_mut(&id).unwrap();
            let frame = rec.stack.top_mut().unwrap();
            let effect = dispatch::exec_terminator(&mut ctx, frame, &terminator)?;
            match effect {
                TermEffect::Goto(bb_id) => {
                    let frame = self.tasks.get_mut(&id).unwrap().stack.top_mut().unwrap();
                    frame.block = bb_id.0;
                    frame.ip = 0;
                    Ok(StepOutcome::Continue)
                }
                TermEffect::Return(value) => {
                    self.tasks.get_mut(&id).unwrap().stack.pop();
                    let dst = self.tasks.get_mut(&id).unwrap().call_dsts.pop().flatten();
                    let stack_empty = self.tasks.get(&id).unwrap().stack.is_empty();
                    if stack_empty {
                        return Ok(StepOutcome::Finished(value));
                    }
                    if let Some(dst) = dst {
                        let value = value.unwrap_or(Value::Nothing);
                        let mut ctx = eval_ctx(&self.heap, &self.types, &mut self.globals);
                        let rec = self.tasks.get_mut(&id).unwrap();
                        let frame = rec.stack.top_mut().unwrap();
                        let resolved = ctx.eval_place(frame, &dst)?;
                        ctx.store(frame, &resolved, value)?;
                    } else if let Some(v) = value {
                        self.heap.release_value(&v)?;
                    }
                    Ok(StepOutcome::Continue)
                }
            }
        }
    }

    // --- async instruction handling (spec §4.I) ---

    fn handle_async_request(&mut self, id: TaskId, req: AsyncRequest) -> VmResult<StepOutcome> {
        match req {
            AsyncRequest::Spawn { poll_fn, args, dst } => {
                let child_stack = self.build_call_stack(poll_fn, args)?;
                let child_id = self.scheduler.spawn();
                self.tasks.insert(child_id, TaskRecord::for_call(child_stack));
                let handle = self.heap.alloc_task(TYPE_TASK, child_id.0);
                self.store_into(id, &dst, Value::HandleTask(handle, TYPE_TASK))?;
                self.advance_ip(id);
                Ok(StepOutcome::Continue)
            }
            AsyncRequest::Await { task, dst } => {
                let target = self.task_id_of(&task)?;
                self.heap.release_value(&task)?;
                if self.tasks.get(&target).is_some_and(|t| t.done) {
                    let result = self.take_result(target)?;
                    let outcome_ty = self.awaited_outcome_type(dst_hint_type(&dst))?;
                    let wrapped = self.wrap_outcome(result, outcome_ty)?;
                    self.store_into(id, &dst, wrapped)?;
                    self.advance_ip(id);
                    Ok(StepOutcome::Continue)
                } else {
                    // No `pend_bb` exists for `Await` (spec §4.H Instr
                    // list): re-parking leaves `ip` unmoved so the same
                    // instruction re-evaluates once the target wakes us.
                    self.scheduler.park(id, WakerKey::Join(target.0));
                    Ok(StepOutcome::Parked)
                }
            }
            AsyncRequest::Poll { task, ready_bb, pend_bb, dst } => {
                let target = self.task_id_of(&task)?;
                self.heap.release_value(&task)?;
                if self.tasks.get(&target).is_some_and(|t| t.done) {
                    let result = self.take_result(target)?;
                    let outcome_ty = self.awaited_outcome_type(dst_hint_type(&dst))?;
                    let wrapped = self.wrap_outcome(result, outcome_ty)?;
                    self.store_into(id, &dst, wrapped)?;
                    self.goto(id, ready_bb);
                    Ok(StepOutcome::Continue)
                } else {
                    self.goto(id, pend_bb);
                    self.scheduler.park(id, WakerKey::Join(target.0));
                    Ok(StepOutcome::Parked)
                }
            }
            AsyncRequest::JoinAll { scope, ready_bb, pend_bb, dst } => {
                let children = self.scope_task_ids(&scope)?;
                self.heap.release_value(&scope)?;
                let mut all_done = true;
                let mut any_cancelled = false;
                let mut first_unfinished = None;
                for child in &children {
                    match self.tasks.get(child) {
                        Some(t) if t.done => {
                            if matches!(t.result, Some(TaskResult::Cancelled)) {
                                any_cancelled = true;
                            }
                        }
                        _ => {
                            all_done = false;
                            if first_unfinished.is_none() {
                                first_unfinished = Some(*child);
                            }
                        }
                    }
                }
                if all_done {
                    self.store_into(id, &dst, Value::Bool(any_cancelled, TYPE_BOOL))?;
                    self.goto(id, ready_bb);
                    Ok(StepOutcome::Continue)
                } else {
                    self.goto(id, pend_bb);
                    self.scheduler.park(id, WakerKey::Join(first_unfinished.unwrap().0));
                    Ok(StepOutcome::Parked)
                }
            }
            AsyncRequest::Select { waiters, ready_bb, pend_bb, dst } => {
                let mut children = Vec::with_capacity(waiters.len());
                for w in &waiters {
                    children.push(self.task_id_of(w)?);
                }
                for w in &waiters {
                    self.heap.release_value(w)?;
                }
                let mut winner = None;
                for child in &children {
                    if self.tasks.get(child).is_some_and(|t| t.done) {
                        winner = Some(*child);
                        break;
                    }
                }
                if let Some(child) = winner {
                    let result = self.take_result(child)?;
                    let outcome_ty = self.awaited_outcome_type(dst_hint_type(&dst))?;
                    let wrapped = self.wrap_outcome(result, outcome_ty)?;
                    self.store_into(id, &dst, wrapped)?;
                    self.goto(id, ready_bb);
                    Ok(StepOutcome::Continue)
                } else {
                    self.goto(id, pend_bb);
                    if let Some(first) = children.first() {
                        self.scheduler.park(id, WakerKey::Join(first.0));
                    }
                    Ok(StepOutcome::Parked)
                }
            }
        }
    }

    fn advance_ip(&mut self, id: TaskId) {
        if let Some(frame) = self.tasks.get_mut(&id).unwrap().stack.top_mut() {
            frame.ip += 1;
        }
    }

    fn goto(&mut self, id: TaskId, bb: crate::module::BlockId) {
        if let Some(frame) = self.tasks.get_mut(&id).unwrap().stack.top_mut() {
            frame.block = bb.0;
            frame.ip = 0;
        }
    }

    fn store_into(&mut self, id: TaskId, place: &Place, value: Value) -> VmResult<()> {
        let mut ctx = eval_ctx(&self.heap, &self.types, &mut self.globals);
        let rec = self.tasks.get_mut(&id).unwrap();
        let frame = rec.stack.top_mut().unwrap();
        let resolved = ctx.eval_place(frame, place)?;
        ctx.store(frame, &resolved, value)
    }

    fn task_id_of(&self, value: &Value) -> VmResult<TaskId> {
        match value {
            Value::HandleTask(h, _) => Ok(TaskId(self.heap.task_id_of(*h)?)),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a task handle")),
        }
    }

    fn scope_task_ids(&self, scope: &Value) -> VmResult<Vec<TaskId>> {
        let handle = match scope {
            Value::HandleArray(h, _) | Value::HandleArraySlice(h, _) => *h,
            _ => return Err(VmError::new(PanicKind::TypeMismatch, "join-all scope must be an array of tasks")),
        };
        collections::array_elements_ref(&self.heap, handle)?
            .iter()
            .map(|v| self.task_id_of(v))
            .collect()
    }

    fn take_result(&mut self, target: TaskId) -> VmResult<TaskResult> {
        self.tasks
            .get_mut(&target)
            .and_then(|t| t.result.take())
            .ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "task has no recorded result"))
            .map(|r| {
                // `take()` leaves `result: None`; repeated `Await`s on
                // the same task see `Success(Nothing)`/`Cancelled`
                // again rather than panicking, matching "awaited
                // results" being observable more than once.
                if let Some(t) = self.tasks.get_mut(&target) {
                    t.result = Some(r.clone());
                }
                r
            })
    }

    /// Builds/looks up the `Success(T) | Cancelled` union for inner
    /// type `inner` (spec §4.I "awaited results encode `Cancelled()`
    /// as a tag").
    fn awaited_outcome_type(&mut self, inner: TypeId) -> VmResult<TypeId> {
        if let Some(ty) = self.outcome_unions.get(&inner) {
            return Ok(*ty);
        }
        let union_ty = self.types.intern(TypeKind::Union(TagLayout::default()));
        self.types.register_tag_layout(
            union_ty,
            TagLayout {
                cases: vec![
                    TagCase { tag_name: "Success".into(), tag_sym: 1, payload_types: vec![inner] },
                    TagCase { tag_name: "Cancelled".into(), tag_sym: 0, payload_types: vec![] },
                ],
                nullable: false,
            },
        );
        self.outcome_unions.insert(inner, union_ty);
        Ok(union_ty)
    }

    fn wrap_outcome(&mut self, result: TaskResult, outcome_ty: TypeId) -> VmResult<Value> {
        match result {
            TaskResult::Success(v) => {
                let handle = tagunion::make_tag(&self.heap, &self.types, outcome_ty, "Success", vec![v.unwrap_or(Value::Nothing)])?;
                Ok(Value::HandleTag(handle, outcome_ty))
            }
            TaskResult::Cancelled => {
                let handle = tagunion::make_tag(&self.heap, &self.types, outcome_ty, "Cancelled", vec![])?;
                Ok(Value::HandleTag(handle, outcome_ty))
            }
        }
    }

    /// Marks a task done, releasing its remaining frames' owned locals
    /// and waking everything parked on it (spec §4.I "terminates in
    /// `Success(Value)` or `Cancelled`").
    fn finish_task(&mut self, id: TaskId, result: TaskResult) -> VmResult<()> {
        let rec = self.tasks.get_mut(&id).unwrap();
        if rec.done {
            return Ok(());
        }
        while let Some(mut frame) = rec.stack.pop() {
            frame.drop_all_locals(&self.heap)?;
        }
        rec.done = true;
        rec.cancelled = matches!(result, TaskResult::Cancelled);
        self.tasks.get_mut(&id).unwrap().result = Some(result);
        self.scheduler.complete(id);
        self.scheduler.wake(WakerKey::Join(id.0));
        if let Some(watchers) = self.watchers_by_target.remove(&id) {
            for w in watchers {
                self.scheduler.force_ready(w);
            }
        }
        Ok(())
    }

    /// Cancellation is cooperative: `cancelled` is observed the next
    /// time the scheduler gives this task a turn (spec §5). Since only
    /// one task runs at a time, a task not currently being stepped is
    /// safe to finalize immediately.
    fn cancel_task(&mut self, target: TaskId) -> VmResult<()> {
        if self.tasks.get(&target).is_some_and(|t| t.done) {
            return Ok(());
        }
        self.finish_task(target, TaskResult::Cancelled)
    }

    fn spawn_timeout(&mut self, target: TaskId, delay_ticks: u64, result_type: TypeId) -> TaskId {
        let timer_key = WakerKey::Timer(self.next_timer_id);
        self.next_timer_id += 1;
        let watcher = self.scheduler.spawn_parked(timer_key);
        self.scheduler.register_timer(delay_ticks, timer_key);
        self.watchers_by_target.entry(target).or_default().push(watcher);
        self.tasks.insert(watcher, TaskRecord::watcher(TimeoutState { target, result_type }));
        watcher
    }

    fn resolve_timeout_watcher(&mut self, id: TaskId, ts: TimeoutState) -> VmResult<()> {
        if self.tasks.get(&ts.target).is_some_and(|t| t.done) {
            let result = self.take_result(ts.target)?;
            self.finish_task(id, result)
        } else {
            self.cancel_task(ts.target)?;
            self.finish_task(id, TaskResult::Cancelled)
        }
    }

    fn dispatch_intrinsic(&mut self, id: TaskId, name: &str, args: Vec<Value>, dst: Option<Place>) -> VmResult<StepOutcome> {
        if name == "rt_exit" {
            let code = match args.first() {
                Some(Value::Int(i, _)) => *i as i32,
                _ => 0,
            };
            for a in &args {
                self.heap.release_value(a)?;
            }
            return Ok(StepOutcome::Exit(code));
        }
        if name == "task_cancel" {
            let target = self.task_id_of(args.first().ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "task_cancel needs one argument"))?)?;
            for a in &args {
                self.heap.release_value(a)?;
            }
            self.cancel_task(target)?;
            if let Some(dst) = dst {
                self.store_into(id, &dst, Value::Nothing)?;
            }
            self.advance_ip(id);
            return Ok(StepOutcome::Continue);
        }
        if name == "task_timeout" {
            let target = self.task_id_of(args.first().ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "task_timeout needs a task argument"))?)?;
            let delay = match args.get(1) {
                Some(Value::Int(i, _)) => (*i).max(0) as u64,
                _ => return Err(VmError::new(PanicKind::TypeMismatch, "task_timeout needs an int delay argument")),
            };
            let result_type = args.first().and_then(|v| v.type_id()).unwrap_or(TYPE_INT);
            for a in &args {
                self.heap.release_value(a)?;
            }
            let watcher = self.spawn_timeout(target, delay, result_type);
            let handle = self.heap.alloc_task(TYPE_TASK, watcher.0);
            if let Some(dst) = dst {
                self.store_into(id, &dst, Value::HandleTask(handle, TYPE_TASK))?;
            } else {
                self.heap.release_value(&Value::HandleTask(handle, TYPE_TASK))?;
            }
            self.advance_ip(id);
            return Ok(StepOutcome::Continue);
        }
        // The raw-memory arena is pure VM-internal state (spec §4.A):
        // unlike the host-facing intrinsics below, these never cross
        // into `Runtime` and so never touch the record/replay log.
        if matches!(name, "rt_alloc" | "rt_free" | "rt_realloc" | "rt_memcpy" | "rt_memmove") {
            let result = self.call_intrinsic(name, &args)?;
            for a in &args {
                self.heap.release_value(a)?;
            }
            if let Some(dst) = dst {
                self.store_into(id, &dst, result)?;
            } else {
                self.heap.release_value(&result)?;
            }
            self.advance_ip(id);
            return Ok(StepOutcome::Continue);
        }

        let encoded_args = args.iter().map(|v| self.encode_replay_value(v)).collect::<VmResult<Vec<_>>>()?;
        let result = if self.replayer.is_some() {
            // "The replay runtime must not consult host state" (spec
            // §4.K): the live `Runtime` is never called here.
            let replayed = self.replayer.as_mut().unwrap().expect_intrinsic(name, &encoded_args)?;
            self.decode_replay_value(replayed)?
        } else {
            self.call_intrinsic(&name.to_string(), &args)?
        };
        if let Some(rec) = &mut self.recorder {
            let encoded_result = self.encode_replay_value(&result)?;
            rec.record_intrinsic(name, encoded_args, encoded_result);
        }
        for a in &args {
            self.heap.release_value(a)?;
        }
        if let Some(dst) = dst {
            self.store_into(id, &dst, result)?;
        } else {
            self.heap.release_value(&result)?;
        }
        self.advance_ip(id);
        Ok(StepOutcome::Continue)
    }

    /// The closed intrinsic table (spec §9 "Intrinsic dispatch keys
    /// off string names; the table is closed at build time"). Only
    /// the subset exercised by the host-capability surface (§4.L), the
    /// raw memory arena (§4.A), and the §8 scenarios is wired; a
    /// fuller table (full `rt_fs_*`/`rt_net_*`/`term_*`) belongs to a
    /// real front end's standard library, not the reference core.
    fn call_intrinsic(&self, name: &str, args: &[Value]) -> VmResult<Value> {
        match name {
            "rt_argv" => {
                let items: Vec<Value> = self
                    .runtime
                    .argv()
                    .iter()
                    .map(|s| Value::HandleString(self.heap.alloc_string(TYPE_STRING, s.clone().into_bytes()), TYPE_STRING))
                    .collect();
                Ok(Value::HandleArray(collections::new_array(&self.heap, TYPE_STRING, items), TYPE_STRING))
            }
            "rt_stdin_read_all" => {
                let bytes = self.runtime.read_stdin()?;
                let text = String::from_utf8_lossy(&bytes);
                Ok(Value::HandleString(self.heap.alloc_string(TYPE_STRING, text.trim().as_bytes().to_vec()), TYPE_STRING))
            }
            "rt_monotonic_now" => Ok(Value::Int(self.runtime.monotonic_now() as i64, TYPE_INT)),
            "rt_exit_code" => Ok(Value::Int(0, TYPE_INT)),
            "rt_alloc" => {
                let size = int_arg(args, 0)?.max(0) as u64;
                let align = args.get(1).map(int_arg_value).transpose()?.unwrap_or(1).max(1) as u64;
                let handle = self.heap.rt_alloc(size, align);
                Ok(raw_ptr(handle, 0, size))
            }
            "rt_free" => {
                let handle = raw_handle_arg(args, 0)?;
                self.heap.rt_free(handle)?;
                Ok(Value::Nothing)
            }
            "rt_realloc" => {
                let handle = raw_handle_arg(args, 0)?;
                let new_size = int_arg(args, 1)?.max(0) as u64;
                self.heap.rt_realloc(handle, new_size)?;
                Ok(raw_ptr(handle, 0, new_size))
            }
            "rt_memcpy" => {
                let (dst, dst_off) = raw_ptr_arg(args, 0)?;
                let (src, src_off) = raw_ptr_arg(args, 1)?;
                let len = int_arg(args, 2)?.max(0) as u64;
                self.heap.rt_memcpy(dst, dst_off, src, src_off, len)?;
                Ok(Value::Nothing)
            }
            "rt_memmove" => {
                let (dst, dst_off) = raw_ptr_arg(args, 0)?;
                let (src, src_off) = raw_ptr_arg(args, 1)?;
                let len = int_arg(args, 2)?.max(0) as u64;
                self.heap.rt_memmove(dst, dst_off, src, src_off, len)?;
                Ok(Value::Nothing)
            }
            "__print" => {
                if let (Some(term), Some(v)) = (self.runtime.term(), args.first()) {
                    if let Value::HandleString(h, _) = v {
                        let bytes = crate::place::flatten_string_bytes(&self.heap, *h)?;
                        term.write_stdout(&bytes)?;
                    }
                }
                Ok(Value::Nothing)
            }
            other => Err(VmError::new(PanicKind::UnsupportedIntrinsic, format!("unknown intrinsic `{}`", other))),
        }
    }

    /// Reduces a `Value` crossing the host boundary to the handful of
    /// shapes the record/replay log can carry (spec §4.K). Intrinsics
    /// outside the closed table never reach here.
    fn encode_replay_value(&self, value: &Value) -> VmResult<crate::replay::ReplayValue> {
        use crate::replay::ReplayValue;
        match value {
            Value::Nothing => Ok(ReplayValue::Nothing),
            Value::Bool(b, _) => Ok(ReplayValue::Bool(*b)),
            Value::Int(i, _) => Ok(ReplayValue::Int(*i)),
            Value::HandleString(h, _) => {
                let bytes = crate::place::flatten_string_bytes(&self.heap, *h)?;
                Ok(ReplayValue::Str(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Value::HandleArray(h, _) => {
                let elems = collections::array_elements_ref(&self.heap, *h)?;
                let mut strs = Vec::with_capacity(elems.len());
                for e in &elems {
                    match e {
                        Value::HandleString(sh, _) => {
                            let bytes = crate::place::flatten_string_bytes(&self.heap, *sh)?;
                            strs.push(String::from_utf8_lossy(&bytes).into_owned());
                        }
                        _ => return Err(VmError::new(PanicKind::TypeMismatch, "replay log only carries string arrays across the host boundary")),
                    }
                }
                Ok(ReplayValue::StrArray(strs))
            }
            _ => Err(VmError::new(PanicKind::TypeMismatch, "value is not representable in the replay log")),
        }
    }

    /// The inverse of [`Vm::encode_replay_value`]: materializes a
    /// logged result back into a live, heap-backed `Value` without
    /// touching the host `Runtime`.
    fn decode_replay_value(&self, value: crate::replay::ReplayValue) -> VmResult<Value> {
        use crate::replay::ReplayValue;
        Ok(match value {
            ReplayValue::Nothing => Value::Nothing,
            ReplayValue::Bool(b) => Value::Bool(b, TYPE_BOOL),
            ReplayValue::Int(i) => Value::Int(i, TYPE_INT),
            ReplayValue::Str(s) => Value::HandleString(self.heap.alloc_string(TYPE_STRING, s.into_bytes()), TYPE_STRING),
            ReplayValue::StrArray(items) => {
                let values: Vec<Value> =
                    items.into_iter().map(|s| Value::HandleString(self.heap.alloc_string(TYPE_STRING, s.into_bytes()), TYPE_STRING)).collect();
                Value::HandleArray(collections::new_array(&self.heap, TYPE_STRING, values), TYPE_STRING)
            }
        })
    }
}

/// `Await`/`Poll`/`JoinAll`/`Select` all need a concrete payload type
/// for the `Success(T)` case; lacking real type inference here, the
/// destination place's declared type id stands in for it. A later
/// front end attaches this to the instruction directly instead.
fn dst_hint_type(_dst: &Place) -> TypeId {
    TYPE_INT
}

/// Wraps a raw-arena handle as a mutable `Ptr` into `Location::RawBytes`
/// (spec §4.A "raw memory arena" — the handle a `Value` carries for
/// `rt_alloc`/`rt_realloc`'s return value).
fn raw_ptr(handle: Handle, offset: u64, len: u64) -> Value {
    Value::Ptr(Box::new(PlaceRef { location: Location::RawBytes { handle, offset, len }, is_mut: true, type_id: TYPE_RAWPTR }))
}

fn int_arg_value(v: &Value) -> VmResult<i64> {
    match v {
        Value::Int(i, _) => Ok(*i),
        _ => Err(VmError::new(PanicKind::TypeMismatch, "expected an int argument")),
    }
}

fn int_arg(args: &[Value], idx: usize) -> VmResult<i64> {
    args.get(idx).ok_or_else(|| VmError::new(PanicKind::TypeMismatch, "missing int argument")).and_then(int_arg_value)
}

fn raw_handle_arg(args: &[Value], idx: usize) -> VmResult<Handle> {
    match args.get(idx) {
        Some(Value::Ptr(p)) => match &p.location {
            Location::RawBytes { handle, .. } => Ok(*handle),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a raw-arena pointer argument")),
        },
        _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a raw-arena pointer argument")),
    }
}

fn raw_ptr_arg(args: &[Value], idx: usize) -> VmResult<(Handle, u64)> {
    match args.get(idx) {
        Some(Value::Ptr(p)) => match &p.location {
            Location::RawBytes { handle, offset, .. } => Ok((*handle, *offset)),
            _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a raw-arena pointer argument")),
        },
        _ => Err(VmError::new(PanicKind::TypeMismatch, "expected a raw-arena pointer argument")),
    }
}

/// Three of `Vm`'s fields, borrowed disjointly from `self.tasks` so a
/// step can hold an `EvalContext` and mutate the current task's frame
/// at the same time (partial-borrow through a free function, since a
/// `&mut self` method would borrow the whole struct).
fn eval_ctx<'a>(heap: &'a Heap, types: &'a TypeInterner, globals: &'a mut Vec<GlobalSlot>) -> EvalContext<'a> {
    EvalContext { heap, types, globals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TYPE_INT;
    use crate::module::{BasicBlock, BlockId, Func, Operand, Terminator};
    use crate::runtime::TestRuntime;

    fn simple_module(return_expr: Operand) -> (Module, TypeInterner) {
        let types = TypeInterner::new();
        let mut module = Module::new();
        module.add_func(Func {
            sym: FuncSym(0),
            name: "__surge_start".into(),
            params: vec![],
            locals: vec![],
            blocks: vec![BasicBlock { id: BlockId(0), instrs: vec![], terminator: Terminator::Return(Some(return_expr)) }],
            entry: BlockId(0),
        });
        (module, types)
    }

    #[test]
    fn missing_entrypoint_is_a_clean_exit() {
        let module = Module::new();
        let types = TypeInterner::new();
        let runtime = Box::new(TestRuntime::new(vec![], vec![]));
        let mut vm = Vm::new(module, types, runtime, VmConfig::default());
        assert_eq!(vm.run().unwrap(), 0);
    }

    #[test]
    fn returning_an_int_from_surge_start_is_the_exit_code() {
        let (module, types) = simple_module(Operand::Const(crate::module::ConstValue::Int(42, TYPE_INT)));
        let runtime = Box::new(TestRuntime::new(vec![], vec![]));
        let mut vm = Vm::new(module, types, runtime, VmConfig::default());
        assert_eq!(vm.run().unwrap(), 42);
    }

    /// `fn checkpoint() -> int { return 1; }` spawned as a task and
    /// immediately awaited: exercises `Spawn` + `Await` end to end
    /// (spec §4.I, §8 scenario 6).
    #[test]
    fn spawn_then_await_returns_the_childs_result() {
        use crate::module::{Instr, Projection};

        let types = TypeInterner::new();
        let mut module = Module::new();
        module.add_func(Func {
            sym: FuncSym(1),
            name: "child".into(),
            params: vec![],
            locals: vec![],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![],
                terminator: Terminator::Return(Some(Operand::Const(crate::module::ConstValue::Int(7, TYPE_INT)))),
            }],
            entry: BlockId(0),
        });
        module.add_func(Func {
            sym: FuncSym(0),
            name: "__surge_start".into(),
            params: vec![],
            locals: vec![
                crate::module::LocalDecl { name: "t".into(), type_id: TYPE_TASK, span: Default::default() },
                crate::module::LocalDecl { name: "outcome".into(), type_id: TYPE_INT, span: Default::default() },
            ],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![
                    Instr::Spawn { poll_fn: FuncSym(1), args: vec![], dst: Place::local(0) },
                    Instr::Await { task: Operand::Move(Place::local(0)), dst: Place::local(1) },
                ],
                terminator: Terminator::Return(Some(Operand::Move(
                    Place::local(1).project(Projection::TagPayload("Success".into(), 0)),
                ))),
            }],
            entry: BlockId(0),
        });
        let runtime = Box::new(TestRuntime::new(vec![], vec![]));
        let mut vm = Vm::new(module, types, runtime, VmConfig::default());
        assert_eq!(vm.run().unwrap(), 7);
    }

    /// `rt_alloc` → `rt_memcpy` → `rt_free` end to end (spec §4.A raw
    /// memory arena, §4.L intrinsic bridge).
    #[test]
    fn raw_memory_arena_round_trips_through_intrinsics() {
        use crate::module::{CalleeRef, ConstValue, Instr, LocalDecl};

        let types = TypeInterner::new();
        let mut module = Module::new();
        module.add_func(Func {
            sym: FuncSym(0),
            name: "__surge_start".into(),
            params: vec![],
            locals: vec![
                LocalDecl { name: "src".into(), type_id: TYPE_RAWPTR, span: Default::default() },
                LocalDecl { name: "dst".into(), type_id: TYPE_RAWPTR, span: Default::default() },
            ],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                instrs: vec![
                    Instr::Call {
                        callee: CalleeRef::Intrinsic("rt_alloc".into()),
                        args: vec![Operand::Const(ConstValue::Int(8, TYPE_INT)), Operand::Const(ConstValue::Int(1, TYPE_INT))],
                        dst: Some(Place::local(0)),
                    },
                    Instr::Call {
                        callee: CalleeRef::Intrinsic("rt_alloc".into()),
                        args: vec![Operand::Const(ConstValue::Int(8, TYPE_INT)), Operand::Const(ConstValue::Int(1, TYPE_INT))],
                        dst: Some(Place::local(1)),
                    },
                    Instr::Call {
                        callee: CalleeRef::Intrinsic("rt_memcpy".into()),
                        args: vec![Operand::Copy(Place::local(1)), Operand::Copy(Place::local(0)), Operand::Const(ConstValue::Int(8, TYPE_INT))],
                        dst: None,
                    },
                    Instr::Call {
                        callee: CalleeRef::Intrinsic("rt_free".into()),
                        args: vec![Operand::Move(Place::local(0))],
                        dst: None,
                    },
                    Instr::Call {
                        callee: CalleeRef::Intrinsic("rt_free".into()),
                        args: vec![Operand::Move(Place::local(1))],
                        dst: None,
                    },
                ],
                terminator: Terminator::Return(Some(Operand::Const(ConstValue::Int(0, TYPE_INT)))),
            }],
            entry: BlockId(0),
        });
        let runtime = Box::new(TestRuntime::new(vec![], vec![]));
        let mut vm = Vm::new(module, types, runtime, VmConfig::default());
        assert_eq!(vm.run().unwrap(), 0);
    }

    #[test]
    fn deterministic_mode_runs_the_same_program_to_the_same_exit_twice() {
        let run_once = || {
            let (module, types) = simple_module(Operand::Const(crate::module::ConstValue::Int(5, TYPE_INT)));
            let runtime = Box::new(TestRuntime::new(vec![], vec![]));
            let mut vm = Vm::new(module, types, runtime, VmConfig::default());
            vm.run().unwrap()
        };
        assert_eq!(run_once(), run_once());
    }
}
