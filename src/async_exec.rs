// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! The cooperative async executor (spec §4.I). Tasks are MIR
//! continuations: `vm.rs` owns the actual `Frame` for each task and
//! drives it one `Poll` at a time; this module owns only the
//! scheduling bookkeeping — ready queue, parked wakers, and timers —
//! the same separation the teacher keeps between `CoreThread`
//! (scheduling loop) and the state machines it drives.
//!
//! Two scheduling modes (`SURGE_SCHED_MODE`, spec §10.3):
//! - `deterministic` (default): a single FIFO ready queue. Same
//!   program, same trace, always.
//! - `seeded`: simulates an N-worker work-stealing pool over logical
//!   per-worker queues, using a seeded PRNG for every scheduling
//!   decision so the *interleaving* is reproducible without relying on
//!   actual OS thread timing (true OS concurrency would make the
//!   record/replay log component K is built on non-reproducible).

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use rand_pcg::Pcg32;

use crate::module::WakerKeySpec;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Mirrors `WakerKeySpec` but carries a synthesized id for timers,
/// which the IR doesn't name directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WakerKey {
    Timer(u64),
    Join(u64),
    NetAccept(u64),
    NetRead(u64),
    NetWrite(u64),
    ChannelSend(u64),
    ChannelRecv(u64),
}

impl From<&WakerKeySpec> for WakerKey {
    fn from(spec: &WakerKeySpec) -> Self {
        match spec {
            WakerKeySpec::Timer(id) => WakerKey::Timer(*id),
            WakerKeySpec::Join(id) => WakerKey::Join(*id),
            WakerKeySpec::NetAccept(id) => WakerKey::NetAccept(*id),
            WakerKeySpec::NetRead(id) => WakerKey::NetRead(*id),
            WakerKeySpec::NetWrite(id) => WakerKey::NetWrite(*id),
            WakerKeySpec::ChannelSend(id) => WakerKey::ChannelSend(*id),
            WakerKeySpec::ChannelRecv(id) => WakerKey::ChannelRecv(*id),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedMode {
    Deterministic,
    Seeded,
}

pub struct SchedConfig {
    pub mode: SchedMode,
    pub workers: u32,
    pub seed: u64,
    /// Real wall-clock timers (`SURGE_TIMER_MODE=real`) vs. a logical
    /// tick counter that advances only when every task is parked on a
    /// timer (spec §10.3, §4.I determinism note).
    pub real_timers: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig { mode: SchedMode::Deterministic, workers: 1, seed: 0, real_timers: false }
    }
}

struct TimerEntry {
    deadline: u64,
    key: WakerKey,
}

/// Scheduling state for one task; the task's actual continuation
/// (its `Frame`) lives in the caller's task table, keyed by the same
/// `TaskId`.
enum TaskSlot {
    Ready,
    Parked(WakerKey),
    Done,
}

pub struct AsyncExecutor {
    config: SchedConfig,
    next_id: u64,
    tasks: HashMap<TaskId, TaskSlot>,
    /// Per-worker ready queues. Worker 0's queue is also the single
    /// queue used in `Deterministic` mode.
    queues: Vec<VecDeque<TaskId>>,
    parked_by_key: HashMap<WakerKey, Vec<TaskId>>,
    timers: Vec<TimerEntry>,
    logical_now: u64,
    rng: Pcg32,
    trace: Vec<String>,
    events: u64,
}

/// Outcome of asking the executor "what runs next".
pub enum Scheduled {
    Task(TaskId),
    Idle,
    Deadlocked,
}

impl AsyncExecutor {
    pub fn new(config: SchedConfig) -> Self {
        let workers = config.workers.max(1) as usize;
        AsyncExecutor {
            rng: Pcg32::new(config.seed, 0xa02bdbf7bb3c0a7),
            config,
            next_id: 1,
            tasks: HashMap::new(),
            queues: (0..workers).map(|_| VecDeque::new()).collect(),
            parked_by_key: HashMap::new(),
            timers: Vec::new(),
            logical_now: 0,
            trace: Vec::new(),
            events: 0,
        }
    }

    pub fn spawn(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, TaskSlot::Ready);
        self.push_ready(id);
        id
    }

    /// Allocates a task id already parked on `key`, without ever
    /// entering the ready queue — used by `Timeout` (spec §4.I), whose
    /// internal watcher task has no work to run until its timer fires
    /// or its target completes.
    pub fn spawn_parked(&mut self, key: WakerKey) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, TaskSlot::Parked(key));
        self.parked_by_key.entry(key).or_default().push(id);
        id
    }

    /// Forces a task straight to the ready queue regardless of its
    /// current slot, bypassing the key-indexed wake path. Used to
    /// notify a `Timeout` watcher when its *target* (not its timer)
    /// completes first; a stale key-based wake later is a harmless
    /// no-op (`wake` only re-queues tasks still `Parked`).
    pub fn force_ready(&mut self, id: TaskId) {
        if matches!(self.tasks.get(&id), Some(TaskSlot::Done)) {
            return;
        }
        self.tasks.insert(id, TaskSlot::Ready);
        self.push_ready(id);
    }

    fn push_ready(&mut self, id: TaskId) {
        let worker = (id.0 as usize) % self.queues.len();
        self.queues[worker].push_back(id);
    }

    pub fn park(&mut self, id: TaskId, key: WakerKey) {
        self.tasks.insert(id, TaskSlot::Parked(key));
        self.parked_by_key.entry(key).or_default().push(id);
    }

    pub fn complete(&mut self, id: TaskId) {
        self.tasks.insert(id, TaskSlot::Done);
    }

    /// Moves every task parked on `key` back to ready; returns how
    /// many woke (spec §4.I "waking queues every parked waiter").
    pub fn wake(&mut self, key: WakerKey) -> usize {
        let Some(waiters) = self.parked_by_key.remove(&key) else { return 0 };
        let n = waiters.len();
        for id in waiters {
            if matches!(self.tasks.get(&id), Some(TaskSlot::Parked(_))) {
                self.tasks.insert(id, TaskSlot::Ready);
                self.push_ready(id);
            }
        }
        n
    }

    pub fn register_timer(&mut self, delay_ticks: u64, key: WakerKey) {
        self.timers.push(TimerEntry { deadline: self.logical_now + delay_ticks, key });
    }

    fn has_ready_anywhere(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Advances the logical clock to the next timer deadline and wakes
    /// its waiters. No-op (returns `false`) under real timers, where
    /// the caller sleeps/polls wall-clock time instead.
    fn advance_logical_clock(&mut self) -> bool {
        if self.config.real_timers || self.timers.is_empty() {
            return false;
        }
        self.timers.sort_by_key(|t| t.deadline);
        let next = self.timers[0].deadline;
        self.logical_now = next;
        let (due, pending): (Vec<_>, Vec<_>) = self.timers.drain(..).partition(|t| t.deadline <= next);
        self.timers = pending;
        for t in due {
            self.wake(t.key);
        }
        true
    }

    /// Picks the next task to run (spec §4.I scheduling). In
    /// `Deterministic` mode this is plain FIFO on worker 0. In
    /// `Seeded` mode each call is one simulated worker's turn: it
    /// tries its own queue first, then "steals" from a PRNG-selected
    /// peer, logging a `SCHED_TRACE` line either way.
    pub fn next_scheduled(&mut self) -> Scheduled {
        if let Some(id) = self.queues[0].pop_front() {
            if self.config.mode == SchedMode::Seeded {
                self.log_trace("local", 0, id);
            }
            return Scheduled::Task(id);
        }
        if self.config.mode == SchedMode::Seeded {
            let workers = self.queues.len();
            if workers > 1 {
                let start = self.rng.gen_range(1..workers);
                for offset in 0..workers {
                    let w = (start + offset) % workers;
                    if w == 0 {
                        continue;
                    }
                    if let Some(id) = self.queues[w].pop_front() {
                        self.log_trace("steal", w, id);
                        return Scheduled::Task(id);
                    }
                }
            }
        } else {
            for w in 1..self.queues.len() {
                if let Some(id) = self.queues[w].pop_front() {
                    return Scheduled::Task(id);
                }
            }
        }
        if self.advance_logical_clock() {
            return self.next_scheduled();
        }
        if self.parked_by_key.is_empty() {
            Scheduled::Idle
        } else {
            Scheduled::Deadlocked
        }
    }

    fn log_trace(&mut self, kind: &str, worker: usize, id: TaskId) {
        self.events += 1;
        self.trace.push(format!("{}:{}:{}", kind, worker, id.0));
        tracing::debug!(kind, worker, task = id.0, "async schedule");
    }

    /// `SCHED_TRACE mode=seeded seed=... workers=... events=... hash=...`
    /// (spec §4.I determinism contract for the seeded scheduler).
    pub fn trace_summary(&self) -> String {
        let hash = fnv1a(&self.trace.join("|"));
        format!(
            "SCHED_TRACE mode={} seed={} workers={} events={} hash={:016x}",
            match self.config.mode {
                SchedMode::Deterministic => "deterministic",
                SchedMode::Seeded => "seeded",
            },
            self.config.seed,
            self.queues.len(),
            self.events,
            hash
        )
    }

    pub fn is_idle(&self) -> bool {
        !self.has_ready_anywhere() && self.timers.is_empty()
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_mode_is_plain_fifo() {
        let mut ex = AsyncExecutor::new(SchedConfig::default());
        let a = ex.spawn();
        let b = ex.spawn();
        assert!(matches!(ex.next_scheduled(), Scheduled::Task(t) if t == a));
        assert!(matches!(ex.next_scheduled(), Scheduled::Task(t) if t == b));
        assert!(matches!(ex.next_scheduled(), Scheduled::Idle));
    }

    #[test]
    fn park_then_wake_returns_to_ready() {
        let mut ex = AsyncExecutor::new(SchedConfig::default());
        let a = ex.spawn();
        assert!(matches!(ex.next_scheduled(), Scheduled::Task(t) if t == a));
        ex.park(a, WakerKey::ChannelRecv(1));
        assert!(matches!(ex.next_scheduled(), Scheduled::Idle));
        assert_eq!(ex.wake(WakerKey::ChannelRecv(1)), 1);
        assert!(matches!(ex.next_scheduled(), Scheduled::Task(t) if t == a));
    }

    #[test]
    fn timers_advance_logical_clock_when_nothing_ready() {
        let mut ex = AsyncExecutor::new(SchedConfig::default());
        let a = ex.spawn();
        ex.next_scheduled(); // drain a to running
        ex.park(a, WakerKey::Timer(1));
        ex.register_timer(5, WakerKey::Timer(1));
        match ex.next_scheduled() {
            Scheduled::Task(t) => assert_eq!(t, a),
            _ => panic!("expected the timer to fire and re-ready the task"),
        }
        assert_eq!(ex.logical_now, 5);
    }

    #[test]
    fn same_seed_produces_identical_trace() {
        let cfg = SchedConfig { mode: SchedMode::Seeded, workers: 4, seed: 42, real_timers: false };
        let run = |cfg: SchedConfig| {
            let mut ex = AsyncExecutor::new(cfg);
            for _ in 0..8 {
                ex.spawn();
            }
            for _ in 0..8 {
                ex.next_scheduled();
            }
            ex.trace_summary()
        };
        let cfg2 = SchedConfig { mode: SchedMode::Seeded, workers: 4, seed: 42, real_timers: false };
        assert_eq!(run(cfg), run(cfg2));
    }
}
