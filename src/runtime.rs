// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! The host capability surface the interpreter calls out through
//! (spec §4.L). Kept narrow and object-safe — no `async_trait` — so a
//! host can hand the VM a `Box<dyn Runtime>` without pulling in an
//! async runtime of its own choosing.

use std::io::Read;

use crate::error::{PanicKind, VmError, VmResult};

/// Everything outside the value/heap/instruction model that a running
/// program can observe or affect. A host embeds the VM by implementing
/// this once; `vm.rs` never reaches for `std::env`/`std::io` directly.
pub trait Runtime: Send + Sync {
    fn argv(&self) -> &[String];

    /// Reads all of stdin eagerly; large/streaming stdin is out of
    /// scope for the reference interpreter (spec §1 non-goals).
    fn read_stdin(&self) -> VmResult<Vec<u8>>;

    fn exit(&self, code: i32) -> !;

    /// Monotonic nanoseconds since an unspecified epoch, stable within
    /// one process (spec §4.I timer mode `real`).
    fn monotonic_now(&self) -> u64;

    fn term(&self) -> Option<&dyn TermRuntime> {
        None
    }

    fn fs(&self) -> Option<&dyn FsRuntime> {
        None
    }

    fn net(&self) -> Option<&dyn NetRuntime> {
        None
    }
}

/// Optional terminal I/O surface (spec §4.L "Term bridge", non-goal
/// unless a host opts in).
pub trait TermRuntime: Send + Sync {
    fn write_stdout(&self, bytes: &[u8]) -> VmResult<()>;
    fn write_stderr(&self, bytes: &[u8]) -> VmResult<()>;
}

/// Optional filesystem surface.
pub trait FsRuntime: Send + Sync {
    fn read_file(&self, path: &str) -> VmResult<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> VmResult<()>;
}

/// Optional networking surface; deliberately coarse (byte buffers, not
/// typed sockets) since the IR only ever sees opaque handles bridged
/// back in through intrinsics (spec §4.L).
pub trait NetRuntime: Send + Sync {
    fn connect(&self, addr: &str) -> VmResult<u64>;
    fn send(&self, conn: u64, data: &[u8]) -> VmResult<usize>;
    fn recv(&self, conn: u64, max_len: usize) -> VmResult<Vec<u8>>;
}

/// A minimal host used by the CLI entrypoint and by tests: real argv,
/// real stdin, real monotonic clock, no Term/Fs/Net.
pub struct NativeRuntime {
    argv: Vec<String>,
}

impl NativeRuntime {
    pub fn new(argv: Vec<String>) -> Self {
        NativeRuntime { argv }
    }
}

impl Runtime for NativeRuntime {
    fn argv(&self) -> &[String] {
        &self.argv
    }

    fn read_stdin(&self) -> VmResult<Vec<u8>> {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| VmError::new(PanicKind::UnsupportedIntrinsic, format!("stdin read failed: {}", e)))?;
        Ok(buf)
    }

    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }

    fn monotonic_now(&self) -> u64 {
        use std::time::Instant;
        static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// A fully in-memory host for tests and for recorded/replayed runs,
/// where argv/stdin/exit/the clock must themselves be deterministic
/// and observable (spec §8 e2e scenarios, §4.K).
pub struct TestRuntime {
    argv: Vec<String>,
    stdin: Vec<u8>,
    pub exit_code: std::sync::Mutex<Option<i32>>,
    now: std::sync::atomic::AtomicU64,
}

impl TestRuntime {
    pub fn new(argv: Vec<String>, stdin: Vec<u8>) -> Self {
        TestRuntime { argv, stdin, exit_code: std::sync::Mutex::new(None), now: std::sync::atomic::AtomicU64::new(0) }
    }

    pub fn advance_clock(&self, nanos: u64) {
        self.now.fetch_add(nanos, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Runtime for TestRuntime {
    fn argv(&self) -> &[String] {
        &self.argv
    }

    fn read_stdin(&self) -> VmResult<Vec<u8>> {
        Ok(self.stdin.clone())
    }

    fn exit(&self, code: i32) -> ! {
        *self.exit_code.lock().unwrap() = Some(code);
        // Tests never let control flow reach here uncaught: `vm.rs`
        // treats `exit` as a control-flow signal, not a real process
        // exit, when the configured runtime is a `TestRuntime`.
        panic!("TestRuntime::exit({}) called outside of a controlled VM run", code);
    }

    fn monotonic_now(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_echoes_configured_stdin() {
        let rt = TestRuntime::new(vec!["prog".into()], b"hello".to_vec());
        assert_eq!(rt.read_stdin().unwrap(), b"hello");
        assert_eq!(rt.argv(), &["prog".to_string()]);
    }

    #[test]
    fn test_runtime_clock_is_controllable() {
        let rt = TestRuntime::new(vec![], vec![]);
        assert_eq!(rt.monotonic_now(), 0);
        rt.advance_clock(42);
        assert_eq!(rt.monotonic_now(), 42);
    }
}
