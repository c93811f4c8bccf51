//! Scripted process runner for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChildProcess, Command, ExecResult, ProcessError, ProcessResult, ProcessRunner};

#[derive(Clone)]
enum Reply {
    Exit(i32, String),
    Missing,
}

/// Replies to commands by their shell string.
///
/// Each command line has a queue of replies; the last reply is sticky so a
/// command polled repeatedly keeps returning it.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    spawns: AtomicUsize,
    spawn_fails: AtomicBool,
    child_exit: Mutex<Option<(Duration, i32)>>,
    killed: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a successful reply with the given stdout.
    pub(crate) fn on(&self, line: &str, stdout: &str) -> &Self {
        self.on_exit(line, 0, stdout)
    }

    /// Queues a reply with an explicit exit code.
    pub(crate) fn on_exit(&self, line: &str, code: i32, stdout: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(line.to_string())
            .or_default()
            .push_back(Reply::Exit(code, stdout.to_string()));
        self
    }

    /// Makes the command fail to spawn, as if the binary were missing.
    pub(crate) fn on_missing(&self, line: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(line.to_string())
            .or_default()
            .push_back(Reply::Missing);
        self
    }

    /// Makes every `output` call for `line` take `delay` before replying.
    pub(crate) fn delay(&self, line: &str, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert(line.to_string(), delay);
        self
    }

    /// Makes every `spawn` call fail.
    pub(crate) fn fail_spawns(&self) {
        self.spawn_fails.store(true, Ordering::SeqCst);
    }

    /// Spawned children exit on their own with `code` after `delay`.
    pub(crate) fn children_exit_after(&self, delay: Duration, code: i32) {
        *self.child_exit.lock().unwrap() = Some((delay, code));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, line: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == line).count()
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    fn next_reply(&self, line: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(line)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn output(&self, cmd: &Command) -> ProcessResult<ExecResult> {
        let line = cmd.to_shell_string();
        self.calls.lock().unwrap().push(line.clone());

        let delay = self.delays.lock().unwrap().get(&line).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(&line) {
            Some(Reply::Exit(code, stdout)) => Ok(ExecResult {
                exit_code: code,
                stdout,
                stderr: String::new(),
                duration: Duration::ZERO,
            }),
            Some(Reply::Missing) | None => Err(ProcessError::Spawn {
                program: cmd.program.clone(),
                reason: format!("no script for `{}`", line),
            }),
        }
    }

    async fn spawn(&self, cmd: &Command) -> ProcessResult<Box<dyn ChildProcess>> {
        self.calls.lock().unwrap().push(cmd.to_shell_string());
        if self.spawn_fails.load(Ordering::SeqCst) {
            return Err(ProcessError::Spawn {
                program: cmd.program.clone(),
                reason: "scripted spawn failure".to_string(),
            });
        }
        let pid = self.spawns.fetch_add(1, Ordering::SeqCst) as u32 + 1000;
        Ok(Box::new(FakeChild {
            pid,
            exit: *self.child_exit.lock().unwrap(),
            status: None,
            killed: self.killed.clone(),
        }))
    }
}

struct FakeChild {
    pid: u32,
    exit: Option<(Duration, i32)>,
    status: Option<i32>,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        if self.status.is_some() {
            None
        } else {
            Some(self.pid)
        }
    }

    fn try_wait(&mut self) -> ProcessResult<Option<i32>> {
        Ok(self.status)
    }

    async fn wait(&mut self) -> ProcessResult<i32> {
        if let Some(code) = self.status {
            return Ok(code);
        }
        match self.exit {
            Some((delay, code)) => {
                tokio::time::sleep(delay).await;
                self.status = Some(code);
                Ok(code)
            }
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.status = Some(-1);
        Ok(())
    }
}

/// Liveness probe that succeeds after a fixed number of failures.
pub(crate) struct CountingProbe {
    fail_first: usize,
    calls: AtomicUsize,
}

impl CountingProbe {
    pub(crate) fn new(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn never() -> Self {
        Self::new(usize::MAX)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::server::LivenessProbe for CountingProbe {
    async fn is_alive(&self, _address: &str, _port: u16) -> bool {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so that concurrent callers interleave.
        tokio::task::yield_now().await;
        n >= self.fail_first
    }
}
