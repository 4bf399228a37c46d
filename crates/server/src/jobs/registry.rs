// crates/server/src/jobs/registry.rs
//! Live separation processes, keyed by job id.
//!
//! An entry owns the child, the pty master and the job's cancellation
//! token. Whoever removes the entry owns teardown, which makes cancel and
//! timeout idempotent: the second caller finds nothing.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{Child, ChildKiller, ExitStatus, MasterPty};
use tokio_util::sync::CancellationToken;

/// A running separation tool.
pub struct ProcessHandle {
    child: Box<dyn Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    cancel: CancellationToken,
    pid: Option<u32>,
    started: Instant,
}

impl ProcessHandle {
    pub fn new(
        child: Box<dyn Child + Send + Sync>,
        master: Box<dyn MasterPty + Send>,
        cancel: CancellationToken,
    ) -> Self {
        let pid = child.process_id();
        Self {
            child,
            master: Some(master),
            cancel,
            pid,
            started: Instant::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close our end of the pty. Returns `false` if it was already closed.
    pub fn close_pty(&mut self) -> bool {
        self.master.take().is_some()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Stop readers and kill the child without waiting for it.
    pub fn abort(mut self) {
        self.cancel.cancel();
        self.close_pty();
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                tracing::debug!(pid = ?self.pid, error = %e, "kill failed");
            }
        }
    }

    /// SIGTERM the child's process group, wait up to `grace`, then kill and
    /// reap it. Returns the exit status when one was observed.
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        self.cancel.cancel();
        self.close_pty();

        self.signal_group(Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid = ?self.pid, error = %e, "polling child during terminate");
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tracing::info!(pid = ?self.pid, "child ignored SIGTERM, killing");
        self.signal_group(Signal::SIGKILL);
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "kill failed");
        }
        let mut child = self.child;
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reaping killed child");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "reaper task failed");
                None
            }
        }
    }
}

impl ProcessHandle {
    /// The tool runs as its own session leader, so its pgid is its pid and
    /// signalling the group also reaches its workers.
    fn signal_group(&self, sig: Signal) {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        let pid = Pid::from_raw(pid);
        if signal::killpg(pid, sig).is_err() {
            if let Err(errno) = signal::kill(pid, sig) {
                tracing::debug!(pid = %pid, %errno, signal = ?sig, "signal failed");
            }
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("pty_open", &self.master.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Result of checking a registered child for exit.
#[derive(Debug)]
pub enum ExitPoll {
    Running,
    Exited(ExitStatus),
    /// No entry: someone else (cancel) took ownership of the process.
    Gone,
    Failed(io::Error),
}

#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned process. Gives the handle back if the id
    /// already has a live process.
    pub fn register(&self, job_id: &str, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        match self.inner.lock() {
            Ok(mut map) => {
                if map.contains_key(job_id) {
                    return Err(handle);
                }
                map.insert(job_id.to_string(), handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Mutex poisoned registering process: {e}");
                Err(handle)
            }
        }
    }

    pub fn poll_exit(&self, job_id: &str) -> ExitPoll {
        match self.inner.lock() {
            Ok(mut map) => match map.get_mut(job_id) {
                None => ExitPoll::Gone,
                Some(handle) => match handle.try_wait() {
                    Ok(None) => ExitPoll::Running,
                    Ok(Some(status)) => ExitPoll::Exited(status),
                    Err(e) => ExitPoll::Failed(e),
                },
            },
            Err(e) => {
                tracing::error!("Mutex poisoned polling process: {e}");
                ExitPoll::Failed(io::Error::other("process registry poisoned"))
            }
        }
    }

    /// Take ownership of a job's process.
    pub fn remove(&self, job_id: &str) -> Option<ProcessHandle> {
        match self.inner.lock() {
            Ok(mut map) => map.remove(job_id),
            Err(e) => {
                tracing::error!("Mutex poisoned removing process: {e}");
                None
            }
        }
    }

    /// Take every process, e.g. at shutdown.
    pub fn drain(&self) -> Vec<(String, ProcessHandle)> {
        match self.inner.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(e) => {
                tracing::error!("Mutex poisoned draining processes: {e}");
                Vec::new()
            }
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(job_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
