//! Background work: consolidation and sweep threads.
//!
//! ```text
//!            start                 finished
//!   Idle ───────────► Running ───────────────► (joined by poll)
//!    ▲                 │  │                          │
//!    │  cancel_and_wait│  └── take_result ◄── Completed(T)
//!    └─────────────────┘
//! ```
//!
//! A [`BackgroundTask`] holds at most one running job; starting a second
//! one while the first is running or its result is unclaimed is refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::CancellationToken;

enum TaskState<T> {
    Idle,
    Running {
        handle: JoinHandle<T>,
        cancel: CancellationToken,
    },
    Completed(T),
}

/// One background job slot.
pub struct BackgroundTask<T> {
    name: &'static str,
    state: Mutex<TaskState<T>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(TaskState::Idle),
        }
    }

    /// Spawns `job` if the slot is idle. Returns `Ok(false)` when a job is
    /// running or its result has not been taken yet.
    pub fn start<F>(&self, job: F) -> std::io::Result<bool>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let mut state = self.state.lock();
        if !matches!(*state, TaskState::Idle) {
            return Ok(false);
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tstore-{}", self.name))
            .spawn(move || job(token))?;
        *state = TaskState::Running { handle, cancel };
        Ok(true)
    }

    /// Moves a finished job to `Completed`.
    fn poll(&self, state: &mut TaskState<T>) {
        let finished = matches!(state, TaskState::Running { handle, .. } if handle.is_finished());
        if !finished {
            return;
        }
        if let TaskState::Running { handle, .. } = std::mem::replace(state, TaskState::Idle) {
            *state = TaskState::Completed(join(self.name, handle));
        }
    }

    pub fn is_idle(&self) -> bool {
        let mut state = self.state.lock();
        self.poll(&mut state);
        matches!(*state, TaskState::Idle)
    }

    pub fn is_running(&self) -> bool {
        let mut state = self.state.lock();
        self.poll(&mut state);
        matches!(*state, TaskState::Running { .. })
    }

    /// The result of a finished job, leaving the slot idle. `None` while
    /// the job runs or when nothing ran.
    pub fn take_result(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.poll(&mut state);
        match std::mem::replace(&mut *state, TaskState::Idle) {
            TaskState::Completed(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Blocks until the running job finishes. Its result stays claimable
    /// through [`take_result`](Self::take_result).
    pub fn wait(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, TaskState::Idle) {
            TaskState::Running { handle, .. } => {
                *state = TaskState::Completed(join(self.name, handle));
            }
            other => *state = other,
        }
    }

    /// Cancels the running job and waits for it. Any result, finished or
    /// not, is returned and the slot goes back to idle.
    pub fn cancel_and_wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, TaskState::Idle) {
            TaskState::Running { handle, cancel } => {
                cancel.cancel();
                Some(join(self.name, handle))
            }
            TaskState::Completed(result) => Some(result),
            TaskState::Idle => None,
        }
    }
}

fn join<T>(name: &str, handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(task = name, "background task panicked");
            std::panic::resume_unwind(panic)
        }
    }
}

impl<T> std::fmt::Debug for BackgroundTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.state.lock() {
            TaskState::Idle => "idle",
            TaskState::Running { .. } => "running",
            TaskState::Completed(_) => "completed",
        };
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

/// Sweep thread guarded by an in-progress flag.
pub struct SweepTask {
    in_progress: AtomicBool,
    current: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SweepTask {
    pub fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Starts `job` unless a sweep is already running. The flag is cleared
    /// when `job` returns.
    pub fn try_start_sweep<F>(self: &std::sync::Arc<Self>, job: F) -> bool
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut current = self.current.lock();
        // Reap the handle of the previous, finished sweep.
        if let Some((_, handle)) = current.take() {
            let _ = handle.join();
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = std::sync::Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("tstore-sweep".into())
            .spawn(move || {
                job(&token);
                task.in_progress.store(false, Ordering::Release);
            });
        match spawned {
            Ok(handle) => {
                *current = Some((cancel, handle));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn sweep thread");
                self.in_progress.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Cancels a running sweep and waits for it.
    pub fn cancel_sweep(&self) {
        let taken = self.current.lock().take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if handle.join().is_err() {
                tracing::error!("sweep thread panicked");
            }
        }
    }

    /// Waits for a running sweep to finish on its own.
    pub fn wait(&self) {
        let taken = self.current.lock().take();
        if let Some((_, handle)) = taken {
            if handle.join().is_err() {
                tracing::error!("sweep thread panicked");
            }
        }
    }
}

impl Default for SweepTask {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SweepTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepTask")
            .field("in_progress", &self.is_in_progress())
            .finish()
    }
}
