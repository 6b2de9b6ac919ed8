//! A single child's health record and staged kill protocol.
//!
//! One [`Monitor`] is created per spawned child by
//! [`ProcessManager::spawn`](crate::process_manager::ProcessManager::spawn) and is shared (via
//! `Arc`) with whichever [`MultiWorkerController`](crate::controller::MultiWorkerController) slot
//! holds it. The process manager is the only thing that ticks a monitor's clock; the controller
//! only ever calls `send_stop`/`send_reload`/`alive`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::config::Config;

/// The staged kill protocol's current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillState {
    Running,
    GracefulKill,
    ImmediateKill,
    ForceKill,
    Terminal,
}

/// The outcome of a `waitpid`, in the shape the spec's reap operations return: a collected exit
/// status, "still running", or "was already gone".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The child was reaped; here is how it ended.
    Exited(ExitStatus),
    /// The child is still running (only returned by `try_join`).
    StillRunning,
    /// The pid was already cleared before this call — there was nothing to reap.
    AlreadyGone,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: i32,
    pub kind: ExitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited normally with this status code.
    Code(i32),
    /// Killed by this signal.
    Signaled(i32),
    /// The child is gone but the OS wouldn't tell us how (ECHILD/ESRCH/EPERM racing a signal or
    /// reap — see the module-level note on signal delivery races).
    Unknown,
}

struct Inner {
    pid: Option<Pid>,
    last_heartbeat_time: Instant,
    next_kill_time: Option<Instant>,
    graceful_kill_start_time: Option<Instant>,
    immediate_kill_start_time: Option<Instant>,
    kill_count: u32,
    state: KillState,
    config: Arc<Config>,
}

/// Tracks one child's liveness and drives its staged kill protocol.
///
/// `alive()` is lock-free (a single `AtomicBool`); everything else takes the inner mutex. The
/// mutex is only ever contended between the process manager's tick loop and a controller calling
/// `send_stop`/`send_reload`, both of which hold it briefly.
pub struct Monitor {
    alive: AtomicBool,
    inner: Mutex<Inner>,
}

impl Monitor {
    pub(crate) fn new(pid: Pid, config: Arc<Config>, now: Instant) -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            inner: Mutex::new(Inner {
                pid: Some(pid),
                last_heartbeat_time: now,
                next_kill_time: None,
                graceful_kill_start_time: None,
                immediate_kill_start_time: None,
                kill_count: 0,
                state: KillState::Running,
                config,
            }),
        })
    }

    /// True while the child's pid is still present — i.e. no tick or reap has cleared it yet.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Records a heartbeat received at `now`. Called only from the process manager's tick loop.
    pub(crate) fn note_heartbeat(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.last_heartbeat_time = now;
    }

    /// Requests shutdown. `graceful = true` starts the graceful stage (if not already started);
    /// `graceful = false` jumps straight to the immediate stage. Idempotent in both directions:
    /// a timestamp that is already set is never moved.
    pub fn send_stop(&self, graceful: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if graceful {
            inner.enter_graceful_kill(now);
        } else {
            inner.enter_immediate_kill(now);
        }
    }

    /// Sends the reload signal best-effort. Errors (the child already being gone) are swallowed —
    /// reload is advisory, not part of the kill protocol.
    pub fn send_reload(&self) {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(pid) = inner.pid {
            let _ = kill(pid, inner.config.reload_signal);
        }
    }

    /// Non-blocking reap (`WNOHANG`). See [`ReapOutcome`] for the three-way result.
    pub fn try_join(&self) -> ReapOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let outcome = inner.try_join();
        self.sync_alive(&inner);
        outcome
    }

    /// Blocking reap. Never returns [`ReapOutcome::StillRunning`].
    pub fn join(&self) -> ReapOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let outcome = inner.join();
        self.sync_alive(&inner);
        outcome
    }

    /// Advances the kill state machine for one tick. Returns `true` if the monitor should remain
    /// registered (pid still present), `false` once it has been reaped and dropped. Called only
    /// from the process manager's tick loop, using the single `now` sampled for that iteration.
    pub(crate) fn tick(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let keep = inner.tick(now);
        self.sync_alive(&inner);
        keep
    }

    fn sync_alive(&self, inner: &Inner) {
        self.alive.store(inner.pid.is_some(), Ordering::Release);
    }
}

impl Inner {
    fn enter_graceful_kill(&mut self, now: Instant) {
        if self.graceful_kill_start_time.is_some() {
            return;
        }
        self.graceful_kill_start_time = Some(now);
        if self.next_kill_time.is_none() {
            self.next_kill_time = Some(now);
        }
        if self.state == KillState::Running {
            self.state = KillState::GracefulKill;
        }
    }

    fn enter_immediate_kill(&mut self, now: Instant) {
        if self.immediate_kill_start_time.is_none() {
            self.immediate_kill_start_time = Some(now);
        }
        if matches!(
            self.state,
            KillState::ImmediateKill | KillState::ForceKill | KillState::Terminal
        ) {
            return;
        }
        self.state = KillState::ImmediateKill;
        self.kill_count = 0;
        self.next_kill_time = Some(now);
    }

    fn heartbeat_delay(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat_time)
    }

    fn tick(&mut self, now: Instant) -> bool {
        if self.pid.is_none() {
            return false;
        }

        match self.state {
            KillState::Running => {
                if self.heartbeat_delay(now) >= self.config.heartbeat_timeout {
                    self.enter_immediate_kill(now);
                }
            }
            KillState::GracefulKill => {
                let timed_out_by_heartbeat = self.heartbeat_delay(now) >= self.config.heartbeat_timeout;
                let timed_out_by_grace = self
                    .config
                    .graceful_kill_timeout
                    .zip(self.graceful_kill_start_time)
                    .is_some_and(|(timeout, start)| now.saturating_duration_since(start) >= timeout);
                if timed_out_by_heartbeat || timed_out_by_grace {
                    self.enter_immediate_kill(now);
                }
            }
            KillState::ImmediateKill => {
                // unwrap: immediate_kill_start_time is always set before entering this state.
                let start = self.immediate_kill_start_time.unwrap();
                if now.saturating_duration_since(start) >= self.config.immediate_kill_timeout {
                    self.state = KillState::ForceKill;
                }
            }
            KillState::ForceKill | KillState::Terminal => {}
        }

        if self.state != KillState::Running {
            if let Some(next) = self.next_kill_time {
                if now >= next {
                    self.send_kill_signal(now);
                }
            }
        }

        if self.pid.is_some() {
            let outcome = self.try_join();
            matches!(outcome, ReapOutcome::StillRunning)
        } else {
            false
        }
    }

    fn send_kill_signal(&mut self, now: Instant) {
        let Some(pid) = self.pid else { return };
        let signal = match self.state {
            KillState::GracefulKill => self.config.graceful_kill_signal,
            KillState::ImmediateKill => self.config.immediate_kill_signal,
            KillState::ForceKill => Signal::SIGKILL,
            KillState::Running | KillState::Terminal => return,
        };

        match kill(pid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH | Errno::ECHILD | Errno::EPERM) => {
                self.pid = None;
                self.state = KillState::Terminal;
                return;
            }
            Err(_) => {
                // Unexpected errno: leave the schedule as-is and retry next tick.
                return;
            }
        }

        let (interval, increment) = match self.state {
            KillState::GracefulKill => (
                self.config.graceful_kill_interval,
                self.config.graceful_kill_interval_increment,
            ),
            KillState::ImmediateKill | KillState::ForceKill => (
                self.config.immediate_kill_interval,
                self.config.immediate_kill_interval_increment,
            ),
            KillState::Running | KillState::Terminal => return,
        };

        self.next_kill_time = Some(now + interval + increment * self.kill_count);
        self.kill_count += 1;
    }

    fn try_join(&mut self) -> ReapOutcome {
        let Some(pid) = self.pid else {
            return ReapOutcome::AlreadyGone;
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => ReapOutcome::StillRunning,
            Ok(status) => {
                self.pid = None;
                self.state = KillState::Terminal;
                ReapOutcome::Exited(exit_status_from_wait(pid, &status))
            }
            Err(Errno::ECHILD | Errno::ESRCH) => {
                self.pid = None;
                self.state = KillState::Terminal;
                ReapOutcome::Exited(ExitStatus {
                    pid: pid.as_raw(),
                    kind: ExitKind::Unknown,
                })
            }
            Err(_) => ReapOutcome::StillRunning,
        }
    }

    fn join(&mut self) -> ReapOutcome {
        let Some(pid) = self.pid else {
            return ReapOutcome::AlreadyGone;
        };

        match waitpid(pid, None) {
            Ok(status) => {
                self.pid = None;
                self.state = KillState::Terminal;
                ReapOutcome::Exited(exit_status_from_wait(pid, &status))
            }
            Err(Errno::ECHILD | Errno::ESRCH | Errno::EPERM) => {
                self.pid = None;
                self.state = KillState::Terminal;
                ReapOutcome::Exited(ExitStatus {
                    pid: pid.as_raw(),
                    kind: ExitKind::Unknown,
                })
            }
            Err(_) => {
                self.pid = None;
                self.state = KillState::Terminal;
                ReapOutcome::Exited(ExitStatus {
                    pid: pid.as_raw(),
                    kind: ExitKind::Unknown,
                })
            }
        }
    }
}

fn exit_status_from_wait(pid: Pid, status: &WaitStatus) -> ExitStatus {
    let kind = match *status {
        WaitStatus::Exited(_, code) => ExitKind::Code(code),
        WaitStatus::Signaled(_, sig, _) => ExitKind::Signaled(sig as i32),
        _ => ExitKind::Unknown,
    };
    ExitStatus {
        pid: pid.as_raw(),
        kind,
    }
}
