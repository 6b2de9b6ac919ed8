//! Forks workers, multiplexes their heartbeat pipes, and drives every [`Monitor`]'s clock.
//!
//! One [`ProcessManager`] owns the whole pipe set. `spawn` forks a child and registers its
//! heartbeat pipe; `tick` is the supervisor loop's single iteration — wait for pipe readiness,
//! apply heartbeats, advance every monitor's kill state machine. An optional background thread
//! (`auto_tick`) drives `tick` in a loop so an embedder never has to call it directly.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::unistd::{ForkResult, fork, pipe};

use crate::config::{CloexecMode, Config};
use crate::error::SupervisorError;
use crate::monitor::Monitor;
use crate::worker::Target;

/// The bounded chunk read from a ready pipe in one pass. Heartbeat content is discarded, so this
/// only needs to be large enough to drain a burst of heartbeats between ticks.
const READ_CHUNK: usize = 64;

/// `nix`'s errno-based errors don't carry a `#[from]` conversion into [`SupervisorError`] since
/// `Fork` is reserved for the fork syscall specifically; everything else that fails with an errno
/// (pipe creation, fcntl) is wrapped as an I/O failure instead.
fn wrap_nix_err(err: nix::Error) -> SupervisorError {
    SupervisorError::Io(io::Error::from(err))
}

struct PipeEntry {
    read_fd: OwnedFd,
    monitor: Arc<Monitor>,
}

struct Registration {
    poll: Poll,
    pipes: HashMap<Token, PipeEntry>,
    monitors: Vec<Arc<Monitor>>,
    next_token: usize,
}

/// Owns the set of spawned workers' pipes and drives their kill state machines.
///
/// Construction validates `config` into a shared, read-only `Arc<Config>` handed to every
/// [`Monitor`] it creates. See the module-level docs for the tick protocol.
pub struct ProcessManager {
    config: Arc<Config>,
    registration: Mutex<Registration>,
    closed: AtomicBool,
    auto_tick_started: AtomicBool,
}

impl ProcessManager {
    /// Builds a process manager from an already-validated config.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Io`] if the underlying poll instance cannot be created.
    pub fn new(config: Config) -> Result<Arc<Self>, SupervisorError> {
        let poll = Poll::new()?;
        let manager = Arc::new(Self {
            config: Arc::new(config),
            registration: Mutex::new(Registration {
                poll,
                pipes: HashMap::new(),
                monitors: Vec::new(),
                next_token: 0,
            }),
            closed: AtomicBool::new(false),
            auto_tick_started: AtomicBool::new(false),
        });

        if manager.config.auto_tick {
            manager.clone().start_auto_tick();
        }

        Ok(manager)
    }

    /// Forks a worker, wires up its heartbeat pipe, and returns its [`Monitor`].
    ///
    /// In the parent, the read-end is registered with the poll instance and the write-end is
    /// closed once cloexec has been applied per [`CloexecMode`]. In the child, the write-end
    /// becomes a [`Target`], an optional heartbeat emitter is started, and `worker_fn` is invoked;
    /// the child process exits from inside this call and never returns to the caller's stack
    /// frame, matching classic fork-based prefork servers.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyClosed`] if `close` has already been called, or
    /// [`SupervisorError::Fork`]/[`SupervisorError::Io`] if the pipe or fork syscalls fail. These
    /// are parent-side errors only; child-side failures never cross back into this call.
    ///
    /// # Panics
    ///
    /// Never panics in the parent. In the child, a panic inside `worker_fn` unwinds only the
    /// forked process and is reported as a nonzero exit status, not as a panic in the caller.
    pub fn spawn<F>(&self, worker_fn: F) -> Result<Arc<Monitor>, SupervisorError>
    where
        F: FnOnce(Arc<Target>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::AlreadyClosed);
        }

        let (read_fd, write_fd) = pipe().map_err(wrap_nix_err)?;
        self.apply_cloexec(&read_fd, &write_fd)?;

        // SAFETY: the child calls only async-signal-safe operations before `_exit`: it drops
        // inherited state, builds the worker-side `Target`, runs `worker_fn`, and exits. It never
        // returns into Rust's normal unwind path or touches the parent's heap allocator in a way
        // that could race with a concurrently-forking thread, beyond what the fork(2) contract
        // already allows for a single-threaded continuation until exit.
        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Child => {
                drop(read_fd);
                self.run_worker_in_child(write_fd, worker_fn);
            }
            ForkResult::Parent { child } => {
                drop(write_fd);
                let monitor = Monitor::new(child, self.config.clone(), Instant::now());
                self.register_pipe(read_fd, monitor.clone())?;
                Ok(monitor)
            }
        }
    }

    fn run_worker_in_child<F>(&self, write_fd: OwnedFd, worker_fn: F) -> !
    where
        F: FnOnce(Arc<Target>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        let target = Target::new(write_fd, self.config.clone());
        if self.config.auto_heartbeat {
            target.clone().start_heartbeat_emitter();
        }

        let exit_code = match worker_fn(target) {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(error = %err, "worker exited with an error");
                1
            }
        };

        std::process::exit(exit_code);
    }

    fn register_pipe(&self, read_fd: OwnedFd, monitor: Arc<Monitor>) -> Result<(), SupervisorError> {
        let fd = read_fd.as_raw_fd();
        let flags = fcntl::fcntl(&read_fd, FcntlArg::F_GETFL)?;
        fcntl::fcntl(
            &read_fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )?;

        let mut reg = self.registration.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = Token(reg.next_token);
        reg.next_token += 1;

        reg.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        reg.pipes.insert(token, PipeEntry { read_fd, monitor: monitor.clone() });
        reg.monitors.push(monitor);
        Ok(())
    }

    fn apply_cloexec(&self, read_fd: &OwnedFd, write_fd: &OwnedFd) -> Result<(), SupervisorError> {
        let set_cloexec = |fd: &OwnedFd| -> Result<(), SupervisorError> {
            fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            Ok(())
        };

        match self.config.cloexec_mode {
            CloexecMode::TargetOnly => set_cloexec(write_fd),
            CloexecMode::MonitorOnly => set_cloexec(read_fd),
            CloexecMode::Both => {
                set_cloexec(read_fd)?;
                set_cloexec(write_fd)
            }
        }
    }

    /// Releases all pipe read-ends and marks the manager closed. Idempotent: calling this more
    /// than once is a no-op after the first call. Subsequent `tick` calls fail with
    /// [`SupervisorError::AlreadyClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut reg = self.registration.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, entry) in reg.pipes.drain() {
            let _ = reg.poll.registry().deregister(&mut SourceFd(&entry.read_fd.as_raw_fd()));
        }
    }

    /// One iteration of the supervisor loop: wait up to `timeout` for pipe readiness, apply
    /// heartbeats, then advance every monitor's kill state machine against one shared `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyClosed`] if `close` has already been called, or
    /// [`SupervisorError::Io`] if the poll wait itself fails for a reason other than `EINTR`. Any
    /// failure scoped to a single child (a pipe read error, a dead-child signal) is contained here
    /// and never surfaces as an `Err`.
    pub fn tick(&self, timeout: Duration) -> Result<(), SupervisorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::AlreadyClosed);
        }

        let mut reg = self.registration.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if reg.pipes.is_empty() && reg.monitors.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let mut events = Events::with_capacity(reg.pipes.len().max(1));
        match reg.poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(SupervisorError::Io(e)),
        }

        let now = Instant::now();
        let ready_tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();

        for token in ready_tokens {
            let Some(entry) = reg.pipes.get(&token) else {
                continue;
            };
            let outcome = read_heartbeats(&entry.read_fd);
            match outcome {
                ReadOutcome::Heartbeat => entry.monitor.note_heartbeat(now),
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Eof | ReadOutcome::Error => {
                    let monitor = entry.monitor.clone();
                    let fd = entry.read_fd.as_raw_fd();
                    let _ = reg.poll.registry().deregister(&mut SourceFd(&fd));
                    reg.pipes.remove(&token);
                    monitor.send_stop(false);
                }
            }
        }

        reg.monitors.retain(|monitor| monitor.tick(now));
        // A monitor that exits the pipe set via EOF before its pid is cleared is ticked above
        // until it too reports dead; nothing further to reconcile against `reg.pipes` here since
        // EOF-removal already happened in the read loop.

        Ok(())
    }

    fn start_auto_tick(self: Arc<Self>) {
        if self.auto_tick_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let tick_interval = self.config.tick_interval;
        std::thread::spawn(move || loop {
            match self.tick(tick_interval) {
                Ok(()) => {}
                Err(err) if err.is_already_closed() => break,
                Err(err) => {
                    tracing::error!(error = %err, "auto-tick iteration failed");
                    break;
                }
            }
        });
    }
}

enum ReadOutcome {
    Heartbeat,
    WouldBlock,
    Eof,
    Error,
}

fn read_heartbeats(read_fd: &OwnedFd) -> ReadOutcome {
    let mut buffer = [0u8; READ_CHUNK];
    match nix::unistd::read(read_fd, &mut buffer) {
        Ok(0) => ReadOutcome::Eof,
        Ok(_) => ReadOutcome::Heartbeat,
        Err(Errno::EAGAIN | Errno::EINTR) => ReadOutcome::WouldBlock,
        Err(_) => ReadOutcome::Error,
    }
}
