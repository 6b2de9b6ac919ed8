//! The worker-side handle passed into a spawned child's callback.
//!
//! A [`Target`] wraps the write-end of a heartbeat pipe. Most workers never touch it directly:
//! when `auto_heartbeat` is enabled, [`ProcessManager::spawn`](crate::process_manager::ProcessManager::spawn)
//! starts a background emitter that writes on a fixed cadence for the worker's whole lifetime.
//! Workers that want to signal liveness on their own schedule call `heartbeat()` directly and can
//! disable the automatic emitter via config.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, HeartbeatErrorPolicy};

/// The single byte written per heartbeat. Content is discarded by the reader; only the fact that
/// a read succeeded counts as liveness.
const HEARTBEAT_BYTE: [u8; 1] = [0];

/// Handle to a worker's heartbeat pipe, held for the lifetime of the child process.
pub struct Target {
    write_fd: Mutex<Option<OwnedFd>>,
    config: Arc<Config>,
    emitter_started: AtomicBool,
}

impl Target {
    pub(crate) fn new(write_fd: OwnedFd, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            write_fd: Mutex::new(Some(write_fd)),
            config,
            emitter_started: AtomicBool::new(false),
        })
    }

    /// Writes one heartbeat byte. A no-op once `close()` has been called or after a prior write
    /// failure led to the configured error policy already having torn down the pipe.
    pub fn heartbeat(&self) {
        let mut guard = self.write_fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(fd) = guard.as_ref() else {
            return;
        };

        if let Err(err) = write_heartbeat(fd) {
            drop(guard);
            self.handle_heartbeat_error(&err);
        }
    }

    /// Releases the write-end of the pipe. Idempotent. After this, the parent observes EOF on the
    /// next tick and begins tearing the worker down.
    pub fn close(&self) {
        let mut guard = self.write_fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.take();
    }

    fn handle_heartbeat_error(&self, err: &std::io::Error) {
        match &self.config.abort_on_heartbeat_error {
            HeartbeatErrorPolicy::Exit => {
                tracing::error!(error = %err, "heartbeat write failed, exiting worker");
                std::process::exit(1);
            }
            HeartbeatErrorPolicy::Noop => {
                tracing::warn!(error = %err, "heartbeat write failed, continuing without heartbeats");
                self.close();
            }
            HeartbeatErrorPolicy::Callback(callback) => {
                callback(err);
            }
        }
    }

    /// Starts the background heartbeat emitter. Called once by
    /// [`ProcessManager::spawn`](crate::process_manager::ProcessManager::spawn) when
    /// `auto_heartbeat` is enabled; a second call is a no-op.
    pub(crate) fn start_heartbeat_emitter(self: Arc<Self>) {
        if self.emitter_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let interval = self.config.heartbeat_interval.max(Duration::from_millis(1));
        std::thread::spawn(move || {
            loop {
                self.heartbeat();
                if self.write_fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_none() {
                    break;
                }
                std::thread::sleep(interval);
            }
        });
    }
}

fn write_heartbeat(fd: &OwnedFd) -> io::Result<()> {
    nix::unistd::write(fd, &HEARTBEAT_BYTE)
        .map(|_| ())
        .map_err(io::Error::from)
}
