//! Error types returned by the public supervisor API.
//!
//! Per-child failures (a signal landing on an already-reaped pid, a pipe read racing an EOF) are
//! contained where they occur and never surface here — see [`crate::monitor`] and
//! [`crate::process_manager`] for the internal outcomes those paths produce instead.

use thiserror::Error;

/// A config value failed validation before the supervisor could start.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A signal name did not resolve to a known POSIX signal.
    #[error("invalid signal name: {0:?}")]
    InvalidSignal(String),

    /// `workers` must be at least 1; a pool of zero workers is not meaningful.
    #[error("workers must be at least 1, got {0}")]
    ZeroWorkers(usize),

    /// `start_worker_delay_rand` is a relative jitter fraction and must stay in `[0, 2]` so the
    /// computed delay never goes negative.
    #[error("start_worker_delay_rand must be within [0, 2], got {0}")]
    InvalidJitter(f64),

    /// `abort_on_heartbeat_error` was neither a boolean flag nor a callback.
    #[error("abort_on_heartbeat_error must be a bool or a callback, got {0:?}")]
    InvalidHeartbeatErrorPolicy(String),
}

/// Errors returned by [`crate::process_manager::ProcessManager`] operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A config value failed validation at construction time.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// `tick` was called after `close`; this is the expected way an auto-tick loop ends, not a
    /// failure of the supervisor itself.
    #[error("process manager is already closed")]
    AlreadyClosed,

    /// An I/O error that the tick loop could not contain to a single child (failure to create
    /// the poll instance, register a pipe, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `fork` itself failed (resource exhaustion is the common real-world cause).
    #[error("failed to fork worker process: {0}")]
    Fork(#[source] nix::Error),
}

impl SupervisorError {
    /// True if this is the expected shutdown signal rather than an unexpected failure.
    #[must_use]
    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }
}
