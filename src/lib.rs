//! Core engine for a multi-worker process supervisor.
//!
//! This crate forks worker processes, tracks their liveness over an out-of-band heartbeat pipe,
//! and drives a staged signal protocol (graceful → immediate → force-kill) to bring them down.
//! [`MultiWorkerController`] keeps a configurable number of workers alive with staggered starts;
//! [`ProcessManager`] is the lower layer it sits on, owning the pipes and per-child [`Monitor`]s.
//!
//! This crate does not parse CLI arguments, read environment variables, or load config files —
//! construct a [`Config`] in-process (via `Default` plus overrides, or by deserializing a
//! [`ConfigInput`] from whatever format the embedding application already uses) and hand it to
//! [`ProcessManager::new`]. It also does not define a wire protocol beyond heartbeats, does not
//! coordinate between workers, and does not persist any state to disk.

/// Tunables and their validation.
pub mod config;
/// Keeps a target worker count alive with staggered starts.
pub mod controller;
/// Error types returned by the public API.
pub mod error;
/// Per-child health record and staged kill protocol.
pub mod monitor;
/// Forks workers and multiplexes their heartbeat pipes.
pub mod process_manager;
/// The worker-side heartbeat handle.
pub mod worker;

pub use config::{CloexecMode, Config, ConfigInput, HeartbeatErrorPolicy};
pub use controller::MultiWorkerController;
pub use error::{ConfigurationError, SupervisorError};
pub use monitor::{ExitKind, ExitStatus, Monitor, ReapOutcome};
pub use process_manager::ProcessManager;
pub use worker::Target;
