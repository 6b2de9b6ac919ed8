//! Tunables consumed by the supervisor core.
//!
//! `Config` is a plain value type: the embedding façade is responsible for sourcing it (CLI,
//! environment, a config file) and handing the result to [`crate::process_manager::ProcessManager`]
//! and [`crate::controller::MultiWorkerController`]. This crate only validates and uses the
//! values; it never reads `std::env` or touches the filesystem itself. [`ConfigInput`] is the
//! serde-friendly half of that split — the fields a façade can plausibly deserialize from TOML or
//! similar — which [`Config::from_input`] then validates into the richer, non-serializable
//! `Config`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::error::ConfigurationError;

/// Controls which end of a heartbeat pipe survives an `exec` in either process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloexecMode {
    /// Set close-on-exec on the worker's write-end only.
    TargetOnly,
    /// Set close-on-exec on the parent's read-end only.
    MonitorOnly,
    /// Set close-on-exec on both ends.
    #[default]
    Both,
}

/// What the in-child heartbeat emitter does when a heartbeat write fails.
///
/// The `bool`/callable split in the distilled config keys collapses to this: `true` becomes
/// [`Self::Exit`], `false` becomes [`Self::Noop`], and a callback is only constructible in Rust
/// code, never from a deserialized config file.
#[derive(Clone)]
pub enum HeartbeatErrorPolicy {
    /// Exit the child process with a nonzero status. The default.
    Exit,
    /// Swallow the error and keep the worker running without further heartbeats.
    Noop,
    /// Hand the error to a caller-supplied callback.
    Callback(Arc<dyn Fn(&std::io::Error) + Send + Sync>),
}

impl std::fmt::Debug for HeartbeatErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit => f.write_str("HeartbeatErrorPolicy::Exit"),
            Self::Noop => f.write_str("HeartbeatErrorPolicy::Noop"),
            Self::Callback(_) => f.write_str("HeartbeatErrorPolicy::Callback(..)"),
        }
    }
}

impl Default for HeartbeatErrorPolicy {
    fn default() -> Self {
        Self::Exit
    }
}

/// Parses a signal name the way the config table spells it (`"TERM"`, `"QUIT"`, `"HUP"`), also
/// accepting the `SIG`-prefixed spelling nix itself produces.
pub(crate) fn parse_signal(name: &str) -> Result<Signal, ConfigurationError> {
    let candidate = if name.to_ascii_uppercase().starts_with("SIG") {
        name.to_ascii_uppercase()
    } else {
        format!("SIG{}", name.to_ascii_uppercase())
    };
    Signal::from_str(&candidate).map_err(|_| ConfigurationError::InvalidSignal(name.to_owned()))
}

/// The serde-friendly subset of [`Config`] — everything a façade could source from a
/// configuration file or environment variables. Durations are expressed in fractional seconds to
/// keep the wire format boring; `graceful_kill_timeout` follows the source convention of `< 0`
/// meaning "off" rather than an `Option`, since that's what round-trips through TOML/env cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub workers: usize,
    pub start_worker_delay: f64,
    pub start_worker_delay_rand: f64,
    pub heartbeat_interval: f64,
    pub heartbeat_timeout: f64,
    pub graceful_kill_signal: String,
    pub immediate_kill_signal: String,
    pub graceful_kill_interval: f64,
    pub graceful_kill_interval_increment: f64,
    pub graceful_kill_timeout: f64,
    pub immediate_kill_interval: f64,
    pub immediate_kill_interval_increment: f64,
    pub immediate_kill_timeout: f64,
    pub reload_signal: String,
    pub auto_tick: bool,
    pub tick_interval: f64,
    pub auto_heartbeat: bool,
    pub abort_on_heartbeat_error: bool,
    pub cloexec_mode: CloexecMode,
}

impl Default for ConfigInput {
    fn default() -> Self {
        Self {
            workers: 1,
            start_worker_delay: 0.0,
            start_worker_delay_rand: 0.2,
            heartbeat_interval: 1.0,
            heartbeat_timeout: 60.0,
            graceful_kill_signal: "TERM".to_owned(),
            immediate_kill_signal: "QUIT".to_owned(),
            graceful_kill_interval: 2.0,
            graceful_kill_interval_increment: 2.0,
            graceful_kill_timeout: -1.0,
            immediate_kill_interval: 2.0,
            immediate_kill_interval_increment: 2.0,
            immediate_kill_timeout: 60.0,
            reload_signal: "HUP".to_owned(),
            auto_tick: true,
            tick_interval: 1.0,
            auto_heartbeat: true,
            abort_on_heartbeat_error: true,
            cloexec_mode: CloexecMode::Both,
        }
    }
}

/// Resolved, validated configuration for the supervisor core.
///
/// Construct with [`Config::default`] and field assignment, or validate a [`ConfigInput`] sourced
/// elsewhere with [`Config::from_input`].
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub start_worker_delay: Duration,
    pub start_worker_delay_rand: f64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub graceful_kill_signal: Signal,
    pub immediate_kill_signal: Signal,
    pub graceful_kill_interval: Duration,
    pub graceful_kill_interval_increment: Duration,
    /// `None` means "off": graceful kill never escalates to immediate on its own.
    pub graceful_kill_timeout: Option<Duration>,
    pub immediate_kill_interval: Duration,
    pub immediate_kill_interval_increment: Duration,
    pub immediate_kill_timeout: Duration,
    pub reload_signal: Signal,
    pub auto_tick: bool,
    pub tick_interval: Duration,
    pub auto_heartbeat: bool,
    pub abort_on_heartbeat_error: HeartbeatErrorPolicy,
    pub cloexec_mode: CloexecMode,
}

impl Default for Config {
    fn default() -> Self {
        // unwrap: the built-in defaults are known-valid at compile time.
        Self::from_input(ConfigInput::default()).unwrap()
    }
}

impl Config {
    /// Validates a [`ConfigInput`] into a usable [`Config`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if `workers` is zero, `start_worker_delay_rand` is outside
    /// `[0, 2]`, or either signal name fails to resolve.
    pub fn from_input(input: ConfigInput) -> Result<Self, ConfigurationError> {
        if input.workers == 0 {
            return Err(ConfigurationError::ZeroWorkers(input.workers));
        }
        if !(0.0..=2.0).contains(&input.start_worker_delay_rand) {
            return Err(ConfigurationError::InvalidJitter(
                input.start_worker_delay_rand,
            ));
        }

        Ok(Self {
            workers: input.workers,
            start_worker_delay: Duration::from_secs_f64(input.start_worker_delay.max(0.0)),
            start_worker_delay_rand: input.start_worker_delay_rand,
            heartbeat_interval: Duration::from_secs_f64(input.heartbeat_interval.max(0.0)),
            heartbeat_timeout: Duration::from_secs_f64(input.heartbeat_timeout.max(0.0)),
            graceful_kill_signal: parse_signal(&input.graceful_kill_signal)?,
            immediate_kill_signal: parse_signal(&input.immediate_kill_signal)?,
            graceful_kill_interval: Duration::from_secs_f64(input.graceful_kill_interval.max(0.0)),
            graceful_kill_interval_increment: Duration::from_secs_f64(
                input.graceful_kill_interval_increment.max(0.0),
            ),
            graceful_kill_timeout: (input.graceful_kill_timeout > 0.0)
                .then(|| Duration::from_secs_f64(input.graceful_kill_timeout)),
            immediate_kill_interval: Duration::from_secs_f64(
                input.immediate_kill_interval.max(0.0),
            ),
            immediate_kill_interval_increment: Duration::from_secs_f64(
                input.immediate_kill_interval_increment.max(0.0),
            ),
            immediate_kill_timeout: Duration::from_secs_f64(input.immediate_kill_timeout.max(0.0)),
            reload_signal: parse_signal(&input.reload_signal)?,
            auto_tick: input.auto_tick,
            tick_interval: Duration::from_secs_f64(input.tick_interval.max(0.0)),
            auto_heartbeat: input.auto_heartbeat,
            abort_on_heartbeat_error: if input.abort_on_heartbeat_error {
                HeartbeatErrorPolicy::Exit
            } else {
                HeartbeatErrorPolicy::Noop
            },
            cloexec_mode: input.cloexec_mode,
        })
    }

    /// Overrides the heartbeat error policy with a callback. Not representable in
    /// [`ConfigInput`] since it can't be deserialized.
    #[must_use]
    pub fn with_heartbeat_error_callback(
        mut self,
        callback: Arc<dyn Fn(&std::io::Error) + Send + Sync>,
    ) -> Self {
        self.abort_on_heartbeat_error = HeartbeatErrorPolicy::Callback(callback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_signal {
        use super::*;

        #[test]
        fn accepts_bare_name() {
            assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        }

        #[test]
        fn accepts_sig_prefixed_name() {
            assert_eq!(parse_signal("SIGQUIT").unwrap(), Signal::SIGQUIT);
        }

        #[test]
        fn is_case_insensitive() {
            assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
        }

        #[test]
        fn rejects_unknown_name() {
            assert!(matches!(
                parse_signal("NOTASIGNAL"),
                Err(ConfigurationError::InvalidSignal(_))
            ));
        }
    }

    mod config_from_input {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            let config = Config::default();
            assert_eq!(config.workers, 1);
            assert!(config.graceful_kill_timeout.is_none());
        }

        #[test]
        fn rejects_zero_workers() {
            let input = ConfigInput {
                workers: 0,
                ..ConfigInput::default()
            };
            assert!(matches!(
                Config::from_input(input),
                Err(ConfigurationError::ZeroWorkers(0))
            ));
        }

        #[test]
        fn rejects_jitter_out_of_range() {
            let input = ConfigInput {
                start_worker_delay_rand: 3.0,
                ..ConfigInput::default()
            };
            assert!(matches!(
                Config::from_input(input),
                Err(ConfigurationError::InvalidJitter(_))
            ));
        }

        #[test]
        fn positive_graceful_timeout_is_some() {
            let input = ConfigInput {
                graceful_kill_timeout: 5.0,
                ..ConfigInput::default()
            };
            let config = Config::from_input(input).unwrap();
            assert_eq!(
                config.graceful_kill_timeout,
                Some(Duration::from_secs_f64(5.0))
            );
        }
    }
}
