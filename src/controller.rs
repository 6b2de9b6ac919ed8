//! Keeps a target number of workers alive, with staggered (re)starts.
//!
//! [`MultiWorkerController`] owns a fixed-identity slot array: slot `i` names worker id `i` for
//! the lifetime of the controller, even across restarts. It never spawns directly — `start_worker`
//! is supplied by the embedder (typically a thin closure around
//! [`ProcessManager::spawn`](crate::process_manager::ProcessManager::spawn)) so this module stays
//! free of fork/pipe mechanics and only deals with scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::Config;
use crate::monitor::Monitor;

/// A coarse cadence used to pace the keepalive loop when the embedder drives it directly rather
/// than relying on the process manager's own auto-tick thread.
const DEFAULT_WAIT_TICK: Duration = Duration::from_millis(500);

struct State {
    slots: Vec<Option<Arc<Monitor>>>,
    num_workers: usize,
    last_start_worker_time: Option<Instant>,
}

/// Keeps `num_workers` live [`Monitor`]s across stable, identity-preserving slots.
///
/// `S` is the embedder-supplied worker-start hook: `FnMut(usize) -> Monitor` (slot index in,
/// freshly spawned monitor out). Kept generic rather than boxed since a single controller
/// typically has exactly one start hook for its whole lifetime.
pub struct MultiWorkerController<S>
where
    S: FnMut(usize) -> Arc<Monitor>,
{
    config: Arc<Config>,
    state: Mutex<State>,
    stop_requested: AtomicBool,
    start_worker: Mutex<S>,
}

impl<S> MultiWorkerController<S>
where
    S: FnMut(usize) -> Arc<Monitor>,
{
    /// Builds a controller targeting `config.workers` slots, all initially empty.
    pub fn new(config: Arc<Config>, start_worker: S) -> Self {
        let num_workers = config.workers;
        Self {
            config,
            state: Mutex::new(State {
                slots: (0..num_workers).map(|_| None).collect(),
                num_workers,
                last_start_worker_time: None,
            }),
            stop_requested: AtomicBool::new(false),
            start_worker: Mutex::new(start_worker),
        }
    }

    /// Sets the target worker count. Growing the slot array preserves existing slot identities.
    /// Shrinking it immediately sends a graceful `send_stop` to every live occupant of the slots
    /// being dropped, in slot-index order — `keepalive` only reclaims those slots once the
    /// monitor actually reports dead, so the stop has to be raised here rather than waiting for a
    /// later pass to notice.
    pub fn scale(&self, n: usize) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let old_num_workers = state.num_workers;
        state.num_workers = n;
        if state.slots.len() < n {
            state.slots.resize_with(n, || None);
        }
        if n < old_num_workers {
            for slot in &state.slots[n..old_num_workers.min(state.slots.len())] {
                if let Some(monitor) = slot {
                    monitor.send_stop(true);
                }
            }
        }
    }

    /// Requests shutdown of every present worker. `graceful = false` skips straight to the
    /// immediate kill stage. Idempotent: subsequent calls re-signal already-stopping workers,
    /// which their own `send_stop` absorbs as a no-op.
    pub fn stop(&self, graceful: bool) {
        self.stop_requested.store(true, Ordering::Release);
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for monitor in state.slots.iter().flatten() {
            monitor.send_stop(graceful);
        }
    }

    /// Equivalent to `stop`; the restart effect itself comes from the embedder clearing
    /// `stop_requested` (by constructing a fresh `run` loop) once all slots have drained, since
    /// slot identity must be preserved across the restart boundary rather than reassigned here.
    pub fn restart(&self, graceful: bool) {
        self.stop(graceful);
    }

    /// Sends the reload signal to every present worker. Best-effort; per-worker failures are
    /// swallowed by `Monitor::send_reload`.
    pub fn reload(&self) {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for monitor in state.slots.iter().flatten() {
            monitor.send_reload();
        }
    }

    /// Runs the keepalive loop until every slot has drained to empty. Returns once `keepalive`
    /// reports zero live workers — i.e. after `stop`/`restart` has been requested and all workers
    /// have been reaped.
    pub fn run(&self) {
        loop {
            let live = self.keepalive();
            if live == 0 {
                return;
            }
            std::thread::sleep(self.wait_tick());
        }
    }

    /// One keepalive pass: counts live slots, starts replacements for empty slots still within
    /// `num_workers` (unless shutdown has been requested), and drains slots beyond the current
    /// target. Returns the resulting live count.
    pub fn keepalive(&self) -> usize {
        let num_workers = {
            let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.num_workers
        };
        let stop_requested = self.stop_requested.load(Ordering::Acquire);

        let mut live = 0;
        let slot_count = {
            let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.slots.len()
        };

        for i in 0..slot_count {
            let occupant_alive = {
                let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                state.slots[i].as_ref().map(|m| m.alive())
            };

            match occupant_alive {
                Some(true) => live += 1,
                Some(false) => {
                    if i < num_workers && !stop_requested {
                        let monitor = self.delayed_start_worker(i);
                        let mut state =
                            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        state.slots[i] = Some(monitor);
                        live += 1;
                    } else {
                        let mut state =
                            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        state.slots[i] = None;
                    }
                }
                None => {
                    if i < num_workers && !stop_requested {
                        let monitor = self.delayed_start_worker(i);
                        let mut state =
                            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        state.slots[i] = Some(monitor);
                        live += 1;
                    }
                }
            }
        }

        live
    }

    /// Waits out the configured stagger (if any) since the last spawn, then invokes the
    /// embedder's `start_worker` hook for slot `i`.
    fn delayed_start_worker(&self, i: usize) -> Arc<Monitor> {
        if self.config.start_worker_delay > Duration::ZERO {
            let base = self.config.start_worker_delay;
            let jitter_fraction = self.config.start_worker_delay_rand;
            let jitter = rand::thread_rng().gen_range(-jitter_fraction / 2.0..=jitter_fraction / 2.0);
            let delay = base.mul_f64((1.0 + jitter).max(0.0));

            let last = {
                let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                state.last_start_worker_time
            };
            if let Some(last) = last {
                let elapsed = last.elapsed();
                if elapsed < delay {
                    std::thread::sleep(delay - elapsed);
                }
            }
        }

        let monitor = (self.start_worker.lock().unwrap_or_else(std::sync::PoisonError::into_inner))(i);

        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.last_start_worker_time = Some(Instant::now());
        monitor
    }

    fn wait_tick(&self) -> Duration {
        if self.config.auto_tick {
            DEFAULT_WAIT_TICK
        } else {
            self.config.tick_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigInput;
    use std::sync::atomic::AtomicUsize;

    fn fake_monitor(config: &Arc<Config>) -> Arc<Monitor> {
        // Any pid works here: these tests never call `tick`/`send_stop` against a real signal, so
        // no syscall ever reaches the OS-facing side of `Monitor`.
        Monitor::new(nix::unistd::Pid::from_raw(999_999), config.clone(), Instant::now())
    }

    fn config_with(mutate: impl FnOnce(&mut ConfigInput)) -> Arc<Config> {
        let mut input = ConfigInput::default();
        mutate(&mut input);
        Arc::new(Config::from_input(input).unwrap())
    }

    #[test]
    fn keepalive_fills_empty_slots_up_to_num_workers() {
        let config = config_with(|c| {
            c.workers = 2;
            c.start_worker_delay = 0.0;
        });
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let spawn_count_clone = spawn_count.clone();
        let config_clone = config.clone();

        let controller = MultiWorkerController::new(config.clone(), move |_slot| {
            spawn_count_clone.fetch_add(1, Ordering::SeqCst);
            fake_monitor(&config_clone)
        });

        let live = controller.keepalive();
        assert_eq!(live, 2);
        assert_eq!(spawn_count.load(Ordering::SeqCst), 2);

        // A second pass with both slots already alive starts nothing new.
        let live_again = controller.keepalive();
        assert_eq!(live_again, 2);
        assert_eq!(spawn_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scale_down_does_not_replace_a_dead_excess_slot() {
        // A live-but-excess slot is left alone by keepalive (per-slot identity is stable); only
        // once it's no longer alive does scale-down take effect, by not respawning it.
        let config = config_with(|c| {
            c.workers = 3;
            c.start_worker_delay = 0.0;
        });
        let config_clone = config.clone();
        let sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(sleeper.id() as i32);
        let dead_slot_monitor = Monitor::new(pid, config.clone(), Instant::now());
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        // Force a reap so the monitor's liveness flag actually flips to false.
        let _ = dead_slot_monitor.try_join();
        assert!(!dead_slot_monitor.alive());

        let controller =
            MultiWorkerController::new(config.clone(), move |_slot| fake_monitor(&config_clone));
        {
            let mut state = controller.state.lock().unwrap();
            state.slots = vec![
                Some(fake_monitor(&config)),
                Some(fake_monitor(&config)),
                Some(dead_slot_monitor),
            ];
        }
        controller.scale(2);

        let live = controller.keepalive();
        assert_eq!(live, 2);
    }

    #[test]
    fn scale_down_sends_graceful_stop_to_excess_live_slots() {
        // `send_stop` only schedules the kill (the signal itself is sent from `tick`), so a fake
        // pid is harmless here; the excess worker actually dying from it is covered end-to-end in
        // tests/supervisor.rs against a real child process.
        let config = config_with(|c| c.workers = 3);
        let config_clone = config.clone();
        let controller =
            MultiWorkerController::new(config.clone(), move |_slot| fake_monitor(&config_clone));
        {
            let mut state = controller.state.lock().unwrap();
            state.slots = vec![Some(fake_monitor(&config)), Some(fake_monitor(&config))];
        }

        controller.scale(1);

        let state = controller.state.lock().unwrap();
        assert_eq!(state.num_workers, 1);
        assert!(state.slots[0].is_some());
    }

    #[test]
    fn stop_is_idempotent() {
        let config = config_with(|c| c.workers = 1);
        let config_clone = config.clone();
        let controller =
            MultiWorkerController::new(config.clone(), move |_slot| fake_monitor(&config_clone));
        controller.keepalive();
        controller.stop(true);
        controller.stop(true);
    }
}
