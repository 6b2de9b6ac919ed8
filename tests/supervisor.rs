//! End-to-end coverage across `ProcessManager` and `MultiWorkerController` together, using real
//! forked children rather than fakes — the fork/pipe/signal plumbing only fails in ways a mock
//! can't reproduce.

use std::sync::Arc;
use std::time::{Duration, Instant};

use supervisor::{Config, ConfigInput, MultiWorkerController, ProcessManager};

fn config(mutate: impl FnOnce(&mut ConfigInput)) -> Config {
    let mut input = ConfigInput {
        auto_tick: false,
        ..ConfigInput::default()
    };
    mutate(&mut input);
    Config::from_input(input).unwrap()
}

/// Runs `manager.tick` in a loop, on the caller's thread, until `deadline` elapses or `done`
/// reports true. Stands in for the embedder's own tick-driving loop when `auto_tick` is off.
fn pump_ticks(manager: &ProcessManager, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return;
        }
        let _ = manager.tick(Duration::from_millis(20));
    }
}

#[test]
fn heartbeating_worker_stays_alive_across_many_ticks() {
    let cfg = config(|c| c.heartbeat_timeout = 2.0);
    let manager = ProcessManager::new(cfg).unwrap();

    let monitor = manager
        .spawn(|target| {
            for _ in 0..5 {
                target.heartbeat();
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        })
        .unwrap();

    pump_ticks(&manager, Duration::from_millis(300), || !monitor.alive());
    assert!(monitor.alive());
}

#[test]
fn silent_worker_is_killed_after_heartbeat_timeout() {
    // The child never calls `target.heartbeat()` and auto_heartbeat is off, so it looks dead
    // from the very first tick once heartbeat_timeout elapses.
    let cfg = config(|c| {
        c.heartbeat_timeout = 0.1;
        c.auto_heartbeat = false;
        c.immediate_kill_timeout = 0.2;
    });
    let manager = ProcessManager::new(cfg).unwrap();

    let monitor = manager
        .spawn(|_target| {
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        })
        .unwrap();

    pump_ticks(&manager, Duration::from_secs(3), || !monitor.alive());
    assert!(!monitor.alive());
}

#[test]
fn graceful_stop_on_cooperative_worker_reaps_quickly() {
    let cfg = config(|c| {
        c.heartbeat_timeout = 60.0;
        c.graceful_kill_interval = 0.05;
        c.graceful_kill_interval_increment = 0.05;
    });
    let manager = ProcessManager::new(cfg).unwrap();

    let monitor = manager
        .spawn(|target| {
            // Never installs a SIGTERM handler, so the graceful signal's default action (process
            // termination) reaps it well before this sleep would otherwise return.
            target.heartbeat();
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap();

    monitor.send_stop(true);
    pump_ticks(&manager, Duration::from_secs(2), || !monitor.alive());
    assert!(!monitor.alive());
}

#[test]
fn eof_from_clean_exit_is_observed_within_one_tick_cycle() {
    let cfg = config(|c| c.heartbeat_timeout = 5.0);
    let manager = ProcessManager::new(cfg).unwrap();

    let monitor = manager.spawn(|_target| Ok(())).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    pump_ticks(&manager, Duration::from_secs(1), || !monitor.alive());
    assert!(!monitor.alive());
}

#[test]
fn close_stops_accepting_new_spawns() {
    let cfg = config(|_| {});
    let manager = ProcessManager::new(cfg).unwrap();
    manager.close();

    let result = manager.spawn(|_target| Ok(()));
    assert!(result.is_err());
}

#[test]
fn controller_keeps_n_workers_alive_and_scales_down() {
    let cfg = Arc::new(config(|c| {
        c.workers = 2;
        c.heartbeat_timeout = 60.0;
        c.start_worker_delay = 0.0;
    }));
    let manager = ProcessManager::new((*cfg).clone()).unwrap();
    let manager_for_hook = manager.clone();

    let controller = MultiWorkerController::new(cfg.clone(), move |_slot| {
        manager_for_hook
            .spawn(|target| {
                loop {
                    target.heartbeat();
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
            .unwrap()
    });

    let live = controller.keepalive();
    assert_eq!(live, 2);

    // Drive the manager's tick loop briefly so liveness stays fresh, then scale down to 1: slot 1
    // gets a graceful send_stop right away (the loop worker has no signal handler, so SIGTERM's
    // default action reaps it quickly) while slot 0 is left untouched.
    pump_ticks(&manager, Duration::from_millis(200), || false);
    controller.scale(1);

    pump_ticks(&manager, Duration::from_secs(2), || false);
    let live_after = controller.keepalive();
    assert_eq!(live_after, 1);
}

#[test]
fn staggered_starts_respect_the_configured_delay() {
    let cfg = Arc::new(config(|c| {
        c.workers = 3;
        c.start_worker_delay = 0.1;
        c.start_worker_delay_rand = 0.0;
    }));
    let manager = ProcessManager::new((*cfg).clone()).unwrap();
    let manager_for_hook = manager.clone();
    let start_times = Arc::new(std::sync::Mutex::new(Vec::new()));
    let start_times_for_hook = start_times.clone();

    let controller = MultiWorkerController::new(cfg.clone(), move |_slot| {
        start_times_for_hook.lock().unwrap().push(Instant::now());
        manager_for_hook.spawn(|_target| Ok(())).unwrap()
    });

    controller.keepalive();

    let times = start_times.lock().unwrap();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(90), "gap was {gap:?}");
    }
}
