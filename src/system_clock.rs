//! System Clock
//!
//! The real-time clock. It owns the task queue and two threads:
//! - the run loop, which sleeps on a condition variable until the earliest
//!   deadline (or a notification) and then drains every due task;
//! - the resync worker, which keeps the logical-to-wire mapping aligned with
//!   the wall clock.
//!
//! Logical time is seconds since T0, captured at construction. Only one
//! clock may be alive per process.

use crate::clock::Clock;
use crate::config::ClockConfig;
use crate::error::{ClockError, ClockResult, TaskExecutionError};
use crate::logical_time::{self, LogicalTimeGuard};
use crate::queue::TaskQueue;
use crate::resync::{ClockEpoch, ResyncWorker};
use crate::task::{Advance, TaskRef};
use crate::wire::WireTime;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static INSTANCE_ALIVE: AtomicBool = AtomicBool::new(false);

struct State {
    queue: TaskQueue<TaskRef>,
    running: bool,
}

/// Everything the run loop shares with callers.
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    epoch: Arc<ClockEpoch>,
}

impl Shared {
    /// Queue `task` at `time` and wake the run loop if it is now due first.
    fn enqueue(&self, state: &mut State, time: f64, task: TaskRef) {
        let earlier = match state.queue.peek() {
            Ok((head, _)) => time < head,
            Err(_) => true,
        };
        task.set_next_time(Some(time));
        state.queue.add(time, task);
        // A head moved later only makes the loop wake early and wait again.
        if earlier {
            self.cond.notify_all();
        }
    }
}

/// The process-wide real-time clock.
///
/// Construct it once at startup and hand it (usually as `Arc<SystemClock>`)
/// to whatever needs to schedule. Dropping it stops both threads.
pub struct SystemClock {
    shared: Arc<Shared>,
    config: ClockConfig,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    resync: Mutex<ResyncWorker>,
}

impl SystemClock {
    /// Start a clock with the default configuration.
    pub fn new() -> ClockResult<Self> {
        Self::with_config(ClockConfig::default())
    }

    /// Start a clock. Fails with `AlreadyInitialized` while another is alive.
    pub fn with_config(config: ClockConfig) -> ClockResult<Self> {
        config.validate()?;
        if INSTANCE_ALIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClockError::AlreadyInitialized);
        }
        Self::start(config).inspect_err(|_| INSTANCE_ALIVE.store(false, Ordering::SeqCst))
    }

    fn start(config: ClockConfig) -> ClockResult<Self> {
        let epoch = Arc::new(ClockEpoch::capture(config.sync_attempts));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: TaskQueue::new(),
                running: true,
            }),
            cond: Condvar::new(),
            epoch: epoch.clone(),
        });

        let s = shared.clone();
        let run_loop = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_loop(&s))?;

        let resync = match ResyncWorker::spawn(
            format!("{}-resync", config.thread_name),
            epoch.clone(),
            config.resync_interval(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                shared.state.lock().running = false;
                shared.cond.notify_all();
                let _ = run_loop.join();
                return Err(e.into());
            }
        };

        info!(
            thread = %config.thread_name,
            elapsed_offset = epoch.offset(),
            resync_interval_secs = config.resync_interval_secs,
            "system clock started"
        );

        Ok(Self {
            shared,
            config,
            run_loop: Mutex::new(Some(run_loop)),
            resync: Mutex::new(resync),
        })
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Physical seconds since T0, independent of any pinned logical time.
    pub fn elapsed_time(&self) -> f64 {
        self.shared.epoch.elapsed()
    }

    /// The current physical time as a wire timestamp.
    pub fn wire_time(&self) -> WireTime {
        self.elapsed_to_wire(self.elapsed_time())
    }

    pub fn elapsed_to_wire(&self, elapsed: f64) -> WireTime {
        self.shared.epoch.to_wire(elapsed)
    }

    pub fn wire_to_elapsed(&self, wire: WireTime) -> f64 {
        self.shared.epoch.from_wire(wire)
    }

    /// Wire time corresponding to logical time zero.
    pub fn elapsed_offset(&self) -> u64 {
        self.shared.epoch.offset()
    }

    /// Recompute the wire offset now instead of waiting for the worker.
    pub fn resync_now(&self) {
        self.shared.epoch.resync();
    }

    /// Number of live queued tasks.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Discard every pending task without running it.
    pub fn clear(&self) {
        // Handles are released after unlocking: a task may own the last
        // `Arc<SystemClock>`, and dropping it runs `stop()`.
        let dropped = {
            let mut state = self.shared.state.lock();
            let mut dropped = Vec::with_capacity(state.queue.len());
            while let Ok((_, task)) = state.queue.pop() {
                task.set_next_time(None);
                dropped.push(task);
            }
            state.queue.clear();
            self.shared.cond.notify_all();
            dropped
        };
        debug!(dropped = dropped.len(), "cleared task queue");
    }

    /// Stop the run loop and the resync worker and wait for both. Idempotent.
    ///
    /// Called from inside a task, the run loop exits once that task returns.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                state.running = false;
                self.shared.cond.notify_all();
            }
        }

        let handle = self.run_loop.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Can't join ourselves; leave it for a later stop() or drop.
                *self.run_loop.lock() = Some(handle);
            } else if handle.join().is_err() {
                warn!("run loop panicked");
            }
        }

        self.resync.lock().stop();
        info!("system clock stopped");
    }
}

impl Clock for SystemClock {
    fn schedule_relative(&self, delta: f64, task: TaskRef) -> ClockResult<()> {
        let now = self.now();
        let time = now + delta;
        if !time.is_finite() {
            warn!(task = %task, now, delta, "rejected non-finite schedule");
            return Err(ClockError::InvalidSchedule {
                time,
                task: task.to_string(),
            });
        }
        let mut state = self.shared.state.lock();
        self.shared.enqueue(&mut state, time, task);
        Ok(())
    }

    fn schedule_absolute(&self, time: f64, task: TaskRef) -> ClockResult<()> {
        if !time.is_finite() {
            warn!(task = %task, time, "rejected non-finite schedule");
            return Err(ClockError::InvalidSchedule {
                time,
                task: task.to_string(),
            });
        }
        let mut state = self.shared.state.lock();
        self.shared.enqueue(&mut state, time, task);
        Ok(())
    }

    /// The caller's logical time: the due time of the running task on the
    /// run-loop thread, a pinned time, or else the physical elapsed time.
    fn now(&self) -> f64 {
        logical_time::logical_time().unwrap_or_else(|| self.elapsed_time())
    }
}

impl Drop for SystemClock {
    fn drop(&mut self) {
        self.stop();
        INSTANCE_ALIVE.store(false, Ordering::SeqCst);
    }
}

/// Instant at which logical time `deadline` falls due, if representable.
fn wake_instant(t0: Instant, deadline: f64) -> Option<Instant> {
    Duration::try_from_secs_f64(deadline)
        .ok()
        .and_then(|d| t0.checked_add(d))
}

fn run_loop(shared: &Shared) {
    debug!("run loop started");
    let mut state = shared.state.lock();
    loop {
        if !state.running {
            break;
        }

        // Idle: nothing queued, sleep until notified.
        let head = state.queue.peek().ok().map(|(time, _)| time);
        let deadline = match head {
            Some(time) => time,
            None => {
                shared.cond.wait(&mut state);
                continue;
            }
        };

        // Waiting: sleep until the head is due or something changes.
        let now = shared.epoch.elapsed();
        if deadline > now {
            match wake_instant(shared.epoch.t0(), deadline) {
                Some(at) => {
                    shared.cond.wait_until(&mut state, at);
                }
                None => shared.cond.wait(&mut state),
            }
            continue;
        }

        drain(shared, &mut state, now);
    }
    debug!("run loop stopped");
}

/// Run every entry due at or before `now`. `now` is sampled once per pass.
fn drain(shared: &Shared, state: &mut MutexGuard<'_, State>, now: f64) {
    while state.running {
        match state.queue.peek() {
            Ok((time, _)) if time <= now => {}
            _ => return,
        }
        let Ok((due, task)) = state.queue.pop() else {
            return;
        };
        task.set_next_time(None);

        // Tasks may schedule, so they run with the queue unlocked. A finished
        // task is dropped before relocking, since it may hold the last
        // handle to the clock.
        let next = MutexGuard::unlocked(state, move || {
            let time = advance(&task, due)?;
            Some((time, task))
        });

        if let Some((time, task)) = next {
            shared.enqueue(state, time, task);
        }
    }
}

/// Advance `task` with the thread's logical time pinned to `due`.
/// Returns when to run it again, measured from `due` so load never drifts it.
fn advance(task: &TaskRef, due: f64) -> Option<f64> {
    let result = {
        let _time = LogicalTimeGuard::enter(due);
        panic::catch_unwind(AssertUnwindSafe(|| task.advance()))
    };

    match result {
        Ok(Ok(Advance::Done)) => None,
        Ok(Ok(Advance::Delay(delay))) => {
            let next = due + delay;
            if next.is_finite() {
                Some(next)
            } else {
                report(task, due, format!("returned non-finite delay {}", delay));
                None
            }
        }
        Ok(Err(e)) => {
            report(task, due, format!("{:#}", e));
            None
        }
        Err(payload) => {
            report(task, due, format!("panicked: {}", panic_message(&*payload)));
            None
        }
    }
}

fn report(task: &TaskRef, due: f64, message: String) {
    let err = TaskExecutionError {
        task: task.to_string(),
        due,
        message,
    };
    error!(task_id = task.id().get(), due, error = %err, "task dropped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Serialises tests that need the singleton.
#[cfg(test)]
pub(crate) static TEST_CLOCK_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn fast_config() -> ClockConfig {
        ClockConfig {
            resync_interval_secs: 0.05,
            ..Default::default()
        }
    }

    #[test]
    fn test_singleton() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::new().unwrap();
        assert!(matches!(
            SystemClock::new(),
            Err(ClockError::AlreadyInitialized)
        ));
        drop(clock);
        let again = SystemClock::new().unwrap();
        assert!(again.is_running());
    }

    #[test]
    fn test_invalid_config_does_not_claim_singleton() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let bad = ClockConfig {
            sync_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            SystemClock::with_config(bad),
            Err(ClockError::Config(_))
        ));
        assert!(SystemClock::new().is_ok());
    }

    #[test]
    fn test_infinite_schedule_rejected() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::new().unwrap();
        let task = TaskRef::once(|| Ok(()));

        let err = clock
            .schedule_relative(f64::INFINITY, task.clone())
            .unwrap_err();
        assert!(matches!(err, ClockError::InvalidSchedule { .. }));
        assert!(clock
            .schedule_absolute(f64::NAN, task.clone())
            .is_err());
        assert_eq!(clock.pending(), 0);
        assert_eq!(task.next_time(), None);
    }

    #[test]
    fn test_relative_uses_pinned_time() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::new().unwrap();
        let task = TaskRef::once(|| Ok(()));

        logical_time::with_logical_time(1e6, || {
            assert_eq!(clock.now(), 1e6);
            clock.schedule_relative(-1.0, task.clone()).unwrap();
        });
        assert_eq!(task.next_time(), Some(1e6 - 1.0));
        assert_eq!(clock.pending(), 1);
    }

    #[test]
    fn test_runs_due_task() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::new().unwrap();
        let (tx, rx) = mpsc::channel();
        clock
            .schedule(TaskRef::once(move || {
                tx.send(())?;
                Ok(())
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_clear_discards_pending() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::new().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let task = TaskRef::once(move || {
            tx.send(())?;
            Ok(())
        });
        clock.schedule_relative(0.2, task.clone()).unwrap();
        assert_eq!(clock.pending(), 1);

        clock.clear();
        assert_eq!(clock.pending(), 0);
        assert_eq!(task.next_time(), None);
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::with_config(fast_config()).unwrap();
        clock.stop();
        assert!(!clock.is_running());
        clock.stop();
    }

    #[test]
    fn test_stop_from_inside_task() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = Arc::new(SystemClock::new().unwrap());
        let (tx, rx) = mpsc::channel();
        let c = clock.clone();
        clock
            .schedule(TaskRef::once(move || {
                c.stop();
                tx.send(())?;
                Ok(())
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        // The task still holds a handle until it is dropped by the loop.
        clock.stop();
        assert!(!clock.is_running());
    }

    #[test]
    fn test_wire_time_round_trip() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = SystemClock::with_config(fast_config()).unwrap();
        let t = 12.345_678;
        let back = clock.wire_to_elapsed(clock.elapsed_to_wire(t));
        assert!((back - t).abs() <= crate::wire::WIRE_TO_SECONDS * 2.0);

        let offset = clock.elapsed_offset();
        clock.resync_now();
        let drift = crate::wire::wire_to_elapsed(WireTime(clock.elapsed_offset()), offset);
        assert!(drift.abs() < 0.01, "resync moved the offset by {}s", drift);
    }

    #[test]
    fn test_oversized_resync_interval_does_not_claim_singleton() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let bad = ClockConfig {
            resync_interval_secs: 1e300,
            ..Default::default()
        };
        assert!(matches!(
            SystemClock::with_config(bad),
            Err(ClockError::Config(_))
        ));
        assert!(SystemClock::new().is_ok());
    }

    #[test]
    fn test_task_owning_last_handle_releases_singleton() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = Arc::new(SystemClock::with_config(fast_config()).unwrap());
        let (tx, rx) = mpsc::channel::<()>();
        let (ran_tx, ran_rx) = mpsc::channel();

        let owned = clock.clone();
        let task = TaskRef::routine(move || {
            // Hold on until the caller has let go of its own handle.
            rx.recv_timeout(Duration::from_secs(5))?;
            ran_tx.send(owned.is_running())?;
            Ok(Advance::Done)
        });
        clock.schedule(task).unwrap();
        drop(clock);
        tx.send(()).unwrap();
        assert!(ran_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // The run loop drops the last handle, which stops the clock and
        // frees the singleton.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match SystemClock::with_config(fast_config()) {
                Ok(next) => {
                    assert!(next.is_running());
                    break;
                }
                Err(ClockError::AlreadyInitialized) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("clock never released: {}", e),
            }
        }
    }

    #[test]
    fn test_clear_releases_task_owning_last_handle() {
        let _guard = TEST_CLOCK_LOCK.lock();
        let clock = Arc::new(SystemClock::with_config(fast_config()).unwrap());
        let owned = clock.clone();
        let task = TaskRef::once(move || {
            owned.stop();
            Ok(())
        });
        clock.schedule_relative(60.0, task).unwrap();

        // Clearing through a borrowed handle drops the queued task, then the
        // caller's handle is the last one.
        let weak = Arc::downgrade(&clock);
        clock.clear();
        assert_eq!(Arc::strong_count(&clock), 1);
        drop(clock);
        assert!(weak.upgrade().is_none());
        assert!(SystemClock::new().is_ok());
    }

    #[test]
    fn test_wake_instant_bounds() {
        let t0 = Instant::now();
        assert!(wake_instant(t0, 1.5).is_some());
        assert!(wake_instant(t0, 1e300).is_none());
        assert!(wake_instant(t0, -1.0).is_none());
    }
}
