//! Wall-clock resynchronization
//!
//! The epoch holds T0 (fixed at construction) and the wire offset. A worker
//! thread recomputes the offset periodically so wall-clock corrections are
//! tracked. It never touches T0 or the task queue, so logical schedule times
//! are not perturbed.

use crate::wire::{self, OffsetSample, WireTime};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// T0 and the current mapping from logical time to wire time.
pub(crate) struct ClockEpoch {
    t0: Instant,
    elapsed_offset: AtomicU64,
    sync_attempts: u32,
}

impl ClockEpoch {
    /// Capture T0 now and measure the initial offset.
    pub(crate) fn capture(sync_attempts: u32) -> Self {
        let t0 = Instant::now();
        let sample = wire::measure_elapsed_offset(t0, sync_attempts);
        Self {
            t0,
            elapsed_offset: AtomicU64::new(sample.offset),
            sync_attempts,
        }
    }

    pub(crate) fn t0(&self) -> Instant {
        self.t0
    }

    /// Physical seconds since T0.
    pub(crate) fn elapsed(&self) -> f64 {
        self.t0.elapsed().as_secs_f64()
    }

    pub(crate) fn offset(&self) -> u64 {
        self.elapsed_offset.load(Ordering::Acquire)
    }

    pub(crate) fn to_wire(&self, elapsed: f64) -> WireTime {
        wire::elapsed_to_wire(elapsed, self.offset())
    }

    pub(crate) fn from_wire(&self, wire: WireTime) -> f64 {
        wire::wire_to_elapsed(wire, self.offset())
    }

    /// Re-measure and publish the offset. Returns the new sample.
    pub(crate) fn resync(&self) -> OffsetSample {
        let sample = wire::measure_elapsed_offset(self.t0, self.sync_attempts);
        let prev = self.elapsed_offset.swap(sample.offset, Ordering::AcqRel);
        let drift = wire::wire_to_elapsed(WireTime(sample.offset), prev);
        debug!(
            offset = sample.offset,
            drift_secs = drift,
            bracket_ns = sample.bracket.as_nanos() as u64,
            "resynced wire offset"
        );
        sample
    }
}

struct Signal {
    stop: Mutex<bool>,
    cond: Condvar,
}

/// Background thread running [`ClockEpoch::resync`] every `interval`.
pub(crate) struct ResyncWorker {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl ResyncWorker {
    pub(crate) fn spawn(
        name: String,
        epoch: Arc<ClockEpoch>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        let s = signal.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(&s, &epoch, interval))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Wake the worker, ask it to exit and join it. Idempotent.
    pub(crate) fn stop(&mut self) {
        {
            let mut stop = self.signal.stop.lock();
            *stop = true;
            self.signal.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resync worker panicked");
            }
        }
    }
}

impl Drop for ResyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(signal: &Signal, epoch: &ClockEpoch, interval: Duration) {
    info!(interval_secs = interval.as_secs_f64(), "resync worker started");
    loop {
        {
            let mut stop = signal.stop.lock();
            match Instant::now().checked_add(interval) {
                Some(deadline) => {
                    while !*stop {
                        if signal.cond.wait_until(&mut stop, deadline).timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while !*stop {
                        signal.cond.wait(&mut stop);
                    }
                }
            }
            if *stop {
                break;
            }
        }
        epoch.resync();
    }
    debug!("resync worker stopped");
}
