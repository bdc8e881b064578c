//! Wake-up Jitter Demo
//!
//! Runs a routine on the system clock that yields a fixed interval N times
//! and measures how late each wake-up is relative to its logical due time.
//! Also shows the wire timestamp each tick would carry in an outgoing bundle.
//!
//! Usage:
//!   cargo run --bin jitter_demo -- --count 100 --interval 0.1
//!   cargo run --bin jitter_demo -- --config clock.toml
//!
//! Set RUST_LOG=debug to see every tick and every wire-offset resync.

use logical_clock::{Advance, Clock, ClockConfig, SystemClock, TaskRef};
use parking_lot::Mutex;
use spin_sleep::SpinSleeper;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lateness statistics, in seconds (positive = woke after the due time).
#[derive(Default)]
struct Jitter {
    samples: Vec<f64>,
}

impl Jitter {
    fn max(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    fn min(&self) -> f64 {
        self.samples.iter().copied().fold(f64::INFINITY, f64::min)
    }

    fn mean_abs(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.abs()).sum::<f64>() / self.samples.len() as f64
    }
}

fn print_usage() {
    println!("Usage: jitter_demo [--count N] [--interval SECONDS] [--config FILE]");
    println!();
    println!("  --count, -n      number of ticks (default 100)");
    println!("  --interval, -i   seconds between ticks (default 0.1)");
    println!("  --config, -c     clock configuration in TOML");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 100;
    let mut interval: f64 = 0.1;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-n" => {
                i += 1;
                if i < args.len() {
                    count = args[i].parse()?;
                }
            }
            "--interval" | "-i" => {
                i += 1;
                if i < args.len() {
                    interval = args[i].parse()?;
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                anyhow::bail!("unknown argument {}", other);
            }
        }
        i += 1;
    }

    if count == 0 || !interval.is_finite() || interval <= 0.0 {
        anyhow::bail!("--count must be positive and --interval a positive number of seconds");
    }

    let config = match &config_path {
        Some(path) => ClockConfig::from_file(path)?,
        None => ClockConfig::default(),
    };

    let clock = Arc::new(SystemClock::with_config(config)?);
    info!(count, interval, "measuring wake-up jitter");

    let jitter = Arc::new(Mutex::new(Jitter::default()));
    let done = Arc::new(AtomicBool::new(false));

    let weak = Arc::downgrade(&clock);
    let j = jitter.clone();
    let d = done.clone();
    let mut remaining = count;
    let ticker = TaskRef::named(
        "ticker",
        logical_clock::Routine::new(move || -> anyhow::Result<Advance> {
            let clock = weak
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("clock dropped"))?;
            let due = clock.now();
            let late = clock.elapsed_time() - due;
            let stamp = clock.elapsed_to_wire(due);
            debug!(
                due,
                late_us = late * 1e6,
                wire_secs = stamp.seconds(),
                wire_frac = stamp.fraction(),
                "tick"
            );
            j.lock().samples.push(late);

            remaining -= 1;
            if remaining == 0 {
                d.store(true, Ordering::Release);
                Ok(Advance::Done)
            } else {
                Ok(Advance::Delay(interval))
            }
        }),
    );
    clock.schedule_relative(interval, ticker)?;

    // Poll for completion without burning a core.
    let sleeper = SpinSleeper::default();
    let deadline = Instant::now() + Duration::from_secs_f64(interval * (count as f64 + 2.0) + 5.0);
    while !done.load(Ordering::Acquire) && Instant::now() < deadline {
        sleeper.sleep(Duration::from_millis(10));
    }
    clock.stop();

    let jitter = jitter.lock();
    if jitter.samples.len() < count {
        anyhow::bail!(
            "only {} of {} ticks ran before the deadline",
            jitter.samples.len(),
            count
        );
    }

    let max = jitter.max();
    let min = jitter.min();
    println!("ticks:          {}", jitter.samples.len());
    println!("max late:       {:.1} us", max * 1e6);
    println!("min late:       {:.1} us", min * 1e6);
    println!("peak-to-peak:   {:.1} us", (max - min) * 1e6);
    println!("mean |late|:    {:.1} us", jitter.mean_abs() * 1e6);
    println!("wire now:       {:#018x}", clock.wire_time().0);

    Ok(())
}
