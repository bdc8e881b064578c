//! Clock contract
//!
//! The scheduling interface every clock implements. Tempo conversions have
//! identity defaults so a clock without a tempo (the system clock) only has
//! to provide scheduling and `now`.

use crate::error::ClockResult;
use crate::task::TaskRef;

/// Floored modulo: the result has the sign of `b`.
pub fn floor_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Round `x` up to the next multiple of `quant`. A zero `quant` leaves `x` as is.
pub fn round_up(x: f64, quant: f64) -> f64 {
    if quant == 0.0 {
        x
    } else {
        (x / quant).ceil() * quant
    }
}

pub trait Clock {
    /// Schedule `task` at the caller's logical time plus `delta` seconds.
    fn schedule_relative(&self, delta: f64, task: TaskRef) -> ClockResult<()>;

    /// Schedule `task` at `time` seconds since the clock's epoch.
    fn schedule_absolute(&self, time: f64, task: TaskRef) -> ClockResult<()>;

    /// The calling context's logical time in seconds.
    fn now(&self) -> f64;

    fn schedule(&self, task: TaskRef) -> ClockResult<()> {
        self.schedule_relative(0.0, task)
    }

    fn play(&self, task: TaskRef) -> ClockResult<()> {
        self.schedule(task)
    }

    // Tempo compatibility. Without a tempo, one beat is one second.

    fn beats(&self) -> f64 {
        self.now()
    }

    fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats
    }

    fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds
    }

    fn beats_to_bars(&self, _beats: f64) -> f64 {
        0.0
    }

    fn bars_to_beats(&self, _bars: f64) -> f64 {
        0.0
    }

    fn time_to_next_beat(&self, _quant: f64) -> f64 {
        0.0
    }

    /// Next point on a grid of spacing `quant`, offset by `phase`.
    /// With `quant == 0` there is no grid and the result is `beats() + phase`.
    fn next_time_on_grid(&self, quant: f64, phase: f64) -> f64 {
        let beats = self.beats();
        if quant == 0.0 {
            return beats + phase;
        }
        let phase = if phase < 0.0 {
            floor_mod(phase, quant)
        } else {
            phase
        };
        round_up(beats - floor_mod(phase, quant), quant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClockError;
    use parking_lot::Mutex;

    /// A clock frozen at a given time that records what it was asked to do.
    struct ManualClock {
        now: f64,
        scheduled: Mutex<Vec<(f64, TaskRef)>>,
    }

    impl ManualClock {
        fn at(now: f64) -> Self {
            Self {
                now,
                scheduled: Mutex::new(Vec::new()),
            }
        }
    }

    impl Clock for ManualClock {
        fn schedule_relative(&self, delta: f64, task: TaskRef) -> ClockResult<()> {
            self.schedule_absolute(self.now + delta, task)
        }

        fn schedule_absolute(&self, time: f64, task: TaskRef) -> ClockResult<()> {
            if !time.is_finite() {
                return Err(ClockError::InvalidSchedule {
                    time,
                    task: task.to_string(),
                });
            }
            self.scheduled.lock().push((time, task));
            Ok(())
        }

        fn now(&self) -> f64 {
            self.now
        }
    }

    #[test]
    fn test_floor_mod() {
        assert_eq!(floor_mod(5.0, 4.0), 1.0);
        assert_eq!(floor_mod(-1.0, 4.0), 3.0);
        assert_eq!(floor_mod(-4.0, 4.0), 0.0);
        assert_eq!(floor_mod(1.5, -4.0), -2.5);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(5.0, 4.0), 8.0);
        assert_eq!(round_up(8.0, 4.0), 8.0);
        assert_eq!(round_up(-1.0, 4.0), 0.0);
        assert_eq!(round_up(3.3, 0.0), 3.3);
    }

    #[test]
    fn test_grid_next_multiple() {
        let clock = ManualClock::at(5.0);
        assert_eq!(clock.next_time_on_grid(4.0, 0.0), 8.0);
        assert_eq!(clock.next_time_on_grid(1.0, 0.0), 5.0);
    }

    #[test]
    fn test_grid_without_quant() {
        let clock = ManualClock::at(5.0);
        assert_eq!(clock.next_time_on_grid(0.0, 2.0), 7.0);
        assert_eq!(clock.next_time_on_grid(0.0, -2.0), 3.0);
    }

    #[test]
    fn test_grid_with_phase() {
        let clock = ManualClock::at(5.0);
        // roundup(5 - 1, 4)
        assert_eq!(clock.next_time_on_grid(4.0, 1.0), 4.0);
        // -1 normalises to 3: roundup(5 - 3, 4)
        assert_eq!(clock.next_time_on_grid(4.0, -1.0), 4.0);
        // phase larger than quant wraps: 6 mod 4 = 2
        assert_eq!(clock.next_time_on_grid(4.0, 6.0), 4.0);
    }

    #[test]
    fn test_tempo_stubs() {
        let clock = ManualClock::at(2.5);
        assert_eq!(clock.beats(), 2.5);
        assert_eq!(clock.beats_to_seconds(3.0), 3.0);
        assert_eq!(clock.seconds_to_beats(3.0), 3.0);
        assert_eq!(clock.beats_to_bars(8.0), 0.0);
        assert_eq!(clock.bars_to_beats(2.0), 0.0);
        assert_eq!(clock.time_to_next_beat(1.0), 0.0);
    }

    #[test]
    fn test_schedule_is_relative_zero() {
        let clock = ManualClock::at(5.0);
        let task = TaskRef::once(|| Ok(()));
        clock.schedule(task.clone()).unwrap();
        clock.play(task.clone()).unwrap();

        let scheduled = clock.scheduled.lock();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled.iter().all(|(t, r)| *t == 5.0 && *r == task));
    }

    #[test]
    fn test_relative_negative_and_infinite() {
        let clock = ManualClock::at(5.0);
        clock
            .schedule_relative(-1.0, TaskRef::once(|| Ok(())))
            .unwrap();
        assert_eq!(clock.scheduled.lock()[0].0, 4.0);

        let err = clock
            .schedule_relative(f64::INFINITY, TaskRef::once(|| Ok(())))
            .unwrap_err();
        assert!(matches!(err, ClockError::InvalidSchedule { .. }));
        assert_eq!(clock.scheduled.lock().len(), 1);
    }
}
