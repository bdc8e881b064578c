//! Wire timestamps
//!
//! The control protocol's native time tag: 64-bit fixed point, high 32 bits
//! are seconds since 1900-01-01 UTC, low 32 bits are 1/2^32 second units.
//!
//! Logical time maps onto the wire through an offset,
//! `wire = floor(elapsed * 2^32) + offset`. Arithmetic is modular in 64 bits,
//! the same way the timestamp itself wraps at the end of its era.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const SECONDS_FROM_1900_TO_1970: u64 = 2_208_988_800;
pub const SECONDS_TO_WIRE: f64 = 4_294_967_296.0;
pub const WIRE_TO_SECONDS: f64 = 1.0 / SECONDS_TO_WIRE;

/// A 32.32 fixed-point timestamp since 1900-01-01 UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireTime(pub u64);

impl WireTime {
    /// Whole seconds since 1900 (modulo the 32-bit era).
    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fraction of a second in 1/2^32 units.
    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Big-endian encoding, as it goes into a datagram.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

fn duration_to_wire(d: Duration) -> u64 {
    let frac = ((d.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (d.as_secs() << 32).wrapping_add(frac)
}

/// Wall-clock instant as a wire timestamp.
pub fn system_time_to_wire(t: SystemTime) -> WireTime {
    let epoch = SECONDS_FROM_1900_TO_1970 << 32;
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => WireTime(epoch.wrapping_add(duration_to_wire(d))),
        Err(e) => WireTime(epoch.wrapping_sub(duration_to_wire(e.duration()))),
    }
}

/// Logical seconds to wire time: `floor(elapsed * 2^32) + offset`.
pub fn elapsed_to_wire(elapsed: f64, offset: u64) -> WireTime {
    let units = (elapsed * SECONDS_TO_WIRE).floor() as i64;
    WireTime((units as u64).wrapping_add(offset))
}

/// Wire time back to logical seconds: `(wire - offset) / 2^32`.
pub fn wire_to_elapsed(wire: WireTime, offset: u64) -> f64 {
    (wire.0.wrapping_sub(offset) as i64) as f64 * WIRE_TO_SECONDS
}

/// One offset measurement.
#[derive(Clone, Copy, Debug)]
pub struct OffsetSample {
    /// Wire time of logical time zero.
    pub offset: u64,
    /// Width of the wall-clock bracket around the monotonic read.
    pub bracket: Duration,
}

/// Correlate the monotonic clock with the wall clock.
///
/// Each attempt reads the monotonic clock between two wall-clock reads and
/// takes the midpoint of the wall bracket as the matching wall instant. The
/// attempt with the narrowest bracket wins.
pub fn measure_elapsed_offset(t0: Instant, attempts: u32) -> OffsetSample {
    let mut best = sample_offset(t0);
    for _ in 1..attempts {
        let sample = sample_offset(t0);
        if sample.bracket < best.bracket {
            best = sample;
        }
    }
    best
}

fn sample_offset(t0: Instant) -> OffsetSample {
    let wall_before = SystemTime::now();
    let mono = Instant::now();
    let wall_after = SystemTime::now();

    // A wall clock stepping backwards between the reads gives an empty bracket.
    let bracket = wall_after.duration_since(wall_before).unwrap_or_default();
    let wall_mid = wall_before + bracket / 2;

    let mono_wire = duration_to_wire(mono.saturating_duration_since(t0));
    let wall_wire = system_time_to_wire(wall_mid).0;
    OffsetSample {
        offset: wall_wire.wrapping_sub(mono_wire),
        bracket,
    }
}
