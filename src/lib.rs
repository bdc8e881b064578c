//! Logical Clock
//!
//! A logical-time task scheduler for driving timed control messages:
//! - Time-ordered task queue with stable FIFO tie-breaking and lazy deletion
//! - A real-time clock whose run loop sleeps exactly until the next deadline
//! - Drift-free rescheduling (delays count from the due time, not the wake time)
//! - Wire timestamps (32.32 fixed point since 1900) kept in step with the wall clock

pub mod error;
pub mod queue;
pub mod task;
pub mod clock;
pub mod logical_time;
pub mod wire;
pub mod config;
mod resync;
pub mod system_clock;


pub use clock::Clock;
pub use config::ClockConfig;
pub use error::{ClockError, ClockResult, QueueError, TaskExecutionError};
pub use logical_time::{logical_time, with_logical_time};
pub use queue::TaskQueue;
pub use system_clock::SystemClock;
pub use task::{Advance, OneShot, Routine, Task, TaskId, TaskRef};
pub use wire::WireTime;
