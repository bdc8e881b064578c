//! Error types for the queue and the system clock.

use thiserror::Error;

/// Errors local to a [`TaskQueue`](crate::queue::TaskQueue).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task has no live entry in the queue")]
    TaskNotFound,

    #[error("no live entry left in the queue")]
    EmptyQueue,
}

/// Errors returned by clock construction and scheduling.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("a SystemClock instance already exists")]
    AlreadyInitialized,

    #[error("won't schedule {task} at non-finite time {time}")]
    InvalidSchedule { time: f64, task: String },

    #[error("failed to spawn clock thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid clock configuration: {0}")]
    Config(String),
}

pub type ClockResult<T> = Result<T, ClockError>;

/// A failure while advancing a task, as reported by the run loop.
///
/// Never returned to a caller: the run loop logs it and drops the task.
#[derive(Debug, Clone, Error)]
#[error("task {task} failed at due time {due}: {message}")]
pub struct TaskExecutionError {
    pub task: String,
    pub due: f64,
    pub message: String,
}
