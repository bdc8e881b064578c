//! Tasks
//!
//! A task is advanced by the run loop each time it comes due, and answers
//! with the delay until its next run or with `Done`. Two stock shapes are
//! provided: a one-shot callable and a resumable routine.

use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_task_id() -> TaskId {
    TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// What a task wants after being advanced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Advance {
    /// Run again this many seconds after the current due time.
    Delay(f64),
    Done,
}

/// A schedulable unit of work.
///
/// `advance` must return; a task that blocks forever stalls the run loop.
pub trait Task: Send {
    fn advance(&mut self) -> anyhow::Result<Advance>;
}

/// A callable that runs once.
pub struct OneShot<F> {
    f: Option<F>,
}

impl<F> OneShot<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> Task for OneShot<F>
where
    F: FnOnce() -> anyhow::Result<()> + Send,
{
    fn advance(&mut self) -> anyhow::Result<Advance> {
        if let Some(f) = self.f.take() {
            f()?;
        }
        Ok(Advance::Done)
    }
}

/// A resumable computation: the closure is called once per advance and keeps
/// whatever state it needs between calls.
pub struct Routine<F> {
    f: F,
}

impl<F> Routine<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Task for Routine<F>
where
    F: FnMut() -> anyhow::Result<Advance> + Send,
{
    fn advance(&mut self) -> anyhow::Result<Advance> {
        (self.f)()
    }
}

/// Process-unique task identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

struct TaskCell {
    id: TaskId,
    label: Option<String>,
    /// Where the scheduler last queued this task. Introspection only.
    next_time: Mutex<Option<f64>>,
    body: Mutex<Box<dyn Task>>,
}

/// Shared handle to a task. Clones refer to the same task; equality and
/// hashing go by identity.
#[derive(Clone)]
pub struct TaskRef(Arc<TaskCell>);

impl TaskRef {
    pub fn new(task: impl Task + 'static) -> Self {
        Self::build(None, Box::new(task))
    }

    /// Like [`TaskRef::new`], with a label used in logs and errors.
    pub fn named(label: impl Into<String>, task: impl Task + 'static) -> Self {
        Self::build(Some(label.into()), Box::new(task))
    }

    /// A task that runs `f` once.
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(OneShot::new(f))
    }

    /// A task that calls `f` on every advance.
    pub fn routine<F>(f: F) -> Self
    where
        F: FnMut() -> anyhow::Result<Advance> + Send + 'static,
    {
        Self::new(Routine::new(f))
    }

    fn build(label: Option<String>, body: Box<dyn Task>) -> Self {
        Self(Arc::new(TaskCell {
            id: next_task_id(),
            label,
            next_time: Mutex::new(None),
            body: Mutex::new(body),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn label(&self) -> Option<&str> {
        self.0.label.as_deref()
    }

    /// The logical time this task is currently queued for, if it is queued.
    pub fn next_time(&self) -> Option<f64> {
        *self.0.next_time.lock()
    }

    pub(crate) fn set_next_time(&self, time: Option<f64>) {
        *self.0.next_time.lock() = time;
    }

    pub(crate) fn advance(&self) -> anyhow::Result<Advance> {
        self.0.body.lock().advance()
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TaskRef {}

impl Hash for TaskRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.label {
            Some(label) => write!(f, "{}#{}", label, self.0.id.0),
            None => write!(f, "task#{}", self.0.id.0),
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.0.id)
            .field("label", &self.0.label)
            .field("next_time", &self.next_time())
            .finish()
    }
}
