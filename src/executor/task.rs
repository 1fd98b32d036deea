//! Task representation and execution.

use super::cancel::CancelToken;
use crate::error::{Error, Result, TaskError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task's operation must be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Plain,
    Cancellable,
}

/// What a task delivers through its result slot.
pub type Outcome<T> = std::result::Result<T, TaskError>;

type PlainOp<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>;
type CancellableOp<T> = Box<dyn FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static>;

enum Operation<T> {
    Plain(PlainOp<T>),
    Cancellable(CancellableOp<T>),
}

impl<T> Operation<T> {
    fn mode(&self) -> ExecutionMode {
        match self {
            Operation::Plain(_) => ExecutionMode::Plain,
            Operation::Cancellable(_) => ExecutionMode::Cancellable,
        }
    }
}

/// Coarse classification of a delivered outcome, used for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Succeeded,
    Failed,
    Cancelled,
}

/// A unit of deferred, fallible work with a one-shot result slot.
///
/// `Task` is a cheap handle: submitting it to a pool clones the handle, and
/// the caller keeps its own copy to call [`wait_for_result`](Task::wait_for_result).
pub struct Task<T = ()> {
    inner: Arc<TaskInner<T>>,
}

struct TaskInner<T> {
    id: TaskId,
    mode: ExecutionMode,
    op: Mutex<Option<Operation<T>>>,
    token: Option<CancelToken>,
    result_tx: Sender<Outcome<T>>,
    result_rx: Receiver<Outcome<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from a plain operation.
    pub fn new<F>(op: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::build(Operation::Plain(Box::new(op)), None)
    }

    /// Create a cancellation-aware task bound to a fresh token. Use
    /// [`cancel_token`](Task::cancel_token) to abort it.
    pub fn with_cancellation<F>(op: F) -> Self
    where
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        Self::with_token(CancelToken::new(), op)
    }

    /// Create a cancellation-aware task bound to a caller-supplied token,
    /// e.g. one carrying a deadline or shared by a batch of tasks.
    pub fn with_token<F>(token: CancelToken, op: F) -> Self
    where
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        Self::build(Operation::Cancellable(Box::new(op)), Some(token))
    }

    fn build(op: Operation<T>, token: Option<CancelToken>) -> Self {
        // capacity 1: delivering never waits for the consumer
        let (result_tx, result_rx) = bounded(1);
        Task {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                mode: op.mode(),
                op: Mutex::new(Some(op)),
                token,
                result_tx,
                result_rx,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    /// The token handed to the operation; `None` for plain tasks.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.inner.token.clone()
    }

    pub fn is_executed(&self) -> bool {
        self.inner.op.lock().is_none()
    }

    /// Run a plain task on the calling thread and deliver its outcome.
    pub fn execute(&self) -> Result<()> {
        self.inner.run_with(None).map(|_| ())
    }

    /// Run a cancellation-aware task on the calling thread with `token`.
    pub fn execute_with_cancellation(&self, token: &CancelToken) -> Result<()> {
        self.inner.run_with(Some(token)).map(|_| ())
    }

    /// Block until the outcome is delivered.
    ///
    /// Single consumer: the slot is filled once, so a second call on any
    /// handle of the same task blocks forever.
    pub fn wait_for_result(&self) -> Outcome<T> {
        match self.inner.result_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => unreachable!("task owns its result sender"),
        }
    }

    /// Like [`wait_for_result`](Task::wait_for_result), giving up after `timeout`.
    pub fn wait_for_result_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.inner.result_rx.recv_timeout(timeout).ok()
    }

    /// Take the outcome if it has already been delivered.
    pub fn try_result(&self) -> Option<Outcome<T>> {
        self.inner.result_rx.try_recv().ok()
    }

    pub(crate) fn to_job(&self) -> Job {
        Job(self.inner.clone())
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("executed", &self.inner.op.lock().is_none())
            .finish()
    }
}

impl<T: Send + 'static> TaskInner<T> {
    fn run_with(&self, token: Option<&CancelToken>) -> Result<Completion> {
        let call: Box<dyn FnOnce() -> anyhow::Result<T> + '_> = {
            let mut slot = self.op.lock();
            let taken = slot.take();
            match (taken, token) {
                (None, _) => {
                    return Err(Error::invalid_usage(format!(
                        "task {} already executed",
                        self.id
                    )))
                }
                (Some(Operation::Plain(op)), None) => Box::new(move || op()),
                (Some(Operation::Cancellable(op)), Some(token)) => Box::new(move || op(token)),
                (Some(op), _) => {
                    let mode = op.mode();
                    *slot = Some(op);
                    return Err(Error::invalid_usage(format!(
                        "task {} is {:?} and cannot be executed {}",
                        self.id,
                        mode,
                        if token.is_some() { "with a cancel token" } else { "without a cancel token" },
                    )));
                }
            }
        };

        let outcome = call().map_err(TaskError::from_operation);
        let completion = match &outcome {
            Ok(_) => Completion::Succeeded,
            Err(err) if err.is_cancellation() => Completion::Cancelled,
            Err(_) => Completion::Failed,
        };
        self.deliver(outcome);
        Ok(completion)
    }

    fn deliver(&self, outcome: Outcome<T>) {
        // the slot is only ever filled once, so this cannot find it full
        let _ = self.result_tx.try_send(outcome);
    }
}

/// Type-erased view of a task, as seen by workers.
pub(crate) trait Runnable: Send + Sync {
    fn id(&self) -> TaskId;

    /// Execute in the task's construction mode, using its own token.
    fn run(&self) -> Result<Completion>;

    /// Deliver a failure that happened outside the operation's control.
    fn fail(&self, error: TaskError);
}

impl<T: Send + 'static> Runnable for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(&self) -> Result<Completion> {
        self.run_with(self.token.as_ref())
    }

    fn fail(&self, error: TaskError) {
        self.deliver(Err(error));
    }
}

/// Queue entry handed from producers to workers.
#[derive(Clone)]
pub(crate) struct Job(Arc<dyn Runnable>);

impl Job {
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    pub fn run(&self) -> Result<Completion> {
        self.0.run()
    }

    pub fn fail(&self, error: TaskError) {
        self.0.fail(error)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Job").field(&self.0.id()).finish()
    }
}
