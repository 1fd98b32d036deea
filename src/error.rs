pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by a worker factory.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle and usage errors, returned synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("pool already started")]
    AlreadyStarted,

    #[error("worker creation failed: {0}")]
    WorkerFactory(#[source] BoxError),

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("task queue is full")]
    QueueFull,

    #[error("task queue disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_usage<S: Into<String>>(msg: S) -> Self {
        Error::InvalidUsage(msg.into())
    }

    pub fn worker_factory<E: Into<BoxError>>(err: E) -> Self {
        Error::WorkerFactory(err.into())
    }
}

/// Outcome failure of a single task, delivered through its result slot.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The operation itself reported a failure.
    #[error("task failed: {0}")]
    Failed(#[source] anyhow::Error),

    /// The operation panicked; the worker caught it and kept running.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("task cancelled")]
    Cancelled,

    #[error("task deadline exceeded")]
    DeadlineExceeded,
}

impl TaskError {
    /// Maps an operation error into an outcome, keeping `TaskError`s that
    /// were propagated through `anyhow` (e.g. from `CancelToken::check`).
    pub(crate) fn from_operation(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => TaskError::Failed(err),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::DeadlineExceeded)
    }
}
