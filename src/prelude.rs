pub use crate::config::{PoolConfig, PoolConfigBuilder};
pub use crate::error::{Error, Result, TaskError};
pub use crate::executor::{
    CancelToken, ExecutionMode, Pool, StopMode, Submitter, Task, TaskWorker, Worker,
    WorkerState,
};
pub use crate::telemetry::MetricsSnapshot;
