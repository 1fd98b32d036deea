//! Task execution infrastructure.
//!
//! Tasks, cancellation tokens, worker threads, the fault barrier they run
//! tasks behind, and the pool that owns the workers and the shared intake.

pub mod cancel;
pub mod panic_handler;
pub mod pool;
pub mod task;
pub mod worker;

pub use cancel::CancelToken;
pub use panic_handler::{PanicHandler, PanicInfo, PanicStrategy};
pub use pool::{Pool, Submitter};
pub use task::{ExecutionMode, Outcome, Task, TaskId};
pub use worker::{Intake, StopMode, Stopper, TaskWorker, Worker, WorkerId, WorkerState};
