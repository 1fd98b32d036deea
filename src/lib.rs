//! workpool - a fixed-size worker pool for blocking, fallible tasks.
//!
//! Producers wrap work in a [`Task`], submit it to a [`Pool`] and later block
//! on [`Task::wait_for_result`]. The pool hands tasks to a fixed set of worker
//! threads through a bounded intake, so a full intake pushes back on
//! producers instead of dropping work.
//!
//! # Quick Start
//!
//! ```no_run
//! use workpool::prelude::*;
//!
//! let config = PoolConfig::builder().num_workers(4).queue_size(10).build()?;
//! let mut pool = Pool::new(config)?;
//! pool.start()?;
//!
//! let task = Task::new(|| Ok(21 * 2));
//! pool.add_task(&task);
//! assert_eq!(task.wait_for_result()?, 42);
//!
//! pool.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Semantics
//!
//! - Every submitted task runs at most once, on exactly one worker.
//! - A failing or panicking task only affects its own outcome; the worker
//!   that ran it keeps draining the intake.
//! - Cancellation is cooperative: cancellation-aware tasks receive a
//!   [`CancelToken`] and decide themselves when to give up.
//! - [`Pool::stop`] never waits for running tasks. Wait on the tasks, or use
//!   [`Pool::stop_and_join`].

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod telemetry;

// Re-export key types at crate root
pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{Error, Result, TaskError};
pub use executor::{CancelToken, Pool, Submitter, Task};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_basic_pool_roundtrip() {
        let mut pool = Pool::new(PoolConfig::default()).unwrap();
        pool.start().unwrap();

        let task = Task::new(|| Ok("hello"));
        pool.add_task(&task);
        assert_eq!(task.wait_for_result().unwrap(), "hello");

        pool.stop_and_join();
    }

    #[test]
    fn test_every_task_runs_once() {
        let config = PoolConfig::builder().num_workers(4).build().unwrap();
        let mut pool = Pool::new(config).unwrap();
        pool.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        pool.add_tasks(&tasks);
        for task in &tasks {
            task.wait_for_result().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);

        pool.stop_and_join();
    }
}
