use super::task::{Job, Task};
use super::worker::{Intake, StopMode, Stopper, TaskWorker, Worker, WorkerState};
use crate::config::PoolConfig;
use crate::error::{BoxError, Error, Result};
use crate::telemetry::{Metrics, MetricsSnapshot};
use crossbeam_channel::{bounded, SendTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fixed-size worker pool fed through a bounded intake.
///
/// Tasks may be submitted before [`start`](Pool::start): they wait in the
/// intake, and once it is full (immediately, with a queue size of 0) the
/// producer blocks until a worker takes one. Lifecycle methods take
/// `&mut self`; producers on other threads use a [`Submitter`].
#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    submitter: Submitter,
    intake: Intake,
    workers: Vec<WorkerHandle>,
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
struct WorkerHandle {
    stopper: Stopper,
    thread: Option<JoinHandle<()>>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let (sender, receiver) = bounded(config.queue_size);

        Ok(Self {
            submitter: Submitter {
                sender,
                metrics: metrics.clone(),
            },
            intake: Intake::new(receiver, metrics.clone()),
            workers: Vec::with_capacity(config.num_workers),
            metrics,
            config,
        })
    }

    /// A cloneable producer handle onto this pool's intake.
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    /// Enqueue one task, blocking while the intake is full.
    pub fn add_task<T: Send + 'static>(&self, task: &Task<T>) {
        // the pool owns a receiver, so the intake cannot be disconnected
        let _ = self.submitter.add_task(task);
    }

    /// Enqueue tasks one by one. Other producers may interleave.
    pub fn add_tasks<T: Send + 'static>(&self, tasks: &[Task<T>]) {
        for task in tasks {
            self.add_task(task);
        }
    }

    pub fn try_add_task<T: Send + 'static>(&self, task: &Task<T>) -> Result<()> {
        self.submitter.try_add_task(task)
    }

    pub fn add_task_timeout<T: Send + 'static>(&self, task: &Task<T>, timeout: Duration) -> Result<()> {
        self.submitter.add_task_timeout(task, timeout)
    }

    /// Spawn the configured number of [`TaskWorker`]s and return.
    pub fn start(&mut self) -> Result<()> {
        self.start_with_worker_creator(|| Ok::<_, BoxError>(TaskWorker::new()))
    }

    /// Like [`start`](Pool::start), with every worker produced by `factory`.
    ///
    /// Stops at the first factory error and returns it. Workers spawned
    /// before the failure keep running; call [`stop`](Pool::stop) to unwind.
    pub fn start_with_worker_creator<W, E, F>(&mut self, mut factory: F) -> Result<()>
    where
        W: Worker,
        E: Into<BoxError>,
        F: FnMut() -> std::result::Result<W, E>,
    {
        if self.is_running() {
            return Err(Error::AlreadyStarted);
        }
        // every lane of an earlier start has already exited
        self.workers.clear();

        for _ in 0..self.config.num_workers {
            let worker = factory().map_err(Error::worker_factory)?;
            self.spawn(worker)?;
        }

        tracing::debug!(
            workers = self.workers.len(),
            queue_size = self.config.queue_size,
            "pool started"
        );
        Ok(())
    }

    fn spawn<W: Worker>(&mut self, mut worker: W) -> Result<()> {
        worker.set_queue(self.intake.clone());
        let stopper = worker.stopper();

        let name = format!("{}-{}", self.config.thread_name_prefix, self.workers.len());
        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread = builder.spawn(move || worker.start())?;

        self.workers.push(WorkerHandle {
            stopper,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Signal every worker to stop gracefully and forget them. Returns
    /// without waiting; tasks already running still deliver their results.
    pub fn stop(&mut self) {
        self.signal(StopMode::Graceful);
    }

    /// Like [`stop`](Pool::stop), but workers leave queued tasks behind.
    pub fn terminate(&mut self) {
        self.signal(StopMode::Immediate);
    }

    /// Graceful stop that also waits for the worker threads to exit.
    pub fn stop_and_join(&mut self) {
        for mut handle in self.signal(StopMode::Graceful) {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    tracing::warn!("worker thread panicked outside a task");
                }
            }
        }
    }

    fn signal(&mut self, mode: StopMode) -> Vec<WorkerHandle> {
        for worker in &self.workers {
            worker.stopper.stop(mode);
        }
        if !self.workers.is_empty() {
            tracing::debug!(workers = self.workers.len(), ?mode, "pool stopping");
        }
        std::mem::take(&mut self.workers)
    }

    /// Whether any worker of the current start is still live.
    pub fn is_running(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.stopper.state() != WorkerState::Stopped)
    }

    /// Configured worker count.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue_size(&self) -> usize {
        self.config.queue_size
    }

    /// Tasks waiting in the intake.
    pub fn queued(&self) -> usize {
        self.intake.len()
    }

    /// States of the workers spawned by the current start.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.stopper.state()).collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Producer-side handle onto a pool's intake.
///
/// Submission only fails with [`Error::Disconnected`] once the pool and all
/// of its workers are gone.
#[derive(Debug, Clone)]
pub struct Submitter {
    sender: Sender<Job>,
    metrics: Arc<Metrics>,
}

impl Submitter {
    /// Enqueue one task, blocking while the intake is full.
    pub fn add_task<T: Send + 'static>(&self, task: &Task<T>) -> Result<()> {
        self.sender
            .send(task.to_job())
            .map_err(|_| Error::Disconnected)?;
        self.metrics.record_task_submitted();
        Ok(())
    }

    pub fn add_tasks<T: Send + 'static>(&self, tasks: &[Task<T>]) -> Result<()> {
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    /// Enqueue without blocking; `Error::QueueFull` when there is no room
    /// (or, with a queue size of 0, no idle worker).
    pub fn try_add_task<T: Send + 'static>(&self, task: &Task<T>) -> Result<()> {
        match self.sender.try_send(task.to_job()) {
            Ok(()) => {
                self.metrics.record_task_submitted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }

    pub fn add_task_timeout<T: Send + 'static>(&self, task: &Task<T>, timeout: Duration) -> Result<()> {
        match self.sender.send_timeout(task.to_job(), timeout) {
            Ok(()) => {
                self.metrics.record_task_submitted();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull),
            Err(SendTimeoutError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(num_workers: usize, queue_size: usize) -> Pool {
        let config = PoolConfig::builder()
            .num_workers(num_workers)
            .queue_size(queue_size)
            .build()
            .unwrap();
        Pool::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PoolConfig {
            num_workers: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(Pool::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_start_and_stop() {
        let mut pool = pool(3, 10);
        assert!(!pool.is_running());

        pool.start().unwrap();
        assert!(pool.is_running());
        assert_eq!(pool.worker_states().len(), 3);

        pool.stop();
        assert!(!pool.is_running());
        assert!(pool.worker_states().is_empty());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut pool = pool(2, 10);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(Error::AlreadyStarted)));
        pool.stop_and_join();
    }

    #[test]
    fn test_restart_after_stop() {
        let mut pool = pool(2, 10);
        pool.start().unwrap();
        pool.stop_and_join();

        pool.start().unwrap();
        let task = Task::new(|| Ok(1));
        pool.add_task(&task);
        assert_eq!(task.wait_for_result().unwrap(), 1);
        pool.stop_and_join();
    }

    #[test]
    fn test_tasks_queued_before_start() {
        let mut pool = pool(2, 10);
        let tasks: Vec<Task<usize>> = (0..10).map(|i| Task::new(move || Ok(i * 2))).collect();
        pool.add_tasks(&tasks);
        assert_eq!(pool.queued(), 10);

        pool.start().unwrap();
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.wait_for_result().unwrap(), i * 2);
        }
        pool.stop_and_join();
    }

    #[test]
    fn test_try_add_task_full() {
        let pool = pool(1, 2);
        let tasks: Vec<Task> = (0..3).map(|_| Task::new(|| Ok(()))).collect();

        assert!(pool.try_add_task(&tasks[0]).is_ok());
        assert!(pool.try_add_task(&tasks[1]).is_ok());
        assert!(matches!(pool.try_add_task(&tasks[2]), Err(Error::QueueFull)));
        assert!(matches!(
            pool.add_task_timeout(&tasks[2], Duration::from_millis(10)),
            Err(Error::QueueFull)
        ));
    }

    #[test]
    fn test_factory_error_aborts_start() {
        let mut pool = pool(4, 10);
        let mut created = 0;

        let result = pool.start_with_worker_creator(|| {
            created += 1;
            if created == 3 {
                Err("resource unavailable")
            } else {
                Ok(TaskWorker::new())
            }
        });

        assert!(matches!(result, Err(Error::WorkerFactory(_))));
        // workers spawned before the failure are still live
        assert_eq!(pool.worker_states().len(), 2);
        pool.stop_and_join();
    }

    #[test]
    fn test_worker_creator_hooks() {
        let mut pool = pool(3, 10);
        let started = Arc::new(AtomicUsize::new(0));

        let counter = started.clone();
        pool.start_with_worker_creator(|| {
            let counter = counter.clone();
            Ok::<_, BoxError>(TaskWorker::new().on_start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        })
        .unwrap();

        pool.stop_and_join();
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panic_counted_in_metrics() {
        let mut pool = pool(1, 10);
        pool.start().unwrap();

        let bad: Task = Task::new(|| panic!("kaboom"));
        let good: Task = Task::new(|| Ok(()));
        pool.add_tasks(&[bad.clone(), good.clone()]);

        assert!(matches!(bad.wait_for_result(), Err(TaskError::Panicked { .. })));
        assert!(good.wait_for_result().is_ok());
        pool.stop_and_join();

        #[cfg(feature = "telemetry")]
        {
            let snapshot = pool.metrics();
            assert_eq!(snapshot.tasks_submitted, 2);
            assert_eq!(snapshot.tasks_executed, 2);
            assert_eq!(snapshot.tasks_panicked, 1);
        }
    }

    #[test]
    fn test_submitter_outlives_pool() {
        let pool = pool(1, 0);
        let submitter = pool.submitter();
        drop(pool);

        let task = Task::new(|| Ok(()));
        assert!(matches!(submitter.add_task(&task), Err(Error::Disconnected)));
    }
}
