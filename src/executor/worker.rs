// worker thread stuff
use super::panic_handler::{PanicHandler, PanicStrategy};
use super::task::{Completion, Job};
use crate::error::TaskError;
use crate::telemetry::Metrics;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type WorkerId = usize;

static WORKER_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// How a stop signal treats tasks still buffered in the intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the current task, then run whatever was already queued.
    Graceful,
    /// Finish the current task and return.
    Immediate,
}

/// `Idle → Running → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Receiving end of a pool's task queue, handed to each worker.
#[derive(Debug, Clone)]
pub struct Intake {
    receiver: Receiver<Job>,
    metrics: Arc<Metrics>,
}

impl Intake {
    pub(crate) fn new(receiver: Receiver<Job>, metrics: Arc<Metrics>) -> Self {
        Self { receiver, metrics }
    }

    /// Tasks currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

// state and counters shared between a worker and its stoppers
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    immediate: AtomicBool,
    tasks_executed: AtomicU64,
    tasks_panicked: AtomicU64,
}

/// Control handle for a worker that may already be running on another thread.
#[derive(Debug, Clone)]
pub struct Stopper {
    signal: Sender<()>,
    shared: Arc<Shared>,
}

impl Stopper {
    /// Deliver a stop signal without waiting. The signal slot holds one
    /// message, so repeated calls never block; an `Immediate` request still
    /// upgrades a pending graceful one.
    pub fn stop(&self, mode: StopMode) {
        if mode == StopMode::Immediate {
            self.shared.immediate.store(true, Ordering::Release);
        }
        let _ = self.signal.try_send(());

        for from in [WorkerState::Idle, WorkerState::Running] {
            if self
                .shared
                .state
                .compare_exchange(
                    from as u8,
                    WorkerState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn tasks_executed(&self) -> u64 {
        self.shared.tasks_executed.load(Ordering::Relaxed)
    }

    pub fn tasks_panicked(&self) -> u64 {
        self.shared.tasks_panicked.load(Ordering::Relaxed)
    }
}

/// An execution lane driven by a pool.
///
/// The pool hands the worker its intake, keeps the [`Stopper`], and calls
/// [`start`](Worker::start) on a dedicated thread. `start` consumes the
/// worker, so a stopped worker can never be restarted.
pub trait Worker: Send + 'static {
    fn set_queue(&mut self, intake: Intake);

    fn stopper(&self) -> Stopper;

    /// Run until stopped or until the intake disconnects.
    fn start(self);
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// The stock [`Worker`]: a select loop over the intake and a stop signal,
/// with a fault barrier around every task.
pub struct TaskWorker {
    id: WorkerId,
    intake: Option<Intake>,
    stop_rx: Receiver<()>,
    stopper: Stopper,
    panic_handler: PanicHandler,
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
}

impl TaskWorker {
    pub fn new() -> Self {
        let (signal, stop_rx) = bounded(1);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(WorkerState::Idle as u8),
            immediate: AtomicBool::new(false),
            tasks_executed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
        });

        Self {
            id: WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            intake: None,
            stop_rx,
            stopper: Stopper { signal, shared },
            panic_handler: PanicHandler::default(),
            on_start: None,
            on_stop: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run `f` on the worker thread before the first task.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Run `f` on the worker thread after the loop exits.
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }

    pub fn with_panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.panic_handler = PanicHandler::new(strategy);
        self
    }

    fn stop_requested_immediately(&self) -> bool {
        self.stopper.shared.immediate.load(Ordering::Acquire)
    }

    // main loop
    fn run(&self, intake: &Intake) {
        loop {
            if self.stop_requested_immediately() {
                return;
            }

            select! {
                recv(self.stop_rx) -> _ => {
                    if !self.stop_requested_immediately() {
                        self.drain(intake);
                    }
                    return;
                }
                recv(intake.receiver) -> msg => match msg {
                    Ok(job) => self.execute(job, &intake.metrics),
                    // every sender is gone, nothing more can arrive
                    Err(_) => return,
                },
            }
        }
    }

    // graceful stop: run what was queued when the signal was seen
    fn drain(&self, intake: &Intake) {
        let pending = intake.receiver.len();
        for _ in 0..pending {
            if self.stop_requested_immediately() {
                break;
            }
            match intake.receiver.try_recv() {
                Ok(job) => self.execute(job, &intake.metrics),
                Err(_) => break,
            }
        }
    }

    fn execute(&self, job: Job, metrics: &Metrics) {
        let span = tracing::debug_span!("task", worker = self.id, task = %job.id());
        let _enter = span.enter();

        let start = Instant::now();
        let result = self.panic_handler.execute(|| job.run());
        let duration_ns = start.elapsed().as_nanos() as u64;

        match result {
            Ok(Ok(completion)) => {
                metrics.record_task_execution(duration_ns);
                match completion {
                    Completion::Succeeded => {}
                    Completion::Failed => metrics.record_task_failed(),
                    Completion::Cancelled => metrics.record_task_cancelled(),
                }
            }
            Ok(Err(err)) => {
                // dequeued twice or executed by hand before submission
                tracing::warn!(error = %err, "task rejected");
                return;
            }
            Err(panic) => {
                metrics.record_task_execution(duration_ns);
                metrics.record_task_panic();
                self.stopper
                    .shared
                    .tasks_panicked
                    .fetch_add(1, Ordering::Relaxed);
                job.fail(TaskError::Panicked {
                    message: panic.message,
                });
            }
        }

        self.stopper
            .shared
            .tasks_executed
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for TaskWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for TaskWorker {
    fn set_queue(&mut self, intake: Intake) {
        self.intake = Some(intake);
    }

    fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    fn start(mut self) {
        let shared = self.stopper.shared.clone();
        // a stop sent before start leaves the state at Stopping
        let _ = shared.state.compare_exchange(
            WorkerState::Idle as u8,
            WorkerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        match self.intake.take() {
            Some(intake) => {
                let started = match self.on_start.take() {
                    Some(hook) => self.panic_handler.execute(hook).is_ok(),
                    None => true,
                };

                if started {
                    tracing::debug!(worker = self.id, "worker started");
                    self.run(&intake);

                    if let Some(hook) = self.on_stop.take() {
                        if self.panic_handler.execute(hook).is_err() {
                            tracing::warn!(worker = self.id, "stop hook panicked");
                        }
                    }
                } else {
                    tracing::error!(worker = self.id, "start hook panicked, worker not started");
                }
            }
            None => tracing::warn!(worker = self.id, "worker started without a queue"),
        }

        shared
            .state
            .store(WorkerState::Stopped as u8, Ordering::Release);
        tracing::debug!(
            worker = self.id,
            tasks_executed = shared.tasks_executed.load(Ordering::Relaxed),
            "worker stopped"
        );
    }
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("id", &self.id)
            .field("state", &self.stopper.state())
            .field("has_queue", &self.intake.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::Task;
    use std::thread;

    fn intake(capacity: usize) -> (Sender<Job>, Intake) {
        let (tx, rx) = bounded(capacity);
        (tx, Intake::new(rx, Arc::new(Metrics::new())))
    }

    #[test]
    fn test_worker_executes_and_stops() {
        let (tx, intake) = intake(4);
        let mut worker = TaskWorker::new();
        worker.set_queue(intake);
        let stopper = worker.stopper();
        assert_eq!(stopper.state(), WorkerState::Idle);

        let handle = thread::spawn(move || worker.start());

        let task = Task::new(|| Ok(5));
        tx.send(task.to_job()).unwrap();
        assert_eq!(task.wait_for_result().unwrap(), 5);

        stopper.stop(StopMode::Graceful);
        handle.join().unwrap();
        assert_eq!(stopper.state(), WorkerState::Stopped);
        assert_eq!(stopper.tasks_executed(), 1);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let (tx, intake) = intake(4);
        let mut worker = TaskWorker::new().with_panic_strategy(PanicStrategy::Isolate);
        worker.set_queue(intake);
        let stopper = worker.stopper();
        let handle = thread::spawn(move || worker.start());

        let bad: Task = Task::new(|| panic!("bad task"));
        let good = Task::new(|| Ok("still alive"));
        tx.send(bad.to_job()).unwrap();
        tx.send(good.to_job()).unwrap();

        match bad.wait_for_result() {
            Err(TaskError::Panicked { message }) => assert_eq!(message, "bad task"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(good.wait_for_result().unwrap(), "still alive");

        stopper.stop(StopMode::Immediate);
        handle.join().unwrap();
        assert_eq!(stopper.tasks_panicked(), 1);
    }

    #[test]
    fn test_graceful_stop_drains_queue() {
        let (tx, intake) = intake(8);
        let tasks: Vec<Task<usize>> = (0..5).map(|i| Task::new(move || Ok(i))).collect();
        for task in &tasks {
            tx.send(task.to_job()).unwrap();
        }

        let mut worker = TaskWorker::new();
        worker.set_queue(intake);
        let stopper = worker.stopper();
        stopper.stop(StopMode::Graceful);
        assert_eq!(stopper.state(), WorkerState::Stopping);

        worker.start();

        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.try_result().unwrap().unwrap(), i);
        }
        assert_eq!(stopper.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_immediate_stop_skips_queue() {
        let (tx, intake) = intake(8);
        let task = Task::new(|| Ok(()));
        tx.send(task.to_job()).unwrap();

        let mut worker = TaskWorker::new();
        worker.set_queue(intake.clone());
        let stopper = worker.stopper();
        stopper.stop(StopMode::Immediate);
        worker.start();

        assert!(task.try_result().is_none());
        assert_eq!(intake.len(), 1);
    }

    #[test]
    fn test_stop_never_blocks() {
        let worker = TaskWorker::new();
        let stopper = worker.stopper();
        for _ in 0..10 {
            stopper.stop(StopMode::Graceful);
        }
        assert_eq!(stopper.state(), WorkerState::Stopping);
    }

    #[test]
    fn test_hooks_run_on_worker_thread() {
        let (tx, intake) = intake(1);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let start_tx = events_tx.clone();

        let mut worker = TaskWorker::new()
            .on_start(move || start_tx.send("start").unwrap())
            .on_stop(move || events_tx.send("stop").unwrap());
        worker.set_queue(intake);
        let handle = thread::spawn(move || worker.start());

        // dropping the only sender disconnects the intake and ends the loop
        drop(tx);
        handle.join().unwrap();

        let events: Vec<_> = events_rx.try_iter().collect();
        assert_eq!(events, vec!["start", "stop"]);
    }

    #[test]
    fn test_panicking_start_hook_stops_worker() {
        let (tx, intake) = intake(1);
        let mut worker = TaskWorker::new()
            .with_panic_strategy(PanicStrategy::Isolate)
            .on_start(|| panic!("cannot open connection"));
        worker.set_queue(intake.clone());
        let stopper = worker.stopper();

        let task = Task::new(|| Ok(()));
        tx.send(task.to_job()).unwrap();

        let handle = thread::spawn(move || worker.start());
        assert!(handle.join().is_ok());

        assert_eq!(stopper.state(), WorkerState::Stopped);
        assert!(task.try_result().is_none());
        assert_eq!(intake.len(), 1);
    }

    #[test]
    fn test_panicking_stop_hook_contained() {
        let (tx, intake) = intake(1);
        let mut worker = TaskWorker::new()
            .with_panic_strategy(PanicStrategy::Isolate)
            .on_stop(|| panic!("close failed"));
        worker.set_queue(intake);
        let stopper = worker.stopper();
        let handle = thread::spawn(move || worker.start());

        drop(tx);
        assert!(handle.join().is_ok());
        assert_eq!(stopper.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_start_without_queue() {
        let worker = TaskWorker::new();
        let stopper = worker.stopper();
        let handle = thread::spawn(move || worker.start());
        handle.join().unwrap();
        assert_eq!(stopper.state(), WorkerState::Stopped);
    }
}
