//! Deferred task execution: one-shot delays and recurring sweeps.
//!
//! Timers push jobs into a bounded channel; a dispatcher drains it onto a
//! worker pool limited by a semaphore. Delivery is at-least-once: a task
//! that fails transiently is re-enqueued with exponential backoff until the
//! attempt budget runs out, so every task must be idempotent against the
//! current booking state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::{SchedulerConfig, SweepConfig};
use crate::observability::{TASK_DURATION_SECONDS, TASKS_TOTAL};

const JOB_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Confirm a booking if it's still pending.
    AutoConfirm(Ulid),
    SendConfirmation(Ulid),
    SendReminder(Ulid),
    /// Cancel bookings left pending past the expiry window.
    ExpirySweep,
    /// Fan out reminders for confirmed bookings starting tomorrow.
    ReminderSweep,
    /// Repository housekeeping (WAL compaction).
    Maintenance,
}

impl Task {
    pub fn label(&self) -> &'static str {
        match self {
            Task::AutoConfirm(_) => "auto_confirm",
            Task::SendConfirmation(_) => "send_confirmation",
            Task::SendReminder(_) => "send_reminder",
            Task::ExpirySweep => "expiry_sweep",
            Task::ReminderSweep => "reminder_sweep",
            Task::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Worth retrying (storage hiccup).
    Transient(String),
    /// Retrying won't help.
    Permanent(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Transient(e) => write!(f, "transient: {e}"),
            TaskError::Permanent(e) => write!(f, "permanent: {e}"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Executes scheduled tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Task) -> Result<(), TaskError>;
}

#[derive(Debug, Clone, Copy)]
struct Job {
    task: Task,
    attempt: u32,
}

/// Cloneable handle for scheduling tasks.
#[derive(Clone)]
pub struct Scheduler {
    jobs: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    config: SchedulerConfig,
}

/// Receiving half; turned into the dispatcher task by [`SchedulerWorker::spawn`].
pub struct SchedulerWorker {
    jobs: mpsc::Receiver<Job>,
    scheduler: Scheduler,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> (Scheduler, SchedulerWorker) {
        let (tx, rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let scheduler = Scheduler {
            jobs: tx,
            shutdown: CancellationToken::new(),
            config,
        };
        let worker = SchedulerWorker {
            jobs: rx,
            scheduler: scheduler.clone(),
        };
        (scheduler, worker)
    }

    /// Run `task` once after `delay`. Not retractable: a cancelled booking
    /// relies on the task's own guard.
    pub fn schedule_once(&self, task: Task, delay: Duration) {
        self.enqueue_after(Job { task, attempt: 0 }, delay);
    }

    /// Run `task` now and then every `period`. Ticks missed while the queue
    /// is full are delayed, not bunched up. A zero period is refused.
    pub fn schedule_recurring(&self, task: Task, period: Duration) {
        if period.is_zero() {
            error!(task = task.label(), "recurring task needs a non-zero period, not scheduled");
            return;
        }
        let jobs = self.jobs.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if jobs.send(Job { task, attempt: 0 }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(task = task.label(), "recurring schedule stopped");
        });
    }

    /// Register the standing sweeps.
    pub fn schedule_sweeps(&self, sweeps: &SweepConfig) {
        self.schedule_recurring(Task::ExpirySweep, sweeps.expiry_period);
        self.schedule_recurring(Task::ReminderSweep, sweeps.reminder_period);
        self.schedule_recurring(Task::Maintenance, sweeps.maintenance_period);
    }

    /// Stop timers and the dispatcher. Jobs already executing run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn enqueue_after(&self, job: Job, delay: Duration) {
        let jobs = self.jobs.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = jobs.send(job).await;
                }
            }
        });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .retry_base
            .saturating_mul(1u32 << attempt.min(10))
    }

    async fn execute(&self, runner: &dyn TaskRunner, job: Job) {
        let label = job.task.label();
        let started = Instant::now();
        let result = runner.run(job.task).await;
        metrics::histogram!(TASK_DURATION_SECONDS, "task" => label)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!(TASKS_TOTAL, "task" => label, "status" => "ok").increment(1);
            }
            Err(TaskError::Transient(reason)) if job.attempt + 1 < self.config.max_attempts => {
                let delay = self.backoff(job.attempt);
                warn!(
                    task = label,
                    attempt = job.attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    "task failed, retrying: {reason}"
                );
                metrics::counter!(TASKS_TOTAL, "task" => label, "status" => "retry").increment(1);
                self.enqueue_after(
                    Job {
                        task: job.task,
                        attempt: job.attempt + 1,
                    },
                    delay,
                );
            }
            Err(e) => {
                error!(task = label, attempts = job.attempt + 1, "task dropped: {e}");
                metrics::counter!(TASKS_TOTAL, "task" => label, "status" => "dropped")
                    .increment(1);
            }
        }
    }
}

impl SchedulerWorker {
    /// Start the dispatcher. At most `workers` tasks execute concurrently.
    pub fn spawn(self, runner: Arc<dyn TaskRunner>) -> JoinHandle<()> {
        let SchedulerWorker {
            jobs: mut rx,
            scheduler,
        } = self;
        let permits = Arc::new(Semaphore::new(scheduler.config.workers));
        info!(workers = scheduler.config.workers, "scheduler started");

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let runner = runner.clone();
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let _permit = permit; // held until the task finishes
                    scheduler.execute(runner.as_ref(), job).await;
                });
            }
            info!("scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every run; pops scripted results, succeeding once they run out.
    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<Task>>,
        script: Mutex<VecDeque<Result<(), TaskError>>>,
    }

    impl Recorder {
        fn scripted(results: Vec<Result<(), TaskError>>) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::default(),
                script: Mutex::new(results.into()),
            })
        }

        fn runs(&self) -> Vec<Task> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for Recorder {
        async fn run(&self, task: Task) -> Result<(), TaskError> {
            self.runs.lock().unwrap().push(task);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn config(max_attempts: u32) -> SchedulerConfig {
        SchedulerConfig {
            workers: 2,
            max_attempts,
            retry_base: Duration::from_secs(1),
        }
    }

    fn start(recorder: &Arc<Recorder>, max_attempts: u32) -> Scheduler {
        let (scheduler, worker) = Scheduler::new(config(max_attempts));
        worker.spawn(recorder.clone());
        scheduler
    }

    fn transient() -> Result<(), TaskError> {
        Err(TaskError::Transient("store offline".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn once_runs_after_delay() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = start(&recorder, 3);
        let id = Ulid::new();

        scheduler.schedule_once(Task::AutoConfirm(id), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(recorder.runs().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.runs(), vec![Task::AutoConfirm(id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_runs_every_period() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = start(&recorder, 3);

        scheduler.schedule_recurring(Task::ExpirySweep, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(35)).await;

        // t = 0, 10, 20, 30
        assert_eq!(recorder.runs(), vec![Task::ExpirySweep; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_not_scheduled() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = start(&recorder, 3);

        scheduler.schedule_recurring(Task::Maintenance, Duration::ZERO);
        scheduler.schedule_recurring(Task::ExpirySweep, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(recorder.runs(), vec![Task::ExpirySweep]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_with_backoff() {
        let recorder = Recorder::scripted(vec![transient(), transient()]);
        let scheduler = start(&recorder, 5);

        scheduler.schedule_once(Task::ReminderSweep, Duration::ZERO);

        // Attempts at t=0, t=1 (1s backoff), t=3 (2s backoff).
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(recorder.runs().len(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.runs().len(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.runs().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let recorder = Recorder::scripted(vec![transient(); 10]);
        let scheduler = start(&recorder, 3);

        scheduler.schedule_once(Task::Maintenance, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(recorder.runs(), vec![Task::Maintenance; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let recorder = Recorder::scripted(vec![Err(TaskError::Permanent("gone".into()))]);
        let scheduler = start(&recorder, 5);

        scheduler.schedule_once(Task::SendReminder(Ulid::new()), Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(recorder.runs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_pending_timers() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = start(&recorder, 3);

        scheduler.schedule_once(Task::AutoConfirm(Ulid::new()), Duration::from_secs(60));
        scheduler.schedule_recurring(Task::ExpirySweep, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.runs().len(), 1); // first sweep tick

        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.runs().len(), 1);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let (scheduler, _worker) = Scheduler::new(config(3));
        assert_eq!(scheduler.backoff(0), Duration::from_secs(1));
        assert_eq!(scheduler.backoff(1), Duration::from_secs(2));
        assert_eq!(scheduler.backoff(3), Duration::from_secs(8));
        assert_eq!(scheduler.backoff(40), Duration::from_secs(1024));
    }
}
