//! Per-key serialized job coordinator.
//!
//! Jobs are `(key, task)` pairs. For each key there is at most one runner
//! task popping jobs from the key's FIFO queue, so jobs sharing a key run
//! strictly in submission order and never overlap. Runners for different
//! keys proceed in parallel, bounded by a semaphore sized to the worker
//! count. A retryable failure re-runs the job in place, ahead of anything
//! submitted later for the same key.
//!
//! Once shutdown starts, submissions from outside are refused, while a job
//! that is still running may enqueue its follow-up jobs; those are drained
//! too.
//!
//! ```text
//! enqueue(key) ──> queues[key].push_back ──(first job)──> spawn runner(key)
//!                                                          │
//!                  runner: pop ─> permit ─> attempt ─> retry? ─> ticket
//! ```

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use itm_common::{TaskError, TaskResult};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{ItmError, ItmResult};
use crate::metrics::MetricsCollector;

tokio::task_local! {
    /// Present while a job body is running.
    static IN_JOB: ();
}

/// Boxed future returned by a job body.
pub type JobFuture = Pin<Box<dyn Future<Output = TaskResult<()>> + Send>>;

type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

/// Final outcome of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { attempts: u32 },
    Failed { attempts: u32, error: TaskError },
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            JobOutcome::Completed { attempts } | JobOutcome::Failed { attempts, .. } => *attempts,
            JobOutcome::Cancelled => 0,
        }
    }
}

/// Completion handle returned by [`JobCoordinator::enqueue`].
///
/// Dropping the ticket does not cancel the job.
#[derive(Debug)]
pub struct JobTicket {
    key: String,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the job to finish.
    pub async fn wait(self) -> JobOutcome {
        self.outcome.await.unwrap_or(JobOutcome::Cancelled)
    }
}

struct QueuedJob {
    max_retries: u32,
    task: JobFn,
    done: oneshot::Sender<JobOutcome>,
}

struct Inner {
    queues: Mutex<HashMap<String, VecDeque<QueuedJob>>>,
    workers: Arc<Semaphore>,
    closing: AtomicBool,
    idle: Notify,
    default_max_retries: u32,
    task_timeout: Duration,
    retry_backoff: Duration,
    metrics: MetricsCollector,
    runtime: Handle,
}

/// The job coordinator. Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    /// Creates a coordinator bound to the current tokio runtime.
    pub fn new(config: &CoordinatorConfig, metrics: MetricsCollector) -> ItmResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ItmError::internal(format!("coordinator needs a tokio runtime: {}", e)))?;
        Ok(Self::with_handle(config, metrics, runtime))
    }

    fn with_handle(config: &CoordinatorConfig, metrics: MetricsCollector, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                closing: AtomicBool::new(false),
                idle: Notify::new(),
                default_max_retries: config.max_retries,
                task_timeout: config.task_timeout(),
                retry_backoff: config.retry_backoff(),
                metrics,
                runtime,
            }),
        }
    }

    /// Submits a job with the configured retry limit.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, task: F) -> ItmResult<JobTicket>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        self.enqueue_with_retries(key, task, self.inner.default_max_retries)
    }

    /// Submits a job. Never blocks.
    ///
    /// `task` is invoked once per attempt. Fails only when the coordinator
    /// is shutting down and the caller is not a running job.
    fn enqueue_with_retries<F, Fut>(
        &self,
        key: impl Into<String>,
        task: F,
        max_retries: u32,
    ) -> ItmResult<JobTicket>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let key = key.into();
        if self.inner.closing.load(Ordering::SeqCst) && IN_JOB.try_with(|_| ()).is_err() {
            warn!(key = %key, "coordinator closing, job refused");
            self.inner.metrics.record_job_cancelled();
            return Err(ItmError::CoordinatorClosed { key });
        }

        let (done, outcome) = oneshot::channel();
        let job = QueuedJob {
            max_retries,
            task: Box::new(move || Box::pin(task()) as JobFuture),
            done,
        };

        let start_runner = {
            let mut queues = self.inner.queues.lock();
            let start = match queues.entry(key.clone()) {
                Entry::Occupied(mut queue) => {
                    queue.get_mut().push_back(job);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(VecDeque::from([job]));
                    true
                }
            };
            self.inner.metrics.set_active_keys(queues.len());
            start
        };

        self.inner.metrics.record_job_submitted();
        if start_runner {
            let inner = Arc::clone(&self.inner);
            let runner_key = key.clone();
            self.inner.runtime.spawn(run_key(inner, runner_key));
        }
        debug!(key = %key, "job enqueued");

        Ok(JobTicket { key, outcome })
    }

    /// Returns true once [`JobCoordinator::shutdown`] has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Number of keys with queued or running jobs.
    pub fn active_keys(&self) -> usize {
        self.inner.queues.lock().len()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Waits until no key has queued or running work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.queues.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Refuses new submissions and drains every queued job, along with the
    /// jobs those enqueue while draining.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            debug!("coordinator already closing");
        }
        info!(active_keys = self.active_keys(), "draining coordinator");
        self.wait_idle().await;
        info!("coordinator drained");
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("active_keys", &self.active_keys())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

async fn run_key(inner: Arc<Inner>, key: String) {
    loop {
        let job = {
            let mut queues = inner.queues.lock();
            let Some(queue) = queues.get_mut(&key) else {
                break;
            };
            match queue.pop_front() {
                Some(job) => job,
                None => {
                    queues.remove(&key);
                    inner.metrics.set_active_keys(queues.len());
                    if queues.is_empty() {
                        inner.idle.notify_waiters();
                    }
                    break;
                }
            }
        };

        let outcome = inner.execute(&key, &job).await;
        // The submitter may have dropped its ticket.
        let _ = job.done.send(outcome);
    }
}

impl Inner {
    async fn execute(&self, key: &str, job: &QueuedJob) -> JobOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self.attempt(job).await;
            match result {
                Ok(()) => {
                    self.metrics.record_job_completed();
                    debug!(key, attempts, "job completed");
                    return JobOutcome::Completed { attempts };
                }
                Err(e) if e.is_retryable() && attempts <= job.max_retries => {
                    self.metrics.record_job_retried();
                    debug!(key, attempts, error = %e, "job failed, retrying");
                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
                Err(e) => {
                    self.metrics.record_job_failed();
                    error!(key, attempts, status = e.to_status().as_str(), error = %e, "job failed");
                    return JobOutcome::Failed { attempts, error: e };
                }
            }
        }
    }

    async fn attempt(&self, job: &QueuedJob) -> TaskResult<()> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| TaskError::internal("worker pool closed"))?;
        let _timer = self.metrics.start_job_timer();

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| IN_JOB.sync_scope((), || (job.task)()))) {
            Ok(fut) => fut,
            Err(panic) => return Err(panicked(panic)),
        };
        let scoped = IN_JOB.scope((), AssertUnwindSafe(fut).catch_unwind());
        match tokio::time::timeout(self.task_timeout, scoped).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(panicked(panic)),
            Err(_) => Err(TaskError::timeout(self.task_timeout.as_millis() as u64)),
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> TaskError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    TaskError::internal(format!("job panicked: {}", message))
}
