//! Durable, priority-scheduled, cancellable background jobs.
//!
//! Submitted jobs persist before they are queued; workers dequeue by
//! priority, gate admission per peer, run the registered handler for the
//! job's kind under the peer's circuit breaker, and persist every state
//! transition before moving on. Retryable failures re-queue themselves
//! after the configured backoff; jobs found `running` at startup are reset
//! to `queued` and run again (handlers are idempotent per SOP instance).

pub mod context;
pub mod handlers;
mod queue;
mod worker;

pub use context::JobContext;
pub use queue::JobQueue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use client_sql::{truncate_to_seconds, JobQueryOptions, JobRepository, NodeRepository};
use models::{Fault, JobKind, JobRecord, JobStatus};
use resilience::{BreakerConfig, BreakerStats, ResilientExecutor, RetryConfig, RetryPolicy};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::pools::Pools;
use context::JobControl;

/// How a handler invocation ends when it does not succeed.
#[derive(Debug)]
pub enum JobError {
    /// The cancellation token fired; the job transitions to canceled.
    Canceled,
    /// A pause was requested; the job yields back to the queue's paused
    /// state and resumes from scratch later.
    Paused,
    Fault(Fault),
}

impl From<Fault> for JobError {
    fn from(fault: Fault) -> Self {
        JobError::Fault(fault)
    }
}

impl From<dimse::Error> for JobError {
    fn from(err: dimse::Error) -> Self {
        JobError::Fault(err.fault())
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Canceled => f.write_str("canceled"),
            JobError::Paused => f.write_str("paused"),
            JobError::Fault(fault) => fault.fmt(f),
        }
    }
}

/// One handler per [`JobKind`]. Handlers must be idempotent with respect
/// to a single SOP instance: re-running a partially completed job must
/// converge, not duplicate.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobApiError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        expected: &'static str,
    },
    #[error("job {0} has exhausted its retries")]
    RetriesExhausted(Uuid),
    #[error("invalid job: {0}")]
    Validation(String),
    #[error("job queue is full")]
    QueueFull,
    #[error("timed out waiting for job {0}")]
    WaitTimeout(Uuid),
    #[error(transparent)]
    Storage(#[from] client_sql::Error),
}

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Concurrent outbound operations allowed per peer.
    pub per_node_concurrency: usize,
    /// Progress writes are coalesced to at most one per interval.
    pub progress_flush_interval: Duration,
    /// Backoff between automatic re-queues of retryable failures; also
    /// the wire-level policy handed to the per-peer executor.
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            per_node_concurrency: 4,
            progress_flush_interval: Duration::from_secs(1),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Point-in-time job counts.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub by_status: HashMap<JobStatus, u64>,
    pub completed_today: u64,
    pub failed_today: u64,
    pub queue_depth: usize,
}

pub(crate) type SubscriberFn = dyn Fn(&JobRecord, JobStatus, JobStatus) + Send + Sync;

pub(crate) struct JobsInner {
    pub config: JobManagerConfig,
    pub policy: RetryPolicy,
    pub repo: JobRepository,
    pub node_repo: NodeRepository,
    pub pools: Arc<Pools>,
    pub handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
    pub queue: JobQueue,
    pub controls: Mutex<HashMap<Uuid, JobControl>>,
    pub gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub executors: Mutex<HashMap<String, Arc<ResilientExecutor>>>,
    pub subscribers: RwLock<Vec<Arc<SubscriberFn>>>,
    pub audit: Arc<dyn AuditSink>,
    pub shutdown: CancellationToken,
}

pub struct JobManager {
    inner: Arc<JobsInner>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        config: JobManagerConfig,
        repo: JobRepository,
        node_repo: NodeRepository,
        pools: Arc<Pools>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let policy = RetryPolicy::new(config.retry.clone());
        let queue = JobQueue::new(config.queue_capacity);
        Self {
            inner: Arc::new(JobsInner {
                config,
                policy,
                repo,
                node_repo,
                pools,
                handlers: RwLock::new(HashMap::new()),
                queue,
                controls: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                executors: Mutex::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                audit,
                shutdown: CancellationToken::new(),
            }),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.write().unwrap().insert(kind, handler);
    }

    /// Weak handle for components that submit jobs back into the manager
    /// (breaks the sync-manager ownership cycle).
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Recover persisted work, then launch the worker pool.
    pub async fn start(&self) -> Result<(), JobApiError> {
        let recovered = recover(&self.inner).await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-enqueued persisted jobs at startup");
        }
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(worker::worker_loop(inner, worker_id)));
        }
        Ok(())
    }

    /// Stop dispatching, let in-flight jobs finish, and join the workers.
    /// Queued rows stay durable for the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.queue.close();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Validate, persist, and enqueue a job. Returns its id.
    pub async fn submit(&self, job: JobRecord) -> Result<Uuid, JobApiError> {
        submit_impl(&self.inner, job).await
    }

    /// Request cancellation. Waiting jobs transition immediately; running
    /// jobs observe the flag at their next checkpoint.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), JobApiError> {
        cancel_impl(&self.inner, job_id).await
    }

    /// Request a cooperative pause; takes effect at the worker's next
    /// checkpoint.
    pub async fn pause(&self, job_id: Uuid) -> Result<(), JobApiError> {
        pause_impl(&self.inner, job_id).await
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<(), JobApiError> {
        resume_impl(&self.inner, job_id).await
    }

    /// Manually re-queue a failed job with retries remaining. The failing
    /// path already counted the retry; this does not increment.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), JobApiError> {
        retry_impl(&self.inner, job_id).await
    }

    /// Block until the job is terminal (completed, canceled, or failed
    /// with no retries left) or the timeout elapses.
    pub async fn wait(&self, job_id: Uuid, timeout: Duration) -> Result<JobRecord, JobApiError> {
        wait_impl(&self.inner, job_id, timeout).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, JobApiError> {
        Ok(self.inner.repo.find_job(job_id).await?)
    }

    pub async fn list(&self, options: &JobQueryOptions) -> Result<Vec<JobRecord>, JobApiError> {
        Ok(self.inner.repo.find_jobs(options).await?)
    }

    /// Observe every state transition, ordered per job.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&JobRecord, JobStatus, JobStatus) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .write()
            .unwrap()
            .push(Arc::new(callback));
    }

    pub async fn stats(&self) -> Result<JobStats, JobApiError> {
        let by_status = self.inner.repo.counts_by_status().await?.into_iter().collect();
        Ok(JobStats {
            by_status,
            completed_today: self.inner.repo.count_completed_today().await?,
            failed_today: self.inner.repo.count_failed_today().await?,
            queue_depth: self.inner.queue.len(),
        })
    }

    /// Remove terminal jobs older than `max_age`; returns how many.
    pub async fn cleanup(&self, max_age: Duration) -> Result<u64, JobApiError> {
        Ok(self.inner.repo.cleanup_old(max_age).await?)
    }

    /// Breaker statistics for a peer, if any work has been dispatched to
    /// it yet.
    pub fn breaker_stats(&self, node_id: &str) -> Option<BreakerStats> {
        self.inner
            .executors
            .lock()
            .unwrap()
            .get(node_id)
            .map(|e| e.breaker().stats())
    }
}

/// Weakly held submitter used by the routing, prefetch, and sync managers.
#[derive(Clone)]
pub struct JobHandle {
    inner: std::sync::Weak<JobsInner>,
}

impl JobHandle {
    fn upgrade(&self) -> Result<Arc<JobsInner>, JobApiError> {
        self.inner
            .upgrade()
            .ok_or_else(|| JobApiError::Validation("job manager is gone".to_string()))
    }
}

#[async_trait]
impl crate::JobSubmitter for JobHandle {
    async fn submit_job(&self, job: JobRecord) -> Result<Uuid, JobApiError> {
        submit_impl(&self.upgrade()?, job).await
    }

    async fn wait_job(&self, job_id: Uuid, timeout: Duration) -> Result<JobRecord, JobApiError> {
        wait_impl(&self.upgrade()?, job_id, timeout).await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobApiError> {
        cancel_impl(&self.upgrade()?, job_id).await
    }
}

fn validate(job: &JobRecord) -> Result<(), JobApiError> {
    use JobKind::*;
    let need = |value: &Option<String>, what: &str| -> Result<(), JobApiError> {
        match value {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(JobApiError::Validation(format!(
                "{} job requires a {what} node",
                job.kind
            ))),
        }
    };
    match job.kind {
        Echo | Store | Forward => need(&job.destination_node_id, "destination")?,
        Query | Retrieve | Prefetch | SyncPull => need(&job.source_node_id, "source")?,
        SyncPush => need(&job.destination_node_id, "destination")?,
    }
    if matches!(job.kind, Store | Forward | Retrieve | Prefetch) && job.study_uid.is_empty() {
        return Err(JobApiError::Validation(format!(
            "{} job requires a study uid",
            job.kind
        )));
    }
    if job.status != JobStatus::Pending {
        return Err(JobApiError::Validation(
            "jobs must be submitted in pending status".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn get_or_create_control(
    inner: &Arc<JobsInner>,
    job_id: Uuid,
    status: JobStatus,
) -> JobControl {
    let mut controls = inner.controls.lock().unwrap();
    controls
        .entry(job_id)
        .or_insert_with(|| JobControl::new(status))
        .clone()
}

pub(crate) fn remove_control(inner: &Arc<JobsInner>, job_id: Uuid) {
    inner.controls.lock().unwrap().remove(&job_id);
}

pub(crate) fn gate_for(inner: &Arc<JobsInner>, peer: &str) -> Arc<Semaphore> {
    let mut gates = inner.gates.lock().unwrap();
    gates
        .entry(peer.to_string())
        .or_insert_with(|| Arc::new(Semaphore::new(inner.config.per_node_concurrency)))
        .clone()
}

pub(crate) fn executor_for(inner: &Arc<JobsInner>, peer: &str) -> Arc<ResilientExecutor> {
    let mut executors = inner.executors.lock().unwrap();
    executors
        .entry(peer.to_string())
        .or_insert_with(|| {
            Arc::new(ResilientExecutor::new(
                peer,
                inner.config.retry.clone(),
                inner.config.breaker.clone(),
            ))
        })
        .clone()
}

/// Invoke subscribers and the audit sink for one transition. Per-job
/// ordering holds because every transition for a job happens on its
/// worker or under its control entry.
pub(crate) fn notify_transition(
    inner: &Arc<JobsInner>,
    job: &JobRecord,
    from: JobStatus,
    to: JobStatus,
) {
    if let Some(control) = inner.controls.lock().unwrap().get(&job.job_id) {
        let _ = control.status.send_replace(to);
    }
    inner.audit.emit(AuditEvent::JobTransition { job, from, to });

    let subscribers: Vec<Arc<SubscriberFn>> = inner.subscribers.read().unwrap().clone();
    for subscriber in subscribers {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            subscriber(job, from, to)
        }));
        if outcome.is_err() {
            tracing::error!(job_id = %job.job_id, "job subscriber panicked");
        }
    }
}

/// Push now; if the queue is momentarily full, keep trying in the
/// background so a durable queued row is eventually dispatched.
pub(crate) fn enqueue(inner: &Arc<JobsInner>, job: &JobRecord) {
    let priority = job.priority.rank();
    let created_at = job.created_at;
    if inner.queue.push(job.job_id, priority, created_at).is_ok() {
        return;
    }
    let inner = inner.clone();
    let job_id = job.job_id;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = inner.shutdown.cancelled() => return,
            }
            if inner.queue.push(job_id, priority, created_at).is_ok() {
                return;
            }
        }
    });
}

pub(crate) async fn submit_impl(
    inner: &Arc<JobsInner>,
    mut job: JobRecord,
) -> Result<Uuid, JobApiError> {
    validate(&job)?;
    if inner.queue.len() >= inner.config.queue_capacity {
        return Err(JobApiError::QueueFull);
    }

    if job.job_id.is_nil() {
        job.job_id = Uuid::new_v4();
    }
    job.created_at = truncate_to_seconds(Utc::now());
    job.retry_count = 0;
    job.started_at = None;
    job.completed_at = None;

    job.pk = inner.repo.insert(&job).await?;
    get_or_create_control(inner, job.job_id, JobStatus::Pending);

    inner
        .repo
        .mark_queued(job.job_id, JobStatus::Pending)
        .await?;
    job.status = JobStatus::Queued;
    notify_transition(inner, &job, JobStatus::Pending, JobStatus::Queued);
    enqueue(inner, &job);

    tracing::debug!(job_id = %job.job_id, kind = %job.kind, priority = ?job.priority, "job submitted");
    Ok(job.job_id)
}

pub(crate) async fn cancel_impl(inner: &Arc<JobsInner>, job_id: Uuid) -> Result<(), JobApiError> {
    let job = inner
        .repo
        .find_job(job_id)
        .await?
        .ok_or(JobApiError::NotFound(job_id))?;
    if job.status.is_terminal() {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "a non-terminal status",
        });
    }

    // Flag first so a running worker observes it at its next checkpoint.
    let control = get_or_create_control(inner, job_id, job.status);
    control.cancel.cancel();

    if let Some(old) = inner.repo.try_cancel(job_id).await? {
        if let Some(fresh) = inner.repo.find_job(job_id).await? {
            notify_transition(inner, &fresh, old, JobStatus::Canceled);
        }
        remove_control(inner, job_id);
    }
    Ok(())
}

pub(crate) async fn pause_impl(inner: &Arc<JobsInner>, job_id: Uuid) -> Result<(), JobApiError> {
    let job = inner
        .repo
        .find_job(job_id)
        .await?
        .ok_or(JobApiError::NotFound(job_id))?;
    if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "queued or running",
        });
    }
    let control = get_or_create_control(inner, job_id, job.status);
    control.pause.store(true, std::sync::atomic::Ordering::SeqCst);
    Ok(())
}

pub(crate) async fn resume_impl(inner: &Arc<JobsInner>, job_id: Uuid) -> Result<(), JobApiError> {
    let job = inner
        .repo
        .find_job(job_id)
        .await?
        .ok_or(JobApiError::NotFound(job_id))?;
    if job.status != JobStatus::Paused {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "paused",
        });
    }
    let control = get_or_create_control(inner, job_id, job.status);
    control
        .pause
        .store(false, std::sync::atomic::Ordering::SeqCst);

    if !inner.repo.mark_queued(job_id, JobStatus::Paused).await? {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "paused",
        });
    }
    if let Some(mut fresh) = inner.repo.find_job(job_id).await? {
        fresh.status = JobStatus::Queued;
        notify_transition(inner, &fresh, JobStatus::Paused, JobStatus::Queued);
        enqueue(inner, &fresh);
    }
    Ok(())
}

pub(crate) async fn retry_impl(inner: &Arc<JobsInner>, job_id: Uuid) -> Result<(), JobApiError> {
    let job = inner
        .repo
        .find_job(job_id)
        .await?
        .ok_or(JobApiError::NotFound(job_id))?;
    if job.status != JobStatus::Failed {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "failed",
        });
    }
    if job.retry_count >= job.max_retries {
        return Err(JobApiError::RetriesExhausted(job_id));
    }

    if !inner.repo.mark_queued(job_id, JobStatus::Failed).await? {
        return Err(JobApiError::InvalidState {
            job_id,
            status: job.status,
            expected: "failed",
        });
    }
    get_or_create_control(inner, job_id, JobStatus::Queued);
    if let Some(fresh) = inner.repo.find_job(job_id).await? {
        notify_transition(inner, &fresh, JobStatus::Failed, JobStatus::Queued);
        enqueue(inner, &fresh);
    }
    Ok(())
}

fn is_settled(job: &JobRecord) -> bool {
    match job.status {
        JobStatus::Completed | JobStatus::Canceled => true,
        JobStatus::Failed => job.retry_count >= job.max_retries,
        _ => false,
    }
}

pub(crate) async fn wait_impl(
    inner: &Arc<JobsInner>,
    job_id: Uuid,
    timeout: Duration,
) -> Result<JobRecord, JobApiError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut watch = inner
        .controls
        .lock()
        .unwrap()
        .get(&job_id)
        .map(|c| c.status.subscribe());

    loop {
        let job = inner
            .repo
            .find_job(job_id)
            .await?
            .ok_or(JobApiError::NotFound(job_id))?;
        if is_settled(&job) {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(JobApiError::WaitTimeout(job_id));
        }

        let mut watch_lost = false;
        match watch.as_mut() {
            Some(rx) => {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            // Control entry reaped; fall back to polling.
                            watch_lost = true;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(JobApiError::WaitTimeout(job_id));
                    }
                }
            }
            None => {
                let nap = Duration::from_millis(25);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(JobApiError::WaitTimeout(job_id));
                    }
                }
            }
        }
        if watch_lost {
            watch = None;
        }
    }
}

/// Startup recovery: running jobs go back to queued with their retry
/// count intact (at-least-once), interrupted retry waits re-queue, and
/// pending or queued rows re-enter the ready queue.
async fn recover(inner: &Arc<JobsInner>) -> Result<usize, JobApiError> {
    let mut seen = std::collections::HashSet::new();
    let mut requeue = Vec::new();

    // Queued rows from the previous run re-enter the ready queue as-is.
    for job in inner.repo.find_by_status(JobStatus::Queued, 10_000).await? {
        seen.insert(job.job_id);
        requeue.push(job);
    }

    // Running jobs go back to queued with their retry count intact
    // (at-least-once).
    for mut job in inner.repo.find_by_status(JobStatus::Running, 10_000).await? {
        inner.repo.mark_queued(job.job_id, JobStatus::Running).await?;
        tracing::info!(job_id = %job.job_id, "recovered running job to queued");
        job.status = JobStatus::Queued;
        if seen.insert(job.job_id) {
            requeue.push(job);
        }
    }

    // A failed job with retries remaining lost its scheduled re-queue in
    // the restart.
    for mut job in inner.repo.find_by_status(JobStatus::Failed, 10_000).await? {
        if job.retry_count < job.max_retries {
            inner.repo.mark_queued(job.job_id, JobStatus::Failed).await?;
            job.status = JobStatus::Queued;
            if seen.insert(job.job_id) {
                requeue.push(job);
            }
        }
    }

    // Pending rows exist only when a submit was cut short.
    for mut job in inner.repo.find_by_status(JobStatus::Pending, 10_000).await? {
        inner.repo.mark_queued(job.job_id, JobStatus::Pending).await?;
        job.status = JobStatus::Queued;
        if seen.insert(job.job_id) {
            requeue.push(job);
        }
    }

    for job in &requeue {
        get_or_create_control(inner, job.job_id, JobStatus::Queued);
        enqueue(inner, job);
    }
    Ok(requeue.len())
}
