//! What a handler sees while running one job: cancellation and pause
//! checkpoints, a coalescing progress reporter, and pooled channel
//! acquisition for the job's peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client_sql::JobRepository;
use models::{Fault, JobProgress, JobRecord};
use resilience::ResilientExecutor;
use tokio_util::sync::CancellationToken;

use crate::pools::Pools;

use super::JobError;

/// Control handles for one job, shared by the manager and the worker.
#[derive(Clone)]
pub(crate) struct JobControl {
    pub cancel: CancellationToken,
    pub pause: Arc<AtomicBool>,
    pub status: tokio::sync::watch::Sender<models::JobStatus>,
}

impl JobControl {
    pub fn new(initial: models::JobStatus) -> Self {
        let (status, _) = tokio::sync::watch::channel(initial);
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(AtomicBool::new(false)),
            status,
        }
    }
}

struct ProgressState {
    progress: JobProgress,
    dirty: bool,
}

pub struct JobContext {
    job: JobRecord,
    control: JobControl,
    progress: Mutex<ProgressState>,
    repo: JobRepository,
    pools: Arc<Pools>,
    executor: Arc<ResilientExecutor>,
    flush_interval: Duration,
}

impl JobContext {
    pub(crate) fn new(
        job: JobRecord,
        control: JobControl,
        repo: JobRepository,
        pools: Arc<Pools>,
        executor: Arc<ResilientExecutor>,
        flush_interval: Duration,
    ) -> Self {
        let progress = job.progress.clone();
        Self {
            job,
            control,
            progress: Mutex::new(ProgressState {
                progress,
                dirty: false,
            }),
            repo,
            pools,
            executor,
            flush_interval,
        }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.control.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.control.cancel.is_cancelled()
    }

    pub fn is_pause_requested(&self) -> bool {
        self.control.pause.load(Ordering::SeqCst)
    }

    /// Handlers call this at every item boundary and after every wire
    /// call. Cancellation wins over pause.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancel_requested() {
            return Err(JobError::Canceled);
        }
        if self.is_pause_requested() {
            return Err(JobError::Paused);
        }
        Ok(())
    }

    /// The retry policy and circuit breaker for this job's peer. The
    /// worker already runs the whole handler under it; handlers use this
    /// to wrap individual wire calls with their own ceilings.
    pub fn resilient(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Borrow a channel to a registered peer through its pool.
    pub async fn connect(&self, node_id: &str) -> Result<pool::Pooled, Fault> {
        let peer_pool = self.pools.for_node(node_id).await?;
        peer_pool
            .borrow()
            .await
            .map_err(|err| Fault::resource(err.to_string()))
    }

    pub fn set_totals(&self, items_total: u64, bytes_total: u64) {
        let mut state = self.progress.lock().unwrap();
        state.progress.items_total = items_total;
        state.progress.bytes_total = bytes_total;
        state.dirty = true;
    }

    /// Record progress in memory; persistence is coalesced by the flush
    /// loop. Done counts never exceed known totals.
    pub fn report(&self, items_done: u64, bytes_done: u64, current_item: Option<String>) {
        let mut state = self.progress.lock().unwrap();
        let p = &mut state.progress;
        p.items_done = if p.items_total > 0 {
            items_done.min(p.items_total)
        } else {
            items_done
        };
        p.bytes_done = if p.bytes_total > 0 {
            bytes_done.min(p.bytes_total)
        } else {
            bytes_done
        };
        p.current_item = current_item;
        state.dirty = true;
    }

    pub fn add_items_done(&self, delta: u64) {
        let mut state = self.progress.lock().unwrap();
        let p = &mut state.progress;
        p.items_done = (p.items_done + delta).min(if p.items_total > 0 {
            p.items_total
        } else {
            u64::MAX
        });
        state.dirty = true;
    }

    pub fn progress(&self) -> JobProgress {
        self.progress.lock().unwrap().progress.clone()
    }

    /// Write dirty progress to the repository. `force` writes even when
    /// clean (used for the final flush at a terminal transition).
    pub async fn flush_progress(&self, force: bool) -> Result<(), client_sql::Error> {
        let snapshot = {
            let mut state = self.progress.lock().unwrap();
            if !state.dirty && !force {
                return Ok(());
            }
            state.dirty = false;
            state.progress.clone()
        };
        self.repo.update_progress(self.job.job_id, &snapshot).await
    }

    /// Periodic flusher run alongside the handler; at most one write per
    /// interval.
    pub(crate) async fn flush_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.flush_interval) => {}
                _ = stop.cancelled() => return,
            }
            if let Err(err) = self.flush_progress(false).await {
                tracing::warn!(job_id = %self.job.job_id, error = %err, "progress flush failed");
            }
        }
    }
}
