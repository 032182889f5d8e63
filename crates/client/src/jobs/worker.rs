//! The worker loop: dequeue, gate, run the handler under the peer's
//! breaker, and persist the outcome before touching the next job.

use std::sync::Arc;

use chrono::Utc;
use models::{Fault, FaultKind, JobRecord, JobStatus};
use resilience::ExecuteError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::JobContext;
use super::{
    enqueue, executor_for, gate_for, get_or_create_control, notify_transition, remove_control,
    JobError, JobsInner,
};

enum RunOutcome {
    Completed,
    Canceled,
    Paused,
}

pub(crate) async fn worker_loop(inner: Arc<JobsInner>, worker_id: usize) {
    tracing::debug!(worker_id, "job worker started");
    while let Some(job_id) = inner.queue.pop(&inner.shutdown).await {
        if let Err(err) = run_one(&inner, job_id).await {
            tracing::error!(%job_id, error = format!("{err:#}"), "job dispatch failed");
        }
    }
    tracing::debug!(worker_id, "job worker stopped");
}

async fn run_one(inner: &Arc<JobsInner>, job_id: Uuid) -> anyhow::Result<()> {
    let Some(job) = inner.repo.find_job(job_id).await? else {
        remove_control(inner, job_id);
        return Ok(());
    };
    if job.status != JobStatus::Queued {
        // Canceled (or otherwise moved on) while sitting in the queue.
        return Ok(());
    }
    let control = get_or_create_control(inner, job_id, job.status);
    if control.cancel.is_cancelled() {
        finish_waiting_cancel(inner, job_id).await?;
        return Ok(());
    }

    // Dispatch checks: both referenced nodes must exist.
    for (role, node) in [
        ("source", &job.source_node_id),
        ("destination", &job.destination_node_id),
    ] {
        if let Some(node_id) = node {
            if inner.node_repo.find_by_id(node_id).await?.is_none() {
                let fault = Fault::validation(format!("unknown {role} node {node_id}"));
                fail_terminal(inner, job.clone(), fault).await?;
                return Ok(());
            }
        }
    }

    let handler = {
        let handlers = inner.handlers.read().unwrap();
        handlers.get(&job.kind).cloned()
    };
    let Some(handler) = handler else {
        let fault = Fault::validation(format!("no handler registered for {}", job.kind));
        fail_terminal(inner, job.clone(), fault).await?;
        return Ok(());
    };

    // Admission control: bounded concurrency per peer.
    let peer = job
        .destination_node_id
        .clone()
        .or_else(|| job.source_node_id.clone())
        .unwrap_or_else(|| "local".to_string());
    let gate = gate_for(inner, &peer);
    let permit = tokio::select! {
        permit = gate.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        },
        _ = control.cancel.cancelled() => {
            finish_waiting_cancel(inner, job_id).await?;
            return Ok(());
        }
        _ = inner.shutdown.cancelled() => return Ok(()),
    };

    if !inner.repo.mark_started(job_id).await? {
        // Lost the race with a cancel.
        return Ok(());
    }
    let mut job = job;
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    notify_transition(inner, &job, JobStatus::Queued, JobStatus::Running);

    let executor = executor_for(inner, &peer);
    let ctx = Arc::new(JobContext::new(
        job.clone(),
        control.clone(),
        inner.repo.clone(),
        inner.pools.clone(),
        executor.clone(),
        inner.config.progress_flush_interval,
    ));
    let flusher_stop = CancellationToken::new();
    let flusher = tokio::spawn(ctx.clone().flush_loop(flusher_stop.clone()));
    let result = executor
        .execute(|| {
            let handler = handler.clone();
            let ctx = ctx.clone();
            let job = job.clone();
            async move {
                match handler.run(&job, &ctx).await {
                    Ok(()) => Ok(RunOutcome::Completed),
                    Err(JobError::Canceled) => Ok(RunOutcome::Canceled),
                    Err(JobError::Paused) => Ok(RunOutcome::Paused),
                    Err(JobError::Fault(fault)) if fault.kind == FaultKind::Canceled => {
                        Ok(RunOutcome::Canceled)
                    }
                    Err(JobError::Fault(fault)) => Err(fault),
                }
            }
        })
        .await;

    flusher_stop.cancel();
    let _ = flusher.await;
    if let Err(err) = ctx.flush_progress(true).await {
        tracing::warn!(%job_id, error = %err, "final progress flush failed");
    }
    job.progress = ctx.progress();
    drop(permit);

    match result {
        Ok(RunOutcome::Completed) => {
            if inner.repo.mark_completed(job_id).await? {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                notify_transition(inner, &job, JobStatus::Running, JobStatus::Completed);
            }
            remove_control(inner, job_id);
        }
        Ok(RunOutcome::Canceled) => {
            if inner.repo.mark_canceled(job_id).await? {
                job.status = JobStatus::Canceled;
                job.completed_at = Some(Utc::now());
                notify_transition(inner, &job, JobStatus::Running, JobStatus::Canceled);
            }
            remove_control(inner, job_id);
        }
        Ok(RunOutcome::Paused) => {
            if inner.repo.mark_paused(job_id).await? {
                job.status = JobStatus::Paused;
                notify_transition(inner, &job, JobStatus::Running, JobStatus::Paused);
                tracing::info!(%job_id, "job paused at checkpoint");
            }
        }
        Err(ExecuteError::Open(name)) => {
            // Failed fast: the handler never ran and no wire call happened.
            let fault =
                Fault::transient(format!("service temporarily unavailable: circuit open for {name}"));
            handle_failure(inner, job, fault).await?;
        }
        Err(ExecuteError::Inner(fault)) => {
            handle_failure(inner, job, fault).await?;
        }
    }
    Ok(())
}

/// Cancellation observed while the job was still waiting to run.
async fn finish_waiting_cancel(inner: &Arc<JobsInner>, job_id: Uuid) -> anyhow::Result<()> {
    if let Some(old) = inner.repo.try_cancel(job_id).await? {
        if let Some(fresh) = inner.repo.find_job(job_id).await? {
            notify_transition(inner, &fresh, old, JobStatus::Canceled);
        }
    }
    remove_control(inner, job_id);
    Ok(())
}

async fn fail_terminal(
    inner: &Arc<JobsInner>,
    mut job: JobRecord,
    fault: Fault,
) -> anyhow::Result<()> {
    // Validation failures happen before the running transition; walk the
    // job through running so the observed transitions stay legal.
    if job.status == JobStatus::Queued {
        if !inner.repo.mark_started(job.job_id).await? {
            return Ok(());
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        notify_transition(inner, &job, JobStatus::Queued, JobStatus::Running);
    }
    let message = fault.to_string();
    if inner
        .repo
        .mark_failed(job.job_id, &message, fault.details.as_deref())
        .await?
    {
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error_message = Some(message.clone());
        tracing::error!(job_id = %job.job_id, error = %message, "job failed terminally");
        notify_transition(inner, &job, JobStatus::Running, JobStatus::Failed);
    }
    remove_control(inner, job.job_id);
    Ok(())
}

/// A handler (or the breaker) failed the execution. Retryable faults with
/// retries remaining count one retry and re-queue after the policy delay;
/// everything else is terminal.
async fn handle_failure(
    inner: &Arc<JobsInner>,
    mut job: JobRecord,
    fault: Fault,
) -> anyhow::Result<()> {
    let message = fault.to_string();
    let retryable = fault.is_retryable();

    if !inner
        .repo
        .mark_failed(job.job_id, &message, fault.details.as_deref())
        .await?
    {
        return Ok(());
    }
    job.status = JobStatus::Failed;
    job.completed_at = Some(Utc::now());
    job.error_message = Some(message.clone());
    job.error_details = fault.details.clone();

    if retryable && job.retry_count < job.max_retries {
        inner.repo.increment_retry(job.job_id).await?;
        job.retry_count += 1;
        notify_transition(inner, &job, JobStatus::Running, JobStatus::Failed);

        let delay = inner.policy.delay_for(job.retry_count);
        tracing::warn!(
            job_id = %job.job_id,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "job failed, scheduling retry"
        );
        schedule_requeue(inner.clone(), job.job_id, delay);
    } else {
        notify_transition(inner, &job, JobStatus::Running, JobStatus::Failed);
        tracing::error!(
            job_id = %job.job_id,
            retry_count = job.retry_count,
            error = %message,
            "job failed terminally"
        );
        remove_control(inner, job.job_id);
    }
    Ok(())
}

fn schedule_requeue(inner: Arc<JobsInner>, job_id: Uuid, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }
        // Only requeue when still failed: an operator cancel or manual
        // retry may have moved the job on.
        match inner.repo.mark_queued(job_id, JobStatus::Failed).await {
            Ok(true) => {
                if let Ok(Some(job)) = inner.repo.find_job(job_id).await {
                    notify_transition(&inner, &job, JobStatus::Failed, JobStatus::Queued);
                    enqueue(&inner, &job);
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(%job_id, error = %err, "retry re-queue failed");
            }
        }
    });
}
