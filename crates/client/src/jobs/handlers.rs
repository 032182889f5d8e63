//! Built-in handlers for the wire-facing job kinds. The sync cycle
//! handler lives with the sync manager.

use std::sync::Arc;

use async_trait::async_trait;
use dimse::{tags, Dataset, MoveProgress};
use models::{Fault, JobRecord};

use crate::local::LocalArchive;

use super::{JobContext, JobError, JobHandler};

fn dataset_bytes(ds: &Dataset) -> u64 {
    ds.iter().map(|(_, v)| v.len() as u64).sum()
}

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str, JobError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(JobError::Fault(Fault::validation(format!(
            "job is missing its {what} node"
        )))),
    }
}

/// C-ECHO the destination peer.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let peer = require(&job.destination_node_id, "destination")?;
        let mut conn = ctx.connect(peer).await?;
        ctx.checkpoint()?;
        conn.echo().await?;
        ctx.set_totals(1, 0);
        ctx.report(1, 0, None);
        Ok(())
    }
}

/// Push a study's instances to the destination peer, one C-STORE per SOP
/// instance. Used for store and forward jobs. Re-stores of an instance
/// the peer already holds are expected to succeed, so a re-run after a
/// partial failure converges.
pub struct StoreHandler {
    local: Arc<dyn LocalArchive>,
}

impl StoreHandler {
    pub fn new(local: Arc<dyn LocalArchive>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl JobHandler for StoreHandler {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let destination = require(&job.destination_node_id, "destination")?;
        let instances = self
            .local
            .fetch_instances(
                &job.study_uid,
                job.series_uid.as_deref(),
                &job.sop_instance_uids,
            )
            .await?;
        if instances.is_empty() {
            return Err(JobError::Fault(Fault::data(format!(
                "study {} has no matching instances to send",
                job.study_uid
            ))));
        }

        let bytes_total: u64 = instances.iter().map(dataset_bytes).sum();
        ctx.set_totals(instances.len() as u64, bytes_total);

        let mut conn = ctx.connect(destination).await?;
        let mut items_done = 0u64;
        let mut bytes_done = 0u64;
        for instance in &instances {
            ctx.checkpoint()?;
            let mut progress = |_done: u64, _total: u64| true;
            conn.store(instance, &mut progress).await?;
            items_done += 1;
            bytes_done += dataset_bytes(instance);
            ctx.report(
                items_done,
                bytes_done,
                instance.sop_instance_uid().map(str::to_string),
            );
        }
        ctx.checkpoint()?;
        Ok(())
    }
}

/// C-MOVE a study from the source peer back to us. Used for retrieve and
/// prefetch jobs. Cancellation and pause are observed between
/// sub-operations.
pub struct RetrieveHandler {
    calling_ae: String,
}

impl RetrieveHandler {
    pub fn new(calling_ae: impl Into<String>) -> Self {
        Self {
            calling_ae: calling_ae.into(),
        }
    }
}

#[async_trait]
impl JobHandler for RetrieveHandler {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let source = require(&job.source_node_id, "source")?;
        if job.study_uid.is_empty() {
            return Err(JobError::Fault(Fault::validation(
                "retrieve job is missing a study uid",
            )));
        }

        let mut query = Dataset::new().with(tags::STUDY_INSTANCE_UID, job.study_uid.clone());
        if let Some(series) = &job.series_uid {
            query.set(tags::SERIES_INSTANCE_UID, series.clone());
        }

        let mut conn = ctx.connect(source).await?;
        ctx.checkpoint()?;

        let mut progress = |p: MoveProgress| {
            if p.total > 0 {
                ctx.set_totals(p.total, 0);
            }
            ctx.report(p.completed, 0, p.current);
            !ctx.is_cancel_requested() && !ctx.is_pause_requested()
        };

        match conn
            .move_study(&self.calling_ae, &query, &mut progress)
            .await
        {
            Ok(()) => {
                ctx.checkpoint()?;
                Ok(())
            }
            Err(dimse::Error::Aborted(_)) if ctx.is_cancel_requested() => Err(JobError::Canceled),
            Err(dimse::Error::Aborted(_)) if ctx.is_pause_requested() => Err(JobError::Paused),
            Err(err) => Err(err.into()),
        }
    }
}

/// C-FIND against the source peer; the result count lands in progress.
pub struct QueryHandler;

#[async_trait]
impl JobHandler for QueryHandler {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let source = require(&job.source_node_id, "source")?;

        let mut query = Dataset::new();
        if !job.study_uid.is_empty() {
            query.set(tags::STUDY_INSTANCE_UID, job.study_uid.clone());
        }
        if let Some(patient_id) = job.metadata.get("patient_id") {
            query.set(tags::PATIENT_ID, patient_id.clone());
        }
        if let Some(modality) = job.metadata.get("modality") {
            query.set(tags::MODALITY, modality.clone());
        }

        let mut conn = ctx.connect(source).await?;
        ctx.checkpoint()?;
        let results = conn.find(&query).await?;
        ctx.checkpoint()?;

        let n = results.len() as u64;
        ctx.set_totals(n, 0);
        ctx.report(n, 0, None);
        tracing::debug!(job_id = %job.job_id, results = n, "query finished");
        Ok(())
    }
}
