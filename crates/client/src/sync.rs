//! Bidirectional reconciliation. Each enabled config periodically runs a
//! cycle job that queries both sides, classifies divergences, applies the
//! configured resolution by submitting child retrieve/store jobs, records
//! manual conflicts, and writes a history row.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_sql::{
    truncate_to_seconds, SyncConfigRepository, SyncConflictRepository, SyncHistoryRepository,
};
use dimse::Dataset;
use models::{
    ConflictKind, ConflictPolicy, Fault, JobKind, JobRecord, StudyFilter, StudySummary,
    SyncConfig, SyncConflict, SyncDirection, SyncRunRecord,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::jobs::{JobContext, JobError, JobHandler};
use crate::local::LocalArchive;
use crate::pools::Pools;
use crate::JobSubmitter;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync config {0} not found")]
    ConfigNotFound(String),
    #[error("conflict for study {0} not found")]
    ConflictNotFound(String),
    #[error("conflict for study {0} is already resolved")]
    AlreadyResolved(String),
    #[error("invalid sync config: {0}")]
    Validation(String),
    #[error("job submission failed: {0}")]
    Submit(#[from] crate::jobs::JobApiError),
    #[error(transparent)]
    Storage(#[from] client_sql::Error),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How often the cron evaluator wakes.
    pub schedule_tick: Duration,
    /// How long a cycle waits for each child job.
    pub child_wait: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            schedule_tick: Duration::from_secs(30),
            child_wait: Duration::from_secs(300),
        }
    }
}

struct SyncShared {
    configs: SyncConfigRepository,
    conflicts: SyncConflictRepository,
    history: SyncHistoryRepository,
    submitter: Arc<dyn JobSubmitter>,
    audit: Arc<dyn AuditSink>,
}

pub struct SyncManager {
    settings: SyncSettings,
    shared: Arc<SyncShared>,
    shutdown: CancellationToken,
    ticker: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        settings: SyncSettings,
        configs: SyncConfigRepository,
        conflicts: SyncConflictRepository,
        history: SyncHistoryRepository,
        submitter: Arc<dyn JobSubmitter>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            settings,
            shared: Arc::new(SyncShared {
                configs,
                conflicts,
                history,
                submitter,
                audit,
            }),
            shutdown: CancellationToken::new(),
            ticker: StdMutex::new(None),
        }
    }

    pub async fn create_config(&self, config: SyncConfig) -> Result<(), SyncError> {
        validate_config(&config)?;
        self.shared.configs.save(&config).await?;
        Ok(())
    }

    pub async fn update_config(&self, config: SyncConfig) -> Result<(), SyncError> {
        validate_config(&config)?;
        if !self.shared.configs.exists(&config.config_id).await? {
            return Err(SyncError::ConfigNotFound(config.config_id));
        }
        self.shared.configs.save(&config).await?;
        Ok(())
    }

    pub async fn delete_config(&self, config_id: &str) -> Result<(), SyncError> {
        if !self.shared.configs.remove(&config_id.to_string()).await? {
            return Err(SyncError::ConfigNotFound(config_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_enabled(&self, config_id: &str, enabled: bool) -> Result<(), SyncError> {
        if !self.shared.configs.exists(&config_id.to_string()).await? {
            return Err(SyncError::ConfigNotFound(config_id.to_string()));
        }
        Ok(self.shared.configs.set_enabled(config_id, enabled).await?)
    }

    pub async fn list_configs(&self) -> Result<Vec<SyncConfig>, SyncError> {
        Ok(self.shared.configs.find_all(None).await?)
    }

    /// Submit a sync cycle for the config now. Returns the cycle job id.
    pub async fn run_config(&self, config_id: &str) -> Result<Uuid, SyncError> {
        let config = self
            .shared
            .configs
            .find_by_id(&config_id.to_string())
            .await?
            .ok_or_else(|| SyncError::ConfigNotFound(config_id.to_string()))?;
        submit_cycle(&self.shared, &config).await
    }

    pub async fn list_conflicts(&self, config_id: Option<&str>) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(match config_id {
            Some(config_id) => self.shared.conflicts.find_by_config(config_id).await?,
            None => self.shared.conflicts.find_unresolved().await?,
        })
    }

    /// Resolve a recorded conflict. When the chosen resolution implies a
    /// transfer, the corrective job is submitted and its id returned.
    pub async fn resolve(
        &self,
        study_uid: &str,
        resolution: ConflictPolicy,
    ) -> Result<Option<Uuid>, SyncError> {
        let conflict = self
            .shared
            .conflicts
            .find_by_id(&study_uid.to_string())
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(study_uid.to_string()))?;
        if conflict.resolved {
            return Err(SyncError::AlreadyResolved(study_uid.to_string()));
        }
        let config = self
            .shared
            .configs
            .find_by_id(&conflict.config_id)
            .await?
            .ok_or_else(|| SyncError::ConfigNotFound(conflict.config_id.clone()))?;

        let action = resolution_action(resolution, &conflict);
        self.shared
            .conflicts
            .mark_resolved(study_uid, resolution)
            .await?;

        let job_id = match action {
            Some(PlannedTransfer::Pull) => Some(
                self.shared
                    .submitter
                    .submit_job(child_job(
                        PlannedTransfer::Pull,
                        &config,
                        study_uid,
                        models::JobPriority::Normal,
                    ))
                    .await?,
            ),
            Some(PlannedTransfer::Push) => Some(
                self.shared
                    .submitter
                    .submit_job(child_job(
                        PlannedTransfer::Push,
                        &config,
                        study_uid,
                        models::JobPriority::Normal,
                    ))
                    .await?,
            ),
            None => None,
        };
        tracing::info!(
            study_uid,
            resolution = resolution.as_str(),
            corrective_job = ?job_id,
            "sync conflict resolved"
        );
        Ok(job_id)
    }

    pub async fn history(&self, config_id: &str, limit: usize) -> Result<Vec<SyncRunRecord>, SyncError> {
        Ok(self.shared.history.find_by_config(config_id, limit).await?)
    }

    /// Retention: drop resolved conflicts and old history rows.
    pub async fn cleanup_old(&self, max_age: Duration) -> Result<u64, SyncError> {
        let conflicts = self.shared.conflicts.cleanup_resolved(max_age).await?;
        let history = self.shared.history.cleanup_old(max_age).await?;
        Ok(conflicts + history)
    }

    /// Start the cron evaluator for scheduled configs.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let tick = self.settings.schedule_tick;
        let handle = tokio::spawn(async move {
            // Per config, the next occurrence we are waiting on.
            let mut armed: HashMap<String, DateTime<Utc>> = HashMap::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.cancelled() => return,
                }
                if let Err(err) = evaluate_schedules(&shared, &mut armed).await {
                    tracing::warn!(error = %err, "sync schedule evaluation failed");
                }
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.ticker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn validate_config(config: &SyncConfig) -> Result<(), SyncError> {
    if config.config_id.is_empty() {
        return Err(SyncError::Validation("config_id must not be empty".into()));
    }
    if config.remote_node_id.is_empty() {
        return Err(SyncError::Validation(
            "remote_node_id must not be empty".into(),
        ));
    }
    if let Some(expr) = &config.schedule_cron {
        cron::Schedule::from_str(expr)
            .map_err(|err| SyncError::Validation(format!("bad cron expression {expr:?}: {err}")))?;
    }
    Ok(())
}

async fn submit_cycle(shared: &Arc<SyncShared>, config: &SyncConfig) -> Result<Uuid, SyncError> {
    let kind = match config.direction {
        SyncDirection::Push => JobKind::SyncPush,
        SyncDirection::Pull | SyncDirection::Bidirectional => JobKind::SyncPull,
    };
    let mut job = JobRecord::new(kind);
    match kind {
        JobKind::SyncPush => job.destination_node_id = Some(config.remote_node_id.clone()),
        _ => job.source_node_id = Some(config.remote_node_id.clone()),
    }
    job.created_by = "sync".to_string();
    job.parent_rule_id = Some(config.config_id.clone());
    job.metadata
        .insert("config_id".to_string(), config.config_id.clone());
    Ok(shared.submitter.submit_job(job).await?)
}

/// Arm each scheduled config with its next cron occurrence; fire once the
/// armed occurrence passes, then re-arm.
async fn evaluate_schedules(
    shared: &Arc<SyncShared>,
    armed: &mut HashMap<String, DateTime<Utc>>,
) -> Result<(), SyncError> {
    let configs = shared.configs.find_enabled().await?;
    let now = Utc::now();
    armed.retain(|config_id, _| configs.iter().any(|c| &c.config_id == config_id));

    for config in &configs {
        let Some(expr) = &config.schedule_cron else {
            continue;
        };
        let Ok(schedule) = cron::Schedule::from_str(expr) else {
            tracing::warn!(config_id = %config.config_id, "bad cron expression");
            continue;
        };
        let Some(next) = schedule.after(&now).next() else {
            continue;
        };

        match armed.get(&config.config_id) {
            Some(due) if *due <= now => {
                armed.insert(config.config_id.clone(), next);
                tracing::info!(config_id = %config.config_id, "scheduled sync firing");
                if let Err(err) = submit_cycle(shared, config).await {
                    tracing::warn!(config_id = %config.config_id, error = %err, "scheduled sync failed");
                }
            }
            Some(_) => {}
            None => {
                armed.insert(config.config_id.clone(), next);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannedTransfer {
    /// Retrieve from the remote into the local archive.
    Pull,
    /// Store the local copy out to the remote.
    Push,
}

enum Plan {
    Transfer(PlannedTransfer),
    Conflict,
}

fn classify(local: Option<&StudySummary>, remote: Option<&StudySummary>) -> Option<ConflictKind> {
    match (local, remote) {
        (None, None) => None,
        (None, Some(_)) => Some(ConflictKind::MissingLocal),
        (Some(_), None) => Some(ConflictKind::MissingRemote),
        (Some(l), Some(r)) => {
            if l.instance_count != r.instance_count {
                Some(ConflictKind::CountMismatch)
            } else if l.last_modified.is_some()
                && r.last_modified.is_some()
                && l.last_modified != r.last_modified
            {
                Some(ConflictKind::ModifiedBoth)
            } else {
                None
            }
        }
    }
}

/// Which transfer the policy implies for a divergence, or a conflict row
/// when the policy is manual, the preferred side lacks the study, or the
/// config's direction forbids the transfer.
fn plan(
    policy: ConflictPolicy,
    direction: SyncDirection,
    local: Option<&StudySummary>,
    remote: Option<&StudySummary>,
) -> Plan {
    let transfer = match policy {
        ConflictPolicy::Manual => return Plan::Conflict,
        ConflictPolicy::PreferLocal => PlannedTransfer::Push,
        ConflictPolicy::PreferRemote => PlannedTransfer::Pull,
        ConflictPolicy::NewestWins => {
            match (
                local.and_then(|l| l.last_modified),
                remote.and_then(|r| r.last_modified),
            ) {
                (Some(l), Some(r)) if l > r => PlannedTransfer::Push,
                (Some(l), Some(r)) if r > l => PlannedTransfer::Pull,
                _ => return Plan::Conflict,
            }
        }
    };

    let preferred_exists = match transfer {
        PlannedTransfer::Push => local.is_some(),
        PlannedTransfer::Pull => remote.is_some(),
    };
    if !preferred_exists {
        return Plan::Conflict;
    }

    let allowed = matches!(
        (direction, transfer),
        (SyncDirection::Pull, PlannedTransfer::Pull)
            | (SyncDirection::Push, PlannedTransfer::Push)
            | (SyncDirection::Bidirectional, _)
    );
    if !allowed {
        return Plan::Conflict;
    }
    Plan::Transfer(transfer)
}

fn child_job(
    transfer: PlannedTransfer,
    config: &SyncConfig,
    study_uid: &str,
    priority: models::JobPriority,
) -> JobRecord {
    let mut job = match transfer {
        PlannedTransfer::Pull => {
            let mut job = JobRecord::new(JobKind::Retrieve);
            job.source_node_id = Some(config.remote_node_id.clone());
            job
        }
        PlannedTransfer::Push => {
            let mut job = JobRecord::new(JobKind::Store);
            job.destination_node_id = Some(config.remote_node_id.clone());
            job
        }
    };
    job.study_uid = study_uid.to_string();
    job.priority = priority;
    job.created_by = "sync".to_string();
    job.parent_rule_id = Some(config.config_id.clone());
    job.metadata
        .insert("config_id".to_string(), config.config_id.clone());
    job
}

fn summary_from_dataset(ds: &Dataset) -> Option<StudySummary> {
    Some(StudySummary {
        study_uid: ds.study_uid()?.to_string(),
        patient_id: ds.patient_id().unwrap_or_default().to_string(),
        modality: ds.modality().unwrap_or_default().to_string(),
        instance_count: ds.instance_count().unwrap_or(0),
        last_modified: ds.last_modified(),
    })
}

fn filter_allows(filter: &StudyFilter, summary: &StudySummary) -> bool {
    if !filter.modalities.is_empty() && !filter.modalities.contains(&summary.modality) {
        return false;
    }
    if let Some(patient_id) = &filter.patient_id {
        if &summary.patient_id != patient_id {
            return false;
        }
    }
    true
}

/// The handler behind sync cycle jobs (kinds `sync_pull` / `sync_push`).
pub struct SyncCycleHandler {
    configs: SyncConfigRepository,
    conflicts: SyncConflictRepository,
    history: SyncHistoryRepository,
    submitter: Arc<dyn JobSubmitter>,
    pools: Arc<Pools>,
    local: Arc<dyn LocalArchive>,
    audit: Arc<dyn AuditSink>,
    child_wait: Duration,
}

impl SyncCycleHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configs: SyncConfigRepository,
        conflicts: SyncConflictRepository,
        history: SyncHistoryRepository,
        submitter: Arc<dyn JobSubmitter>,
        pools: Arc<Pools>,
        local: Arc<dyn LocalArchive>,
        audit: Arc<dyn AuditSink>,
        child_wait: Duration,
    ) -> Self {
        Self {
            configs,
            conflicts,
            history,
            submitter,
            pools,
            local,
            audit,
            child_wait,
        }
    }

    async fn query_remote(&self, config: &SyncConfig) -> Result<Vec<StudySummary>, Fault> {
        let pool = self.pools.for_node(&config.remote_node_id).await?;
        let mut conn = pool
            .borrow()
            .await
            .map_err(|err| Fault::resource(err.to_string()))?;
        let query = Dataset::new().with(dimse::tags::STUDY_INSTANCE_UID, "");
        let results = conn.find(&query).await.map_err(|err| err.fault())?;
        Ok(results
            .iter()
            .filter_map(summary_from_dataset)
            .filter(|summary| filter_allows(&config.filter, summary))
            .collect())
    }

    async fn record_run(
        &self,
        job: &JobRecord,
        config_id: &str,
        started_at: DateTime<Utc>,
        checked: u64,
        synced: u64,
        conflicts: u64,
        errors: &[String],
    ) {
        let run = SyncRunRecord {
            pk: 0,
            config_id: config_id.to_string(),
            job_id: job.job_id,
            success: errors.is_empty(),
            studies_checked: checked,
            studies_synced: synced,
            conflicts_found: conflicts,
            errors: errors.to_vec(),
            started_at: truncate_to_seconds(started_at),
            finished_at: truncate_to_seconds(Utc::now()),
        };
        if let Err(err) = self.history.insert(&run).await {
            tracing::error!(config_id, error = %err, "sync history write failed");
        }
    }
}

#[async_trait]
impl JobHandler for SyncCycleHandler {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let started_at = Utc::now();
        let config_id = job
            .metadata
            .get("config_id")
            .cloned()
            .ok_or_else(|| Fault::validation("sync job is missing its config_id"))?;
        let config = self
            .configs
            .find_by_id(&config_id)
            .await
            .map_err(|err| Fault::resource(err.to_string()))?
            .ok_or_else(|| Fault::validation(format!("unknown sync config {config_id}")))?;

        ctx.checkpoint()?;
        let remote = match self.query_remote(&config).await {
            Ok(remote) => remote,
            Err(fault) => {
                let message = fault.to_string();
                self.record_run(job, &config_id, started_at, 0, 0, 0, &[message])
                    .await;
                return Err(fault.into());
            }
        };
        let local = self
            .local
            .query_studies(&config.filter)
            .await
            .map_err(JobError::Fault)?;
        ctx.checkpoint()?;

        let local_map: HashMap<&str, &StudySummary> = local
            .iter()
            .map(|summary| (summary.study_uid.as_str(), summary))
            .collect();
        let remote_map: HashMap<&str, &StudySummary> = remote
            .iter()
            .map(|summary| (summary.study_uid.as_str(), summary))
            .collect();
        let mut all_uids: Vec<&str> = local_map.keys().chain(remote_map.keys()).copied().collect();
        all_uids.sort_unstable();
        all_uids.dedup();

        let checked = all_uids.len() as u64;
        ctx.set_totals(checked, 0);
        let mut conflicts_found = 0u64;
        let mut errors: Vec<String> = Vec::new();
        let mut children: Vec<Uuid> = Vec::new();

        for (i, study_uid) in all_uids.iter().enumerate() {
            ctx.checkpoint()?;
            let local_side = local_map.get(study_uid).copied();
            let remote_side = remote_map.get(study_uid).copied();
            let Some(kind) = classify(local_side, remote_side) else {
                ctx.report(i as u64 + 1, 0, Some(study_uid.to_string()));
                continue;
            };

            match plan(config.conflict_policy, config.direction, local_side, remote_side) {
                Plan::Transfer(transfer) => {
                    let child = child_job(transfer, &config, study_uid, job.priority);
                    match self.submitter.submit_job(child).await {
                        Ok(child_id) => children.push(child_id),
                        Err(err) => {
                            errors.push(format!("submit for {study_uid} failed: {err}"));
                        }
                    }
                }
                Plan::Conflict => {
                    let conflict = SyncConflict {
                        pk: 0,
                        study_uid: study_uid.to_string(),
                        config_id: config_id.clone(),
                        kind,
                        local_last_modified: local_side.and_then(|s| s.last_modified),
                        remote_last_modified: remote_side.and_then(|s| s.last_modified),
                        local_instance_count: local_side.map(|s| s.instance_count),
                        remote_instance_count: remote_side.map(|s| s.instance_count),
                        resolved: false,
                        resolution_used: None,
                        detected_at: truncate_to_seconds(Utc::now()),
                        resolved_at: None,
                    };
                    if let Err(err) = self.conflicts.save(&conflict).await {
                        errors.push(format!("conflict record for {study_uid} failed: {err}"));
                    } else {
                        conflicts_found += 1;
                        self.audit
                            .emit(AuditEvent::ConflictDetected { conflict: &conflict });
                    }
                }
            }
            ctx.report(i as u64 + 1, 0, Some(study_uid.to_string()));
        }

        // Await the children inside this job's cancellation scope.
        let mut synced = 0u64;
        let cancel = ctx.cancellation();
        for (i, child_id) in children.iter().enumerate() {
            let waited = tokio::select! {
                waited = self.submitter.wait_job(*child_id, self.child_wait) => waited,
                _ = cancel.cancelled() => {
                    for other in &children[i..] {
                        let _ = self.submitter.cancel_job(*other).await;
                    }
                    errors.push("cycle canceled".to_string());
                    self.record_run(
                        job, &config_id, started_at, checked, synced, conflicts_found, &errors,
                    )
                    .await;
                    return Err(JobError::Canceled);
                }
            };
            match waited {
                Ok(child) if child.status == models::JobStatus::Completed => synced += 1,
                Ok(child) => errors.push(format!(
                    "child job {child_id} ended {}: {}",
                    child.status,
                    child.error_message.unwrap_or_default()
                )),
                Err(err) => errors.push(format!("waiting for child {child_id} failed: {err}")),
            }
        }

        self.record_run(
            job, &config_id, started_at, checked, synced, conflicts_found, &errors,
        )
        .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(JobError::Fault(Fault::transient(format!(
                "sync cycle finished with {} errors",
                errors.len()
            ))
            .with_details(errors.join("; "))))
        }
    }
}

fn resolution_action(resolution: ConflictPolicy, conflict: &SyncConflict) -> Option<PlannedTransfer> {
    match resolution {
        ConflictPolicy::Manual => None,
        ConflictPolicy::PreferRemote => {
            // The remote copy must exist to pull from.
            (conflict.kind != ConflictKind::MissingRemote).then_some(PlannedTransfer::Pull)
        }
        ConflictPolicy::PreferLocal => {
            (conflict.kind != ConflictKind::MissingLocal).then_some(PlannedTransfer::Push)
        }
        ConflictPolicy::NewestWins => {
            match (conflict.local_last_modified, conflict.remote_last_modified) {
                (Some(l), Some(r)) if l > r => Some(PlannedTransfer::Push),
                (Some(l), Some(r)) if r > l => Some(PlannedTransfer::Pull),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn summary(uid: &str, count: i64, ts: Option<&str>) -> StudySummary {
        StudySummary {
            study_uid: uid.to_string(),
            patient_id: "P-1".to_string(),
            modality: "CT".to_string(),
            instance_count: count,
            last_modified: ts.map(|t| {
                DateTime::parse_from_rfc3339(t)
                    .unwrap()
                    .with_timezone(&Utc)
            }),
        }
    }

    #[test]
    fn classification_covers_the_four_kinds() {
        let l = summary("1", 10, Some("2025-01-02T00:00:00Z"));
        let r_more = summary("1", 12, Some("2025-01-02T00:00:00Z"));
        let r_newer = summary("1", 10, Some("2025-01-03T00:00:00Z"));
        let r_same = summary("1", 10, Some("2025-01-02T00:00:00Z"));

        assert_eq!(classify(None, Some(&r_same)), Some(ConflictKind::MissingLocal));
        assert_eq!(classify(Some(&l), None), Some(ConflictKind::MissingRemote));
        assert_eq!(
            classify(Some(&l), Some(&r_more)),
            Some(ConflictKind::CountMismatch)
        );
        assert_eq!(
            classify(Some(&l), Some(&r_newer)),
            Some(ConflictKind::ModifiedBoth)
        );
        assert_eq!(classify(Some(&l), Some(&r_same)), None);
        assert_eq!(classify(None, None), None);
    }

    #[test]
    fn plans_follow_policy_direction_and_availability() {
        let l = summary("1", 10, Some("2025-01-02T00:00:00Z"));
        let r = summary("1", 12, Some("2025-01-03T00:00:00Z"));

        assert!(matches!(
            plan(ConflictPolicy::Manual, SyncDirection::Bidirectional, Some(&l), Some(&r)),
            Plan::Conflict
        ));
        assert!(matches!(
            plan(ConflictPolicy::PreferRemote, SyncDirection::Pull, Some(&l), Some(&r)),
            Plan::Transfer(PlannedTransfer::Pull)
        ));
        assert!(matches!(
            plan(ConflictPolicy::PreferLocal, SyncDirection::Push, Some(&l), Some(&r)),
            Plan::Transfer(PlannedTransfer::Push)
        ));
        // Newest side wins on timestamps.
        assert!(matches!(
            plan(ConflictPolicy::NewestWins, SyncDirection::Bidirectional, Some(&l), Some(&r)),
            Plan::Transfer(PlannedTransfer::Pull)
        ));
        // Preferring a side that lacks the study records a conflict.
        assert!(matches!(
            plan(ConflictPolicy::PreferLocal, SyncDirection::Bidirectional, None, Some(&r)),
            Plan::Conflict
        ));
        // A pull-only config cannot push.
        assert!(matches!(
            plan(ConflictPolicy::PreferLocal, SyncDirection::Pull, Some(&l), Some(&r)),
            Plan::Conflict
        ));
    }
}
