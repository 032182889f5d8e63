//! Trigger-driven speculative retrieval: worklist arrivals and new
//! studies pull a patient's priors; cron-scheduled rules sweep their
//! sources. History rows keyed by study uid suppress duplicate fetches,
//! and job completion flips them to completed or failed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use client_sql::{PrefetchHistoryRepository, PrefetchRuleRepository};
use dimse::{tags, Dataset};
use models::{
    JobKind, JobRecord, PrefetchHistoryEntry, PrefetchRule, PrefetchStatus, PrefetchTrigger,
};
use tokio_util::sync::CancellationToken;

use crate::local::LocalArchive;
use crate::pools::Pools;
use crate::JobSubmitter;

#[derive(Debug, thiserror::Error)]
pub enum PrefetchError {
    #[error("prefetch rule {0} not found")]
    NotFound(String),
    #[error("invalid prefetch rule: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] client_sql::Error),
}

/// A scheduled procedure step delivered by the worklist SCU.
#[derive(Debug, Clone)]
pub struct WorklistEntry {
    pub patient_id: String,
    pub modality: String,
    pub station_ae: String,
    pub scheduled_at: DateTime<Utc>,
    pub accession_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// How often the cron evaluator wakes.
    pub schedule_tick: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            schedule_tick: Duration::from_secs(30),
        }
    }
}

struct PrefetchInner {
    config: PrefetchConfig,
    rules: PrefetchRuleRepository,
    history: PrefetchHistoryRepository,
    submitter: Arc<dyn JobSubmitter>,
    pools: Arc<Pools>,
    local: Arc<dyn LocalArchive>,
    /// Cron occurrences already fired, so a tick never double-fires.
    fired: StdMutex<HashMap<String, DateTime<Utc>>>,
    shutdown: CancellationToken,
}

pub struct PrefetchManager {
    inner: Arc<PrefetchInner>,
    ticker: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PrefetchManager {
    pub fn new(
        config: PrefetchConfig,
        rules: PrefetchRuleRepository,
        history: PrefetchHistoryRepository,
        submitter: Arc<dyn JobSubmitter>,
        pools: Arc<Pools>,
        local: Arc<dyn LocalArchive>,
    ) -> Self {
        Self {
            inner: Arc::new(PrefetchInner {
                config,
                rules,
                history,
                submitter,
                pools,
                local,
                fired: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
            ticker: StdMutex::new(None),
        }
    }

    /// Start the cron evaluator.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.schedule_tick) => {}
                    _ = inner.shutdown.cancelled() => return,
                }
                if let Err(err) = evaluate_schedules(&inner).await {
                    tracing::warn!(error = %err, "prefetch schedule evaluation failed");
                }
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.ticker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn create_rule(&self, rule: PrefetchRule) -> Result<(), PrefetchError> {
        validate_rule(&rule)?;
        self.inner.rules.save(&rule).await?;
        Ok(())
    }

    pub async fn update_rule(&self, rule: PrefetchRule) -> Result<(), PrefetchError> {
        validate_rule(&rule)?;
        if !self.inner.rules.exists(&rule.rule_id).await? {
            return Err(PrefetchError::NotFound(rule.rule_id));
        }
        self.inner.rules.save(&rule).await?;
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), PrefetchError> {
        if !self.inner.rules.remove(&rule_id.to_string()).await? {
            return Err(PrefetchError::NotFound(rule_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), PrefetchError> {
        if !self.inner.rules.exists(&rule_id.to_string()).await? {
            return Err(PrefetchError::NotFound(rule_id.to_string()));
        }
        Ok(self.inner.rules.set_enabled(rule_id, enabled).await?)
    }

    pub async fn list_rules(&self) -> Result<Vec<PrefetchRule>, PrefetchError> {
        Ok(self.inner.rules.find_all(None).await?)
    }

    /// Worklist delivery: fetch priors for each scheduled patient whose
    /// entry matches a worklist-triggered rule.
    pub async fn on_worklist(&self, entries: &[WorklistEntry]) -> Result<usize, PrefetchError> {
        let rules = self
            .inner
            .rules
            .find_by_trigger(PrefetchTrigger::WorklistScheduled)
            .await?;
        let mut submitted = 0;
        for entry in entries {
            for rule in rules.iter().filter(|r| r.enabled) {
                if !filter_matches(&rule.modality_filter, Some(&entry.modality)) {
                    continue;
                }
                if !filter_matches(&rule.station_ae_filter, Some(&entry.station_ae)) {
                    continue;
                }
                submitted +=
                    prefetch_priors(&self.inner, rule, &entry.patient_id, None).await?;
            }
        }
        Ok(submitted)
    }

    /// Inbound store of a new study: fetch the patient's priors from the
    /// configured sources, skipping anything already local or in flight.
    pub async fn on_study_arrival(&self, dataset: &Dataset) -> Result<usize, PrefetchError> {
        let Some(patient_id) = dataset.patient_id() else {
            return Ok(0);
        };
        let arrived_study = dataset.study_uid();

        let rules = self
            .inner
            .rules
            .find_by_trigger(PrefetchTrigger::StudyArrival)
            .await?;
        let mut submitted = 0;
        for rule in rules.iter().filter(|r| r.enabled) {
            if !filter_matches(&rule.modality_filter, dataset.modality()) {
                continue;
            }
            if !filter_matches(
                &rule.body_part_filter,
                dataset.get(tags::BODY_PART_EXAMINED),
            ) {
                continue;
            }
            submitted +=
                prefetch_priors(&self.inner, rule, patient_id, arrived_study).await?;
        }
        Ok(submitted)
    }

    /// Manually fire a rule: patient-driven rules are not runnable this
    /// way; schedule and manual rules sweep their sources.
    pub async fn run_rule(&self, rule_id: &str) -> Result<usize, PrefetchError> {
        let rule = self
            .inner
            .rules
            .find_by_id(&rule_id.to_string())
            .await?
            .ok_or_else(|| PrefetchError::NotFound(rule_id.to_string()))?;
        sweep_rule(&self.inner, &rule).await
    }

    /// Mark the history row for a finished prefetch job. Wired to the job
    /// manager's transition stream by the system composition.
    pub async fn on_job_finished(&self, job: &JobRecord, succeeded: bool) {
        if job.kind != JobKind::Prefetch || job.study_uid.is_empty() {
            return;
        }
        let status = if succeeded {
            PrefetchStatus::Completed
        } else {
            PrefetchStatus::Failed
        };
        if let Err(err) = self.inner.history.set_status(&job.study_uid, status).await {
            tracing::warn!(
                study_uid = %job.study_uid,
                error = %err,
                "prefetch history update failed"
            );
        }
    }

    pub async fn cleanup_history(&self, max_age: Duration) -> Result<u64, PrefetchError> {
        Ok(self.inner.history.cleanup_old(max_age).await?)
    }
}

fn validate_rule(rule: &PrefetchRule) -> Result<(), PrefetchError> {
    if rule.rule_id.is_empty() {
        return Err(PrefetchError::Validation("rule_id must not be empty".into()));
    }
    if rule.source_node_ids.is_empty() {
        return Err(PrefetchError::Validation(
            "rule has no source nodes".into(),
        ));
    }
    if rule.trigger == PrefetchTrigger::Schedule {
        let Some(expr) = &rule.schedule_cron else {
            return Err(PrefetchError::Validation(
                "scheduled rule requires a cron expression".into(),
            ));
        };
        cron::Schedule::from_str(expr).map_err(|err| {
            PrefetchError::Validation(format!("bad cron expression {expr:?}: {err}"))
        })?;
    }
    Ok(())
}

fn filter_matches(filter: &Option<String>, value: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(wanted) => value == Some(wanted.as_str()),
    }
}

/// Query each source for the patient's studies and submit retrieve jobs
/// for the priors that pass the rule's filters and the dedup checks.
async fn prefetch_priors(
    inner: &Arc<PrefetchInner>,
    rule: &PrefetchRule,
    patient_id: &str,
    exclude_study: Option<&str>,
) -> Result<usize, PrefetchError> {
    inner.rules.increment_triggered(&rule.rule_id).await?;
    let query = Dataset::new().with(tags::PATIENT_ID, patient_id.to_string());
    let submitted = fetch_candidates(inner, rule, &query, exclude_study, patient_id).await?;
    Ok(submitted)
}

/// Schedule/manual sweep: query each source for studies matching the
/// rule's modality filter, patient-independent.
async fn sweep_rule(inner: &Arc<PrefetchInner>, rule: &PrefetchRule) -> Result<usize, PrefetchError> {
    inner.rules.increment_triggered(&rule.rule_id).await?;
    let mut query = Dataset::new();
    if let Some(modality) = &rule.modality_filter {
        query.set(tags::MODALITY, modality.clone());
    }
    fetch_candidates(inner, rule, &query, None, "").await
}

async fn fetch_candidates(
    inner: &Arc<PrefetchInner>,
    rule: &PrefetchRule,
    query: &Dataset,
    exclude_study: Option<&str>,
    fallback_patient: &str,
) -> Result<usize, PrefetchError> {
    let lookback =
        chrono::Duration::from_std(rule.prior_lookback).unwrap_or_else(|_| chrono::Duration::max_value());
    let cutoff = Utc::now() - lookback;
    let mut submitted = 0usize;

    'sources: for source in &rule.source_node_ids {
        let candidates = match query_source(inner, source, query).await {
            Ok(candidates) => candidates,
            Err(message) => {
                tracing::warn!(source, rule_id = %rule.rule_id, error = %message, "prior query failed");
                continue;
            }
        };

        for candidate in candidates {
            if submitted as u32 >= rule.max_prior_studies {
                break 'sources;
            }
            let Some(study_uid) = candidate.study_uid().map(str::to_string) else {
                continue;
            };
            if exclude_study == Some(study_uid.as_str()) {
                continue;
            }
            if !rule.prior_modalities.is_empty() {
                let modality = candidate.modality().unwrap_or_default();
                if !rule.prior_modalities.iter().any(|m| m == modality) {
                    continue;
                }
            }
            if let Some(ts) = candidate.last_modified() {
                if ts < cutoff {
                    continue;
                }
            }
            if inner
                .local
                .has_study(&study_uid)
                .await
                .unwrap_or(false)
            {
                continue;
            }
            if inner.history.is_fetched_or_pending(&study_uid).await? {
                continue;
            }

            let patient_id = candidate
                .patient_id()
                .unwrap_or(fallback_patient)
                .to_string();
            let entry = PrefetchHistoryEntry {
                pk: 0,
                patient_id: patient_id.clone(),
                study_uid: study_uid.clone(),
                source_node_id: source.clone(),
                rule_id: rule.rule_id.clone(),
                status: PrefetchStatus::Pending,
                created_at: client_sql::truncate_to_seconds(Utc::now()),
            };
            inner.history.insert(&entry).await?;

            let mut job = JobRecord::new(JobKind::Prefetch);
            job.source_node_id = Some(source.clone());
            job.study_uid = study_uid.clone();
            job.parent_rule_id = Some(rule.rule_id.clone());
            job.created_by = "prefetch".to_string();
            job.metadata.insert("patient_id".to_string(), patient_id);

            match inner.submitter.submit_job(job).await {
                Ok(_) => submitted += 1,
                Err(err) => {
                    tracing::warn!(
                        rule_id = %rule.rule_id,
                        %study_uid,
                        error = %err,
                        "prefetch submission failed"
                    );
                    let _ = inner
                        .history
                        .set_status(&study_uid, PrefetchStatus::Failed)
                        .await;
                }
            }
        }
    }

    if submitted > 0 {
        inner
            .rules
            .add_studies_prefetched(&rule.rule_id, submitted as u64)
            .await?;
        tracing::info!(rule_id = %rule.rule_id, submitted, "prefetch jobs submitted");
    }
    Ok(submitted)
}

async fn query_source(
    inner: &Arc<PrefetchInner>,
    source: &str,
    query: &Dataset,
) -> Result<Vec<Dataset>, String> {
    let pool = inner
        .pools
        .for_node(source)
        .await
        .map_err(|fault| fault.to_string())?;
    let mut conn = pool.borrow().await.map_err(|err| err.to_string())?;
    conn.find(query).await.map_err(|err| err.to_string())
}

/// Fire scheduled rules whose next cron occurrence is within the advance
/// window, at most once per occurrence.
async fn evaluate_schedules(inner: &Arc<PrefetchInner>) -> Result<(), PrefetchError> {
    let rules = inner
        .rules
        .find_by_trigger(PrefetchTrigger::Schedule)
        .await?;
    let now = Utc::now();

    for rule in rules.iter().filter(|r| r.enabled) {
        let Some(expr) = &rule.schedule_cron else {
            continue;
        };
        let schedule = match cron::Schedule::from_str(expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                tracing::warn!(rule_id = %rule.rule_id, error = %err, "bad cron expression");
                continue;
            }
        };
        let Some(next) = schedule.after(&now).next() else {
            continue;
        };
        let advance = rule.advance_time.unwrap_or(Duration::ZERO);
        let advance = chrono::Duration::from_std(advance).unwrap_or_else(|_| chrono::Duration::zero());
        if next - advance > now {
            continue;
        }

        let already_fired = {
            let fired = inner.fired.lock().unwrap();
            fired.get(&rule.rule_id) == Some(&next)
        };
        if already_fired {
            continue;
        }
        inner
            .fired
            .lock()
            .unwrap()
            .insert(rule.rule_id.clone(), next);

        tracing::info!(rule_id = %rule.rule_id, occurrence = %next, "scheduled prefetch firing");
        if let Err(err) = sweep_rule(inner, rule).await {
            tracing::warn!(rule_id = %rule.rule_id, error = %err, "scheduled prefetch failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filters_default_to_match_all() {
        assert!(filter_matches(&None, Some("CT")));
        assert!(filter_matches(&None, None));
        assert!(filter_matches(&Some("CT".to_string()), Some("CT")));
        assert!(!filter_matches(&Some("CT".to_string()), Some("MR")));
        assert!(!filter_matches(&Some("CT".to_string()), None));
    }

    #[test]
    fn scheduled_rules_require_valid_cron() {
        let mut rule = PrefetchRule::new("pf", "sweep", PrefetchTrigger::Schedule);
        rule.source_node_ids = vec!["peer-1".to_string()];
        assert!(matches!(
            validate_rule(&rule),
            Err(PrefetchError::Validation(_))
        ));

        rule.schedule_cron = Some("not a cron".to_string());
        assert!(matches!(
            validate_rule(&rule),
            Err(PrefetchError::Validation(_))
        ));

        rule.schedule_cron = Some("0 0 3 * * * *".to_string());
        assert!(validate_rule(&rule).is_ok());
    }
}
