//! Rule-driven auto-forwarding. The storage SCP calls [`RoutingManager::on_study`]
//! for every arriving study; matching rules submit one forward job per
//! destination. Rules are cached in memory and refreshed on CRUD or on
//! demand.

use std::sync::Arc;

use client_sql::{RecentStudyRepository, RoutingRuleRepository};
use dimse::{tags, Dataset};
use models::{JobKind, JobRecord, MatchField, MatchOp, RoutingRule};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::JobSubmitter;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("rule {0} not found")]
    NotFound(String),
    #[error("invalid rule: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] client_sql::Error),
}

/// An inbound study as announced by the storage SCP: the dataset plus the
/// association's calling AE title.
#[derive(Debug, Clone)]
pub struct StudyArrival {
    pub dataset: Dataset,
    pub calling_ae: String,
}

impl StudyArrival {
    fn field_value(&self, field: MatchField) -> Option<&str> {
        match field {
            MatchField::Modality => self.dataset.get(tags::MODALITY),
            MatchField::BodyPart => self.dataset.get(tags::BODY_PART_EXAMINED),
            MatchField::CallingAe => Some(self.calling_ae.as_str()),
            MatchField::PatientId => self.dataset.get(tags::PATIENT_ID),
            MatchField::StudyDescription => self.dataset.get(tags::STUDY_DESCRIPTION),
            MatchField::StationName => self.dataset.get(tags::STATION_NAME),
            MatchField::InstitutionName => self.dataset.get(tags::INSTITUTION_NAME),
        }
    }
}

pub struct RoutingManager {
    repo: RoutingRuleRepository,
    recent: RecentStudyRepository,
    submitter: Arc<dyn JobSubmitter>,
    rules: RwLock<Vec<RoutingRule>>,
}

impl RoutingManager {
    pub fn new(
        repo: RoutingRuleRepository,
        recent: RecentStudyRepository,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Self {
        Self {
            repo,
            recent,
            submitter,
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Refresh the in-memory rule cache from the repository.
    pub async fn reload_rules(&self) -> Result<usize, RoutingError> {
        let enabled = self.repo.find_enabled().await?;
        let count = enabled.len();
        *self.rules.write().await = enabled;
        tracing::debug!(count, "routing rules reloaded");
        Ok(count)
    }

    pub async fn create_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        validate_rule(&rule)?;
        self.repo.save(&rule).await?;
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn update_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        validate_rule(&rule)?;
        if !self.repo.exists(&rule.rule_id).await? {
            return Err(RoutingError::NotFound(rule.rule_id));
        }
        self.repo.save(&rule).await?;
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), RoutingError> {
        if !self.repo.remove(&rule_id.to_string()).await? {
            return Err(RoutingError::NotFound(rule_id.to_string()));
        }
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), RoutingError> {
        if !self.repo.exists(&rule_id.to_string()).await? {
            return Err(RoutingError::NotFound(rule_id.to_string()));
        }
        self.repo.set_enabled(rule_id, enabled).await?;
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn update_priority(&self, rule_id: &str, priority: i32) -> Result<(), RoutingError> {
        if !self.repo.exists(&rule_id.to_string()).await? {
            return Err(RoutingError::NotFound(rule_id.to_string()));
        }
        self.repo.update_priority(rule_id, priority).await?;
        self.reload_rules().await?;
        Ok(())
    }

    pub async fn reset_statistics(&self, rule_id: &str) -> Result<(), RoutingError> {
        if !self.repo.exists(&rule_id.to_string()).await? {
            return Err(RoutingError::NotFound(rule_id.to_string()));
        }
        self.repo.reset_statistics(rule_id).await?;
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<RoutingRule>, RoutingError> {
        Ok(self.repo.find_all(None).await?)
    }

    /// Evaluate every enabled rule against the arrival, in priority order,
    /// and submit forward jobs for the matches. Returns the submitted job
    /// ids. Submission failures are counted on the rule but do not abort
    /// the remaining destinations or rules.
    pub async fn on_study(&self, arrival: &StudyArrival) -> Result<Vec<Uuid>, RoutingError> {
        let study_uid = match arrival.dataset.study_uid() {
            Some(uid) if !uid.is_empty() => uid.to_string(),
            _ => {
                tracing::warn!("dropping study arrival without a study uid");
                return Ok(Vec::new());
            }
        };
        let patient_id = arrival.dataset.patient_id().unwrap_or_default().to_string();
        if let Err(err) = self.recent.touch(&study_uid, &patient_id).await {
            tracing::warn!(error = %err, "recent-study touch failed");
        }

        let rules = self.rules.read().await.clone();
        let mut submitted = Vec::new();

        for rule in &rules {
            if !rule_matches(rule, arrival) {
                continue;
            }
            self.repo.increment_triggered(&rule.rule_id).await?;
            tracing::info!(
                rule_id = %rule.rule_id,
                %study_uid,
                "routing rule matched"
            );

            for action in &rule.actions {
                for destination in &action.destinations {
                    let mut job = JobRecord::new(JobKind::Forward);
                    job.destination_node_id = Some(destination.clone());
                    job.study_uid = study_uid.clone();
                    job.priority = rule.job_priority;
                    job.parent_rule_id = Some(rule.rule_id.clone());
                    job.created_by = "routing".to_string();
                    job.metadata
                        .insert("calling_ae".to_string(), arrival.calling_ae.clone());

                    match self.submitter.submit_job(job).await {
                        Ok(job_id) => {
                            submitted.push(job_id);
                            self.repo.increment_success(&rule.rule_id).await?;
                        }
                        Err(err) => {
                            tracing::warn!(
                                rule_id = %rule.rule_id,
                                destination,
                                error = %err,
                                "forward submission failed"
                            );
                            self.repo.increment_failure(&rule.rule_id).await?;
                        }
                    }
                }
            }

            if rule.stop_processing {
                break;
            }
        }
        Ok(submitted)
    }
}

fn validate_rule(rule: &RoutingRule) -> Result<(), RoutingError> {
    if rule.rule_id.is_empty() {
        return Err(RoutingError::Validation("rule_id must not be empty".into()));
    }
    if rule.actions.iter().all(|a| a.destinations.is_empty()) {
        return Err(RoutingError::Validation(
            "rule has no destination nodes".into(),
        ));
    }
    for condition in &rule.conditions {
        match condition.op {
            MatchOp::Regex => {
                regex::Regex::new(&condition.value).map_err(|err| {
                    RoutingError::Validation(format!("bad regex {:?}: {err}", condition.value))
                })?;
            }
            MatchOp::Glob => {
                globset::Glob::new(&condition.value).map_err(|err| {
                    RoutingError::Validation(format!("bad glob {:?}: {err}", condition.value))
                })?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// All conditions must match (AND). A condition over an absent field does
/// not match.
fn rule_matches(rule: &RoutingRule, arrival: &StudyArrival) -> bool {
    rule.conditions.iter().all(|condition| {
        let Some(value) = arrival.field_value(condition.field) else {
            return false;
        };
        condition_matches(condition.op, value, &condition.value)
    })
}

fn condition_matches(op: MatchOp, actual: &str, expected: &str) -> bool {
    match op {
        MatchOp::Equals => actual == expected,
        MatchOp::NotEquals => actual != expected,
        MatchOp::Contains => actual.contains(expected),
        MatchOp::Glob => match globset::Glob::new(expected) {
            Ok(glob) => glob.compile_matcher().is_match(actual),
            Err(err) => {
                tracing::warn!(pattern = expected, error = %err, "bad glob in routing rule");
                false
            }
        },
        MatchOp::Regex => match regex::Regex::new(expected) {
            Ok(re) => re.is_match(actual),
            Err(err) => {
                tracing::warn!(pattern = expected, error = %err, "bad regex in routing rule");
                false
            }
        },
        MatchOp::GreaterThan | MatchOp::GreaterOrEqual | MatchOp::LessThan | MatchOp::LessOrEqual => {
            let (Ok(lhs), Ok(rhs)) = (actual.trim().parse::<f64>(), expected.trim().parse::<f64>())
            else {
                return false;
            };
            match op {
                MatchOp::GreaterThan => lhs > rhs,
                MatchOp::GreaterOrEqual => lhs >= rhs,
                MatchOp::LessThan => lhs < rhs,
                MatchOp::LessOrEqual => lhs <= rhs,
                _ => false,
            }
        }
    }
}
