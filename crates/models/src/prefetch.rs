use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// What causes a prefetch rule to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchTrigger {
    /// A scheduled procedure step arrived from the modality worklist.
    WorklistScheduled,
    /// A new study was stored locally; fetch its priors.
    StudyArrival,
    /// A cron schedule fired.
    Schedule,
    Manual,
}

impl PrefetchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefetchTrigger::WorklistScheduled => "worklist_scheduled",
            PrefetchTrigger::StudyArrival => "study_arrival",
            PrefetchTrigger::Schedule => "schedule",
            PrefetchTrigger::Manual => "manual",
        }
    }
}

impl std::str::FromStr for PrefetchTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worklist_scheduled" => Ok(PrefetchTrigger::WorklistScheduled),
            "study_arrival" => Ok(PrefetchTrigger::StudyArrival),
            "schedule" => Ok(PrefetchTrigger::Schedule),
            "manual" => Ok(PrefetchTrigger::Manual),
            other => Err(ParseEnumError::new("prefetch trigger", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchRule {
    /// Surrogate key. Zero until the row is first persisted.
    #[serde(default)]
    pub pk: i64,
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    pub trigger: PrefetchTrigger,
    /// Fire only for matching modalities; `None` matches all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_part_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_ae_filter: Option<String>,
    /// How far back to look for prior studies.
    #[serde(with = "humantime_serde")]
    pub prior_lookback: Duration,
    pub max_prior_studies: u32,
    /// Restrict priors to these modalities; empty means any.
    #[serde(default)]
    pub prior_modalities: Vec<String>,
    /// Peers to retrieve priors from.
    pub source_node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,
    /// For scheduled triggers, fire this long before the target time.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub advance_time: Option<Duration>,
    #[serde(default)]
    pub triggered_count: u64,
    #[serde(default)]
    pub studies_prefetched: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PrefetchRule {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        trigger: PrefetchTrigger,
    ) -> Self {
        Self {
            pk: 0,
            rule_id: rule_id.into(),
            name: name.into(),
            enabled: true,
            trigger,
            modality_filter: None,
            body_part_filter: None,
            station_ae_filter: None,
            prior_lookback: Duration::from_secs(60 * 60 * 24 * 365),
            max_prior_studies: 3,
            prior_modalities: Vec::new(),
            source_node_ids: Vec::new(),
            schedule_cron: None,
            advance_time: None,
            triggered_count: 0,
            studies_prefetched: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a prefetch attempt for one study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStatus {
    Pending,
    Completed,
    Failed,
}

impl PrefetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefetchStatus::Pending => "pending",
            PrefetchStatus::Completed => "completed",
            PrefetchStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PrefetchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PrefetchStatus::Pending),
            "completed" => Ok(PrefetchStatus::Completed),
            "failed" => Ok(PrefetchStatus::Failed),
            other => Err(ParseEnumError::new("prefetch status", other)),
        }
    }
}

/// One prefetched (or in-flight) study. Rows are keyed by `study_uid` for
/// dedup: an existing pending or completed row suppresses re-prefetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchHistoryEntry {
    #[serde(default)]
    pub pk: i64,
    pub patient_id: String,
    pub study_uid: String,
    pub source_node_id: String,
    pub rule_id: String,
    pub status: PrefetchStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rule_round_trips_through_json() {
        let mut rule = PrefetchRule::new("pf-1", "CT priors", PrefetchTrigger::StudyArrival);
        rule.modality_filter = Some("CT".to_string());
        rule.prior_modalities = vec!["CT".to_string(), "MR".to_string()];
        rule.source_node_ids = vec!["peer-1".to_string()];
        rule.advance_time = Some(Duration::from_secs(1800));

        let json = serde_json::to_string(&rule).unwrap();
        let back: PrefetchRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }
}
