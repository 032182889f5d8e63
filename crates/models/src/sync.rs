use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            other => Err(ParseEnumError::new("sync direction", other)),
        }
    }
}

/// How a detected divergence is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    PreferLocal,
    PreferRemote,
    NewestWins,
    /// Record a conflict row and leave resolution to an operator.
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::PreferLocal => "prefer_local",
            ConflictPolicy::PreferRemote => "prefer_remote",
            ConflictPolicy::NewestWins => "newest_wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer_local" => Ok(ConflictPolicy::PreferLocal),
            "prefer_remote" => Ok(ConflictPolicy::PreferRemote),
            "newest_wins" => Ok(ConflictPolicy::NewestWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(ParseEnumError::new("conflict policy", other)),
        }
    }
}

/// Study-level filter applied on both sides of a sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyFilter {
    /// Restrict to these modalities; empty means any.
    #[serde(default)]
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    /// Only studies modified within this window.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified_within: Option<Duration>,
}

/// A study as seen by one side of a sync comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_uid: String,
    pub patient_id: String,
    #[serde(default)]
    pub modality: String,
    pub instance_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Surrogate key. Zero until the row is first persisted.
    #[serde(default)]
    pub pk: i64,
    pub config_id: String,
    pub name: String,
    pub enabled: bool,
    /// Remote peer; the other endpoint is the local archive.
    pub remote_node_id: String,
    pub direction: SyncDirection,
    #[serde(default)]
    pub filter: StudyFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub created_at: DateTime<Utc>,
}

impl SyncConfig {
    pub fn new(
        config_id: impl Into<String>,
        name: impl Into<String>,
        remote_node_id: impl Into<String>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            pk: 0,
            config_id: config_id.into(),
            name: name.into(),
            enabled: true,
            remote_node_id: remote_node_id.into(),
            direction,
            filter: StudyFilter::default(),
            schedule_cron: None,
            conflict_policy: ConflictPolicy::Manual,
            created_at: Utc::now(),
        }
    }
}

/// Classification of one divergent study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    MissingLocal,
    MissingRemote,
    /// Both sides changed since the last reconciliation.
    ModifiedBoth,
    CountMismatch,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::MissingLocal => "missing_local",
            ConflictKind::MissingRemote => "missing_remote",
            ConflictKind::ModifiedBoth => "modified_both",
            ConflictKind::CountMismatch => "count_mismatch",
        }
    }
}

impl std::str::FromStr for ConflictKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_local" => Ok(ConflictKind::MissingLocal),
            "missing_remote" => Ok(ConflictKind::MissingRemote),
            "modified_both" => Ok(ConflictKind::ModifiedBoth),
            "count_mismatch" => Ok(ConflictKind::CountMismatch),
            other => Err(ParseEnumError::new("conflict kind", other)),
        }
    }
}

/// A divergence awaiting (or having received) resolution, keyed by
/// `study_uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    #[serde(default)]
    pub pk: i64,
    pub study_uid: String,
    pub config_id: String,
    pub kind: ConflictKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_instance_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_instance_count: Option<i64>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_used: Option<ConflictPolicy>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    #[serde(default)]
    pub pk: i64,
    pub config_id: String,
    pub job_id: Uuid,
    pub success: bool,
    pub studies_checked: u64,
    pub studies_synced: u64,
    pub conflicts_found: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let mut config = SyncConfig::new("c-1", "nightly pull", "peer-1", SyncDirection::Pull);
        config.filter.modalities = vec!["CT".to_string()];
        config.schedule_cron = Some("0 0 3 * * * *".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn conflict_round_trips_through_json() {
        let conflict = SyncConflict {
            pk: 0,
            study_uid: "1.2.3".to_string(),
            config_id: "c-1".to_string(),
            kind: ConflictKind::CountMismatch,
            local_last_modified: None,
            remote_last_modified: Some(Utc::now()),
            local_instance_count: Some(10),
            remote_instance_count: Some(12),
            resolved: false,
            resolution_used: None,
            detected_at: Utc::now(),
            resolved_at: None,
        };

        let json = serde_json::to_string(&conflict).unwrap();
        let back: SyncConflict = serde_json::from_str(&json).unwrap();
        assert_eq!(conflict, back);
    }
}
