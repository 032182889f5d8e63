use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseEnumError;

/// The kind of work a job performs. Each kind has a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Echo,
    Query,
    Retrieve,
    Store,
    Forward,
    SyncPull,
    SyncPush,
    Prefetch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Echo => "echo",
            JobKind::Query => "query",
            JobKind::Retrieve => "retrieve",
            JobKind::Store => "store",
            JobKind::Forward => "forward",
            JobKind::SyncPull => "sync_pull",
            JobKind::SyncPush => "sync_push",
            JobKind::Prefetch => "prefetch",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo" => Ok(JobKind::Echo),
            "query" => Ok(JobKind::Query),
            "retrieve" => Ok(JobKind::Retrieve),
            "store" => Ok(JobKind::Store),
            "forward" => Ok(JobKind::Forward),
            "sync_pull" => Ok(JobKind::SyncPull),
            "sync_push" => Ok(JobKind::SyncPush),
            "prefetch" => Ok(JobKind::Prefetch),
            other => Err(ParseEnumError::new("job kind", other)),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Higher dequeues first; FIFO within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    /// Numeric rank used for queue ordering and persistence.
    pub fn rank(&self) -> i32 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            0 => Some(JobPriority::Low),
            1 => Some(JobPriority::Normal),
            2 => Some(JobPriority::High),
            3 => Some(JobPriority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "urgent" => Ok(JobPriority::Urgent),
            other => Err(ParseEnumError::new("job priority", other)),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Completed and canceled never transition again. Failed is terminal
    /// only once retries are exhausted, which the job manager decides.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Canceled)
    }

    /// Whether a `self -> next` transition is permitted.
    pub fn may_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Running) => true,
            (Running, Completed | Failed | Canceled | Paused) => true,
            (Paused, Queued) => true,
            (Failed, Queued) => true,
            // Cancellation is allowed from any non-terminal state.
            (Pending | Queued | Paused | Failed, Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-reported progress. Totals of zero mean "not yet known".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub items_total: u64,
    pub items_done: u64,
    pub bytes_total: u64,
    pub bytes_done: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

/// A unit of asynchronous work, durably persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Surrogate key. Zero until the row is first persisted.
    #[serde(default)]
    pub pk: i64,
    pub job_id: Uuid,
    pub kind: JobKind,
    /// `None` means the local archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_node_id: Option<String>,
    #[serde(default)]
    pub study_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_uid: Option<String>,
    #[serde(default)]
    pub sop_instance_uids: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub priority: JobPriority,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(kind: JobKind) -> Self {
        Self {
            pk: 0,
            job_id: Uuid::new_v4(),
            kind,
            source_node_id: None,
            destination_node_id: None,
            study_uid: String::new(),
            series_uid: None,
            sop_instance_uids: Vec::new(),
            metadata: BTreeMap::new(),
            priority: JobPriority::Normal,
            max_retries: 3,
            retry_count: 0,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            error_message: None,
            error_details: None,
            created_by: "system".to_string(),
            parent_rule_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permitted_transitions() {
        use JobStatus::*;

        for (from, to, expect) in [
            (Pending, Queued, true),
            (Queued, Running, true),
            (Running, Completed, true),
            (Running, Failed, true),
            (Running, Canceled, true),
            (Running, Paused, true),
            (Paused, Queued, true),
            (Failed, Queued, true),
            (Pending, Canceled, true),
            (Queued, Canceled, true),
            (Completed, Queued, false),
            (Canceled, Queued, false),
            (Completed, Canceled, false),
            (Pending, Running, false),
            (Paused, Running, false),
            (Failed, Running, false),
        ] {
            assert_eq!(
                from.may_transition_to(to),
                expect,
                "{from:?} -> {to:?} should be {expect}"
            );
        }
    }

    #[test]
    fn priority_orders_by_rank() {
        assert!(JobPriority::Urgent > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        for p in [
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Urgent,
        ] {
            assert_eq!(JobPriority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(JobPriority::from_rank(17), None);
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut job = JobRecord::new(JobKind::Forward);
        job.destination_node_id = Some("peer-1".to_string());
        job.study_uid = "1.2.3".to_string();
        job.sop_instance_uids = vec!["1.2.3.1".to_string(), "1.2.3.2".to_string()];
        job.metadata
            .insert("calling_ae".to_string(), "MODALITY7".to_string());

        let json = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
