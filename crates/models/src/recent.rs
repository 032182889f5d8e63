use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lightweight recency bookkeeping for inbound studies. One row per
/// `study_uid`; `accessed_at` moves forward on every touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentStudy {
    #[serde(default)]
    pub pk: i64,
    pub study_uid: String,
    pub patient_id: String,
    pub accessed_at: DateTime<Utc>,
}
