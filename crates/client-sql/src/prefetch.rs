use std::time::Duration;

use models::{PrefetchHistoryEntry, PrefetchRule, PrefetchStatus, PrefetchTrigger};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, CmpOp, EntityMapping, Repository, SqlValue,
};
use crate::{Error, Result, Store};

const RULES: &str = "prefetch_rules";
const HISTORY: &str = "prefetch_history";

pub struct PrefetchRuleMapping;

impl EntityMapping for PrefetchRuleMapping {
    type Entity = PrefetchRule;
    type Key = String;

    const TABLE: &'static str = RULES;
    const ID_COLUMN: &'static str = "rule_id";

    fn columns() -> &'static [&'static str] {
        &[
            "rule_id",
            "name",
            "enabled",
            "trigger_type",
            "modality_filter",
            "body_part_filter",
            "station_ae_filter",
            "prior_lookback_secs",
            "max_prior_studies",
            "prior_modalities_json",
            "source_node_ids_json",
            "schedule_cron",
            "advance_time_secs",
            "triggered_count",
            "studies_prefetched",
            "last_triggered",
            "created_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<PrefetchRule> {
        let trigger: String = row.try_get("trigger_type")?;
        let prior_modalities: String = row.try_get("prior_modalities_json")?;
        let source_nodes: String = row.try_get("source_node_ids_json")?;
        Ok(PrefetchRule {
            pk: row.try_get("pk")?,
            rule_id: row.try_get("rule_id")?,
            name: row.try_get("name")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            trigger: trigger.parse().map_err(|err| Error::malformed(RULES, err))?,
            modality_filter: row.try_get("modality_filter")?,
            body_part_filter: row.try_get("body_part_filter")?,
            station_ae_filter: row.try_get("station_ae_filter")?,
            prior_lookback: Duration::from_secs(
                row.try_get::<i64, _>("prior_lookback_secs")?.max(0) as u64,
            ),
            max_prior_studies: row.try_get::<i64, _>("max_prior_studies")? as u32,
            prior_modalities: serde_json::from_str(&prior_modalities)
                .map_err(|err| Error::malformed(RULES, err))?,
            source_node_ids: serde_json::from_str(&source_nodes)
                .map_err(|err| Error::malformed(RULES, err))?,
            schedule_cron: row.try_get("schedule_cron")?,
            advance_time: row
                .try_get::<Option<i64>, _>("advance_time_secs")?
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
            triggered_count: row.try_get::<i64, _>("triggered_count")? as u64,
            studies_prefetched: row.try_get::<i64, _>("studies_prefetched")? as u64,
            last_triggered: parse_opt_ts(
                RULES,
                row.try_get::<Option<String>, _>("last_triggered")?.as_deref(),
            )?,
            created_at: parse_ts(RULES, &row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn to_values(rule: &PrefetchRule) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("rule_id", rule.rule_id.clone().into()),
            ("name", rule.name.clone().into()),
            ("enabled", rule.enabled.into()),
            ("trigger_type", rule.trigger.as_str().into()),
            ("modality_filter", rule.modality_filter.clone().into()),
            ("body_part_filter", rule.body_part_filter.clone().into()),
            ("station_ae_filter", rule.station_ae_filter.clone().into()),
            (
                "prior_lookback_secs",
                (rule.prior_lookback.as_secs() as i64).into(),
            ),
            ("max_prior_studies", rule.max_prior_studies.into()),
            (
                "prior_modalities_json",
                serde_json::to_string(&rule.prior_modalities)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            (
                "source_node_ids_json",
                serde_json::to_string(&rule.source_node_ids)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            ("schedule_cron", rule.schedule_cron.clone().into()),
            (
                "advance_time_secs",
                rule.advance_time
                    .map(|d| d.as_secs() as i64)
                    .into(),
            ),
            ("triggered_count", rule.triggered_count.into()),
            ("studies_prefetched", rule.studies_prefetched.into()),
            ("last_triggered", format_opt_ts(rule.last_triggered)),
            ("created_at", format_ts(rule.created_at).into()),
        ]
    }

    fn key(rule: &PrefetchRule) -> String {
        rule.rule_id.clone()
    }

    fn has_key(rule: &PrefetchRule) -> bool {
        !rule.rule_id.is_empty()
    }
}

#[derive(Clone)]
pub struct PrefetchRuleRepository {
    base: Repository<PrefetchRuleMapping>,
}

impl PrefetchRuleRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    pub async fn find_enabled(&self) -> Result<Vec<PrefetchRule>> {
        self.base.find_where("enabled", CmpOp::Eq, true).await
    }

    pub async fn find_by_trigger(&self, trigger: PrefetchTrigger) -> Result<Vec<PrefetchRule>> {
        self.base
            .find_where("trigger_type", CmpOp::Eq, trigger.as_str())
            .await
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE prefetch_rules SET enabled = ?2 WHERE rule_id = ?1")
            .bind(rule_id)
            .bind(enabled as i64)
            .execute(self.base.pool())
            .await?;
        Ok(())
    }

    pub async fn increment_triggered(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE prefetch_rules SET triggered_count = triggered_count + 1, \
             last_triggered = ?2 WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .bind(format_ts(chrono::Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn add_studies_prefetched(&self, rule_id: &str, count: u64) -> Result<()> {
        sqlx::query(
            "UPDATE prefetch_rules SET studies_prefetched = studies_prefetched + ?2 \
             WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .bind(count as i64)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }
}

impl std::ops::Deref for PrefetchRuleRepository {
    type Target = Repository<PrefetchRuleMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

pub struct PrefetchHistoryMapping;

impl EntityMapping for PrefetchHistoryMapping {
    type Entity = PrefetchHistoryEntry;
    type Key = String;

    const TABLE: &'static str = HISTORY;
    const ID_COLUMN: &'static str = "study_uid";

    fn columns() -> &'static [&'static str] {
        &[
            "study_uid",
            "patient_id",
            "source_node_id",
            "rule_id",
            "status",
            "created_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<PrefetchHistoryEntry> {
        let status: String = row.try_get("status")?;
        Ok(PrefetchHistoryEntry {
            pk: row.try_get("pk")?,
            study_uid: row.try_get("study_uid")?,
            patient_id: row.try_get("patient_id")?,
            source_node_id: row.try_get("source_node_id")?,
            rule_id: row.try_get("rule_id")?,
            status: status.parse().map_err(|err| Error::malformed(HISTORY, err))?,
            created_at: parse_ts(HISTORY, &row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn to_values(entry: &PrefetchHistoryEntry) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("study_uid", entry.study_uid.clone().into()),
            ("patient_id", entry.patient_id.clone().into()),
            ("source_node_id", entry.source_node_id.clone().into()),
            ("rule_id", entry.rule_id.clone().into()),
            ("status", entry.status.as_str().into()),
            ("created_at", format_ts(entry.created_at).into()),
        ]
    }

    fn key(entry: &PrefetchHistoryEntry) -> String {
        entry.study_uid.clone()
    }

    fn has_key(entry: &PrefetchHistoryEntry) -> bool {
        !entry.study_uid.is_empty()
    }
}

#[derive(Clone)]
pub struct PrefetchHistoryRepository {
    base: Repository<PrefetchHistoryMapping>,
}

impl PrefetchHistoryRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    /// A pending or completed row suppresses re-prefetch of the study.
    pub async fn is_fetched_or_pending(&self, study_uid: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM prefetch_history WHERE study_uid = ?1 \
             AND status IN ('pending', 'completed')",
        )
        .bind(study_uid)
        .fetch_one(self.base.pool())
        .await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    pub async fn set_status(&self, study_uid: &str, status: PrefetchStatus) -> Result<()> {
        sqlx::query("UPDATE prefetch_history SET status = ?2 WHERE study_uid = ?1")
            .bind(study_uid)
            .bind(status.as_str())
            .execute(self.base.pool())
            .await?;
        Ok(())
    }

    /// Remove rows older than `max_age`; failed rows go regardless of age
    /// so the study becomes eligible again.
    pub async fn cleanup_old(&self, max_age: Duration) -> Result<u64> {
        let modifier = format!("-{} seconds", max_age.as_secs());
        let done = sqlx::query(
            "DELETE FROM prefetch_history WHERE created_at < datetime('now', ?1) \
             OR status = 'failed'",
        )
        .bind(modifier)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected())
    }
}

impl std::ops::Deref for PrefetchHistoryRepository {
    type Target = Repository<PrefetchHistoryMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::truncate_to_seconds;
    use chrono::Utc;

    #[tokio::test]
    async fn rules_round_trip_and_filter_by_trigger() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = PrefetchRuleRepository::new(&store);

        let mut rule = PrefetchRule::new("pf-1", "priors", PrefetchTrigger::StudyArrival);
        rule.created_at = truncate_to_seconds(rule.created_at);
        rule.prior_lookback = Duration::from_secs(3600 * 24 * 30);
        rule.prior_modalities = vec!["CT".to_string()];
        rule.source_node_ids = vec!["peer-1".to_string()];
        rule.advance_time = Some(Duration::from_secs(900));
        let pk = repo.insert(&rule).await.unwrap();
        rule.pk = pk;

        let loaded = repo.find_by_id(&"pf-1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded, rule);

        let arrivals = repo
            .find_by_trigger(PrefetchTrigger::StudyArrival)
            .await
            .unwrap();
        assert_eq!(arrivals.len(), 1);
        assert!(repo
            .find_by_trigger(PrefetchTrigger::Schedule)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn history_dedups_by_study_uid() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = PrefetchHistoryRepository::new(&store);

        let entry = PrefetchHistoryEntry {
            pk: 0,
            study_uid: "1.2.3".to_string(),
            patient_id: "P-1".to_string(),
            source_node_id: "peer-1".to_string(),
            rule_id: "pf-1".to_string(),
            status: PrefetchStatus::Pending,
            created_at: truncate_to_seconds(Utc::now()),
        };
        repo.insert(&entry).await.unwrap();

        assert!(repo.is_fetched_or_pending("1.2.3").await.unwrap());
        assert!(!repo.is_fetched_or_pending("9.9.9").await.unwrap());

        repo.set_status("1.2.3", PrefetchStatus::Failed).await.unwrap();
        assert!(!repo.is_fetched_or_pending("1.2.3").await.unwrap());

        // Failed rows clean up regardless of age.
        let removed = repo.cleanup_old(Duration::from_secs(86400)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
