use std::time::Duration;

use chrono::Utc;
use models::{ConflictPolicy, SyncConfig, SyncConflict, SyncRunRecord};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, CmpOp, EntityMapping, Repository, SqlValue,
};
use crate::{Error, Result, Store};

const CONFIGS: &str = "sync_configs";
const CONFLICTS: &str = "sync_conflicts";
const HISTORY: &str = "sync_history";

pub struct SyncConfigMapping;

impl EntityMapping for SyncConfigMapping {
    type Entity = SyncConfig;
    type Key = String;

    const TABLE: &'static str = CONFIGS;
    const ID_COLUMN: &'static str = "config_id";

    fn columns() -> &'static [&'static str] {
        &[
            "config_id",
            "name",
            "enabled",
            "remote_node_id",
            "direction",
            "filter_json",
            "schedule_cron",
            "conflict_policy",
            "created_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<SyncConfig> {
        let direction: String = row.try_get("direction")?;
        let policy: String = row.try_get("conflict_policy")?;
        let filter: String = row.try_get("filter_json")?;
        Ok(SyncConfig {
            pk: row.try_get("pk")?,
            config_id: row.try_get("config_id")?,
            name: row.try_get("name")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            remote_node_id: row.try_get("remote_node_id")?,
            direction: direction
                .parse()
                .map_err(|err| Error::malformed(CONFIGS, err))?,
            filter: serde_json::from_str(&filter).map_err(|err| Error::malformed(CONFIGS, err))?,
            schedule_cron: row.try_get("schedule_cron")?,
            conflict_policy: policy
                .parse()
                .map_err(|err| Error::malformed(CONFIGS, err))?,
            created_at: parse_ts(CONFIGS, &row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn to_values(config: &SyncConfig) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("config_id", config.config_id.clone().into()),
            ("name", config.name.clone().into()),
            ("enabled", config.enabled.into()),
            ("remote_node_id", config.remote_node_id.clone().into()),
            ("direction", config.direction.as_str().into()),
            (
                "filter_json",
                serde_json::to_string(&config.filter)
                    .unwrap_or_else(|_| "{}".to_string())
                    .into(),
            ),
            ("schedule_cron", config.schedule_cron.clone().into()),
            ("conflict_policy", config.conflict_policy.as_str().into()),
            ("created_at", format_ts(config.created_at).into()),
        ]
    }

    fn key(config: &SyncConfig) -> String {
        config.config_id.clone()
    }

    fn has_key(config: &SyncConfig) -> bool {
        !config.config_id.is_empty()
    }
}

#[derive(Clone)]
pub struct SyncConfigRepository {
    base: Repository<SyncConfigMapping>,
}

impl SyncConfigRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    pub async fn find_enabled(&self) -> Result<Vec<SyncConfig>> {
        self.base.find_where("enabled", CmpOp::Eq, true).await
    }

    pub async fn set_enabled(&self, config_id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE sync_configs SET enabled = ?2 WHERE config_id = ?1")
            .bind(config_id)
            .bind(enabled as i64)
            .execute(self.base.pool())
            .await?;
        Ok(())
    }
}

impl std::ops::Deref for SyncConfigRepository {
    type Target = Repository<SyncConfigMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

pub struct SyncConflictMapping;

impl EntityMapping for SyncConflictMapping {
    type Entity = SyncConflict;
    type Key = String;

    const TABLE: &'static str = CONFLICTS;
    const ID_COLUMN: &'static str = "study_uid";

    fn columns() -> &'static [&'static str] {
        &[
            "study_uid",
            "config_id",
            "kind",
            "local_last_modified",
            "remote_last_modified",
            "local_instance_count",
            "remote_instance_count",
            "resolved",
            "resolution_used",
            "detected_at",
            "resolved_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<SyncConflict> {
        let kind: String = row.try_get("kind")?;
        let resolution: Option<String> = row.try_get("resolution_used")?;
        Ok(SyncConflict {
            pk: row.try_get("pk")?,
            study_uid: row.try_get("study_uid")?,
            config_id: row.try_get("config_id")?,
            kind: kind.parse().map_err(|err| Error::malformed(CONFLICTS, err))?,
            local_last_modified: parse_opt_ts(
                CONFLICTS,
                row.try_get::<Option<String>, _>("local_last_modified")?
                    .as_deref(),
            )?,
            remote_last_modified: parse_opt_ts(
                CONFLICTS,
                row.try_get::<Option<String>, _>("remote_last_modified")?
                    .as_deref(),
            )?,
            local_instance_count: row.try_get("local_instance_count")?,
            remote_instance_count: row.try_get("remote_instance_count")?,
            resolved: row.try_get::<i64, _>("resolved")? != 0,
            resolution_used: resolution
                .map(|s| s.parse().map_err(|err| Error::malformed(CONFLICTS, err)))
                .transpose()?,
            detected_at: parse_ts(CONFLICTS, &row.try_get::<String, _>("detected_at")?)?,
            resolved_at: parse_opt_ts(
                CONFLICTS,
                row.try_get::<Option<String>, _>("resolved_at")?.as_deref(),
            )?,
        })
    }

    fn to_values(conflict: &SyncConflict) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("study_uid", conflict.study_uid.clone().into()),
            ("config_id", conflict.config_id.clone().into()),
            ("kind", conflict.kind.as_str().into()),
            (
                "local_last_modified",
                format_opt_ts(conflict.local_last_modified),
            ),
            (
                "remote_last_modified",
                format_opt_ts(conflict.remote_last_modified),
            ),
            (
                "local_instance_count",
                conflict.local_instance_count.into(),
            ),
            (
                "remote_instance_count",
                conflict.remote_instance_count.into(),
            ),
            ("resolved", conflict.resolved.into()),
            (
                "resolution_used",
                conflict
                    .resolution_used
                    .map(|p| p.as_str().to_string())
                    .into(),
            ),
            ("detected_at", format_ts(conflict.detected_at).into()),
            ("resolved_at", format_opt_ts(conflict.resolved_at)),
        ]
    }

    fn key(conflict: &SyncConflict) -> String {
        conflict.study_uid.clone()
    }

    fn has_key(conflict: &SyncConflict) -> bool {
        !conflict.study_uid.is_empty()
    }
}

#[derive(Clone)]
pub struct SyncConflictRepository {
    base: Repository<SyncConflictMapping>,
}

impl SyncConflictRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    pub async fn find_unresolved(&self) -> Result<Vec<SyncConflict>> {
        self.base.find_where("resolved", CmpOp::Eq, false).await
    }

    pub async fn find_by_config(&self, config_id: &str) -> Result<Vec<SyncConflict>> {
        self.base
            .find_where("config_id", CmpOp::Eq, config_id)
            .await
    }

    pub async fn mark_resolved(
        &self,
        study_uid: &str,
        resolution: ConflictPolicy,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_conflicts SET resolved = 1, resolution_used = ?2, \
             resolved_at = ?3 WHERE study_uid = ?1",
        )
        .bind(study_uid)
        .bind(resolution.as_str())
        .bind(format_ts(Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    /// Remove resolved conflicts older than `max_age`.
    pub async fn cleanup_resolved(&self, max_age: Duration) -> Result<u64> {
        let modifier = format!("-{} seconds", max_age.as_secs());
        let done = sqlx::query(
            "DELETE FROM sync_conflicts WHERE resolved = 1 \
             AND resolved_at IS NOT NULL AND resolved_at < datetime('now', ?1)",
        )
        .bind(modifier)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected())
    }
}

impl std::ops::Deref for SyncConflictRepository {
    type Target = Repository<SyncConflictMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

pub struct SyncHistoryMapping;

impl EntityMapping for SyncHistoryMapping {
    type Entity = SyncRunRecord;
    type Key = i64;

    const TABLE: &'static str = HISTORY;
    const ID_COLUMN: &'static str = "pk";

    fn columns() -> &'static [&'static str] {
        &[
            "config_id",
            "job_id",
            "success",
            "studies_checked",
            "studies_synced",
            "conflicts_found",
            "errors_json",
            "started_at",
            "finished_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<SyncRunRecord> {
        let job_id: String = row.try_get("job_id")?;
        let errors: String = row.try_get("errors_json")?;
        Ok(SyncRunRecord {
            pk: row.try_get("pk")?,
            config_id: row.try_get("config_id")?,
            job_id: Uuid::parse_str(&job_id).map_err(|err| Error::malformed(HISTORY, err))?,
            success: row.try_get::<i64, _>("success")? != 0,
            studies_checked: row.try_get::<i64, _>("studies_checked")? as u64,
            studies_synced: row.try_get::<i64, _>("studies_synced")? as u64,
            conflicts_found: row.try_get::<i64, _>("conflicts_found")? as u64,
            errors: serde_json::from_str(&errors).map_err(|err| Error::malformed(HISTORY, err))?,
            started_at: parse_ts(HISTORY, &row.try_get::<String, _>("started_at")?)?,
            finished_at: parse_ts(HISTORY, &row.try_get::<String, _>("finished_at")?)?,
        })
    }

    fn to_values(run: &SyncRunRecord) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("config_id", run.config_id.clone().into()),
            ("job_id", run.job_id.to_string().into()),
            ("success", run.success.into()),
            ("studies_checked", run.studies_checked.into()),
            ("studies_synced", run.studies_synced.into()),
            ("conflicts_found", run.conflicts_found.into()),
            (
                "errors_json",
                serde_json::to_string(&run.errors)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            ("started_at", format_ts(run.started_at).into()),
            ("finished_at", format_ts(run.finished_at).into()),
        ]
    }

    fn key(run: &SyncRunRecord) -> i64 {
        run.pk
    }

    fn has_key(run: &SyncRunRecord) -> bool {
        run.pk > 0
    }
}

#[derive(Clone)]
pub struct SyncHistoryRepository {
    base: Repository<SyncHistoryMapping>,
}

impl SyncHistoryRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    /// Most recent runs for a config, newest first.
    pub async fn find_by_config(&self, config_id: &str, limit: usize) -> Result<Vec<SyncRunRecord>> {
        let sql = format!(
            "SELECT pk, {} FROM {HISTORY} WHERE config_id = ?1 \
             ORDER BY started_at DESC, pk DESC LIMIT ?2",
            SyncHistoryMapping::columns().join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(config_id)
            .bind(limit as i64)
            .fetch_all(self.base.pool())
            .await?;
        rows.iter().map(SyncHistoryMapping::from_row).collect()
    }

    pub async fn cleanup_old(&self, max_age: Duration) -> Result<u64> {
        let modifier = format!("-{} seconds", max_age.as_secs());
        let done = sqlx::query(
            "DELETE FROM sync_history WHERE finished_at < datetime('now', ?1)",
        )
        .bind(modifier)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected())
    }
}

impl std::ops::Deref for SyncHistoryRepository {
    type Target = Repository<SyncHistoryMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
