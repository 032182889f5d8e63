//! Forward-only schema migrations. Each step runs in its own transaction
//! and bumps the recorded version; opening a database written by a newer
//! build is refused.

use sqlx::SqlitePool;

use crate::{Error, Result};

pub const LATEST: i64 = 1;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
CREATE TABLE nodes (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL UNIQUE,
    ae_title TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    tls_profile TEXT,
    capabilities_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'unknown',
    last_verified TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE jobs (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    source_node_id TEXT,
    destination_node_id TEXT,
    study_uid TEXT NOT NULL DEFAULT '',
    series_uid TEXT,
    sop_instance_uids_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 1,
    max_retries INTEGER NOT NULL DEFAULT 3,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    items_total INTEGER NOT NULL DEFAULT 0,
    items_done INTEGER NOT NULL DEFAULT 0,
    bytes_total INTEGER NOT NULL DEFAULT 0,
    bytes_done INTEGER NOT NULL DEFAULT 0,
    current_item TEXT,
    error_message TEXT,
    error_details TEXT,
    created_by TEXT NOT NULL DEFAULT 'system',
    parent_rule_id TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX idx_jobs_status ON jobs (status);
CREATE INDEX idx_jobs_destination ON jobs (destination_node_id);
CREATE INDEX idx_jobs_created_at ON jobs (created_at);

CREATE TABLE routing_rules (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    conditions_json TEXT NOT NULL DEFAULT '[]',
    actions_json TEXT NOT NULL DEFAULT '[]',
    stop_processing INTEGER NOT NULL DEFAULT 0,
    job_priority INTEGER NOT NULL DEFAULT 1,
    triggered_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_triggered TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE prefetch_rules (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    trigger_type TEXT NOT NULL,
    modality_filter TEXT,
    body_part_filter TEXT,
    station_ae_filter TEXT,
    prior_lookback_secs INTEGER NOT NULL,
    max_prior_studies INTEGER NOT NULL DEFAULT 3,
    prior_modalities_json TEXT NOT NULL DEFAULT '[]',
    source_node_ids_json TEXT NOT NULL DEFAULT '[]',
    schedule_cron TEXT,
    advance_time_secs INTEGER,
    triggered_count INTEGER NOT NULL DEFAULT 0,
    studies_prefetched INTEGER NOT NULL DEFAULT 0,
    last_triggered TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE prefetch_history (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    study_uid TEXT NOT NULL UNIQUE,
    patient_id TEXT NOT NULL,
    source_node_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);
CREATE INDEX idx_prefetch_history_patient ON prefetch_history (patient_id);

CREATE TABLE sync_configs (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    remote_node_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    filter_json TEXT NOT NULL DEFAULT '{}',
    schedule_cron TEXT,
    conflict_policy TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE sync_conflicts (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    study_uid TEXT NOT NULL UNIQUE,
    config_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    local_last_modified TEXT,
    remote_last_modified TEXT,
    local_instance_count INTEGER,
    remote_instance_count INTEGER,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolution_used TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX idx_sync_conflicts_config ON sync_conflicts (config_id);

CREATE TABLE sync_history (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    success INTEGER NOT NULL,
    studies_checked INTEGER NOT NULL DEFAULT 0,
    studies_synced INTEGER NOT NULL DEFAULT 0,
    conflicts_found INTEGER NOT NULL DEFAULT 0,
    errors_json TEXT NOT NULL DEFAULT '[]',
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
CREATE INDEX idx_sync_history_config ON sync_history (config_id);

CREATE TABLE recent_studies (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    study_uid TEXT NOT NULL UNIQUE,
    patient_id TEXT NOT NULL,
    accessed_at TEXT NOT NULL
);
"#,
}];

pub(crate) async fn current_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
    )
    .fetch_one(pool)
    .await
    .map_err(Error::from)
}

pub(crate) async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let current = current_version(pool).await?;
    if current > LATEST {
        return Err(Error::SchemaTooNew {
            found: current,
            supported: LATEST,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(version = migration.version, "applying schema migration");
        let mut txn = pool.begin().await?;
        for statement in split_statements(migration.sql) {
            sqlx::query(statement).execute(&mut *txn).await?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
            .bind(migration.version)
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;
    }
    Ok(())
}

/// Split a migration script on statement-terminating semicolons. Good
/// enough for our DDL, which never embeds semicolons in literals.
fn split_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statements_split_cleanly() {
        let statements: Vec<&str> = split_statements(MIGRATIONS[0].sql).collect();
        assert!(statements.len() > 10);
        assert!(statements.iter().all(|s| s.starts_with("CREATE")));
    }
}
