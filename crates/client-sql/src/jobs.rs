use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use models::{JobKind, JobPriority, JobProgress, JobRecord, JobStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, EntityMapping, Repository, SqlValue,
};
use crate::{Error, Result, Store};

const TABLE: &str = "jobs";

pub struct JobMapping;

impl EntityMapping for JobMapping {
    type Entity = JobRecord;
    type Key = String;

    const TABLE: &'static str = TABLE;
    const ID_COLUMN: &'static str = "job_id";

    fn columns() -> &'static [&'static str] {
        &[
            "job_id",
            "kind",
            "source_node_id",
            "destination_node_id",
            "study_uid",
            "series_uid",
            "sop_instance_uids_json",
            "metadata_json",
            "priority",
            "max_retries",
            "retry_count",
            "status",
            "items_total",
            "items_done",
            "bytes_total",
            "bytes_done",
            "current_item",
            "error_message",
            "error_details",
            "created_by",
            "parent_rule_id",
            "created_at",
            "started_at",
            "completed_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<JobRecord> {
        let job_id: String = row.try_get("job_id")?;
        let job_id =
            Uuid::parse_str(&job_id).map_err(|err| Error::malformed(TABLE, err))?;
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let priority: i64 = row.try_get("priority")?;
        let uids_json: String = row.try_get("sop_instance_uids_json")?;
        let metadata_json: String = row.try_get("metadata_json")?;

        Ok(JobRecord {
            pk: row.try_get("pk")?,
            job_id,
            kind: kind.parse().map_err(|err| Error::malformed(TABLE, err))?,
            source_node_id: row.try_get("source_node_id")?,
            destination_node_id: row.try_get("destination_node_id")?,
            study_uid: row.try_get("study_uid")?,
            series_uid: row.try_get("series_uid")?,
            sop_instance_uids: serde_json::from_str(&uids_json)
                .map_err(|err| Error::malformed(TABLE, err))?,
            metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata_json)
                .map_err(|err| Error::malformed(TABLE, err))?,
            priority: JobPriority::from_rank(priority as i32)
                .ok_or_else(|| Error::malformed(TABLE, format!("bad priority {priority}")))?,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            status: status.parse().map_err(|err| Error::malformed(TABLE, err))?,
            progress: JobProgress {
                items_total: row.try_get::<i64, _>("items_total")? as u64,
                items_done: row.try_get::<i64, _>("items_done")? as u64,
                bytes_total: row.try_get::<i64, _>("bytes_total")? as u64,
                bytes_done: row.try_get::<i64, _>("bytes_done")? as u64,
                current_item: row.try_get("current_item")?,
            },
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            created_by: row.try_get("created_by")?,
            parent_rule_id: row.try_get("parent_rule_id")?,
            created_at: parse_ts(TABLE, &row.try_get::<String, _>("created_at")?)?,
            started_at: parse_opt_ts(TABLE, row.try_get::<Option<String>, _>("started_at")?.as_deref())?,
            completed_at: parse_opt_ts(
                TABLE,
                row.try_get::<Option<String>, _>("completed_at")?.as_deref(),
            )?,
        })
    }

    fn to_values(job: &JobRecord) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("job_id", job.job_id.to_string().into()),
            ("kind", job.kind.as_str().into()),
            ("source_node_id", job.source_node_id.clone().into()),
            (
                "destination_node_id",
                job.destination_node_id.clone().into(),
            ),
            ("study_uid", job.study_uid.clone().into()),
            ("series_uid", job.series_uid.clone().into()),
            (
                "sop_instance_uids_json",
                serde_json::to_string(&job.sop_instance_uids)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            (
                "metadata_json",
                serde_json::to_string(&job.metadata)
                    .unwrap_or_else(|_| "{}".to_string())
                    .into(),
            ),
            ("priority", (job.priority.rank() as i64).into()),
            ("max_retries", job.max_retries.into()),
            ("retry_count", job.retry_count.into()),
            ("status", job.status.as_str().into()),
            ("items_total", job.progress.items_total.into()),
            ("items_done", job.progress.items_done.into()),
            ("bytes_total", job.progress.bytes_total.into()),
            ("bytes_done", job.progress.bytes_done.into()),
            ("current_item", job.progress.current_item.clone().into()),
            ("error_message", job.error_message.clone().into()),
            ("error_details", job.error_details.clone().into()),
            ("created_by", job.created_by.clone().into()),
            ("parent_rule_id", job.parent_rule_id.clone().into()),
            ("created_at", format_ts(job.created_at).into()),
            ("started_at", format_opt_ts(job.started_at)),
            ("completed_at", format_opt_ts(job.completed_at)),
        ]
    }

    fn key(job: &JobRecord) -> String {
        job.job_id.to_string()
    }

    fn has_key(job: &JobRecord) -> bool {
        !job.job_id.is_nil()
    }
}

/// Filters for [`JobRepository::find_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobQueryOptions {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    /// Matches source or destination.
    pub node_id: Option<String>,
    pub created_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone)]
pub struct JobRepository {
    base: Repository<JobMapping>,
}

impl JobRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        self.base.find_by_id(&job_id.to_string()).await
    }

    /// List jobs ordered by priority (desc) then age (asc).
    pub async fn find_jobs(&self, options: &JobQueryOptions) -> Result<Vec<JobRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<SqlValue> = Vec::new();

        if let Some(status) = options.status {
            binds.push(status.as_str().into());
            clauses.push(format!("status = ?{}", binds.len()));
        }
        if let Some(kind) = options.kind {
            binds.push(kind.as_str().into());
            clauses.push(format!("kind = ?{}", binds.len()));
        }
        if let Some(node_id) = &options.node_id {
            binds.push(node_id.as_str().into());
            let n = binds.len();
            clauses.push(format!(
                "(source_node_id = ?{n} OR destination_node_id = ?{n})"
            ));
        }
        if let Some(created_by) = &options.created_by {
            binds.push(created_by.as_str().into());
            clauses.push(format!("created_by = ?{}", binds.len()));
        }

        let mut sql = format!(
            "SELECT pk, {} FROM {TABLE}",
            JobMapping::columns().join(", ")
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC, pk ASC");
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            options.limit.unwrap_or(100),
            options.offset
        ));

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = value.bind_to(query);
        }
        let rows = query.fetch_all(self.base.pool()).await?;
        rows.iter().map(JobMapping::from_row).collect()
    }

    pub async fn find_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.find_jobs(&JobQueryOptions {
            status: Some(status),
            limit: Some(limit),
            ..JobQueryOptions::default()
        })
        .await
    }

    /// Pending and queued jobs in dispatch order.
    pub async fn find_pending(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT pk, {} FROM {TABLE} WHERE status IN ('pending', 'queued') \
             ORDER BY priority DESC, created_at ASC, pk ASC LIMIT ?1",
            JobMapping::columns().join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(self.base.pool())
            .await?;
        rows.iter().map(JobMapping::from_row).collect()
    }

    /// Jobs referencing the node as source or destination.
    pub async fn find_by_node(&self, node_id: &str) -> Result<Vec<JobRecord>> {
        self.find_jobs(&JobQueryOptions {
            node_id: Some(node_id.to_string()),
            ..JobQueryOptions::default()
        })
        .await
    }

    /// Whether any non-terminal job references the node.
    pub async fn node_in_use(&self, node_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM jobs \
             WHERE (source_node_id = ?1 OR destination_node_id = ?1) \
             AND status NOT IN ('completed', 'canceled', 'failed')",
        )
        .bind(node_id)
        .fetch_one(self.base.pool())
        .await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
        error_details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = ?2, error_message = ?3, error_details = ?4 \
             WHERE job_id = ?1",
        )
        .bind(job_id.to_string())
        .bind(status.as_str())
        .bind(error_message)
        .bind(error_details)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    /// Transition queued → running and stamp `started_at`. Returns false
    /// when the job was no longer queued (e.g. canceled in the meantime).
    pub async fn mark_started(&self, job_id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?2 \
             WHERE job_id = ?1 AND status = 'queued'",
        )
        .bind(job_id.to_string())
        .bind(format_ts(Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Transition running → completed and stamp `completed_at`.
    pub async fn mark_completed(&self, job_id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?2, \
             error_message = NULL, error_details = NULL \
             WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id.to_string())
        .bind(format_ts(Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Transition running → failed with the rendered error; `completed_at`
    /// is stamped so terminal-failure timestamps are always present.
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        error_message: &str,
        error_details: Option<&str>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?2, \
             error_message = ?3, error_details = ?4 \
             WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id.to_string())
        .bind(format_ts(Utc::now()))
        .bind(error_message)
        .bind(error_details)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Transition running → canceled (worker-observed cancellation).
    pub async fn mark_canceled(&self, job_id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'canceled', completed_at = ?2 \
             WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id.to_string())
        .bind(format_ts(Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Cancel a job that is not currently running. Returns the status it
    /// held, or `None` when no waiting state matched.
    pub async fn try_cancel(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Paused,
            JobStatus::Failed,
        ] {
            let done = sqlx::query(
                "UPDATE jobs SET status = 'canceled', completed_at = ?3 \
                 WHERE job_id = ?1 AND status = ?2",
            )
            .bind(job_id.to_string())
            .bind(status.as_str())
            .bind(format_ts(Utc::now()))
            .execute(self.base.pool())
            .await?;
            if done.rows_affected() > 0 {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    /// Re-queue from `from` (paused resume, failed retry, or running
    /// recovery), clearing error state and the terminal timestamp.
    pub async fn mark_queued(&self, job_id: Uuid, from: JobStatus) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'queued', completed_at = NULL, \
             error_message = NULL, error_details = NULL \
             WHERE job_id = ?1 AND status = ?2",
        )
        .bind(job_id.to_string())
        .bind(from.as_str())
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Transition running → paused at a worker checkpoint.
    pub async fn mark_paused(&self, job_id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'paused' WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id.to_string())
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn increment_retry(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET retry_count = retry_count + 1 WHERE job_id = ?1")
            .bind(job_id.to_string())
            .execute(self.base.pool())
            .await?;
        Ok(())
    }

    pub async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET items_total = ?2, items_done = ?3, bytes_total = ?4, \
             bytes_done = ?5, current_item = ?6 WHERE job_id = ?1",
        )
        .bind(job_id.to_string())
        .bind(progress.items_total as i64)
        .bind(progress.items_done as i64)
        .bind(progress.bytes_total as i64)
        .bind(progress.bytes_done as i64)
        .bind(progress.current_item.as_deref())
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM jobs WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(self.base.pool())
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    pub async fn counts_by_status(&self) -> Result<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(self.base.pool())
            .await?;
        rows.into_iter()
            .map(|row| {
                let status: String = row.get(0);
                let count: i64 = row.get(1);
                let status: JobStatus = status
                    .parse()
                    .map_err(|err| Error::malformed(TABLE, err))?;
                Ok((status, count as u64))
            })
            .collect()
    }

    pub async fn count_completed_today(&self) -> Result<u64> {
        self.count_terminal_today("completed").await
    }

    pub async fn count_failed_today(&self) -> Result<u64> {
        self.count_terminal_today("failed").await
    }

    async fn count_terminal_today(&self, status: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1 \
             AND completed_at >= datetime('now', 'start of day')",
        )
        .bind(status)
        .fetch_one(self.base.pool())
        .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    /// Delete terminal jobs whose completion is older than `max_age`.
    /// Returns the number removed.
    pub async fn cleanup_old(&self, max_age: Duration) -> Result<u64> {
        let modifier = format!("-{} seconds", max_age.as_secs());
        let done = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'canceled') \
             AND completed_at IS NOT NULL AND completed_at < datetime('now', ?1)",
        )
        .bind(modifier)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected())
    }
}

impl std::ops::Deref for JobRepository {
    type Target = Repository<JobMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::truncate_to_seconds;

    fn job(kind: JobKind) -> JobRecord {
        let mut job = JobRecord::new(kind);
        job.created_at = truncate_to_seconds(job.created_at);
        job
    }

    #[tokio::test]
    async fn insert_then_find_returns_the_same_payload() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let mut submitted = job(JobKind::Forward);
        submitted.destination_node_id = Some("peer-1".to_string());
        submitted.study_uid = "1.2.3".to_string();
        submitted.sop_instance_uids = vec!["1.2.3.1".to_string()];
        submitted
            .metadata
            .insert("origin".to_string(), "scp".to_string());

        let pk = repo.insert(&submitted).await.unwrap();
        assert!(pk > 0);
        submitted.pk = pk;

        let found = repo.find_job(submitted.job_id).await.unwrap().unwrap();
        assert_eq!(found, submitted);
    }

    #[tokio::test]
    async fn save_twice_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let mut record = job(JobKind::Echo);
        let pk1 = repo.save(&record).await.unwrap();
        record.pk = pk1;
        let pk2 = repo.save(&record).await.unwrap();

        assert_eq!(pk1, pk2);
        assert_eq!(repo.count().await.unwrap(), 1);
        let found = repo.find_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(found, record);
    }

    #[tokio::test]
    async fn pending_jobs_come_back_in_dispatch_order() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let mut low = job(JobKind::Store);
        low.priority = JobPriority::Low;
        let mut urgent = job(JobKind::Store);
        urgent.priority = JobPriority::Urgent;
        let mut normal = job(JobKind::Store);
        normal.priority = JobPriority::Normal;

        for j in [&low, &urgent, &normal] {
            repo.insert(j).await.unwrap();
        }

        let pending = repo.find_pending(10).await.unwrap();
        let order: Vec<Uuid> = pending.iter().map(|j| j.job_id).collect();
        assert_eq!(order, vec![urgent.job_id, normal.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn status_updates_stamp_timestamps() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let record = job(JobKind::Retrieve);
        repo.insert(&record).await.unwrap();

        // Jobs start from queued; a second start must not fire.
        assert!(!repo.mark_started(record.job_id).await.unwrap());
        assert!(repo
            .mark_queued(record.job_id, JobStatus::Pending)
            .await
            .unwrap());
        assert!(repo.mark_started(record.job_id).await.unwrap());
        let running = repo.find_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        repo.mark_failed(record.job_id, "transient_network: timeout", Some("detail"))
            .await
            .unwrap();
        repo.increment_retry(record.job_id).await.unwrap();
        let failed = repo.find_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.completed_at.is_some());
        assert_eq!(
            failed.error_message.as_deref(),
            Some("transient_network: timeout")
        );

        assert!(repo
            .mark_queued(record.job_id, JobStatus::Failed)
            .await
            .unwrap());
        let queued = repo.find_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.error_message, None);
        assert_eq!(queued.completed_at, None);
        assert_eq!(queued.retry_count, 1, "retry count survives re-queue");
    }

    #[tokio::test]
    async fn node_in_use_sees_only_live_jobs() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let mut record = job(JobKind::Forward);
        record.destination_node_id = Some("peer-1".to_string());
        repo.insert(&record).await.unwrap();

        assert!(repo.node_in_use("peer-1").await.unwrap());
        assert!(!repo.node_in_use("peer-2").await.unwrap());

        let was = repo.try_cancel(record.job_id).await.unwrap();
        assert_eq!(was, Some(JobStatus::Pending));
        assert!(!repo.node_in_use("peer-1").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_jobs() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = JobRepository::new(&store);

        let old = job(JobKind::Echo);
        repo.insert(&old).await.unwrap();
        sqlx::query(
            "UPDATE jobs SET status = 'completed', \
             completed_at = datetime('now', '-2 days') WHERE job_id = ?1",
        )
        .bind(old.job_id.to_string())
        .execute(store.pool())
        .await
        .unwrap();

        let fresh = job(JobKind::Echo);
        repo.insert(&fresh).await.unwrap();
        repo.mark_completed(fresh.job_id).await.unwrap();

        let live = job(JobKind::Echo);
        repo.insert(&live).await.unwrap();

        let removed = repo
            .cleanup_old(Duration::from_secs(60 * 60 * 24))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.count().await.unwrap(), 2);
    }
}
