use chrono::Utc;
use models::RecentStudy;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::repository::{format_ts, parse_ts, EntityMapping, Repository, SqlValue};
use crate::{Result, Store};

const TABLE: &str = "recent_studies";

pub struct RecentStudyMapping;

impl EntityMapping for RecentStudyMapping {
    type Entity = RecentStudy;
    type Key = String;

    const TABLE: &'static str = TABLE;
    const ID_COLUMN: &'static str = "study_uid";

    fn columns() -> &'static [&'static str] {
        &["study_uid", "patient_id", "accessed_at"]
    }

    fn from_row(row: &SqliteRow) -> Result<RecentStudy> {
        Ok(RecentStudy {
            pk: row.try_get("pk")?,
            study_uid: row.try_get("study_uid")?,
            patient_id: row.try_get("patient_id")?,
            accessed_at: parse_ts(TABLE, &row.try_get::<String, _>("accessed_at")?)?,
        })
    }

    fn to_values(study: &RecentStudy) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("study_uid", study.study_uid.clone().into()),
            ("patient_id", study.patient_id.clone().into()),
            ("accessed_at", format_ts(study.accessed_at).into()),
        ]
    }

    fn key(study: &RecentStudy) -> String {
        study.study_uid.clone()
    }

    fn has_key(study: &RecentStudy) -> bool {
        !study.study_uid.is_empty()
    }
}

#[derive(Clone)]
pub struct RecentStudyRepository {
    base: Repository<RecentStudyMapping>,
}

impl RecentStudyRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    /// Upsert the study with a fresh access time.
    pub async fn touch(&self, study_uid: &str, patient_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO recent_studies (study_uid, patient_id, accessed_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (study_uid) DO UPDATE SET \
             patient_id = excluded.patient_id, accessed_at = excluded.accessed_at",
        )
        .bind(study_uid)
        .bind(patient_id)
        .bind(format_ts(Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    /// Most recently touched first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<RecentStudy>> {
        let sql = format!(
            "SELECT pk, {} FROM {TABLE} ORDER BY accessed_at DESC, pk DESC LIMIT ?1",
            RecentStudyMapping::columns().join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(self.base.pool())
            .await?;
        rows.iter().map(RecentStudyMapping::from_row).collect()
    }

    /// Keep only the `keep` most recent rows.
    pub async fn prune(&self, keep: usize) -> Result<u64> {
        let done = sqlx::query(
            "DELETE FROM recent_studies WHERE pk NOT IN \
             (SELECT pk FROM recent_studies ORDER BY accessed_at DESC, pk DESC LIMIT ?1)",
        )
        .bind(keep as i64)
        .execute(self.base.pool())
        .await?;
        Ok(done.rows_affected())
    }
}

impl std::ops::Deref for RecentStudyRepository {
    type Target = Repository<RecentStudyMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
