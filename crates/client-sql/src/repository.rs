//! The generic repository: shared CRUD over any entity with a mapping.
//!
//! Entity repositories supply row↔entity mapping through [`EntityMapping`]
//! and inherit every CRUD operation from [`Repository`]; they add only
//! their domain queries.

use std::marker::PhantomData;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Sqlite, SqlitePool};

use crate::{Error, Result, Store};

/// A dynamically typed bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Attach this value to the next placeholder of `query`.
    pub(crate) fn bind_to<'q>(
        self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(i),
            SqlValue::Real(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// Comparison operators accepted by `find_where` / `remove_where`.
/// Column names and operators come from code, never from callers' data;
/// only values are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Like => "LIKE",
        }
    }
}

/// Row↔entity mapping contributed by each entity repository.
pub trait EntityMapping: Send + Sync + 'static {
    type Entity: Send + Sync + Unpin + 'static;
    /// Domain-id type. Every table also has an integer `pk` surrogate,
    /// reachable through [`Repository::find_by_pk`].
    type Key: Clone + std::fmt::Display + Into<SqlValue> + Send + Sync;

    const TABLE: &'static str;
    const ID_COLUMN: &'static str;

    /// Data columns, excluding `pk`.
    fn columns() -> &'static [&'static str];
    fn from_row(row: &SqliteRow) -> Result<Self::Entity>;
    /// Values for insert/update, aligned with [`Self::columns`].
    fn to_values(entity: &Self::Entity) -> Vec<(&'static str, SqlValue)>;
    fn key(entity: &Self::Entity) -> Self::Key;
    fn has_key(entity: &Self::Entity) -> bool;
}

/// Generic CRUD over one table. Entity repositories wrap this and add
/// domain queries.
pub struct Repository<M: EntityMapping> {
    pool: SqlitePool,
    _marker: PhantomData<fn() -> M>,
}

impl<M: EntityMapping> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: EntityMapping> Repository<M> {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn select_sql() -> String {
        format!("SELECT pk, {} FROM {}", M::columns().join(", "), M::TABLE)
    }

    pub async fn find_by_id(&self, id: &M::Key) -> Result<Option<M::Entity>> {
        let sql = format!("{} WHERE {} = ?1", Self::select_sql(), M::ID_COLUMN);
        let query = id.clone().into().bind_to(sqlx::query(&sql));
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| M::from_row(&r)).transpose()
    }

    pub async fn find_by_pk(&self, pk: i64) -> Result<Option<M::Entity>> {
        let sql = format!("{} WHERE pk = ?1", Self::select_sql());
        let row = sqlx::query(&sql).bind(pk).fetch_optional(&self.pool).await?;
        row.map(|r| M::from_row(&r)).transpose()
    }

    pub async fn find_all(&self, limit: Option<usize>) -> Result<Vec<M::Entity>> {
        let mut sql = Self::select_sql();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(M::from_row).collect()
    }

    pub async fn find_where(
        &self,
        column: &str,
        op: CmpOp,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<M::Entity>> {
        let sql = format!(
            "{} WHERE {} {} ?1",
            Self::select_sql(),
            column,
            op.as_sql()
        );
        let query = value.into().bind_to(sqlx::query(&sql));
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(M::from_row).collect()
    }

    pub async fn exists(&self, id: &M::Key) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            M::TABLE,
            M::ID_COLUMN
        );
        let query = id.clone().into().bind_to(sqlx::query(&sql));
        let row = query.fetch_one(&self.pool).await?;
        let count: i64 = sqlx::Row::get(&row, 0);
        Ok(count > 0)
    }

    pub async fn count(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", M::TABLE);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let count: i64 = sqlx::Row::get(&row, 0);
        Ok(count as u64)
    }

    /// Insert and return the new row's `pk`.
    pub async fn insert(&self, entity: &M::Entity) -> Result<i64> {
        Self::insert_on(&self.pool, entity).await
    }

    pub(crate) async fn insert_on<'e, E>(executor: E, entity: &M::Entity) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let values = M::to_values(entity);
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            M::TABLE,
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = value.bind_to(query);
        }
        let done = query.execute(executor).await?;
        Ok(done.last_insert_rowid())
    }

    /// Update the row matching the entity's domain id.
    pub async fn update(&self, entity: &M::Entity) -> Result<()> {
        let values = M::to_values(entity);
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{c} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            M::TABLE,
            assignments.join(", "),
            M::ID_COLUMN,
            values.len() + 1
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = value.bind_to(query);
        }
        query = M::key(entity).into().bind_to(query);
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert: update when a row with the entity's domain id exists,
    /// insert otherwise. Returns the row's `pk`.
    pub async fn save(&self, entity: &M::Entity) -> Result<i64> {
        if M::has_key(entity) {
            let key = M::key(entity);
            let sql = format!(
                "SELECT pk FROM {} WHERE {} = ?1",
                M::TABLE,
                M::ID_COLUMN
            );
            let existing = key
                .clone()
                .into()
                .bind_to(sqlx::query(&sql))
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = existing {
                self.update(entity).await?;
                return Ok(sqlx::Row::get(&row, 0));
            }
        }
        self.insert(entity).await
    }

    /// Delete by domain id; returns whether a row was removed.
    pub async fn remove(&self, id: &M::Key) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", M::TABLE, M::ID_COLUMN);
        let query = id.clone().into().bind_to(sqlx::query(&sql));
        let done = query.execute(&self.pool).await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn remove_where(
        &self,
        column: &str,
        op: CmpOp,
        value: impl Into<SqlValue>,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} {} ?1",
            M::TABLE,
            column,
            op.as_sql()
        );
        let query = value.into().bind_to(sqlx::query(&sql));
        let done = query.execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    /// Insert all entities in one transaction; any failure rolls the whole
    /// batch back.
    pub async fn insert_batch(&self, entities: &[M::Entity]) -> Result<Vec<i64>> {
        let mut txn = self.pool.begin().await?;
        let mut pks = Vec::with_capacity(entities.len());
        for entity in entities {
            match Self::insert_on(&mut *txn, entity).await {
                Ok(pk) => pks.push(pk),
                Err(err) => {
                    if let Err(rollback) = txn.rollback().await {
                        tracing::warn!(error = %rollback, "batch rollback failed");
                    }
                    return Err(err);
                }
            }
        }
        txn.commit().await?;
        Ok(pks)
    }
}

// Timestamp helpers shared by the entity mappings. Stored form is
// ISO-8601 at second precision, UTC, e.g. `2025-03-10 14:25:58`.

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn format_opt_ts(ts: Option<DateTime<Utc>>) -> SqlValue {
    match ts {
        Some(ts) => SqlValue::Text(format_ts(ts)),
        None => SqlValue::Null,
    }
}

pub fn parse_ts(table: &'static str, s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| Error::malformed(table, format!("bad timestamp {s:?}: {err}")))
}

pub fn parse_opt_ts(table: &'static str, s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match s {
        None => Ok(None),
        Some("") => Ok(None),
        Some(s) => parse_ts(table, s).map(Some),
    }
}

/// Drop the sub-second part of a timestamp, matching the stored precision.
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}
