use models::{JobPriority, RoutingRule};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, EntityMapping, Repository, SqlValue,
};
use crate::{Error, Result, Store};

const TABLE: &str = "routing_rules";

pub struct RoutingRuleMapping;

impl EntityMapping for RoutingRuleMapping {
    type Entity = RoutingRule;
    type Key = String;

    const TABLE: &'static str = TABLE;
    const ID_COLUMN: &'static str = "rule_id";

    fn columns() -> &'static [&'static str] {
        &[
            "rule_id",
            "name",
            "enabled",
            "priority",
            "conditions_json",
            "actions_json",
            "stop_processing",
            "job_priority",
            "triggered_count",
            "success_count",
            "failure_count",
            "last_triggered",
            "created_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<RoutingRule> {
        let conditions: String = row.try_get("conditions_json")?;
        let actions: String = row.try_get("actions_json")?;
        let job_priority: i64 = row.try_get("job_priority")?;
        Ok(RoutingRule {
            pk: row.try_get("pk")?,
            rule_id: row.try_get("rule_id")?,
            name: row.try_get("name")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            priority: row.try_get::<i64, _>("priority")? as i32,
            conditions: serde_json::from_str(&conditions)
                .map_err(|err| Error::malformed(TABLE, err))?,
            actions: serde_json::from_str(&actions)
                .map_err(|err| Error::malformed(TABLE, err))?,
            stop_processing: row.try_get::<i64, _>("stop_processing")? != 0,
            job_priority: JobPriority::from_rank(job_priority as i32)
                .ok_or_else(|| Error::malformed(TABLE, format!("bad priority {job_priority}")))?,
            triggered_count: row.try_get::<i64, _>("triggered_count")? as u64,
            success_count: row.try_get::<i64, _>("success_count")? as u64,
            failure_count: row.try_get::<i64, _>("failure_count")? as u64,
            last_triggered: parse_opt_ts(
                TABLE,
                row.try_get::<Option<String>, _>("last_triggered")?.as_deref(),
            )?,
            created_at: parse_ts(TABLE, &row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn to_values(rule: &RoutingRule) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("rule_id", rule.rule_id.clone().into()),
            ("name", rule.name.clone().into()),
            ("enabled", rule.enabled.into()),
            ("priority", (rule.priority as i64).into()),
            (
                "conditions_json",
                serde_json::to_string(&rule.conditions)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            (
                "actions_json",
                serde_json::to_string(&rule.actions)
                    .unwrap_or_else(|_| "[]".to_string())
                    .into(),
            ),
            ("stop_processing", rule.stop_processing.into()),
            ("job_priority", (rule.job_priority.rank() as i64).into()),
            ("triggered_count", rule.triggered_count.into()),
            ("success_count", rule.success_count.into()),
            ("failure_count", rule.failure_count.into()),
            ("last_triggered", format_opt_ts(rule.last_triggered)),
            ("created_at", format_ts(rule.created_at).into()),
        ]
    }

    fn key(rule: &RoutingRule) -> String {
        rule.rule_id.clone()
    }

    fn has_key(rule: &RoutingRule) -> bool {
        !rule.rule_id.is_empty()
    }
}

#[derive(Clone)]
pub struct RoutingRuleRepository {
    base: Repository<RoutingRuleMapping>,
}

impl RoutingRuleRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    /// Enabled rules in evaluation order: priority descending, then age.
    pub async fn find_enabled(&self) -> Result<Vec<RoutingRule>> {
        let sql = format!(
            "SELECT pk, {} FROM {TABLE} WHERE enabled = 1 \
             ORDER BY priority DESC, created_at ASC, pk ASC",
            RoutingRuleMapping::columns().join(", ")
        );
        let rows = sqlx::query(&sql).fetch_all(self.base.pool()).await?;
        rows.iter().map(RoutingRuleMapping::from_row).collect()
    }

    pub async fn update_priority(&self, rule_id: &str, priority: i32) -> Result<()> {
        sqlx::query("UPDATE routing_rules SET priority = ?2 WHERE rule_id = ?1")
            .bind(rule_id)
            .bind(priority as i64)
            .execute(self.base.pool())
            .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE routing_rules SET enabled = ?2 WHERE rule_id = ?1")
            .bind(rule_id)
            .bind(enabled as i64)
            .execute(self.base.pool())
            .await?;
        Ok(())
    }

    /// Bump the trigger counter and stamp `last_triggered`.
    pub async fn increment_triggered(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE routing_rules SET triggered_count = triggered_count + 1, \
             last_triggered = ?2 WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .bind(format_ts(chrono::Utc::now()))
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn increment_success(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE routing_rules SET success_count = success_count + 1 WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn increment_failure(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE routing_rules SET failure_count = failure_count + 1 WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn reset_statistics(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE routing_rules SET triggered_count = 0, success_count = 0, \
             failure_count = 0, last_triggered = NULL WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }

    pub async fn count_enabled(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM routing_rules WHERE enabled = 1")
            .fetch_one(self.base.pool())
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}

impl std::ops::Deref for RoutingRuleRepository {
    type Target = Repository<RoutingRuleMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::truncate_to_seconds;
    use models::{MatchField, MatchOp, RoutingAction, RoutingCondition};

    fn rule(id: &str, priority: i32) -> RoutingRule {
        let mut rule = RoutingRule::new(id, format!("rule {id}"));
        rule.priority = priority;
        rule.created_at = truncate_to_seconds(rule.created_at);
        rule.conditions.push(RoutingCondition {
            field: MatchField::Modality,
            op: MatchOp::Equals,
            value: "CT".to_string(),
        });
        rule.actions.push(RoutingAction {
            destinations: vec!["peer-1".to_string()],
        });
        rule
    }

    #[tokio::test]
    async fn enabled_rules_come_back_in_priority_order() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = RoutingRuleRepository::new(&store);

        repo.insert(&rule("low", 1)).await.unwrap();
        repo.insert(&rule("high", 10)).await.unwrap();
        repo.insert(&rule("disabled", 99)).await.unwrap();
        repo.set_enabled("disabled", false).await.unwrap();

        let enabled = repo.find_enabled().await.unwrap();
        let ids: Vec<&str> = enabled.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert_eq!(repo.count_enabled().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn statistics_roll_forward_and_reset() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = RoutingRuleRepository::new(&store);
        repo.insert(&rule("r", 0)).await.unwrap();

        repo.increment_triggered("r").await.unwrap();
        repo.increment_success("r").await.unwrap();
        repo.increment_failure("r").await.unwrap();

        let loaded = repo.find_by_id(&"r".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.triggered_count, 1);
        assert_eq!(loaded.success_count, 1);
        assert_eq!(loaded.failure_count, 1);
        assert!(loaded.last_triggered.is_some());

        repo.reset_statistics("r").await.unwrap();
        let reset = repo.find_by_id(&"r".to_string()).await.unwrap().unwrap();
        assert_eq!(reset.triggered_count, 0);
        assert_eq!(reset.last_triggered, None);
    }

    #[tokio::test]
    async fn rules_round_trip_exactly() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = RoutingRuleRepository::new(&store);

        let mut original = rule("rt", 5);
        original.stop_processing = true;
        original.job_priority = JobPriority::High;
        let pk = repo.insert(&original).await.unwrap();
        original.pk = pk;

        let loaded = repo.find_by_pk(pk).await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }
}
