use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Dataset attribute a routing condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Modality,
    BodyPart,
    CallingAe,
    PatientId,
    StudyDescription,
    StationName,
    InstitutionName,
}

impl MatchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::Modality => "modality",
            MatchField::BodyPart => "body_part",
            MatchField::CallingAe => "calling_ae",
            MatchField::PatientId => "patient_id",
            MatchField::StudyDescription => "study_description",
            MatchField::StationName => "station_name",
            MatchField::InstitutionName => "institution_name",
        }
    }
}

impl std::str::FromStr for MatchField {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modality" => Ok(MatchField::Modality),
            "body_part" => Ok(MatchField::BodyPart),
            "calling_ae" => Ok(MatchField::CallingAe),
            "patient_id" => Ok(MatchField::PatientId),
            "study_description" => Ok(MatchField::StudyDescription),
            "station_name" => Ok(MatchField::StationName),
            "institution_name" => Ok(MatchField::InstitutionName),
            other => Err(ParseEnumError::new("match field", other)),
        }
    }
}

/// Comparison applied to the field value. Numeric comparisons parse both
/// sides as decimal numbers and fail the condition when either side does
/// not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Equals,
    NotEquals,
    Contains,
    Glob,
    Regex,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl MatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equals => "equals",
            MatchOp::NotEquals => "not_equals",
            MatchOp::Contains => "contains",
            MatchOp::Glob => "glob",
            MatchOp::Regex => "regex",
            MatchOp::GreaterThan => "greater_than",
            MatchOp::GreaterOrEqual => "greater_or_equal",
            MatchOp::LessThan => "less_than",
            MatchOp::LessOrEqual => "less_or_equal",
        }
    }
}

impl std::str::FromStr for MatchOp {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(MatchOp::Equals),
            "not_equals" => Ok(MatchOp::NotEquals),
            "contains" => Ok(MatchOp::Contains),
            "glob" => Ok(MatchOp::Glob),
            "regex" => Ok(MatchOp::Regex),
            "greater_than" => Ok(MatchOp::GreaterThan),
            "greater_or_equal" => Ok(MatchOp::GreaterOrEqual),
            "less_than" => Ok(MatchOp::LessThan),
            "less_or_equal" => Ok(MatchOp::LessOrEqual),
            other => Err(ParseEnumError::new("match op", other)),
        }
    }
}

/// One `(field, op, value)` predicate. A rule matches only when every
/// condition matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingCondition {
    pub field: MatchField,
    pub op: MatchOp,
    pub value: String,
}

/// Forward the matched study to each of these destination nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingAction {
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Surrogate key. Zero until the row is first persisted.
    #[serde(default)]
    pub pk: i64,
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    /// Higher priority rules evaluate first; ties break by `created_at`.
    pub priority: i32,
    pub conditions: Vec<RoutingCondition>,
    pub actions: Vec<RoutingAction>,
    /// When set, a match stops evaluation of lower-priority rules.
    #[serde(default)]
    pub stop_processing: bool,
    /// Priority at which forward jobs are submitted.
    #[serde(default = "default_job_priority")]
    pub job_priority: crate::JobPriority,
    #[serde(default)]
    pub triggered_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_job_priority() -> crate::JobPriority {
    crate::JobPriority::Normal
}

impl RoutingRule {
    pub fn new(rule_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pk: 0,
            rule_id: rule_id.into(),
            name: name.into(),
            enabled: true,
            priority: 0,
            conditions: Vec::new(),
            actions: Vec::new(),
            stop_processing: false,
            job_priority: crate::JobPriority::Normal,
            triggered_count: 0,
            success_count: 0,
            failure_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rule_round_trips_through_json() {
        let mut rule = RoutingRule::new("r-ct", "CT to peer-1");
        rule.priority = 10;
        rule.conditions.push(RoutingCondition {
            field: MatchField::Modality,
            op: MatchOp::Equals,
            value: "CT".to_string(),
        });
        rule.actions.push(RoutingAction {
            destinations: vec!["peer-1".to_string()],
        });
        rule.stop_processing = true;

        let json = serde_json::to_string(&rule).unwrap();
        let back: RoutingRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }

    #[test]
    fn ops_round_trip_through_text() {
        for op in [
            MatchOp::Equals,
            MatchOp::NotEquals,
            MatchOp::Contains,
            MatchOp::Glob,
            MatchOp::Regex,
            MatchOp::GreaterThan,
            MatchOp::GreaterOrEqual,
            MatchOp::LessThan,
            MatchOp::LessOrEqual,
        ] {
            assert_eq!(op.as_str().parse::<MatchOp>().unwrap(), op);
        }
    }
}
