//! Activity suitability evaluator (§4.7): rule lookup, ordered condition
//! matching, and metric formatting against a weather `Insights` snapshot.

use crate::store::{Filter, Store};
use crate::weather::Insights;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SuitabilityError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: f64,
    pub level: String,
    pub label: String,
    pub detail: String,
    #[serde(rename = "metricTemplate")]
    pub metric_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fallback {
    pub level: String,
    pub label: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuitabilityRule {
    pub key: String,
    pub conditions: Vec<Condition>,
    pub fallback: Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuitabilityRating {
    pub level: String,
    pub label: String,
    pub detail: String,
    pub metric: Option<String>,
}

fn generic_good_rating() -> SuitabilityRating {
    SuitabilityRating {
        level: "good".to_string(),
        label: "Good conditions".to_string(),
        detail: "No specific concerns for this activity.".to_string(),
        metric: None,
    }
}

/// `Activity` lookup table entry (§3): `{id, label, category}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub label: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "casual".to_string()
}

/// Looks up an activity's `category` from the `activities` collection, so
/// a caller that only has an activity id can still resolve the
/// `category:{category}` rule fallback.
pub async fn lookup_activity(store: &dyn Store, activity_id: &str) -> Result<Option<Activity>, SuitabilityError> {
    let doc = store.find_one("activities", Filter::new().eq("id", activity_id)).await?;
    Ok(doc.and_then(|doc| serde_json::from_value(doc).ok()))
}

/// Looks up `activity:{id}`, falling back to `category:{category}`.
pub async fn load_rule(store: &dyn Store, activity_id: &str, category: Option<&str>) -> Result<Option<SuitabilityRule>, SuitabilityError> {
    let activity_key = format!("activity:{activity_id}");
    if let Some(doc) = store.find_one("suitability_rules", Filter::new().eq("key", &activity_key)).await? {
        if let Ok(rule) = serde_json::from_value::<SuitabilityRule>(doc) {
            return Ok(Some(rule));
        }
    }

    if let Some(category) = category {
        let category_key = format!("category:{category}");
        if let Some(doc) = store.find_one("suitability_rules", Filter::new().eq("key", &category_key)).await? {
            if let Ok(rule) = serde_json::from_value::<SuitabilityRule>(doc) {
                return Ok(Some(rule));
            }
        }
    }

    Ok(None)
}

/// `GET /suitability` with no `key`: the full rule bundle, used by clients
/// that want to cache every rule up front instead of one lookup per activity.
pub async fn list_rules(store: &dyn Store) -> Result<Vec<SuitabilityRule>, SuitabilityError> {
    let docs = store.find("suitability_rules", Filter::new(), Some("key"), false, crate::store::FindOptions::default()).await?;
    Ok(docs.into_iter().filter_map(|doc| serde_json::from_value(doc).ok()).collect())
}

pub async fn get_rule_by_key(store: &dyn Store, key: &str) -> Result<Option<SuitabilityRule>, SuitabilityError> {
    let doc = store.find_one("suitability_rules", Filter::new().eq("key", key)).await?;
    Ok(doc.and_then(|doc| serde_json::from_value(doc).ok()))
}

/// `^(activity|category):[a-z0-9-]+$` (§6): keys outside this shape are
/// rejected before ever reaching the store.
pub fn is_valid_rule_key(key: &str) -> bool {
    let Some((prefix, suffix)) = key.split_once(':') else { return false };
    (prefix == "activity" || prefix == "category")
        && !suffix.is_empty()
        && suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn matches(operator: Operator, actual: f64, expected: f64) -> bool {
    match operator {
        Operator::Gt => actual > expected,
        Operator::Lt => actual < expected,
        Operator::Gte => actual >= expected,
        Operator::Lte => actual <= expected,
        Operator::Eq => (actual - expected).abs() < f64::EPSILON,
    }
}

fn format_metric(template: &str, value: f64) -> String {
    template.replace("{value}", &format!("{value}"))
}

/// Evaluates `rule` (or a generic "good" rating if absent) against `insights`,
/// returning the first matching condition in declared order, else the
/// rule's fallback.
pub fn evaluate(rule: Option<&SuitabilityRule>, insights: &Insights) -> SuitabilityRating {
    let Some(rule) = rule else {
        return generic_good_rating();
    };

    for condition in &rule.conditions {
        let Some(actual) = field_value(insights, &condition.field) else {
            continue;
        };
        if matches(condition.operator, actual, condition.value) {
            return SuitabilityRating {
                level: condition.level.clone(),
                label: condition.label.clone(),
                detail: condition.detail.clone(),
                metric: Some(format_metric(&condition.metric_template, actual)),
            };
        }
    }

    SuitabilityRating {
        level: rule.fallback.level.clone(),
        label: rule.fallback.label.clone(),
        detail: rule.fallback.detail.clone(),
        metric: None,
    }
}

/// Generic accessor over every numeric `Insights` field, keyed by the
/// spec's exact camelCase field names (`insights.get(field)` in the
/// original). `precipitationType` is a string, not a condition operand,
/// and has no entry here.
fn field_value(insights: &Insights, field: &str) -> Option<f64> {
    match field {
        "heatStressIndex" => insights.heat_stress_index,
        "thunderstormProbability" => insights.thunderstorm_probability,
        "uvHealthConcern" => insights.uv_health_concern,
        "visibility" => insights.visibility,
        "windSpeed" => insights.wind_speed,
        "windGust" => insights.wind_gust,
        "dewPoint" => insights.dew_point,
        "gdd10To30" => insights.gdd10_to_30,
        "evapotranspiration" => insights.evapotranspiration,
        "moonPhase" => insights.moon_phase,
        "cloudBase" => insights.cloud_base,
        "cloudCeiling" => insights.cloud_ceiling,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insights_with_heat_stress(value: f64) -> Insights {
        Insights { heat_stress_index: Some(value), ..Default::default() }
    }

    fn sample_rule() -> SuitabilityRule {
        SuitabilityRule {
            key: "activity:hiking".to_string(),
            conditions: vec![
                Condition {
                    field: "heatStressIndex".to_string(),
                    operator: Operator::Gte,
                    value: 28.0,
                    level: "poor".to_string(),
                    label: "Too hot".to_string(),
                    detail: "Heat stress is elevated.".to_string(),
                    metric_template: "{value}°C heat stress".to_string(),
                },
            ],
            fallback: Fallback { level: "good".to_string(), label: "Good".to_string(), detail: "Fine.".to_string() },
        }
    }

    #[test]
    fn first_matching_condition_wins_in_declared_order() {
        let rule = sample_rule();
        let rating = evaluate(Some(&rule), &insights_with_heat_stress(30.0));
        assert_eq!(rating.level, "poor");
        assert_eq!(rating.metric.unwrap(), "30°C heat stress");
    }

    #[test]
    fn missing_field_is_skipped_and_fallback_used() {
        let rule = sample_rule();
        let rating = evaluate(Some(&rule), &Insights::default());
        assert_eq!(rating.level, "good");
    }

    #[test]
    fn no_rule_returns_generic_good() {
        let rating = evaluate(None, &Insights::default());
        assert_eq!(rating.level, "good");
        assert!(rating.metric.is_none());
    }

    #[test]
    fn gte_operator_is_inclusive() {
        assert!(matches(Operator::Gte, 28.0, 28.0));
        assert!(!matches(Operator::Gt, 28.0, 28.0));
    }

    #[test]
    fn rule_key_shape_is_validated() {
        assert!(is_valid_rule_key("activity:hiking"));
        assert!(is_valid_rule_key("category:farming"));
        assert!(!is_valid_rule_key("activity:"));
        assert!(!is_valid_rule_key("activity:Hiking"));
        assert!(!is_valid_rule_key("weird:hiking"));
    }
}
