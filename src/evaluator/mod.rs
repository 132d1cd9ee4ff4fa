use std::sync::Arc;

use tracing::{event, Level};

use crate::{
    metering::{Metering, UsageContext, UsageSubject},
    models::{
        Condition, EntityAttributes, Feature, Operator, Property, RolloutPercentage, RuleValue,
        Segment, TargetingRule, TargetingRules, Value,
    },
    store::{ConfigurationStore, Configurations},
};

use self::getters::{get_numeric_value, get_string, in_rollout};
use self::models::EvalResult;

mod getters;
pub mod models;

fn compare_numbers(v1: &Value, v2: &Value, f: fn(f64, f64) -> bool) -> bool {
    let is_string = matches!(v1, Value::String(_)) || matches!(v2, Value::String(_));
    let both_numeric = matches!(v1, Value::Numeric(_)) && matches!(v2, Value::Numeric(_));
    if !is_string && !both_numeric {
        return false;
    }
    match (get_numeric_value(v1), get_numeric_value(v2)) {
        (Some(n1), Some(n2)) => f(n1, n2),
        _ => {
            event!(
                Level::WARN,
                "Invalid numeric comparison between {} and {}",
                v1,
                v2
            );
            false
        }
    }
}

fn values_equal(v1: &Value, v2: &Value) -> bool {
    match (v1, v2) {
        (Value::Numeric(n1), Value::Numeric(n2)) => n1.as_f64() == n2.as_f64(),
        (Value::Boolean(b1), Value::Boolean(b2)) => b1 == b2,
        (Value::String(s1), Value::String(s2)) => s1 == s2,
        (Value::Document(d1), Value::Document(d2)) => d1 == d2,
        // mixed types compare by their string form
        _ => get_string(v1) == get_string(v2),
    }
}

/// Applies `operator` to an entity value and one candidate value.
pub fn eval_operator(operator: &Operator, value: &Value, candidate: &Value) -> bool {
    match operator {
        Operator::EndsWith => get_string(value).ends_with(&get_string(candidate)),
        Operator::StartsWith => get_string(value).starts_with(&get_string(candidate)),
        Operator::Contains => get_string(value).contains(&get_string(candidate)),
        Operator::Is => values_equal(value, candidate),
        Operator::GreaterThan => compare_numbers(value, candidate, |n1, n2| n1 > n2),
        Operator::LesserThan => compare_numbers(value, candidate, |n1, n2| n1 < n2),
        Operator::GreaterThanEquals => compare_numbers(value, candidate, |n1, n2| n1 >= n2),
        Operator::LesserThanEquals => compare_numbers(value, candidate, |n1, n2| n1 <= n2),
        Operator::Unknown => {
            event!(Level::WARN, "Unknown operator in segment rule");
            false
        }
    }
}

/// A condition holds when the attribute is present and any candidate value
/// satisfies the operator.
fn eval_condition(condition: &Condition, attributes: &EntityAttributes) -> bool {
    match attributes.get(&condition.attribute_name) {
        None => false,
        Some(value) => condition
            .values
            .iter()
            .any(|candidate| eval_operator(&condition.operator, value, candidate)),
    }
}

/// All conditions must hold. A segment without conditions matches.
pub fn segment_matches(segment: &Segment, attributes: &EntityAttributes) -> bool {
    segment
        .rules
        .iter()
        .all(|condition| eval_condition(condition, attributes))
}

/// First rule, in ascending order, with a segment that exists and matches.
fn find_matching_rule<'a>(
    rules: &'a TargetingRules,
    configurations: &Configurations,
    attributes: &EntityAttributes,
) -> Option<(&'a TargetingRule, &'a str)> {
    for rule in rules.values() {
        for group in rule.rules.iter() {
            for segment_id in group.segments.iter() {
                let matched = configurations
                    .segments
                    .get(segment_id)
                    .map(|segment| segment_matches(segment, attributes))
                    .unwrap_or(false);
                if matched {
                    return Some((rule, segment_id));
                }
            }
        }
    }
    None
}

fn rollout_result(
    feature: &Feature,
    entity_id: &str,
    value: Value,
    percentage: u32,
    segment_id: Option<String>,
) -> EvalResult {
    if in_rollout(entity_id, &feature.feature_id, percentage) {
        EvalResult {
            value,
            enabled: true,
            segment_id,
        }
    } else {
        EvalResult {
            value: feature.disabled_value.clone(),
            enabled: false,
            segment_id,
        }
    }
}

pub fn eval_feature(
    configurations: &Configurations,
    feature: &Feature,
    entity_id: &str,
    attributes: Option<&EntityAttributes>,
) -> EvalResult {
    if !feature.enabled {
        return EvalResult::default_value(feature.disabled_value.clone(), false);
    }

    let attributes = match attributes {
        Some(attributes) if !attributes.is_empty() => attributes,
        _ => return EvalResult::default_value(feature.enabled_value.clone(), true),
    };

    match find_matching_rule(&feature.segment_rules, configurations, attributes) {
        Some((rule, segment_id)) => {
            let value = match &rule.value {
                RuleValue::Default => feature.enabled_value.clone(),
                RuleValue::Literal(v) => v.clone(),
            };
            let percentage = match rule.rollout_percentage {
                Some(RolloutPercentage::Percent(p)) => p,
                Some(RolloutPercentage::Inherit) | None => feature.rollout_percentage,
            };
            rollout_result(
                feature,
                entity_id,
                value,
                percentage,
                Some(segment_id.to_string()),
            )
        }
        None => rollout_result(
            feature,
            entity_id,
            feature.enabled_value.clone(),
            feature.rollout_percentage,
            None,
        ),
    }
}

pub fn eval_property(
    configurations: &Configurations,
    property: &Property,
    attributes: Option<&EntityAttributes>,
) -> EvalResult {
    let attributes = match attributes {
        Some(attributes) if !attributes.is_empty() => attributes,
        _ => return EvalResult::default_value(property.value.clone(), true),
    };

    match find_matching_rule(&property.segment_rules, configurations, attributes) {
        Some((rule, segment_id)) => EvalResult {
            value: match &rule.value {
                RuleValue::Default => property.value.clone(),
                RuleValue::Literal(v) => v.clone(),
            },
            enabled: true,
            segment_id: Some(segment_id.to_string()),
        },
        None => EvalResult::default_value(property.value.clone(), true),
    }
}

/// Evaluates against the current configuration snapshot and counts every
/// evaluation.
pub struct Evaluator {
    store: Arc<ConfigurationStore>,
    metering: Arc<Metering>,
    context: UsageContext,
}

impl Evaluator {
    pub fn new(
        store: Arc<ConfigurationStore>,
        metering: Arc<Metering>,
        context: UsageContext,
    ) -> Self {
        Self {
            store,
            metering,
            context,
        }
    }

    pub fn evaluate_feature(
        &self,
        feature: &Feature,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> EvalResult {
        let res = eval_feature(&self.store.snapshot(), feature, entity_id, attributes);
        self.metering.record(
            &self.context,
            UsageSubject::Feature(feature.feature_id.clone()),
            entity_id,
            res.segment_id.as_deref(),
        );
        res
    }

    pub fn evaluate_property(
        &self,
        property: &Property,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> EvalResult {
        let res = eval_property(&self.store.snapshot(), property, attributes);
        self.metering.record(
            &self.context,
            UsageSubject::Property(property.property_id.clone()),
            entity_id,
            res.segment_id.as_deref(),
        );
        res
    }
}
