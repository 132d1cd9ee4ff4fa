use std::{collections::BTreeMap, collections::HashMap, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{event, Level};

pub const REGION_US_SOUTH: &str = "us-south";
pub const REGION_EU_GB: &str = "eu-gb";
pub const REGION_AU_SYD: &str = "au-syd";

/// Attribute name to value map describing the entity a value is evaluated for.
pub type EntityAttributes = HashMap<String, Value>;

/// A flag, property or attribute value.
///
/// Numbers keep their JSON representation so `81` stays `81` when compared as
/// a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Numeric(serde_json::Number),
    String(String),
    Document(serde_json::Value),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Numeric(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn conforms_to(&self, value_type: ConfigurationType) -> bool {
        matches!(
            (value_type, self),
            (ConfigurationType::Boolean, Value::Boolean(_))
                | (ConfigurationType::Numeric, Value::Numeric(_))
                | (ConfigurationType::String, Value::String(_))
                | (ConfigurationType::String, Value::Document(_))
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Numeric(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::Document(d) => write!(f, "{}", d),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => Value::Numeric(n),
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Document(other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Numeric(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Value::Numeric)
            .unwrap_or(Value::Document(serde_json::Value::Null))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfigurationType {
    Boolean,
    Numeric,
    String,
}

/// Payload format of a STRING flag or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueFormat {
    Text,
    Json,
    Yaml,
}

// The service sends `"format": ""` for non-string types.
fn deserialize_format<'de, D>(deserializer: D) -> Result<Option<ValueFormat>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => ValueFormat::deserialize(serde::de::value::StrDeserializer::<D::Error>::new(s))
            .map(Some),
    }
}

fn resolve_format(value_type: ConfigurationType, format: Option<ValueFormat>) -> Option<ValueFormat> {
    match (value_type, format) {
        (ConfigurationType::String, None) => Some(ValueFormat::Text),
        (_, f) => f,
    }
}

/// Value of a targeting rule, either a literal or the owner's default.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "Value", into = "Value")]
pub enum RuleValue {
    Default,
    Literal(Value),
}

const DEFAULT_SENTINEL: &str = "$default";

impl From<Value> for RuleValue {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) if s == DEFAULT_SENTINEL => RuleValue::Default,
            other => RuleValue::Literal(other),
        }
    }
}

impl From<RuleValue> for Value {
    fn from(v: RuleValue) -> Self {
        match v {
            RuleValue::Default => Value::String(DEFAULT_SENTINEL.to_string()),
            RuleValue::Literal(v) => v,
        }
    }
}

/// Rollout percentage of a targeting rule, either explicit or inherited from the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum RolloutPercentage {
    Inherit,
    Percent(u32),
}

impl TryFrom<serde_json::Value> for RolloutPercentage {
    type Error = String;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        match &v {
            serde_json::Value::String(s) if s == DEFAULT_SENTINEL => Ok(RolloutPercentage::Inherit),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(p) if p <= 100 => Ok(RolloutPercentage::Percent(p as u32)),
                _ => Err(format!("rollout percentage out of range: {}", n)),
            },
            _ => Err(format!("invalid rollout percentage: {}", v)),
        }
    }
}

impl From<RolloutPercentage> for serde_json::Value {
    fn from(r: RolloutPercentage) -> Self {
        match r {
            RolloutPercentage::Inherit => serde_json::Value::String(DEFAULT_SENTINEL.to_string()),
            RolloutPercentage::Percent(p) => serde_json::Value::from(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleGroup {
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetingRule {
    pub order: u32,
    pub value: RuleValue,
    #[serde(default)]
    pub rollout_percentage: Option<RolloutPercentage>,
    pub rules: Vec<RuleGroup>,
}

/// Targeting rules keyed by their `order`, evaluated in ascending order.
pub type TargetingRules = BTreeMap<u32, TargetingRule>;

// Rules are parsed one by one: a malformed rule is dropped, and a rule with an
// `order` already seen replaces the earlier one.
fn parse_rules<'de, D>(deserializer: D, ignore_rollout: bool) -> Result<TargetingRules, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    let mut rules = TargetingRules::new();
    for mut r in raw.unwrap_or_default() {
        if ignore_rollout {
            if let Some(fields) = r.as_object_mut() {
                fields.remove("rollout_percentage");
            }
        }
        match serde_json::from_value::<TargetingRule>(r) {
            Ok(rule) => {
                rules.insert(rule.order, rule);
            }
            Err(e) => event!(Level::WARN, "Skipping invalid segment rule: {}", e),
        }
    }
    Ok(rules)
}

fn deserialize_rules<'de, D>(deserializer: D) -> Result<TargetingRules, D::Error>
where
    D: Deserializer<'de>,
{
    parse_rules(deserializer, false)
}

// Properties are never rolled out, so their rules' percentages are not read.
fn deserialize_property_rules<'de, D>(deserializer: D) -> Result<TargetingRules, D::Error>
where
    D: Deserializer<'de>,
{
    parse_rules(deserializer, true)
}

fn serialize_rules<S>(rules: &TargetingRules, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(rules.values())
}

fn default_rollout_percentage() -> u32 {
    100
}

/// Feature flag definition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Feature {
    pub name: String,
    pub feature_id: String,
    pub r#type: ConfigurationType,
    #[serde(default, deserialize_with = "deserialize_format")]
    pub format: Option<ValueFormat>,
    pub enabled: bool,
    pub enabled_value: Value,
    pub disabled_value: Value,
    #[serde(default = "default_rollout_percentage")]
    pub rollout_percentage: u32,
    #[serde(
        default,
        deserialize_with = "deserialize_rules",
        serialize_with = "serialize_rules"
    )]
    pub segment_rules: TargetingRules,
}

impl Feature {
    /// Format of the value; STRING flags without one are TEXT.
    pub fn format(&self) -> Option<ValueFormat> {
        resolve_format(self.r#type, self.format)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.rollout_percentage > 100 {
            return Err(format!(
                "feature {}: rollout percentage {} out of range",
                self.feature_id, self.rollout_percentage
            ));
        }
        if !self.enabled_value.conforms_to(self.r#type)
            || !self.disabled_value.conforms_to(self.r#type)
        {
            return Err(format!(
                "feature {}: values do not match type {:?}",
                self.feature_id, self.r#type
            ));
        }
        Ok(())
    }
}

/// Property definition. Properties carry a single default and are never rolled out.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Property {
    pub name: String,
    pub property_id: String,
    pub r#type: ConfigurationType,
    #[serde(default, deserialize_with = "deserialize_format")]
    pub format: Option<ValueFormat>,
    pub value: Value,
    #[serde(
        default,
        deserialize_with = "deserialize_property_rules",
        serialize_with = "serialize_rules"
    )]
    pub segment_rules: TargetingRules,
}

impl Property {
    pub fn format(&self) -> Option<ValueFormat> {
        resolve_format(self.r#type, self.format)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.value.conforms_to(self.r#type) {
            return Err(format!(
                "property {}: value does not match type {:?}",
                self.property_id, self.r#type
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    EndsWith,
    StartsWith,
    Contains,
    Is,
    GreaterThan,
    LesserThan,
    GreaterThanEquals,
    LesserThanEquals,
    #[serde(other)]
    Unknown,
}

/// A single attribute test inside a segment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Condition {
    pub attribute_name: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Segment {
    pub name: String,
    pub segment_id: String,
    pub rules: Vec<Condition>,
}

/// Options used when creating the client.
///
/// The metering interval defaults to 10 minutes and the usage batch limit to 25.
/// Without a `config_sync_interval` configurations are only refreshed through
/// `Client::fetch_configurations`.
#[derive(Debug, Clone)]
pub struct AppConfigOptions {
    pub region: String,
    pub guid: String,
    pub api_key: String,
    pub collection_id: String,
    pub environment_id: String,
    pub override_server_host: Option<String>,
    pub persistence_dir: Option<PathBuf>,
    pub config_sync_interval: Option<Duration>,
    pub metering_interval: Option<Duration>,
    pub usage_batch_limit: Option<usize>,
}

impl AppConfigOptions {
    pub fn new(
        region: String,
        guid: String,
        api_key: String,
        collection_id: String,
        environment_id: String,
    ) -> Self {
        Self {
            region,
            guid,
            api_key,
            collection_id,
            environment_id,
            override_server_host: None,
            persistence_dir: None,
            config_sync_interval: None,
            metering_interval: None,
            usage_batch_limit: None,
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        let required = [
            (&self.region, "Provide a valid region."),
            (&self.guid, "Provide a valid guid."),
            (&self.api_key, "Provide a valid apikey."),
            (&self.collection_id, "Provide a valid collectionId."),
            (&self.environment_id, "Provide a valid environmentId."),
        ];
        for (value, message) in required {
            if value.trim().is_empty() {
                event!(Level::ERROR, "Error initialising App Configuration: {}", message);
                anyhow::bail!("app configuration: {}", message);
            }
        }
        let intervals = [self.config_sync_interval, self.metering_interval];
        if intervals.iter().flatten().any(|d| d.is_zero()) {
            event!(Level::ERROR, "Error initialising App Configuration: intervals must be positive");
            anyhow::bail!("app configuration: intervals must be positive");
        }
        Ok(())
    }
}
