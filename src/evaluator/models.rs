use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{event, Level};

use crate::models::{Feature, Property, Segment, Value};

/// Outcome of a single feature or property evaluation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvalResult {
    pub value: Value,
    /// Whether the flag resolved to its enabled branch. Always true for properties.
    pub enabled: bool,
    /// Segment that decided the value, `None` when no segment did.
    pub segment_id: Option<String>,
}

impl EvalResult {
    pub fn default_value(value: Value, enabled: bool) -> Self {
        Self {
            value,
            enabled,
            segment_id: None,
        }
    }
}

/// A parsed configuration snapshot.
///
/// Entries that failed to parse are left out; their ids, when readable, are
/// kept so the store can hold on to a previously cached definition.
#[derive(Debug, Clone, Default)]
pub struct ConfigData {
    pub features: Vec<Feature>,
    pub properties: Vec<Property>,
    pub segments: Vec<Segment>,
    pub rejected_features: Vec<String>,
    pub rejected_properties: Vec<String>,
    pub rejected_segments: Vec<String>,
}

impl ConfigData {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| anyhow!("error decoding configuration: {}", e))?;
        let document = document
            .as_object()
            .ok_or_else(|| anyhow!("configuration is not a JSON object"))?;

        let mut data = ConfigData::default();
        let section = |name: &str| {
            document
                .get(name)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()
        };

        let (features, rejected) =
            parse_entries(section("features"), "feature_id", |f: &Feature| f.validate());
        data.features = features;
        data.rejected_features = rejected;

        let (properties, rejected) = parse_entries(
            section("properties"),
            "property_id",
            |p: &Property| p.validate(),
        );
        data.properties = properties;
        data.rejected_properties = rejected;

        let (segments, rejected) =
            parse_entries(section("segments"), "segment_id", |_: &Segment| Ok(()));
        data.segments = segments;
        data.rejected_segments = rejected;

        Ok(data)
    }
}

fn parse_entries<T, F>(
    entries: Vec<serde_json::Value>,
    id_field: &str,
    validate: F,
) -> (Vec<T>, Vec<String>)
where
    T: DeserializeOwned,
    F: Fn(&T) -> std::result::Result<(), String>,
{
    let mut parsed = vec![];
    let mut rejected = vec![];
    for entry in entries {
        let id = entry
            .get(id_field)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let res = serde_json::from_value::<T>(entry)
            .map_err(|e| e.to_string())
            .and_then(|t| validate(&t).map(|_| t));
        match res {
            Ok(t) => parsed.push(t),
            Err(e) => {
                event!(
                    Level::WARN,
                    "Skipping invalid entry {}: {}",
                    id.as_deref().unwrap_or("<unknown>"),
                    e
                );
                if let Some(id) = id {
                    rejected.push(id);
                }
            }
        }
    }
    (parsed, rejected)
}
