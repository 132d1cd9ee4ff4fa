use std::{collections::HashMap, sync::Arc};

use crossbeam::sync::ShardedLock;
use tracing::{event, Level};

use crate::{
    evaluator::models::ConfigData,
    models::{Feature, Property, Segment},
    persistence::ConfigPersistence,
};

/// One complete set of definitions. Never mutated once published.
#[derive(Debug, Default)]
pub struct Configurations {
    pub features: HashMap<String, Arc<Feature>>,
    pub properties: HashMap<String, Arc<Property>>,
    pub segments: HashMap<String, Segment>,
}

impl Configurations {
    /// Builds a snapshot from `data`, keeping entries of `previous` whose
    /// replacement failed to parse.
    fn build(data: ConfigData, previous: &Configurations) -> Self {
        let mut features: HashMap<String, Arc<Feature>> = data
            .features
            .into_iter()
            .map(|f| (f.feature_id.clone(), Arc::new(f)))
            .collect();
        for id in data.rejected_features {
            if let Some(f) = previous.features.get(&id) {
                features.entry(id).or_insert_with(|| f.clone());
            }
        }

        let mut properties: HashMap<String, Arc<Property>> = data
            .properties
            .into_iter()
            .map(|p| (p.property_id.clone(), Arc::new(p)))
            .collect();
        for id in data.rejected_properties {
            if let Some(p) = previous.properties.get(&id) {
                properties.entry(id).or_insert_with(|| p.clone());
            }
        }

        let mut segments: HashMap<String, Segment> = data
            .segments
            .into_iter()
            .map(|s| (s.segment_id.clone(), s))
            .collect();
        for id in data.rejected_segments {
            if let Some(s) = previous.segments.get(&id) {
                segments.entry(id).or_insert_with(|| s.clone());
            }
        }

        Self {
            features,
            properties,
            segments,
        }
    }
}

/// In-memory feature, property and segment tables.
///
/// The tables are swapped as a whole, so a reader holding a snapshot always
/// sees one consistent configuration.
pub struct ConfigurationStore {
    configurations: ShardedLock<Arc<Configurations>>,
    persistence: Arc<dyn ConfigPersistence>,
}

impl ConfigurationStore {
    pub fn new(persistence: Arc<dyn ConfigPersistence>) -> Self {
        Self {
            configurations: ShardedLock::new(Arc::new(Configurations::default())),
            persistence,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn ConfigPersistence> {
        &self.persistence
    }

    pub fn snapshot(&self) -> Arc<Configurations> {
        match self.configurations.read() {
            Ok(configurations) => configurations.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn refresh_configs(&self, data: ConfigData) {
        let mut configurations = match self.configurations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Configurations::build(data, &configurations);
        event!(
            Level::DEBUG,
            "Loaded {} features, {} properties, {} segments",
            next.features.len(),
            next.properties.len(),
            next.segments.len()
        );
        *configurations = Arc::new(next);
    }

    /// Reloads the tables from the persisted snapshot. Returns `false` when
    /// nothing usable was stored.
    pub fn load_from_persistence(&self) -> bool {
        let Some(raw) = self.persistence.load() else {
            return false;
        };
        match ConfigData::from_slice(&raw) {
            Ok(data) => {
                self.refresh_configs(data);
                true
            }
            Err(e) => {
                event!(Level::ERROR, "Failed to load stored configuration: {}", e);
                false
            }
        }
    }

    pub fn get_feature(&self, feature_id: &str) -> Option<Arc<Feature>> {
        if let Some(f) = self.snapshot().features.get(feature_id) {
            return Some(f.clone());
        }
        self.load_from_persistence();
        let feature = self.snapshot().features.get(feature_id).cloned();
        if feature.is_none() {
            event!(Level::ERROR, "Invalid featureId - {}", feature_id);
        }
        feature
    }

    pub fn get_property(&self, property_id: &str) -> Option<Arc<Property>> {
        if let Some(p) = self.snapshot().properties.get(property_id) {
            return Some(p.clone());
        }
        self.load_from_persistence();
        let property = self.snapshot().properties.get(property_id).cloned();
        if property.is_none() {
            event!(Level::ERROR, "Invalid propertyId - {}", property_id);
        }
        property
    }

    pub fn get_features(&self) -> HashMap<String, Arc<Feature>> {
        if self.snapshot().features.is_empty() {
            self.load_from_persistence();
        }
        self.snapshot().features.clone()
    }

    pub fn get_properties(&self) -> HashMap<String, Arc<Property>> {
        if self.snapshot().properties.is_empty() {
            self.load_from_persistence();
        }
        self.snapshot().properties.clone()
    }
}
