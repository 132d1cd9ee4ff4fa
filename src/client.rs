use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use anyhow::{anyhow, Result};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tracing::{event, Level};

use crate::{
    evaluator::{
        models::{ConfigData, EvalResult},
        Evaluator,
    },
    http::AppConfigHttpClient,
    metering::{Metering, UsageContext},
    models::{
        AppConfigOptions, ConfigurationType, EntityAttributes, Feature, Property, TargetingRules,
        Value, ValueFormat,
    },
    persistence::{ConfigPersistence, FileStore, MemoryStore},
    store::ConfigurationStore,
};

/// Result of evaluating a feature or property for one entity.
pub type Evaluation = EvalResult;

type UpdateListener = Arc<dyn Fn() + Send + Sync>;

const MISSING_ENTITY_ID: &str = "An `entityId` value should be passed for this method.";

/// App Configuration client.
///
/// Holds the last fetched configuration in memory, evaluates features and
/// properties locally and reports usage in the background.
pub struct Client {
    http_client: AppConfigHttpClient,
    config_url: String,
    store: Arc<ConfigurationStore>,
    metering: Arc<Metering>,
    evaluator: Arc<Evaluator>,
    update_listener: Mutex<Option<UpdateListener>>,
    metering_task: Mutex<Option<JoinHandle<()>>>,
    refresh_stop: watch::Sender<bool>,
}

impl Client {
    /// Creates the client and loads the configuration.
    ///
    /// Invalid options are an error. A failed first fetch is not: the client
    /// then serves whatever was persisted earlier.
    pub async fn new(options: AppConfigOptions) -> Result<Arc<Self>> {
        options.validate()?;

        let http_client = AppConfigHttpClient::new(
            &options.api_key,
            &options.region,
            options.override_server_host.clone(),
        )?;
        let config_url = http_client.config_url(
            &options.guid,
            &options.collection_id,
            &options.environment_id,
        );

        let persistence: Arc<dyn ConfigPersistence> = match &options.persistence_dir {
            Some(dir) => Arc::new(FileStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };
        let store = Arc::new(ConfigurationStore::new(persistence));

        let metering = Arc::new(Metering::new(
            http_client.clone(),
            options.metering_interval,
            options.usage_batch_limit,
        ));
        let metering_task = metering.start();

        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            metering.clone(),
            UsageContext {
                instance_id: options.guid.clone(),
                environment_id: options.environment_id.clone(),
                collection_id: options.collection_id.clone(),
            },
        ));

        let (refresh_stop, refresh_stop_rx) = watch::channel(false);
        let s = Arc::new(Self {
            http_client,
            config_url,
            store,
            metering,
            evaluator,
            update_listener: Mutex::new(None),
            metering_task: Mutex::new(Some(metering_task)),
            refresh_stop,
        });

        if let Err(e) = s.fetch_configurations().await {
            event!(Level::ERROR, "Failed to fetch configurations: {}", e);
        }

        if let Some(interval) = options.config_sync_interval {
            tokio::spawn(Self::poll_for_changes(
                Arc::downgrade(&s),
                interval,
                refresh_stop_rx,
            ));
        }

        Ok(s)
    }

    /// Downloads the configuration, persists it and swaps it in.
    ///
    /// On failure the previously loaded configuration stays in use.
    pub async fn fetch_configurations(&self) -> Result<()> {
        if self.store.snapshot().features.is_empty() {
            self.store.load_from_persistence();
        }

        event!(Level::DEBUG, "Fetching configurations");
        let body = self.http_client.fetch_config(&self.config_url).await?;
        let data = ConfigData::from_slice(&body)?;

        if !self.store.persistence().store(&body) {
            event!(Level::ERROR, "Failed to persist configurations");
        }
        self.store.refresh_configs(data);
        event!(Level::DEBUG, "Configurations updated");

        let listener = self
            .update_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener();
        }
        Ok(())
    }

    /// Registers the callback run after each successful configuration update.
    /// Replaces any previous one.
    pub fn on_configuration_update<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut current = self
            .update_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::new(listener));
    }

    pub fn get_feature(&self, feature_id: &str) -> Option<FeatureHandle> {
        self.store
            .get_feature(feature_id)
            .map(|feature| FeatureHandle::new(feature, self.evaluator.clone()))
    }

    pub fn get_property(&self, property_id: &str) -> Option<PropertyHandle> {
        self.store
            .get_property(property_id)
            .map(|property| PropertyHandle::new(property, self.evaluator.clone()))
    }

    pub fn get_features(&self) -> HashMap<String, FeatureHandle> {
        self.store
            .get_features()
            .into_iter()
            .map(|(id, feature)| (id, FeatureHandle::new(feature, self.evaluator.clone())))
            .collect()
    }

    pub fn get_properties(&self) -> HashMap<String, PropertyHandle> {
        self.store
            .get_properties()
            .into_iter()
            .map(|(id, property)| (id, PropertyHandle::new(property, self.evaluator.clone())))
            .collect()
    }

    /// Stops the background tasks and sends the usage counted so far.
    pub async fn shutdown(&self) -> Result<()> {
        self.refresh_stop.send_replace(true);
        self.metering.stop();
        let task = self
            .metering_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| anyhow!("usage flush task failed: {}", e))?;
        }
        Ok(())
    }
}

// Private methods
impl Client {
    // Holds a weak reference so dropping the last client handle ends the loop.
    async fn poll_for_changes(
        client: Weak<Self>,
        every: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval_at(Instant::now() + every, every);
        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let Some(client) = client.upgrade() else {
                        break;
                    };
                    if let Err(e) = client.fetch_configurations().await {
                        event!(Level::ERROR, "Failed to fetch configurations: {}", e);
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        event!(Level::DEBUG, "Stopped configuration refresh");
    }
}

impl Drop for Client {
    // The metering task still runs its final flush after this.
    fn drop(&mut self) {
        self.refresh_stop.send_replace(true);
        self.metering.stop();
    }
}

/// A feature flag bound to the client that evaluates it.
#[derive(Clone)]
pub struct FeatureHandle {
    feature: Arc<Feature>,
    evaluator: Arc<Evaluator>,
}

impl FeatureHandle {
    fn new(feature: Arc<Feature>, evaluator: Arc<Evaluator>) -> Self {
        Self { feature, evaluator }
    }

    pub fn name(&self) -> &str {
        &self.feature.name
    }

    pub fn feature_id(&self) -> &str {
        &self.feature.feature_id
    }

    pub fn feature_type(&self) -> ConfigurationType {
        self.feature.r#type
    }

    pub fn format(&self) -> Option<ValueFormat> {
        self.feature.format()
    }

    pub fn is_enabled(&self) -> bool {
        self.feature.enabled
    }

    pub fn enabled_value(&self) -> &Value {
        &self.feature.enabled_value
    }

    pub fn disabled_value(&self) -> &Value {
        &self.feature.disabled_value
    }

    pub fn rollout_percentage(&self) -> u32 {
        self.feature.rollout_percentage
    }

    pub fn segment_rules(&self) -> &TargetingRules {
        &self.feature.segment_rules
    }

    /// Evaluates the flag for an entity and counts the evaluation.
    /// Returns `None` for an empty entity id.
    pub fn evaluate(
        &self,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> Option<Evaluation> {
        if entity_id.is_empty() {
            event!(
                Level::ERROR,
                "Feature {}: {}",
                self.feature.feature_id,
                MISSING_ENTITY_ID
            );
            return None;
        }
        Some(
            self.evaluator
                .evaluate_feature(&self.feature, entity_id, attributes),
        )
    }

    pub fn get_current_value(
        &self,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> Option<Value> {
        self.evaluate(entity_id, attributes).map(|res| res.value)
    }
}

/// A property bound to the client that evaluates it.
#[derive(Clone)]
pub struct PropertyHandle {
    property: Arc<Property>,
    evaluator: Arc<Evaluator>,
}

impl PropertyHandle {
    fn new(property: Arc<Property>, evaluator: Arc<Evaluator>) -> Self {
        Self {
            property,
            evaluator,
        }
    }

    pub fn name(&self) -> &str {
        &self.property.name
    }

    pub fn property_id(&self) -> &str {
        &self.property.property_id
    }

    pub fn property_type(&self) -> ConfigurationType {
        self.property.r#type
    }

    pub fn format(&self) -> Option<ValueFormat> {
        self.property.format()
    }

    pub fn value(&self) -> &Value {
        &self.property.value
    }

    pub fn segment_rules(&self) -> &TargetingRules {
        &self.property.segment_rules
    }

    pub fn evaluate(
        &self,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> Option<Evaluation> {
        if entity_id.is_empty() {
            event!(
                Level::ERROR,
                "Property {}: {}",
                self.property.property_id,
                MISSING_ENTITY_ID
            );
            return None;
        }
        Some(
            self.evaluator
                .evaluate_property(&self.property, entity_id, attributes),
        )
    }

    pub fn get_current_value(
        &self,
        entity_id: &str,
        attributes: Option<&EntityAttributes>,
    ) -> Option<Value> {
        self.evaluate(entity_id, attributes).map(|res| res.value)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn handles() -> (Arc<Metering>, FeatureHandle, PropertyHandle) {
        let store = Arc::new(ConfigurationStore::new(Arc::new(MemoryStore::new())));
        let http_client = AppConfigHttpClient::new("apikey", "us-south", None).unwrap();
        let metering = Arc::new(Metering::new(http_client, None, None));
        let evaluator = Arc::new(Evaluator::new(
            store,
            metering.clone(),
            UsageContext {
                instance_id: "guid".to_string(),
                environment_id: "dev".to_string(),
                collection_id: "collection".to_string(),
            },
        ));
        let feature: Feature = serde_json::from_value(json!({
            "name": "Default feature",
            "feature_id": "defaultfeature",
            "type": "STRING",
            "enabled": true,
            "enabled_value": "Welcome",
            "disabled_value": "Bye"
        }))
        .unwrap();
        let property: Property = serde_json::from_value(json!({
            "name": "Numeric property",
            "property_id": "numericproperty",
            "type": "NUMERIC",
            "value": 81
        }))
        .unwrap();
        (
            metering,
            FeatureHandle::new(Arc::new(feature), evaluator.clone()),
            PropertyHandle::new(Arc::new(property), evaluator),
        )
    }

    #[test]
    fn test_empty_entity_id_is_not_evaluated() {
        let (metering, feature, property) = handles();
        assert_eq!(feature.get_current_value("", None), None);
        assert_eq!(property.get_current_value("", None), None);
        assert_eq!(metering.pending(), 0);
    }

    #[test]
    fn test_handles_evaluate_and_count() {
        let (metering, feature, property) = handles();
        assert_eq!(feature.feature_id(), "defaultfeature");
        assert_eq!(feature.format(), Some(ValueFormat::Text));
        assert_eq!(
            feature.get_current_value("pqvr", None),
            Some(Value::from("Welcome"))
        );
        assert_eq!(
            property.get_current_value("pqvr", None).map(|v| v.to_string()),
            Some("81".to_string())
        );
        let evaluation = feature.evaluate("pqvr", None).unwrap();
        assert!(evaluation.enabled);
        assert_eq!(evaluation.segment_id, None);
        assert_eq!(metering.pending(), 2);
    }
}
