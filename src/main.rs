use std::{collections::HashMap, env, time::Duration};

use anyhow::{anyhow, Result};
use app_configuration::{
    models::{AppConfigOptions, Value, REGION_US_SOUTH},
    Client,
};

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow!("{} is not set", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let options = AppConfigOptions {
        config_sync_interval: Some(Duration::from_secs(30)),
        ..AppConfigOptions::new(
            env::var("APP_CONFIG_REGION").unwrap_or_else(|_| REGION_US_SOUTH.to_string()),
            required("APP_CONFIG_GUID")?,
            required("APP_CONFIG_APIKEY")?,
            required("APP_CONFIG_COLLECTION")?,
            required("APP_CONFIG_ENVIRONMENT")?,
        )
    };
    let client = Client::new(options).await?;
    client.on_configuration_update(|| println!("configurations updated"));

    let attributes = HashMap::from([("email".to_string(), Value::from("tester@dev.com"))]);
    for (id, feature) in client.get_features() {
        println!(
            "feature {}: {:?}",
            id,
            feature.get_current_value("pqvr", Some(&attributes))
        );
    }
    for (id, property) in client.get_properties() {
        println!(
            "property {}: {:?}",
            id,
            property.get_current_value("pqvr", Some(&attributes))
        );
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    client.shutdown().await
}
