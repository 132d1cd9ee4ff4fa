use anyhow::{anyhow, Result};
use reqwest::{
    header,
    header::{HeaderMap, HeaderValue},
    Client, ClientBuilder, Response,
};
use tokio::time::Duration;
use tracing::{event, Level};

use crate::metering::UsageBatch;

const DEFAULT_BASE_DOMAIN: &str = ".apprapp.cloud.ibm.com";
const SERVICE_PATH: &str = "/apprapp";
const CONFIG_PATH: &str = "/feature/v1/instances/";
const EVENTS_PATH: &str = "/events/v1/instances/";

/// The environment variable to change the default timeout for requests.
const APP_CONFIG_TIMEOUT_MS: &str = "APP_CONFIG_TIMEOUT_MS";

fn create_http_connection_client(api_key: &str) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| anyhow!("invalid api key: {}", e))?,
    );
    let timeout = std::env::var(APP_CONFIG_TIMEOUT_MS)
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u64>()
        .unwrap_or(3000);
    ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(60)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .timeout(Duration::from_millis(timeout))
        .default_headers(headers)
        .build()
        .map_err(|e| anyhow!("failed to build http client: {}", e))
}

fn check_status(response: reqwest::Result<Response>) -> Result<Response> {
    match response {
        Ok(result) if result.status().is_success() => Ok(result),
        Ok(result) => Err(anyhow!("app configuration error: {}", result.status())),
        Err(err) => Err(anyhow!("failed to send request: {}", err)),
    }
}

/// Talks to the App Configuration service: configuration download and usage upload.
#[derive(Clone)]
pub struct AppConfigHttpClient {
    base_url: String,
    http_client: Client,
}

impl AppConfigHttpClient {
    /// `override_server_host` replaces `https://{region}.apprapp.cloud.ibm.com`.
    pub fn new(api_key: &str, region: &str, override_server_host: Option<String>) -> Result<Self> {
        let base_url = override_server_host
            .map(|host| host.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}{}", region, DEFAULT_BASE_DOMAIN));
        let http_client = create_http_connection_client(api_key)?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn config_url(&self, guid: &str, collection_id: &str, environment_id: &str) -> String {
        format!(
            "{}{}{}{}/collections/{}/config?environment_id={}",
            self.base_url, SERVICE_PATH, CONFIG_PATH, guid, collection_id, environment_id
        )
    }

    pub fn usage_url(&self, guid: &str) -> String {
        format!(
            "{}{}{}{}/usage",
            self.base_url, SERVICE_PATH, EVENTS_PATH, guid
        )
    }

    /// Downloads the raw configuration document. Any non 2xx status is an error.
    pub async fn fetch_config(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http_client.get(url).send().await;
        let res = check_status(response)?;
        event!(
            Level::DEBUG,
            "Fetched configurations with status {}",
            res.status()
        );
        let body = res
            .bytes()
            .await
            .map_err(|e| anyhow!("error reading configuration response: {}", e))?;
        Ok(body.to_vec())
    }

    /// Posts one usage batch for an instance. Not retried.
    pub async fn post_usage(&self, guid: &str, batch: &UsageBatch) -> Result<()> {
        let url = self.usage_url(guid);
        let response = self.http_client.post(url).json(batch).send().await;
        check_status(response)?;
        Ok(())
    }
}
