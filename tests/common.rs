use std::{path::Path, sync::Arc};

use app_configuration::{
    models::{AppConfigOptions, REGION_US_SOUTH},
    Client,
};
use httptest::{
    matchers::request,
    responders::{json_encoded, status_code},
    Expectation, Server,
};
use serde_json::json;

pub const CONFIG_PATH: &str = "/apprapp/feature/v1/instances/guid/collections/collection/config";
pub const USAGE_PATH: &str = "/apprapp/events/v1/instances/guid/usage";

pub fn configurations() -> serde_json::Value {
    json!({
        "features": [
            {
                "name": "Default feature",
                "feature_id": "defaultfeature",
                "type": "STRING",
                "format": "TEXT",
                "enabled": true,
                "enabled_value": "Welcome",
                "disabled_value": "Bye",
                "rollout_percentage": 100,
                "segment_rules": []
            },
            {
                "name": "Discount",
                "feature_id": "discount",
                "type": "NUMERIC",
                "format": "",
                "enabled": true,
                "enabled_value": 5,
                "disabled_value": 0,
                "rollout_percentage": 100,
                "segment_rules": [
                    {
                        "order": 1,
                        "value": 25,
                        "rollout_percentage": "$default",
                        "rules": [{"segments": ["betausers"]}]
                    },
                    {
                        "order": 2,
                        "value": "$default",
                        "rollout_percentage": 0,
                        "rules": [{"segments": ["devs"]}]
                    }
                ]
            },
            {
                "name": "Dark mode",
                "feature_id": "darkmode",
                "type": "BOOLEAN",
                "enabled": false,
                "enabled_value": true,
                "disabled_value": false,
                "rollout_percentage": 100,
                "segment_rules": [
                    {
                        "order": 1,
                        "value": true,
                        "rollout_percentage": 100,
                        "rules": [{"segments": ["devs"]}]
                    }
                ]
            }
        ],
        "properties": [
            {
                "name": "Numeric property",
                "property_id": "numericproperty",
                "type": "NUMERIC",
                "value": 81,
                "segment_rules": [
                    {
                        "order": 1,
                        "value": 30,
                        "rules": [{"segments": ["betausers"]}]
                    }
                ]
            },
            {
                "name": "Theme",
                "property_id": "theme",
                "type": "STRING",
                "format": "JSON",
                "value": {"color": "blue"},
                "segment_rules": []
            }
        ],
        "segments": [
            {
                "name": "Developers",
                "segment_id": "devs",
                "rules": [
                    {"attribute_name": "email", "operator": "endsWith", "values": ["dev.com"]}
                ]
            },
            {
                "name": "Beta users",
                "segment_id": "betausers",
                "rules": [
                    {"attribute_name": "email", "operator": "endsWith", "values": ["beta.com"]},
                    {"attribute_name": "age", "operator": "greaterThanEquals", "values": [18]}
                ]
            }
        ]
    })
}

pub fn expect_fetch_config(server: &Server) {
    server.expect(
        Expectation::matching(request::method_path("GET", CONFIG_PATH))
            .times(1..)
            .respond_with(json_encoded(configurations())),
    );
}

pub fn expect_usage(server: &Server) {
    server.expect(
        Expectation::matching(request::method_path("POST", USAGE_PATH))
            .times(..)
            .respond_with(status_code(202)),
    );
}

pub fn options(server: &Server) -> AppConfigOptions {
    AppConfigOptions {
        override_server_host: Some(format!("http://{}", server.addr())),
        ..AppConfigOptions::new(
            REGION_US_SOUTH.to_string(),
            "guid".to_string(),
            "apikey".to_string(),
            "collection".to_string(),
            "dev".to_string(),
        )
    }
}

pub fn options_with_dir(server: &Server, dir: &Path) -> AppConfigOptions {
    AppConfigOptions {
        persistence_dir: Some(dir.to_path_buf()),
        ..options(server)
    }
}

/// The server is returned so it outlives the client's requests.
pub async fn create_client() -> (Server, Arc<Client>) {
    let http_server = Server::run();
    expect_fetch_config(&http_server);
    expect_usage(&http_server);

    let client = Client::new(options(&http_server))
        .await
        .expect("should be able to create app configuration client");
    (http_server, client)
}
