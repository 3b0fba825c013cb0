//! HTTP client for a configurable-http-proxy style routing API
//!
//! - `POST   {api_url}/api/routes{prefix}` with `{"target": ..., <data>}`
//! - `DELETE {api_url}/api/routes{prefix}`
//! - `GET    {api_url}/api/routes` returning `{prefix: {"target": ..., <data>}}`

use crate::routes::{RouteData, RouteEntry, RouteTable};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Route table backed by the proxy's REST API
pub struct HttpRouteTable {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

impl HttpRouteTable {
    pub fn new(api_url: &str, auth_token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create proxy API client")?;

        info!(api_url, "Using proxy route API");

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn route_url(&self, prefix: &str) -> String {
        let encoded: Vec<String> = prefix
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/api/routes{}", self.api_url, encoded.join("/"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header("Authorization", format!("token {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl RouteTable for HttpRouteTable {
    async fn add_route(&self, prefix: &str, target: &str, data: &RouteData) -> Result<()> {
        let mut body = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("target".to_string(), Value::String(target.to_string()));

        let response = self
            .authorize(self.client.post(self.route_url(prefix)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to add route {}", prefix))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Proxy API error {} adding route {}: {}", status, prefix, text);
        }

        debug!(prefix, target, "Route added");
        Ok(())
    }

    async fn delete_route(&self, prefix: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.route_url(prefix)))
            .send()
            .await
            .with_context(|| format!("Failed to delete route {}", prefix))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(prefix, "Route already absent");
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Proxy API error {} deleting route {}: {}", status, prefix, text);
        }

        debug!(prefix, "Route deleted");
        Ok(())
    }

    async fn list_routes(&self) -> Result<HashMap<String, RouteEntry>> {
        let response = self
            .authorize(self.client.get(format!("{}/api/routes", self.api_url)))
            .send()
            .await
            .context("Failed to list routes")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Proxy API error {} listing routes: {}", status, text);
        }

        let body: HashMap<String, Value> = response.json().await.context("Invalid route list")?;
        Ok(body
            .into_iter()
            .filter_map(|(prefix, value)| parse_entry(value).map(|entry| (prefix, entry)))
            .collect())
    }
}

/// Routes without a string target are not ours to manage and are skipped
fn parse_entry(value: Value) -> Option<RouteEntry> {
    let target = value.get("target")?.as_str()?.to_string();
    let data = serde_json::from_value(value).unwrap_or_default();
    Some(RouteEntry { target, data })
}
