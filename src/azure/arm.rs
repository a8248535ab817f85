//! Azure Resource Manager and Resource Graph over plain `reqwest`.

use std::{env, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::{AzureApi, Page};
use crate::provider::{ProviderError, ProviderErrorKind};

pub const MANAGEMENT_URL: &str = "https://management.azure.com/";
const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const RESOURCES_API_VERSION: &str = "2021-04-01";
const RESOURCE_GRAPH_API_VERSION: &str = "2022-10-01";

#[derive(Debug, Deserialize)]
struct ArmListResponse<T> {
    #[serde(default)]
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(rename = "subscriptionId")]
    subscription_id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceGraphResponse {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(rename = "$skipToken")]
    skip_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliToken {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Where the bearer token comes from.
enum ArmAuth {
    Static(String),
    /// Asked from the Azure CLI once, then reused.
    AzureCli(Mutex<Option<String>>),
}

impl ArmAuth {
    fn from_environment() -> Self {
        match env::var("AZURE_ACCESS_TOKEN") {
            Ok(token) if !token.trim().is_empty() => ArmAuth::Static(token),
            _ => ArmAuth::AzureCli(Mutex::new(None)),
        }
    }

    async fn token(&self) -> Result<String, ProviderError> {
        match self {
            ArmAuth::Static(token) => Ok(token.clone()),
            ArmAuth::AzureCli(cached) => {
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    return Ok(token.clone());
                }
                let token = azure_cli_token().await.map_err(|e| {
                    ProviderError::new(ProviderErrorKind::AccessDenied, format!("{e:#}"))
                })?;
                *cached = Some(token.clone());
                Ok(token)
            }
        }
    }
}

async fn azure_cli_token() -> Result<String> {
    debug!("Requesting an ARM token from the Azure CLI");
    let output = tokio::process::Command::new("az")
        .args(["account", "get-access-token", "--resource", MANAGEMENT_URL, "--output", "json"])
        .output()
        .await
        .context("Failed to run `az account get-access-token`; set AZURE_ACCESS_TOKEN instead")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("`az account get-access-token` failed: {}", stderr.trim());
    }
    let token: CliToken =
        serde_json::from_slice(&output.stdout).context("Unexpected `az account get-access-token` output")?;
    Ok(token.access_token)
}

/// [`AzureApi`] over the Azure Resource Manager REST API.
pub struct ArmClient {
    http: reqwest::Client,
    base_url: Url,
    auth: ArmAuth,
}

impl ArmClient {
    /// Client against the public cloud, authenticated from the environment.
    pub fn from_environment() -> Result<Self> {
        let base_url = Url::parse(MANAGEMENT_URL).context("invalid management URL")?;
        Self::build(base_url, ArmAuth::from_environment())
    }

    /// Client against `base_url` with a fixed bearer token.
    pub fn with_token(base_url: Url, token: impl Into<String>) -> Result<Self> {
        Self::build(base_url, ArmAuth::Static(token.into()))
    }

    fn build(base_url: Url, auth: ArmAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("cloudsweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url, auth })
    }

    fn url(&self, path: &str, api_version: &str) -> Result<Url, ProviderError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, format!("bad URL {path}: {e}")))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    /// `nextLink` values are absolute; keep them on our host so tests and
    /// sovereign clouds behave.
    fn follow(&self, link: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(link)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, format!("bad nextLink {link}: {e}")))?;
        let _ = url.set_scheme(self.base_url.scheme());
        let _ = url.set_host(self.base_url.host_str());
        let _ = url.set_port(self.base_url.port());
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let token = self.auth.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::from_message(e.to_string()))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| ProviderError::from_message(e.to_string()))?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).trim().to_string();
            let message = format!("ARM request failed ({status}): {body}");
            let kind = match status {
                reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                    ProviderErrorKind::AccessDenied
                }
                reqwest::StatusCode::NOT_FOUND => ProviderErrorKind::NotFound,
                reqwest::StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::Throttled,
                _ => return Err(ProviderError::from_message(message)),
            };
            return Err(ProviderError::new(kind, message));
        }
        serde_json::from_slice(&body)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, format!("ARM response was not JSON: {e}")))
    }

    async fn get(&self, url: Url) -> Result<Value, ProviderError> {
        self.send(self.http.get(url)).await
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value)
        .map_err(|e| ProviderError::new(ProviderErrorKind::Other, format!("unexpected ARM response: {e}")))
}

#[async_trait]
impl AzureApi for ArmClient {
    async fn list_subscriptions(&self) -> Result<Vec<String>, ProviderError> {
        let mut url = self.url("subscriptions", SUBSCRIPTIONS_API_VERSION)?;
        let mut subscriptions = Vec::new();
        loop {
            let page: ArmListResponse<Subscription> = decode(self.get(url).await?)?;
            subscriptions.extend(
                page.value
                    .into_iter()
                    .filter(|s| s.state.as_deref().map_or(true, |state| state == "Enabled"))
                    .map(|s| s.subscription_id),
            );
            match page.next_link {
                Some(link) if !link.is_empty() => url = self.follow(&link)?,
                _ => break,
            }
        }
        Ok(subscriptions)
    }

    async fn list_resources(&self, subscription: &str, next_link: Option<&str>) -> Result<Page<Value>, ProviderError> {
        let url = match next_link {
            Some(link) => self.follow(link)?,
            None => self.url(&format!("subscriptions/{subscription}/resources"), RESOURCES_API_VERSION)?,
        };
        let page: ArmListResponse<Value> = decode(self.get(url).await?)?;
        Ok(Page { items: page.value, next: page.next_link.filter(|l| !l.is_empty()) })
    }

    async fn resource_graph(
        &self,
        subscription: &str,
        query: &str,
        skip_token: Option<&str>,
    ) -> Result<Page<Value>, ProviderError> {
        let url = self.url("providers/Microsoft.ResourceGraph/resources", RESOURCE_GRAPH_API_VERSION)?;
        let mut options = json!({ "resultFormat": "objectArray" });
        if let Some(token) = skip_token {
            options["$skipToken"] = Value::String(token.to_string());
        }
        let body = json!({
            "subscriptions": [subscription],
            "query": query,
            "options": options,
        });
        let page: ResourceGraphResponse = decode(self.send(self.http.post(url).json(&body)).await?)?;
        Ok(Page { items: page.data, next: page.skip_token.filter(|t| !t.is_empty()) })
    }

    async fn get_resource(
        &self,
        resource_id: &str,
        api_version: &str,
        expand: Option<&str>,
    ) -> Result<Value, ProviderError> {
        let mut url = self.url(resource_id, api_version)?;
        if let Some(expand) = expand {
            url.query_pairs_mut().append_pair("$expand", expand);
        }
        self.get(url).await
    }
}
