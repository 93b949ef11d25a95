use crate::cache::RemoteBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Remote cache tier served over HTTP.
///
/// Values live at `{base_url}/{key}`: `GET` returns the JSON value or
/// 404, `PUT` stores the JSON request body.
pub struct HttpRemoteBackend {
    base_url: Url,
    api_key: Option<String>,
    max_retries: u32,
    http: reqwest::Client,
}

impl HttpRemoteBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .context(format!("Invalid remote cache URL: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("remote cache URL cannot be a base: {base_url}");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url,
            api_key: None,
            max_retries: 3,
            http,
        })
    }

    /// Send `Authorization: Bearer <key>` with every call.
    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn key_url(&self, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(key);
        }
        url
    }

    /// Send a request, retrying with exponential backoff on transient
    /// failures (5xx, network errors).
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let mut request = build();
            if let Some(ref api_key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {api_key}"));
            }

            match request.send().await {
                Ok(resp) if resp.status().is_server_error() && attempt < self.max_retries => {
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(
                        status = %resp.status(),
                        attempt = attempt + 1,
                        "remote cache server error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.max_retries => {
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        "remote cache network error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).context(format!(
                        "remote cache unreachable after {} retries",
                        self.max_retries
                    ))
                }
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let url = self.key_url(key);
        let resp = self.send_with_retry(|| self.http.get(url.clone())).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let value = resp
                    .json::<Value>()
                    .await
                    .context("failed to decode remote cache value")?;
                Ok(Some(value))
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("remote cache GET failed: {status} - {body}");
            }
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let url = self.key_url(key);
        let resp = self
            .send_with_retry(|| self.http.put(url.clone()).json(value))
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("remote cache PUT failed: {status} - {body}");
        }
        Ok(())
    }
}
