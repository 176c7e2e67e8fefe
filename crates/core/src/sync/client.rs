//! HTTP access to a peer's replication endpoints.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::types::{SyncConf, V1Page, V2Page};
use super::SyncError;
use crate::config::redact_url_credentials;

/// The peer side of the replication protocol.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Base URL of the peer, used in logs and cursor paths.
    fn base_url(&self) -> &str;

    /// `GET /sync/conf`.
    async fn conf(&self) -> Result<SyncConf, SyncError>;

    /// `GET /sync/torrents?time=`.
    async fn torrents_v1(&self, time: i64) -> Result<V1Page, SyncError>;

    /// `GET /sync/fdb/torrents?time=[&start=][&spidr=true]`.
    async fn torrents_v2(
        &self,
        time: i64,
        start: Option<i64>,
        spidr: bool,
    ) -> Result<V2Page, SyncError>;
}

/// [`PeerClient`] over reqwest.
pub struct HttpPeerClient {
    client: Client,
    base_url: String,
}

impl HttpPeerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        debug!(url = %redact_url_credentials(url), "Fetching from peer");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else if e.is_connect() {
                SyncError::ConnectionFailed(e.to_string())
            } else {
                SyncError::Http(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Http(e.to_string())
            }
        })?;

        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Malformed(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn conf(&self) -> Result<SyncConf, SyncError> {
        self.get_json(&self.url("/sync/conf")).await
    }

    async fn torrents_v1(&self, time: i64) -> Result<V1Page, SyncError> {
        self.get_json(&self.url(&format!("/sync/torrents?time={}", time)))
            .await
    }

    async fn torrents_v2(
        &self,
        time: i64,
        start: Option<i64>,
        spidr: bool,
    ) -> Result<V2Page, SyncError> {
        self.get_json(&self.url(&v2_path(time, start, spidr))).await
    }
}

fn v2_path(time: i64, start: Option<i64>, spidr: bool) -> String {
    let mut path = format!("/sync/fdb/torrents?time={}", time);
    if let Some(start) = start {
        path.push_str(&format!("&start={}", start));
    }
    if spidr {
        path.push_str("&spidr=true");
    }
    path
}
