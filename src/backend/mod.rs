pub mod types;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;

use self::types::{
    AcceptedResponse, Connection, ConnectionsPayload, MetricsPayload, MetricsSnapshot,
};

/// Cap on how much of a collector response body is read.
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// HTTP client for the flow collector.
#[derive(Debug)]
pub struct Client {
    base_url: reqwest::Url,
    http: reqwest::Client,
    tenant_id: String,
    auth_token: String,
}

impl Client {
    /// Creates a client. The timeout applies per request. Fails on an
    /// unparseable base URL, which is fatal at startup.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tenant_id: &str,
        auth_token: &str,
    ) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .with_context(|| format!("parsing backend URL {base_url:?}"))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url,
            http,
            tenant_id: tenant_id.to_string(),
            auth_token: auth_token.trim().to_string(),
        })
    }

    /// Posts a batch of flow records to `/api/connections`.
    pub async fn post_connections(&self, batch: &[Connection]) -> Result<AcceptedResponse> {
        self.post_accepted(
            "/api/connections",
            &ConnectionsPayload { connections: batch },
            batch.len(),
        )
        .await
    }

    /// Posts a batch of metrics snapshots to `/api/metrics`.
    pub async fn post_metrics(&self, snapshots: &[MetricsSnapshot]) -> Result<AcceptedResponse> {
        self.post_accepted(
            "/api/metrics",
            &MetricsPayload { snapshots },
            snapshots.len(),
        )
        .await
    }

    /// POSTs a JSON payload and applies the collector's acceptance rules:
    /// only `202 Accepted` counts as success, and a success body that does
    /// not parse as an [`AcceptedResponse`] degrades to a synthesized one
    /// rather than failing the batch.
    async fn post_accepted<T: serde::Serialize>(
        &self,
        path: &str,
        payload: &T,
        count: usize,
    ) -> Result<AcceptedResponse> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("resolving endpoint {path}"))?;

        let mut request = self.http.post(endpoint).json(payload);
        if !self.auth_token.is_empty() {
            request = request.bearer_auth(&self.auth_token);
        }
        if !self.tenant_id.is_empty() {
            request = request.header("X-Tenant-ID", &self.tenant_id);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("posting to {path}"))?;

        let status = response.status();
        let body = read_limited(response, MAX_RESPONSE_BYTES).await;

        if status != StatusCode::ACCEPTED {
            bail!(
                "backend returned {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body),
            );
        }

        Ok(serde_json::from_slice(&body).unwrap_or(AcceptedResponse {
            received: count,
            status: "processing".to_string(),
        }))
    }
}

/// Reads at most `limit` bytes of a response body, discarding the rest.
async fn read_limited(mut response: reqwest::Response, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = limit - buf.len();
        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    buf
}
