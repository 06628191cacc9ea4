//! Gateway HTTP client
//!
//! All inter-service traffic goes through one gateway base URL; a hop is
//! addressed by its canonical path (`/stock/subtract/<id>/<qty>`), with the
//! correlation id appended as the `log_id` query parameter so the callee
//! joins the caller's log chain instead of opening its own.
//!
//! Every hop carries a per-call timeout. Transport failures (unreachable
//! peer, timeout) surface as `ServiceError::Network`; the saga treats them
//! exactly like a FAILURE reply and runs its compensations. Business
//! failures arrive as non-2xx `HopReply` values, with the peer's JSON body
//! preserved for fields like `price`.

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::ServiceError;

/// A peer's reply to one hop: HTTP status plus decoded JSON body (if any).
#[derive(Debug, Clone)]
pub struct HopReply {
    pub status: u16,
    pub body: Option<Value>,
}

impl HopReply {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Pull a required unsigned integer field out of the reply body.
    pub fn field_u64(&self, field: &str) -> Option<u64> {
        self.body.as_ref()?.get(field)?.as_u64()
    }
}

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Absolute URL for a canonical service path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Append the correlation id to a path as the `log_id` parameter.
    pub fn url_with_log_id(&self, path: &str, log_id: Uuid) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{}{}log_id={}", self.base, path, separator, log_id)
    }

    /// Fetch a fresh log key from the id service.
    pub async fn mint_key(&self) -> Result<String, ServiceError> {
        let response = self.http.get(self.url("/ids/create")).send().await?;
        if !response.status().is_success() {
            return Err(ServiceError::Network(format!(
                "id service returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    pub async fn get(&self, url: &str) -> Result<HopReply, ServiceError> {
        let response = self.http.get(url).send().await?;
        Self::into_reply(response).await
    }

    pub async fn post(&self, url: &str) -> Result<HopReply, ServiceError> {
        let response = self.http.post(url).send().await?;
        Self::into_reply(response).await
    }

    async fn into_reply(response: reqwest::Response) -> Result<HopReply, ServiceError> {
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.ok();
        Ok(HopReply { status, body })
    }
}
