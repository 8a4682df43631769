//! Verbatim HTTP forwarding to a fixed upstream

use super::{join_url, Handler, ALLOWED_METHODS};
use crate::error::{ClusterError, Result};
use crate::types::{now_millis, BackendRequest, BackendResponse};
use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;
use tracing::debug;

/// Forwards each request unchanged to `upstream` + path
pub struct HttpProxyHandler {
    client: reqwest::Client,
    upstream: String,
}

impl HttpProxyHandler {
    pub fn new(upstream: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            upstream: upstream.into(),
        })
    }
}

#[async_trait]
impl Handler for HttpProxyHandler {
    async fn handle(&self, request: BackendRequest) -> Result<BackendResponse> {
        let method = request.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Ok(BackendResponse {
                code: 405,
                body: format!("method {} not allowed", request.method),
                timestamp: now_millis(),
            });
        }
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ClusterError::Handler(format!("invalid method: {}", e)))?;

        let url = join_url(&self.upstream, &request.path);
        debug!(method = %method, url = %url, "Proxying backend request");

        let mut builder = self.client.request(method, &url);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }
        let response = builder.send().await?;
        let code = response.status().as_u16();
        let body = response.text().await?;

        Ok(BackendResponse {
            code,
            body,
            timestamp: now_millis(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
