//! Authenticated JSON calls against a structured API

use super::{join_url, Handler, ALLOWED_METHODS};
use crate::error::{ClusterError, Result};
use crate::types::{now_millis, BackendRequest, BackendResponse};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;

pub struct RestApiHandler {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestApiHandler {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Config(format!("Failed to create REST client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl Handler for RestApiHandler {
    async fn handle(&self, request: BackendRequest) -> Result<BackendResponse> {
        let method = request.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(ClusterError::Handler(format!("unsupported method {}", request.method)));
        }
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ClusterError::Handler(format!("invalid method: {}", e)))?;

        let url = join_url(&self.base_url, &request.path);
        let mut builder = self.client.request(method.clone(), &url).header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if !request.body.is_empty() {
            let payload: serde_json::Value = serde_json::from_str(&request.body)
                .map_err(|e| ClusterError::Handler(format!("request body is not JSON: {}", e)))?;
            builder = builder.header(CONTENT_TYPE, "application/json").json(&payload);
        }

        debug!(method = %method, url = %url, "Calling REST backend");
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
        "rest"
    }
}
