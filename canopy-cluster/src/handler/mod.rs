//! Backend handlers executed when a request selects this cluster
//!
//! The destination tag of a control message names the handler. Handler
//! failures never unwind into dispatch: they are reported upward as a
//! failure status on the response.

mod http;
mod rest;

pub use http::HttpProxyHandler;
pub use rest::RestApiHandler;

use crate::error::Result;
use crate::types::{BackendRequest, BackendResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Methods a backend request may carry
pub const ALLOWED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// A backend that can execute one request
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: BackendRequest) -> Result<BackendResponse>;

    /// Short label for logs and metrics
    fn name(&self) -> &'static str;
}

/// Handlers keyed by destination tag
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `tag`, replacing any previous one
    pub fn register(&mut self, tag: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(tag.into(), handler);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("tags", &self.tags()).finish()
    }
}

/// Join a base URL and a request path with exactly one slash
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
