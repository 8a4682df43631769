//! Cluster-specific error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during federation operations
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("Duplicate cluster name: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Link closed: {0}")]
    Closed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Outbound queue full for {0}")]
    QueueFull(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record version conflict: {0}")]
    Conflict(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::DuplicateName(_) => "duplicate_name",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::NotConnected(_) => "not_connected",
            ClusterError::Connection(_) => "connection",
            ClusterError::Transport(_) => "transport",
            ClusterError::Closed(_) => "closed",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::QueueFull(_) => "queue_full",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::AlreadyExists(_) => "already_exists",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::Handler(_) => "handler",
            ClusterError::Config(_) => "config",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Whether the error means the link itself is unusable
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Transport(_) | ClusterError::Closed(_) | ClusterError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClusterError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ClusterError::Closed(err.to_string())
            }
            WsError::Http(response) => ClusterError::Connection(format!(
                "upgrade rejected with status {}",
                response.status()
            )),
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        ClusterError::Handler(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
