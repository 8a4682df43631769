//! Wire types for tunnel communication
//!
//! Every frame on a duplex link carries one JSON-encoded [`ControlMessage`].
//! The destination tag is the sole discriminator between registration,
//! routing gossip, subtree reports and backend dispatch.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Status code reported when a backend handler fails or is missing
pub const HANDLER_ERROR_CODE: u16 = 500;

/// Current wall clock in unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whether a message is travelling down as a request or up as a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    #[default]
    Request,
    Response,
}

/// Destination tag of a control message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    /// A child cluster joined somewhere below
    Register,
    /// A child cluster left somewhere below
    Deregister,
    /// Routing gossip sent one hop downward
    Router,
    /// Batch of reachable clusters reported upward by a (re)connected child
    Subtree,
    /// Apply the body against the backend handler registered under this tag
    Backend(String),
}

impl Destination {
    pub fn as_str(&self) -> &str {
        match self {
            Destination::Register => "register",
            Destination::Deregister => "deregister",
            Destination::Router => "router",
            Destination::Subtree => "subtree",
            Destination::Backend(tag) => tag,
        }
    }

    /// Whether the message is handled at the route layer rather than by a backend
    pub fn is_routing(&self) -> bool {
        !matches!(self, Destination::Backend(_))
    }
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        match s.as_str() {
            "register" => Destination::Register,
            "deregister" => Destination::Deregister,
            "router" => Destination::Router,
            "subtree" => Destination::Subtree,
            _ => Destination::Backend(s),
        }
    }
}

impl From<Destination> for String {
    fn from(d: Destination) -> Self {
        match d {
            Destination::Backend(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-responder outcome of a dispatched request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    /// Unix milliseconds at which the responder produced this status
    pub timestamp: i64,
    pub code: u16,
    #[serde(default)]
    pub body: String,
}

impl ResponseStatus {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            timestamp: now_millis(),
            code,
            body: body.into(),
        }
    }

    /// Synthesized failure status
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new(HANDLER_ERROR_CODE, reason)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// The single envelope used for every kind of tunnel traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub command: Command,
    pub id: String,
    #[serde(default)]
    pub selector: String,
    pub destination: Destination,
    /// Name of the cluster the message belongs to; responses are merged there
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, ResponseStatus>,
}

impl ControlMessage {
    /// Create a new request with a fresh id
    pub fn request(destination: Destination, selector: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            command: Command::Request,
            id: uuid::Uuid::new_v4().to_string(),
            selector: selector.into(),
            destination,
            parent: String::new(),
            body: body.into(),
            status: BTreeMap::new(),
        }
    }

    /// Create a routing-layer message whose body is a JSON payload
    pub fn routing<T: Serialize>(destination: Destination, payload: &T) -> Result<Self> {
        Ok(Self::request(destination, "", serde_json::to_string(payload)?))
    }

    /// Decode the JSON body into a typed payload
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Encode as a tunnel frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a tunnel frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Copy of this message with a narrowed selector
    pub fn with_selector(&self, selector: String) -> Self {
        Self {
            selector,
            ..self.clone()
        }
    }

    /// Turn a request into the response carrying one responder's status
    pub fn into_response(mut self, responder: &str, status: ResponseStatus) -> Self {
        self.command = Command::Response;
        self.status.clear();
        self.status.insert(responder.to_string(), status);
        self
    }
}

/// Identity of a child cluster captured when its link is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRegistration {
    pub name: String,
    pub display_name: String,
    pub listen_addr: String,
    #[serde(default)]
    pub parent: String,
    pub timestamp: DateTime<Utc>,
}

impl ClusterRegistration {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        listen_addr: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            listen_addr: listen_addr.into(),
            parent: parent.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Public part of a routing table, gossiped one hop downward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterView {
    #[serde(default)]
    pub children: BTreeMap<String, String>,
    #[serde(default)]
    pub neighbors: BTreeMap<String, String>,
}

/// Clusters reachable through the sender, reported after it (re)connects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeReport {
    pub clusters: BTreeSet<String>,
}

/// Request executed by a backend handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: String,
}

/// Response produced by a backend handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub code: u16,
    #[serde(default)]
    pub body: String,
    pub timestamp: i64,
}

impl From<BackendResponse> for ResponseStatus {
    fn from(resp: BackendResponse) -> Self {
        Self {
            timestamp: resp.timestamp,
            code: resp.code,
            body: resp.body,
        }
    }
}
