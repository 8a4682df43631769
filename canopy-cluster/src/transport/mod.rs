//! Tunnel transports between cluster nodes
//!
//! A node listens for child links ([`CloudTransport`]), dials its parent
//! ([`EdgeTransport`]) and optionally accepts a single controller link
//! ([`ControllerTransport`]). Transports never call the dispatch engine
//! directly: inbound frames and link events are handed to the small
//! capability traits below, and outbound traffic goes through
//! [`ChildLinks`] and [`LinkSender`].

mod cloud;
mod controller;
mod edge;
mod failover;
mod link;

pub use cloud::CloudTransport;
pub use controller::ControllerTransport;
pub use edge::{EdgeIdentity, EdgeTransport};
pub use failover::FailoverSet;
pub use link::{DuplexLink, LinkHandle, LinkOptions, TunnelStream};

use crate::error::Result;
use crate::types::ClusterRegistration;
use std::fmt;

/// Upgrade path prefix for child links; the declared name follows it
pub const TUNNEL_PATH_PREFIX: &str = "/tunnel/";

/// Upgrade path of the controller link
pub const CONTROLLER_PATH: &str = "/controller";

/// Mandatory header carrying the child's own listen address
pub const HEADER_LISTEN_ADDR: &str = "x-canopy-listen-addr";

/// Mandatory header carrying the child's display name
pub const HEADER_DISPLAY_NAME: &str = "x-canopy-display-name";

/// Where an inbound frame was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSource {
    Child(String),
    Parent,
    Controller,
}

impl FrameSource {
    /// Metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            FrameSource::Child(_) => "child",
            FrameSource::Parent => "parent",
            FrameSource::Controller => "controller",
        }
    }
}

impl fmt::Display for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSource::Child(name) => write!(f, "child:{}", name),
            FrameSource::Parent => f.write_str("parent"),
            FrameSource::Controller => f.write_str("controller"),
        }
    }
}

/// Decides whether a child may join under its declared name
pub trait NameValidator: Send + Sync {
    /// Return false to refuse the upgrade
    fn validate(&self, registration: &ClusterRegistration) -> bool;
}

/// Child link lifecycle hooks
pub trait ConnectObserver: Send + Sync {
    /// Called once the link is stored and its reader is running
    fn on_connect(&self, registration: &ClusterRegistration);

    /// Called once after the read loop ends; the registration carries the
    /// disconnect time
    fn on_disconnect(&self, registration: &ClusterRegistration);
}

/// Receives every frame read from any link
pub trait InboundHandler: Send + Sync {
    fn on_frame(&self, source: FrameSource, frame: Vec<u8>);
}

/// Parent link lifecycle hooks
pub trait ParentObserver: Send + Sync {
    fn on_parent_connected(&self);
    fn on_parent_disconnected(&self);
}

/// Outbound side of the child links
pub trait ChildLinks: Send + Sync {
    /// Queue a frame for one child; `NotFound` if it has no live link
    fn send(&self, child: &str, frame: Vec<u8>) -> Result<()>;

    /// Queue a frame for every connected child. Failures are per child.
    fn broadcast(&self, frame: &[u8]);
}

/// Outbound side of a single link (parent uplink or controller)
pub trait LinkSender: Send + Sync {
    /// Queue a frame; `NotConnected` while the link is down
    fn send(&self, frame: Vec<u8>) -> Result<()>;
}
