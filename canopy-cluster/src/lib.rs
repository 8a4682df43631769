//! Canopy Cluster - hierarchical federation of cluster nodes
//!
//! Nodes form a tree. Each node accepts child links, dials one parent and
//! keeps a routing table of every cluster reachable below it. Requests are
//! addressed by selector (a list of name patterns), fanned out only toward
//! the children whose subtree matches, executed by backend handlers on the
//! selected nodes, and answered with per-responder statuses that flow back
//! to the node that issued them.
//!
//! # Architecture
//!
//! - **Selector**: comma-separated regex list deciding which clusters a request targets
//! - **Routing**: children, neighbors, parent neighbors and refcounted subtree routes
//! - **Transport**: WebSocket tunnels; child listener, parent dialer with failover, controller link
//! - **Dispatch**: upward (registration, responses) and downward (gossip, requests) state machines
//! - **Handler**: backend handlers keyed by destination tag (HTTP proxy, REST API)
//! - **Store**: cluster and task records kept by the root
//! - **Node**: wiring of all of the above behind one cancellation token

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod node;
pub mod routing;
pub mod selector;
pub mod store;
pub mod transport;
pub mod types;

pub use config::ClusterConfig;
pub use dispatch::{Dispatcher, Downward, LinkEvents, Upward};
pub use error::{ClusterError, Result};
pub use handler::{Handler, HandlerRegistry, HttpProxyHandler, RestApiHandler};
pub use node::ClusterNode;
pub use routing::{RoutingSnapshot, RoutingTable};
pub use selector::{clusters_to_selector, Selector};
pub use store::{ClusterRecord, MemoryStore, RecordStore, TaskRecord};
pub use transport::{
    ChildLinks, CloudTransport, ConnectObserver, ControllerTransport, EdgeTransport, FailoverSet,
    FrameSource, InboundHandler, LinkSender, NameValidator, ParentObserver,
};
pub use types::*;
