//! Cluster routing
//!
//! One [`RoutingTable`] per node, shared by the transports and the dispatch
//! engine through an `Arc`.
//!
//! ```text
//!              root
//!            /      \
//!          c1        c3          root.routes: c1 -> {c1}, c3 -> {c3}, c2 -> {c3}
//!                     |
//!                     c2         c2.neighbors = {c2}, c2.parent_neighbors = {c1, c3}
//! ```

mod table;

pub use table::{RoutingSnapshot, RoutingTable};
