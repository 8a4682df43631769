//! Routing table for one cluster node
//!
//! Tracks direct children, siblings reported by the parent, the parent's own
//! siblings (failover targets) and reference-counted subtree routes. All
//! access goes through a single lock that is never held across I/O; callers
//! broadcast gossip after a mutation returns.

use crate::error::{ClusterError, Result};
use crate::types::{ControlMessage, Destination, RouterView};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Point-in-time copy of the whole table, used for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub children: BTreeMap<String, String>,
    pub neighbors: BTreeMap<String, String>,
    pub parent_neighbors: BTreeMap<String, String>,
    pub routes: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Debug, Default)]
struct TableState {
    children: BTreeMap<String, String>,
    neighbors: BTreeMap<String, String>,
    parent_neighbors: BTreeMap<String, String>,
    /// destination -> next-hop child -> multiplicity (always >= 1)
    routes: BTreeMap<String, BTreeMap<String, u32>>,
}

/// Topology view of one node
#[derive(Debug, Default)]
pub struct RoutingTable {
    state: RwLock<TableState>,
}

impl RoutingTable {
    /// Create an empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // Children
    // ========================================

    /// Register a direct child. Fails if the name is already taken.
    pub fn add_child(&self, name: &str, addr: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.children.get(name) {
            return Err(ClusterError::DuplicateName(format!(
                "{} already connected from {}",
                name, existing
            )));
        }
        state.children.insert(name.to_string(), addr.to_string());
        info!(child = %name, addr = %addr, "Child added to routing table");
        Ok(())
    }

    /// Remove a direct child; returns false if it was not present
    pub fn del_child(&self, name: &str) -> bool {
        let removed = self.state.write().children.remove(name).is_some();
        if removed {
            info!(child = %name, "Child removed from routing table");
        } else {
            debug!(child = %name, "Child not present in routing table");
        }
        removed
    }

    /// Listen address of a direct child
    pub fn child_addr(&self, name: &str) -> Option<String> {
        self.state.read().children.get(name).cloned()
    }

    pub fn children(&self) -> BTreeMap<String, String> {
        self.state.read().children.clone()
    }

    pub fn neighbors(&self) -> BTreeMap<String, String> {
        self.state.read().neighbors.clone()
    }

    pub fn parent_neighbors(&self) -> BTreeMap<String, String> {
        self.state.read().parent_neighbors.clone()
    }

    // ========================================
    // Subtree routes
    // ========================================

    /// Increment the multiplicity of the (destination, port) route.
    ///
    /// Returns true when `destination` was unreachable before the call.
    pub fn add_route(&self, destination: &str, port: &str) -> bool {
        let mut state = self.state.write();
        let ports = state.routes.entry(destination.to_string()).or_default();
        let newly_reachable = ports.is_empty();
        let count = ports.entry(port.to_string()).or_insert(0);
        *count += 1;
        debug!(destination = %destination, port = %port, count = *count, "Route added");
        newly_reachable
    }

    /// Withdraw a route and return every destination that became unreachable.
    ///
    /// When `destination == port` the port itself is gone, so every path
    /// through it is dropped regardless of multiplicity.
    pub fn del_route(&self, destination: &str, port: &str) -> Vec<String> {
        let mut state = self.state.write();
        let mut unreachable = Vec::new();

        if destination == port {
            state.routes.retain(|dest, ports| {
                ports.remove(port);
                if ports.is_empty() {
                    unreachable.push(dest.clone());
                    false
                } else {
                    true
                }
            });
            info!(
                port = %port,
                withdrawn = unreachable.len(),
                "Port withdrawn, cascaded route removal"
            );
            return unreachable;
        }

        let Some(ports) = state.routes.get_mut(destination) else {
            debug!(destination = %destination, "No route to withdraw");
            return unreachable;
        };
        if let Some(count) = ports.get_mut(port) {
            *count -= 1;
            if *count == 0 {
                ports.remove(port);
            }
        }
        if ports.is_empty() {
            state.routes.remove(destination);
            unreachable.push(destination.to_string());
        }
        debug!(destination = %destination, port = %port, "Route withdrawn");
        unreachable
    }

    /// Whether `destination` is currently reachable through `port`
    pub fn has_route(&self, destination: &str, port: &str) -> bool {
        self.state
            .read()
            .routes
            .get(destination)
            .and_then(|ports| ports.get(port))
            .is_some_and(|count| *count > 0)
    }

    /// Multiplicity of a route, zero when absent
    pub fn route_count(&self, destination: &str, port: &str) -> u32 {
        self.state
            .read()
            .routes
            .get(destination)
            .and_then(|ports| ports.get(port).copied())
            .unwrap_or(0)
    }

    /// Group destinations by the direct child that reaches them.
    ///
    /// Destinations without a route are omitted. A destination reachable
    /// through several ports appears under each of them.
    pub fn ports_to_subtree_clusters(&self, destinations: &[String]) -> BTreeMap<String, Vec<String>> {
        let state = self.state.read();
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for dest in destinations {
            if let Some(ports) = state.routes.get(dest) {
                for port in ports.keys() {
                    result.entry(port.clone()).or_default().push(dest.clone());
                }
            }
        }
        result
    }

    /// Every destination reachable below this node
    pub fn subtree_clusters(&self) -> Vec<String> {
        self.state.read().routes.keys().cloned().collect()
    }

    // ========================================
    // Gossip
    // ========================================

    /// Adopt the parent's children as our neighbors; returns whether they changed
    pub fn update_neighbor(&self, parent: &RouterView) -> bool {
        let mut state = self.state.write();
        if state.neighbors == parent.children {
            return false;
        }
        state.neighbors = parent.children.clone();
        debug!(count = state.neighbors.len(), "Neighbors updated");
        true
    }

    /// Adopt the parent's neighbors as our failover pool; returns whether they changed
    pub fn update_parent_neighbor(&self, parent: &RouterView) -> bool {
        let mut state = self.state.write();
        if state.parent_neighbors == parent.neighbors {
            return false;
        }
        state.parent_neighbors = parent.neighbors.clone();
        debug!(count = state.parent_neighbors.len(), "Parent neighbors updated");
        true
    }

    /// Public view shared with children; routes are never included
    pub fn view(&self) -> RouterView {
        let state = self.state.read();
        RouterView {
            children: state.children.clone(),
            neighbors: state.neighbors.clone(),
        }
    }

    /// Serialize the public view as a routing-gossip message
    pub fn router_message(&self) -> Result<ControlMessage> {
        ControlMessage::routing(Destination::Router, &self.view())
    }

    /// Full copy of the table
    pub fn snapshot(&self) -> RoutingSnapshot {
        let state = self.state.read();
        RoutingSnapshot {
            children: state.children.clone(),
            neighbors: state.neighbors.clone(),
            parent_neighbors: state.parent_neighbors.clone(),
            routes: state.routes.clone(),
        }
    }

    /// Destinations reachable through one port
    pub fn clusters_via(&self, port: &str) -> BTreeSet<String> {
        self.state
            .read()
            .routes
            .iter()
            .filter(|(_, ports)| ports.contains_key(port))
            .map(|(dest, _)| dest.clone())
            .collect()
    }
}
