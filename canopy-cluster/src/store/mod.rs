//! Persisted records kept by the root of the tree
//!
//! Two record kinds are stored per namespace: one [`ClusterRecord`] for
//! every cluster currently reachable from the root, and one [`TaskRecord`]
//! for every request dispatched from the root together with the statuses
//! its responders reported back.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{ClusterRegistration, ControlMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identity of one reachable cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub namespace: String,
    pub name: String,
    pub display_name: String,
    pub listen_addr: String,
    /// Direct parent of the cluster in the tree
    pub parent: String,
    pub registered_at: DateTime<Utc>,
}

impl ClusterRecord {
    pub fn from_registration(namespace: &str, registration: &ClusterRegistration) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: registration.name.clone(),
            display_name: registration.display_name.clone(),
            listen_addr: registration.listen_addr.clone(),
            parent: registration.parent.clone(),
            registered_at: registration.timestamp,
        }
    }
}

/// A dispatched request and its aggregated responder statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub namespace: String,
    pub message: ControlMessage,
    /// Bumped on every successful update
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Backing store consulted by the root
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterRecord>>;

    /// Fails with `AlreadyExists` if the name is taken
    async fn create_cluster(&self, record: ClusterRecord) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<ClusterRecord>>;

    async fn get_task(&self, namespace: &str, id: &str) -> Result<Option<TaskRecord>>;

    /// Store a new task at version 1 and announce it to watchers
    async fn create_task(&self, namespace: &str, message: ControlMessage) -> Result<TaskRecord>;

    /// Replace a task if `record.version` is current; fails with `Conflict`
    /// otherwise. Returns the stored record with its new version.
    async fn update_task(&self, record: TaskRecord) -> Result<TaskRecord>;

    async fn delete_task(&self, namespace: &str, id: &str) -> Result<bool>;

    async fn list_tasks(&self, namespace: &str) -> Result<Vec<TaskRecord>>;

    /// Subscribe to newly created tasks
    fn watch_tasks(&self) -> broadcast::Receiver<TaskRecord>;
}
