//! In-process record store

use super::{ClusterRecord, RecordStore, TaskRecord};
use crate::error::{ClusterError, Result};
use crate::types::ControlMessage;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

const WATCH_CAPACITY: usize = 1024;

type Key = (String, String);

/// Record store held entirely in memory
pub struct MemoryStore {
    clusters: RwLock<BTreeMap<Key, ClusterRecord>>,
    tasks: RwLock<BTreeMap<Key, TaskRecord>>,
    created: broadcast::Sender<TaskRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (created, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            clusters: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
            created,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterRecord>> {
        Ok(self.clusters.read().get(&key(namespace, name)).cloned())
    }

    async fn create_cluster(&self, record: ClusterRecord) -> Result<()> {
        let mut clusters = self.clusters.write();
        let k = key(&record.namespace, &record.name);
        if clusters.contains_key(&k) {
            return Err(ClusterError::AlreadyExists(format!("cluster {}/{}", record.namespace, record.name)));
        }
        debug!(namespace = %record.namespace, cluster = %record.name, "Cluster record created");
        clusters.insert(k, record);
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.clusters.write().remove(&key(namespace, name)).is_some())
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<ClusterRecord>> {
        Ok(self
            .clusters
            .read()
            .values()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_task(&self, namespace: &str, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().get(&key(namespace, id)).cloned())
    }

    async fn create_task(&self, namespace: &str, message: ControlMessage) -> Result<TaskRecord> {
        let record = TaskRecord {
            namespace: namespace.to_string(),
            message,
            version: 1,
            created_at: Utc::now(),
        };
        {
            let mut tasks = self.tasks.write();
            let k = key(namespace, record.id());
            if tasks.contains_key(&k) {
                return Err(ClusterError::AlreadyExists(format!("task {}/{}", namespace, record.id())));
            }
            tasks.insert(k, record.clone());
        }
        // no subscribers is fine
        let _ = self.created.send(record.clone());
        Ok(record)
    }

    async fn update_task(&self, record: TaskRecord) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write();
        let k = key(&record.namespace, record.id());
        let Some(stored) = tasks.get_mut(&k) else {
            return Err(ClusterError::NotFound(format!("task {}/{}", record.namespace, record.id())));
        };
        if stored.version != record.version {
            return Err(ClusterError::Conflict(format!(
                "task {} is at version {}, update was based on {}",
                record.id(),
                stored.version,
                record.version
            )));
        }
        *stored = TaskRecord {
            version: record.version + 1,
            ..record
        };
        Ok(stored.clone())
    }

    async fn delete_task(&self, namespace: &str, id: &str) -> Result<bool> {
        Ok(self.tasks.write().remove(&key(namespace, id)).is_some())
    }

    async fn list_tasks(&self, namespace: &str) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .read()
            .values()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect();
        tasks.sort_by_key(|r| r.created_at);
        Ok(tasks)
    }

    fn watch_tasks(&self) -> broadcast::Receiver<TaskRecord> {
        self.created.subscribe()
    }
}
