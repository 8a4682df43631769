//! Merging responder statuses into persisted task records

use super::Dispatcher;
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::store::RecordStore;
use crate::types::{ControlMessage, ResponseStatus};
use std::collections::BTreeMap;
use tracing::debug;

/// Fold `incoming` into `existing`.
///
/// An incoming entry wins only when the responder has no entry yet or the
/// incoming timestamp is strictly newer. Returns how many entries changed.
pub fn merge_status(existing: &mut BTreeMap<String, ResponseStatus>, incoming: &BTreeMap<String, ResponseStatus>) -> usize {
    let mut changed = 0;
    for (responder, status) in incoming {
        let newer = existing
            .get(responder)
            .map_or(true, |current| status.timestamp > current.timestamp);
        if newer {
            existing.insert(responder.clone(), status.clone());
            changed += 1;
        }
    }
    changed
}

impl Dispatcher {
    /// Merge a completed response into its task record.
    ///
    /// Runs under the global merge lock and retries on version conflicts
    /// caused by writers outside this node.
    pub(crate) async fn merge_response(&self, store: &dyn RecordStore, response: &ControlMessage) -> Result<usize> {
        let _guard = self.merge_lock.lock().await;

        for attempt in 0..=self.merge_retries {
            let Some(mut record) = store.get_task(&self.namespace, &response.id).await? else {
                metrics::record_merge("unknown");
                return Err(ClusterError::NotFound(format!("task {}", response.id)));
            };

            let changed = merge_status(&mut record.message.status, &response.status);
            if changed == 0 {
                metrics::record_merge("stale");
                return Ok(0);
            }

            match store.update_task(record).await {
                Ok(_) => {
                    metrics::record_merge("applied");
                    return Ok(changed);
                }
                Err(ClusterError::Conflict(reason)) => {
                    metrics::record_merge("conflict");
                    debug!(id = %response.id, attempt, reason = %reason, "Task changed underneath merge, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Conflict(format!(
            "task {} still conflicting after {} retries",
            response.id, self.merge_retries
        )))
    }
}
