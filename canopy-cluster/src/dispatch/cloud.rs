//! Upward half: traffic arriving from children
//!
//! Registrations, deregistrations and subtree reports update the route
//! table and are forwarded upward only when they change what this node can
//! reach, so every ancestor holds exactly one route per reachable cluster
//! through this node. The root turns the same events into cluster records.

use super::{Dispatcher, Upward};
use crate::metrics;
use crate::store::ClusterRecord;
use crate::types::{ClusterRegistration, Command, ControlMessage, Destination, SubtreeReport};
use tracing::{debug, info, warn};

impl Dispatcher {
    pub async fn handle_upward(&self, event: Upward) {
        match event {
            Upward::Frame { from, frame } => match ControlMessage::decode(&frame) {
                Ok(message) => self.handle_child_message(&from, message).await,
                Err(e) => {
                    warn!(child = %from, error = %e, "Dropping undecodable frame");
                    metrics::record_decode_error("child");
                }
            },
            Upward::Message { from, message } => self.handle_child_message(&from, message).await,
            Upward::ChildConnected(registration) => {
                debug!(child = %registration.name, "Sharing routing view after child joined");
                self.broadcast_view();
            }
            Upward::ChildDisconnected(registration) => self.handle_child_lost(&registration).await,
        }
    }

    async fn handle_child_message(&self, from: &str, message: ControlMessage) {
        match &message.destination {
            Destination::Router => {
                // gossip only flows downward
                debug!(child = %from, "Ignoring routing view sent by a child");
                metrics::record_dispatch("router", "ignored");
            }
            Destination::Register => self.handle_register(from, message).await,
            Destination::Deregister => self.handle_deregister(from, message).await,
            Destination::Subtree => self.handle_subtree(from, message).await,
            Destination::Backend(_) => match message.command {
                Command::Response => self.handle_response(message).await,
                Command::Request => {
                    self.fan_out(&message);
                }
            },
        }
    }

    async fn handle_register(&self, from: &str, message: ControlMessage) {
        let registration: ClusterRegistration = match message.payload() {
            Ok(registration) => registration,
            Err(e) => {
                warn!(child = %from, error = %e, "Dropping malformed registration");
                metrics::record_decode_error("register");
                return;
            }
        };

        let newly_reachable = self.table.add_route(&registration.name, from);
        metrics::set_subtree_size(self.table.subtree_clusters().len());
        if !newly_reachable {
            debug!(cluster = %registration.name, via = %from, "Cluster already reachable, registration absorbed");
            metrics::record_dispatch("register", "absorbed");
            return;
        }
        info!(cluster = %registration.name, via = %from, "Cluster registered");

        if self.is_root() {
            self.create_cluster_record(ClusterRecord::from_registration(&self.namespace, &registration))
                .await;
            metrics::record_dispatch("register", "stored");
        } else {
            let mut message = message;
            if message.parent.is_empty() {
                message.parent = self.name.clone();
            }
            self.forward_upward(&message, "register");
        }
    }

    async fn handle_deregister(&self, from: &str, message: ControlMessage) {
        let registration: ClusterRegistration = match message.payload() {
            Ok(registration) => registration,
            Err(e) => {
                warn!(child = %from, error = %e, "Dropping malformed deregistration");
                metrics::record_decode_error("deregister");
                return;
            }
        };

        let unreachable = self.table.del_route(&registration.name, from);
        metrics::set_subtree_size(self.table.subtree_clusters().len());
        for cluster in unreachable {
            let withdrawn = if cluster == registration.name {
                registration.clone()
            } else {
                ClusterRegistration::new(cluster.as_str(), cluster.as_str(), "", from)
            };
            self.withdraw(withdrawn).await;
        }
    }

    /// A direct child link closed: everything reached only through it is gone
    async fn handle_child_lost(&self, registration: &ClusterRegistration) {
        let unreachable = self.table.del_route(&registration.name, &registration.name);
        metrics::set_subtree_size(self.table.subtree_clusters().len());
        info!(child = %registration.name, withdrawn = unreachable.len(), "Child lost");

        for cluster in unreachable {
            let withdrawn = if cluster == registration.name {
                registration.clone()
            } else {
                ClusterRegistration::new(cluster.as_str(), cluster.as_str(), "", registration.name.as_str())
            };
            self.withdraw(withdrawn).await;
        }
        self.broadcast_view();
    }

    /// Delete the record at the root, or pass the withdrawal upward
    async fn withdraw(&self, registration: ClusterRegistration) {
        if self.is_root() {
            if let Some(store) = &self.store {
                match store.delete_cluster(&self.namespace, &registration.name).await {
                    Ok(true) => info!(cluster = %registration.name, "Cluster record deleted"),
                    Ok(false) => debug!(cluster = %registration.name, "No cluster record to delete"),
                    Err(e) => warn!(cluster = %registration.name, error = %e, "Failed to delete cluster record"),
                }
            }
            metrics::record_dispatch("deregister", "stored");
            return;
        }

        match ControlMessage::routing(Destination::Deregister, &registration) {
            Ok(mut message) => {
                message.parent = self.name.clone();
                self.forward_upward(&message, "deregister");
            }
            Err(e) => warn!(cluster = %registration.name, error = %e, "Cannot encode deregistration"),
        }
    }

    async fn handle_subtree(&self, from: &str, message: ControlMessage) {
        let report: SubtreeReport = match message.payload() {
            Ok(report) => report,
            Err(e) => {
                warn!(child = %from, error = %e, "Dropping malformed subtree report");
                metrics::record_decode_error("subtree");
                return;
            }
        };

        let newly_reachable: Vec<String> = report
            .clusters
            .into_iter()
            .filter(|cluster| *cluster != self.name)
            .filter(|cluster| self.table.add_route(cluster, from))
            .collect();
        metrics::set_subtree_size(self.table.subtree_clusters().len());
        info!(via = %from, added = newly_reachable.len(), "Subtree report applied");
        if newly_reachable.is_empty() {
            return;
        }

        if self.is_root() {
            for cluster in &newly_reachable {
                let registration = ClusterRegistration::new(cluster.as_str(), cluster.as_str(), "", from);
                self.create_cluster_record(ClusterRecord::from_registration(&self.namespace, &registration))
                    .await;
            }
            return;
        }

        let report = SubtreeReport {
            clusters: newly_reachable.into_iter().collect(),
        };
        match ControlMessage::routing(Destination::Subtree, &report) {
            Ok(mut message) => {
                message.parent = self.name.clone();
                self.forward_upward(&message, "subtree");
            }
            Err(e) => warn!(error = %e, "Cannot encode subtree report"),
        }
    }

    /// Route a response toward the node that stamped it
    pub(crate) async fn handle_response(&self, message: ControlMessage) {
        if message.parent == self.name {
            self.complete_response(message).await;
        } else if self.is_root() {
            warn!(id = %message.id, parent = %message.parent, "Dropping response for an unknown origin");
            metrics::record_dispatch(message.destination.as_str(), "dropped");
        } else {
            self.forward_upward(&message, "response");
        }
    }

    /// A response addressed to this node: relay to the controller, merge into the store
    pub(crate) async fn complete_response(&self, message: ControlMessage) {
        if let Some(controller) = &self.controller {
            match message.encode().and_then(|frame| controller.send(frame)) {
                Ok(()) => debug!(id = %message.id, "Response relayed to controller"),
                Err(e) => debug!(id = %message.id, error = %e, "Response not relayed to controller"),
            }
        }

        if let Some(store) = &self.store {
            match self.merge_response(store.as_ref(), &message).await {
                Ok(changed) => debug!(id = %message.id, changed, "Response merged"),
                Err(e) => warn!(id = %message.id, error = %e, "Failed to merge response"),
            }
        }
        metrics::record_dispatch(message.destination.as_str(), "completed");
    }

    async fn create_cluster_record(&self, record: ClusterRecord) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get_cluster(&record.namespace, &record.name).await {
            Ok(Some(_)) => {
                debug!(cluster = %record.name, "Cluster record exists, keeping it");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(cluster = %record.name, error = %e, "Failed to read cluster record");
                return;
            }
        }
        let name = record.name.clone();
        match store.create_cluster(record).await {
            Ok(()) => info!(cluster = %name, "Cluster record created"),
            Err(e) => debug!(cluster = %name, error = %e, "Cluster record not created"),
        }
    }

    fn forward_upward(&self, message: &ControlMessage, kind: &str) {
        match self.send_upward(message) {
            Ok(()) => metrics::record_dispatch(kind, "forwarded"),
            Err(e) => {
                warn!(id = %message.id, kind, error = %e, "Failed to forward upward");
                metrics::record_dispatch(kind, "forward_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{RecordingChildren, RecordingLink};
    use super::*;
    use crate::routing::RoutingTable;
    use crate::store::{MemoryStore, RecordStore};
    use crate::types::ResponseStatus;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn register(name: &str, parent: &str) -> ControlMessage {
        let mut message =
            ControlMessage::routing(Destination::Register, &ClusterRegistration::new(name, name, "a:1", parent)).unwrap();
        message.parent = parent.to_string();
        message
    }

    fn deregister(name: &str) -> ControlMessage {
        ControlMessage::routing(Destination::Deregister, &ClusterRegistration::new(name, name, "", "")).unwrap()
    }

    fn intermediate() -> (Dispatcher, Arc<RoutingTable>, Arc<RecordingChildren>, Arc<RecordingLink>) {
        let table = Arc::new(RoutingTable::new());
        let children = Arc::new(RecordingChildren::default());
        let uplink = Arc::new(RecordingLink::default());
        let dispatcher = Dispatcher::new("mid", table.clone(), children.clone()).with_uplink(uplink.clone());
        (dispatcher, table, children, uplink)
    }

    fn root() -> (Dispatcher, Arc<RoutingTable>, Arc<MemoryStore>) {
        let table = Arc::new(RoutingTable::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new("root", table.clone(), Arc::new(RecordingChildren::default()))
            .with_store(store.clone(), "default", 3);
        (dispatcher, table, store)
    }

    #[tokio::test]
    async fn test_register_forwarded_once_per_reachability() {
        let (dispatcher, table, _, uplink) = intermediate();

        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("c1", "mid") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g1", "c1") }).await;
        // a second path to g1 is not announced again
        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message: register("g1", "c2") }).await;

        assert!(table.has_route("g1", "c1"));
        assert!(table.has_route("g1", "c2"));
        let sent = uplink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.destination == Destination::Register));
        let names: Vec<String> = sent
            .iter()
            .map(|m| m.payload::<ClusterRegistration>().unwrap().name)
            .collect();
        assert_eq!(names, vec!["c1".to_string(), "g1".to_string()]);
        // stamped by the originator, not rewritten on the way
        assert_eq!(sent[1].parent, "c1");
    }

    #[tokio::test]
    async fn test_malformed_registration_is_dropped() {
        let (dispatcher, table, _, uplink) = intermediate();
        let mut message = register("c1", "mid");
        message.body = "{not json".into();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message }).await;
        dispatcher.handle_upward(Upward::Frame { from: "c1".into(), frame: b"garbage".to_vec() }).await;

        assert!(table.subtree_clusters().is_empty());
        assert!(uplink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_child_loss_cascades_deregistrations() {
        let (dispatcher, table, children, uplink) = intermediate();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("c1", "mid") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g1", "c1") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message: register("c2", "mid") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message: register("g1", "c2") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g2", "c1") }).await;
        uplink.sent.lock().clear();

        dispatcher
            .handle_upward(Upward::ChildDisconnected(ClusterRegistration::new("c1", "c1", "a:1", "mid")))
            .await;

        // g1 survives through c2
        assert!(table.has_route("g1", "c2"));
        assert!(!table.has_route("g2", "c1"));
        let mut withdrawn: Vec<String> = uplink
            .sent
            .lock()
            .iter()
            .inspect(|m| assert_eq!(m.destination, Destination::Deregister))
            .map(|m| m.payload::<ClusterRegistration>().unwrap().name)
            .collect();
        withdrawn.sort();
        assert_eq!(withdrawn, vec!["c1".to_string(), "g2".to_string()]);
        assert_eq!(children.broadcasts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_only_forwarded_when_unreachable() {
        let (dispatcher, _, _, uplink) = intermediate();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g1", "c1") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message: register("g1", "c2") }).await;
        uplink.sent.lock().clear();

        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: deregister("g1") }).await;
        assert!(uplink.sent.lock().is_empty());

        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message: deregister("g1") }).await;
        assert_eq!(uplink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subtree_report_forwards_new_clusters_only() {
        let (dispatcher, table, _, uplink) = intermediate();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g1", "c1") }).await;
        uplink.sent.lock().clear();

        let report = SubtreeReport {
            clusters: ["g1", "g2", "g3"].iter().map(|s| s.to_string()).collect(),
        };
        let message = ControlMessage::routing(Destination::Subtree, &report).unwrap();
        dispatcher.handle_upward(Upward::Message { from: "c2".into(), message }).await;

        assert!(table.has_route("g1", "c2"));
        assert!(table.has_route("g3", "c2"));
        let sent = uplink.sent.lock();
        assert_eq!(sent.len(), 1);
        let forwarded: SubtreeReport = sent[0].payload().unwrap();
        assert_eq!(forwarded.clusters.into_iter().collect::<Vec<_>>(), vec!["g2".to_string(), "g3".to_string()]);
        assert_eq!(sent[0].parent, "mid");
    }

    #[tokio::test]
    async fn test_root_keeps_records_of_reachable_clusters() {
        let (dispatcher, _, store) = root();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("c1", "root") }).await;
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: register("g1", "c1") }).await;

        let record = store.get_cluster("default", "g1").await.unwrap().unwrap();
        assert_eq!(record.parent, "c1");
        assert_eq!(store.list_clusters("default").await.unwrap().len(), 2);

        dispatcher
            .handle_upward(Upward::ChildDisconnected(ClusterRegistration::new("c1", "c1", "a:1", "root")))
            .await;
        assert!(store.list_clusters("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_keeps_existing_record_on_duplicate() {
        let (dispatcher, _, store) = root();
        let first = ClusterRegistration::new("c1", "first", "a:1", "root");
        store
            .create_cluster(ClusterRecord::from_registration("default", &first))
            .await
            .unwrap();

        let mut message = ControlMessage::routing(
            Destination::Register,
            &ClusterRegistration::new("c1", "second", "b:2", "root"),
        )
        .unwrap();
        message.parent = "root".into();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message }).await;

        let record = store.get_cluster("default", "c1").await.unwrap().unwrap();
        assert_eq!(record.display_name, "first");
    }

    #[tokio::test]
    async fn test_response_merge_respects_timestamps() {
        let (dispatcher, _, store) = root();
        let mut request = ControlMessage::request(Destination::Backend("rest".into()), "c1", "{}");
        request.parent = "root".into();
        request.status = BTreeMap::from([("c1".to_string(), ResponseStatus { timestamp: 5, code: 200, body: "v5".into() })]);
        store.create_task("default", request.clone()).await.unwrap();

        let respond = |timestamp: i64, body: &str| {
            let mut response = request.clone().into_response("c1", ResponseStatus::new(200, body));
            response.status.get_mut("c1").unwrap().timestamp = timestamp;
            response
        };

        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: respond(3, "v3") }).await;
        let record = store.get_task("default", &request.id).await.unwrap().unwrap();
        assert_eq!(record.message.status["c1"].body, "v5");
        assert_eq!(record.version, 1);

        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: respond(9, "v9") }).await;
        let record = store.get_task("default", &request.id).await.unwrap().unwrap();
        assert_eq!(record.message.status["c1"].timestamp, 9);
        assert_eq!(record.message.status["c1"].body, "v9");
    }

    #[tokio::test]
    async fn test_foreign_response_is_forwarded_upward() {
        let (dispatcher, _, _, uplink) = intermediate();
        let mut request = ControlMessage::request(Destination::Backend("rest".into()), "g1", "{}");
        request.parent = "root".into();
        let response = request.into_response("g1", ResponseStatus::new(200, "ok"));

        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: response.clone() }).await;
        assert_eq!(uplink.sent.lock().as_slice(), &[response]);
    }

    #[tokio::test]
    async fn test_own_response_is_relayed_to_controller() {
        let table = Arc::new(RoutingTable::new());
        let controller = Arc::new(RecordingLink::default());
        let dispatcher = Dispatcher::new("mid", table, Arc::new(RecordingChildren::default()))
            .with_uplink(Arc::new(RecordingLink::default()))
            .with_controller(controller.clone());

        let mut request = ControlMessage::request(Destination::Backend("rest".into()), "g1", "{}");
        request.parent = "mid".into();
        let response = request.into_response("g1", ResponseStatus::new(200, "ok"));
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message: response }).await;

        assert_eq!(controller.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_gossip_from_child_is_ignored() {
        let (dispatcher, table, children, uplink) = intermediate();
        table.add_child("c1", "a:1").unwrap();
        let message = table.router_message().unwrap();
        dispatcher.handle_upward(Upward::Message { from: "c1".into(), message }).await;

        assert!(table.neighbors().is_empty());
        assert!(children.broadcasts.lock().is_empty());
        assert!(uplink.sent.lock().is_empty());
    }
}
