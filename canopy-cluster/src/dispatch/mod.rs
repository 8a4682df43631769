//! Dispatch engine
//!
//! Transports and dispatch only meet at two unbounded queues:
//!
//! ```text
//!   child links ──► Upward ───► run_upward ───► parent uplink / store / controller
//!                                   │
//!                                   └──► child links (gossip)
//!
//!   parent link ─┐
//!   controller  ─┼► Downward ─► run_downward ─► backend handlers, child links (fan-out)
//!   store watch ─┘
//! ```
//!
//! [`LinkEvents`] is the transport-facing end of the queues: it implements
//! every transport capability trait and turns each callback into a queue
//! item. Each consumer processes its queue sequentially, so per-link frame
//! order is preserved end to end.

mod cloud;
mod edge;
mod merge;

pub use merge::merge_status;

use crate::error::{ClusterError, Result};
use crate::handler::HandlerRegistry;
use crate::metrics;
use crate::routing::RoutingTable;
use crate::selector::{clusters_to_selector, Selector};
use crate::store::RecordStore;
use crate::transport::{ChildLinks, ConnectObserver, FrameSource, InboundHandler, LinkSender, NameValidator, ParentObserver};
use crate::types::{ClusterRegistration, ControlMessage, Destination};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work travelling toward the root
#[derive(Debug)]
pub enum Upward {
    /// Raw frame read from a child link
    Frame { from: String, frame: Vec<u8> },
    /// Message synthesized on behalf of a child
    Message { from: String, message: ControlMessage },
    ChildConnected(ClusterRegistration),
    ChildDisconnected(ClusterRegistration),
}

/// Work travelling toward the leaves
#[derive(Debug)]
pub enum Downward {
    /// Raw frame read from the parent or the controller
    Frame { source: FrameSource, frame: Vec<u8> },
    /// Request originated at this node
    Local(ControlMessage),
    ParentConnected,
    ParentDisconnected,
}

/// Create the queue pair shared by transports and dispatch
pub fn queues() -> (
    (mpsc::UnboundedSender<Upward>, mpsc::UnboundedReceiver<Upward>),
    (mpsc::UnboundedSender<Downward>, mpsc::UnboundedReceiver<Downward>),
) {
    (mpsc::unbounded_channel(), mpsc::unbounded_channel())
}

/// Transport callbacks that feed the dispatch queues
pub struct LinkEvents {
    name: String,
    table: Arc<RoutingTable>,
    upward: mpsc::UnboundedSender<Upward>,
    downward: mpsc::UnboundedSender<Downward>,
}

impl LinkEvents {
    pub fn new(
        name: impl Into<String>,
        table: Arc<RoutingTable>,
        upward: mpsc::UnboundedSender<Upward>,
        downward: mpsc::UnboundedSender<Downward>,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            upward,
            downward,
        }
    }

    fn push_upward(&self, event: Upward) {
        if let Err(e) = self.upward.send(event) {
            debug!(event = ?e.0, "Upward queue closed");
        }
    }

    fn push_downward(&self, event: Downward) {
        if let Err(e) = self.downward.send(event) {
            debug!(event = ?e.0, "Downward queue closed");
        }
    }
}

impl NameValidator for LinkEvents {
    /// Claim the name in the routing table and queue a register message so
    /// a new child is handled like any registration arriving from below
    fn validate(&self, registration: &ClusterRegistration) -> bool {
        if registration.name == self.name {
            warn!(child = %registration.name, "Child claims this node's own name");
            return false;
        }
        if let Err(e) = self.table.add_child(&registration.name, &registration.listen_addr) {
            warn!(child = %registration.name, error = %e, "Refusing child link");
            return false;
        }

        let mut message = match ControlMessage::routing(Destination::Register, registration) {
            Ok(message) => message,
            Err(e) => {
                warn!(child = %registration.name, error = %e, "Cannot encode registration");
                self.table.del_child(&registration.name);
                return false;
            }
        };
        message.parent = self.name.clone();
        self.push_upward(Upward::Message {
            from: registration.name.clone(),
            message,
        });
        true
    }
}

impl ConnectObserver for LinkEvents {
    fn on_connect(&self, registration: &ClusterRegistration) {
        self.push_upward(Upward::ChildConnected(registration.clone()));
    }

    /// Queue the loss before releasing the name: a reconnect under the same
    /// name can only queue its register behind this event
    fn on_disconnect(&self, registration: &ClusterRegistration) {
        self.push_upward(Upward::ChildDisconnected(registration.clone()));
        self.table.del_child(&registration.name);
    }
}

impl InboundHandler for LinkEvents {
    fn on_frame(&self, source: FrameSource, frame: Vec<u8>) {
        match source {
            FrameSource::Child(from) => self.push_upward(Upward::Frame { from, frame }),
            source => self.push_downward(Downward::Frame { source, frame }),
        }
    }
}

impl ParentObserver for LinkEvents {
    fn on_parent_connected(&self) {
        self.push_downward(Downward::ParentConnected);
    }

    fn on_parent_disconnected(&self) {
        self.push_downward(Downward::ParentDisconnected);
    }
}

/// Shared state of both dispatch halves
pub struct Dispatcher {
    name: String,
    namespace: String,
    table: Arc<RoutingTable>,
    children: Arc<dyn ChildLinks>,
    uplink: Option<Arc<dyn LinkSender>>,
    controller: Option<Arc<dyn LinkSender>>,
    store: Option<Arc<dyn RecordStore>>,
    handlers: HandlerRegistry,
    /// Serializes read-modify-write of task statuses
    merge_lock: Mutex<()>,
    merge_retries: usize,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, table: Arc<RoutingTable>, children: Arc<dyn ChildLinks>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            table,
            children,
            uplink: None,
            controller: None,
            store: None,
            handlers: HandlerRegistry::new(),
            merge_lock: Mutex::new(()),
            merge_retries: 5,
        }
    }

    /// Link to the parent; a dispatcher without one acts as the root
    pub fn with_uplink(mut self, uplink: Arc<dyn LinkSender>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn LinkSender>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>, namespace: impl Into<String>, merge_retries: usize) -> Self {
        self.store = Some(store);
        self.namespace = namespace.into();
        self.merge_retries = merge_retries;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.uplink.is_none()
    }

    /// Consume the upward queue until it closes or `cancel` fires
    pub async fn run_upward(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Upward>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_upward(event).await,
                    None => break,
                },
            }
        }
        debug!(cluster = %self.name, "Upward dispatcher stopped");
    }

    /// Consume the downward queue until it closes or `cancel` fires
    pub async fn run_downward(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Downward>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_downward(event).await,
                    None => break,
                },
            }
        }
        debug!(cluster = %self.name, "Downward dispatcher stopped");
    }

    /// Send one copy of `message` to every child whose subtree the selector
    /// reaches, narrowing the selector to that subtree. Returns the number
    /// of children addressed.
    pub fn fan_out(&self, message: &ControlMessage) -> usize {
        let selector = Selector::new(&message.selector);
        let selected = selector.filter(&self.table.subtree_clusters());
        if selected.is_empty() {
            metrics::record_dispatch(message.destination.as_str(), "no_match");
            return 0;
        }

        let ports = self.table.ports_to_subtree_clusters(&selected);
        for (port, clusters) in &ports {
            let copy = message.with_selector(clusters_to_selector(clusters.as_slice()));
            let result = copy.encode().and_then(|frame| self.children.send(port, frame));
            match result {
                Ok(()) => debug!(child = %port, id = %message.id, clusters = clusters.len(), "Request forwarded"),
                Err(e) => warn!(child = %port, id = %message.id, error = %e, "Failed to forward request"),
            }
        }
        metrics::record_fan_out(ports.len());
        metrics::record_dispatch(message.destination.as_str(), "fan_out");
        ports.len()
    }

    /// Send our public view to every child
    pub(crate) fn broadcast_view(&self) {
        match self.table.router_message().and_then(|m| m.encode()) {
            Ok(frame) => self.children.broadcast(&frame),
            Err(e) => warn!(error = %e, "Failed to encode routing view"),
        }
    }

    /// Queue a message on the parent link
    pub(crate) fn send_upward(&self, message: &ControlMessage) -> Result<()> {
        let uplink = self
            .uplink
            .as_ref()
            .ok_or_else(|| ClusterError::NotConnected("root has no parent".into()))?;
        uplink.send(message.encode()?)
    }
}

/// Feed newly created task records into the downward queue
pub async fn run_store_watch(
    store: Arc<dyn RecordStore>,
    namespace: String,
    downward: mpsc::UnboundedSender<Downward>,
    cancel: CancellationToken,
) {
    let mut watch = store.watch_tasks();
    info!(namespace = %namespace, "Watching task records");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = watch.recv() => match received {
                Ok(record) => {
                    if record.namespace != namespace {
                        continue;
                    }
                    if downward.send(Downward::Local(record.message)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Task watch lagged, some tasks were not dispatched");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Task watch stopped");
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::RouterView;

    #[test]
    fn test_fan_out_narrows_selector_per_child() {
        // root -> c1, root -> c3 -> c2
        let table = Arc::new(RoutingTable::new());
        table.add_route("c1", "c1");
        table.add_route("c3", "c3");
        table.add_route("c2", "c3");
        let children = Arc::new(RecordingChildren::default());
        let dispatcher = Dispatcher::new("root", table, children.clone());

        let message = ControlMessage::request(Destination::Backend("rest".into()), "c2", "{}");
        assert_eq!(dispatcher.fan_out(&message), 1);

        assert!(children.sent_to("c1").is_empty());
        let forwarded = children.sent_to("c3");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].id, message.id);
        assert_eq!(forwarded[0].selector, "c2");
        let narrowed = Selector::new(&forwarded[0].selector);
        assert!(narrowed.has("c2"));
        assert!(!narrowed.has("c3"));
    }

    #[test]
    fn test_fan_out_without_match_is_silent() {
        let table = Arc::new(RoutingTable::new());
        table.add_route("c1", "c1");
        let children = Arc::new(RecordingChildren::default());
        let dispatcher = Dispatcher::new("root", table, children.clone());

        let message = ControlMessage::request(Destination::Backend("rest".into()), "nowhere", "{}");
        assert_eq!(dispatcher.fan_out(&message), 0);
        assert!(children.sent.lock().is_empty());
    }

    #[test]
    fn test_fan_out_once_per_port() {
        let table = Arc::new(RoutingTable::new());
        table.add_route("c1", "c1");
        table.add_route("c2", "c2");
        table.add_route("c5", "c1");
        table.add_route("c5", "c2");
        let children = Arc::new(RecordingChildren::default());
        let dispatcher = Dispatcher::new("root", table, children.clone());

        let message = ControlMessage::request(Destination::Backend("http".into()), "c.*", "{}");
        assert_eq!(dispatcher.fan_out(&message), 2);
        assert_eq!(children.sent_to("c1").len(), 1);
        assert_eq!(children.sent_to("c2").len(), 1);
    }

    #[tokio::test]
    async fn test_link_events_claim_name_and_queue_register() {
        let table = Arc::new(RoutingTable::new());
        let ((up_tx, mut up_rx), (down_tx, _down_rx)) = queues();
        let events = LinkEvents::new("root", table.clone(), up_tx, down_tx);

        let registration = ClusterRegistration::new("c1", "C1", "10.0.0.1:9443", "root");
        assert!(events.validate(&registration));
        assert!(!events.validate(&registration));
        assert_eq!(table.child_addr("c1").as_deref(), Some("10.0.0.1:9443"));

        match up_rx.recv().await.unwrap() {
            Upward::Message { from, message } => {
                assert_eq!(from, "c1");
                assert_eq!(message.destination, Destination::Register);
                assert_eq!(message.parent, "root");
                let decoded: ClusterRegistration = message.payload().unwrap();
                assert_eq!(decoded.name, "c1");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // the refused attempt queued nothing
        assert!(up_rx.try_recv().is_err());

        events.on_disconnect(&registration);
        assert!(table.child_addr("c1").is_none());
        assert!(matches!(up_rx.recv().await, Some(Upward::ChildDisconnected(_))));
    }

    #[tokio::test]
    async fn test_fast_reconnect_keeps_child_reachable() {
        use crate::store::{MemoryStore, RecordStore};

        let table = Arc::new(RoutingTable::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new("root", table.clone(), Arc::new(RecordingChildren::default()))
            .with_store(store.clone(), "default", 3);
        let ((up_tx, mut up_rx), (down_tx, _down_rx)) = queues();
        let events = LinkEvents::new("root", table.clone(), up_tx, down_tx);

        let registration = ClusterRegistration::new("c1", "c1", "10.0.0.1:9443", "root");
        assert!(events.validate(&registration));
        events.on_connect(&registration);
        while let Ok(event) = up_rx.try_recv() {
            dispatcher.handle_upward(event).await;
        }
        assert!(table.has_route("c1", "c1"));

        // old link goes away and the child dials back before the loss is handled
        events.on_disconnect(&registration);
        assert!(events.validate(&registration));

        let mut order = Vec::new();
        while let Ok(event) = up_rx.try_recv() {
            order.push(match &event {
                Upward::ChildDisconnected(_) => "lost",
                Upward::Message { .. } => "register",
                _ => "other",
            });
            dispatcher.handle_upward(event).await;
        }
        assert_eq!(order, vec!["lost", "register"]);

        assert_eq!(table.child_addr("c1").as_deref(), Some("10.0.0.1:9443"));
        assert_eq!(table.route_count("c1", "c1"), 1);
        assert!(store.get_cluster("default", "c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_link_events_refuse_own_name() {
        let table = Arc::new(RoutingTable::new());
        let ((up_tx, _up_rx), (down_tx, _down_rx)) = queues();
        let events = LinkEvents::new("root", table.clone(), up_tx, down_tx);
        assert!(!events.validate(&ClusterRegistration::new("root", "x", "a:1", "root")));
        assert!(table.children().is_empty());
    }

    #[tokio::test]
    async fn test_link_events_route_frames_by_source() {
        let table = Arc::new(RoutingTable::new());
        let ((up_tx, mut up_rx), (down_tx, mut down_rx)) = queues();
        let events = LinkEvents::new("root", table, up_tx, down_tx);

        events.on_frame(FrameSource::Child("c1".into()), b"a".to_vec());
        events.on_frame(FrameSource::Parent, b"b".to_vec());
        events.on_frame(FrameSource::Controller, b"c".to_vec());
        events.on_parent_connected();

        assert!(matches!(up_rx.recv().await, Some(Upward::Frame { from, .. }) if from == "c1"));
        assert!(matches!(down_rx.recv().await, Some(Downward::Frame { source: FrameSource::Parent, .. })));
        assert!(matches!(down_rx.recv().await, Some(Downward::Frame { source: FrameSource::Controller, .. })));
        assert!(matches!(down_rx.recv().await, Some(Downward::ParentConnected)));
    }

    #[tokio::test]
    async fn test_run_loops_stop_on_cancel() {
        let table = Arc::new(RoutingTable::new());
        let children = Arc::new(RecordingChildren::default());
        let dispatcher = Arc::new(Dispatcher::new("root", table, children.clone()));
        let ((up_tx, up_rx), (_down_tx, down_rx)) = queues();
        let cancel = CancellationToken::new();

        let up = tokio::spawn(Arc::clone(&dispatcher).run_upward(up_rx, cancel.clone()));
        let down = tokio::spawn(Arc::clone(&dispatcher).run_downward(down_rx, cancel.clone()));

        up_tx
            .send(Upward::ChildConnected(ClusterRegistration::new("c1", "c1", "a:1", "root")))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        up.await.unwrap();
        down.await.unwrap();

        let broadcasts = children.broadcasts.lock();
        assert_eq!(broadcasts.len(), 1);
        let view: RouterView = broadcasts[0].payload().unwrap();
        assert!(view.children.is_empty());
    }
}
