//! One running cluster node
//!
//! Binds the listeners, builds the routing table, transports and dispatcher
//! around one pair of queues, and owns every long-lived task. All tasks
//! share a cancellation token; [`ClusterNode::shutdown`] fires it and waits
//! for them within the configured grace period.

use crate::config::ClusterConfig;
use crate::dispatch::{self, Dispatcher, Downward, LinkEvents};
use crate::error::{ClusterError, Result};
use crate::handler::HandlerRegistry;
use crate::routing::{RoutingSnapshot, RoutingTable};
use crate::store::RecordStore;
use crate::transport::{CloudTransport, ControllerTransport, EdgeIdentity, EdgeTransport, LinkOptions};
use crate::types::{ControlMessage, Destination};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ClusterNode {
    config: ClusterConfig,
    table: Arc<RoutingTable>,
    cloud: Arc<CloudTransport>,
    edge: Option<Arc<EdgeTransport>>,
    controller: Option<Arc<ControllerTransport>>,
    store: Option<Arc<dyn RecordStore>>,
    downward: mpsc::UnboundedSender<Downward>,
    local_addr: SocketAddr,
    controller_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Validate `config`, bind listeners and spawn every task
    pub async fn start(
        config: ClusterConfig,
        handlers: HandlerRegistry,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.is_root() && store.is_none() {
            return Err(ClusterError::Config(format!(
                "root cluster {} requires a record store",
                config.name
            )));
        }

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| ClusterError::Transport(format!("Failed to bind {}: {}", config.listen_addr, e)))?;
        let local_addr = listener.local_addr()?;
        let controller_listener = match &config.controller_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| ClusterError::Transport(format!("Failed to bind controller {}: {}", addr, e)))?,
            ),
            None => None,
        };
        let controller_addr = match &controller_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let options = LinkOptions::from(&config);
        let table = Arc::new(RoutingTable::new());
        let ((up_tx, up_rx), (down_tx, down_rx)) = dispatch::queues();
        let events = Arc::new(LinkEvents::new(
            config.name.clone(),
            Arc::clone(&table),
            up_tx,
            down_tx.clone(),
        ));

        let cloud = Arc::new(CloudTransport::new(
            config.name.clone(),
            options,
            events.clone(),
            events.clone(),
            events.clone(),
        ));
        let controller = controller_listener
            .as_ref()
            .map(|_| Arc::new(ControllerTransport::new(options, events.clone())));
        let edge = config.parent_addr.as_ref().map(|parent| {
            let identity = EdgeIdentity {
                name: config.name.clone(),
                display_name: config.display_name().to_string(),
                advertise_addr: config
                    .advertise_addr
                    .clone()
                    .unwrap_or_else(|| local_addr.to_string()),
            };
            Arc::new(EdgeTransport::new(
                identity,
                parent.clone(),
                Arc::clone(&table),
                options,
                config.connect_timeout(),
                config.reconnect_backoff(),
                config.failover_cooldown(),
                events.clone(),
                events.clone(),
            ))
        });

        let mut dispatcher = Dispatcher::new(config.name.clone(), Arc::clone(&table), cloud.clone()).with_handlers(handlers);
        if let Some(edge) = &edge {
            dispatcher = dispatcher.with_uplink(edge.clone());
        }
        if let Some(controller) = &controller {
            dispatcher = dispatcher.with_controller(controller.clone());
        }
        if let Some(store) = &store {
            dispatcher = dispatcher.with_store(Arc::clone(store), config.namespace.clone(), config.merge_retries);
        }
        let dispatcher = Arc::new(dispatcher);

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(&dispatcher).run_upward(up_rx, cancel.clone())));
        tasks.push(tokio::spawn(Arc::clone(&dispatcher).run_downward(down_rx, cancel.clone())));
        tasks.push(tokio::spawn(Arc::clone(&cloud).serve(
            listener,
            cancel.clone(),
            config.shutdown_grace(),
        )));
        if let (Some(controller), Some(listener)) = (&controller, controller_listener) {
            tasks.push(tokio::spawn(Arc::clone(controller).serve(listener, cancel.clone())));
        }
        if let Some(edge) = &edge {
            tasks.push(tokio::spawn(Arc::clone(edge).run(cancel.clone())));
        }
        if let Some(store) = &store {
            tasks.push(tokio::spawn(dispatch::run_store_watch(
                Arc::clone(store),
                config.namespace.clone(),
                down_tx.clone(),
                cancel.clone(),
            )));
        }

        info!(
            cluster = %config.name,
            listen = %local_addr,
            parent = ?config.parent_addr,
            controller = ?controller_addr,
            root = config.is_root(),
            "Cluster node started"
        );

        Ok(Self {
            config,
            table,
            cloud,
            edge,
            controller,
            store,
            downward: down_tx,
            local_addr,
            controller_addr,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Address the child listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn controller_addr(&self) -> Option<SocketAddr> {
        self.controller_addr
    }

    pub fn is_root(&self) -> bool {
        self.edge.is_none()
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn routing_snapshot(&self) -> RoutingSnapshot {
        self.table.snapshot()
    }

    pub fn store(&self) -> Option<&Arc<dyn RecordStore>> {
        self.store.as_ref()
    }

    /// Children with a live link
    pub fn connected_children(&self) -> Vec<String> {
        self.cloud.connected()
    }

    pub fn is_parent_connected(&self) -> bool {
        self.edge.as_ref().is_some_and(|edge| edge.is_connected())
    }

    /// Parent dialer, `None` at the root
    pub fn edge(&self) -> Option<&Arc<EdgeTransport>> {
        self.edge.as_ref()
    }

    /// Current dial target, `None` at the root
    pub fn parent_target(&self) -> Option<String> {
        self.edge.as_ref().map(|edge| edge.target())
    }

    pub fn is_controller_connected(&self) -> bool {
        self.controller.as_ref().is_some_and(|c| c.is_connected())
    }

    /// Dispatch a backend request from this node.
    ///
    /// With a record store the request is persisted first and dispatched by
    /// the store watch, so responses can be merged into it.
    pub async fn submit(
        &self,
        selector: impl Into<String>,
        destination: Destination,
        body: impl Into<String>,
    ) -> Result<ControlMessage> {
        if destination.is_routing() {
            return Err(ClusterError::Config(format!(
                "destination {} is reserved for routing",
                destination
            )));
        }
        let mut message = ControlMessage::request(destination, selector, body);
        message.parent = self.config.name.clone();

        if let Some(store) = &self.store {
            let record = store.create_task(&self.config.namespace, message).await?;
            return Ok(record.message);
        }
        self.downward
            .send(Downward::Local(message.clone()))
            .map_err(|_| ClusterError::Closed("dispatcher stopped".into()))?;
        Ok(message)
    }

    /// Stop every task, waiting at most the configured grace period beyond
    /// the listener drain
    pub async fn shutdown(&self) {
        info!(cluster = %self.config.name, "Shutting down cluster node");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = self.config.shutdown_grace() * 2;
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Node task ended abnormally");
                    }
                }
            }
            Err(_) => warn!(grace = ?grace, "Node tasks still running after grace period"),
        }
        info!(cluster = %self.config.name, "Cluster node stopped");
    }
}
