//! Dialer side of the tunnel: keeps this node attached to a parent
//!
//! The target address starts as the configured parent and may move to one
//! of the parent's siblings (learned through gossip) while the parent is
//! unreachable. Addresses that just failed sit in a [`FailoverSet`] until
//! they cool down; the set is emptied on every successful connect.

use super::failover::FailoverSet;
use super::link::{DuplexLink, LinkHandle, LinkOptions};
use super::{FrameSource, InboundHandler, LinkSender, ParentObserver, HEADER_DISPLAY_NAME, HEADER_LISTEN_ADDR, TUNNEL_PATH_PREFIX};
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::routing::RoutingTable;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity and timing used when dialing the parent
#[derive(Debug, Clone)]
pub struct EdgeIdentity {
    pub name: String,
    pub display_name: String,
    /// Listen address announced to the parent
    pub advertise_addr: String,
}

pub struct EdgeTransport {
    identity: EdgeIdentity,
    target: Mutex<String>,
    failover: Mutex<FailoverSet>,
    current: RwLock<Option<LinkHandle>>,
    table: Arc<RoutingTable>,
    options: LinkOptions,
    connect_timeout: Duration,
    backoff: Duration,
    inbound: Arc<dyn InboundHandler>,
    observer: Arc<dyn ParentObserver>,
}

impl EdgeTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: EdgeIdentity,
        parent_addr: impl Into<String>,
        table: Arc<RoutingTable>,
        options: LinkOptions,
        connect_timeout: Duration,
        backoff: Duration,
        failover_cooldown: Duration,
        inbound: Arc<dyn InboundHandler>,
        observer: Arc<dyn ParentObserver>,
    ) -> Self {
        Self {
            identity,
            target: Mutex::new(parent_addr.into()),
            failover: Mutex::new(FailoverSet::new(failover_cooldown)),
            current: RwLock::new(None),
            table,
            options,
            connect_timeout,
            backoff,
            inbound,
            observer,
        }
    }

    /// Address the next connect attempt dials
    pub fn target(&self) -> String {
        self.target.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().as_ref().is_some_and(LinkHandle::is_open)
    }

    /// Number of addresses currently cooling down
    pub fn failover_len(&self) -> usize {
        self.failover.lock().len()
    }

    /// Whether `addr` is currently cooling down
    pub fn in_failover(&self, addr: &str) -> bool {
        self.failover.lock().find(addr)
    }

    /// Dial the current target once and install the link on success
    pub async fn connect(&self) -> Result<Arc<DuplexLink>> {
        let target = self.target();
        metrics::record_reconnect_attempt(&target);

        let url = format!("ws://{}{}{}", target, TUNNEL_PATH_PREFIX, self.identity.name);
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(HEADER_LISTEN_ADDR, header_value(&self.identity.advertise_addr)?);
        headers.insert(HEADER_DISPLAY_NAME, header_value(&self.identity.display_name)?);

        let dial = async {
            let tcp = TcpStream::connect(target.as_str()).await?;
            tcp.set_nodelay(true)?;
            let (ws, _) = tokio_tungstenite::client_async(request, tcp).await?;
            Ok::<_, ClusterError>(ws)
        };
        let ws = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| ClusterError::Timeout(format!("connect to {} exceeded {:?}", target, self.connect_timeout)))??;

        let link = Arc::new(DuplexLink::new(target.clone(), ws, &self.options));
        let handle = LinkHandle::spawn(Arc::clone(&link), &self.options);
        *self.current.write() = Some(handle);

        info!(parent = %target, cluster = %self.identity.name, "Connected to parent");
        metrics::set_parent_connected(true);
        self.observer.on_parent_connected();
        Ok(link)
    }

    /// Keep a parent link alive until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if !self.reconnect(&cancel).await {
                break;
            }
            let Some(handle) = self.current.read().clone() else {
                continue;
            };
            let link = Arc::clone(handle.link());
            drop(handle);

            let cancelled = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break true,
                    read = link.read_message() => match read {
                        Ok(frame) => {
                            metrics::record_frame_received("parent");
                            self.inbound.on_frame(FrameSource::Parent, frame);
                        }
                        Err(e) => {
                            warn!(parent = %link.name(), error = %e, "Parent link lost");
                            break false;
                        }
                    },
                }
            };

            self.current.write().take();
            metrics::set_parent_connected(false);
            self.observer.on_parent_disconnected();
            if let Err(e) = link.close().await {
                debug!(parent = %link.name(), error = %e, "Close after read loop");
            }
            if cancelled {
                break;
            }
        }
        info!(cluster = %self.identity.name, "Parent dialer stopped");
    }

    /// Retry until connected; returns false if cancelled first
    pub async fn reconnect(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.connect().await {
                Ok(_) => {
                    self.failover.lock().clear();
                    return true;
                }
                Err(e) => {
                    warn!(parent = %self.target(), error = %e, "Parent connect failed");
                }
            }

            if self.choose_parent_neighbor() {
                continue;
            }

            let target = self.target();
            let popped = {
                let mut failover = self.failover.lock();
                failover.push(&target);
                failover.pop()
            };
            if let Some(addr) = popped.filter(|addr| *addr != target) {
                info!(from = %target, to = %addr, "Retrying cooled-down parent address");
                metrics::record_failover(&addr);
                *self.target.lock() = addr;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    /// Switch the target to a parent neighbor that has not failed recently.
    ///
    /// The abandoned target enters the failover set. Returns whether the
    /// target changed.
    pub fn choose_parent_neighbor(&self) -> bool {
        let mut target = self.target.lock();
        let mut failover = self.failover.lock();

        let candidate = self
            .table
            .parent_neighbors()
            .into_values()
            .find(|addr| *addr != *target && *addr != self.identity.advertise_addr && !failover.find(addr));

        let Some(addr) = candidate else {
            return false;
        };
        failover.push(&target);
        info!(from = %*target, to = %addr, "Failing over to parent neighbor");
        metrics::record_failover(&addr);
        *target = addr;
        true
    }
}

impl LinkSender for EdgeTransport {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        let handle = self
            .current
            .read()
            .clone()
            .ok_or_else(|| ClusterError::NotConnected("no parent link".into()))?;
        handle.enqueue(frame)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ClusterError::Config(format!("invalid header value '{}': {}", value, e)))
}
