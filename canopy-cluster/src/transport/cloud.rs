//! Listener side of the tunnel: accepts child links
//!
//! Every child dials `/tunnel/{name}` and announces its listen address and
//! display name in headers. The name validator runs inside the upgrade
//! callback, so a refused name is answered with `409 Conflict` before the
//! WebSocket exists.

use super::link::{DuplexLink, LinkHandle, LinkOptions};
use super::{
    ChildLinks, ConnectObserver, FrameSource, InboundHandler, NameValidator, HEADER_DISPLAY_NAME,
    HEADER_LISTEN_ADDR, TUNNEL_PATH_PREFIX,
};
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::types::ClusterRegistration;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connected child links keyed by declared name
pub struct CloudTransport {
    /// Name of this node, recorded as the parent of every accepted child
    name: String,
    links: RwLock<HashMap<String, LinkHandle>>,
    options: LinkOptions,
    validator: Arc<dyn NameValidator>,
    observer: Arc<dyn ConnectObserver>,
    inbound: Arc<dyn InboundHandler>,
}

impl CloudTransport {
    pub fn new(
        name: impl Into<String>,
        options: LinkOptions,
        validator: Arc<dyn NameValidator>,
        observer: Arc<dyn ConnectObserver>,
        inbound: Arc<dyn InboundHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            links: RwLock::new(HashMap::new()),
            options,
            validator,
            observer,
            inbound,
        }
    }

    /// Accept child links until `cancel` fires, then drain with a grace period
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken, grace: Duration) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, cluster = %self.name, "Accepting child links");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let transport = Arc::clone(&self);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.accept_link(tcp, peer, cancel).await {
                                debug!(peer = %peer, error = %e, "Child link not established");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        self.shutdown(grace).await;
    }

    /// Upgrade one TCP connection and run its read loop to completion
    pub async fn accept_link(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let mut accepted: Option<ClusterRegistration> = None;

        let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            let registration = match parse_child_request(req, &self.name) {
                Ok(registration) => registration,
                Err((status, reason)) => {
                    metrics::record_link_rejected("bad_request");
                    return Err(reject(status, reason));
                }
            };
            if !self.validator.validate(&registration) {
                metrics::record_link_rejected("duplicate_name");
                return Err(reject(
                    StatusCode::CONFLICT,
                    format!("cluster name {} is already connected", registration.name),
                ));
            }
            accepted = Some(registration);
            Ok(resp)
        };

        let handshake = tokio_tungstenite::accept_hdr_async(tcp, callback).await;

        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                // The validator may already have admitted the name
                if let Some(mut registration) = accepted {
                    registration.timestamp = Utc::now();
                    self.observer.on_disconnect(&registration);
                }
                return Err(e.into());
            }
        };
        let Some(registration) = accepted else {
            return Err(ClusterError::Internal(format!("upgrade from {} completed without identity", peer)));
        };

        let link = Arc::new(DuplexLink::new(registration.name.clone(), ws, &self.options));

        // Load-or-store: an existing link under this name is kept
        let handle = {
            let mut links = self.links.write();
            if links.contains_key(&registration.name) {
                None
            } else {
                let handle = LinkHandle::spawn(Arc::clone(&link), &self.options);
                links.insert(registration.name.clone(), handle.clone());
                metrics::set_connected_children(links.len());
                Some(handle)
            }
        };
        let Some(handle) = handle else {
            warn!(child = %registration.name, peer = %peer, "Duplicate child link, closing the new one");
            metrics::record_link_rejected("duplicate_link");
            if let Err(e) = link.close().await {
                debug!(child = %registration.name, error = %e, "Close of duplicate link");
            }
            // undo the admission the validator already granted
            let mut registration = registration;
            registration.timestamp = Utc::now();
            self.observer.on_disconnect(&registration);
            return Err(ClusterError::DuplicateName(registration.name));
        };

        info!(
            child = %registration.name,
            display_name = %registration.display_name,
            listen_addr = %registration.listen_addr,
            peer = %peer,
            "Child link accepted"
        );
        metrics::record_link_accepted(&registration.name);
        self.observer.on_connect(&registration);

        self.read_loop(&handle, &cancel).await;

        // Map first, then observers, so the name is free before the table forgets it
        {
            let mut links = self.links.write();
            let ours = links
                .get(&registration.name)
                .is_some_and(|current| Arc::ptr_eq(current.link(), handle.link()));
            if ours {
                links.remove(&registration.name);
            }
            metrics::set_connected_children(links.len());
        }
        drop(handle);
        if let Err(e) = link.close().await {
            debug!(child = %registration.name, error = %e, "Close after read loop");
        }
        metrics::record_link_closed(&registration.name);

        let mut registration = registration;
        registration.timestamp = Utc::now();
        info!(child = %registration.name, "Child link closed");
        self.observer.on_disconnect(&registration);
        Ok(())
    }

    async fn read_loop(&self, handle: &LinkHandle, cancel: &CancellationToken) {
        let link = handle.link();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = link.read_message() => match read {
                    Ok(frame) => {
                        metrics::record_frame_received("child");
                        self.inbound.on_frame(FrameSource::Child(link.name().to_string()), frame);
                    }
                    Err(e) => {
                        debug!(child = %link.name(), error = %e, "Child read loop ended");
                        break;
                    }
                },
            }
        }
    }

    /// Names of the children with a live link
    pub fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.links.read().contains_key(name)
    }

    /// Wait for read loops to release their links, at most `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.links.read().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                let remaining: Vec<LinkHandle> = self.links.write().drain().map(|(_, h)| h).collect();
                warn!(count = remaining.len(), "Grace period elapsed, closing child links");
                for handle in remaining {
                    let _ = handle.link().close().await;
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        metrics::set_connected_children(0);
        info!(cluster = %self.name, "Child listener stopped");
    }
}

impl ChildLinks for CloudTransport {
    fn send(&self, child: &str, frame: Vec<u8>) -> Result<()> {
        let handle = self
            .links
            .read()
            .get(child)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("no link to child {}", child)))?;
        handle.enqueue(frame)
    }

    fn broadcast(&self, frame: &[u8]) {
        let handles: Vec<LinkHandle> = self.links.read().values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.enqueue(frame.to_vec()) {
                warn!(child = %handle.name(), error = %e, "Broadcast to child failed");
            }
        }
    }
}

/// Extract the child's identity from an upgrade request
pub(crate) fn parse_child_request(
    req: &Request,
    parent: &str,
) -> std::result::Result<ClusterRegistration, (StatusCode, String)> {
    let name = req
        .uri()
        .path()
        .strip_prefix(TUNNEL_PATH_PREFIX)
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown path {}", req.uri().path())))?;

    let header = |key: &str| {
        req.headers()
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("missing header {}", key)))
    };
    let listen_addr = header(HEADER_LISTEN_ADDR)?;
    let display_name = header(HEADER_DISPLAY_NAME)?;

    Ok(ClusterRegistration::new(name, display_name, listen_addr, parent))
}

pub(crate) fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}
