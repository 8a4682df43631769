//! Single controller link
//!
//! A controller dials `/controller` without identity headers. At most one
//! controller is connected at a time; a second upgrade gets `409 Conflict`.

use super::cloud::reject;
use super::link::{DuplexLink, LinkHandle, LinkOptions};
use super::{FrameSource, InboundHandler, LinkSender, CONTROLLER_PATH};
use crate::error::{ClusterError, Result};
use crate::metrics;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ControllerTransport {
    slot: Mutex<Option<LinkHandle>>,
    options: LinkOptions,
    inbound: Arc<dyn InboundHandler>,
}

impl ControllerTransport {
    pub fn new(options: LinkOptions, inbound: Arc<dyn InboundHandler>) -> Self {
        Self {
            slot: Mutex::new(None),
            options,
            inbound,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Accepting controller link");
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
                                debug!(peer = %peer, error = %e, "Controller link not established");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept controller connection"),
                },
            }
        }

        let current = self.slot.lock().take();
        if let Some(handle) = current {
            let _ = handle.link().close().await;
        }
        info!("Controller listener stopped");
    }

    async fn accept_link(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            if req.uri().path() != CONTROLLER_PATH {
                return Err(reject(StatusCode::NOT_FOUND, format!("unknown path {}", req.uri().path())));
            }
            if self.is_connected() {
                metrics::record_link_rejected("controller_busy");
                return Err(reject(StatusCode::CONFLICT, "a controller is already connected".into()));
            }
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await?;

        let link = Arc::new(DuplexLink::new("controller", ws, &self.options));
        let handle = {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                None
            } else {
                let handle = LinkHandle::spawn(Arc::clone(&link), &self.options);
                *slot = Some(handle.clone());
                Some(handle)
            }
        };
        let Some(handle) = handle else {
            metrics::record_link_rejected("controller_busy");
            let _ = link.close().await;
            return Err(ClusterError::AlreadyExists("controller link".into()));
        };
        info!(peer = %peer, "Controller connected");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = link.read_message() => match read {
                    Ok(frame) => {
                        metrics::record_frame_received("controller");
                        self.inbound.on_frame(FrameSource::Controller, frame);
                    }
                    Err(e) => {
                        debug!(error = %e, "Controller read loop ended");
                        break;
                    }
                },
            }
        }

        {
            let mut slot = self.slot.lock();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current.link(), handle.link())) {
                *slot = None;
            }
        }
        let _ = link.close().await;
        info!(peer = %peer, "Controller disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl LinkSender for ControllerTransport {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        let handle = self
            .slot
            .lock()
            .clone()
            .ok_or_else(|| ClusterError::NotConnected("no controller link".into()))?;
        handle.enqueue(frame)
    }
}
