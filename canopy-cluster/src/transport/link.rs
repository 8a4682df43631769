//! Duplex link over one WebSocket connection
//!
//! Writes are serialized through a per-link mutex and bounded by a write
//! deadline. Each live link also owns one outbound worker that drains a
//! bounded queue in order and keeps the connection alive with pings.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::metrics;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// WebSocket stream type used on both sides of a tunnel
pub type TunnelStream = WebSocketStream<TcpStream>;

/// Timeouts and queue sizing shared by every link of a node
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub outbound_queue: usize,
}

impl From<&ClusterConfig> for LinkOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            write_timeout: config.write_timeout(),
            read_timeout: config.read_timeout(),
            ping_interval: config.ping_interval(),
            outbound_queue: config.outbound_queue,
        }
    }
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions::from(&ClusterConfig::default())
    }
}

/// Named send/receive endpoint wrapping one connection
pub struct DuplexLink {
    name: String,
    sink: Mutex<SplitSink<TunnelStream, Message>>,
    stream: Mutex<SplitStream<TunnelStream>>,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl DuplexLink {
    pub fn new(name: impl Into<String>, ws: TunnelStream, options: &LinkOptions) -> Self {
        let (sink, stream) = ws.split();
        Self {
            name: name.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            write_timeout: options.write_timeout,
            read_timeout: options.read_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one frame, failing if the write deadline passes
    pub async fn write_message(&self, frame: Vec<u8>) -> Result<()> {
        let len = frame.len();
        self.send(Message::Binary(frame)).await?;
        metrics::record_frame_sent(&self.name, len);
        Ok(())
    }

    /// Send a keepalive ping
    pub async fn ping(&self) -> Result<()> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.send(message)).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout(format!(
                "write to {} exceeded {:?}",
                self.name, self.write_timeout
            ))),
        }
    }

    /// Block until one data frame arrives.
    ///
    /// Control frames are consumed transparently; each of them resets the
    /// read deadline.
    pub async fn read_message(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| {
                    ClusterError::Timeout(format!(
                        "no frame from {} within {:?}",
                        self.name, self.read_timeout
                    ))
                })?;

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ClusterError::Closed(format!("{} closed the link", self.name)))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Close the underlying stream. A second call may return an error.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await.map_err(ClusterError::from)
    }
}

/// A live link together with the sender side of its outbound queue
#[derive(Clone)]
pub struct LinkHandle {
    link: Arc<DuplexLink>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl LinkHandle {
    /// Start the outbound worker for `link`
    pub fn spawn(link: Arc<DuplexLink>, options: &LinkOptions) -> Self {
        let (outbound, rx) = mpsc::channel(options.outbound_queue.max(1));
        tokio::spawn(outbound_worker(Arc::clone(&link), rx, options.ping_interval));
        Self { link, outbound }
    }

    pub fn link(&self) -> &Arc<DuplexLink> {
        &self.link
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    /// Queue a frame without waiting; a full queue is reported, not awaited
    pub fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| {
            let err = match e {
                mpsc::error::TrySendError::Full(_) => ClusterError::QueueFull(self.name().to_string()),
                mpsc::error::TrySendError::Closed(_) => {
                    ClusterError::Closed(format!("outbound worker for {} stopped", self.name()))
                }
            };
            metrics::record_send_error(self.name(), err.error_type());
            err
        })
    }

    /// Whether the worker behind this handle is still draining
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Drain frames in order until every sender is dropped or the link fails
async fn outbound_worker(link: Arc<DuplexLink>, mut rx: mpsc::Receiver<Vec<u8>>, ping_interval: Duration) {
    let mut keepalive = tokio::time::interval(ping_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = link.write_message(frame).await {
                    warn!(peer = %link.name(), error = %e, "Link write failed");
                    metrics::record_send_error(link.name(), e.error_type());
                    if e.is_link_fatal() {
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = link.ping().await {
                    warn!(peer = %link.name(), error = %e, "Keepalive ping failed");
                    break;
                }
            }
        }
    }

    // Closing unblocks the reader, which then runs the close path
    rx.close();
    if let Err(e) = link.close().await {
        debug!(peer = %link.name(), error = %e, "Link already closed");
    }
    debug!(peer = %link.name(), "Outbound worker stopped");
}
