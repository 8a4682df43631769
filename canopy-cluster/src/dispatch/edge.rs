//! Downward half: traffic from the parent, the controller and the store

use super::{Downward, Dispatcher};
use crate::metrics::{self, HandlerTimer};
use crate::selector::Selector;
use crate::transport::FrameSource;
use crate::types::{BackendRequest, Command, ControlMessage, Destination, ResponseStatus, RouterView, SubtreeReport};
use tracing::{debug, info, warn};

impl Dispatcher {
    pub async fn handle_downward(&self, event: Downward) {
        match event {
            Downward::Frame { source, frame } => {
                let message = match ControlMessage::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(source = %source, error = %e, "Dropping undecodable frame");
                        metrics::record_decode_error(source.kind());
                        return;
                    }
                };
                match source {
                    FrameSource::Parent => self.handle_parent_message(message).await,
                    FrameSource::Controller => self.handle_local_request(message).await,
                    FrameSource::Child(child) => {
                        warn!(child = %child, "Child frame on the downward queue");
                    }
                }
            }
            Downward::Local(message) => self.handle_local_request(message).await,
            Downward::ParentConnected => self.report_subtree(),
            Downward::ParentDisconnected => {
                info!(cluster = %self.name, "Parent link down, holding upward traffic until reconnect");
            }
        }
    }

    async fn handle_parent_message(&self, message: ControlMessage) {
        match &message.destination {
            Destination::Router => self.apply_gossip(&message),
            Destination::Register | Destination::Deregister | Destination::Subtree => {
                debug!(destination = %message.destination, "Ignoring route update sent by the parent");
                metrics::record_dispatch(message.destination.as_str(), "ignored");
            }
            Destination::Backend(_) => match message.command {
                Command::Request => {
                    self.fan_out(&message);
                    self.execute_if_selected(&message).await;
                }
                Command::Response => {
                    debug!(id = %message.id, "Ignoring response sent by the parent");
                    metrics::record_dispatch(message.destination.as_str(), "ignored");
                }
            },
        }
    }

    /// Requests from the controller or the store start their journey here
    async fn handle_local_request(&self, mut message: ControlMessage) {
        if message.destination.is_routing() || message.command == Command::Response {
            warn!(
                id = %message.id,
                destination = %message.destination,
                "Local messages must be backend requests"
            );
            return;
        }
        if message.parent.is_empty() {
            message.parent = self.name.clone();
        }
        debug!(id = %message.id, selector = %message.selector, "Dispatching local request");
        self.fan_out(&message);
        self.execute_if_selected(&message).await;
    }

    /// Adopt the parent's view and pass our own one hop further down if it changed
    fn apply_gossip(&self, message: &ControlMessage) {
        let view: RouterView = match message.payload() {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "Dropping malformed routing view");
                metrics::record_decode_error("router");
                return;
            }
        };

        // both sides must be applied, no short-circuit
        let changed = self.table.update_neighbor(&view) | self.table.update_parent_neighbor(&view);
        if changed {
            debug!(
                neighbors = view.children.len(),
                parent_neighbors = view.neighbors.len(),
                "Routing view changed"
            );
            self.broadcast_view();
            metrics::record_dispatch("router", "applied");
        } else {
            metrics::record_dispatch("router", "unchanged");
        }
    }

    async fn execute_if_selected(&self, message: &ControlMessage) {
        if !Selector::new(&message.selector).has(&self.name) {
            return;
        }
        let status = self.execute(message).await;
        let response = message.clone().into_response(&self.name, status);

        if response.parent == self.name {
            self.complete_response(response).await;
        } else {
            match self.send_upward(&response) {
                Ok(()) => debug!(id = %response.id, "Response sent upward"),
                Err(e) => warn!(id = %response.id, error = %e, "Failed to send response upward"),
            }
        }
    }

    /// Run the backend handler named by the destination tag
    pub(crate) async fn execute(&self, message: &ControlMessage) -> ResponseStatus {
        let tag = message.destination.as_str();
        let Some(handler) = self.handlers.get(tag) else {
            warn!(id = %message.id, destination = %tag, "No handler for destination");
            metrics::record_dispatch(tag, "no_handler");
            return ResponseStatus::failure(format!("no handler for destination {}", tag));
        };

        let request: BackendRequest = match message.payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(id = %message.id, error = %e, "Invalid backend request");
                return ResponseStatus::failure(format!("invalid backend request: {}", e));
            }
        };

        let timer = HandlerTimer::new(tag);
        let status = match handler.handle(request).await {
            Ok(response) => ResponseStatus::from(response),
            Err(e) => {
                warn!(id = %message.id, handler = handler.name(), error = %e, "Backend handler failed");
                ResponseStatus::failure(e.to_string())
            }
        };
        timer.finish(status.code);
        debug!(id = %message.id, handler = handler.name(), code = status.code, "Request executed");
        status
    }

    /// Tell a (new) parent everything reachable below us
    fn report_subtree(&self) {
        let clusters = self.table.subtree_clusters();
        if clusters.is_empty() {
            return;
        }
        let report = SubtreeReport {
            clusters: clusters.into_iter().collect(),
        };
        let message = match ControlMessage::routing(Destination::Subtree, &report) {
            Ok(mut message) => {
                message.parent = self.name.clone();
                message
            }
            Err(e) => {
                warn!(error = %e, "Cannot encode subtree report");
                return;
            }
        };
        match self.send_upward(&message) {
            Ok(()) => info!(clusters = report.clusters.len(), "Subtree reported to parent"),
            Err(e) => warn!(error = %e, "Failed to report subtree"),
        }
    }
}
