//! Federation observability metrics
//!
//! Provides Prometheus-compatible metrics for tunnel and dispatch operations:
//! - Link lifecycle (accepted/rejected/closed, connected children)
//! - Frame traffic per direction
//! - Parent reconnects and failovers
//! - Dispatch decisions and fan-out width
//! - Backend handler latency and response merges

use std::time::{Duration, Instant};

/// Record an accepted child link
pub fn record_link_accepted(child: &str) {
    metrics::counter!(
        "canopy_links_accepted_total",
        "child" => child.to_string(),
    )
    .increment(1);
}

/// Record a refused link upgrade
pub fn record_link_rejected(reason: &str) {
    metrics::counter!(
        "canopy_links_rejected_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record a closed child link
pub fn record_link_closed(child: &str) {
    metrics::counter!(
        "canopy_links_closed_total",
        "child" => child.to_string(),
    )
    .increment(1);
}

/// Update the number of connected children
pub fn set_connected_children(count: usize) {
    metrics::gauge!("canopy_connected_children").set(count as f64);
}

/// Record a frame read from a link
pub fn record_frame_received(source: &str) {
    metrics::counter!(
        "canopy_frames_received_total",
        "source" => source.to_string(),
    )
    .increment(1);
}

/// Record a frame written to a link
pub fn record_frame_sent(peer: &str, bytes: usize) {
    metrics::counter!(
        "canopy_frames_sent_total",
        "peer" => peer.to_string(),
    )
    .increment(1);
    metrics::counter!("canopy_bytes_sent_total").increment(bytes as u64);
}

/// Record a failed send or enqueue
pub fn record_send_error(peer: &str, error_type: &str) {
    metrics::counter!(
        "canopy_send_errors_total",
        "peer" => peer.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a frame that could not be decoded
pub fn record_decode_error(source: &str) {
    metrics::counter!(
        "canopy_decode_errors_total",
        "source" => source.to_string(),
    )
    .increment(1);
}

/// Record an attempt to (re)connect to the parent
pub fn record_reconnect_attempt(target: &str) {
    metrics::counter!(
        "canopy_parent_reconnect_attempts_total",
        "target" => target.to_string(),
    )
    .increment(1);
}

/// Record a switch of the parent target address
pub fn record_failover(target: &str) {
    metrics::counter!(
        "canopy_parent_failovers_total",
        "target" => target.to_string(),
    )
    .increment(1);
}

/// Update parent connectivity
pub fn set_parent_connected(connected: bool) {
    metrics::gauge!("canopy_parent_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record how a control message was handled
pub fn record_dispatch(destination: &str, decision: &str) {
    metrics::counter!(
        "canopy_dispatch_total",
        "destination" => destination.to_string(),
        "decision" => decision.to_string(),
    )
    .increment(1);
}

/// Record the number of children a request was fanned out to
pub fn record_fan_out(ports: usize) {
    metrics::histogram!("canopy_fan_out_width").record(ports as f64);
}

/// Record a response merge outcome (applied, stale, conflict, unknown)
pub fn record_merge(outcome: &str) {
    metrics::counter!(
        "canopy_status_merges_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record routing table size
pub fn set_subtree_size(count: usize) {
    metrics::gauge!("canopy_subtree_clusters").set(count as f64);
}

fn record_handler_duration(destination: &str, duration: Duration) {
    metrics::histogram!(
        "canopy_handler_duration_seconds",
        "destination" => destination.to_string(),
    )
    .record(duration.as_secs_f64());
}

fn record_handler_result(destination: &str, status: &str) {
    metrics::counter!(
        "canopy_handler_total",
        "destination" => destination.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Timer for backend handler invocations
pub struct HandlerTimer {
    destination: String,
    start: Instant,
}

impl HandlerTimer {
    /// Start timing a handler call
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            start: Instant::now(),
        }
    }

    /// Record completion with the responder status code
    pub fn finish(self, code: u16) {
        record_handler_duration(&self.destination, self.start.elapsed());
        let status = if (200..300).contains(&code) { "ok" } else { "error" };
        record_handler_result(&self.destination, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        // Without an installed recorder every call is a no-op
        record_link_accepted("c1");
        record_link_rejected("duplicate_name");
        set_connected_children(3);
        record_frame_sent("c1", 128);
        record_dispatch("router", "applied");
        record_fan_out(2);
        record_merge("stale");
    }

    #[test]
    fn test_handler_timer() {
        let timer = HandlerTimer::new("http");
        std::thread::sleep(Duration::from_millis(1));
        timer.finish(200);

        HandlerTimer::new("rest").finish(500);
    }
}
