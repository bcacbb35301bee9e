//! Where dispatched events go.

use {ferrule_protocol::Event, tokio::sync::mpsc, tracing::trace};

/// Receives gateway dispatch events, one at a time, in wire order.
///
/// Called from the connection's listener task; implementations must not
/// block.
pub trait EventSink: Send + Sync + 'static {
    fn dispatch(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn dispatch(&self, event: Event) {
        if let Err(err) = self.send(event) {
            trace!(event = %err.0.name, "event receiver dropped");
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl EventSink for Discard {
    fn dispatch(&self, event: Event) {
        trace!(event = %event.name, "discarding event");
    }
}
