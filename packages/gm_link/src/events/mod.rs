//! Event decoding and dispatch.

pub mod dispatcher;
pub mod protocol;

pub use dispatcher::{EventDispatcher, Listener, Route, listener_fn};
pub use protocol::{EventKind, ServerEvent};

use tracing::warn;

use crate::stream::frame::Envelope;

/// Decode an envelope, logging and dropping it when the payload does not
/// match the event's shape.
pub fn decode_or_drop(envelope: Envelope) -> Option<ServerEvent> {
    let name = envelope.event.clone();
    match ServerEvent::decode(envelope) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event = %name, error = %e, "malformed event payload, frame dropped");
            None
        }
    }
}
