//! Echo hook for connectivity and throughput checks.

use crate::runtime::{ConnectionId, Handler, Hub, Transport};
use tracing::debug;

/// Sends every message straight back to its sender.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl<T: Transport> Handler<T> for EchoHandler {
    fn on_message(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId, message: &[u8]) {
        if let Err(e) = hub.send_to(id, message) {
            debug!(conn = %id, error = %e, "Echo failed");
        }
    }

    fn heartbeat(&self) -> Vec<u8> {
        super::ping_envelope()
    }
}
