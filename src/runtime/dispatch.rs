//! Dispatch hook interface.
//!
//! A [`Handler`] receives decoded messages and lifecycle events from the
//! event loop. It talks back to peers through a [`Hub`], which borrows the
//! loop's registry for the duration of one callback.

use crate::error::{FrameError, RegistryError, SendError, TransportError};
use crate::runtime::connection::{ConnectionId, ConnectionRegistry};
use crate::runtime::transport::Transport;
use crate::websocket::frame;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

/// Why a connection left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the TCP stream.
    Disconnected,
    /// The peer sent a close frame.
    ClosedByPeer,
    /// No traffic before the liveness deadline.
    Timeout,
    /// Reading from the socket failed.
    ReadFailed(String),
    /// Writing to the socket failed or the outbound queue overflowed.
    WriteFailed(String),
    /// The peer sent a frame this server refuses.
    Protocol(FrameError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected => f.write_str("disconnected"),
            CloseReason::ClosedByPeer => f.write_str("closed by peer"),
            CloseReason::Timeout => f.write_str("disconnected by timeout"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

/// Application logic plugged into the event loop.
pub trait Handler<T: Transport> {
    /// A connection finished its handshake and is registered.
    fn on_open(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId) {
        let _ = (hub, id);
    }

    /// A data frame arrived from `id`.
    fn on_message(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId, message: &[u8]);

    /// `id` has been closed and removed from the registry.
    fn on_close(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId, reason: &CloseReason) {
        let _ = (hub, id, reason);
    }

    /// Payload sent to a connection that has gone quiet.
    fn heartbeat(&self) -> Vec<u8>;
}

/// Mark `id` for eviction at the end of the current step.
///
/// Already-doomed connections are left alone so each is reaped once.
pub(crate) fn doom<T: Transport>(
    registry: &mut ConnectionRegistry<T>,
    doomed: &mut VecDeque<(ConnectionId, CloseReason)>,
    id: &ConnectionId,
    reason: CloseReason,
) {
    if let Some(conn) = registry.get_mut(id) {
        if !conn.is_closing() {
            conn.mark_closing();
            doomed.push_back((id.clone(), reason));
        }
    }
}

/// Send handle given to hooks.
///
/// Write failures do not surface to the hook: the failing connection is
/// marked dead, skipped by later sends, and evicted once the hook returns.
/// Broadcasts reach the connections registered when they start; a
/// connection registered during a broadcast may or may not receive it.
pub struct Hub<'a, T> {
    registry: &'a mut ConnectionRegistry<T>,
    doomed: &'a mut VecDeque<(ConnectionId, CloseReason)>,
    max_pending: usize,
}

impl<'a, T: Transport> Hub<'a, T> {
    pub(crate) fn new(
        registry: &'a mut ConnectionRegistry<T>,
        doomed: &'a mut VecDeque<(ConnectionId, CloseReason)>,
        max_pending: usize,
    ) -> Self {
        Self {
            registry,
            doomed,
            max_pending,
        }
    }

    /// Live connections in registry order, excluding any marked dead.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.registry
            .iter()
            .filter(|conn| !conn.is_closing())
            .map(|conn| conn.id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.iter().filter(|conn| !conn.is_closing()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|conn| !conn.is_closing())
    }

    /// Send one payload to one connection.
    pub fn send_to(&mut self, id: &ConnectionId, payload: &[u8]) -> Result<(), SendError> {
        if !self.contains(id) {
            return Err(RegistryError::UnknownConnection(id.to_string()).into());
        }
        let frame = frame::encode(payload)?;
        self.deliver(id, &frame);
        Ok(())
    }

    /// Send the same payload to every connection except `exclude`.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast(
        &mut self,
        payload: &[u8],
        exclude: Option<&ConnectionId>,
    ) -> Result<usize, FrameError> {
        let frame = frame::encode(payload)?;
        let mut delivered = 0;
        for id in self.ids() {
            if Some(&id) == exclude {
                continue;
            }
            if self.deliver(&id, &frame) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Send a payload computed per recipient to every connection except
    /// `exclude`.
    ///
    /// `make` receives the recipient and the live connection list; returning
    /// `None` skips that recipient. A payload too large to frame skips only
    /// its recipient.
    pub fn broadcast_with<F>(&mut self, exclude: Option<&ConnectionId>, mut make: F) -> usize
    where
        F: FnMut(&ConnectionId, &[ConnectionId]) -> Option<Vec<u8>>,
    {
        let ids = self.ids();
        let mut delivered = 0;
        for id in &ids {
            if Some(id) == exclude {
                continue;
            }
            let Some(payload) = make(id, &ids) else {
                continue;
            };
            match frame::encode(&payload) {
                Ok(frame) => {
                    if self.deliver(id, &frame) {
                        delivered += 1;
                    }
                }
                Err(e) => warn!(conn = %id, error = %e, "Dropping broadcast payload"),
            }
        }
        delivered
    }

    fn deliver(&mut self, id: &ConnectionId, frame: &[u8]) -> bool {
        let result: Result<(), TransportError> = match self.registry.get_mut(id) {
            Some(conn) if !conn.is_closing() => conn.queue(frame, self.max_pending),
            _ => return false,
        };

        match result {
            Ok(()) => {
                debug!(conn = %id, len = frame.len(), "Queued frame");
                true
            }
            Err(e) => {
                warn!(conn = %id, error = %e, "Write failed");
                doom(
                    self.registry,
                    self.doomed,
                    id,
                    CloseReason::WriteFailed(e.to_string()),
                );
                false
            }
        }
    }
}
