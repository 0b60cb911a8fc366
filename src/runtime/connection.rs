//! Live connections and the registry that tracks them.
//!
//! Each connection owns its transport plus the byte queues in both
//! directions. The registry keeps connections in insertion order and
//! hands out identifiers of the form `<prefix><random number>`.

use crate::error::{FrameError, RegistryError, TransportError};
use crate::runtime::transport::{Recv, Transport};
use crate::websocket::frame::{self, Frame};
use bytes::{Buf, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Identifier of a live connection, unique among live connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        ConnectionId(id.to_string())
    }
}

/// Whether the peer is still sending after a read sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Open,
    Eof,
}

/// A peer that completed the opening handshake.
pub struct Connection<T> {
    id: ConnectionId,
    transport: T,
    /// Time of the last inbound frame.
    pub last_activity: Instant,
    /// A heartbeat was sent during the current idle period.
    pub ping_pending: bool,
    inbound: BytesMut,
    outbound: BytesMut,
    closing: bool,
}

impl<T: Transport> Connection<T> {
    pub fn new(id: ConnectionId, transport: T, now: Instant) -> Self {
        Self {
            id,
            transport,
            last_activity: now,
            ping_pending: false,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            closing: false,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Record inbound traffic: back to active, no heartbeat outstanding.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_pending = false;
    }

    /// Queue `data` for the peer and push out as much as the socket takes.
    ///
    /// Fails with `Backpressure` once more than `limit` bytes would sit
    /// unsent.
    pub fn queue(&mut self, data: &[u8], limit: usize) -> Result<(), TransportError> {
        let queued = self.outbound.len() + data.len();
        if queued > limit {
            return Err(TransportError::Backpressure { queued, limit });
        }
        self.outbound.extend_from_slice(data);
        self.flush()
    }

    /// Write queued bytes until the queue drains or the socket is full.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            let n = self.transport.send(&self.outbound)?;
            if n == 0 {
                break;
            }
            self.outbound.advance(n);
        }
        Ok(())
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Pull everything the socket has into the inbound buffer.
    ///
    /// Stops early once `max_buffered` bytes are waiting to be parsed.
    pub fn fill(
        &mut self,
        scratch: &mut [u8],
        max_buffered: usize,
    ) -> Result<ReadState, TransportError> {
        while self.inbound.len() < max_buffered {
            match self.transport.recv(scratch)? {
                Recv::Data(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Recv::WouldBlock => break,
                Recv::Closed => return Ok(ReadState::Eof),
            }
        }
        Ok(ReadState::Open)
    }

    /// Load bytes that arrived before the connection was registered.
    pub fn seed_inbound(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Take the next complete frame out of the inbound buffer.
    pub fn next_frame(&mut self, max_payload: usize) -> Result<Option<Frame>, FrameError> {
        match frame::parse(&self.inbound, max_payload)? {
            Some((frame, consumed)) => {
                self.inbound.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Mark the connection as dead so no further sends are attempted.
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Close the transport.
    pub fn close(&mut self) {
        self.closing = true;
        self.transport.close();
    }
}

/// Registry of live connections, iterated in insertion order.
///
/// Slab slots are reused, so a separate order list preserves the order
/// in which connections were added.
pub struct ConnectionRegistry<T> {
    connections: Slab<Connection<T>>,
    order: Vec<usize>,
    index: HashMap<ConnectionId, usize>,
    max_connections: usize,
    id_prefix: String,
    id_space: u32,
    rng: StdRng,
}

impl<T: Transport> ConnectionRegistry<T> {
    /// Create a registry seeded from the operating system.
    pub fn new(max_connections: usize, id_prefix: &str, id_space: u32) -> Self {
        Self::with_rng(max_connections, id_prefix, id_space, StdRng::from_os_rng())
    }

    /// Create a registry with deterministic identifiers.
    #[cfg(test)]
    pub fn with_seed(max_connections: usize, id_prefix: &str, id_space: u32, seed: u64) -> Self {
        Self::with_rng(
            max_connections,
            id_prefix,
            id_space,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(max_connections: usize, id_prefix: &str, id_space: u32, rng: StdRng) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            order: Vec::with_capacity(max_connections),
            index: HashMap::with_capacity(max_connections),
            max_connections,
            id_prefix: id_prefix.to_string(),
            id_space: id_space.max(1),
            rng,
        }
    }

    /// Draw a fresh identifier not used by any live connection.
    ///
    /// Colliding draws are retried.
    pub fn next_id(&mut self) -> Result<ConnectionId, RegistryError> {
        if self.index.len() >= self.id_space as usize {
            return Err(RegistryError::Full(self.index.len()));
        }
        loop {
            let n = self.rng.random_range(0..self.id_space);
            let id = ConnectionId(format!("{}{n}", self.id_prefix));
            if !self.index.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Register a connection under its identifier.
    ///
    /// An existing entry is never overwritten.
    pub fn add(&mut self, conn: Connection<T>) -> Result<(), RegistryError> {
        if self.is_full() {
            return Err(RegistryError::Full(self.max_connections));
        }
        if self.index.contains_key(conn.id()) {
            return Err(RegistryError::Duplicate(conn.id().to_string()));
        }
        let id = conn.id().clone();
        let slot = self.connections.insert(conn);
        self.order.push(slot);
        self.index.insert(id, slot);
        Ok(())
    }

    /// Remove a connection and hand it back to the caller.
    pub fn remove(&mut self, id: &ConnectionId) -> Result<Connection<T>, RegistryError> {
        let slot = self
            .index
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.to_string()))?;
        self.order.retain(|&s| s != slot);
        Ok(self.connections.remove(slot))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection<T>> {
        self.index.get(id).map(|&slot| &self.connections[slot])
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection<T>> {
        match self.index.get(id) {
            Some(&slot) => self.connections.get_mut(slot),
            None => None,
        }
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.index.contains_key(id)
    }

    /// Snapshot of live identifiers in insertion order.
    ///
    /// Callers may add or remove connections while walking the snapshot.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(|conn| conn.id().clone()).collect()
    }

    /// Iterate connections in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection<T>> {
        self.order.iter().map(move |&slot| &self.connections[slot])
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
