//! Single-threaded scheduler.
//!
//! Each pass accepts pending connections, advances in-flight handshakes,
//! then sweeps every registered connection once: flush queued output,
//! read whatever is available, dispatch decoded messages, and apply the
//! liveness policy. No step waits on any single socket; between passes
//! the loop sleeps in the poller until there is traffic or the tick
//! elapses.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionId, ConnectionRegistry, ReadState};
use crate::runtime::dispatch::{doom, CloseReason, Handler, Hub};
use crate::runtime::liveness::{LivenessPolicy, Verdict};
use crate::runtime::transport::{Listener, Transport};
use crate::websocket::frame::{self, Opcode};
use crate::websocket::handshake::{self, HandshakeRequest, Negotiation};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Status code sent to peers evicted for silence (going away).
const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame header plus mask, the most a frame adds on top of its payload.
const MAX_FRAME_OVERHEAD: usize = 14;

/// Tunables for the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Longest sleep between passes.
    pub tick: Duration,
    /// Connections accepted per pass at most.
    pub accepts_per_pass: usize,
    pub handshake_timeout: Duration,
    /// Largest inbound frame payload.
    pub max_frame_size: usize,
    /// Largest outbound backlog per connection.
    pub max_pending_bytes: usize,
    pub read_buffer_size: usize,
    pub liveness: LivenessPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            accepts_per_pass: 16,
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
            max_pending_bytes: 1024 * 1024,
            read_buffer_size: 2048,
            liveness: LivenessPolicy::default(),
        }
    }
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms),
            accepts_per_pass: config.accepts_per_pass,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            max_frame_size: config.max_frame_size,
            max_pending_bytes: config.max_pending_bytes,
            read_buffer_size: config.read_buffer_size,
            liveness: LivenessPolicy::new(
                Duration::from_secs(config.idle_secs),
                Duration::from_secs(config.timeout_secs),
            ),
        }
    }
}

/// Accepted connection still waiting for its upgrade request.
struct PendingHandshake<T> {
    transport: T,
    buf: BytesMut,
    accepted_at: Instant,
}

/// The scheduler: owns the listener, the registry and the dispatch hook.
pub struct EventLoop<L: Listener, H> {
    listener: L,
    handler: H,
    registry: ConnectionRegistry<L::Stream>,
    pending: Vec<PendingHandshake<L::Stream>>,
    doomed: VecDeque<(ConnectionId, CloseReason)>,
    settings: LoopSettings,
    scratch: Vec<u8>,
}

impl<L, H> EventLoop<L, H>
where
    L: Listener,
    H: Handler<L::Stream>,
{
    pub fn new(
        listener: L,
        handler: H,
        registry: ConnectionRegistry<L::Stream>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            listener,
            handler,
            registry,
            pending: Vec::new(),
            doomed: VecDeque::new(),
            scratch: vec![0u8; settings.read_buffer_size.max(1)],
            settings,
        }
    }

    /// Run passes until the process is terminated.
    pub fn run(&mut self) {
        loop {
            if let Err(e) = self.listener.wait(self.settings.tick) {
                warn!(error = %e, "Poll failed");
            }
            self.turn(Instant::now());
        }
    }

    /// Run one pass as of `now`.
    pub fn turn(&mut self, now: Instant) {
        self.accept_phase(now);
        self.handshake_phase(now);
        self.service_phase(now);
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ConnectionRegistry<L::Stream> {
        &self.registry
    }

    #[cfg(test)]
    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn accept_phase(&mut self, now: Instant) {
        for _ in 0..self.settings.accepts_per_pass {
            match self.listener.accept() {
                Ok(Some(mut transport)) => {
                    if self.registry.len() + self.pending.len() >= self.registry.capacity() {
                        warn!(peer = ?transport.peer_addr(), "Connection limit reached");
                        let reply = handshake::rejection("503 Service Unavailable", "Server full");
                        let _ = transport.send(reply.as_bytes());
                        transport.close();
                        continue;
                    }
                    debug!(peer = ?transport.peer_addr(), "Accepted connection");
                    self.pending.push(PendingHandshake {
                        transport,
                        buf: BytesMut::new(),
                        accepted_at: now,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn handshake_phase(&mut self, now: Instant) {
        for mut pending in std::mem::take(&mut self.pending) {
            match handshake::negotiate(&mut pending.transport, &mut pending.buf) {
                Ok(Negotiation::Pending) => {
                    let waited = now.saturating_duration_since(pending.accepted_at);
                    if waited > self.settings.handshake_timeout {
                        debug!(peer = ?pending.transport.peer_addr(), "Handshake timed out");
                        pending.transport.close();
                    } else {
                        self.pending.push(pending);
                    }
                }
                Ok(Negotiation::Upgraded { request, response }) => {
                    self.promote(pending.transport, &request, &response, &pending.buf, now);
                }
                Err(e) => {
                    warn!(peer = ?pending.transport.peer_addr(), error = %e, "Handshake rejected");
                    pending.transport.close();
                }
            }
        }
    }

    /// Register an upgraded peer and announce it to the hook.
    fn promote(
        &mut self,
        mut transport: L::Stream,
        request: &HandshakeRequest,
        response: &str,
        early: &[u8],
        now: Instant,
    ) {
        let id = match self.registry.next_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "No identifier available");
                transport.close();
                return;
            }
        };

        let mut conn = Connection::new(id.clone(), transport, now);
        conn.seed_inbound(early);
        if let Err(e) = conn.queue(response.as_bytes(), self.settings.max_pending_bytes) {
            warn!(error = %e, "Failed to send handshake response");
            conn.close();
            return;
        }
        let peer = conn.peer_addr();
        if let Err(e) = self.registry.add(conn) {
            warn!(error = %e, "Failed to register connection");
            return;
        }

        info!(
            conn = %id,
            peer = ?peer,
            resource = request.resource.as_deref().unwrap_or("/"),
            host = request.host.as_deref().unwrap_or(""),
            origin = request.origin.as_deref().unwrap_or(""),
            cookie = request.cookie.is_some(),
            "Accepted new client"
        );

        let mut hub = Hub::new(
            &mut self.registry,
            &mut self.doomed,
            self.settings.max_pending_bytes,
        );
        self.handler.on_open(&mut hub, &id);
        self.reap();
    }

    fn service_phase(&mut self, now: Instant) {
        if self.registry.is_empty() {
            return;
        }
        for id in self.registry.ids() {
            if !self.registry.contains(&id) {
                continue;
            }
            self.service(&id, now);
            self.reap();
        }
    }

    fn service(&mut self, id: &ConnectionId, now: Instant) {
        let settings = self.settings;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.is_closing() {
            return;
        }

        if let Err(e) = conn.flush() {
            doom(
                &mut self.registry,
                &mut self.doomed,
                id,
                CloseReason::WriteFailed(e.to_string()),
            );
            return;
        }

        let mut messages = Vec::new();
        let mut closing = None;
        match conn.fill(&mut self.scratch, settings.max_frame_size + MAX_FRAME_OVERHEAD) {
            Err(e) => closing = Some(CloseReason::ReadFailed(e.to_string())),
            Ok(state) => {
                loop {
                    match conn.next_frame(settings.max_frame_size) {
                        Ok(Some(frame)) => {
                            conn.touch(now);
                            match frame.opcode {
                                Opcode::Text | Opcode::Binary => messages.push(frame.payload),
                                Opcode::Close => {
                                    closing = Some(CloseReason::ClosedByPeer);
                                    break;
                                }
                                Opcode::Ping | Opcode::Pong | Opcode::Continuation => {}
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            closing = Some(CloseReason::Protocol(e));
                            break;
                        }
                    }
                }
                if closing.is_none() && state == ReadState::Eof {
                    closing = Some(CloseReason::Disconnected);
                }
            }
        }

        for message in messages {
            debug!(conn = %id, len = message.len(), "Received message");
            let mut hub = Hub::new(
                &mut self.registry,
                &mut self.doomed,
                settings.max_pending_bytes,
            );
            self.handler.on_message(&mut hub, id, &message);
        }

        if let Some(reason) = closing {
            doom(&mut self.registry, &mut self.doomed, id, reason);
            return;
        }

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.is_closing() {
            return;
        }
        match settings.liveness.assess(conn, now) {
            Verdict::SendPing => {
                debug!(conn = %id, "Sending heartbeat");
                let heartbeat = self.handler.heartbeat();
                let mut hub = Hub::new(
                    &mut self.registry,
                    &mut self.doomed,
                    settings.max_pending_bytes,
                );
                if let Err(e) = hub.send_to(id, &heartbeat) {
                    warn!(conn = %id, error = %e, "Failed to send heartbeat");
                }
            }
            Verdict::Evict => doom(&mut self.registry, &mut self.doomed, id, CloseReason::Timeout),
            Verdict::Active | Verdict::AwaitingReply => {}
        }
    }

    /// Close and unregister every doomed connection, letting the hook
    /// react to each. Hooks may doom further connections; those are
    /// reaped in the same call.
    fn reap(&mut self) {
        while let Some((id, reason)) = self.doomed.pop_front() {
            let Ok(mut conn) = self.registry.remove(&id) else {
                continue;
            };

            if reason == CloseReason::Timeout {
                // best effort; the peer may already be gone
                let close = frame::encode_close(CLOSE_GOING_AWAY, "timeout");
                let _ = conn.queue(&close, usize::MAX);
            }
            if conn.pending_output() > 0 {
                debug!(conn = %id, unsent = conn.pending_output(), "Dropping unsent output");
            }
            conn.close();

            match reason {
                CloseReason::Disconnected | CloseReason::ClosedByPeer => {
                    info!(conn = %id, reason = %reason, "Client disconnected")
                }
                _ => warn!(conn = %id, reason = %reason, "Client disconnected"),
            }

            let mut hub = Hub::new(
                &mut self.registry,
                &mut self.doomed,
                self.settings.max_pending_bytes,
            );
            self.handler.on_close(&mut hub, &id, &reason);
        }
    }
}
