//! Byte-stream transport consumed by the event loop.
//!
//! The loop only needs non-blocking accept, read, write and close. The
//! TCP implementation uses mio for sockets and readiness, and socket2 to
//! configure the listening socket before it is handed to mio.

use crate::error::TransportError;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const STREAM_TOKEN: Token = Token(0);

/// Result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// The peer shut down its side.
    Closed,
}

/// A connected, non-blocking byte stream.
pub trait Transport {
    /// Read available bytes into `buf` without blocking.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv, TransportError>;

    /// Write as much of `data` as the socket accepts without blocking.
    ///
    /// Returns 0 when the socket cannot take any bytes right now.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Release the underlying socket. Further calls are no-ops.
    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Source of new connections.
pub trait Listener {
    type Stream: Transport;

    /// Take one pending connection, or `None` if nobody is waiting.
    fn accept(&mut self) -> Result<Option<Self::Stream>, TransportError>;

    /// Sleep until there is socket activity or `timeout` elapses.
    fn wait(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

/// Listening TCP socket driven by a mio poller.
pub struct TcpAcceptor {
    poll: Poll,
    events: Events,
    registry: Rc<Registry>,
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Create, bind and listen on `addr`.
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Rc::new(poll.registry().try_clone()?);

        let mut listener = TcpListener::from_std(create_listener(addr, backlog)?);
        registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            registry,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpAcceptor {
    type Stream = TcpTransport;

    fn accept(&mut self) -> Result<Option<TcpTransport>, TransportError> {
        match self.listener.accept() {
            Ok((mut stream, peer)) => {
                self.registry
                    .register(&mut stream, STREAM_TOKEN, Interest::READABLE)?;
                Ok(Some(TcpTransport {
                    stream,
                    peer,
                    registry: Rc::clone(&self.registry),
                    closed: false,
                }))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), TransportError> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Accepted TCP connection.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    registry: Rc<Registry>,
    closed: bool,
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.stream.read(buf) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Recv::WouldBlock)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        match self.stream.write(data) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into()),
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.registry.deregister(&mut self.stream);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %e, "Shutdown failed");
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.registry.deregister(&mut self.stream);
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// In-memory transports for exercising the loop without sockets.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct State {
        inbound: VecDeque<u8>,
        inbound_closed: bool,
        written: Vec<u8>,
        fail_writes: bool,
        write_budget: Option<usize>,
        write_log: Option<(WriteLog, String)>,
        closed: bool,
    }

    /// Labels of transports in the order they accepted writes, shared
    /// across several mocks.
    pub(crate) type WriteLog = Rc<RefCell<Vec<String>>>;

    pub(crate) struct MockTransport {
        state: Rc<RefCell<State>>,
    }

    /// Test-side view of a `MockTransport` that stays valid after the
    /// transport is moved into the loop.
    #[derive(Clone)]
    pub(crate) struct MockHandle {
        state: Rc<RefCell<State>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> (Self, MockHandle) {
            let state = Rc::new(RefCell::new(State::default()));
            (
                Self {
                    state: Rc::clone(&state),
                },
                MockHandle { state },
            )
        }
    }

    impl Transport for MockTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<Recv, TransportError> {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.inbound.is_empty() {
                return Ok(if state.inbound_closed {
                    Recv::Closed
                } else {
                    Recv::WouldBlock
                });
            }
            let n = buf.len().min(state.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(Recv::Data(n))
        }

        fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe").into());
            }
            let budget = state.write_budget;
            let n = match budget {
                Some(budget) => {
                    let n = budget.min(data.len());
                    state.write_budget = Some(budget - n);
                    n
                }
                None => data.len(),
            };
            state.written.extend_from_slice(&data[..n]);
            if let Some((log, label)) = &state.write_log {
                log.borrow_mut().push(label.clone());
            }
            Ok(n)
        }

        fn close(&mut self) {
            self.state.borrow_mut().closed = true;
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    impl MockHandle {
        pub(crate) fn push_inbound(&self, data: &[u8]) {
            self.state.borrow_mut().inbound.extend(data.iter().copied());
        }

        pub(crate) fn close_inbound(&self) {
            self.state.borrow_mut().inbound_closed = true;
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.state.borrow().written.clone()
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.state.borrow_mut().written)
        }

        pub(crate) fn fail_writes(&self) {
            self.state.borrow_mut().fail_writes = true;
        }

        /// Limit how many more bytes the socket accepts.
        pub(crate) fn set_write_budget(&self, budget: Option<usize>) {
            self.state.borrow_mut().write_budget = budget;
        }

        /// Record `label` in `log` on every write this transport accepts.
        pub(crate) fn log_writes(&self, log: &WriteLog, label: &str) {
            self.state.borrow_mut().write_log = Some((Rc::clone(log), label.to_string()));
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.state.borrow().closed
        }

        /// Split everything written so far into unmasked server frames.
        pub(crate) fn frames(&self) -> Vec<(u8, Vec<u8>)> {
            server_frames(&self.state.borrow().written)
        }

        /// Text payloads of every server frame written so far.
        pub(crate) fn texts(&self) -> Vec<String> {
            self.frames()
                .into_iter()
                .filter(|(opcode, _)| *opcode == 0x1)
                .map(|(_, payload)| String::from_utf8(payload).unwrap())
                .collect()
        }
    }

    /// Parse a run of unmasked server frames. Skips a leading HTTP
    /// response block if present.
    pub(crate) fn server_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        if bytes.starts_with(b"HTTP/1.1") {
            let end = bytes
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .expect("unterminated response");
            bytes = &bytes[end + 4..];
        }

        let mut frames = Vec::new();
        while bytes.len() >= 2 {
            let opcode = bytes[0] & 0x0F;
            let (start, len) = match bytes[1] & 0x7F {
                126 => (4, u16::from_be_bytes([bytes[2], bytes[3]]) as usize),
                len => (2, len as usize),
            };
            frames.push((opcode, bytes[start..start + len].to_vec()));
            bytes = &bytes[start + len..];
        }
        frames
    }

    /// Listener that hands out queued mock transports.
    #[derive(Default)]
    pub(crate) struct MockListener {
        pending: Rc<RefCell<VecDeque<MockTransport>>>,
        fail_next: Rc<RefCell<bool>>,
    }

    #[derive(Clone)]
    pub(crate) struct MockListenerHandle {
        pending: Rc<RefCell<VecDeque<MockTransport>>>,
        fail_next: Rc<RefCell<bool>>,
    }

    impl MockListener {
        pub(crate) fn new() -> (Self, MockListenerHandle) {
            let listener = MockListener::default();
            let handle = MockListenerHandle {
                pending: Rc::clone(&listener.pending),
                fail_next: Rc::clone(&listener.fail_next),
            };
            (listener, handle)
        }
    }

    impl MockListenerHandle {
        /// Queue a new incoming connection and return its handle.
        pub(crate) fn connect(&self) -> MockHandle {
            let (transport, handle) = MockTransport::new();
            self.pending.borrow_mut().push_back(transport);
            handle
        }

        pub(crate) fn fail_next_accept(&self) {
            *self.fail_next.borrow_mut() = true;
        }
    }

    impl Listener for MockListener {
        type Stream = MockTransport;

        fn accept(&mut self) -> Result<Option<MockTransport>, TransportError> {
            if std::mem::take(&mut *self.fail_next.borrow_mut()) {
                return Err(io::Error::new(io::ErrorKind::Other, "accept failed").into());
            }
            Ok(self.pending.borrow_mut().pop_front())
        }

        fn wait(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }
    }
}
