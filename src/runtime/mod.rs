//! Single-threaded runtime for WebSocket connections.
//!
//! One event loop owns the listener, the connection registry and the
//! dispatch hook. Each pass accepts new peers, advances pending handshakes,
//! then services every registered connection in turn:
//! - `transport`: socket traits and the mio/socket2 TCP implementation
//! - `connection`: per-connection buffers and the registry
//! - `liveness`: idle detection
//! - `dispatch`: the hook interface and the send handle given to hooks
//! - `event_loop`: the scheduler

pub mod connection;
pub mod dispatch;
pub mod event_loop;
pub mod liveness;
pub mod transport;

pub use connection::{ConnectionId, ConnectionRegistry};
pub use dispatch::{CloseReason, Handler, Hub};
pub use event_loop::{EventLoop, LoopSettings};
pub use transport::{TcpAcceptor, Transport};

use crate::config::{Config, HandlerKind};
use crate::handlers::{ChatHandler, EchoHandler};
use tracing::info;

/// Bind the listener and run the configured handler until the process exits.
pub fn run(config: Config) -> std::io::Result<()> {
    let acceptor = TcpAcceptor::bind(config.listen, config.backlog)?;
    info!(addr = %acceptor.local_addr()?, backlog = config.backlog, "Listening");

    let registry =
        ConnectionRegistry::new(config.max_connections, &config.id_prefix, config.id_space);
    let settings = LoopSettings::from(&config);

    match config.handler {
        HandlerKind::Chat => {
            let handler = config
                .welcome
                .clone()
                .map(ChatHandler::new)
                .unwrap_or_default();
            EventLoop::new(acceptor, handler, registry, settings).run();
        }
        HandlerKind::Echo => {
            EventLoop::new(acceptor, EchoHandler, registry, settings).run();
        }
    }
    Ok(())
}
