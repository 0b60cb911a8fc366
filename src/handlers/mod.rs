//! Dispatch hook implementations.
//!
//! - `chat`: multi-user chat room with a JSON envelope
//! - `echo`: sends every message back to its sender
//!
//! Both speak the same heartbeat envelope so browser clients can treat
//! them alike.

pub mod chat;
pub mod echo;

pub use chat::ChatHandler;
pub use echo::EchoHandler;

/// Heartbeat sent to idle connections.
pub(crate) fn ping_envelope() -> Vec<u8> {
    chat::Envelope::new(chat::Action::Ping, "").to_json()
}
