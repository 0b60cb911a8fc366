//! WebSocket wire protocol: the HTTP upgrade handshake and the frame codec.

pub mod frame;
pub mod handshake;
