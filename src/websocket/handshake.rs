//! Opening handshake (RFC 6455 section 4).
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! is answered with
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Only the version 7, 8 and 13 drafts are spoken. Requests without a
//! version header come from the older key1/key2/key3 handshake, which is
//! refused with an explanation instead of being accepted.

use crate::error::{HandshakeError, TransportError};
use crate::runtime::transport::{Recv, Transport};
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tracing::debug;

/// GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions accepted on the modern path.
const SUPPORTED_VERSIONS: [&str; 3] = ["7", "8", "13"];

/// Upper bound on buffered request bytes.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Parsed view of an upgrade request.
///
/// Only lives for the duration of the negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub resource: Option<String>,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub version: Option<String>,
    pub key: Option<String>,
    pub key1: Option<String>,
    pub key2: Option<String>,
    pub key3: Option<String>,
    pub cookie: Option<String>,
}

impl HandshakeRequest {
    /// Extract the known fields from raw request text.
    ///
    /// Absent headers stay `None`; nothing here fails.
    pub fn parse(raw: &str) -> Self {
        let mut request = HandshakeRequest::default();
        let mut lines = raw.split("\r\n");

        if let Some(first) = lines.next() {
            request.resource = first
                .strip_prefix("GET ")
                .and_then(|rest| rest.rfind(" HTTP/").map(|end| rest[..end].to_string()));
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = Some(value.trim().to_string());
            let name = name.trim();

            let slot = if name.eq_ignore_ascii_case("Host") {
                &mut request.host
            } else if name.eq_ignore_ascii_case("Origin") {
                &mut request.origin
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
                &mut request.version
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                &mut request.key
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key1") {
                &mut request.key1
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key2") {
                &mut request.key2
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key3") {
                &mut request.key3
            } else if name.eq_ignore_ascii_case("Cookie") {
                &mut request.cookie
            } else {
                continue;
            };
            *slot = value;
        }

        request
    }

    /// Check the request against the supported versions and derive the
    /// accept key.
    pub fn accept_key(&self) -> Result<String, HandshakeError> {
        if self.resource.is_none() {
            return Err(HandshakeError::Malformed("missing GET request line"));
        }

        let version = match self.version.as_deref() {
            Some(version) => version,
            None => {
                debug!(
                    key1 = self.key1.is_some(),
                    key2 = self.key2.is_some(),
                    key3 = self.key3.is_some(),
                    "Request without Sec-WebSocket-Version"
                );
                return Err(HandshakeError::LegacyUnsupported);
            }
        };
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(HandshakeError::UnsupportedVersion(version.to_string()));
        }

        match self.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(derive_accept_key(key)),
            _ => Err(HandshakeError::Malformed("missing Sec-WebSocket-Key")),
        }
    }
}

/// Outcome of one negotiation attempt.
#[derive(Debug)]
pub enum Negotiation {
    /// The request has not fully arrived yet.
    Pending,
    /// The request was accepted; `response` must be written before any frame.
    Upgraded {
        request: HandshakeRequest,
        response: String,
    },
}

/// Derive `Sec-WebSocket-Accept`: base64 of SHA-1 over key + GUID.
pub fn derive_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The 101 response block for a derived accept key.
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// Plaintext HTTP response explaining why a request was refused.
pub fn rejection(status: &str, reason: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {reason}",
        reason.len()
    )
}

/// Read whatever request bytes are available and try to complete the
/// upgrade.
///
/// `buf` carries partial request bytes between calls; after an upgrade it
/// holds any bytes the client sent past the request. On a refusal the
/// peer is sent a best-effort plaintext explanation; the caller is still
/// responsible for closing the transport.
pub fn negotiate<T: Transport>(
    transport: &mut T,
    buf: &mut BytesMut,
) -> Result<Negotiation, HandshakeError> {
    let result = read_request(transport, buf).and_then(|request| match request {
        None => Ok(Negotiation::Pending),
        Some(request) => {
            let accept = request.accept_key()?;
            Ok(Negotiation::Upgraded {
                request,
                response: upgrade_response(&accept),
            })
        }
    });

    if let Err(ref e) = result {
        if e.is_reportable() {
            let reply = rejection("400 Bad Request", &e.to_string());
            if let Err(write_err) = transport.send(reply.as_bytes()) {
                debug!(error = %write_err, "Failed to send handshake rejection");
            }
        }
    }

    result
}

fn read_request<T: Transport>(
    transport: &mut T,
    buf: &mut BytesMut,
) -> Result<Option<HandshakeRequest>, HandshakeError> {
    let mut chunk = [0u8; 2048];
    let end = loop {
        if let Some(end) = find_header_end(buf) {
            break end;
        }
        if buf.len() >= MAX_REQUEST_SIZE {
            return Err(HandshakeError::RequestTooLarge(MAX_REQUEST_SIZE));
        }
        match transport.recv(&mut chunk)? {
            Recv::Data(n) => buf.extend_from_slice(&chunk[..n]),
            Recv::WouldBlock => return Ok(None),
            Recv::Closed => return Err(TransportError::Closed.into()),
        }
    };

    if end > MAX_REQUEST_SIZE {
        return Err(HandshakeError::RequestTooLarge(MAX_REQUEST_SIZE));
    }

    // anything past the header block already belongs to the frame stream
    let head = buf.split_to(end);
    let raw = String::from_utf8_lossy(&head);
    Ok(Some(HandshakeRequest::parse(&raw)))
}

/// Position just past the blank line that ends the header block.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}
