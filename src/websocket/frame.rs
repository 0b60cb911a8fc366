//! WebSocket frame codec.
//!
//! Server frames are always a single unmasked FIN frame, so encoding only
//! ever emits the 7-bit or 16-bit length forms. Client frames are always
//! masked and may use any of the three length forms.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |  (if payload len == 126/127)  |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |   Masking key (client frames only, 4 bytes)   | Payload ...   |
//! +-----------------------------------------------+---------------+
//! ```

#![allow(dead_code)] // decode serves whole-frame callers; the loop streams through parse

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a server frame can carry with the 16-bit length form.
pub const MAX_ENCODED_PAYLOAD: usize = u16::MAX as usize;

/// Largest payload allowed in a control frame.
const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN: u8 = 0x80;
const RSV: u8 = 0x70;
const MASK: u8 = 0x80;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    /// Returns true for Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A decoded client frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Encode `payload` as a single unmasked text frame.
///
/// Payloads longer than [`MAX_ENCODED_PAYLOAD`] are refused rather than
/// written with a header that cannot describe them.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    encode_frame(Opcode::Text, payload)
}

/// Encode a close frame carrying a status code and a short reason.
///
/// The reason is cut to fit the control frame limit.
pub fn encode_close(code: u16, reason: &str) -> Bytes {
    let mut reason = reason.as_bytes();
    if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        reason = &reason[..MAX_CONTROL_PAYLOAD - 2];
    }

    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);

    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u8(FIN | Opcode::Close as u8);
    buf.put_u8(payload.len() as u8);
    buf.put_slice(&payload);
    buf.freeze()
}

fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = payload.len();
    if len > MAX_ENCODED_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: len as u64,
            max: MAX_ENCODED_PAYLOAD as u64,
        });
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u8(FIN | opcode as u8);
    if len <= 125 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u8(126);
        buf.put_u16(len as u16);
    }
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Decode one complete client frame and return its unmasked payload.
///
/// Anything short of the declared header, mask and payload is
/// `TruncatedFrame`; trailing bytes past the frame are ignored.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    match parse(frame, usize::MAX)? {
        Some((frame, _)) => Ok(frame.payload),
        None => Err(FrameError::TruncatedFrame),
    }
}

/// Try to parse one client frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold the whole frame, and
/// the number of bytes consumed otherwise.
pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & RSV != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    if b0 & FIN == 0 || opcode == Opcode::Continuation {
        return Err(FrameError::Fragmented);
    }
    if b1 & MASK == 0 {
        return Err(FrameError::Unmasked);
    }

    let (header_len, declared): (usize, u64) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (4, u16::from_be_bytes([buf[2], buf[3]]) as u64)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (10, u64::from_be_bytes(raw))
        }
        len => (2, len as u64),
    };

    if declared > max_payload as u64 || declared >> 63 != 0 {
        return Err(FrameError::PayloadTooLarge {
            len: declared,
            max: max_payload as u64,
        });
    }
    if opcode.is_control() && declared > MAX_CONTROL_PAYLOAD as u64 {
        return Err(FrameError::PayloadTooLarge {
            len: declared,
            max: MAX_CONTROL_PAYLOAD as u64,
        });
    }

    let payload_start = header_len + 4;
    let payload_len = declared as usize;
    let frame_len = match payload_start.checked_add(payload_len) {
        Some(total) => total,
        None => {
            return Err(FrameError::PayloadTooLarge {
                len: declared,
                max: max_payload as u64,
            })
        }
    };
    if buf.len() < frame_len {
        return Ok(None);
    }

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[header_len..payload_start]);

    let mut payload = buf[payload_start..frame_len].to_vec();
    apply_mask(&mut payload, mask);

    Ok(Some((Frame { opcode, payload }, frame_len)))
}

/// XOR `data` in place with the mask cycled by index.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a masked client frame the way a browser would.
    pub(crate) fn client_frame(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![FIN | opcode as u8];
        let len = payload.len();
        if len <= 125 {
            out.push(MASK | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(MASK | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(MASK | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, mask);
        out.extend_from_slice(&masked);
        out
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_encode_short_payload() {
        let frame = encode(b"hello").unwrap();
        assert_eq!(&frame[..], b"\x81\x05hello");
    }

    #[test]
    fn test_encode_empty_payload() {
        let frame = encode(b"").unwrap();
        assert_eq!(&frame[..], &[0x81, 0x00]);
    }

    #[test]
    fn test_encode_length_boundary() {
        let frame = encode(&pattern(125)).unwrap();
        assert_eq!(frame[1], 125);
        assert_eq!(frame.len(), 2 + 125);

        let frame = encode(&pattern(126)).unwrap();
        assert_eq!(frame[1], 126);
        assert_eq!(&frame[2..4], &[0x00, 126]);
        assert_eq!(frame.len(), 4 + 126);
    }

    #[test]
    fn test_encode_largest_payload() {
        let frame = encode(&pattern(MAX_ENCODED_PAYLOAD)).unwrap();
        assert_eq!(frame[1], 126);
        assert_eq!(&frame[2..4], &[0xFF, 0xFF]);
        // server frames are never masked
        assert_eq!(frame[1] & MASK, 0);
    }

    #[test]
    fn test_encode_oversize_rejected() {
        let err = encode(&vec![0u8; 65536]).unwrap_err();
        assert_eq!(
            err,
            FrameError::PayloadTooLarge {
                len: 65536,
                max: 65535
            }
        );
    }

    #[test]
    fn test_decode_recovers_payload_for_each_length_form() {
        let masks = [[0, 0, 0, 0], [0x37, 0xfa, 0x21, 0x3d], [0xff, 0xff, 0xff, 0xff]];
        for len in [0usize, 1, 2, 3, 4, 5, 124, 125, 126, 127, 1000, 65535] {
            let payload = pattern(len);
            for mask in masks {
                let frame = client_frame(Opcode::Text, &payload, mask);
                assert_eq!(decode(&frame).unwrap(), payload, "len={len} mask={mask:?}");
            }
        }
    }

    #[test]
    fn test_decode_rfc_sample() {
        // "Hello" masked with 37 fa 21 3d, from RFC 6455 section 5.7
        let frame = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        assert_eq!(decode(&frame).unwrap(), b"Hello");
    }

    #[test]
    fn test_decode_64bit_length() {
        let payload = pattern(70_000);
        let frame = client_frame(Opcode::Binary, &payload, [1, 2, 3, 4]);
        assert_eq!(frame[1] & 0x7F, 127);
        assert_eq!(decode(&frame).unwrap(), payload);
    }

    #[test]
    fn test_decode_truncated_header() {
        assert_eq!(decode(&[0x81]), Err(FrameError::TruncatedFrame));
        // 16-bit length announced but missing
        assert_eq!(decode(&[0x81, 0xFE, 0x01]), Err(FrameError::TruncatedFrame));
        // mask incomplete
        assert_eq!(decode(&[0x81, 0x85, 0x37, 0xfa]), Err(FrameError::TruncatedFrame));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let frame = client_frame(Opcode::Text, b"Hello", [9, 9, 9, 9]);
        assert_eq!(decode(&frame[..frame.len() - 1]), Err(FrameError::TruncatedFrame));
    }

    #[test]
    fn test_parse_reports_consumed_and_leaves_rest() {
        let mut buf = client_frame(Opcode::Text, b"one", [1, 2, 3, 4]);
        let first_len = buf.len();
        buf.extend_from_slice(&client_frame(Opcode::Text, b"two", [5, 6, 7, 8]));

        let (frame, consumed) = parse(&buf, 1024).unwrap().unwrap();
        assert_eq!(frame.payload, b"one");
        assert_eq!(consumed, first_len);

        let (frame, _) = parse(&buf[consumed..], 1024).unwrap().unwrap();
        assert_eq!(frame.payload, b"two");
    }

    #[test]
    fn test_parse_needs_more_data() {
        let frame = client_frame(Opcode::Text, &pattern(300), [1, 2, 3, 4]);
        for cut in [0, 1, 3, 7, 100, frame.len() - 1] {
            assert_eq!(parse(&frame[..cut], 1024), Ok(None), "cut={cut}");
        }
    }

    #[test]
    fn test_parse_rejects_unmasked() {
        assert_eq!(parse(b"\x81\x02hi", 1024), Err(FrameError::Unmasked));
    }

    #[test]
    fn test_parse_rejects_fragments() {
        let mut frame = client_frame(Opcode::Text, b"part", [1, 1, 1, 1]);
        frame[0] &= !FIN;
        assert_eq!(parse(&frame, 1024), Err(FrameError::Fragmented));

        let frame = client_frame(Opcode::Continuation, b"rest", [1, 1, 1, 1]);
        assert_eq!(parse(&frame, 1024), Err(FrameError::Fragmented));
    }

    #[test]
    fn test_parse_rejects_reserved_bits_and_opcodes() {
        let mut frame = client_frame(Opcode::Text, b"x", [1, 1, 1, 1]);
        frame[0] |= 0x40;
        assert_eq!(parse(&frame, 1024), Err(FrameError::ReservedBits));

        let mut frame = client_frame(Opcode::Text, b"x", [1, 1, 1, 1]);
        frame[0] = FIN | 0x3;
        assert_eq!(parse(&frame, 1024), Err(FrameError::InvalidOpcode(0x3)));
    }

    #[test]
    fn test_parse_enforces_limit_before_payload_arrives() {
        let frame = client_frame(Opcode::Text, &pattern(2000), [1, 2, 3, 4]);
        // header alone is enough to refuse
        assert_eq!(
            parse(&frame[..8], 1024),
            Err(FrameError::PayloadTooLarge { len: 2000, max: 1024 })
        );
    }

    #[test]
    fn test_parse_control_frames() {
        let frame = client_frame(Opcode::Close, &[0x03, 0xE8], [4, 3, 2, 1]);
        let (frame, _) = parse(&frame, 1024).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert_eq!(frame.payload, vec![0x03, 0xE8]);
    }

    #[test]
    fn test_encode_close() {
        let frame = encode_close(1001, "timeout");
        assert_eq!(frame[0], 0x88);
        assert_eq!(frame[1] as usize, 2 + "timeout".len());
        assert_eq!(&frame[2..4], &1001u16.to_be_bytes());
        assert_eq!(&frame[4..], b"timeout");

        let long = "x".repeat(300);
        let frame = encode_close(1000, &long);
        assert_eq!(frame[1] as usize, MAX_CONTROL_PAYLOAD);
    }
}
