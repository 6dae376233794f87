//! Binary frame codec for the agent link.
//!
//! The layout follows RFC 6455 closely enough for standard WebSocket servers
//! to accept it, but only the subset the protocol needs is supported: single
//! (FIN) text frames carrying JSON envelopes, and close frames. Liveness is
//! handled by application-level envelopes, so ping/pong/binary frames are
//! rejected here.

use rand::RngCore;
use thiserror::Error;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MAX_SHORT_LEN: usize = 125;
const MAX_MEDIUM_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Text,
    Close,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Close => 0x8,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Opcode::Text),
            0x8 => Some(Opcode::Close),
            _ => None,
        }
    }
}

/// Which end of the connection is encoding. Only the side that opened the
/// connection masks its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_len: u64,
    pub header_len: usize,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Number of buffer bytes this frame occupied.
    pub fn encoded_len(&self) -> usize {
        self.header_len + self.payload.len()
    }

    pub fn into_text(self) -> Result<String, FrameError> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Complete(Frame),
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("invalid extended payload length")]
    InvalidLength,
    #[error("frame payload exceeds max size: {size} > {max}")]
    PayloadTooLarge { size: u64, max: usize },
    #[error("text frame is not valid utf-8")]
    InvalidUtf8,
}

/// XORs `payload` in place with the 4-byte mask. Applying it twice restores
/// the input.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (idx, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[idx % 4];
    }
}

pub fn encode(opcode: Opcode, payload: &[u8], role: Role) -> Vec<u8> {
    let mask = match role {
        Role::Client => {
            let mut key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut key);
            Some(key)
        }
        Role::Server => None,
    };
    encode_with_mask(opcode, payload, mask)
}

pub fn encode_with_mask(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 14);
    frame.push(FIN_BIT | opcode.as_u8());

    let mask_flag = if mask.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_SHORT_LEN {
        frame.push(mask_flag | len as u8);
    } else if len <= MAX_MEDIUM_LEN {
        frame.push(mask_flag | LEN_16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_flag | LEN_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            let start = frame.len();
            frame.extend_from_slice(payload);
            apply_mask(&mut frame[start..], key);
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

pub fn decode(buf: &[u8], max_payload: usize) -> Result<Decoded, FrameError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }

    let first = buf[0];
    if first & RSV_BITS != 0 {
        return Err(FrameError::ReservedBits(first & RSV_BITS));
    }
    let raw_opcode = first & OPCODE_BITS;
    if first & FIN_BIT == 0 || raw_opcode == 0x0 {
        return Err(FrameError::Fragmented);
    }
    let opcode = Opcode::from_u8(raw_opcode).ok_or(FrameError::UnsupportedOpcode(raw_opcode))?;

    let masked = buf[1] & MASK_BIT != 0;
    let mut header_len = 2usize;
    let payload_len = match buf[1] & LEN_BITS {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete);
            }
            header_len = 4;
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete);
            }
            header_len = 10;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let value = u64::from_be_bytes(raw);
            if value >> 63 != 0 {
                return Err(FrameError::InvalidLength);
            }
            value
        }
        short => short as u64,
    };

    if payload_len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(Decoded::Incomplete);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    // Bounded by max_payload above, so the cast cannot truncate.
    let end = header_len + payload_len as usize;
    if buf.len() < end {
        return Ok(Decoded::Incomplete);
    }

    let mut payload = buf[header_len..end].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Decoded::Complete(Frame {
        opcode,
        masked,
        payload_len,
        header_len,
        payload,
    }))
}

/// Payload of a close frame: big-endian status code followed by a reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

pub fn parse_close_payload(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).to_string();
    Some((code, reason))
}

/// Accumulates bytes across reads and yields frames as they complete.
pub struct FrameDecoder {
    max_payload: usize,
    buffer: Vec<u8>,
    cursor: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            buffer: Vec::new(),
            cursor: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode(&self.buffer[self.cursor..], self.max_payload)? {
            Decoded::Complete(frame) => {
                self.cursor += frame.encoded_len();
                if self.cursor == self.buffer.len() {
                    self.buffer.clear();
                    self.cursor = 0;
                }
                Ok(Some(frame))
            }
            Decoded::Incomplete => {
                self.compact();
                Ok(None)
            }
        }
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_complete(bytes: &[u8]) -> Frame {
        match decode(bytes, DEFAULT_MAX_PAYLOAD_BYTES).expect("decode") {
            Decoded::Complete(frame) => frame,
            Decoded::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn round_trip_across_length_boundaries() {
        for size in [0usize, 125, 126, 65_535, 65_536] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            for role in [Role::Client, Role::Server] {
                let bytes = encode(Opcode::Text, &payload, role);
                let frame = decode_complete(&bytes);
                assert_eq!(frame.opcode, Opcode::Text);
                assert_eq!(frame.masked, role == Role::Client);
                assert_eq!(frame.payload_len, size as u64);
                assert_eq!(frame.encoded_len(), bytes.len());
                assert_eq!(frame.payload, payload, "size {size} role {role:?}");
            }
        }
    }

    #[test]
    fn length_encoding_uses_expected_header_forms() {
        assert_eq!(encode_with_mask(Opcode::Text, &[0; 125], None)[1], 125);

        let medium = encode_with_mask(Opcode::Text, &[0; 126], None);
        assert_eq!(medium[1], 126);
        assert_eq!(&medium[2..4], &[0x00, 0x7E]);

        let large = encode_with_mask(Opcode::Text, &vec![0; 65_536], None);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &[0, 0, 0, 0, 0, 1, 0, 0]);

        let masked = encode_with_mask(Opcode::Text, b"hi", Some([1, 2, 3, 4]));
        assert_eq!(masked[0], 0x81);
        assert_eq!(masked[1], 0x82);
        assert_eq!(&masked[2..6], &[1, 2, 3, 4]);
        assert_eq!(&masked[6..], &[b'h' ^ 1, b'i' ^ 2]);
    }

    #[test]
    fn masking_is_its_own_inverse() {
        let original = br#"{"type":"heartbeat","timestamp":1}"#.to_vec();
        let mask = [0xA5, 0x01, 0x7F, 0xFE];
        let mut bytes = original.clone();
        apply_mask(&mut bytes, mask);
        assert_ne!(bytes, original);
        apply_mask(&mut bytes, mask);
        assert_eq!(bytes, original);
    }

    #[test]
    fn decode_reports_incomplete_for_every_truncation() {
        let bytes = encode(Opcode::Text, &[7u8; 300], Role::Client);
        for cut in 0..bytes.len() {
            assert_eq!(
                decode(&bytes[..cut], DEFAULT_MAX_PAYLOAD_BYTES),
                Ok(Decoded::Incomplete),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn decoder_buffers_partial_reads_and_splits_coalesced_frames() {
        let first = encode(Opcode::Text, b"{\"type\":\"pong\"}", Role::Server);
        let second = encode(Opcode::Text, &vec![b'x'; 70_000], Role::Client);
        let close = encode(Opcode::Close, &close_payload(CLOSE_NORMAL, "bye"), Role::Server);

        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&close);

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for chunk in stream.chunks(999) {
            decoder.push(chunk);
            while let Some(frame) = decoder.next_frame().expect("decode") {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, b"{\"type\":\"pong\"}");
        assert_eq!(frames[1].payload.len(), 70_000);
        assert_eq!(frames[2].opcode, Opcode::Close);
        assert_eq!(
            parse_close_payload(&frames[2].payload),
            Some((CLOSE_NORMAL, "bye".to_string()))
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn rejects_fragments_control_frames_and_reserved_bits() {
        let mut fragment = encode_with_mask(Opcode::Text, b"part", None);
        fragment[0] &= !FIN_BIT;
        assert_eq!(
            decode(&fragment, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(FrameError::Fragmented)
        );

        let ping = [0x89, 0x00];
        assert_eq!(
            decode(&ping, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(FrameError::UnsupportedOpcode(0x9))
        );

        let rsv = [0xC1, 0x00];
        assert_eq!(
            decode(&rsv, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(FrameError::ReservedBits(0x40))
        );
    }

    #[test]
    fn rejects_oversized_payload_before_it_arrives() {
        let header = encode_with_mask(Opcode::Text, &vec![0; 2_000], None);
        let result = decode(&header[..4], 1_024);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 2_000, max: 1_024 })
        ));
    }
}
