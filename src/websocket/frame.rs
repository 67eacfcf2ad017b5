//! WebSocket frame values and client-side encoding.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes used by this client.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The peer violated the framing protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// The peer sent a data type this client does not accept.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// The peer declared a frame larger than this client can hold.
    pub const TOO_LARGE: u16 = 1004;
    /// A text message was not valid UTF-8.
    pub const INVALID_PAYLOAD: u16 = 1007;
}

/// WebSocket opcodes as defined in RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (0x0)
    Continuation = 0x0,
    /// Text data frame (0x1)
    Text = 0x1,
    /// Binary data frame (0x2)
    Binary = 0x2,
    /// Connection close frame (0x8)
    Close = 0x8,
    /// Ping frame (0x9)
    Ping = 0x9,
    /// Pong frame (0xA)
    Pong = 0xA,
}

impl Opcode {
    /// Parse an opcode from the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame opcode.
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One outbound WebSocket frame.
///
/// The client never fragments, so every encoded frame carries the FIN bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode: identifies the frame type
    pub opcode: Opcode,
    /// Unmasked payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Frame {
            opcode: Opcode::Text,
            payload: Bytes::from(text.into()),
        }
    }

    /// Create a close frame carrying a status code and reason text.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Frame {
            opcode: Opcode::Close,
            payload: payload.freeze(),
        }
    }

    /// Create a pong frame echoing a ping payload.
    pub fn pong(data: Bytes) -> Self {
        Frame {
            opcode: Opcode::Pong,
            payload: data,
        }
    }

    /// Encode with a fresh random masking key.
    pub fn encode_masked(&self) -> BytesMut {
        self.encode(rand::random())
    }

    /// Encode the frame with the given masking key.
    ///
    /// Uses the minimal length representation. Panics when a control frame
    /// carries more than [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn encode(&self, mask: [u8; 4]) -> BytesMut {
        let len = self.payload.len();
        assert!(
            !self.opcode.is_control() || len <= MAX_CONTROL_PAYLOAD,
            "control frame payload of {len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
        );

        let mut frame = BytesMut::with_capacity(14 + len);
        frame.put_u8(0b1000_0000 | self.opcode as u8);

        if len <= MAX_CONTROL_PAYLOAD {
            frame.put_u8(0b1000_0000 | len as u8);
        } else if len <= u16::MAX as usize {
            frame.put_u8(0b1000_0000 | 126);
            frame.put_u16(len as u16);
        } else {
            frame.put_u8(0b1000_0000 | 127);
            frame.put_u64(len as u64);
        }

        frame.put_slice(&mask);
        let start = frame.len();
        frame.put_slice(&self.payload);
        apply_mask(&mut frame[start..], mask, 0);
        frame
    }
}

/// Apply XOR mask to payload data per RFC 6455 Section 5.3.
///
/// `offset` is the position of `payload[0]` within the whole frame payload,
/// so a payload can be unmasked piecewise as it arrives.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

/// Split a close payload into its optional status code and reason text.
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_fin_and_mask() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let encoded = Frame::text("Hello").encode(mask);

        assert_eq!(encoded[0], 0b1000_0001);
        assert_eq!(encoded[1], 0b1000_0101);
        assert_eq!(&encoded[2..6], &mask);

        let mut payload = encoded[6..].to_vec();
        apply_mask(&mut payload, mask, 0);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn test_length_encodings() {
        let mask = [1, 2, 3, 4];

        let short = Frame::text("a".repeat(125)).encode(mask);
        assert_eq!(short[1] & 0x7F, 125);
        assert_eq!(short.len(), 2 + 4 + 125);

        let medium = Frame::text("a".repeat(126)).encode(mask);
        assert_eq!(medium[1] & 0x7F, 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 126);

        let edge = Frame::text("a".repeat(65535)).encode(mask);
        assert_eq!(edge[1] & 0x7F, 126);
        assert_eq!(edge.len(), 4 + 4 + 65535);

        let long = Frame::text("a".repeat(65536)).encode(mask);
        assert_eq!(long[1] & 0x7F, 127);
        let declared = u64::from_be_bytes(long[2..10].try_into().unwrap());
        assert_eq!(declared, 65536);
    }

    #[test]
    fn test_mask_offset_is_continuous() {
        let mask = [9, 8, 7, 6];
        let mut whole = b"abcdefghij".to_vec();
        apply_mask(&mut whole, mask, 0);

        let mut pieces = b"abcdefghij".to_vec();
        let (head, tail) = pieces.split_at_mut(3);
        apply_mask(head, mask, 0);
        apply_mask(tail, mask, 3);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_close_payload() {
        let frame = Frame::close(close_code::NORMAL, "bye");
        assert_eq!(parse_close_payload(&frame.payload), (Some(1000), "bye".to_string()));
        assert_eq!(parse_close_payload(&[]), (None, String::new()));
    }

    #[test]
    #[should_panic(expected = "control frame")]
    fn test_oversized_control_frame_panics() {
        Frame::pong(Bytes::from(vec![0u8; 126])).encode([0; 4]);
    }
}
