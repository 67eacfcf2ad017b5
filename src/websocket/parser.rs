//! Incremental WebSocket frame parser.
//!
//! [`FrameParser`] consumes bytes exactly as they come off the socket. Header
//! fields, extended lengths, mask keys and payloads may be split across any
//! number of reads; progress is kept in a parse cursor between calls.
//!
//! ```text
//!   Head ──► Length ──┬──────────────────► Mask ──► Payload ──► (frame done)
//!                     └─► ExtendedLength ──┘   │                     ▲
//!                                              └─────────────────────┘ (unmasked)
//! ```
//!
//! A completed frame either yields a [`Decoded`] item or folds into the open
//! fragmented message. Frames that violate the protocol are reported once and
//! their remaining payload is counted away without being buffered.

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::frame::{MAX_CONTROL_PAYLOAD, Opcode, apply_mask, close_code, parse_close_payload};

/// Upper bound on the buffer reserved up front for a single frame.
const INITIAL_RESERVE: u64 = 64 * 1024;

/// Something the parser produced from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete (possibly reassembled) text message.
    Text(String),
    /// A control frame the transport must act on.
    Control(ControlFrame),
    /// The peer broke the protocol; the transport should close with
    /// [`ProtocolViolation::close_code`].
    Violation(ProtocolViolation),
}

/// Control frames received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Close frame with its optional status code and reason text.
    Close {
        /// Status code, when the payload carried one
        code: Option<u16>,
        /// UTF-8 reason text (lossy)
        reason: String,
    },
    /// Ping to be answered with an identical pong.
    Ping(Bytes),
    /// Pong from the peer.
    Pong(Bytes),
}

/// Protocol violations detected while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Opcode nibble not defined by RFC 6455
    UnknownOpcode(u8),
    /// Declared payload length is larger than this client can hold
    FrameTooLarge(u64),
    /// Binary data frames are not accepted
    UnsupportedBinary,
    /// Control frame payload exceeds 125 bytes
    ControlFrameTooLarge(u64),
    /// Control frame with the FIN bit cleared
    FragmentedControlFrame,
    /// Continuation frame with no message in progress
    UnexpectedContinuation,
    /// New data frame started while a fragmented message is still open
    InterleavedMessage,
    /// Completed text message is not valid UTF-8
    InvalidUtf8,
}

impl ProtocolViolation {
    /// Close status code to answer this violation with.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolViolation::FrameTooLarge(_) => close_code::TOO_LARGE,
            ProtocolViolation::UnsupportedBinary => close_code::UNSUPPORTED_DATA,
            ProtocolViolation::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            ProtocolViolation::UnknownOpcode(_)
            | ProtocolViolation::ControlFrameTooLarge(_)
            | ProtocolViolation::FragmentedControlFrame
            | ProtocolViolation::UnexpectedContinuation
            | ProtocolViolation::InterleavedMessage => close_code::PROTOCOL_ERROR,
        }
    }

    /// Reason text sent in the close frame.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolViolation::FrameTooLarge(_) => "frame too large",
            ProtocolViolation::UnsupportedBinary => "unacceptable datatype",
            ProtocolViolation::InvalidUtf8 => "invalid utf-8",
            _ => "protocol error",
        }
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::UnknownOpcode(op) => write!(f, "Unknown WebSocket opcode: {:#x}", op),
            ProtocolViolation::FrameTooLarge(len) => {
                write!(f, "Frame of {} bytes exceeds the addressable maximum", len)
            }
            ProtocolViolation::UnsupportedBinary => write!(f, "Binary frames are not supported"),
            ProtocolViolation::ControlFrameTooLarge(len) => {
                write!(f, "Control frame payload of {} bytes exceeds 125 bytes", len)
            }
            ProtocolViolation::FragmentedControlFrame => {
                write!(f, "Control frame is fragmented")
            }
            ProtocolViolation::UnexpectedContinuation => {
                write!(f, "Continuation frame without an open message")
            }
            ProtocolViolation::InterleavedMessage => {
                write!(f, "Data frame received while a fragmented message is open")
            }
            ProtocolViolation::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Stage {
    #[default]
    Head,
    Length,
    ExtendedLength,
    Mask,
    Payload,
}

/// Partially parsed frame.
///
/// A fresh cursor replaces the old one every time a frame completes.
#[derive(Debug, Default)]
struct ParseCursor {
    stage: Stage,
    fin: bool,
    opcode: Option<Opcode>,
    masked: bool,
    length: u64,
    length_bytes: [u8; 8],
    length_needed: usize,
    length_filled: usize,
    mask: [u8; 4],
    mask_filled: usize,
    received: u64,
    payload: BytesMut,
    /// Frame was rejected; its payload is counted, never stored.
    discard: bool,
}

impl ParseCursor {
    fn remaining(&self) -> u64 {
        self.length - self.received
    }
}

/// Fragmented message in progress.
#[derive(Debug)]
struct OpenMessage {
    opcode: Opcode,
    payload: BytesMut,
    /// Continuations belong to a rejected message and are dropped silently.
    discard: bool,
}

/// Stateful frame parser owned by one connection.
#[derive(Debug)]
pub struct FrameParser {
    cursor: ParseCursor,
    message: Option<OpenMessage>,
    max_payload_len: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Create a parser accepting any payload the host can address.
    pub fn new() -> Self {
        Self::with_max_payload_len(isize::MAX as u64)
    }

    /// Create a parser rejecting frames whose payload exceeds `max_payload_len`.
    pub fn with_max_payload_len(max_payload_len: u64) -> Self {
        FrameParser {
            cursor: ParseCursor::default(),
            message: None,
            max_payload_len: max_payload_len.min(isize::MAX as u64),
        }
    }

    /// Whether a frame or fragmented message is partially parsed.
    pub fn is_mid_message(&self) -> bool {
        self.cursor.stage != Stage::Head || self.message.is_some()
    }

    /// Feed newly received bytes and collect everything they complete.
    pub fn decode(&mut self, input: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        self.decode_into(input, &mut out);
        out
    }

    /// Like [`FrameParser::decode`], appending to an existing buffer.
    pub fn decode_into(&mut self, mut input: &[u8], out: &mut Vec<Decoded>) {
        while !input.is_empty() {
            match self.cursor.stage {
                Stage::Head => {
                    let byte = input[0];
                    input = &input[1..];
                    self.cursor.fin = byte & 0b1000_0000 != 0;
                    let raw = byte & 0b0000_1111;
                    self.cursor.opcode = Opcode::from_u8(raw);
                    if self.cursor.opcode.is_none() {
                        out.push(Decoded::Violation(ProtocolViolation::UnknownOpcode(raw)));
                        self.cursor.discard = true;
                    }
                    self.cursor.stage = Stage::Length;
                }
                Stage::Length => {
                    let byte = input[0];
                    input = &input[1..];
                    self.cursor.masked = byte & 0b1000_0000 != 0;
                    match byte & 0b0111_1111 {
                        126 => {
                            self.cursor.length_needed = 2;
                            self.cursor.stage = Stage::ExtendedLength;
                        }
                        127 => {
                            self.cursor.length_needed = 8;
                            self.cursor.stage = Stage::ExtendedLength;
                        }
                        len => {
                            self.cursor.length = u64::from(len);
                            self.length_known(out);
                        }
                    }
                }
                Stage::ExtendedLength => {
                    let cursor = &mut self.cursor;
                    let take = (cursor.length_needed - cursor.length_filled).min(input.len());
                    let filled = cursor.length_filled;
                    cursor.length_bytes[filled..filled + take].copy_from_slice(&input[..take]);
                    cursor.length_filled += take;
                    input = &input[take..];

                    if cursor.length_filled == cursor.length_needed {
                        cursor.length = cursor.length_bytes[..cursor.length_needed]
                            .iter()
                            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                        self.length_known(out);
                    }
                }
                Stage::Mask => {
                    let cursor = &mut self.cursor;
                    let take = (4 - cursor.mask_filled).min(input.len());
                    let filled = cursor.mask_filled;
                    cursor.mask[filled..filled + take].copy_from_slice(&input[..take]);
                    cursor.mask_filled += take;
                    input = &input[take..];

                    if cursor.mask_filled == 4 {
                        self.enter_payload(out);
                    }
                }
                Stage::Payload => {
                    let cursor = &mut self.cursor;
                    let take = cursor.remaining().min(input.len() as u64) as usize;
                    if !cursor.discard {
                        let start = cursor.payload.len();
                        cursor.payload.extend_from_slice(&input[..take]);
                        if cursor.masked {
                            apply_mask(&mut cursor.payload[start..], cursor.mask, start);
                        }
                    }
                    cursor.received += take as u64;
                    input = &input[take..];

                    if cursor.remaining() == 0 {
                        self.finish_frame(out);
                    }
                }
            }
        }
    }

    /// Validate the frame once its payload length is known.
    fn length_known(&mut self, out: &mut Vec<Decoded>) {
        let length = self.cursor.length;

        if !self.cursor.discard {
            if let Some(violation) = self.check_frame(length) {
                out.push(Decoded::Violation(violation));
                self.cursor.discard = true;
            }
        }

        if !self.cursor.discard {
            self.cursor.payload.reserve(length.min(INITIAL_RESERVE) as usize);
        }

        if self.cursor.masked {
            self.cursor.stage = Stage::Mask;
        } else {
            self.enter_payload(out);
        }
    }

    fn check_frame(&mut self, length: u64) -> Option<ProtocolViolation> {
        let opcode = self.cursor.opcode?;
        let fin = self.cursor.fin;

        if opcode.is_control() {
            return if !fin {
                Some(ProtocolViolation::FragmentedControlFrame)
            } else if length > MAX_CONTROL_PAYLOAD as u64 {
                Some(ProtocolViolation::ControlFrameTooLarge(length))
            } else if length > self.max_payload_len {
                Some(ProtocolViolation::FrameTooLarge(length))
            } else {
                None
            };
        }

        let open_discarded = self.message.as_ref().map(|message| message.discard);
        if opcode == Opcode::Continuation && open_discarded == Some(true) {
            self.cursor.discard = true;
            return None;
        }

        let violation = if length > self.max_payload_len {
            ProtocolViolation::FrameTooLarge(length)
        } else {
            match (opcode, open_discarded.is_some()) {
                (Opcode::Continuation, false) => ProtocolViolation::UnexpectedContinuation,
                (Opcode::Text | Opcode::Binary, true) => ProtocolViolation::InterleavedMessage,
                (Opcode::Binary, false) => ProtocolViolation::UnsupportedBinary,
                _ => return None,
            }
        };

        // A rejected data frame takes its whole message with it: later
        // continuations are skipped until the final one.
        match self.message.as_mut() {
            Some(message) if opcode == Opcode::Continuation => message.discard = true,
            _ => {
                self.message = (!fin).then(|| OpenMessage {
                    opcode,
                    payload: BytesMut::new(),
                    discard: true,
                });
            }
        }
        Some(violation)
    }

    fn enter_payload(&mut self, out: &mut Vec<Decoded>) {
        if self.cursor.length == 0 {
            self.finish_frame(out);
        } else {
            self.cursor.stage = Stage::Payload;
        }
    }

    fn finish_frame(&mut self, out: &mut Vec<Decoded>) {
        let cursor = std::mem::take(&mut self.cursor);

        let Some(opcode) = cursor.opcode else {
            return;
        };

        if cursor.discard {
            let closes_discarded = cursor.fin
                && opcode == Opcode::Continuation
                && self.message.as_ref().is_some_and(|m| m.discard);
            if closes_discarded {
                self.message = None;
            }
            return;
        }

        match opcode {
            Opcode::Ping => out.push(Decoded::Control(ControlFrame::Ping(cursor.payload.freeze()))),
            Opcode::Pong => out.push(Decoded::Control(ControlFrame::Pong(cursor.payload.freeze()))),
            Opcode::Close => {
                let (code, reason) = parse_close_payload(&cursor.payload);
                out.push(Decoded::Control(ControlFrame::Close { code, reason }));
            }
            Opcode::Text if cursor.fin => out.push(text_message(cursor.payload)),
            Opcode::Text => {
                self.message = Some(OpenMessage {
                    opcode,
                    payload: cursor.payload,
                    discard: false,
                });
            }
            Opcode::Continuation => {
                if let Some(message) = self.message.as_mut() {
                    message.payload.extend_from_slice(&cursor.payload);
                }
                if cursor.fin {
                    if let Some(message) = self.message.take() {
                        debug_assert_eq!(message.opcode, Opcode::Text);
                        out.push(text_message(message.payload));
                    }
                }
            }
            // Rejected in check_frame.
            Opcode::Binary => {}
        }
    }
}

fn text_message(payload: BytesMut) -> Decoded {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Decoded::Text(text),
        Err(_) => Decoded::Violation(ProtocolViolation::InvalidUtf8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::Frame;

    /// Server-style unmasked frame.
    fn raw_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![if fin { 0x80 | opcode } else { opcode }];
        let len = payload.len();
        if len < 126 {
            data.push(len as u8);
        } else if len <= 65535 {
            data.push(126);
            data.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            data.push(127);
            data.extend_from_slice(&(len as u64).to_be_bytes());
        }
        data.extend_from_slice(payload);
        data
    }

    fn feed_in_chunks(data: &[u8], chunk: usize) -> Vec<Decoded> {
        let mut parser = FrameParser::new();
        let mut out = Vec::new();
        for piece in data.chunks(chunk) {
            parser.decode_into(piece, &mut out);
        }
        out
    }

    #[test]
    fn test_parse_simple_text_frame() {
        let mut parser = FrameParser::new();
        let decoded = parser.decode(&raw_frame(true, 0x1, b"Hello"));
        assert_eq!(decoded, vec![Decoded::Text("Hello".to_string())]);
        assert!(!parser.is_mid_message());
    }

    #[test]
    fn test_masked_round_trip_across_length_encodings() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let text = "z".repeat(len);
            let encoded = Frame::text(text.clone()).encode([0xA1, 0xB2, 0xC3, 0xD4]);

            let mut parser = FrameParser::new();
            let decoded = parser.decode(&encoded);
            assert_eq!(decoded, vec![Decoded::Text(text)], "length {}", len);
        }
    }

    #[test]
    fn test_chunking_is_transparent() {
        let mut stream = Vec::new();
        stream.extend(raw_frame(true, 0x1, b"first"));
        stream.extend(raw_frame(true, 0x9, b"ping!"));
        stream.extend(raw_frame(false, 0x1, b"frag"));
        stream.extend(raw_frame(true, 0x0, b"mented"));
        stream.extend(Frame::text("m".repeat(300)).encode([1, 2, 3, 4]));
        stream.extend(raw_frame(true, 0x1, &vec![b'q'; 70000]));
        stream.extend(raw_frame(true, 0x8, &[0x03, 0xE8, b'o', b'k']));

        let whole = feed_in_chunks(&stream, stream.len());
        assert_eq!(whole.len(), 6);
        for chunk in [1, 2, 3, 5, 7, 13, 126, 4096] {
            assert_eq!(feed_in_chunks(&stream, chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_fragmented_message_reassembles_once() {
        let mut stream = Vec::new();
        stream.extend(raw_frame(false, 0x1, b"Hel"));
        stream.extend(raw_frame(false, 0x0, b"lo, "));
        stream.extend(raw_frame(true, 0xA, b"pong"));
        stream.extend(raw_frame(true, 0x0, b"world"));

        let decoded = FrameParser::new().decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Control(ControlFrame::Pong(Bytes::from_static(b"pong"))),
                Decoded::Text("Hello, world".to_string()),
            ]
        );
    }

    #[test]
    fn test_partial_header_keeps_progress() {
        let data = Frame::text("a".repeat(200)).encode([5, 6, 7, 8]);
        let mut parser = FrameParser::new();

        // Stop inside the 16-bit length field, then inside the mask.
        assert!(parser.decode(&data[..3]).is_empty());
        assert!(parser.decode(&data[3..6]).is_empty());
        assert!(parser.is_mid_message());
        assert_eq!(parser.decode(&data[6..]), vec![Decoded::Text("a".repeat(200))]);
    }

    #[test]
    fn test_unaddressable_length_is_rejected_without_buffering() {
        let mut data = vec![0x81, 127];
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.extend_from_slice(&[0u8; 32]);

        let mut parser = FrameParser::new();
        let decoded = parser.decode(&data);
        assert_eq!(
            decoded,
            vec![Decoded::Violation(ProtocolViolation::FrameTooLarge(u64::MAX))]
        );
        assert_eq!(parser.cursor.payload.capacity(), 0);
        assert_eq!(ProtocolViolation::FrameTooLarge(0).close_code(), 1004);
        assert_eq!(ProtocolViolation::FrameTooLarge(0).reason(), "frame too large");
    }

    #[test]
    fn test_oversized_frame_is_skipped_and_parsing_continues() {
        let mut stream = raw_frame(true, 0x1, &[b'x'; 40]);
        stream.extend(raw_frame(true, 0x1, b"next"));

        let mut parser = FrameParser::with_max_payload_len(16);
        let decoded = parser.decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Violation(ProtocolViolation::FrameTooLarge(40)),
                Decoded::Text("next".to_string()),
            ]
        );
    }

    #[test]
    fn test_binary_frame_is_refused() {
        let mut stream = raw_frame(false, 0x2, &[1, 2, 3]);
        stream.extend(raw_frame(true, 0x0, &[4, 5]));
        stream.extend(raw_frame(true, 0x1, b"after"));

        let decoded = FrameParser::new().decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Violation(ProtocolViolation::UnsupportedBinary),
                Decoded::Text("after".to_string()),
            ]
        );
        assert_eq!(ProtocolViolation::UnsupportedBinary.close_code(), 1003);
    }

    #[test]
    fn test_unknown_opcode_reported_from_first_byte() {
        let mut parser = FrameParser::new();
        let decoded = parser.decode(&[0x83]);
        assert_eq!(
            decoded,
            vec![Decoded::Violation(ProtocolViolation::UnknownOpcode(0x3))]
        );
        assert!(parser.decode(&[2, 0xFF, 0xFF]).is_empty());
        assert_eq!(
            parser.decode(&raw_frame(true, 0x1, b"ok")),
            vec![Decoded::Text("ok".to_string())]
        );
    }

    #[test]
    fn test_close_frame_fields() {
        let decoded = FrameParser::new().decode(&raw_frame(true, 0x8, &[0x03, 0xE9, b'g', b'o']));
        assert_eq!(
            decoded,
            vec![Decoded::Control(ControlFrame::Close {
                code: Some(1001),
                reason: "go".to_string(),
            })]
        );
    }

    #[test]
    fn test_control_frame_too_large() {
        let decoded = FrameParser::new().decode(&raw_frame(true, 0x9, &[0u8; 126]));
        assert_eq!(
            decoded,
            vec![Decoded::Violation(ProtocolViolation::ControlFrameTooLarge(126))]
        );
    }

    #[test]
    fn test_fragmented_control_frame_is_rejected() {
        let mut stream = vec![0x09, 0x01, b'p'];
        stream.extend(raw_frame(true, 0x1, b"ok"));

        let decoded = FrameParser::new().decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Violation(ProtocolViolation::FragmentedControlFrame),
                Decoded::Text("ok".to_string()),
            ]
        );
        assert_eq!(ProtocolViolation::FragmentedControlFrame.close_code(), 1002);
    }

    #[test]
    fn test_oversized_continuation_abandons_message() {
        let mut stream = raw_frame(false, 0x1, b"ab");
        stream.extend(raw_frame(false, 0x0, &[b'X'; 40]));
        stream.extend(raw_frame(false, 0x0, b"more"));
        stream.extend(raw_frame(true, 0x0, b"cd"));

        let mut parser = FrameParser::with_max_payload_len(16);
        assert_eq!(
            parser.decode(&stream),
            vec![Decoded::Violation(ProtocolViolation::FrameTooLarge(40))]
        );
        assert!(!parser.is_mid_message());
        assert_eq!(
            parser.decode(&raw_frame(true, 0x1, b"fresh")),
            vec![Decoded::Text("fresh".to_string())]
        );
    }

    #[test]
    fn test_oversized_first_fragment_skips_its_continuations() {
        let mut stream = raw_frame(false, 0x1, &[b'X'; 40]);
        stream.extend(raw_frame(true, 0x0, b"cd"));
        stream.extend(raw_frame(true, 0x1, b"ok"));

        let decoded = FrameParser::with_max_payload_len(16).decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Violation(ProtocolViolation::FrameTooLarge(40)),
                Decoded::Text("ok".to_string()),
            ]
        );
    }

    #[test]
    fn test_new_message_while_fragment_open_is_interleaving() {
        let mut stream = raw_frame(false, 0x1, b"ab");
        stream.extend(raw_frame(true, 0x1, b"cd"));
        stream.extend(raw_frame(true, 0x0, b"late"));
        stream.extend(raw_frame(true, 0x1, b"ef"));

        let decoded = FrameParser::new().decode(&stream);
        assert_eq!(
            decoded,
            vec![
                Decoded::Violation(ProtocolViolation::InterleavedMessage),
                Decoded::Violation(ProtocolViolation::UnexpectedContinuation),
                Decoded::Text("ef".to_string()),
            ]
        );
        assert_eq!(ProtocolViolation::InterleavedMessage.close_code(), 1002);
    }

    #[test]
    fn test_stray_continuation() {
        let decoded = FrameParser::new().decode(&raw_frame(true, 0x0, b"orphan"));
        assert_eq!(
            decoded,
            vec![Decoded::Violation(ProtocolViolation::UnexpectedContinuation)]
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let decoded = FrameParser::new().decode(&raw_frame(true, 0x1, &[0xFF, 0xFE]));
        assert_eq!(decoded, vec![Decoded::Violation(ProtocolViolation::InvalidUtf8)]);
    }
}
