//! Scripted WebSocket server side for tests.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::wire;
use crate::websocket::{Decoded, FrameParser, Opcode, accept_key};

/// Server half of a test connection: answers the upgrade, writes unmasked
/// frames and decodes the client's masked ones.
pub(crate) struct FakeServer<S> {
    stream: S,
    parser: FrameParser,
    pending: Vec<Decoded>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FakeServer<S> {
    /// Read the Upgrade request and answer with a valid 101.
    pub(crate) async fn accept(mut stream: S) -> Self {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed during handshake");
            request.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(request).unwrap();
        let key = text
            .lines()
            .find_map(|line| line.strip_prefix("sec-websocket-key: "))
            .unwrap()
            .trim()
            .to_string();
        let reply = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        );
        stream.write_all(reply.as_bytes()).await.unwrap();
        FakeServer {
            stream,
            parser: FrameParser::new(),
            pending: Vec::new(),
        }
    }

    /// Write one unmasked, final frame.
    pub(crate) async fn send_raw(&mut self, opcode: Opcode, payload: &[u8]) {
        let mut frame = vec![0x80 | opcode as u8];
        let len = payload.len();
        if len < 126 {
            frame.push(len as u8);
        } else if len <= 65535 {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Write bytes as they are, framing included.
    pub(crate) async fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Send a session body wrapped in its length prefix.
    pub(crate) async fn send_body(&mut self, body: &str) {
        self.send_raw(Opcode::Text, wire::encode(body).as_bytes())
            .await;
    }

    /// Next item the client sent, or `None` at EOF.
    pub(crate) async fn next(&mut self) -> Option<Decoded> {
        let mut buf = [0u8; 4096];
        while self.pending.is_empty() {
            let n = self.stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.pending = self.parser.decode(&buf[..n]);
        }
        Some(self.pending.remove(0))
    }

    /// Next text message, skipping control frames.
    pub(crate) async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.next().await? {
                Decoded::Text(text) => return Some(text),
                _ => continue,
            }
        }
    }

    /// Next session document the client sent.
    pub(crate) async fn next_document(&mut self) -> Value {
        let text = self.next_text().await.expect("client closed");
        let bodies = wire::decode(&text).unwrap();
        assert_eq!(bodies.len(), 1);
        serde_json::from_str(bodies[0]).unwrap()
    }
}
