//! Client side of the WebSocket opening handshake.

use std::fmt;

use base64::prelude::*;
use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// GUID appended to the client key before hashing (RFC 6455 Section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Version` sent by this client (hybi draft 8).
pub const PROTOCOL_VERSION: &str = "8";

/// Largest response head accepted before giving up.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Errors that can occur during the opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// I/O error while exchanging the handshake
    Io(String),
    /// Peer closed the socket before a full response arrived
    ConnectionClosed,
    /// Request could not be built or response could not be parsed
    Malformed(String),
    /// Response head exceeded the size limit
    ResponseTooLarge,
    /// Status was not 101 Switching Protocols
    BadStatus(StatusCode),
    /// `Upgrade: websocket` header missing
    MissingUpgrade,
    /// `Connection: Upgrade` header missing
    MissingConnection,
    /// `Sec-WebSocket-Accept` did not match the key we sent
    AcceptMismatch {
        /// Value derived from our key
        expected: String,
        /// Value the server sent, if any
        actual: Option<String>,
    },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Io(msg) => write!(f, "I/O error during handshake: {}", msg),
            HandshakeError::ConnectionClosed => write!(f, "Connection closed during handshake"),
            HandshakeError::Malformed(msg) => write!(f, "Malformed handshake: {}", msg),
            HandshakeError::ResponseTooLarge => write!(f, "Handshake response too large"),
            HandshakeError::BadStatus(status) => {
                write!(f, "Unexpected handshake status: {}", status)
            }
            HandshakeError::MissingUpgrade => write!(f, "Missing `Upgrade: websocket` header"),
            HandshakeError::MissingConnection => write!(f, "Missing `Connection: Upgrade` header"),
            HandshakeError::AcceptMismatch { expected, actual } => write!(
                f,
                "Sec-WebSocket-Accept mismatch: expected {}, got {}",
                expected,
                actual.as_deref().unwrap_or("<none>")
            ),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Io(err.to_string())
    }
}

impl From<http::Error> for HandshakeError {
    fn from(err: http::Error) -> Self {
        HandshakeError::Malformed(err.to_string())
    }
}

/// Generate a random 16-byte, Base64-encoded `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Compute the `Sec-WebSocket-Accept` value a server must return for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The Upgrade request for one connection attempt.
#[derive(Debug)]
pub struct ClientHandshake {
    key: String,
    request: Request<()>,
}

impl ClientHandshake {
    /// Build a request with a freshly generated key.
    pub fn new(host: &str, path: &str, origin: &str) -> Result<Self, HandshakeError> {
        Self::with_key(host, path, origin, generate_key())
    }

    /// Build a request with a caller-provided key.
    pub fn with_key(
        host: &str,
        path: &str,
        origin: &str,
        key: String,
    ) -> Result<Self, HandshakeError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::HOST, host)
            .header(header::ORIGIN, origin)
            .header(header::SEC_WEBSOCKET_KEY, key.as_str())
            .header(header::SEC_WEBSOCKET_VERSION, PROTOCOL_VERSION)
            .body(())?;
        Ok(ClientHandshake { key, request })
    }

    /// The `Sec-WebSocket-Key` this request carries.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The request as an `http` value.
    pub fn request(&self) -> &Request<()> {
        &self.request
    }

    /// Serialize the request head for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.request.uri()).into_bytes();
        for (name, value) in self.request.headers() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Check a parsed response against this request.
    pub fn verify(&self, response: &Response<()>) -> Result<(), HandshakeError> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::BadStatus(response.status()));
        }

        let headers = response.headers();
        let upgrade_ok = headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        if !upgrade_ok {
            return Err(HandshakeError::MissingUpgrade);
        }

        let connection_ok = headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !connection_ok {
            return Err(HandshakeError::MissingConnection);
        }

        let expected = accept_key(&self.key);
        let actual = headers
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());
        if actual.as_deref() != Some(expected.as_str()) {
            return Err(HandshakeError::AcceptMismatch { expected, actual });
        }

        Ok(())
    }

    /// Send the request and validate the server's answer.
    ///
    /// Returns whatever bytes followed the response head in the same read;
    /// they belong to the first WebSocket frames.
    pub async fn perform<S>(&self, stream: &mut S) -> Result<BytesMut, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&self.to_bytes()).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(1024);
        let head_len = loop {
            if let Some(end) = find_head_end(&buffer) {
                break end;
            }
            if buffer.len() >= MAX_RESPONSE_HEAD {
                return Err(HandshakeError::ResponseTooLarge);
            }
            if stream.read_buf(&mut buffer).await? == 0 {
                return Err(HandshakeError::ConnectionClosed);
            }
        };

        let head = buffer.split_to(head_len);
        let response = parse_response(&head)?;
        self.verify(&response)?;
        Ok(buffer)
    }
}

/// Position just past the blank line ending an HTTP head.
pub fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse an HTTP/1.1 response head into an `http::Response`.
pub fn parse_response(head: &[u8]) -> Result<Response<()>, HandshakeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| HandshakeError::Malformed("response head is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::Malformed(format!(
            "bad status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| HandshakeError::Malformed(format!("bad status line: {}", status_line)))?;

    let mut response = Response::builder().status(status).body(())?;
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {}", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        response.headers_mut().append(name, value);
    }

    Ok(response)
}
