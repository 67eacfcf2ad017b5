//! Session message framing.
//!
//! Every session message travels as `~m~<byte length>~m~<body>`. The body is
//! a JSON document, a heartbeat (`~h~` plus digits) echoed back verbatim, or
//! the literal `no_session` asking the client to authenticate.

use std::fmt;

/// Delimiter around the length prefix.
pub const MESSAGE_MARKER: &str = "~m~";

/// Prefix of a heartbeat body.
pub const HEARTBEAT_MARKER: &str = "~h~";

/// Body sent by a server that holds no session for this client.
pub const NO_SESSION: &str = "no_session";

/// Malformed session framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message does not start with `~m~`
    MissingMarker,
    /// Length prefix is not a terminated decimal number
    BadLength,
    /// Declared length runs past the end of the message or splits a character
    Truncated {
        /// Bytes the prefix announced
        declared: usize,
        /// Bytes actually available
        available: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::MissingMarker => write!(f, "Message does not start with ~m~"),
            WireError::BadLength => write!(f, "Invalid length prefix"),
            WireError::Truncated {
                declared,
                available,
            } => write!(
                f,
                "Message declares {} bytes but {} are available",
                declared, available
            ),
        }
    }
}

impl std::error::Error for WireError {}

/// Wrap a body in the length prefix.
pub fn encode(body: &str) -> String {
    format!("{MESSAGE_MARKER}{}{MESSAGE_MARKER}{body}", body.len())
}

/// Split one transport message into the bodies it carries.
///
/// A server may pack several prefixed bodies into one WebSocket message.
pub fn decode(mut message: &str) -> Result<Vec<&str>, WireError> {
    let mut bodies = Vec::new();
    while !message.is_empty() {
        let rest = message
            .strip_prefix(MESSAGE_MARKER)
            .ok_or(WireError::MissingMarker)?;
        let (digits, rest) = rest.split_once(MESSAGE_MARKER).ok_or(WireError::BadLength)?;
        let declared: usize = digits.parse().map_err(|_| WireError::BadLength)?;
        let body = rest.get(..declared).ok_or(WireError::Truncated {
            declared,
            available: rest.len(),
        })?;
        bodies.push(body);
        message = &rest[declared..];
    }
    Ok(bodies)
}

/// What a decoded body means to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body<'a> {
    /// Heartbeat to echo back unchanged
    Heartbeat(&'a str),
    /// Server has no session; authenticate and assert presence
    NoSession,
    /// JSON document
    Document(&'a str),
}

/// Classify a decoded body.
pub fn classify(body: &str) -> Body<'_> {
    if body
        .strip_prefix(HEARTBEAT_MARKER)
        .is_some_and(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
    {
        Body::Heartbeat(body)
    } else if body == NO_SESSION {
        Body::NoSession
    } else {
        Body::Document(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_byte_length() {
        assert_eq!(encode("{}"), "~m~2~m~{}");
        assert_eq!(encode("é"), "~m~2~m~é");
        assert_eq!(encode(""), "~m~0~m~");
    }

    #[test]
    fn test_decode_single_and_packed() {
        assert_eq!(decode("~m~10~m~no_session"), Ok(vec!["no_session"]));
        assert_eq!(
            decode("~m~4~m~~h~1~m~2~m~{}"),
            Ok(vec!["~h~1", "{}"])
        );
        assert_eq!(decode("~m~3~m~~m~"), Ok(vec!["~m~"]));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode("no_session"), Err(WireError::MissingMarker));
        assert_eq!(decode("~m~x~m~abc"), Err(WireError::BadLength));
        assert_eq!(decode("~m~12"), Err(WireError::BadLength));
        assert_eq!(
            decode("~m~9~m~abc"),
            Err(WireError::Truncated {
                declared: 9,
                available: 3
            })
        );
        // Length that would split a multi-byte character.
        assert!(matches!(decode("~m~1~m~é"), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("~h~42"), Body::Heartbeat("~h~42"));
        assert_eq!(classify("~h~"), Body::Heartbeat("~h~"));
        assert_eq!(classify("no_session"), Body::NoSession);
        assert_eq!(classify("{\"msgid\":1}"), Body::Document("{\"msgid\":1}"));
        assert_eq!(classify("~h~x"), Body::Document("~h~x"));
    }
}
