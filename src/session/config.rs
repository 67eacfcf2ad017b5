//! Session configuration.

use crate::transport::TransportOptions;

use super::endpoint::Endpoint;

/// Status asserted with `presence.update` unless configured otherwise.
pub const DEFAULT_PRESENCE_STATUS: &str = "available";

/// Chat servers tried when no endpoints are configured.
pub fn default_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new("chat2.turntable.fm", 80),
        Endpoint::new("chat3.turntable.fm", 80),
    ]
}

/// Tunables for a [`Session`](super::Session).
///
/// # Example
///
/// ```
/// use tt_session::{Endpoint, SessionConfig};
///
/// let config = SessionConfig::default()
///     .with_endpoints(vec![Endpoint::new("127.0.0.1", 9000)])
///     .with_read_buffer_size(4096);
/// assert_eq!(config.endpoints.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Ordered candidate chat servers; rooms are sharded across them
    pub endpoints: Vec<Endpoint>,
    /// Status sent with `presence.update`
    pub presence_status: String,
    /// Handshake and read-loop settings
    pub transport: TransportOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            endpoints: default_endpoints(),
            presence_status: DEFAULT_PRESENCE_STATUS.to_string(),
            transport: TransportOptions::default(),
        }
    }
}

impl SessionConfig {
    /// Replace the candidate endpoints.
    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Set the Upgrade request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.transport.path = path.into();
        self
    }

    /// Set the `Origin` header.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.transport.origin = origin.into();
        self
    }

    /// Set how many bytes each socket read requests.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.transport.read_buffer_size = size;
        self
    }

    /// Cap the payload size accepted in a single frame.
    pub fn with_max_payload_len(mut self, len: u64) -> Self {
        self.transport.max_payload_len = len;
        self
    }

    /// Set the presence status.
    pub fn with_presence_status(mut self, status: impl Into<String>) -> Self {
        self.presence_status = status.into();
        self
    }
}

/// Account the session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account id
    pub user_id: String,
    /// Auth token
    pub auth_token: String,
    /// Room to join once authenticated
    pub room_id: Option<String>,
}

impl Credentials {
    /// Credentials without an initial room.
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Credentials {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
            room_id: None,
        }
    }

    /// Join `room_id` once connected.
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoints, default_endpoints());
        assert_eq!(config.presence_status, "available");
        assert_eq!(config.transport.path, "/socket.io/websocket");
        assert_eq!(config.transport.origin, "http://turntable.fm");
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_path("/ws")
            .with_origin("http://localhost")
            .with_max_payload_len(1024)
            .with_presence_status("away");
        assert_eq!(config.transport.path, "/ws");
        assert_eq!(config.transport.origin, "http://localhost");
        assert_eq!(config.transport.max_payload_len, 1024);
        assert_eq!(config.presence_status, "away");

        let creds = Credentials::new("u", "a").with_room("r");
        assert_eq!(creds.room_id.as_deref(), Some("r"));
    }
}
