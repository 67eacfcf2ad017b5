//! Chat server endpoints and room-to-server sharding.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

/// A chat server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `Host` header; the default port is left implicit.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when an endpoint string is not `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEndpointError(String);

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid endpoint (expected host:port): {}", self.0)
    }
}

impl std::error::Error for ParseEndpointError {}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseEndpointError(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| ParseEndpointError(s.to_string()))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Lowercase hex SHA-1 of `input`.
pub fn sha1_hex(input: &str) -> String {
    format!("{:x}", Sha1::digest(input.as_bytes()))
}

/// Sum of the ASCII codes of `sha1_hex(key)`, modulo `modulus`.
///
/// Every client must compute the same value for the same room so they all
/// land on the same chat server; do not change the digest or the summation.
pub fn hash_mod(key: &str, modulus: usize) -> usize {
    if modulus == 0 {
        return 0;
    }
    let sum: u64 = sha1_hex(key).bytes().map(u64::from).sum();
    (sum % modulus as u64) as usize
}

/// Pick the endpoint serving `room_id`, or a random one when there is no room.
pub fn select_endpoint<'a>(endpoints: &'a [Endpoint], room_id: Option<&str>) -> Option<&'a Endpoint> {
    let key = match room_id {
        Some(room) => room.to_string(),
        None => rand::random::<f64>().to_string(),
    };
    endpoints.get(hash_mod(&key, endpoints.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_mod_is_deterministic() {
        assert_eq!(hash_mod("abc", 2), hash_mod("abc", 2));
        // sha1("abc") = a9993e36...d89d, whose ASCII codes sum to 2675.
        assert_eq!(hash_mod("abc", 2), 1);
        assert_eq!(hash_mod("abc", 3), 2);
        assert_eq!(hash_mod("4e0b2a3d4fe7d0267c1c3c7d", 3), 0);
        assert_eq!(hash_mod("", 2), 0);
    }

    #[test]
    fn test_hash_mod_zero_modulus() {
        assert_eq!(hash_mod("abc", 0), 0);
    }

    #[test]
    fn test_select_endpoint_by_room() {
        let endpoints = vec![Endpoint::new("chat2", 80), Endpoint::new("chat3", 80)];
        assert_eq!(select_endpoint(&endpoints, Some("abc")), Some(&endpoints[1]));
        assert!(select_endpoint(&endpoints, None).is_some());
        assert_eq!(select_endpoint(&[], Some("abc")), None);
    }

    #[test]
    fn test_parse_and_display() {
        let endpoint: Endpoint = "chat2.turntable.fm:80".parse().unwrap();
        assert_eq!(endpoint.host(), "chat2.turntable.fm");
        assert_eq!(endpoint.port(), 80);
        assert_eq!(endpoint.to_string(), "chat2.turntable.fm:80");
        assert_eq!(endpoint.host_header(), "chat2.turntable.fm");
        assert_eq!(Endpoint::new("127.0.0.1", 9000).host_header(), "127.0.0.1:9000");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:http".parse::<Endpoint>().is_err());
    }
}
