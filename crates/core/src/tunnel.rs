//! Handshake payloads
//!
//! A client opens a session with a connection request, answers the relay's
//! challenge, and is told its tunnel address in the connection accept.
//! Multi-byte integers are in network byte order.

use std::net::Ipv4Addr;

use crate::{EchotunError, Result};

/// Size of the random challenge the relay issues per session
pub const CHALLENGE_SIZE: usize = 32;

/// Connection request without a version byte: `[max_polls][desired_ip;4]`
pub const LEGACY_CONNECT_SIZE: usize = 5;

/// Versioned connection request: `[version][max_polls][desired_ip;4]`
pub const VERSIONED_CONNECT_SIZE: usize = 6;

/// First protocol version that answers challenges with HMAC-SHA256
pub const HMAC_MIN_VERSION: u8 = 2;

/// Size of the connection accept payload (the leased tunnel address)
pub const ACCEPT_SIZE: usize = 4;

/// Connection request sent by a client that wants a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Protocol version, absent in the legacy layout
    pub version: Option<u8>,
    /// Number of poll correlators the relay may hold for this client
    pub max_polls: u8,
    /// Tunnel address the client would like (0.0.0.0 for "any")
    pub desired_addr: Ipv4Addr,
}

impl ConnectRequest {
    /// Parse a request, accepting only the two known payload sizes
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (version, rest) = match payload.len() {
            LEGACY_CONNECT_SIZE => (None, payload),
            VERSIONED_CONNECT_SIZE => (Some(payload[0]), &payload[1..]),
            other => {
                return Err(EchotunError::InvalidPayload(format!(
                    "connection request of {} bytes",
                    other
                )))
            }
        };

        let max_polls = rest[0];
        let desired_addr = Ipv4Addr::new(rest[1], rest[2], rest[3], rest[4]);

        Ok(Self {
            version,
            max_polls,
            desired_addr,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERSIONED_CONNECT_SIZE);
        if let Some(version) = self.version {
            out.push(version);
        }
        out.push(self.max_polls);
        out.extend_from_slice(&self.desired_addr.octets());
        out
    }

    /// Whether the client will answer the challenge with an HMAC tag
    pub fn uses_hmac(&self) -> bool {
        self.version.is_some_and(|v| v >= HMAC_MIN_VERSION)
    }
}

/// Encode the connection accept payload
pub fn encode_accept(tunnel_addr: Ipv4Addr) -> [u8; ACCEPT_SIZE] {
    tunnel_addr.octets()
}

/// Decode a connection accept payload
pub fn decode_accept(payload: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; ACCEPT_SIZE] = payload.try_into().map_err(|_| {
        EchotunError::InvalidPayload(format!("connection accept of {} bytes", payload.len()))
    })?;
    Ok(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_legacy_request() {
        let req = ConnectRequest::decode(&[3, 10, 0, 0, 120]).unwrap();
        assert_eq!(req.version, None);
        assert_eq!(req.max_polls, 3);
        assert_eq!(req.desired_addr, Ipv4Addr::new(10, 0, 0, 120));
        assert!(!req.uses_hmac());
    }

    #[test]
    fn test_decode_versioned_request() {
        let req = ConnectRequest::decode(&[2, 1, 0, 0, 0, 0]).unwrap();
        assert_eq!(req.version, Some(2));
        assert_eq!(req.max_polls, 1);
        assert_eq!(req.desired_addr, Ipv4Addr::UNSPECIFIED);
        assert!(req.uses_hmac());
    }

    #[test]
    fn test_version_one_is_not_hmac() {
        let req = ConnectRequest::decode(&[1, 4, 0, 0, 0, 0]).unwrap();
        assert!(!req.uses_hmac());
    }

    #[test]
    fn test_decode_rejects_other_sizes() {
        assert!(ConnectRequest::decode(&[]).is_err());
        assert!(ConnectRequest::decode(&[1, 2, 3, 4]).is_err());
        assert!(ConnectRequest::decode(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_encode_matches_layout() {
        let req = ConnectRequest {
            version: Some(2),
            max_polls: 8,
            desired_addr: Ipv4Addr::new(10, 1, 2, 3),
        };
        assert_eq!(req.encode(), vec![2, 8, 10, 1, 2, 3]);

        let legacy = ConnectRequest {
            version: None,
            ..req
        };
        assert_eq!(legacy.encode().len(), LEGACY_CONNECT_SIZE);
    }

    #[test]
    fn test_accept_payload() {
        let addr = Ipv4Addr::new(10, 0, 0, 100);
        let bytes = encode_accept(addr);
        assert_eq!(bytes, [10, 0, 0, 100]);
        assert_eq!(decode_accept(&bytes).unwrap(), addr);
        assert!(decode_accept(&[10, 0, 0]).is_err());
    }
}
