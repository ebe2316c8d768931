//! Local source address lookup for user-space ICMPv6 checksums
//!
//! The pseudo-header must carry the address the kernel will actually send
//! from. Connecting a throwaway UDP socket to the destination and reading
//! back its local address yields exactly that. Consecutive sends usually go
//! to the same peer, so the last mapping is kept.

use std::net::{Ipv6Addr, SocketAddr, UdpSocket};

use tracing::debug;

/// Port used for the connect probe; nothing is ever sent to it
const PROBE_PORT: u16 = 80;

/// Single-entry cache of destination → selected source address
#[derive(Debug, Default)]
pub struct SourceCache {
    last: Option<(Ipv6Addr, Ipv6Addr)>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source address the kernel would use towards `dest`
    pub fn resolve(&mut self, dest: Ipv6Addr) -> Option<Ipv6Addr> {
        self.resolve_with(dest, probe_source)
    }

    /// Like [`resolve`](Self::resolve) with a caller-supplied probe
    pub fn resolve_with<F>(&mut self, dest: Ipv6Addr, probe: F) -> Option<Ipv6Addr>
    where
        F: FnOnce(Ipv6Addr) -> Option<Ipv6Addr>,
    {
        if let Some((cached_dest, cached_src)) = self.last {
            if cached_dest == dest {
                return Some(cached_src);
            }
        }

        let src = probe(dest)?;
        self.last = Some((dest, src));
        Some(src)
    }
}

/// Connect a UDP socket towards `dest` and inspect the chosen local address
pub fn probe_source(dest: Ipv6Addr) -> Option<Ipv6Addr> {
    let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).ok()?;
    if let Err(e) = socket.connect((dest, PROBE_PORT)) {
        debug!("No route to {} for source probe: {}", dest, e);
        return None;
    }
    match socket.local_addr().ok()? {
        SocketAddr::V6(local) => Some(*local.ip()),
        SocketAddr::V4(_) => None,
    }
}
