//! Tunnel address leases
//!
//! The tunnel network is a /24. `.1` is the relay's own TUN address, `.2`
//! the TUN peer address, `.255` broadcast. Everything else can be leased to
//! a client. Automatic allocation walks `.100`–`.254` round-robin and only
//! falls back to the low range once that window is exhausted.

use std::collections::HashSet;
use std::net::Ipv4Addr;

const RELAY_OFFSET: u8 = 1;
const PEER_OFFSET: u8 = 2;
const BROADCAST_OFFSET: u8 = 255;

/// Lowest host offset a client may ask for
const FIRST_HOST_OFFSET: u8 = 3;

/// First offset handed out by round-robin allocation
pub const FIRST_LEASE_OFFSET: u8 = 100;

/// Free/used set of tunnel addresses
#[derive(Debug, Clone)]
pub struct LeasePool {
    network: u32,
    leased: HashSet<Ipv4Addr>,
    /// Offset of the last round-robin allocation
    cursor: u8,
}

impl LeasePool {
    /// Create a pool for the /24 containing `network`
    pub fn new(network: Ipv4Addr) -> Self {
        Self {
            network: u32::from(network) & 0xffff_ff00,
            leased: HashSet::new(),
            cursor: FIRST_LEASE_OFFSET - 1,
        }
    }

    fn addr(&self, offset: u8) -> Ipv4Addr {
        Ipv4Addr::from(self.network | u32::from(offset))
    }

    pub fn network(&self) -> Ipv4Addr {
        self.addr(0)
    }

    /// Address of the relay's TUN interface
    pub fn relay_addr(&self) -> Ipv4Addr {
        self.addr(RELAY_OFFSET)
    }

    /// Peer address of the relay's TUN interface
    pub fn peer_addr(&self) -> Ipv4Addr {
        self.addr(PEER_OFFSET)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.addr(BROADCAST_OFFSET)
    }

    /// Host offset of `addr` when it lies in this network
    fn offset_of(&self, addr: Ipv4Addr) -> Option<u8> {
        let raw = u32::from(addr);
        if raw & 0xffff_ff00 == self.network {
            Some((raw & 0xff) as u8)
        } else {
            None
        }
    }

    fn is_free(&self, offset: u8) -> bool {
        !self.leased.contains(&self.addr(offset))
    }

    /// Reserve an address, honoring `desired` when it is a free client
    /// address of this network. Returns `None` when the pool is exhausted.
    pub fn reserve(&mut self, desired: Ipv4Addr) -> Option<Ipv4Addr> {
        if let Some(offset) = self.offset_of(desired) {
            if (FIRST_HOST_OFFSET..BROADCAST_OFFSET).contains(&offset) && self.is_free(offset) {
                self.leased.insert(desired);
                return Some(desired);
            }
        }

        let window = BROADCAST_OFFSET - FIRST_LEASE_OFFSET;
        for _ in 0..window {
            self.cursor = if self.cursor >= BROADCAST_OFFSET - 1 {
                FIRST_LEASE_OFFSET
            } else {
                self.cursor + 1
            };
            if self.is_free(self.cursor) {
                let addr = self.addr(self.cursor);
                self.leased.insert(addr);
                return Some(addr);
            }
        }

        let offset = (FIRST_HOST_OFFSET..FIRST_LEASE_OFFSET).find(|&o| self.is_free(o))?;
        let addr = self.addr(offset);
        self.leased.insert(addr);
        Some(addr)
    }

    /// Return an address to the pool
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.leased.remove(&addr)
    }

    pub fn is_leased(&self, addr: Ipv4Addr) -> bool {
        self.leased.contains(&addr)
    }

    /// Number of addresses currently leased
    pub fn leased(&self) -> usize {
        self.leased.len()
    }
}
