//! TUN device backed by `tun-rs`

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use echotun_transport::TunDevice;
use tracing::info;
use tun_rs::{DeviceBuilder, SyncDevice};

use crate::{DaemonError, Result};

/// Prefix length of the tunnel network
const TUNNEL_PREFIX: u8 = 24;

/// Point-to-point TUN interface carrying the tunnel network
pub struct TunInterface {
    device: SyncDevice,
    name: String,
}

impl TunInterface {
    /// Create and configure the interface as `local` with peer `peer`
    pub fn open(name: Option<&str>, local: Ipv4Addr, peer: Ipv4Addr, mtu: u16) -> Result<Self> {
        let mut builder = DeviceBuilder::new()
            .ipv4(local, TUNNEL_PREFIX, Some(peer))
            .mtu(mtu);
        if let Some(name) = name {
            builder = builder.name(name);
        }

        let device = builder
            .build_sync()
            .map_err(|e| DaemonError::Device(format!("creating tunnel device: {}", e)))?;
        device
            .set_nonblocking(true)
            .map_err(|e| DaemonError::Device(format!("non-blocking tunnel device: {}", e)))?;
        let name = device
            .name()
            .unwrap_or_else(|_| name.unwrap_or("tun").to_string());

        info!(
            "Opened tunnel device {} ({}/{} peer {}, mtu {})",
            name, local, TUNNEL_PREFIX, peer, mtu
        );
        Ok(Self { device, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRawFd for TunInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl TunDevice for TunInterface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf)
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.device.send(frame).map(|_| ())
    }
}
