//! Virtual network interface contract
//!
//! The relay only reads and writes whole IP frames; creating and addressing
//! the device happens elsewhere.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

/// Minimum IPv4 header length
pub const IPV4_HEADER_MIN: usize = 20;

/// A point-to-point device carrying raw IP frames
pub trait TunDevice: AsRawFd {
    /// Read one frame into `buf`. `Ok(0)` means the device was closed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame
    fn write(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Source and destination of an IPv4 frame, `None` for anything else
pub fn ipv4_addresses(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if frame.len() < IPV4_HEADER_MIN || frame[0] >> 4 != 4 {
        return None;
    }
    let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    Some((src, dst))
}
