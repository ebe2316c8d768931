//! echotun Transport
//!
//! ICMP and ICMPv6 Echo transports over raw sockets, the Internet checksums
//! they need when the kernel does not fill them in, and the contract the
//! relay expects from the virtual network interface.

mod checksum;
mod echo;
mod source;
mod tun;

pub use checksum::*;
pub use echo::*;
pub use source::*;
pub use tun::*;
