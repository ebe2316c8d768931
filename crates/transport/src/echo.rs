//! ICMP Echo transports
//!
//! One raw socket per address family, split into a receiving half and a
//! sending half that each own a fixed buffer sized at open time. The send
//! buffer keeps room for the ICMP header in front of the payload so callers
//! can write straight into [`EchoSink::payload_mut`] and send without a
//! copy. The halves share the socket through a duplicated descriptor.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, warn};

use echotun_core::{EchotunError, Result};

use crate::checksum::{icmpv4_checksum, icmpv6_checksum, CHECKSUM_OFFSET};
use crate::source::SourceCache;

/// Size of the ICMP / ICMPv6 Echo header (type, code, checksum, id, seq)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Largest IPv4 header the kernel may prepend on raw ICMP reads
const MAX_IPV4_HEADER: usize = 60;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Address family served by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn echo_types(self) -> (u8, u8) {
        match self {
            Family::V4 => (ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
            Family::V6 => (ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("icmp"),
            Family::V6 => f.write_str("icmp6"),
        }
    }
}

/// Envelope fields of one received Echo message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoMeta {
    pub source: IpAddr,
    pub reply: bool,
    pub id: u16,
    pub seq: u16,
    /// Payload length after the ICMP header
    pub len: usize,
}

/// Receiving half of an Echo transport
pub trait EchoSource: AsRawFd {
    /// Read one Echo message without blocking. `None` when nothing usable
    /// is pending.
    fn receive(&mut self) -> Option<EchoMeta>;

    /// Payload of the message last returned by [`receive`](Self::receive)
    fn payload(&self) -> &[u8];
}

/// Sending half of an Echo transport, owning a pre-sized payload buffer
pub trait EchoSink {
    fn family(&self) -> Family;

    /// Largest payload [`send`](Self::send) accepts
    fn payload_capacity(&self) -> usize;

    /// Payload region of the send buffer, read-only
    fn payload(&self) -> &[u8];

    /// Payload region of the send buffer
    fn payload_mut(&mut self) -> &mut [u8];

    /// Send the first `payload_len` bytes of the payload region as an Echo
    /// Request or Reply.
    ///
    /// Returns `Ok(false)` when the send did not happen (unreachable peer,
    /// full socket buffer, wrong family). Only an oversized payload is an
    /// error.
    fn send(
        &mut self,
        payload_len: usize,
        dest: IpAddr,
        reply: bool,
        id: u16,
        seq: u16,
    ) -> Result<bool>;
}

/// Socket tuning applied at open time
#[derive(Debug, Clone, Copy)]
pub struct EchoSocketOptions {
    /// Largest Echo payload (tunnel header + tunnelled data) either half handles
    pub max_payload: usize,
    /// `SO_RCVBUF`, skipped when zero
    pub recv_buffer: usize,
    /// `SO_SNDBUF`, skipped when zero
    pub send_buffer: usize,
}

/// How the ICMP checksum gets filled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumMode {
    Kernel,
    UserSpace,
}

/// Open a raw Echo socket and split it into its two halves
pub fn open_echo_socket(
    family: Family,
    options: EchoSocketOptions,
) -> Result<(EchoReceiver, EchoSender)> {
    let (domain, protocol) = match family {
        Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
        Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .map_err(|e| EchotunError::Socket(format!("creating {} socket: {}", family, e)))?;

    if options.recv_buffer > 0 {
        if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer) {
            warn!("SO_RCVBUF {} on {} socket: {}", options.recv_buffer, family, e);
        }
    }
    if options.send_buffer > 0 {
        if let Err(e) = socket.set_send_buffer_size(options.send_buffer) {
            warn!("SO_SNDBUF {} on {} socket: {}", options.send_buffer, family, e);
        }
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| EchotunError::Socket(format!("non-blocking {} socket: {}", family, e)))?;

    let checksum = match family {
        // IPv4 raw ICMP never gets a kernel checksum
        Family::V4 => ChecksumMode::UserSpace,
        Family::V6 => match enable_kernel_checksum(&socket) {
            Ok(()) => ChecksumMode::Kernel,
            Err(e) => {
                warn!("IPV6_CHECKSUM not supported ({}), using userspace checksum", e);
                ChecksumMode::UserSpace
            }
        },
    };

    let send_socket = socket
        .try_clone()
        .map_err(|e| EchotunError::Socket(format!("duplicating {} socket: {}", family, e)))?;

    let receive_len = match family {
        Family::V4 => MAX_IPV4_HEADER + ICMP_HEADER_SIZE + options.max_payload,
        Family::V6 => ICMP_HEADER_SIZE + options.max_payload,
    };

    let receiver = EchoReceiver {
        socket,
        family,
        buffer: vec![0u8; receive_len],
        payload_start: 0,
        payload_end: 0,
    };

    let sender = EchoSender {
        socket: send_socket,
        family,
        buffer: vec![0u8; ICMP_HEADER_SIZE + options.max_payload],
        checksum,
        sources: SourceCache::new(),
    };

    Ok((receiver, sender))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn enable_kernel_checksum(socket: &Socket) -> io::Result<()> {
    let offset = CHECKSUM_OFFSET as libc::c_int;
    // SAFETY: passes a pointer to a live c_int together with its exact size
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_CHECKSUM,
            (&offset as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn enable_kernel_checksum(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "IPV6_CHECKSUM"))
}

/// Receiving half of an Echo socket
pub struct EchoReceiver {
    socket: Socket,
    family: Family,
    buffer: Vec<u8>,
    payload_start: usize,
    payload_end: usize,
}

impl EchoSource for EchoReceiver {
    /// Returns `None` when nothing is pending, on any receive error (logged),
    /// and for anything that is not an Echo Request/Reply with code 0.
    fn receive(&mut self) -> Option<EchoMeta> {
        let buf = as_uninit(&mut self.buffer);
        let (len, from) = match self.socket.recv_from(buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return None,
            Err(e) => {
                error!("Error receiving {} packet: {}", self.family, e);
                return None;
            }
        };

        let source = from.as_socket()?.ip();
        let datagram = &self.buffer[..len];

        let icmp_start = match self.family {
            Family::V4 => ipv4_header_len(datagram)?,
            Family::V6 => 0,
        };
        if len < icmp_start + ICMP_HEADER_SIZE {
            return None;
        }

        let header = &datagram[icmp_start..icmp_start + ICMP_HEADER_SIZE];
        let (request, reply) = self.family.echo_types();
        if (header[0] != request && header[0] != reply) || header[1] != 0 {
            return None;
        }

        self.payload_start = icmp_start + ICMP_HEADER_SIZE;
        self.payload_end = len;

        Some(EchoMeta {
            source,
            reply: header[0] == reply,
            id: u16::from_be_bytes([header[4], header[5]]),
            seq: u16::from_be_bytes([header[6], header[7]]),
            len: len - self.payload_start,
        })
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_start..self.payload_end]
    }
}

impl AsRawFd for EchoReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Sending half of an Echo socket
pub struct EchoSender {
    socket: Socket,
    family: Family,
    buffer: Vec<u8>,
    checksum: ChecksumMode,
    sources: SourceCache,
}

impl EchoSink for EchoSender {
    fn family(&self) -> Family {
        self.family
    }

    fn payload_capacity(&self) -> usize {
        self.buffer.len() - ICMP_HEADER_SIZE
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[ICMP_HEADER_SIZE..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[ICMP_HEADER_SIZE..]
    }

    fn send(
        &mut self,
        payload_len: usize,
        dest: IpAddr,
        reply: bool,
        id: u16,
        seq: u16,
    ) -> Result<bool> {
        if payload_len > self.payload_capacity() {
            return Err(EchotunError::PacketTooBig {
                length: payload_len,
                capacity: self.payload_capacity(),
            });
        }
        if Family::of(&dest) != self.family {
            debug!("Cannot send to {} over {} socket", dest, self.family);
            return Ok(false);
        }

        let (request_type, reply_type) = self.family.echo_types();
        let total = ICMP_HEADER_SIZE + payload_len;
        let header = &mut self.buffer[..ICMP_HEADER_SIZE];
        header[0] = if reply { reply_type } else { request_type };
        header[1] = 0;
        header[2..4].copy_from_slice(&[0, 0]);
        header[4..6].copy_from_slice(&id.to_be_bytes());
        header[6..8].copy_from_slice(&seq.to_be_bytes());

        if self.checksum == ChecksumMode::UserSpace {
            let checksum = match dest {
                IpAddr::V4(_) => icmpv4_checksum(&self.buffer[..total]),
                IpAddr::V6(dest6) => match self.sources.resolve(dest6) {
                    Some(src) => icmpv6_checksum(&src, &dest6, &self.buffer[..total]),
                    None => return Ok(false),
                },
            };
            self.buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2]
                .copy_from_slice(&checksum.to_be_bytes());
        }

        let target = SockAddr::from(SocketAddr::new(dest, 0));
        match self.socket.send_to(&self.buffer[..total], &target) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Send to {} failed: {}", dest, e);
                Ok(false)
            }
        }
    }
}

/// Length of the IPv4 header at the front of a raw ICMP read
fn ipv4_header_len(datagram: &[u8]) -> Option<usize> {
    let first = *datagram.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(first & 0x0f) * 4;
    if header_len < 20 || datagram.len() < header_len {
        return None;
    }
    Some(header_len)
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8 and the slice is
    // already initialised; recv only ever writes initialised bytes into it
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}
