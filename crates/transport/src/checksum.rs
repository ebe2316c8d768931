//! Internet checksums for Echo messages
//!
//! ICMP over IPv4 sums the message alone (RFC 792 / RFC 1071). ICMPv6 also
//! covers a pseudo-header of source, destination, upper-layer length and
//! next-header (RFC 4443 section 2.3).

use std::net::Ipv6Addr;

/// IANA protocol number for ICMPv6, the pseudo-header next-header value
pub const IPPROTO_ICMPV6: u8 = 58;

/// Offset of the checksum field inside an ICMP/ICMPv6 header
pub const CHECKSUM_OFFSET: usize = 2;

/// Add `data` to a running one's-complement sum, 16 bits at a time.
///
/// An odd trailing byte is padded with a zero low byte.
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries back into the low 16 bits and complement
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an ICMP message (header with zeroed checksum field + payload)
pub fn icmpv4_checksum(message: &[u8]) -> u16 {
    finish(sum_words(0, message))
}

/// Checksum of an ICMPv6 message including the IPv6 pseudo-header
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, message: &[u8]) -> u16 {
    let len = message.len() as u32;

    let mut sum = sum_words(0, &src.octets());
    sum = sum_words(sum, &dst.octets());
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xffff);
    sum = sum.wrapping_add(u32::from(IPPROTO_ICMPV6));
    finish(sum_words(sum, message))
}
