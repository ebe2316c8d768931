//! Integration tests for many clients competing for the tunnel network
//!
//! 1. Every established client holds a distinct lease
//! 2. The /24 runs out after 252 clients and recovers on release
//! 3. Misbehaving and unknown peers never create sessions

mod common;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use common::{relay, take_for, tunnel_net, TestClient};
use echotun_core::{PacketType, WireHeader, CLIENT_MAGIC};
use echotun_relay::testing::RecordingLink;
use echotun_relay::{EchoHandler, KEEP_ALIVE_INTERVAL};
use echotun_transport::EchoMeta;

fn client_v4(n: u32) -> TestClient {
    TestClient::new(&Ipv4Addr::from(0xc000_0200 + n).to_string())
}

fn client_v6(n: u16) -> TestClient {
    TestClient::new(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n).to_string())
}

// =============================================================================
// 1. DISTINCT LEASES
// =============================================================================

#[test]
fn test_leases_are_unique_across_families() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();
    let mut leases = HashSet::new();

    for n in 0..40 {
        let mut client = if n % 2 == 0 { client_v4(n) } else { client_v6(n as u16) };
        let last = client.connect(&mut relay, &mut link);
        assert_eq!(last.header.packet_type, PacketType::ConnectionAccept);
        let lease = client.tunnel_addr.unwrap();
        assert!(leases.insert(lease), "{} leased twice", lease);
        assert_eq!(lease.octets()[..3], [10, 77, 0]);
    }

    assert_eq!(relay.sessions().len(), 40);
    assert!(relay.sessions().is_consistent());
}

#[test]
fn test_conflicting_desired_addresses() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();
    let wanted = Ipv4Addr::new(10, 77, 0, 9);
    let mut granted = Vec::new();

    for n in 0..3 {
        let mut client = client_v4(n);
        client.request(&mut relay, &mut link, wanted);
        let challenge = take_for(&mut link, client.addr).remove(0);
        client.answer(&mut relay, &mut link, &challenge.payload);
        let accept = take_for(&mut link, client.addr).remove(0);
        granted.push(echotun_core::decode_accept(&accept.payload).unwrap());
    }

    assert_eq!(granted[0], wanted);
    assert_ne!(granted[1], wanted);
    assert_ne!(granted[2], wanted);
    assert_ne!(granted[1], granted[2]);
}

// =============================================================================
// 2. EXHAUSTION
// =============================================================================

#[test]
fn test_pool_exhaustion_and_recovery() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();
    relay.on_start(&mut link).unwrap();

    let mut clients: Vec<TestClient> = (0..252).map(client_v4).collect();
    for client in &mut clients {
        client.request(&mut relay, &mut link, Ipv4Addr::UNSPECIFIED);
    }
    link.take_sent();
    assert_eq!(relay.leases().leased(), 252);

    let mut late = client_v4(300);
    late.request(&mut relay, &mut link, Ipv4Addr::UNSPECIFIED);
    let sent = take_for(&mut link, late.addr);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header.packet_type, PacketType::ServerFull);
    assert!(relay.session_by_real(&late.addr).is_none());

    // Half-open sessions that never answer expire and free their leases
    link.advance(KEEP_ALIVE_INTERVAL * 3);
    relay.on_timeout(&mut link).unwrap();
    assert!(relay.sessions().is_empty());
    assert_eq!(relay.leases().leased(), 0);

    let last = late.connect(&mut relay, &mut link);
    assert_eq!(last.header.packet_type, PacketType::ConnectionAccept);
}

// =============================================================================
// 3. UNKNOWN PEERS
// =============================================================================

#[test]
fn test_unknown_peer_messages_are_reset() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();

    for packet_type in [
        PacketType::Data,
        PacketType::Poll,
        PacketType::ChallengeResponse,
        PacketType::DataSeq,
        PacketType::Nack,
        PacketType::Unknown(12),
    ] {
        let mut stranger = client_v4(7);
        assert!(stranger.send(&mut relay, &mut link, packet_type, b"junk"));
        let sent = take_for(&mut link, stranger.addr);
        assert_eq!(sent.len(), 1, "{:?}", packet_type);
        assert_eq!(sent[0].header.packet_type, PacketType::ResetConnection);
    }
    assert!(relay.sessions().is_empty());
    assert!(link.tun_writes.is_empty());
}

#[test]
fn test_truncated_requests_are_reset() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();
    let mut stranger = client_v6(9);

    for payload in [&[][..], &[2, 1, 10][..], &[2, 1, 10, 77, 0, 5, 0][..]] {
        stranger.send(&mut relay, &mut link, PacketType::ConnectionRequest, payload);
        let sent = take_for(&mut link, stranger.addr);
        assert_eq!(sent[0].header.packet_type, PacketType::ResetConnection);
    }
    assert!(relay.sessions().is_empty());
    assert_eq!(relay.leases().leased(), 0);
}

#[test]
fn test_plain_pings_are_not_claimed() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();
    let source: IpAddr = "198.51.100.1".parse().unwrap();
    let echo = EchoMeta {
        source,
        reply: false,
        id: 1,
        seq: 1,
        len: 56,
    };

    // Echo replies and relay-to-client magic are never tunnel input
    let mut reply = echo;
    reply.reply = true;
    let client_header = WireHeader::new(CLIENT_MAGIC, PacketType::ConnectionRequest);
    assert!(!relay.on_echo_data(&mut link, &reply, &client_header, &[]).unwrap());

    let server_header = WireHeader::new(echotun_core::SERVER_MAGIC, PacketType::Poll);
    assert!(!relay.on_echo_data(&mut link, &echo, &server_header, &[]).unwrap());

    assert!(link.sent.is_empty());
    assert!(relay.sessions().is_empty());
}

#[test]
fn test_session_per_real_address() {
    let mut relay = relay(tunnel_net());
    let mut link = RecordingLink::new();

    // Same host, different Echo identifiers: still one session
    let mut first = client_v4(1);
    first.connect(&mut relay, &mut link);
    let mut second = client_v4(1);
    second.id = 0x99;
    second.seq = first.seq;
    second.poll(&mut relay, &mut link);

    assert_eq!(relay.sessions().len(), 1);
    assert!(take_for(&mut link, first.addr).is_empty());
}
