//! Simulated tunnel clients driving a `RelayServer` through a `RecordingLink`

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};

use echotun_core::{decode_accept, ConnectRequest, PacketType, WireHeader, CLIENT_MAGIC};
use echotun_crypto::Authenticator;
use echotun_relay::testing::{RecordingLink, SentEcho};
use echotun_relay::{EchoHandler, RelayConfig, RelayServer};
use echotun_transport::EchoMeta;

pub const PASSPHRASE: &str = "icmp is open";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn relay(config: RelayConfig) -> RelayServer {
    init_tracing();
    RelayServer::new(config, Authenticator::new(PASSPHRASE).unwrap())
}

pub fn tunnel_net() -> RelayConfig {
    RelayConfig {
        network: Ipv4Addr::new(10, 77, 0, 0),
        ..RelayConfig::default()
    }
}

/// Minimal IPv4 frame; `tag` fills the body
pub fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ports: (u16, u16), tag: u8) -> Vec<u8> {
    let mut frame = vec![tag; 40];
    frame[0] = 0x45;
    frame[9] = protocol;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame[20..22].copy_from_slice(&ports.0.to_be_bytes());
    frame[22..24].copy_from_slice(&ports.1.to_be_bytes());
    frame
}

/// One tunnel client as seen from the relay
pub struct TestClient {
    pub addr: IpAddr,
    pub id: u16,
    pub seq: u16,
    pub passphrase: String,
    pub version: Option<u8>,
    pub max_polls: u8,
    pub tunnel_addr: Option<Ipv4Addr>,
}

impl TestClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.parse().unwrap(),
            id: 0x1d,
            seq: 0,
            passphrase: PASSPHRASE.to_string(),
            version: Some(2),
            max_polls: 1,
            tunnel_addr: None,
        }
    }

    /// Send one Echo Request; returns whether the relay claimed it
    pub fn send(
        &mut self,
        relay: &mut RelayServer,
        link: &mut RecordingLink,
        packet_type: PacketType,
        payload: &[u8],
    ) -> bool {
        self.seq = self.seq.wrapping_add(1);
        let echo = EchoMeta {
            source: self.addr,
            reply: false,
            id: self.id,
            seq: self.seq,
            len: payload.len() + echotun_core::HEADER_SIZE,
        };
        let header = WireHeader::new(CLIENT_MAGIC, packet_type);
        relay.on_echo_data(link, &echo, &header, payload).unwrap()
    }

    pub fn request(&mut self, relay: &mut RelayServer, link: &mut RecordingLink, desired: Ipv4Addr) {
        let request = ConnectRequest {
            version: self.version,
            max_polls: self.max_polls,
            desired_addr: desired,
        };
        self.send(relay, link, PacketType::ConnectionRequest, &request.encode());
    }

    pub fn answer(&mut self, relay: &mut RelayServer, link: &mut RecordingLink, challenge: &[u8]) {
        let auth = Authenticator::new(&self.passphrase).unwrap();
        let response = if self.version.map_or(false, |v| v >= 2) {
            auth.hmac_response(challenge).to_vec()
        } else {
            auth.response(challenge).to_vec()
        };
        self.send(relay, link, PacketType::ChallengeResponse, &response);
    }

    pub fn poll(&mut self, relay: &mut RelayServer, link: &mut RecordingLink) {
        self.send(relay, link, PacketType::Poll, &[]);
    }

    /// Full handshake; returns the final message the relay sent this client
    pub fn connect(&mut self, relay: &mut RelayServer, link: &mut RecordingLink) -> SentEcho {
        self.request(relay, link, Ipv4Addr::UNSPECIFIED);
        let challenge = take_for(link, self.addr)
            .into_iter()
            .find(|s| s.header.packet_type == PacketType::Challenge)
            .expect("challenge");
        self.answer(relay, link, &challenge.payload);

        let last = take_for(link, self.addr).pop().expect("accept");
        if last.header.packet_type == PacketType::ConnectionAccept {
            self.tunnel_addr = Some(decode_accept(&last.payload).unwrap());
        }
        last
    }
}

/// Remove and return the messages sent to `addr`
pub fn take_for(link: &mut RecordingLink, addr: IpAddr) -> Vec<SentEcho> {
    let (mine, rest): (Vec<_>, Vec<_>) = link.take_sent().into_iter().partition(|s| s.dest == addr);
    link.sent = rest;
    mine
}
