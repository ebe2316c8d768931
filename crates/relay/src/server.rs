//! Relay session engine
//!
//! Clients can only receive what fits in Echo Replies, and a reply needs a
//! request to answer. Every message a client sends therefore doubles as a
//! poll: its correlator is kept until the relay has something to send.
//! Traffic for a client without a spare correlator waits in per-flow queues.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use echotun_core::{
    encode_accept, ConnectRequest, PacketType, Result, WireHeader, CHALLENGE_SIZE, CLIENT_MAGIC,
    SERVER_MAGIC,
};
use echotun_crypto::Authenticator;
use echotun_transport::EchoMeta;
use tracing::{debug, info, warn};

use crate::event_loop::{EchoHandler, Link, Outbound};
use crate::flow::{flow_index, FlowQueues, QueuedPacket};
use crate::lease::LeasePool;
use crate::session::{Correlator, Session, SessionKey, SessionState, SessionTable};

/// Interval between inactivity sweeps. A session is dropped after two
/// intervals without traffic.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Session engine settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Any address inside the tunnel /24
    pub network: Ipv4Addr,
    /// Queued packets per session across all flows
    pub max_buffered_packets: usize,
    pub flow_queues: usize,
    pub keep_alive: Duration,
    pub challenge_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 0, 0, 0),
            max_buffered_packets: 20,
            flow_queues: 4,
            keep_alive: KEEP_ALIVE_INTERVAL,
            challenge_size: CHALLENGE_SIZE,
        }
    }
}

/// Send a tunnel message to a session, or queue it until the next poll
fn deliver(
    link: &mut dyn Link,
    session: &mut Session,
    packet_type: PacketType,
    payload: Outbound<'_>,
) -> Result<()> {
    let header = WireHeader::new(SERVER_MAGIC, packet_type);

    // Reply-immediately mode reuses the newest poll and never queues
    if session.max_polls == 0 {
        if let Some(correlator) = session.latest_poll() {
            link.send_echo(session.real_addr, header, payload, true, correlator)?;
        }
        return Ok(());
    }

    if let Some(correlator) = session.take_poll() {
        link.send_echo(session.real_addr, header, payload, true, correlator)?;
        return Ok(());
    }

    let bytes = match payload {
        Outbound::Bytes(bytes) => bytes.to_vec(),
        Outbound::Staged(len) => link.staged(len).to_vec(),
    };
    let flow = if packet_type == PacketType::Data {
        flow_index(&bytes, session.queues.flow_count())
    } else {
        0
    };
    let packet = QueuedPacket {
        packet_type,
        payload: bytes,
    };
    if session.queues.push(flow, packet).is_some() {
        link.stats().record_queue_full();
        warn!(
            "Queue full for {} (flow {}), dropped oldest packet",
            session.tunnel_addr, flow
        );
    }
    Ok(())
}

/// Poll bookkeeping every inbound message goes through
fn poll_received(link: &mut dyn Link, session: &mut Session, correlator: Correlator) -> Result<()> {
    session.push_poll(correlator);
    if let Some(packet) = session.queues.pop_next() {
        deliver(link, session, packet.packet_type, Outbound::Bytes(&packet.payload))?;
    }
    session.last_activity = link.now();
    Ok(())
}

fn send_reset(link: &mut dyn Link, session: &mut Session) -> Result<()> {
    deliver(link, session, PacketType::ResetConnection, Outbound::Bytes(&[]))
}

fn send_challenge(link: &mut dyn Link, session: &mut Session) -> Result<()> {
    debug!("Sending challenge to {}", session.real_addr);
    let challenge = session.challenge.clone();
    deliver(link, session, PacketType::Challenge, Outbound::Bytes(&challenge))?;
    session.state = SessionState::ChallengeSent;
    Ok(())
}

/// The relay's session engine
#[derive(Debug)]
pub struct RelayServer {
    config: RelayConfig,
    auth: Authenticator,
    leases: LeasePool,
    sessions: SessionTable,
}

impl RelayServer {
    pub fn new(config: RelayConfig, auth: Authenticator) -> Self {
        let leases = LeasePool::new(config.network);
        Self {
            config,
            auth,
            leases,
            sessions: SessionTable::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeasePool {
        &self.leases
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn session_by_real(&self, addr: &IpAddr) -> Option<&Session> {
        self.sessions.get(self.sessions.find_by_real(addr)?)
    }

    pub fn session_by_tunnel(&self, addr: &Ipv4Addr) -> Option<&Session> {
        self.sessions.get(self.sessions.find_by_tunnel(addr)?)
    }

    fn new_session(&self, real_addr: IpAddr, link: &dyn Link) -> Session {
        let queues = FlowQueues::new(self.config.flow_queues, self.config.max_buffered_packets);
        Session::new(real_addr, queues, link.now())
    }

    fn remove_session(&mut self, key: SessionKey) {
        if let Some(session) = self.sessions.remove(key) {
            self.leases.release(session.tunnel_addr);
            info!(
                "Client {} disconnected, released {}",
                session.real_addr, session.tunnel_addr
            );
        }
    }

    /// First message from an address without a session
    fn handle_unknown_client(
        &mut self,
        link: &mut dyn Link,
        real_addr: IpAddr,
        correlator: Correlator,
        header: &WireHeader,
        payload: &[u8],
    ) -> Result<()> {
        let mut session = self.new_session(real_addr, link);
        poll_received(link, &mut session, correlator)?;

        if header.packet_type != PacketType::ConnectionRequest {
            debug!(
                "Unexpected {:?} from unknown client {}",
                header.packet_type, real_addr
            );
            return send_reset(link, &mut session);
        }

        let request = match ConnectRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Invalid connection request from {}: {}", real_addr, e);
                return send_reset(link, &mut session);
            }
        };

        debug!(
            "Connection request from {} (version {:?}, max polls {}, desired {})",
            real_addr, request.version, request.max_polls, request.desired_addr
        );
        session.max_polls = request.max_polls;
        session.uses_hmac = request.uses_hmac();

        let Some(tunnel_addr) = self.leases.reserve(request.desired_addr) else {
            warn!("Server full, rejecting {}", real_addr);
            return deliver(link, &mut session, PacketType::ServerFull, Outbound::Bytes(&[]));
        };

        session.tunnel_addr = tunnel_addr;
        session.challenge = self.auth.generate_challenge(self.config.challenge_size);
        if let Err(e) = send_challenge(link, &mut session) {
            self.leases.release(tunnel_addr);
            return Err(e);
        }
        info!("New client {} leased {}", real_addr, tunnel_addr);
        self.sessions.insert(session);
        Ok(())
    }

    fn check_challenge(
        &mut self,
        link: &mut dyn Link,
        key: SessionKey,
        response: &[u8],
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(key) else {
            return Ok(());
        };

        if !self
            .auth
            .verify(&session.challenge, response, session.uses_hmac)
        {
            warn!("Challenge failed for {}", session.real_addr);
            deliver(link, session, PacketType::ChallengeError, Outbound::Bytes(&[]))?;
            self.remove_session(key);
            return Ok(());
        }

        let accept = encode_accept(session.tunnel_addr);
        deliver(link, session, PacketType::ConnectionAccept, Outbound::Bytes(&accept))?;
        session.state = SessionState::Established;
        info!(
            "Connection accepted from {} as {}",
            session.real_addr, session.tunnel_addr
        );
        Ok(())
    }

    /// Drop every session idle for more than two keep-alive intervals
    fn sweep(&mut self, link: &dyn Link) {
        let now = link.now();
        let max_idle = self.config.keep_alive * 2;
        let expired: Vec<SessionKey> = self
            .sessions
            .keys()
            .into_iter()
            .filter(|key| {
                self.sessions
                    .get(*key)
                    .map_or(false, |s| s.is_idle(now, max_idle))
            })
            .collect();

        for key in expired {
            if let Some(session) = self.sessions.get(key) {
                info!("Client {} timed out", session.real_addr);
            }
            self.remove_session(key);
        }
    }
}

impl EchoHandler for RelayServer {
    fn on_start(&mut self, link: &mut dyn Link) -> Result<()> {
        link.set_timeout(self.config.keep_alive);
        Ok(())
    }

    fn on_echo_data(
        &mut self,
        link: &mut dyn Link,
        echo: &EchoMeta,
        header: &WireHeader,
        payload: &[u8],
    ) -> Result<bool> {
        if echo.reply || header.magic != CLIENT_MAGIC {
            return Ok(false);
        }

        let correlator = Correlator::new(echo.id, echo.seq);
        let Some(key) = self.sessions.find_by_real(&echo.source) else {
            self.handle_unknown_client(link, echo.source, correlator, header, payload)?;
            return Ok(true);
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return Ok(true);
        };

        poll_received(link, session, correlator)?;

        match (header.packet_type, session.state) {
            (PacketType::ConnectionRequest, SessionState::ChallengeSent) => {
                send_challenge(link, session)?;
            }
            (PacketType::ConnectionRequest, _) => {
                debug!("Reconnect from {}", session.real_addr);
                session.collapse_polls();
                send_reset(link, session)?;
                self.remove_session(key);
            }
            (PacketType::ChallengeResponse, SessionState::ChallengeSent) => {
                self.check_challenge(link, key, payload)?;
            }
            (PacketType::Data, SessionState::Established) => {
                if payload.is_empty() {
                    warn!("Empty data packet from {}", session.real_addr);
                } else {
                    link.write_tun(payload);
                }
            }
            (PacketType::Poll, _) => {}
            (packet_type, state) => {
                debug!(
                    "Unexpected {:?} from {} in state {:?}",
                    packet_type, session.real_addr, state
                );
            }
        }
        Ok(true)
    }

    fn on_tun_data(
        &mut self,
        link: &mut dyn Link,
        len: usize,
        _source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<()> {
        if destination == self.leases.broadcast_addr() {
            return Ok(());
        }
        let Some(session) = self
            .sessions
            .find_by_tunnel(&destination)
            .and_then(|key| self.sessions.get_mut(key))
        else {
            debug!("Frame for unknown client {}", destination);
            return Ok(());
        };
        deliver(link, session, PacketType::Data, Outbound::Staged(len))
    }

    fn on_timeout(&mut self, link: &mut dyn Link) -> Result<()> {
        self.sweep(link);
        link.set_timeout(self.config.keep_alive);
        Ok(())
    }
}
