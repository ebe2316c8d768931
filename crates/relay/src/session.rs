//! Client sessions and their two-way index
//!
//! Sessions live in a slot arena. Both lookup maps store a generation-checked
//! [`SessionKey`], so a key kept across a removal can never reach the
//! session that later reuses its slot.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use crate::flow::FlowQueues;

/// Identifier and sequence number of a received Echo Request, the handle a
/// reply must echo back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Correlator {
    pub id: u16,
    pub seq: u16,
}

impl Correlator {
    pub fn new(id: u16, seq: u16) -> Self {
        Self { id, seq }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    ChallengeSent,
    Established,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    pub real_addr: IpAddr,
    pub tunnel_addr: Ipv4Addr,
    pub state: SessionState,
    pub uses_hmac: bool,
    /// Polls the client keeps outstanding; 0 means reply-immediately mode
    pub max_polls: u8,
    pub challenge: Vec<u8>,
    pub queues: FlowQueues,
    pub last_activity: Instant,
    polls: VecDeque<Correlator>,
}

impl Session {
    pub fn new(real_addr: IpAddr, queues: FlowQueues, now: Instant) -> Self {
        Self {
            real_addr,
            tunnel_addr: Ipv4Addr::UNSPECIFIED,
            state: SessionState::New,
            uses_hmac: false,
            max_polls: 1,
            challenge: Vec::new(),
            queues,
            last_activity: now,
            polls: VecDeque::new(),
        }
    }

    fn poll_limit(&self) -> usize {
        usize::from(self.max_polls).max(1)
    }

    /// Remember a correlator, forgetting the oldest beyond the poll limit
    pub fn push_poll(&mut self, correlator: Correlator) {
        self.polls.push_back(correlator);
        while self.polls.len() > self.poll_limit() {
            self.polls.pop_front();
        }
    }

    /// Consume the oldest retained correlator
    pub fn take_poll(&mut self) -> Option<Correlator> {
        self.polls.pop_front()
    }

    /// Most recent correlator, left in place
    pub fn latest_poll(&self) -> Option<Correlator> {
        self.polls.back().copied()
    }

    /// Keep only the most recent correlator
    pub fn collapse_polls(&mut self) {
        while self.polls.len() > 1 {
            self.polls.pop_front();
        }
    }

    pub fn poll_count(&self) -> usize {
        self.polls.len()
    }

    /// Whether the session has been quiet for longer than `max_idle`
    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > max_idle
    }
}

/// Generation-checked handle into a [`SessionTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Session arena indexed by real address and by tunnel address
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_real: HashMap<IpAddr, SessionKey>,
    by_tunnel: HashMap<Ipv4Addr, SessionKey>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Any session already holding the same real or tunnel
    /// address is evicted first so both indexes keep pointing at one entry.
    pub fn insert(&mut self, session: Session) -> SessionKey {
        if let Some(old) = self.by_real.get(&session.real_addr).copied() {
            self.remove(old);
        }
        if let Some(old) = self.by_tunnel.get(&session.tunnel_addr).copied() {
            self.remove(old);
        }

        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.session = Some(session);
                SessionKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    session: Some(session),
                });
                SessionKey {
                    index,
                    generation: 0,
                }
            }
        };

        if let Some(session) = self.get(key) {
            let (real, tunnel) = (session.real_addr, session.tunnel_addr);
            self.by_real.insert(real, key);
            self.by_tunnel.insert(tunnel, key);
        }
        key
    }

    fn slot(&self, key: SessionKey) -> Option<&Slot> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.slot(key)?.session.as_ref()
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?
            .session
            .as_mut()
    }

    pub fn find_by_real(&self, addr: &IpAddr) -> Option<SessionKey> {
        self.by_real.get(addr).copied()
    }

    pub fn find_by_tunnel(&self, addr: &Ipv4Addr) -> Option<SessionKey> {
        self.by_tunnel.get(addr).copied()
    }

    /// Remove a session and both of its index entries
    pub fn remove(&mut self, key: SessionKey) -> Option<Session> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);

        self.by_real.remove(&session.real_addr);
        self.by_tunnel.remove(&session.tunnel_addr);
        Some(session)
    }

    /// Keys of all live sessions
    pub fn keys(&self) -> Vec<SessionKey> {
        self.by_real.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(|slot| slot.session.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_real.is_empty()
    }

    /// Whether both indexes agree with the arena
    pub fn is_consistent(&self) -> bool {
        let live = self.iter().count();
        live == self.by_real.len()
            && live == self.by_tunnel.len()
            && self.by_real.iter().all(|(addr, key)| {
                self.get(*key).map_or(false, |s| s.real_addr == *addr)
            })
            && self.by_tunnel.iter().all(|(addr, key)| {
                self.get(*key).map_or(false, |s| s.tunnel_addr == *addr)
            })
    }
}
