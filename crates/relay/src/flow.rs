//! Per-flow outbound queues
//!
//! A session can only receive as many packets as it has outstanding polls.
//! Queuing traffic per inner flow and serving the flows round-robin keeps
//! one bulk transfer from starving every other connection of the session.

use std::collections::VecDeque;

use echotun_core::PacketType;
use echotun_transport::IPV4_HEADER_MIN;

const PROTOCOL_OFFSET: usize = 9;
const SRC_OFFSET: usize = 12;
const DST_OFFSET: usize = 16;
const PORTS_OFFSET: usize = 20;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const HASH_WEIGHT: u32 = 31;

fn be32(frame: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn be16(frame: &[u8], at: usize) -> u32 {
    u32::from(u16::from_be_bytes([frame[at], frame[at + 1]]))
}

/// Flow queue index of an inner IPv4 frame.
///
/// TCP and UDP frames hash their full 5-tuple, anything else its addresses
/// and protocol. Short frames and single-queue setups always map to 0.
pub fn flow_index(frame: &[u8], flow_count: usize) -> usize {
    if flow_count <= 1 || frame.len() < IPV4_HEADER_MIN {
        return 0;
    }

    let protocol = frame[PROTOCOL_OFFSET];
    let mut hash = be32(frame, SRC_OFFSET);
    hash = hash.wrapping_add(be32(frame, DST_OFFSET).wrapping_mul(HASH_WEIGHT));
    hash = hash.wrapping_add(u32::from(protocol).wrapping_mul(HASH_WEIGHT));
    if frame.len() >= PORTS_OFFSET + 4 && (protocol == IPPROTO_TCP || protocol == IPPROTO_UDP) {
        hash = hash.wrapping_add(be16(frame, PORTS_OFFSET).wrapping_mul(HASH_WEIGHT));
        hash = hash.wrapping_add(be16(frame, PORTS_OFFSET + 2).wrapping_mul(HASH_WEIGHT));
    }
    (hash % flow_count as u32) as usize
}

/// A tunnel message waiting for the next poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

/// Bounded drop-oldest FIFOs served round-robin
#[derive(Debug, Clone)]
pub struct FlowQueues {
    queues: Vec<VecDeque<QueuedPacket>>,
    per_flow_capacity: usize,
    last_served: usize,
}

impl FlowQueues {
    /// `max_buffered` packets shared across `flow_count` queues, rounded up
    /// so each queue holds at least one
    pub fn new(flow_count: usize, max_buffered: usize) -> Self {
        let flow_count = flow_count.max(1);
        let per_flow_capacity = ((max_buffered + flow_count - 1) / flow_count).max(1);
        Self {
            queues: (0..flow_count).map(|_| VecDeque::new()).collect(),
            per_flow_capacity,
            last_served: 0,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.queues.len()
    }

    pub fn per_flow_capacity(&self) -> usize {
        self.per_flow_capacity
    }

    /// Append to a flow queue. When the queue is full its oldest packet is
    /// evicted and returned.
    pub fn push(&mut self, flow: usize, packet: QueuedPacket) -> Option<QueuedPacket> {
        let index = flow % self.queues.len();
        let queue = &mut self.queues[index];
        let dropped = if queue.len() >= self.per_flow_capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(packet);
        dropped
    }

    /// Take the head of the first non-empty queue after the last one served
    pub fn pop_next(&mut self) -> Option<QueuedPacket> {
        let count = self.queues.len();
        for step in 1..=count {
            let flow = (self.last_served + step) % count;
            if let Some(packet) = self.queues[flow].pop_front() {
                self.last_served = flow;
                return Some(packet);
            }
        }
        None
    }

    pub fn flow_len(&self, flow: usize) -> usize {
        self.queues.get(flow).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
