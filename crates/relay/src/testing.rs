//! In-memory [`Link`] for driving a handler without sockets or a device

use std::net::IpAddr;
use std::time::{Duration, Instant};

use echotun_core::{EchotunError, Result, WireHeader, HEADER_SIZE};

use crate::event_loop::{Link, Outbound};
use crate::session::Correlator;
use crate::stats::Stats;

/// One message a handler sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEcho {
    pub dest: IpAddr,
    pub header: WireHeader,
    /// Payload after the tunnel header
    pub payload: Vec<u8>,
    pub reply: bool,
    pub correlator: Correlator,
}

/// Records sends, TUN writes and timeouts
#[derive(Debug)]
pub struct RecordingLink {
    pub now: Instant,
    pub sent: Vec<SentEcho>,
    pub tun_writes: Vec<Vec<u8>>,
    /// Last timeout armed, relative to the time it was armed
    pub timeout: Option<Duration>,
    pub stats: Stats,
    /// Largest Echo payload accepted, tunnel header included
    pub capacity: usize,
    /// Report every send as dropped
    pub drop_sends: bool,
    staging: Vec<u8>,
}

impl Default for RecordingLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLink {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            sent: Vec::new(),
            tun_writes: Vec::new(),
            timeout: None,
            stats: Stats::new(),
            capacity: 1467 + HEADER_SIZE,
            drop_sends: false,
            staging: Vec::new(),
        }
    }

    /// Place a frame in the staging area the way a TUN read would
    pub fn stage(&mut self, frame: &[u8]) -> usize {
        self.staging = frame.to_vec();
        frame.len()
    }

    pub fn advance(&mut self, delta: Duration) {
        self.now += delta;
    }

    /// Drain the recorded sends
    pub fn take_sent(&mut self) -> Vec<SentEcho> {
        std::mem::take(&mut self.sent)
    }
}

impl Link for RecordingLink {
    fn now(&self) -> Instant {
        self.now
    }

    fn send_echo(
        &mut self,
        dest: IpAddr,
        header: WireHeader,
        payload: Outbound<'_>,
        reply: bool,
        correlator: Correlator,
    ) -> Result<bool> {
        let total = HEADER_SIZE + payload.len();
        if total > self.capacity {
            return Err(EchotunError::PacketTooBig {
                length: total,
                capacity: self.capacity,
            });
        }
        if self.drop_sends {
            self.stats.record_send_failure();
            return Ok(false);
        }

        let payload = match payload {
            Outbound::Bytes(bytes) => bytes.to_vec(),
            Outbound::Staged(len) => self.staging[..len].to_vec(),
        };
        self.sent.push(SentEcho {
            dest,
            header,
            payload,
            reply,
            correlator,
        });
        self.stats.record_sent(total);
        Ok(true)
    }

    fn staged(&self, len: usize) -> &[u8] {
        &self.staging[..len]
    }

    fn write_tun(&mut self, frame: &[u8]) {
        self.tun_writes.push(frame.to_vec());
    }

    fn set_timeout(&mut self, delta: Duration) {
        self.timeout = Some(delta);
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}
