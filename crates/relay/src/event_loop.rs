//! Single-threaded I/O multiplexer
//!
//! One `poll(2)` call waits on the TUN device and the Echo sockets with the
//! pending timeout. Sockets are drained in bounded batches, the TUN device
//! is read one frame per wakeup straight into the outbound send buffer.
//! Everything protocol-specific happens in an [`EchoHandler`].

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use echotun_core::{EchotunError, Result, WireHeader, HEADER_SIZE};
use echotun_transport::{
    ipv4_addresses, EchoMeta, EchoReceiver, EchoSender, EchoSink, EchoSource, Family, TunDevice,
};
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::pacer::{RateLimiter, DEFAULT_BURST_BYTES};
use crate::session::Correlator;
use crate::stats::Stats;

/// Default number of messages drained from one socket per wakeup
pub const DEFAULT_RECV_BATCH_MAX: usize = 32;

/// Payload of an outgoing tunnel message
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    /// Bytes owned by the caller
    Bytes(&'a [u8]),
    /// The TUN frame of this length already sitting in the send buffer
    Staged(usize),
}

impl Outbound<'_> {
    pub fn len(&self) -> usize {
        match self {
            Outbound::Bytes(bytes) => bytes.len(),
            Outbound::Staged(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a handler may do from inside a callback
pub trait Link {
    /// Time of the current wakeup
    fn now(&self) -> Instant;

    /// Send a tunnel message as an Echo Request or Reply.
    ///
    /// Returns `Ok(false)` when the message was dropped by the pacer or the
    /// socket. A payload larger than the send buffer is an error.
    fn send_echo(
        &mut self,
        dest: IpAddr,
        header: WireHeader,
        payload: Outbound<'_>,
        reply: bool,
        correlator: Correlator,
    ) -> Result<bool>;

    /// The first `len` bytes of the staged TUN frame
    fn staged(&self, len: usize) -> &[u8];

    /// Write a frame to the TUN device
    fn write_tun(&mut self, frame: &[u8]);

    /// Arm the timeout `delta` from now, replacing any earlier one
    fn set_timeout(&mut self, delta: Duration);

    fn stats(&self) -> &Stats;
}

/// Protocol callbacks driven by the [`EventLoop`]
pub trait EchoHandler {
    /// Called once before the first wait
    fn on_start(&mut self, _link: &mut dyn Link) -> Result<()> {
        Ok(())
    }

    /// A tunnel message arrived. Returns whether it was claimed; unclaimed
    /// Echo Requests may be answered as plain pings.
    fn on_echo_data(
        &mut self,
        link: &mut dyn Link,
        echo: &EchoMeta,
        header: &WireHeader,
        payload: &[u8],
    ) -> Result<bool>;

    /// An IPv4 frame of `len` bytes was staged from the TUN device
    fn on_tun_data(
        &mut self,
        link: &mut dyn Link,
        len: usize,
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<()>;

    /// The armed timeout expired
    fn on_timeout(&mut self, link: &mut dyn Link) -> Result<()>;
}

/// Loop tuning
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Largest Echo payload, tunnel header included
    pub max_payload: usize,
    /// Messages drained per socket per wakeup
    pub recv_batch_max: usize,
    /// Answer unclaimed Echo Requests like the kernel would
    pub answer_echo: bool,
    /// Outbound rate in kbit/s, 0 for unlimited
    pub rate_kbps: u32,
    pub burst_bytes: u32,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_payload: 1467 + HEADER_SIZE,
            recv_batch_max: DEFAULT_RECV_BATCH_MAX,
            answer_echo: false,
            rate_kbps: 0,
            burst_bytes: DEFAULT_BURST_BYTES,
        }
    }
}

/// Requests the loop to exit at its next iteration
#[derive(Debug, Clone)]
pub struct StopHandle {
    alive: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        !self.alive.load(Ordering::Relaxed)
    }
}

/// Everything a [`Link`] touches, kept apart from the receivers and the
/// handler so all three can be borrowed at once
struct LoopIo<T, S> {
    tun: T,
    echo4: Option<S>,
    echo6: Option<S>,
    /// Staging area used only when no sender exists
    tun_buffer: Vec<u8>,
    pacer: RateLimiter,
    stats: Arc<Stats>,
    deadline: Option<Instant>,
    now: Instant,
}

impl<T: TunDevice, S: EchoSink> LoopIo<T, S> {
    fn sender_mut(&mut self, family: Family) -> Option<&mut S> {
        match family {
            Family::V4 => self.echo4.as_mut(),
            Family::V6 => self.echo6.as_mut(),
        }
    }

    /// Read one TUN frame into the staging area. `None` means nothing was
    /// read.
    fn read_tun(&mut self) -> Result<Option<usize>> {
        let buf: &mut [u8] = match (self.echo4.as_mut(), self.echo6.as_mut()) {
            (Some(sender), _) | (None, Some(sender)) => &mut sender.payload_mut()[HEADER_SIZE..],
            (None, None) => &mut self.tun_buffer[..],
        };
        match self.tun.read(buf) {
            Ok(0) => Err(EchotunError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tunnel device closed",
            ))),
            Ok(len) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(EchotunError::Io(e)),
        }
    }

    /// Copy a staged frame into the IPv6 sender when staging happened in
    /// the IPv4 one
    fn move_staged(&mut self, family: Family, len: usize) {
        if family != Family::V6 {
            return;
        }
        if let (Some(src), Some(dst)) = (self.echo4.as_ref(), self.echo6.as_mut()) {
            let range = HEADER_SIZE..HEADER_SIZE + len;
            dst.payload_mut()[range.clone()].copy_from_slice(&src.payload()[range]);
        }
    }

    /// Answer a ping that no session claimed, bypassing the pacer
    fn echo_back(&mut self, family: Family, echo: &EchoMeta, payload: &[u8]) -> Result<()> {
        let Some(sender) = self.sender_mut(family) else {
            return Ok(());
        };
        if payload.len() > sender.payload_capacity() {
            debug!("Not answering oversized ping from {}", echo.source);
            return Ok(());
        }
        sender.payload_mut()[..payload.len()].copy_from_slice(payload);
        sender.send(payload.len(), echo.source, true, echo.id, echo.seq)?;
        Ok(())
    }
}

impl<T: TunDevice, S: EchoSink> Link for LoopIo<T, S> {
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
        let family = Family::of(&dest);
        let total = HEADER_SIZE + payload.len();

        let Some(capacity) = self.sender_mut(family).map(|s| s.payload_capacity()) else {
            debug!("No {} socket to reach {}", family, dest);
            self.stats.record_send_failure();
            return Ok(false);
        };
        if total > capacity {
            return Err(EchotunError::PacketTooBig {
                length: total,
                capacity,
            });
        }
        if !self.pacer.allow_send(total) {
            trace!("Pacer dropped {} bytes to {}", total, dest);
            self.stats.record_send_failure();
            return Ok(false);
        }

        if let Outbound::Staged(len) = payload {
            self.move_staged(family, len);
        }
        let Some(sender) = self.sender_mut(family) else {
            return Ok(false);
        };
        let buf = sender.payload_mut();
        header.write_to(buf)?;
        if let Outbound::Bytes(bytes) = payload {
            buf[HEADER_SIZE..total].copy_from_slice(bytes);
        }

        let sent = sender.send(total, dest, reply, correlator.id, correlator.seq)?;
        if sent {
            self.stats.record_sent(total);
        } else {
            self.stats.record_send_failure();
        }
        Ok(sent)
    }

    fn staged(&self, len: usize) -> &[u8] {
        match (self.echo4.as_ref(), self.echo6.as_ref()) {
            (Some(sender), _) | (None, Some(sender)) => {
                &sender.payload()[HEADER_SIZE..HEADER_SIZE + len]
            }
            (None, None) => &self.tun_buffer[..len],
        }
    }

    fn write_tun(&mut self, frame: &[u8]) {
        if let Err(e) = self.tun.write(frame) {
            debug!("Tunnel write of {} bytes failed: {}", frame.len(), e);
        }
    }

    fn set_timeout(&mut self, delta: Duration) {
        self.deadline = Some(self.now + delta);
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Which descriptors a wait reported readable
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    tun: bool,
    echo4: bool,
    echo6: bool,
}

/// Longest single wait, which bounds how late a stop request is noticed
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Milliseconds for `poll(2)`. Partial milliseconds round up so an armed
/// deadline is never polled at zero ahead of time.
fn poll_timeout_ms(deadline: Option<Instant>, now: Instant) -> libc::c_int {
    let remaining = deadline.map_or(MAX_WAIT, |deadline| {
        deadline.saturating_duration_since(now).min(MAX_WAIT)
    });
    ((remaining.as_micros() + 999) / 1000) as libc::c_int
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

fn is_readable(fd: &libc::pollfd) -> bool {
    fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
}

/// The relay's event loop, generic over the TUN device and the Echo
/// transport halves
pub struct EventLoop<T, H, R = EchoReceiver, S = EchoSender>
where
    T: TunDevice,
    H: EchoHandler,
    R: EchoSource,
    S: EchoSink,
{
    io: LoopIo<T, S>,
    rx4: Option<R>,
    rx6: Option<R>,
    handler: H,
    clock: Box<dyn Clock>,
    alive: Arc<AtomicBool>,
    answer_echo: bool,
    recv_batch_max: usize,
}

impl<T, H, R, S> EventLoop<T, H, R, S>
where
    T: TunDevice,
    H: EchoHandler,
    R: EchoSource,
    S: EchoSink,
{
    pub fn new(tun: T, handler: H, config: &EventLoopConfig) -> Self {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let now = clock.now();
        Self {
            io: LoopIo {
                tun,
                echo4: None,
                echo6: None,
                tun_buffer: vec![0u8; config.max_payload.saturating_sub(HEADER_SIZE)],
                pacer: RateLimiter::new(config.rate_kbps, config.burst_bytes, now),
                stats: Arc::new(Stats::new()),
                deadline: None,
                now,
            },
            rx4: None,
            rx6: None,
            handler,
            clock,
            alive: Arc::new(AtomicBool::new(true)),
            answer_echo: config.answer_echo,
            recv_batch_max: config.recv_batch_max.max(1),
        }
    }

    /// Attach an Echo socket, replacing any socket of the same family
    pub fn with_echo(mut self, receiver: R, sender: S) -> Self {
        match sender.family() {
            Family::V4 => {
                self.rx4 = Some(receiver);
                self.io.echo4 = Some(sender);
            }
            Family::V6 => {
                self.rx6 = Some(receiver);
                self.io.echo6 = Some(sender);
            }
        }
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            alive: self.alive.clone(),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.io.stats.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run until stopped or a fatal error occurs
    pub fn run(&mut self) -> Result<()> {
        self.wake();
        self.handler.on_start(&mut self.io)?;

        while self.alive.load(Ordering::Relaxed) {
            // Capped at MAX_WAIT even with nothing armed so a stop request
            // is seen within that bound
            let timeout = poll_timeout_ms(self.io.deadline, self.clock.now());
            let ready = match self.wait(timeout) {
                Ok(ready) => ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EchotunError::Io(e)),
            };
            self.wake();

            if ready.echo4 {
                self.drain(Family::V4)?;
            }
            if ready.echo6 {
                self.drain(Family::V6)?;
            }
            if ready.tun {
                self.handle_tun()?;
            }

            // Checked on busy wakeups too so a steady stream cannot hold it off
            if self.io.deadline.map_or(false, |deadline| deadline <= self.io.now) {
                self.io.deadline = None;
                self.handler.on_timeout(&mut self.io)?;
            }
        }

        debug!("Event loop stopped");
        Ok(())
    }

    fn wake(&mut self) {
        let now = self.clock.now();
        self.io.now = now;
        self.io.pacer.refill(now);
    }

    fn wait(&self, timeout_ms: libc::c_int) -> io::Result<Readiness> {
        let mut fds = [pollfd(self.io.tun.as_raw_fd()), pollfd(-1), pollfd(-1)];
        if let Some(rx) = &self.rx4 {
            fds[1].fd = rx.as_raw_fd();
        }
        if let Some(rx) = &self.rx6 {
            fds[2].fd = rx.as_raw_fd();
        }

        // SAFETY: `fds` is a live array of initialized pollfd structs and the
        // length passed matches it; negative fds are ignored by poll(2).
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Readiness {
            tun: is_readable(&fds[0]),
            echo4: self.rx4.is_some() && is_readable(&fds[1]),
            echo6: self.rx6.is_some() && is_readable(&fds[2]),
        })
    }

    /// Process up to one batch of messages from a socket
    fn drain(&mut self, family: Family) -> Result<()> {
        for _ in 0..self.recv_batch_max {
            let receiver = match family {
                Family::V4 => self.rx4.as_mut(),
                Family::V6 => self.rx6.as_mut(),
            };
            let Some(receiver) = receiver else {
                return Ok(());
            };
            let Some(echo) = receiver.receive() else {
                break;
            };
            self.io.stats.record_received(echo.len);
            let message = receiver.payload();

            let claimed = match WireHeader::decode(message) {
                Ok((header, payload)) => {
                    self.handler
                        .on_echo_data(&mut self.io, &echo, &header, payload)?
                }
                Err(e) => {
                    trace!("Foreign {} message from {}: {}", family, echo.source, e);
                    false
                }
            };

            if !claimed && !echo.reply && self.answer_echo {
                self.io.echo_back(family, &echo, message)?;
            }
        }
        Ok(())
    }

    fn handle_tun(&mut self) -> Result<()> {
        let Some(len) = self.io.read_tun()? else {
            return Ok(());
        };
        match ipv4_addresses(self.io.staged(len)) {
            Some((source, destination)) => {
                self.handler
                    .on_tun_data(&mut self.io, len, source, destination)
            }
            None => {
                trace!("Ignoring non-IPv4 tunnel frame of {} bytes", len);
                Ok(())
            }
        }
    }
}
