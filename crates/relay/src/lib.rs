//! echotun Relay
//!
//! The relay side of the tunnel: a single-threaded event loop multiplexing
//! the TUN device with the ICMP and ICMPv6 Echo sockets, and the session
//! engine that authenticates clients, leases tunnel addresses and answers
//! their polls with queued traffic.
//!
//! ## Components
//!
//! - **EventLoop**: waits on all descriptors, drains sockets in bounded
//!   batches and dispatches to an [`EchoHandler`]
//! - **RelayServer**: the session engine, an [`EchoHandler`]
//! - **RateLimiter** / **Stats**: token bucket and counters owned by the loop

mod clock;
mod event_loop;
mod flow;
mod lease;
mod pacer;
mod server;
mod session;
mod stats;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use event_loop::{
    EchoHandler, EventLoop, EventLoopConfig, Link, Outbound, StopHandle, DEFAULT_RECV_BATCH_MAX,
};
pub use flow::{flow_index, FlowQueues, QueuedPacket};
pub use lease::{LeasePool, FIRST_LEASE_OFFSET};
pub use pacer::{RateLimiter, DEFAULT_BURST_BYTES};
pub use server::{RelayConfig, RelayServer, KEEP_ALIVE_INTERVAL};
pub use session::{Correlator, Session, SessionKey, SessionState, SessionTable};
pub use stats::{Stats, StatsSnapshot};
