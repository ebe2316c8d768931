//! echotun Core Types
//!
//! Wire formats shared by both tunnel endpoints: the tunnel header that sits
//! at the start of every Echo payload, the control payloads exchanged during
//! the handshake, and the protocol constants.

mod error;
mod tunnel;
mod wire;

pub use error::*;
pub use tunnel::*;
pub use wire::*;
