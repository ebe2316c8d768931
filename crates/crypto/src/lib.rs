//! echotun Cryptography
//!
//! Challenge-response authentication for the relay handshake.

mod auth;

pub use auth::*;
