//! echotun Daemon
//!
//! Relay process bootstrap.
//!
//! ## Components
//!
//! - **RelayService**: opens the TUN device and Echo sockets, drops
//!   privileges and runs the relay event loop on a blocking thread
//! - **TunInterface**: the TUN device the loop reads and writes
//!
//! ## Signals
//!
//! - `SIGINT`: stop the relay
//! - `SIGUSR1`: log the traffic counters

mod device;
mod privileges;
mod service;

pub use device::TunInterface;
pub use privileges::{drop_privileges, resolve_group};
pub use service::RelayService;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication setup failed: {0}")]
    Auth(#[from] echotun_crypto::AuthError),

    #[error("Settings error: {0}")]
    Settings(#[from] echotun_settings::SettingsError),

    #[error("Relay error: {0}")]
    Relay(#[from] echotun_core::EchotunError),

    #[error("Tunnel device error: {0}")]
    Device(String),

    #[error("Privilege drop failed: {0}")]
    Privileges(String),

    #[error("Relay thread failed: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
