//! Relay service: bootstrap and lifecycle

use std::sync::Arc;

use echotun_core::HEADER_SIZE;
use echotun_crypto::Authenticator;
use echotun_relay::{
    EventLoop, EventLoopConfig, LeasePool, RelayConfig, RelayServer, Stats, StopHandle,
};
use echotun_settings::Settings;
use echotun_transport::{open_echo_socket, EchoSocketOptions, Family};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::device::TunInterface;
use crate::privileges::drop_privileges;
use crate::{DaemonError, Result};

/// A fully set up relay, ready to run
pub struct RelayService {
    event_loop: EventLoop<TunInterface, RelayServer>,
}

/// Reject settings the relay cannot start with, before touching any device
fn validate(settings: &Settings) -> Result<Authenticator> {
    let tunnel = &settings.tunnel;
    if !tunnel.ipv4 && !tunnel.ipv6 {
        return Err(DaemonError::Config(
            "at least one of IPv4 and IPv6 must be enabled".to_string(),
        ));
    }
    if usize::from(tunnel.mtu) <= HEADER_SIZE {
        return Err(DaemonError::Config(format!("MTU {} is too small", tunnel.mtu)));
    }

    let passphrase = settings
        .auth
        .passphrase
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| DaemonError::Config("a passphrase is required".to_string()))?;
    Ok(Authenticator::new(passphrase)?)
}

impl RelayService {
    /// Open the TUN device and Echo sockets, then drop privileges if a user
    /// is configured
    pub fn open(settings: &Settings) -> Result<Self> {
        let auth = validate(settings)?;
        let tunnel = &settings.tunnel;

        let leases = LeasePool::new(tunnel.network);
        let device = TunInterface::open(
            tunnel.device.as_deref(),
            leases.relay_addr(),
            leases.peer_addr(),
            tunnel.mtu,
        )?;
        let device_name = device.name().to_string();

        let max_payload = usize::from(tunnel.mtu) + HEADER_SIZE;
        let server = RelayServer::new(
            RelayConfig {
                network: leases.network(),
                max_buffered_packets: tunnel.max_buffered_packets,
                flow_queues: tunnel.flow_queues,
                ..RelayConfig::default()
            },
            auth,
        );
        let loop_config = EventLoopConfig {
            max_payload,
            recv_batch_max: tunnel.recv_batch_max,
            answer_echo: tunnel.answer_echo,
            rate_kbps: tunnel.rate_kbps,
            burst_bytes: tunnel.burst_bytes,
        };
        let mut event_loop: EventLoop<TunInterface, RelayServer> =
            EventLoop::new(device, server, &loop_config);

        let options = EchoSocketOptions {
            max_payload,
            recv_buffer: tunnel.recv_buffer,
            send_buffer: tunnel.send_buffer,
        };
        for (family, enabled) in [(Family::V4, tunnel.ipv4), (Family::V6, tunnel.ipv6)] {
            if enabled {
                let (receiver, sender) = open_echo_socket(family, options)?;
                event_loop = event_loop.with_echo(receiver, sender);
                info!("Listening for {} echo", family);
            }
        }

        if let Some(uid) = settings.process.user_id {
            drop_privileges(uid, settings.process.group_id)?;
        }

        if tunnel.rate_kbps > 0 {
            info!(
                "Outbound rate limited to {} kbit/s (burst {} bytes)",
                tunnel.rate_kbps, tunnel.burst_bytes
            );
        }
        info!(
            "Relay ready on {} as {} (mtu {}, {} flow queues, {} buffered packets)",
            device_name,
            leases.relay_addr(),
            tunnel.mtu,
            tunnel.flow_queues,
            tunnel.max_buffered_packets
        );
        Ok(Self { event_loop })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.event_loop.stats()
    }

    /// Run the event loop on the calling thread until stopped
    pub fn run(mut self) -> Result<()> {
        self.event_loop.run()?;
        Ok(())
    }

    /// Run on a blocking thread. Ctrl-C stops the relay, SIGUSR1 logs the
    /// counters.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let stop = self.stop_handle();
        let stats = self.stats();
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut worker = tokio::task::spawn_blocking(move || self.run());

        loop {
            tokio::select! {
                result = &mut worker => {
                    let result = result.map_err(|e| DaemonError::Join(e.to_string()))?;
                    stats.dump();
                    info!("Relay stopped");
                    return result;
                }
                _ = tokio::signal::ctrl_c() => {
                    if stop.is_stopped() {
                        warn!("Shutdown already requested");
                    } else {
                        info!("Received shutdown signal");
                        stop.stop();
                    }
                }
                _ = usr1.recv() => {
                    stats.dump();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.auth.passphrase = Some("secret".to_string());
        settings
    }

    #[test]
    fn test_valid_settings() {
        assert!(validate(&settings()).is_ok());
    }

    #[test]
    fn test_passphrase_required() {
        let mut settings = settings();
        settings.auth.passphrase = None;
        assert!(matches!(validate(&settings), Err(DaemonError::Config(_))));

        settings.auth.passphrase = Some(String::new());
        assert!(matches!(validate(&settings), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_needs_an_address_family() {
        let mut settings = settings();
        settings.tunnel.ipv4 = false;
        settings.tunnel.ipv6 = false;
        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("IPv4"));
    }

    #[test]
    fn test_rejects_tiny_mtu() {
        let mut settings = settings();
        settings.tunnel.mtu = 5;
        assert!(matches!(validate(&settings), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_open_fails_before_devices_on_bad_config() {
        let mut settings = settings();
        settings.auth.passphrase = None;
        assert!(matches!(
            RelayService::open(&settings),
            Err(DaemonError::Config(_))
        ));
    }
}
