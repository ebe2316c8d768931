//! echotun relay daemon
//!
//! Runs the relay from the settings file named by `ECHOTUN_CONFIG`, or the
//! default settings path.

use std::path::PathBuf;

use echotun_daemon::{DaemonError, RelayService};
use echotun_settings::{default_settings_path, Settings};

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    echotun_logging::init(false);

    let path = std::env::var_os("ECHOTUN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let settings = Settings::load_from(&path)?;

    tracing::info!("Starting echotun relay...");
    let service = RelayService::open(&settings)?;
    service.run_until_shutdown().await
}
