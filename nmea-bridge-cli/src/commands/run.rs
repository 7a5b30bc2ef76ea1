//! `nmea-bridge run`: the long-running bridge.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use nix::unistd::geteuid;

use nmea_bridge_core::BridgeConfig;
use nmea_bridge_daemon::start_blocking;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Only ever bind this ModemManager modem index; disables discovery.
    pub modem: Option<u32>,

    /// Config file (default: /etc/nmea-bridge.yaml, if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path of the symlink gpsd opens.
    #[arg(long)]
    pub link: Option<PathBuf>,

    /// Group allowed to open the device.
    #[arg(long)]
    pub group: Option<String>,

    /// Do not start gpsd or register the device with it.
    #[arg(long)]
    pub no_handoff: bool,

    /// Start even when not running as root.
    #[arg(long)]
    pub allow_unprivileged: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let config = self.resolve_config()?;
        if !self.allow_unprivileged && !geteuid().is_root() {
            bail!("nmea-bridge must run as root (pass --allow-unprivileged to try anyway)");
        }
        start_blocking(config).context("bridge exited with error")
    }

    /// File settings, then command-line overrides.
    fn resolve_config(&self) -> Result<BridgeConfig> {
        let mut config =
            BridgeConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(modem) = self.modem {
            config.modem = Some(modem);
        }
        if let Some(link) = &self.link {
            config.link = link.clone();
        }
        if let Some(group) = &self.group {
            config.group = group.clone();
        }
        if self.no_handoff {
            config.consumer.enabled = false;
        }
        config.validate().context("invalid settings")?;
        Ok(config)
    }
}
