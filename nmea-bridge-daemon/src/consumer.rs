//! Handing the device to gpsd.
//!
//! gpsd is started without devices of its own; the bridge adds its link at
//! runtime with `gpsdctl add`, which keeps gpsd from auto-probing the PTY
//! before it exists.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use nmea_bridge_core::ConsumerConfig;

use crate::error::DaemonError;
use crate::paths::GPSDCTL_ALREADY_TRACKING;

/// Result of one registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// gpsd accepted the device.
    Added,
    /// gpsd is running and already has the device.
    AlreadyTracking,
    /// gpsd is not reachable yet (or refused); worth retrying.
    NotReady(String),
}

#[async_trait]
pub trait ConsumerControl: Send + Sync {
    /// Asks the service manager to start the consumer without waiting.
    async fn start_service(&self) -> Result<(), DaemonError>;

    /// Registers `device` with the running consumer.
    async fn register(&self, device: &Path) -> Result<Registration, DaemonError>;
}

/// `systemctl` + `gpsdctl` based [`ConsumerControl`].
#[derive(Debug, Clone)]
pub struct Gpsd {
    service: String,
    systemctl: PathBuf,
    gpsdctl: PathBuf,
}

impl Gpsd {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            service: config.service.clone(),
            systemctl: config.systemctl.clone(),
            gpsdctl: config.gpsdctl.clone(),
        }
    }
}

#[async_trait]
impl ConsumerControl for Gpsd {
    async fn start_service(&self) -> Result<(), DaemonError> {
        let status = Command::new(&self.systemctl)
            .args(["start", "--no-block", self.service.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DaemonError::Consumer(format!("{}: {e}", self.systemctl.display())))?;
        if !status.success() {
            return Err(DaemonError::Consumer(format!(
                "systemctl start {} exited with {status}",
                self.service
            )));
        }
        Ok(())
    }

    async fn register(&self, device: &Path) -> Result<Registration, DaemonError> {
        let output = Command::new(&self.gpsdctl)
            .arg("add")
            .arg(device)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DaemonError::Consumer(format!("{}: {e}", self.gpsdctl.display())))?;
        Ok(classify_gpsdctl(
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Interprets a `gpsdctl add` run.
pub fn classify_gpsdctl(success: bool, stdout: &str, stderr: &str) -> Registration {
    if success {
        return Registration::Added;
    }
    if stdout.contains(GPSDCTL_ALREADY_TRACKING) || stderr.contains(GPSDCTL_ALREADY_TRACKING) {
        return Registration::AlreadyTracking;
    }
    let detail = [stdout.trim(), stderr.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    Registration::NotReady(if detail.is_empty() {
        "gpsdctl failed".to_string()
    } else {
        detail
    })
}
