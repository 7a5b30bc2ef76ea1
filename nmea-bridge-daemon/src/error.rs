use std::path::PathBuf;

use thiserror::Error;

use nmea_bridge_core::SourceId;

/// Error surface for the bridge runtime, device channel and consumer handoff.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to allocate pseudo-terminal: {0}")]
    Pty(#[source] nix::Error),

    #[error("{op} failed on {path}: {source}")]
    Sys {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("group lookup for '{group}' failed: {source}")]
    GroupLookup {
        group: String,
        #[source]
        source: nix::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] nmea_bridge_core::ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("device reader stalled; dropped {dropped} sentence(s)")]
    ReaderStalled { dropped: usize },

    #[error("consumer handoff error: {0}")]
    Consumer(String),

    #[error("event loop closed: {0}")]
    ChannelClosed(&'static str),
}

/// Failures talking to ModemManager. Always recoverable once the bridge runs.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("D-Bus call failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("unexpected value: {0}")]
    Value(#[from] zbus::zvariant::Error),

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid object path '{0}'")]
    InvalidPath(SourceId),

    #[error("{0}")]
    Other(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn sys_err(
    op: &'static str,
    path: impl Into<PathBuf>,
    source: nix::Error,
) -> DaemonError {
    DaemonError::Sys {
        op,
        path: path.into(),
        source,
    }
}
