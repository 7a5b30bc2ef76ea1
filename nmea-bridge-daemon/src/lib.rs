//! The bridge process: PTY device channel, ModemManager watcher, poll loop
//! and gpsd handoff.

pub mod consumer;
pub mod device;
mod error;
pub mod modem;
pub mod paths;
mod runtime;

pub use consumer::{ConsumerControl, Gpsd, Registration};
pub use device::{DeviceChannel, DeviceOwnership, SentenceSink};
pub use error::{BusError, DaemonError};
pub use modem::{ModemBus, ModemManager};
pub use runtime::{
    init_tracing, list_sources_blocking, serve, start_blocking, Bridge, BridgeEvent, BridgeTiming,
    EventSender,
};
