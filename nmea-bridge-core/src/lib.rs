//! nmea-bridge core library: domain types, source registry, configuration.
//!
//! - [`types`]: source identities, capability mask, poll bookkeeping
//! - [`registry`]: the bind/unbind state machine
//! - [`config`]: [`BridgeConfig`] and its YAML loader
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::{BridgeConfig, ConsumerConfig};
pub use error::ConfigError;
pub use registry::{BindRequest, Commit, RetryDecision, SourceRegistry, Unbound};
pub use types::{
    ActiveBinding, BindTicket, DiscoveredSource, LocationSources, PollState, SourceId,
};
