//! Domain types for the bridge.
//!
//! A location source is only ever a *reference* to ModemManager state: an
//! object path plus the capability snapshot seen when it was discovered.

use std::fmt;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object path prefix ModemManager uses for modem objects.
pub const MODEM_PATH_PREFIX: &str = "/org/freedesktop/ModemManager1/Modem/";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Bus-assigned identity of a location source (a D-Bus object path).
///
/// Opaque to the bridge apart from equality. ModemManager renumbers modems
/// after suspend/resume or a modem restart, so the same hardware may show up
/// under several identities during one process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    /// `/org/freedesktop/ModemManager1/Modem/<index>`
    pub fn from_modem_index(index: u32) -> Self {
        Self(format!("{MODEM_PATH_PREFIX}{index}"))
    }

    /// Trailing modem index, if this is a ModemManager modem path.
    pub fn modem_index(&self) -> Option<u32> {
        self.0.strip_prefix(MODEM_PATH_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque handle for one bind attempt sequence.
///
/// Results of upstream calls carry the ticket they were issued for; a result
/// whose ticket no longer matches the registry's in-flight attempt is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindTicket(pub u64);

impl fmt::Display for BindTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Capability mask
// ---------------------------------------------------------------------------

bitflags! {
    /// `MMModemLocationSource` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LocationSources: u32 {
        const LAC_CI = 1 << 0;
        const GPS_RAW = 1 << 1;
        const GPS_NMEA = 1 << 2;
        const CDMA_BS = 1 << 3;
        const GPS_UNMANAGED = 1 << 4;
        const AGPS_MSA = 1 << 5;
        const AGPS_MSB = 1 << 6;
    }
}

impl LocationSources {
    /// Keeps unknown bits so a newer ModemManager doesn't lose information.
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    pub fn supports_nmea(self) -> bool {
        self.contains(Self::GPS_NMEA)
    }
}

impl fmt::Display for LocationSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.bits())
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// An object seen through enumeration or an add-notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredSource {
    pub identity: SourceId,
    pub capabilities: LocationSources,
}

impl DiscoveredSource {
    pub fn new(identity: impl Into<SourceId>, capabilities: LocationSources) -> Self {
        Self {
            identity: identity.into(),
            capabilities,
        }
    }
}

/// The source the poll loop currently reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBinding {
    pub identity: SourceId,
    pub capabilities: LocationSources,
    pub bound_since: DateTime<Utc>,
}

/// Per-tick bookkeeping of the poll loop. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    /// True iff a source is bound.
    pub active: bool,
    pub last_attempt: Option<Instant>,
    /// Consecutive failed reads against the bound source.
    pub failure_streak: u32,
    /// Source of the read issued and not yet handled, if any.
    pub in_flight: Option<SourceId>,
}

impl PollState {
    /// Records the start of a read of `identity`. Returns `false` if a read
    /// of that same source is still outstanding and this tick should be
    /// skipped; an outstanding read of another source never blocks.
    pub fn begin_read(&mut self, identity: &SourceId, now: Instant) -> bool {
        if self.in_flight.as_ref() == Some(identity) {
            return false;
        }
        self.in_flight = Some(identity.clone());
        self.last_attempt = Some(now);
        true
    }

    /// Clears the outstanding read if it targeted `identity`.
    pub fn finish_read(&mut self, identity: &SourceId) {
        if self.in_flight.as_ref() == Some(identity) {
            self.in_flight = None;
        }
    }

    pub fn is_reading(&self, identity: &SourceId) -> bool {
        self.in_flight.as_ref() == Some(identity)
    }

    pub fn read_succeeded(&mut self, identity: &SourceId) {
        self.finish_read(identity);
        self.failure_streak = 0;
    }

    /// Returns the new streak length.
    pub fn read_failed(&mut self, identity: &SourceId) -> u32 {
        self.finish_read(identity);
        self.failure_streak = self.failure_streak.saturating_add(1);
        self.failure_streak
    }

    /// How long ago the last read was issued.
    pub fn since_last_attempt(&self, now: Instant) -> Option<Duration> {
        self.last_attempt.map(|at| now.saturating_duration_since(at))
    }

    /// Follows the registry: active iff bound. A binding change resets the
    /// failure streak because it concerned a different source.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.failure_streak = 0;
        }
        self.active = active;
    }
}
