//! Well-known names on the system bus and on the host.

use std::time::Duration;

pub const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
pub const MM_OBJECT_PATH: &str = "/org/freedesktop/ModemManager1";
pub const MM_LOCATION_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem.Location";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// `gpsdctl` prints this when gpsd is up but refuses a device it already has.
pub const GPSDCTL_ALREADY_TRACKING: &str = "reached a running gpsd";

/// Upper bound on the best-effort disable call during shutdown.
pub const SHUTDOWN_DISABLE_TIMEOUT: Duration = Duration::from_secs(2);
