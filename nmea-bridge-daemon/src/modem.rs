//! ModemManager on the system bus, seen through the narrow [`ModemBus`] seam.
//!
//! The event loop never touches zbus directly: it enumerates, sets up and
//! reads sources through this trait, and receives add/remove notifications as
//! [`BridgeEvent`]s posted by the subscription task.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use zbus::fdo::ObjectManagerProxy;
use zbus::message::Type as MessageType;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{proxy, Connection, MatchRule, Message, MessageStream};

use nmea_bridge_core::{DiscoveredSource, LocationSources, SourceId};

use crate::error::BusError;
use crate::paths::{
    MM_LOCATION_INTERFACE, MM_OBJECT_PATH, MM_SERVICE, OBJECT_MANAGER_INTERFACE,
    PROPERTIES_INTERFACE,
};
use crate::runtime::{BridgeEvent, EventSender};

/// The upstream operations the bridge needs, and nothing else.
#[async_trait]
pub trait ModemBus: Send + Sync {
    /// Every object exposing the Location interface, ordered by identity.
    async fn list_sources(&self) -> Result<Vec<DiscoveredSource>, BusError>;

    /// `Location.Setup(sources, signal_location)`.
    async fn setup(
        &self,
        identity: &SourceId,
        sources: LocationSources,
        signal_location: bool,
    ) -> Result<(), BusError>;

    /// The NMEA entry of the `Location` property, if present and non-empty.
    async fn read_nmea(&self, identity: &SourceId) -> Result<Option<String>, BusError>;

    /// Starts forwarding add/remove notifications (and, when
    /// `property_signals` is set, `Location` changes) into `events`.
    async fn subscribe(&self, events: EventSender, property_signals: bool) -> Result<(), BusError>;
}

#[proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Location",
    default_service = "org.freedesktop.ModemManager1"
)]
trait Location {
    fn setup(&self, sources: u32, signal_location: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn location(&self) -> zbus::Result<HashMap<u32, OwnedValue>>;
}

/// [`ModemBus`] backed by a system bus connection.
#[derive(Debug, Clone)]
pub struct ModemManager {
    conn: Connection,
}

impl ModemManager {
    pub async fn connect() -> Result<Self, BusError> {
        let conn = Connection::system().await?;
        Ok(Self { conn })
    }

    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>, BusError> {
        let proxy = ObjectManagerProxy::builder(&self.conn)
            .destination(MM_SERVICE)?
            .path(MM_OBJECT_PATH)?
            .build()
            .await?;
        Ok(proxy)
    }

    /// Properties are never cached: the `Location` cache would only refresh
    /// on change signals, which are exactly what cannot be relied on.
    async fn location(&self, identity: &SourceId) -> Result<LocationProxy<'static>, BusError> {
        let proxy = LocationProxy::builder(&self.conn)
            .path(identity.as_str().to_owned())
            .map_err(|_| BusError::InvalidPath(identity.clone()))?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(proxy)
    }
}

#[async_trait]
impl ModemBus for ModemManager {
    async fn list_sources(&self) -> Result<Vec<DiscoveredSource>, BusError> {
        let objects = self.object_manager().await?.get_managed_objects().await?;
        let mut sources: Vec<DiscoveredSource> = objects
            .iter()
            .filter_map(|(path, interfaces)| {
                let (_, props) = interfaces
                    .iter()
                    .find(|(name, _)| name.as_str() == MM_LOCATION_INTERFACE)?;
                Some(DiscoveredSource::new(path.as_str(), capabilities_of(props)))
            })
            .collect();
        sources.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(sources)
    }

    async fn setup(
        &self,
        identity: &SourceId,
        sources: LocationSources,
        signal_location: bool,
    ) -> Result<(), BusError> {
        self.location(identity)
            .await?
            .setup(sources.bits(), signal_location)
            .await?;
        Ok(())
    }

    async fn read_nmea(&self, identity: &SourceId) -> Result<Option<String>, BusError> {
        let location = self.location(identity).await?.location().await?;
        nmea_entry(location)
    }

    async fn subscribe(&self, events: EventSender, property_signals: bool) -> Result<(), BusError> {
        // Added and removed signals share one match rule, so they reach the
        // loop in bus order.
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(OBJECT_MANAGER_INTERFACE)?
            .path(MM_OBJECT_PATH)?
            .build();
        let stream = MessageStream::for_match_rule(rule, &self.conn, None).await?;
        let signals = stream.filter_map(|message| async move {
            match message {
                Ok(message) => ManagerSignal::decode(&message),
                Err(err) => {
                    tracing::debug!(error = %err, "dropping unreadable bus message");
                    None
                }
            }
        });
        tokio::spawn(forward_manager_signals(Box::pin(signals), events.clone()));

        if property_signals {
            let rule = MatchRule::builder()
                .msg_type(MessageType::Signal)
                .interface(PROPERTIES_INTERFACE)?
                .member("PropertiesChanged")?
                .path_namespace(MM_OBJECT_PATH)?
                .arg(0, MM_LOCATION_INTERFACE)?
                .build();
            let mut stream = MessageStream::for_match_rule(rule, &self.conn, Some(64)).await?;
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let Ok(message) = message else { continue };
                    let header = message.header();
                    let Some(path) = header.path() else { continue };
                    let identity = SourceId::from(path.as_str());
                    let body = message.body();
                    let Ok((_, changed, _)) =
                        body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                    else {
                        continue;
                    };
                    match location_change(identity.clone(), changed) {
                        Ok(Some(event)) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::debug!(source = %identity, error = %err, "unusable Location change");
                        }
                    }
                }
            });
        }

        Ok(())
    }
}

type InterfaceMap = HashMap<String, HashMap<String, OwnedValue>>;

/// An `org.freedesktop.DBus.ObjectManager` signal from ModemManager.
#[derive(Debug)]
enum ManagerSignal {
    Added {
        path: String,
        interfaces: InterfaceMap,
    },
    Removed {
        path: String,
        interfaces: Vec<String>,
    },
}

impl ManagerSignal {
    fn decode(message: &Message) -> Option<Self> {
        let header = message.header();
        let member = header.member()?;
        let body = message.body();
        let decoded = match member.as_str() {
            "InterfacesAdded" => body
                .deserialize::<(OwnedObjectPath, InterfaceMap)>()
                .map(|(path, interfaces)| ManagerSignal::Added {
                    path: path.as_str().to_owned(),
                    interfaces,
                }),
            "InterfacesRemoved" => body
                .deserialize::<(OwnedObjectPath, Vec<String>)>()
                .map(|(path, interfaces)| ManagerSignal::Removed {
                    path: path.as_str().to_owned(),
                    interfaces,
                }),
            _ => return None,
        };
        match decoded {
            Ok(signal) => Some(signal),
            Err(err) => {
                tracing::warn!(member = %member, error = %err, "malformed ObjectManager signal");
                None
            }
        }
    }

    /// Only changes to the Location interface matter to the bridge.
    fn into_event(self) -> Option<BridgeEvent> {
        match self {
            ManagerSignal::Added { path, interfaces } => {
                let props = interfaces.get(MM_LOCATION_INTERFACE)?;
                Some(BridgeEvent::SourceAdded(DiscoveredSource::new(
                    path,
                    capabilities_of(props),
                )))
            }
            ManagerSignal::Removed { path, interfaces } => interfaces
                .iter()
                .any(|name| name == MM_LOCATION_INTERFACE)
                .then(|| BridgeEvent::SourceRemoved(SourceId::from(path))),
        }
    }
}

/// Posts every relevant signal, in stream order, until either side closes.
async fn forward_manager_signals<S>(mut signals: S, events: EventSender)
where
    S: Stream<Item = ManagerSignal> + Unpin,
{
    while let Some(signal) = signals.next().await {
        let Some(event) = signal.into_event() else {
            continue;
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!("modem notification stream ended");
}

fn location_change(
    identity: SourceId,
    mut changed: HashMap<String, OwnedValue>,
) -> Result<Option<BridgeEvent>, BusError> {
    let Some(location) = changed.remove("Location") else {
        return Ok(None);
    };
    let location = HashMap::<u32, OwnedValue>::try_from(location)?;
    Ok(nmea_entry(location)?.map(|payload| BridgeEvent::LocationChanged { identity, payload }))
}

/// `Capabilities` of a Location property map; absent or mistyped reads as none.
fn capabilities_of(props: &HashMap<String, OwnedValue>) -> LocationSources {
    LocationSources::from_raw(props.get("Capabilities").and_then(|v| as_u32(v)).unwrap_or(0))
}

/// Picks the NMEA string out of a `Location` dictionary.
fn nmea_entry(mut location: HashMap<u32, OwnedValue>) -> Result<Option<String>, BusError> {
    let Some(value) = location.remove(&LocationSources::GPS_NMEA.bits()) else {
        return Ok(None);
    };
    match &*value {
        Value::Str(text) if text.as_str().trim().is_empty() => Ok(None),
        Value::Str(text) => Ok(Some(text.as_str().to_owned())),
        other => Err(BusError::Other(format!(
            "NMEA entry is not a string: {other:?}"
        ))),
    }
}

fn as_u32(value: &Value<'_>) -> Option<u32> {
    match value {
        Value::U32(n) => Some(*n),
        _ => None,
    }
}
