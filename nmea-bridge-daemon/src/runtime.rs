use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::unistd::Uid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use nmea_bridge_core::{
    registry::{BindRequest, Commit, RetryDecision},
    BindTicket, BridgeConfig, DiscoveredSource, LocationSources, PollState, SourceId,
    SourceRegistry,
};

use crate::consumer::{ConsumerControl, Gpsd, Registration};
use crate::device::{DeviceChannel, DeviceOwnership, SentenceSink};
use crate::error::{io_err, BusError, DaemonError};
use crate::modem::{ModemBus, ModemManager};
use crate::paths::SHUTDOWN_DISABLE_TIMEOUT;

pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;

/// Everything the bridge reacts to. Each event is handled to completion on
/// the loop before the next one is looked at.
#[derive(Debug)]
pub enum BridgeEvent {
    /// Fixed-cadence poll.
    Tick,
    /// Re-enumerate upstream objects if nothing is bound.
    Rescan,
    Enumerated(Result<Vec<DiscoveredSource>, BusError>),
    SourceAdded(DiscoveredSource),
    SourceRemoved(SourceId),
    /// Time for (another) setup call of the given bind attempt.
    BindRetry(BindTicket),
    BindFinished {
        ticket: BindTicket,
        result: Result<(), BusError>,
    },
    LocationRead {
        identity: SourceId,
        result: Result<Option<String>, BusError>,
    },
    /// `Location` changed upstream; forwarded only when `identity` is bound.
    LocationChanged { identity: SourceId, payload: String },
    RegisterRetry { attempt: u32 },
    RegisterFinished {
        attempt: u32,
        result: Result<Registration, DaemonError>,
    },
    Shutdown,
}

/// Delays and limits, taken from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct BridgeTiming {
    pub poll_interval: Duration,
    pub bind_retry: Duration,
    pub bind_head_start: Duration,
    pub rescan_interval: Option<Duration>,
    pub register_retry: Duration,
    pub register_attempts: u32,
}

impl BridgeTiming {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            bind_retry: config.bind_retry_delay(),
            bind_head_start: config.bind_head_start(),
            rescan_interval: config.rescan_interval(),
            register_retry: config.consumer.retry_delay(),
            register_attempts: config.consumer.attempts,
        }
    }
}

/// The bridge state machine. Owns the device channel and the source registry;
/// upstream calls run as spawned tasks that report back through `events`.
pub struct Bridge {
    bus: Arc<dyn ModemBus>,
    consumer: Option<Arc<dyn ConsumerControl>>,
    sink: Box<dyn SentenceSink>,
    registry: SourceRegistry,
    poll: PollState,
    timing: BridgeTiming,
    pinned: Option<SourceId>,
    events: EventSender,
    enumerating: bool,
    stopping: bool,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        bus: Arc<dyn ModemBus>,
        consumer: Option<Arc<dyn ConsumerControl>>,
        sink: Box<dyn SentenceSink>,
        events: EventSender,
    ) -> Self {
        Self {
            bus,
            consumer,
            sink,
            registry: SourceRegistry::new(config.bind_attempts),
            poll: PollState::default(),
            timing: BridgeTiming::from_config(config),
            pinned: config.pinned_source(),
            events,
            enumerating: false,
            stopping: false,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn poll_state(&self) -> &PollState {
        &self.poll
    }

    pub fn consumer_path(&self) -> &std::path::Path {
        self.sink.consumer_path()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Drives the bridge until a [`BridgeEvent::Shutdown`] arrives, then
    /// disables the bound source and tears the device channel down.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    ) -> Result<(), DaemonError> {
        self.start();

        let mut poll = tokio::time::interval(self.timing.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Startup enumeration already ran in `start`; the first rescan waits a
        // full period.
        let mut rescan = self.timing.rescan_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut closed = false;
        while !self.stopping {
            tokio::select! {
                _ = poll.tick() => self.handle(BridgeEvent::Tick),
                _ = next_rescan(&mut rescan) => self.handle(BridgeEvent::Rescan),
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        self.finish().await;
        if closed {
            return Err(DaemonError::ChannelClosed("bridge events"));
        }
        Ok(())
    }

    /// Startup: bind the pinned source or enumerate, then hand the device to
    /// the consumer.
    fn start(&mut self) {
        match self.pinned.clone() {
            Some(identity) => {
                tracing::info!(source = %identity, "using pinned modem, discovery disabled");
                self.request_bind(identity, LocationSources::GPS_NMEA, Duration::ZERO);
            }
            None => self.handle(BridgeEvent::Rescan),
        }

        if let Some(consumer) = self.consumer.clone() {
            tokio::spawn(async move {
                if let Err(err) = consumer.start_service().await {
                    tracing::warn!(error = %err, "could not start consumer service");
                }
            });
            self.schedule(
                self.timing.register_retry,
                BridgeEvent::RegisterRetry { attempt: 1 },
            );
        }
    }

    pub fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Tick => self.on_tick(),
            BridgeEvent::Rescan => self.on_rescan(),
            BridgeEvent::Enumerated(result) => self.on_enumerated(result),
            BridgeEvent::SourceAdded(source) => self.on_source_added(source),
            BridgeEvent::SourceRemoved(identity) => self.on_source_removed(identity),
            BridgeEvent::BindRetry(ticket) => self.on_bind_retry(ticket),
            BridgeEvent::BindFinished { ticket, result } => self.on_bind_finished(ticket, result),
            BridgeEvent::LocationRead { identity, result } => {
                self.on_location_read(identity, result)
            }
            BridgeEvent::LocationChanged { identity, payload } => {
                if self.registry.is_bound_to(&identity) {
                    self.forward(&identity, &payload);
                }
            }
            BridgeEvent::RegisterRetry { attempt } => self.on_register_retry(attempt),
            BridgeEvent::RegisterFinished { attempt, result } => {
                self.on_register_finished(attempt, result)
            }
            BridgeEvent::Shutdown => {
                if !self.stopping {
                    tracing::info!("shutting down");
                }
                self.stopping = true;
            }
        }
    }

    // ─── Poll / forward ────────────────────────────────────────────────────────

    fn on_tick(&mut self) {
        let Some(binding) = self.registry.current_binding() else {
            return;
        };
        let now = Instant::now().into_std();
        if !self.poll.begin_read(&binding.identity, now) {
            tracing::debug!(
                source = %binding.identity,
                pending_ms = self.poll.since_last_attempt(now).map(|d| d.as_millis() as u64),
                "previous read still pending, skipping tick",
            );
            return;
        }

        let identity = binding.identity.clone();
        let bus = Arc::clone(&self.bus);
        let events = self.events.clone();
        let deadline = self.timing.poll_interval;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, bus.read_nmea(&identity)).await {
                Ok(result) => result,
                Err(_) => Err(BusError::Timeout(deadline)),
            };
            let _ = events.send(BridgeEvent::LocationRead { identity, result });
        });
    }

    fn on_location_read(&mut self, identity: SourceId, result: Result<Option<String>, BusError>) {
        if !self.registry.is_bound_to(&identity) {
            self.poll.finish_read(&identity);
            tracing::debug!(source = %identity, "dropping read from a source that is no longer bound");
            return;
        }

        match result {
            Ok(Some(payload)) => {
                self.poll.read_succeeded(&identity);
                // No deduplication: an unchanged payload is written again.
                self.forward(&identity, &payload);
            }
            Ok(None) => self.poll.read_succeeded(&identity),
            Err(err) => {
                let streak = self.poll.read_failed(&identity);
                if streak == 1 || streak % 30 == 0 {
                    tracing::warn!(source = %identity, streak, error = %err, "location read failed");
                } else {
                    tracing::debug!(source = %identity, streak, error = %err, "location read failed");
                }
            }
        }
    }

    fn forward(&mut self, identity: &SourceId, payload: &str) {
        match self.sink.forward(payload) {
            Ok(sentences) => {
                tracing::trace!(source = %identity, sentences, "forwarded NMEA");
            }
            Err(DaemonError::ReaderStalled { dropped }) => {
                tracing::debug!(source = %identity, dropped, "device reader not keeping up");
            }
            Err(err) => {
                tracing::warn!(source = %identity, error = %err, "device write failed");
            }
        }
    }

    // ─── Discovery ─────────────────────────────────────────────────────────────

    fn on_rescan(&mut self) {
        if self.pinned.is_some() || self.enumerating || !self.registry.is_idle() {
            return;
        }
        self.enumerating = true;
        let bus = Arc::clone(&self.bus);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = bus.list_sources().await;
            let _ = events.send(BridgeEvent::Enumerated(result));
        });
    }

    fn on_enumerated(&mut self, result: Result<Vec<DiscoveredSource>, BusError>) {
        self.enumerating = false;
        let sources = match result {
            Ok(sources) => sources,
            Err(err) => {
                tracing::warn!(error = %err, "modem enumeration failed");
                return;
            }
        };

        match sources.into_iter().find(|s| s.capabilities.supports_nmea()) {
            Some(source) => {
                tracing::info!(
                    source = %source.identity,
                    modem = ?source.identity.modem_index(),
                    capabilities = %source.capabilities,
                    "discovered GPS modem",
                );
                self.request_bind(source.identity, source.capabilities, Duration::ZERO);
            }
            None => tracing::info!("no modem with GPS NMEA capability yet"),
        }
    }

    fn on_source_added(&mut self, source: DiscoveredSource) {
        if let Some(pinned) = &self.pinned {
            if pinned != &source.identity {
                tracing::debug!(source = %source.identity, "ignoring modem other than the pinned one");
                return;
            }
        }
        if !source.capabilities.supports_nmea() {
            tracing::debug!(
                source = %source.identity,
                capabilities = %source.capabilities,
                "new modem has no GPS NMEA capability",
            );
            return;
        }
        tracing::info!(source = %source.identity, "GPS modem appeared");
        self.request_bind(
            source.identity,
            source.capabilities,
            self.timing.bind_head_start,
        );
    }

    fn on_source_removed(&mut self, identity: SourceId) {
        let cleared = self.registry.unbind(&identity);
        if cleared.binding {
            tracing::info!(source = %identity, "bound modem removed, forwarding paused");
        }
        if cleared.pending {
            tracing::info!(source = %identity, "modem removed while binding, attempt abandoned");
        }
        self.sync_poll_state();
    }

    // ─── Binding ───────────────────────────────────────────────────────────────

    fn request_bind(&mut self, identity: SourceId, capabilities: LocationSources, delay: Duration) {
        match self.registry.bind(&identity, capabilities) {
            BindRequest::Start { ticket, superseded } => {
                if let Some(old) = superseded {
                    tracing::info!(source = %old, "abandoning bind in favour of newer modem");
                }
                tracing::debug!(source = %identity, %ticket, delay_ms = delay.as_millis() as u64, "bind scheduled");
                self.schedule(delay, BridgeEvent::BindRetry(ticket));
            }
            BindRequest::AlreadyBound => {
                tracing::debug!(source = %identity, "already bound");
            }
            BindRequest::AlreadyPending => {
                tracing::debug!(source = %identity, "bind already in progress");
            }
            BindRequest::NotCapable => {
                tracing::debug!(source = %identity, "refusing bind without GPS NMEA capability");
            }
        }
    }

    fn on_bind_retry(&mut self, ticket: BindTicket) {
        let Some(pending) = self.registry.pending_for(ticket) else {
            tracing::debug!(%ticket, "bind no longer wanted");
            return;
        };
        let identity = pending.identity.clone();
        let bus = Arc::clone(&self.bus);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = bus.setup(&identity, LocationSources::GPS_NMEA, true).await;
            let _ = events.send(BridgeEvent::BindFinished { ticket, result });
        });
    }

    fn on_bind_finished(&mut self, ticket: BindTicket, result: Result<(), BusError>) {
        let identity = self.registry.pending_for(ticket).map(|p| p.identity.clone());

        match result {
            Ok(()) => match self.registry.complete(ticket, Utc::now()) {
                Commit::Bound { replaced } => {
                    let binding = self.registry.current_binding();
                    if let Some(binding) = binding {
                        tracing::info!(
                            source = %binding.identity,
                            modem = ?binding.identity.modem_index(),
                            replaced = ?replaced.as_ref().map(SourceId::as_str),
                            "GPS NMEA enabled, forwarding",
                        );
                    }
                    self.sync_poll_state();
                }
                Commit::Stale => {
                    tracing::debug!(%ticket, "setup succeeded for an abandoned bind, ignoring");
                }
            },
            Err(err) => {
                let Some(identity) = identity else {
                    tracing::debug!(%ticket, error = %err, "setup failed for an abandoned bind");
                    return;
                };
                match self.registry.fail(ticket) {
                    RetryDecision::Retry { attempt } => {
                        tracing::warn!(
                            source = %identity,
                            attempt,
                            max = self.registry.max_attempts(),
                            error = %err,
                            "location setup failed, retrying",
                        );
                        self.schedule(self.timing.bind_retry, BridgeEvent::BindRetry(ticket));
                    }
                    RetryDecision::GiveUp { attempts } => {
                        tracing::error!(
                            source = %identity,
                            attempts,
                            error = %err,
                            "giving up on modem until it is announced again",
                        );
                    }
                    RetryDecision::Stale => {}
                }
            }
        }
    }

    fn sync_poll_state(&mut self) {
        self.poll.set_active(self.registry.current_binding().is_some());
    }

    // ─── Consumer handoff ──────────────────────────────────────────────────────

    fn on_register_retry(&mut self, attempt: u32) {
        let Some(consumer) = self.consumer.clone() else {
            return;
        };
        let device = self.sink.consumer_path().to_path_buf();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = consumer.register(&device).await;
            let _ = events.send(BridgeEvent::RegisterFinished { attempt, result });
        });
    }

    fn on_register_finished(&mut self, attempt: u32, result: Result<Registration, DaemonError>) {
        let link = self.sink.consumer_path().display().to_string();
        let reason = match result {
            Ok(Registration::Added) => {
                tracing::info!(link = %link, "gpsd: device added");
                return;
            }
            Ok(Registration::AlreadyTracking) => {
                tracing::info!(link = %link, "gpsd already tracking device");
                return;
            }
            Ok(Registration::NotReady(reason)) => reason,
            Err(err) => err.to_string(),
        };

        if attempt < self.timing.register_attempts {
            tracing::debug!(link = %link, attempt, reason = %reason, "gpsd not ready, retrying");
            self.schedule(
                self.timing.register_retry,
                BridgeEvent::RegisterRetry {
                    attempt: attempt + 1,
                },
            );
        } else {
            tracing::warn!(
                link = %link,
                attempts = attempt,
                reason = %reason,
                "could not add device to gpsd; run manually: gpsdctl add {link}",
            );
        }
    }

    // ─── Scheduling / shutdown ─────────────────────────────────────────────────

    /// Posts `event` back onto the loop after `delay`. Never sleeps on the loop.
    fn schedule(&self, delay: Duration, event: BridgeEvent) {
        if delay.is_zero() {
            let _ = self.events.send(event);
            return;
        }
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    /// Best-effort disable of the bound source, then device teardown.
    /// Consumes the bridge, so it runs at most once.
    pub async fn finish(mut self) {
        if let Some(binding) = self.registry.current_binding().cloned() {
            let disable = self
                .bus
                .setup(&binding.identity, LocationSources::empty(), false);
            match tokio::time::timeout(SHUTDOWN_DISABLE_TIMEOUT, disable).await {
                Ok(Ok(())) => tracing::info!(source = %binding.identity, "location disabled"),
                Ok(Err(err)) => {
                    tracing::debug!(source = %binding.identity, error = %err, "disable failed")
                }
                Err(_) => tracing::debug!(source = %binding.identity, "disable timed out"),
            }
        }
        if let Err(err) = self.sink.teardown() {
            tracing::warn!(error = %err, "device teardown failed");
        }
        tracing::info!("bridge stopped");
    }
}

async fn next_rescan(rescan: &mut Option<Interval>) {
    match rescan {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Start the bridge on a single-threaded runtime and block until it exits.
pub fn start_blocking(config: BridgeConfig) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(serve(config))
}

/// Creates the device channel, connects to ModemManager and runs the bridge.
pub async fn serve(config: BridgeConfig) -> Result<(), DaemonError> {
    tracing::info!(
        link = %config.link.display(),
        modem = ?config.modem,
        handoff = config.consumer.enabled,
        "starting bridge",
    );
    let ownership = DeviceOwnership {
        owner: Uid::from_raw(config.owner_uid),
        group: config.group.clone(),
    };
    let mut channel = DeviceChannel::create(&config.link, &ownership)?;

    let bus = match ModemManager::connect().await {
        Ok(bus) => bus,
        Err(err) => {
            let _ = channel.teardown();
            return Err(err.into());
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    if let Err(err) = bus.subscribe(events_tx.clone(), config.property_signals).await {
        tracing::warn!(error = %err, "modem notifications unavailable, relying on rescans");
    }
    if let Err(err) = spawn_signal_listener(events_tx.clone()) {
        let _ = channel.teardown();
        return Err(err);
    }

    let consumer = config
        .consumer
        .enabled
        .then(|| Arc::new(Gpsd::from_config(&config.consumer)) as Arc<dyn ConsumerControl>);

    tracing::info!(link = %config.link.display(), "forwarding NMEA");
    Bridge::new(&config, Arc::new(bus), consumer, Box::new(channel), events_tx)
        .run(events_rx)
        .await
}

/// SIGTERM and SIGINT each post a [`BridgeEvent::Shutdown`]; the loop acts on
/// the first one only.
fn spawn_signal_listener(events: EventSender) -> Result<(), DaemonError> {
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|e| io_err("SIGINT handler", e))?;
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "received termination signal");
            if events.send(BridgeEvent::Shutdown).is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// One-shot enumeration for the `sources` command.
pub fn list_sources_blocking() -> Result<Vec<DiscoveredSource>, DaemonError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async {
        let bus = ModemManager::connect().await?;
        Ok(bus.list_sources().await?)
    })
}

pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::advance;

    const FIX: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn modem(index: u32) -> SourceId {
        SourceId::from_modem_index(index)
    }

    fn gps(index: u32) -> DiscoveredSource {
        DiscoveredSource::new(modem(index), LocationSources::from_raw(0x07))
    }

    #[derive(Default)]
    struct FakeBus {
        sources: Mutex<Vec<DiscoveredSource>>,
        list_calls: Mutex<u32>,
        setup_calls: Mutex<Vec<(SourceId, LocationSources, bool)>>,
        /// Remaining setup failures per source; `u32::MAX` fails forever.
        setup_failures: Mutex<HashMap<SourceId, u32>>,
        reads: Mutex<Vec<SourceId>>,
        payloads: Mutex<HashMap<SourceId, String>>,
        read_errors: Mutex<u32>,
        /// Sources whose reads never complete.
        hung: Mutex<HashSet<SourceId>>,
    }

    impl FakeBus {
        fn set_payload(&self, identity: &SourceId, payload: &str) {
            self.payloads
                .lock()
                .unwrap()
                .insert(identity.clone(), payload.to_string());
        }

        fn enabling_setups(&self) -> Vec<SourceId> {
            self.setup_calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, sources, _)| !sources.is_empty())
                .map(|(id, _, _)| id.clone())
                .collect()
        }

        fn reads(&self) -> Vec<SourceId> {
            self.reads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModemBus for FakeBus {
        async fn list_sources(&self) -> Result<Vec<DiscoveredSource>, BusError> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.sources.lock().unwrap().clone())
        }

        async fn setup(
            &self,
            identity: &SourceId,
            sources: LocationSources,
            signal_location: bool,
        ) -> Result<(), BusError> {
            self.setup_calls
                .lock()
                .unwrap()
                .push((identity.clone(), sources, signal_location));
            let mut failures = self.setup_failures.lock().unwrap();
            match failures.get_mut(identity) {
                Some(left) if *left > 0 => {
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    Err(BusError::Other("modem not ready".to_string()))
                }
                _ => Ok(()),
            }
        }

        async fn read_nmea(&self, identity: &SourceId) -> Result<Option<String>, BusError> {
            self.reads.lock().unwrap().push(identity.clone());
            let hang = self.hung.lock().unwrap().contains(identity);
            if hang {
                std::future::pending::<()>().await;
            }
            let mut errors = self.read_errors.lock().unwrap();
            if *errors > 0 {
                *errors -= 1;
                return Err(BusError::Other("timeout".to_string()));
            }
            Ok(self.payloads.lock().unwrap().get(identity).cloned())
        }

        async fn subscribe(&self, _: EventSender, _: bool) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorded {
        writes: Vec<String>,
        teardowns: u32,
    }

    struct RecordingSink {
        path: PathBuf,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl SentenceSink for RecordingSink {
        fn consumer_path(&self) -> &Path {
            &self.path
        }

        fn forward(&mut self, payload: &str) -> Result<usize, DaemonError> {
            self.recorded.lock().unwrap().writes.push(payload.to_string());
            Ok(payload.lines().count())
        }

        fn teardown(&mut self) -> Result<(), DaemonError> {
            self.recorded.lock().unwrap().teardowns += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGpsd {
        starts: Mutex<u32>,
        registered: Mutex<Vec<PathBuf>>,
        outcomes: Mutex<VecDeque<Registration>>,
    }

    #[async_trait]
    impl ConsumerControl for FakeGpsd {
        async fn start_service(&self) -> Result<(), DaemonError> {
            *self.starts.lock().unwrap() += 1;
            Ok(())
        }

        async fn register(&self, device: &Path) -> Result<Registration, DaemonError> {
            self.registered.lock().unwrap().push(device.to_path_buf());
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Registration::NotReady("can't reach gpsd".to_string())))
        }
    }

    struct Harness {
        bridge: Bridge,
        rx: mpsc::UnboundedReceiver<BridgeEvent>,
        bus: Arc<FakeBus>,
        gpsd: Arc<FakeGpsd>,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl Harness {
        fn new() -> Self {
            let config = BridgeConfig {
                rescan_interval_secs: 0,
                ..BridgeConfig::default()
            };
            Self::with_config(config, false)
        }

        fn with_config(config: BridgeConfig, handoff: bool) -> Self {
            let bus = Arc::new(FakeBus::default());
            let gpsd = Arc::new(FakeGpsd::default());
            let recorded = Arc::new(Mutex::new(Recorded::default()));
            let sink = RecordingSink {
                path: config.link.clone(),
                recorded: Arc::clone(&recorded),
            };
            let consumer = handoff.then(|| Arc::clone(&gpsd) as Arc<dyn ConsumerControl>);
            let (tx, rx) = mpsc::unbounded_channel();
            let bridge = Bridge::new(
                &config,
                Arc::clone(&bus) as Arc<dyn ModemBus>,
                consumer,
                Box::new(sink),
                tx,
            );
            Self {
                bridge,
                rx,
                bus,
                gpsd,
                recorded,
            }
        }

        /// Lets spawned tasks run and feeds everything they post back in.
        async fn pump(&mut self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
                while let Ok(event) = self.rx.try_recv() {
                    self.bridge.handle(event);
                }
            }
        }

        async fn send(&mut self, event: BridgeEvent) {
            self.bridge.handle(event);
            self.pump().await;
        }

        async fn tick(&mut self) {
            self.send(BridgeEvent::Tick).await;
        }

        /// Timer deadlines round up to the next millisecond, hence the slack.
        async fn wait(&mut self, duration: Duration) {
            advance(duration + Duration::from_millis(1)).await;
            self.pump().await;
        }

        /// Announces `index` and waits out the head start.
        async fn bind(&mut self, index: u32) {
            self.send(BridgeEvent::SourceAdded(gps(index))).await;
            self.wait(Duration::from_secs(3)).await;
            assert!(self.bridge.registry().is_bound_to(&modem(index)));
        }

        fn writes(&self) -> Vec<String> {
            self.recorded.lock().unwrap().writes.clone()
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn identical_payloads_are_forwarded_every_tick() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), FIX);

        h.tick().await;
        h.tick().await;

        assert_eq!(h.writes(), vec![FIX.to_string(), FIX.to_string()]);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn nothing_is_read_or_written_without_a_binding() {
        let mut h = Harness::new();
        for _ in 0..5 {
            h.tick().await;
        }
        assert!(h.bus.reads().is_empty());
        assert!(h.writes().is_empty());
        assert!(!h.bridge.poll_state().active);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn duplicate_announcements_set_up_once() {
        let mut h = Harness::new();
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.wait(Duration::from_secs(3)).await;
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.wait(Duration::from_secs(3)).await;

        assert_eq!(h.bus.enabling_setups(), vec![modem(0)]);
        let calls = h.bus.setup_calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, LocationSources::GPS_NMEA);
        assert!(calls[0].2, "signal_location must be requested");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn setup_waits_for_the_head_start() {
        let mut h = Harness::new();
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.wait(Duration::from_millis(2_900)).await;
        assert!(h.bus.enabling_setups().is_empty());

        h.wait(Duration::from_millis(100)).await;
        assert_eq!(h.bus.enabling_setups(), vec![modem(0)]);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn removing_another_source_keeps_the_binding() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), FIX);

        h.send(BridgeEvent::SourceRemoved(modem(7))).await;
        h.tick().await;

        assert!(h.bridge.registry().is_bound_to(&modem(0)));
        assert_eq!(h.writes().len(), 1);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn rebinding_after_removal_reads_only_the_new_source() {
        let mut h = Harness::new();
        let link = h.bridge.consumer_path().to_path_buf();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), "$GPGGA,A*00");
        h.bus.set_payload(&modem(1), "$GPGGA,B*00");
        h.tick().await;

        h.send(BridgeEvent::SourceRemoved(modem(0))).await;
        assert!(!h.bridge.poll_state().active);
        h.tick().await;
        h.bind(1).await;
        let reads_before = h.bus.reads().len();
        h.tick().await;
        h.tick().await;

        assert!(h.bus.reads()[reads_before..].iter().all(|id| id == &modem(1)));
        assert_eq!(
            h.writes(),
            vec!["$GPGGA,A*00".to_string(), "$GPGGA,B*00".to_string(), "$GPGGA,B*00".to_string()]
        );
        assert_eq!(h.bridge.consumer_path(), link.as_path());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn sources_without_nmea_are_never_set_up() {
        let mut h = Harness::new();
        let raw_only = DiscoveredSource::new(modem(0), LocationSources::from_raw(0x01));
        h.send(BridgeEvent::SourceAdded(raw_only)).await;
        h.wait(Duration::from_secs(10)).await;

        assert!(h.bus.setup_calls.lock().unwrap().is_empty());
        assert!(h.bridge.registry().is_idle());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn failed_setup_is_retried_until_it_succeeds() {
        let mut h = Harness::new();
        h.bus.setup_failures.lock().unwrap().insert(modem(0), 3);
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.wait(Duration::from_secs(3)).await;
        assert_eq!(h.bus.enabling_setups().len(), 1);

        for expected in 2..=4 {
            h.tick().await;
            h.wait(Duration::from_secs(2)).await;
            assert_eq!(h.bus.enabling_setups().len(), expected);
        }
        assert!(h.bridge.registry().is_bound_to(&modem(0)));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn setup_gives_up_after_the_attempt_limit() {
        let mut h = Harness::new();
        h.bus.setup_failures.lock().unwrap().insert(modem(0), u32::MAX);
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        h.wait(Duration::from_secs(3)).await;
        for _ in 0..20 {
            h.wait(Duration::from_secs(2)).await;
        }

        assert_eq!(h.bus.enabling_setups().len(), 10);
        assert!(h.bridge.registry().is_idle());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn setup_success_after_removal_does_not_bind() {
        let mut h = Harness::new();
        h.send(BridgeEvent::SourceAdded(gps(0))).await;
        advance(Duration::from_millis(3_001)).await;
        // Let the head-start timer post its retry, then issue the setup call
        // without feeding its result back yet.
        let retry = loop {
            tokio::task::yield_now().await;
            if let Ok(event) = h.rx.try_recv() {
                break event;
            }
        };
        assert!(matches!(retry, BridgeEvent::BindRetry(_)));
        h.bridge.handle(retry);
        h.bridge.handle(BridgeEvent::SourceRemoved(modem(0)));
        h.pump().await;

        assert_eq!(h.bus.enabling_setups(), vec![modem(0)]);
        assert!(h.bridge.registry().is_idle());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn newer_announcement_supersedes_pending_bind() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), "$GPGGA,A*00");
        h.send(BridgeEvent::SourceAdded(gps(1))).await;
        h.send(BridgeEvent::SourceAdded(gps(2))).await;

        // The old binding keeps forwarding while the new bind is in flight.
        h.tick().await;
        assert_eq!(h.writes().len(), 1);

        h.wait(Duration::from_secs(3)).await;
        assert_eq!(h.bus.enabling_setups(), vec![modem(0), modem(2)]);
        assert!(h.bridge.registry().is_bound_to(&modem(2)));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn read_after_unbind_is_discarded() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), FIX);

        h.bridge.handle(BridgeEvent::Tick);
        h.bridge.handle(BridgeEvent::SourceRemoved(modem(0)));
        h.pump().await;

        assert_eq!(h.bus.reads(), vec![modem(0)]);
        assert!(h.writes().is_empty());
        assert!(!h.bridge.poll_state().is_reading(&modem(0)));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn hung_read_of_removed_source_does_not_stall_the_new_one() {
        // Long enough that the read timeout never fires during the test.
        let config = BridgeConfig {
            poll_interval_ms: 60_000,
            rescan_interval_secs: 0,
            ..BridgeConfig::default()
        };
        let mut h = Harness::with_config(config, false);
        h.bus.hung.lock().unwrap().insert(modem(0));
        h.bind(0).await;
        h.tick().await;
        assert!(h.bridge.poll_state().is_reading(&modem(0)));

        h.send(BridgeEvent::SourceRemoved(modem(0))).await;
        h.bind(1).await;
        h.bus.set_payload(&modem(1), FIX);
        for _ in 0..3 {
            h.tick().await;
        }

        let reads_of_new = h.bus.reads().iter().filter(|id| *id == &modem(1)).count();
        assert_eq!(reads_of_new, 3);
        assert_eq!(h.writes().len(), 3);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn hung_read_times_out_as_a_failure() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.hung.lock().unwrap().insert(modem(0));

        h.tick().await;
        h.tick().await;
        assert_eq!(h.bus.reads().len(), 1, "second tick waits for the first read");

        h.wait(Duration::from_secs(1)).await;
        assert_eq!(h.bridge.poll_state().failure_streak, 1);
        assert!(!h.bridge.poll_state().is_reading(&modem(0)));
        assert!(h.bridge.registry().is_bound_to(&modem(0)));

        h.tick().await;
        assert_eq!(h.bus.reads().len(), 2);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn read_failures_do_not_unbind() {
        let mut h = Harness::new();
        h.bind(0).await;
        h.bus.set_payload(&modem(0), FIX);
        *h.bus.read_errors.lock().unwrap() = 3;

        for _ in 0..3 {
            h.tick().await;
        }
        assert_eq!(h.bridge.poll_state().failure_streak, 3);
        assert!(h.bridge.registry().is_bound_to(&modem(0)));

        h.tick().await;
        assert_eq!(h.writes(), vec![FIX.to_string()]);
        assert_eq!(h.bridge.poll_state().failure_streak, 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn location_changes_forward_only_for_the_bound_source() {
        let mut h = Harness::new();
        h.bind(0).await;

        h.send(BridgeEvent::LocationChanged {
            identity: modem(1),
            payload: "$GPGGA,B*00".to_string(),
        })
        .await;
        h.send(BridgeEvent::LocationChanged {
            identity: modem(0),
            payload: FIX.to_string(),
        })
        .await;

        assert_eq!(h.writes(), vec![FIX.to_string()]);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn startup_binds_first_capable_source_without_head_start() {
        let mut h = Harness::new();
        *h.bus.sources.lock().unwrap() = vec![
            DiscoveredSource::new(modem(0), LocationSources::from_raw(0x01)),
            gps(1),
            gps(2),
        ];
        h.bridge.start();
        h.pump().await;

        assert_eq!(h.bus.enabling_setups(), vec![modem(1)]);
        assert!(h.bridge.registry().is_bound_to(&modem(1)));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn rescan_only_enumerates_while_idle() {
        let mut h = Harness::new();
        h.bridge.start();
        h.pump().await;
        assert_eq!(*h.bus.list_calls.lock().unwrap(), 1);
        assert!(h.bridge.registry().is_idle());

        *h.bus.sources.lock().unwrap() = vec![gps(4)];
        h.send(BridgeEvent::Rescan).await;
        assert!(h.bridge.registry().is_bound_to(&modem(4)));

        h.send(BridgeEvent::Rescan).await;
        assert_eq!(*h.bus.list_calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn pinned_modem_skips_discovery() {
        let config = BridgeConfig {
            modem: Some(2),
            rescan_interval_secs: 0,
            ..BridgeConfig::default()
        };
        let mut h = Harness::with_config(config, false);
        *h.bus.sources.lock().unwrap() = vec![gps(0)];
        h.bridge.start();
        h.pump().await;
        h.send(BridgeEvent::SourceAdded(gps(5))).await;
        h.send(BridgeEvent::Rescan).await;
        h.wait(Duration::from_secs(5)).await;

        assert_eq!(*h.bus.list_calls.lock().unwrap(), 0);
        assert_eq!(h.bus.enabling_setups(), vec![modem(2)]);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn handoff_retries_until_gpsd_accepts() {
        let config = BridgeConfig {
            rescan_interval_secs: 0,
            ..BridgeConfig::default()
        };
        let mut h = Harness::with_config(config.clone(), true);
        h.gpsd.outcomes.lock().unwrap().extend([
            Registration::NotReady("can't reach gpsd".to_string()),
            Registration::NotReady("can't reach gpsd".to_string()),
            Registration::Added,
        ]);
        h.bridge.start();
        h.pump().await;
        assert_eq!(*h.gpsd.starts.lock().unwrap(), 1);

        for _ in 0..10 {
            h.wait(Duration::from_secs(1)).await;
        }

        let registered = h.gpsd.registered.lock().unwrap().clone();
        assert_eq!(registered.len(), 3);
        assert!(registered.iter().all(|p| p == &config.link));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn handoff_gives_up_after_configured_attempts() {
        let mut config = BridgeConfig {
            rescan_interval_secs: 0,
            ..BridgeConfig::default()
        };
        config.consumer.attempts = 4;
        let mut h = Harness::with_config(config, true);
        h.bridge.start();
        h.pump().await;

        for _ in 0..20 {
            h.wait(Duration::from_secs(1)).await;
        }

        assert_eq!(h.gpsd.registered.lock().unwrap().len(), 4);
        // The bridge keeps running regardless.
        assert!(!h.bridge.is_stopping());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn finish_disables_bound_source_and_tears_down() {
        let mut h = Harness::new();
        h.bind(3).await;
        h.send(BridgeEvent::Shutdown).await;
        h.send(BridgeEvent::Shutdown).await;
        assert!(h.bridge.is_stopping());

        let bus = Arc::clone(&h.bus);
        let recorded = Arc::clone(&h.recorded);
        h.bridge.finish().await;

        let calls = bus.setup_calls.lock().unwrap().clone();
        assert_eq!(calls.last(), Some(&(modem(3), LocationSources::empty(), false)));
        assert_eq!(recorded.lock().unwrap().teardowns, 1);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn run_polls_on_cadence_and_stops_once() {
        let config = BridgeConfig {
            modem: Some(0),
            rescan_interval_secs: 0,
            ..BridgeConfig::default()
        };
        let h = Harness::with_config(config, false);
        h.bus.set_payload(&modem(0), FIX);
        let Harness {
            bridge,
            rx,
            bus,
            recorded,
            ..
        } = h;
        let shutdown = bridge.events.clone();

        let task = tokio::spawn(bridge.run(rx));
        for _ in 0..7 {
            advance(Duration::from_millis(500)).await;
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
        }
        shutdown.send(BridgeEvent::Shutdown).expect("send");
        shutdown.send(BridgeEvent::Shutdown).expect("send");
        task.await.expect("join").expect("run");

        let writes = recorded.lock().unwrap().writes.len();
        assert!((3..=4).contains(&writes), "got {writes} writes");
        assert_eq!(recorded.lock().unwrap().teardowns, 1);
        let disables = bus
            .setup_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sources, _)| sources.is_empty())
            .count();
        assert_eq!(disables, 1);
    }
}
