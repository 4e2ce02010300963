//! Tunnel Lifecycle
//!
//! [`TunnelService`] coordinates translator, interface, supervisor, relay and
//! statistics into one connect / disconnect / reconfigure protocol.
//!
//! ```text
//! Disconnected ──connect──► Configuring ──► Starting ──engine live──► Connected
//!   ▲    ▲                      │              │                      │  │  │
//!   │    └──transient error─────┴──────────────┘                      │  │  │
//!   │                                                                 │  │  │
//!   ├──────────────────────── unexpected engine exit ─────────────────┘  │  │
//!   │                                                                    │  │
//!   └──────────── Disconnecting ◄──────────── disconnect ────────────────┘  │
//!                                                                           │
//!              Reasserting ◄─────────────── updateConfig ───────────────────┘
//!                   └──────────────► Connected (or Disconnected / Invalid)
//!
//! Fundamental errors (unsupported protocol, malformed descriptor, missing
//! engine binary) park the machine in Invalid until the next connect.
//! ```
//!
//! Every multi-step operation holds the runtime lock for its whole duration,
//! so `connect`, `disconnect`, `update_config` and the reaction to an engine
//! crash never interleave. `disconnect` can still cut a pending `connect` or
//! `update_config` short through the abort signal.

use crate::descriptor::ServerDescriptor;
use crate::interface::{InterfaceError, NetworkSettings, TunnelInterface};
use crate::relay::{EngineConnector, EngineLink, PacketFlow, PacketRelay, RelayHandle};
use crate::session::{SessionHistory, TunnelSession};
use crate::stats::{StatisticsAggregator, StatisticsSnapshot};
use crate::storage::{self, Storage, StorageError, SELECTED_SERVER_KEY, SESSION_HISTORY_KEY};
use crate::supervisor::{
    EngineHandle, EngineLauncher, ProcessError, ProcessSupervisor, SupervisorEvent,
};
use crate::translator::{ConfigurationError, ProxyConfig, Translator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Disconnected,
    Configuring,
    Starting,
    Connected,
    Reasserting,
    Disconnecting,
    /// Unrecoverable configuration; left only by a new `connect`
    Invalid,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Configuring => "configuring",
            LifecycleState::Starting => "starting",
            LifecycleState::Connected => "connected",
            LifecycleState::Reasserting => "reasserting",
            LifecycleState::Disconnecting => "disconnecting",
            LifecycleState::Invalid => "invalid",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LifecycleState::Connected)
    }

    /// A connect or reconfigure is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            LifecycleState::Configuring | LifecycleState::Starting | LifecycleState::Reasserting
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Disconnected | Invalid, Configuring)
                | (Configuring, Starting | Disconnected | Invalid)
                | (Starting, Connected | Disconnected | Invalid)
                | (Connected, Reasserting | Disconnecting | Disconnected)
                | (Reasserting, Connected | Disconnected | Invalid)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Aborted by disconnect")]
    Aborted,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Engine link failed: {0}")]
    Link(String),
}

impl TunnelError {
    /// Errors that park the lifecycle in `Invalid`.
    pub fn is_fundamental(&self) -> bool {
        match self {
            TunnelError::Configuration(e) => e.is_fundamental(),
            TunnelError::Process(ProcessError::BinaryNotFound(_)) => true,
            _ => false,
        }
    }

    fn failure_state(&self) -> LifecycleState {
        if self.is_fundamental() {
            LifecycleState::Invalid
        } else {
            LifecycleState::Disconnected
        }
    }
}

/// One entry of the status stream
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub state: LifecycleState,
    pub server_name: Option<String>,
    pub error: Option<TunnelError>,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelStatus {
    pub state: LifecycleState,
    pub server_name: Option<String>,
    pub connected_time: Option<Duration>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Knobs of the service itself
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Interface settings; the server exclusion is added per connect
    pub network: NetworkSettings,
    /// Bound on waiting for the relay to finish its batch
    pub relay_stop_timeout: Duration,
    /// Statistics publish period while connected
    pub stats_interval: Duration,
    /// Measure TCP connect time to the server after connecting
    pub latency_probe: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            network: NetworkSettings::new(
                "xtun0",
                std::net::IpAddr::V4(std::net::Ipv4Addr::new(198, 18, 0, 1)),
                16,
            ),
            relay_stop_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(1),
            latency_probe: false,
        }
    }
}

/// Everything the service is built from.
pub struct ServiceParts {
    pub translator: Translator,
    pub launcher: Arc<dyn EngineLauncher>,
    /// Where scoped engine configs are written
    pub runtime_dir: PathBuf,
    pub engine_stop_timeout: Duration,
    pub interface: Arc<dyn TunnelInterface>,
    pub flow: Arc<dyn PacketFlow>,
    pub connector: Arc<dyn EngineConnector>,
    pub storage: Arc<dyn Storage>,
    pub options: ServiceOptions,
}

/// Resources of the current connection
#[derive(Default)]
struct Runtime {
    descriptor: Option<ServerDescriptor>,
    settings: Option<NetworkSettings>,
    engine: Option<EngineHandle>,
    relay: Option<RelayHandle>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    translator: Translator,
    supervisor: ProcessSupervisor,
    interface: Arc<dyn TunnelInterface>,
    flow: Arc<dyn PacketFlow>,
    connector: Arc<dyn EngineConnector>,
    storage: Arc<dyn Storage>,
    stats: Arc<StatisticsAggregator>,
    options: ServiceOptions,
    state: watch::Sender<LifecycleState>,
    status: broadcast::Sender<StatusEvent>,
    abort: watch::Sender<bool>,
    runtime: Mutex<Runtime>,
    session: RwLock<Option<TunnelSession>>,
}

/// The tunnel core. Cheap to clone; all clones drive the same tunnel.
#[derive(Clone)]
pub struct TunnelService {
    inner: Arc<Inner>,
}

impl TunnelService {
    /// Build the service, load session history and start watching the engine.
    pub async fn new(parts: ServiceParts) -> Self {
        let (supervisor, events) = ProcessSupervisor::new(
            parts.launcher,
            parts.runtime_dir,
            parts.engine_stop_timeout,
        );
        let history = storage::load_history(parts.storage.as_ref()).await;
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        let (status, _) = broadcast::channel(64);
        let (abort, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            translator: parts.translator,
            supervisor,
            interface: parts.interface,
            flow: parts.flow,
            connector: parts.connector,
            storage: parts.storage,
            stats: Arc::new(StatisticsAggregator::with_history(history)),
            options: parts.options,
            state,
            status,
            abort,
            runtime: Mutex::new(Runtime::default()),
            session: RwLock::new(None),
        });

        tokio::spawn(watch_engine(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Follow the state.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Every transition, with the error that caused it if any.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    pub fn stats(&self) -> &Arc<StatisticsAggregator> {
        &self.inner.stats
    }

    pub fn history(&self) -> SessionHistory {
        self.inner.stats.history()
    }

    fn server_name(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.server_name.clone())
    }

    /// Time since the current session began.
    pub fn connected_time(&self) -> Option<Duration> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(TunnelSession::elapsed)
    }

    /// State, server and counters. Never waits on a transition.
    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            state: self.state(),
            server_name: self.server_name(),
            connected_time: self.connected_time(),
            bytes_received: self.inner.stats.bytes_received(),
            bytes_sent: self.inner.stats.bytes_sent(),
        }
    }

    /// Statistics snapshot.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    fn transition(&self, next: LifecycleState, error: Option<TunnelError>) {
        let previous = self.inner.state.send_replace(next);
        if !previous.can_transition_to(next) {
            warn!("Unexpected transition {} -> {}", previous, next);
        }

        match &error {
            Some(e) => warn!("{} -> {} ({})", previous, next, e),
            None => info!("{} -> {}", previous, next),
        }

        let _ = self.inner.status.send(StatusEvent {
            state: next,
            server_name: self.server_name(),
            error,
        });
    }

    fn fail(&self, error: &TunnelError) {
        self.transition(error.failure_state(), Some(error.clone()));
    }

    /// Run `fut` unless a concurrent `disconnect` asks to abort.
    async fn abortable<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> Result<T, TunnelError>
    where
        E: Into<TunnelError>,
    {
        let mut abort = self.inner.abort.subscribe();
        tokio::select! {
            biased;
            _ = abort.wait_for(|aborted| *aborted) => Err(TunnelError::Aborted),
            result = fut => result.map_err(Into::into),
        }
    }

    /// Connect to `descriptor`.
    pub async fn connect(&self, descriptor: ServerDescriptor) -> Result<(), TunnelError> {
        let state = self.state();
        if state.is_connected() || state.is_connecting() {
            return Err(TunnelError::AlreadyConnected);
        }

        let mut rt = self.inner.runtime.lock().await;
        if !matches!(
            self.state(),
            LifecycleState::Disconnected | LifecycleState::Invalid
        ) {
            return Err(TunnelError::AlreadyConnected);
        }

        info!(
            "Connecting to {} ({}, {})",
            descriptor.display_name(),
            descriptor.kind(),
            descriptor.endpoint()
        );
        self.transition(LifecycleState::Configuring, None);

        let config = match self.abortable(self.configure(&descriptor)).await {
            Ok(config) => config,
            Err(e) => {
                error!("Configuring {} failed: {}", descriptor.display_name(), e);
                self.fail(&e);
                return Err(e);
            }
        };

        self.transition(LifecycleState::Starting, None);
        if let Err(e) = self.bring_up(&mut rt, &descriptor, &config).await {
            error!("Starting {} failed: {}", descriptor.display_name(), e);
            self.teardown(&mut rt).await;
            self.fail(&e);
            return Err(e);
        }

        rt.descriptor = Some(descriptor);
        self.transition(LifecycleState::Connected, None);
        Ok(())
    }

    /// Connect to the server stored as selected.
    ///
    /// `Ok(false)` without touching the tunnel when there is no usable selection.
    pub async fn connect_selected(&self) -> Result<bool, TunnelError> {
        let Some(descriptor) = storage::load_selected_server(self.inner.storage.as_ref()).await? else {
            info!("No stored server selection, staying disconnected");
            return Ok(false);
        };
        self.connect(descriptor).await?;
        Ok(true)
    }

    /// Disconnect, or cut a pending connect or reconfigure short.
    ///
    /// Only `disconnect` raises and clears the abort signal, and it clears it
    /// once it holds the runtime, after every abortable step has returned.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let state = self.state();
        if matches!(state, LifecycleState::Disconnected | LifecycleState::Invalid) {
            return Err(TunnelError::NotConnected);
        }

        // A held runtime means an operation may not have announced itself yet
        let aborting = state.is_connecting() || self.inner.runtime.try_lock().is_err();
        if aborting {
            info!("Aborting pending operation ({})", state);
            self.inner.abort.send_replace(true);
        }

        let mut rt = self.inner.runtime.lock().await;
        self.inner.abort.send_replace(false);
        match self.state() {
            LifecycleState::Connected => {
                self.transition(LifecycleState::Disconnecting, None);
                self.teardown(&mut rt).await;
                self.end_session().await;
                rt.descriptor = None;
                self.transition(LifecycleState::Disconnected, None);
                Ok(())
            }
            // The aborted operation already cleaned up after itself
            LifecycleState::Disconnected | LifecycleState::Invalid if aborting => Ok(()),
            _ => Err(TunnelError::NotConnected),
        }
    }

    /// Swap the running engine for one serving `descriptor`.
    ///
    /// Traffic stops for the duration of the swap.
    pub async fn update_config(&self, descriptor: ServerDescriptor) -> Result<(), TunnelError> {
        if !self.state().is_connected() {
            return Err(TunnelError::NotConnected);
        }

        let mut rt = self.inner.runtime.lock().await;
        if !self.state().is_connected() {
            return Err(TunnelError::NotConnected);
        }

        info!(
            "Reconfiguring for {} ({})",
            descriptor.display_name(),
            descriptor.kind()
        );
        self.transition(LifecycleState::Reasserting, None);

        self.stop_data_path(&mut rt).await;
        self.end_session().await;

        if let Err(e) = self.reassert(&mut rt, &descriptor).await {
            error!("Reconfiguring for {} failed: {}", descriptor.display_name(), e);
            self.teardown(&mut rt).await;
            rt.descriptor = None;
            self.fail(&e);
            return Err(e);
        }

        rt.descriptor = Some(descriptor);
        self.transition(LifecycleState::Connected, None);
        Ok(())
    }

    /// Translate with the stored connection mode and remember the server.
    async fn configure(&self, descriptor: &ServerDescriptor) -> Result<ProxyConfig, TunnelError> {
        let mode = storage::load_mode(self.inner.storage.as_ref()).await;
        let config = self
            .inner
            .translator
            .with_mode(mode)
            .translate(descriptor)?
            .into_engine()?;

        self.inner
            .storage
            .save(SELECTED_SERVER_KEY, Value::String(descriptor.id.clone()))
            .await?;
        debug!("Configured {} in {:?} mode", descriptor.display_name(), mode);
        Ok(config)
    }

    async fn apply_settings(&self, rt: &mut Runtime, settings: NetworkSettings) -> Result<(), TunnelError> {
        // Recorded first so teardown clears a half-applied interface too
        rt.settings = Some(settings.clone());
        self.abortable(self.inner.interface.apply(&settings)).await
    }

    /// Interface, engine, link and session.
    async fn bring_up(
        &self,
        rt: &mut Runtime,
        descriptor: &ServerDescriptor,
        config: &ProxyConfig,
    ) -> Result<(), TunnelError> {
        let settings = self.inner.options.network.for_server(descriptor);
        self.apply_settings(rt, settings).await?;
        self.start_engine(rt, descriptor, config).await
    }

    async fn reassert(&self, rt: &mut Runtime, descriptor: &ServerDescriptor) -> Result<(), TunnelError> {
        let config = self.abortable(self.configure(descriptor)).await?;

        let settings = self.inner.options.network.for_server(descriptor);
        if rt.settings.as_ref() != Some(&settings) {
            if rt.settings.take().is_some() {
                if let Err(e) = self.inner.interface.clear().await {
                    warn!("Clearing previous interface settings failed: {}", e);
                }
            }
            self.apply_settings(rt, settings).await?;
        } else {
            debug!("Network settings unchanged, keeping interface");
        }

        self.start_engine(rt, descriptor, &config).await
    }

    async fn start_engine(
        &self,
        rt: &mut Runtime,
        descriptor: &ServerDescriptor,
        config: &ProxyConfig,
    ) -> Result<(), TunnelError> {
        let handle = self.abortable(self.inner.supervisor.start(config)).await?;
        rt.engine = Some(handle);

        let inbound = config
            .relay_inbound()
            .cloned()
            .ok_or_else(|| TunnelError::Link("engine config has no relay inbound".to_string()))?;
        let link = self
            .abortable(async {
                self.inner
                    .connector
                    .connect(&inbound)
                    .await
                    .map_err(|e| TunnelError::Link(format!("{}: {}", inbound.address(), e)))
            })
            .await?;

        self.begin_session(rt, descriptor, link);
        Ok(())
    }

    /// Reset counters and start the relay and its helper tasks.
    fn begin_session(&self, rt: &mut Runtime, descriptor: &ServerDescriptor, link: Arc<dyn EngineLink>) {
        let stats = &self.inner.stats;
        stats.reset();

        let session = TunnelSession::begin(descriptor.display_name());
        info!("Session {} started for {}", session.id, session.server_name);
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session);

        let relay = PacketRelay::new(self.inner.flow.clone(), link, stats.clone()).spawn();
        rt.tasks.push(spawn_relay_watch(Arc::downgrade(&self.inner), relay.closed()));
        rt.relay = Some(relay);
        rt.tasks.push(spawn_stats_ticker(stats.clone(), self.inner.options.stats_interval));
        if self.inner.options.latency_probe {
            rt.tasks.push(spawn_latency_probe(descriptor.endpoint(), stats.clone()));
        }
    }

    /// Stop relay, background tasks and engine; the interface stays.
    async fn stop_data_path(&self, rt: &mut Runtime) {
        for task in rt.tasks.drain(..) {
            task.abort();
        }
        if let Some(relay) = rt.relay.take() {
            if let Some(report) = relay.stop(self.inner.options.relay_stop_timeout).await {
                debug!("Relay report: {:?}", report);
            }
        }
        if let Some(mut engine) = rt.engine.take() {
            self.inner.supervisor.stop(&mut engine).await;
        }
    }

    /// Release everything the connection holds.
    async fn teardown(&self, rt: &mut Runtime) {
        self.stop_data_path(rt).await;
        if rt.settings.take().is_some() {
            if let Err(e) = self.inner.interface.clear().await {
                warn!("Clearing interface failed: {}", e);
            }
        }
    }

    /// Finalize the running session and persist history.
    async fn end_session(&self) {
        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(session) = session else {
            return;
        };

        let record = self.inner.stats.finalize(&session);
        info!(
            "Session {} ended after {:.1}s ({} bytes in, {} bytes out)",
            record.id, record.duration, record.bytes_received, record.bytes_sent
        );

        match serde_json::to_value(self.inner.stats.history()) {
            Ok(value) => {
                if let Err(e) = self.inner.storage.save(SESSION_HISTORY_KEY, value).await {
                    warn!("Could not persist session history: {}", e);
                }
            }
            Err(e) => warn!("Could not serialize session history: {}", e),
        }
    }

    async fn on_engine_event(&self, event: SupervisorEvent) {
        let SupervisorEvent::UnexpectedExit { handle, error } = event;

        let mut rt = self.inner.runtime.lock().await;
        let current = rt.engine.as_ref().map(EngineHandle::id);
        if current != Some(handle) || !self.state().is_connected() {
            debug!("Ignoring exit of engine {} ({:?})", handle, error);
            return;
        }

        let server = rt
            .descriptor
            .as_ref()
            .map(ServerDescriptor::display_name)
            .unwrap_or_default();
        error!("Engine for {} died: {}", server, error);

        self.teardown(&mut rt).await;
        self.end_session().await;
        rt.descriptor = None;
        self.transition(LifecycleState::Disconnected, Some(TunnelError::Process(error)));
    }
}

async fn watch_engine(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        TunnelService { inner }.on_engine_event(event).await;
    }
}

/// Report a relay that ended because the tunnel interface went away.
fn spawn_relay_watch(inner: Weak<Inner>, mut closed: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if closed.wait_for(|closed| *closed).await.is_err() {
            return;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let service = TunnelService { inner };
        let error = TunnelError::Link("tunnel interface closed".to_string());
        let state = service.state();
        warn!("Data path lost while {}: {}", state, error);
        let _ = service.inner.status.send(StatusEvent {
            state,
            server_name: service.server_name(),
            error: Some(error),
        });
    })
}

fn spawn_stats_ticker(stats: Arc<StatisticsAggregator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats.snapshot();
        }
    })
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

fn spawn_latency_probe(endpoint: String, stats: Arc<StatisticsAggregator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint.as_str())).await {
            Ok(Ok(_)) => {
                let latency = started.elapsed();
                debug!("Latency to {}: {:?}", endpoint, latency);
                stats.set_latency(Some(latency));
            }
            Ok(Err(e)) => debug!("Latency probe to {} failed: {}", endpoint, e),
            Err(_) => debug!("Latency probe to {} timed out", endpoint),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ProtocolSettings;
    use crate::relay::{Packet, ProtocolFamily};
    use crate::simulator::{
        ChannelPacketFlow, LaunchBehavior, LoopbackConnector, MemoryInterface, PacketHost,
        SimulatedLauncher,
    };
    use crate::storage::{MemoryStorage, SESSION_HISTORY_KEY};
    use serde_json::json;
    use tempfile::TempDir;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    struct Harness {
        service: TunnelService,
        launcher: Arc<SimulatedLauncher>,
        iface: Arc<MemoryInterface>,
        connector: Arc<LoopbackConnector>,
        storage: Arc<MemoryStorage>,
        host: PacketHost,
        dir: TempDir,
    }

    impl Harness {
        fn config_files(&self) -> usize {
            std::fs::read_dir(self.dir.path()).unwrap().count()
        }
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(SimulatedLauncher::new());
        let iface = Arc::new(MemoryInterface::new());
        let connector = Arc::new(LoopbackConnector::new());
        let storage = Arc::new(MemoryStorage::new());
        let (flow, host) = ChannelPacketFlow::new();

        let service = TunnelService::new(ServiceParts {
            translator: Translator::default(),
            launcher: launcher.clone(),
            runtime_dir: dir.path().to_path_buf(),
            engine_stop_timeout: Duration::from_secs(3),
            interface: iface.clone(),
            flow: Arc::new(flow),
            connector: connector.clone(),
            storage: storage.clone(),
            options: ServiceOptions::default(),
        })
        .await;

        Harness {
            service,
            launcher,
            iface,
            connector,
            storage,
            host,
            dir,
        }
    }

    fn shadowsocks() -> ServerDescriptor {
        ServerDescriptor::new(
            "Frankfurt",
            "ss.example.com",
            8388,
            ProtocolSettings::Shadowsocks {
                password: Some("pw".into()),
                method: Some("chacha20-ietf-poly1305".into()),
            },
        )
    }

    fn vless(address: &str) -> ServerDescriptor {
        ServerDescriptor::new("Tokyo", address, 443, ProtocolSettings::vless(UUID))
    }

    fn states(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<LifecycleState> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.state);
        }
        seen
    }

    async fn pump_traffic(h: &mut Harness) {
        let batch = vec![
            Packet::new(ProtocolFamily::V4, vec![0x45; 40]),
            Packet::new(ProtocolFamily::V6, vec![0x60; 60]),
        ];
        h.host.send(batch.clone()).await.unwrap();
        assert_eq!(h.host.recv().await.unwrap(), batch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_shadowsocks() {
        let h = harness().await;
        let mut events = h.service.subscribe();
        let descriptor = shadowsocks();
        let id = descriptor.id.clone();

        h.service.connect(descriptor).await.unwrap();
        assert_eq!(h.service.state(), LifecycleState::Connected);
        assert_eq!(
            states(&mut events),
            vec![
                LifecycleState::Configuring,
                LifecycleState::Starting,
                LifecycleState::Connected
            ]
        );

        let written: Value = serde_json::from_str(&h.launcher.last_config().unwrap()).unwrap();
        let outbound = &written["outbounds"][0];
        assert_eq!(outbound["protocol"], json!("shadowsocks"));
        let server = &outbound["settings"]["servers"][0];
        assert_eq!(server["address"], json!("ss.example.com"));
        assert_eq!(server["port"], json!(8388));
        assert_eq!(server["password"], json!("pw"));
        assert_eq!(server["method"], json!("chacha20-ietf-poly1305"));

        let status = h.service.status();
        assert_eq!(status.server_name.as_deref(), Some("Frankfurt"));
        assert!(status.connected_time.is_some());
        assert_eq!(h.config_files(), 1);
        assert_eq!(h.connector.connect_count(), 1);
        assert_eq!(h.storage.get(SELECTED_SERVER_KEY), Some(json!(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_identifier_stays_disconnected() {
        let h = harness().await;
        let mut events = h.service.subscribe();
        let descriptor = ServerDescriptor::new(
            "v",
            "v.example.com",
            443,
            ProtocolSettings::Vless {
                identifier: None,
                encryption: None,
                flow: None,
            },
        );

        let err = h.service.connect(descriptor).await.unwrap_err();
        assert_eq!(
            err,
            TunnelError::Configuration(ConfigurationError::MissingField("identifier"))
        );
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(
            states(&mut events),
            vec![LifecycleState::Configuring, LifecycleState::Disconnected]
        );
        assert_eq!(h.launcher.launch_count(), 0);
        assert!(h.iface.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_crash_disconnects() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();
        let mut events = h.service.subscribe();

        tokio::time::advance(Duration::from_secs(30)).await;
        h.launcher.crash_current(Some(2));

        let event = loop {
            let event = events.recv().await.unwrap();
            if event.state == LifecycleState::Disconnected {
                break event;
            }
        };
        assert_eq!(
            event.error,
            Some(TunnelError::Process(ProcessError::UnexpectedExit(Some(2))))
        );
        assert_eq!(h.service.state(), LifecycleState::Disconnected);

        let history = h.service.history();
        assert_eq!(history.len(), 1);
        assert!(history.latest().unwrap().duration > 0.0);
        assert!(h.storage.get(SESSION_HISTORY_KEY).is_some());

        assert_eq!(h.config_files(), 0);
        assert_eq!(h.launcher.live_count(), 0);
        assert!(h.iface.current().is_none());
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_resets_counters() {
        let mut h = harness().await;
        h.service.connect(vless("a.example.com")).await.unwrap();
        pump_traffic(&mut h).await;
        assert!(h.service.snapshot().bytes_sent > 0);

        let first_session = h.service.status();
        let mut events = h.service.subscribe();
        h.service.update_config(vless("b.example.com")).await.unwrap();

        assert_eq!(
            states(&mut events),
            vec![LifecycleState::Reasserting, LifecycleState::Connected]
        );
        let snap = h.service.snapshot();
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.bytes_received, 0);
        assert_eq!(snap.packets_sent, 0);

        // Old session closed with its traffic
        let history = h.service.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().bytes_sent, first_session.bytes_sent);

        // Hostname servers share network settings: no re-apply
        assert_eq!(h.iface.applied().len(), 1);
        assert_eq!(h.launcher.launch_count(), 2);
        assert_eq!(h.launcher.live_count(), 1);
        assert_eq!(h.config_files(), 1);

        // Traffic flows again
        pump_traffic(&mut h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_reapplies_changed_settings() {
        let h = harness().await;
        h.service.connect(vless("203.0.113.1")).await.unwrap();
        h.service.update_config(vless("203.0.113.2")).await.unwrap();

        let applied = h.iface.applied();
        assert_eq!(applied.len(), 2);
        assert!(applied[1]
            .excluded_routes()
            .contains(&"203.0.113.2/32".parse().unwrap()));
        assert_eq!(h.iface.clear_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_disconnected() {
        let h = harness().await;
        let mut events = h.service.subscribe();

        assert_eq!(h.service.disconnect().await, Err(TunnelError::NotConnected));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert!(states(&mut events).is_empty());
        assert!(h.service.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cleans_up() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();
        let mut events = h.service.subscribe();

        h.service.disconnect().await.unwrap();
        assert_eq!(
            states(&mut events),
            vec![LifecycleState::Disconnecting, LifecycleState::Disconnected]
        );
        assert_eq!(h.config_files(), 0);
        assert_eq!(h.launcher.live_count(), 0);
        assert_eq!(h.iface.clear_count(), 1);
        assert_eq!(h.service.history().len(), 1);
        assert!(h.service.status().connected_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_rejected() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();
        let mut events = h.service.subscribe();

        assert_eq!(
            h.service.connect(shadowsocks()).await,
            Err(TunnelError::AlreadyConnected)
        );
        assert!(states(&mut events).is_empty());
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wireguard_goes_invalid_and_recovers() {
        let h = harness().await;
        let wireguard = ServerDescriptor::new(
            "wg",
            "wg.example.com",
            51820,
            ProtocolSettings::WireGuard {
                private_key: Some("k".into()),
                peer_public_key: Some("p".into()),
            },
        );

        let err = h.service.connect(wireguard).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Configuration(ConfigurationError::NotImplemented(_))
        ));
        assert_eq!(h.service.state(), LifecycleState::Invalid);
        assert_eq!(h.service.disconnect().await, Err(TunnelError::NotConnected));

        h.service.connect(shadowsocks()).await.unwrap();
        assert_eq!(h.service.state(), LifecycleState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ikev2_is_not_engine_hosted() {
        let h = harness().await;
        let ikev2 = ServerDescriptor::new(
            "ike",
            "vpn.example.com",
            500,
            ProtocolSettings::Ikev2 {
                username: Some("me".into()),
                password: Some("secret".into()),
                remote_id: None,
            },
        );

        let err = h.service.connect(ikev2).await.unwrap_err();
        assert!(err.is_fundamental());
        assert_eq!(h.service.state(), LifecycleState::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_rejection_never_starts_engine() {
        let h = harness().await;
        h.iface.reject_with("operation not permitted");

        let err = h.service.connect(shadowsocks()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Interface(_)));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(h.launcher.launch_count(), 0);
        assert_eq!(h.config_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_binary_is_invalid() {
        let h = harness().await;
        h.launcher.set_behavior(LaunchBehavior::MissingBinary);

        let err = h.service.connect(shadowsocks()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Process(ProcessError::BinaryNotFound(_))
        ));
        assert_eq!(h.service.state(), LifecycleState::Invalid);
        assert!(h.iface.current().is_none());
        assert_eq!(h.config_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_failure_cleans_up() {
        let h = harness().await;
        h.launcher
            .set_behavior(LaunchBehavior::ExitAfter(Duration::from_millis(100), Some(1)));

        let err = h.service.connect(shadowsocks()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Process(ProcessError::StartupFailed(_))));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert!(h.iface.current().is_none());
        assert_eq!(h.config_files(), 0);
        assert!(h.service.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_is_transient() {
        let h = harness().await;
        h.storage.fail_writes(true);

        let err = h.service.connect(shadowsocks()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Storage(_)));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);

        h.storage.fail_writes(false);
        h.service.connect(shadowsocks()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_stops_engine() {
        let h = harness().await;
        h.connector.refuse(true);

        let err = h.service.connect(shadowsocks()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Link(_)));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(h.launcher.live_count(), 0);
        assert_eq!(h.config_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_pending_connect() {
        let h = harness().await;
        let mut state = h.service.watch_state();

        let service = h.service.clone();
        let connect = tokio::spawn(async move { service.connect(shadowsocks()).await });

        state
            .wait_for(|s| *s == LifecycleState::Starting)
            .await
            .unwrap();
        h.service.disconnect().await.unwrap();

        assert_eq!(connect.await.unwrap(), Err(TunnelError::Aborted));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(h.launcher.live_count(), 0);
        assert_eq!(h.config_files(), 0);
        assert!(h.iface.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_pending_update_config() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();
        let mut state = h.service.watch_state();

        let service = h.service.clone();
        let update = tokio::spawn(async move { service.update_config(vless("v.example.com")).await });

        state
            .wait_for(|s| *s == LifecycleState::Reasserting)
            .await
            .unwrap();
        h.service.disconnect().await.unwrap();

        assert_eq!(update.await.unwrap(), Err(TunnelError::Aborted));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(h.launcher.live_count(), 0);
        assert_eq!(h.config_files(), 0);
        assert!(h.iface.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_update_holding_runtime() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();

        // Update queued on the runtime but not yet Reasserting
        let held = h.service.inner.runtime.lock().await;
        let service = h.service.clone();
        let update = tokio::spawn(async move { service.update_config(vless("v.example.com")).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.service.state(), LifecycleState::Connected);

        let service = h.service.clone();
        let disconnect = tokio::spawn(async move { service.disconnect().await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(*h.service.inner.abort.borrow());
        drop(held);

        assert_eq!(update.await.unwrap(), Err(TunnelError::Aborted));
        assert_eq!(disconnect.await.unwrap(), Ok(()));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert!(!*h.service.inner.abort.borrow());
        assert_eq!(h.launcher.live_count(), 0);

        h.service.connect(shadowsocks()).await.unwrap();
        assert_eq!(h.service.state(), LifecycleState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_closure_reported() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();
        let mut events = h.service.subscribe();

        drop(h.host);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, LifecycleState::Connected);
        assert_eq!(event.server_name.as_deref(), Some("Frankfurt"));
        assert_eq!(
            event.error,
            Some(TunnelError::Link("tunnel interface closed".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_selected_server() {
        let h = harness().await;
        assert_eq!(h.service.connect_selected().await, Ok(false));
        assert_eq!(h.service.state(), LifecycleState::Disconnected);

        let servers = vec![shadowsocks(), vless("v.example.com")];
        h.storage.save_servers(&servers).await.unwrap();
        h.storage
            .save(SELECTED_SERVER_KEY, json!(servers[1].id))
            .await
            .unwrap();

        assert_eq!(h.service.connect_selected().await, Ok(true));
        assert_eq!(h.service.state(), LifecycleState::Connected);
        assert_eq!(h.service.status().server_name.as_deref(), Some("Tokyo"));
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_requires_connection() {
        let h = harness().await;
        assert_eq!(
            h.service.update_config(shadowsocks()).await,
            Err(TunnelError::NotConnected)
        );
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_failure_disconnects() {
        let h = harness().await;
        h.service.connect(shadowsocks()).await.unwrap();

        let broken = ServerDescriptor::new("x", "x.example.com", 443, ProtocolSettings::trojan(""));
        let err = h.service.update_config(broken).await.unwrap_err();
        assert_eq!(
            err,
            TunnelError::Configuration(ConfigurationError::MissingField("password"))
        );
        assert_eq!(h.service.state(), LifecycleState::Disconnected);
        assert_eq!(h.launcher.live_count(), 0);
        assert!(h.iface.current().is_none());
        assert_eq!(h.service.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_published_while_connected() {
        let h = harness().await;
        let mut updates = h.service.stats().subscribe();
        h.service.connect(shadowsocks()).await.unwrap();

        tokio::time::advance(Duration::from_millis(1100)).await;
        let snap = updates.recv().await.unwrap();
        assert_eq!(snap.bytes_sent, 0);
    }

    #[test]
    fn test_transition_table() {
        use LifecycleState::*;
        assert!(Disconnected.can_transition_to(Configuring));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Starting));
        assert!(!Configuring.can_transition_to(Connected));
        assert!(Starting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reasserting));
        assert!(Reasserting.can_transition_to(Connected));
        assert!(Invalid.can_transition_to(Configuring));
        assert!(!Invalid.can_transition_to(Disconnected));
        assert!(!Disconnecting.can_transition_to(Connected));
    }
}
