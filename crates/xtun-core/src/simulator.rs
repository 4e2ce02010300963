//! In-memory stand-ins for the engine, the OS interface and the packet path.
//!
//! These let the whole lifecycle run deterministically without an engine
//! binary or root privileges. The agent uses them when `engine.simulate` is
//! set; the test suites use them everywhere.

use crate::interface::{InterfaceError, NetworkSettings, TunnelInterface};
use crate::relay::{EngineConnector, EngineLink, Packet, PacketFlow};
use crate::supervisor::{EngineExit, EngineLauncher, EngineProcess, ProcessError};
use crate::translator::Inbound;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the next launch does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Runs until terminated
    Healthy,
    /// Exits on its own after the delay
    ExitAfter(Duration, Option<i32>),
    /// Launch fails as if the binary were missing
    MissingBinary,
}

type ExitSignal = Arc<watch::Sender<Option<EngineExit>>>;

/// Launcher producing [`SimulatedProcess`]es.
pub struct SimulatedLauncher {
    behavior: Mutex<LaunchBehavior>,
    ignore_terminate: Arc<AtomicBool>,
    launches: AtomicUsize,
    live: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    current: Mutex<Option<ExitSignal>>,
    last_config: Mutex<Option<String>>,
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(LaunchBehavior::Healthy),
            ignore_terminate: Arc::new(AtomicBool::new(false)),
            launches: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
            next_pid: AtomicU32::new(40_000),
            current: Mutex::new(None),
            last_config: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: LaunchBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Make processes ignore graceful termination.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::Relaxed);
    }

    /// Make the most recently launched process exit with `code`.
    pub fn crash_current(&self, code: Option<i32>) {
        if let Some(signal) = lock(&self.current).as_ref() {
            signal.send_if_modified(|exit| {
                if exit.is_none() {
                    *exit = Some(EngineExit { code });
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Number of successful and failed launches
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Processes not yet dropped
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Forced kills
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::Relaxed)
    }

    /// Contents of the config file the last launch was given.
    pub fn last_config(&self) -> Option<String> {
        lock(&self.last_config).clone()
    }
}

impl Default for SimulatedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineLauncher for SimulatedLauncher {
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn EngineProcess>, ProcessError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        let behavior = *lock(&self.behavior);
        if behavior == LaunchBehavior::MissingBinary {
            return Err(ProcessError::BinaryNotFound(PathBuf::from("xray")));
        }

        let contents = std::fs::read_to_string(config_path)?;
        *lock(&self.last_config) = Some(contents);

        let (tx, rx) = watch::channel(None);
        let signal = Arc::new(tx);
        if let LaunchBehavior::ExitAfter(delay, code) = behavior {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                signal.send_replace(Some(EngineExit { code }));
            });
        }
        *lock(&self.current) = Some(Arc::clone(&signal));

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        debug!("Simulated engine {} launched", pid);

        Ok(Box::new(SimulatedProcess {
            pid,
            signal,
            exit: rx,
            ignore_terminate: Arc::clone(&self.ignore_terminate),
            live: Arc::clone(&self.live),
            kills: Arc::clone(&self.kills),
        }))
    }
}

/// Engine process backed by a watch channel.
pub struct SimulatedProcess {
    pid: u32,
    signal: ExitSignal,
    exit: watch::Receiver<Option<EngineExit>>,
    ignore_terminate: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl SimulatedProcess {
    fn exit_with(&self, code: Option<i32>) {
        self.signal.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(EngineExit { code });
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl EngineProcess for SimulatedProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<EngineExit> {
        let exit = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "exit signal dropped"))?;
        Ok(exit.unwrap_or(EngineExit { code: None }))
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if !self.ignore_terminate.load(Ordering::Relaxed) {
            self.exit_with(Some(0));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::Relaxed);
        self.exit_with(None);
        Ok(())
    }
}

impl Drop for SimulatedProcess {
    fn drop(&mut self) {
        self.exit_with(None);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Interface manager that records what it was asked to do.
#[derive(Default)]
pub struct MemoryInterface {
    applied: Mutex<Vec<NetworkSettings>>,
    current: Mutex<Option<NetworkSettings>>,
    reject: Mutex<Option<String>>,
    clears: AtomicUsize,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `apply` fail with `reason`.
    pub fn reject_with(&self, reason: impl Into<String>) {
        *lock(&self.reject) = Some(reason.into());
    }

    pub fn accept(&self) {
        *lock(&self.reject) = None;
    }

    /// Every settings value successfully applied, oldest first.
    pub fn applied(&self) -> Vec<NetworkSettings> {
        lock(&self.applied).clone()
    }

    /// Settings currently in effect.
    pub fn current(&self) -> Option<NetworkSettings> {
        lock(&self.current).clone()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TunnelInterface for MemoryInterface {
    async fn apply(&self, settings: &NetworkSettings) -> Result<(), InterfaceError> {
        settings.validate()?;
        if let Some(reason) = lock(&self.reject).clone() {
            return Err(InterfaceError::SettingsRejected(reason));
        }
        lock(&self.applied).push(settings.clone());
        *lock(&self.current) = Some(settings.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), InterfaceError> {
        self.clears.fetch_add(1, Ordering::Relaxed);
        *lock(&self.current) = None;
        Ok(())
    }
}

/// Tunnel side of a [`ChannelPacketFlow`], held by the test or the host.
pub struct PacketHost {
    to_tunnel: mpsc::Sender<Vec<Packet>>,
    from_tunnel: mpsc::Receiver<Vec<Packet>>,
}

impl PacketHost {
    /// Inject a batch as if the OS had read it from the interface.
    pub async fn send(&self, batch: Vec<Packet>) -> Result<(), mpsc::error::SendError<Vec<Packet>>> {
        self.to_tunnel.send(batch).await
    }

    /// Next batch the relay wrote back.
    pub async fn recv(&mut self) -> Option<Vec<Packet>> {
        self.from_tunnel.recv().await
    }
}

/// Packet flow over in-process channels.
pub struct ChannelPacketFlow {
    incoming: tokio::sync::Mutex<mpsc::Receiver<Vec<Packet>>>,
    outgoing: mpsc::Sender<Vec<Packet>>,
}

impl ChannelPacketFlow {
    pub fn new() -> (Self, PacketHost) {
        let (to_tunnel, incoming) = mpsc::channel(64);
        let (outgoing, from_tunnel) = mpsc::channel(64);
        let flow = Self {
            incoming: tokio::sync::Mutex::new(incoming),
            outgoing,
        };
        (flow, PacketHost { to_tunnel, from_tunnel })
    }
}

#[async_trait]
impl PacketFlow for ChannelPacketFlow {
    async fn read_packets(&self) -> io::Result<Vec<Packet>> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "packet host closed"))
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()> {
        self.outgoing
            .send(packets)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet host closed"))
    }
}

/// Engine link that hands every forwarded packet straight back.
#[derive(Default)]
pub struct LoopbackEngineLink {
    queue: Mutex<VecDeque<Packet>>,
    fail_forwards: AtomicUsize,
}

impl LoopbackEngineLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` forwards.
    pub fn fail_next_forwards(&self, count: usize) {
        self.fail_forwards.store(count, Ordering::Relaxed);
    }
}

#[async_trait]
impl EngineLink for LoopbackEngineLink {
    async fn forward(&self, packets: &[Packet]) -> io::Result<()> {
        let failing = self
            .fail_forwards
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "injected failure"));
        }
        lock(&self.queue).extend(packets.iter().cloned());
        Ok(())
    }

    async fn receive(&self) -> io::Result<Vec<Packet>> {
        Ok(lock(&self.queue).drain(..).collect())
    }
}

/// Connector that always hands out the same loopback link.
#[derive(Default)]
pub struct LoopbackConnector {
    link: Arc<LoopbackEngineLink>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> Arc<LoopbackEngineLink> {
        Arc::clone(&self.link)
    }

    /// Refuse following connects.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EngineConnector for LoopbackConnector {
    async fn connect(&self, inbound: &Inbound) -> io::Result<Arc<dyn EngineLink>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if self.refuse.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", inbound.address()),
            ));
        }
        Ok(self.link.clone())
    }
}
