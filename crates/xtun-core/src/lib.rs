//! xtun - Tunnel extension core
//!
//! Owns the life of a single proxy connection: translates a server
//! descriptor into a proxy-engine configuration, supervises the engine
//! process, relays packets between the virtual interface and the engine,
//! counts traffic, and answers a small control protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Host application                        │
//! └──────────────┬───────────────────────────────▲───────────────┘
//!                │ control socket                │ packets
//!                ▼                               │
//! ┌──────────────────────────────────────────────┴───────────────┐
//! │  ControlServer ──▶ ControlChannel ──▶ TunnelService          │
//! │                                        │                     │
//! │        ┌───────────────┬───────────────┼──────────────┐      │
//! │        ▼               ▼               ▼              ▼      │
//! │  ┌───────────┐  ┌─────────────┐  ┌───────────┐  ┌─────────┐  │
//! │  │Translator │  │  Interface  │  │Supervisor │  │  Relay  │  │
//! │  └───────────┘  └─────────────┘  └─────┬─────┘  └────┬────┘  │
//! │                                        │ spawn       │ SOCKS │
//! └────────────────────────────────────────┼─────────────┼───────┘
//!                                          ▼             ▼
//!                                   ┌────────────────────────┐
//!                                   │   Proxy engine (xray)  │
//!                                   └────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Disconnected → Configuring → Starting → Connected → Reasserting →
//! Disconnecting → Disconnected`, plus `Invalid` for configurations that
//! can never work. See [`lifecycle`].
//!
//! Every collaborator sits behind a trait ([`EngineLauncher`],
//! [`TunnelInterface`], [`PacketFlow`], [`EngineConnector`], [`Storage`]);
//! the [`simulator`] module has in-memory versions of each.

pub mod config;
pub mod control;
pub mod descriptor;
pub mod interface;
pub mod lifecycle;
pub mod relay;
pub mod session;
pub mod simulator;
pub mod socks;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod translator;

pub use config::{ConfigError, CoreConfig};
pub use control::{
    ControlChannel, ControlClient, ControlReply, ControlRequest, ControlServer, IpcError,
    RequestKind, ResponsePayload, StatisticsPayload, StatusPayload, UpdateConfigPayload,
};
pub use descriptor::{
    ConnectionMode, Network, ProtocolKind, ProtocolSettings, Security, ServerDescriptor,
    TransportSettings,
};
pub use interface::{InterfaceError, NetworkSettings, SystemInterface, TunnelInterface};
pub use lifecycle::{
    LifecycleState, ServiceOptions, ServiceParts, StatusEvent, TunnelError, TunnelService,
    TunnelStatus,
};
pub use relay::{
    DatagramPacketFlow, EngineConnector, EngineLink, Packet, PacketFlow, PacketRelay,
    ProtocolFamily, RelayHandle, RelayReport,
};
pub use session::{SessionHistory, SessionRecord, TunnelSession};
pub use socks::{SocksConnector, SocksEngineLink, UdpDatagram};
pub use stats::{StatisticsAggregator, StatisticsSnapshot};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use supervisor::{
    BinaryLauncher, EngineHandle, EngineLauncher, EngineProcess, ProcessError, ProcessSupervisor,
    SupervisorEvent,
};
pub use translator::{
    translate, ConfigurationError, NativeProfile, ProxyConfig, TranslateOptions, Translator,
    TunnelPlan,
};
