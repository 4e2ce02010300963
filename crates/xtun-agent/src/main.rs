//! xtun-agent: tunnel core service
//!
//! Loads the configuration, builds one tunnel service, brings the tunnel up
//! for the stored server selection and serves the control socket until
//! SIGINT or SIGTERM.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xtun_core::simulator::{ChannelPacketFlow, LoopbackConnector, MemoryInterface, SimulatedLauncher};
use xtun_core::storage::CONNECTION_MODE_KEY;
use xtun_core::{
    BinaryLauncher, ControlChannel, ControlServer, CoreConfig, DatagramPacketFlow, EngineConnector,
    EngineLauncher, FileStorage, PacketFlow, ServiceParts, SocksConnector, Storage, SystemInterface,
    Translator, TunnelError, TunnelInterface, TunnelService,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG_PATH: &str = "/etc/xtun/xtun.toml";

fn init_logging(config: &CoreConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.agent_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

fn load_config() -> Result<CoreConfig> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if path.exists() {
        CoreConfig::load(&path).with_context(|| format!("loading {}", path.display()))
    } else if std::env::args_os().nth(1).is_some() {
        anyhow::bail!("config file {} does not exist", path.display())
    } else {
        Ok(CoreConfig::default())
    }
}

/// Collaborators the service runs against
struct Backends {
    launcher: Arc<dyn EngineLauncher>,
    interface: Arc<dyn TunnelInterface>,
    flow: Arc<dyn PacketFlow>,
    connector: Arc<dyn EngineConnector>,
}

async fn backends(config: &CoreConfig) -> Result<Backends> {
    if config.engine.simulate {
        warn!("Engine simulation enabled: no traffic leaves this host");
        let (flow, mut host) = ChannelPacketFlow::new();
        tokio::spawn(async move {
            while let Some(batch) = host.recv().await {
                tracing::debug!("Simulated host received {} packets", batch.len());
            }
        });
        return Ok(Backends {
            launcher: Arc::new(SimulatedLauncher::new()),
            interface: Arc::new(MemoryInterface::new()),
            flow: Arc::new(flow),
            connector: Arc::new(LoopbackConnector::new()),
        });
    }

    let flow = DatagramPacketFlow::connect(config.relay.listen, config.relay.peer)
        .await
        .with_context(|| format!("binding packet flow on {}", config.relay.listen))?;

    Ok(Backends {
        launcher: Arc::new(BinaryLauncher::new(&config.engine.binary, config.engine.args.clone())),
        interface: Arc::new(SystemInterface::new()),
        flow: Arc::new(flow),
        connector: Arc::new(SocksConnector),
    })
}

/// Store the configured mode unless the host already chose one.
async fn seed_mode(storage: &FileStorage, config: &CoreConfig) -> Result<()> {
    if storage.load(CONNECTION_MODE_KEY).await?.is_none() {
        info!("Seeding connection mode {:?}", config.mode);
        storage
            .save(CONNECTION_MODE_KEY, serde_json::to_value(config.mode)?)
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config);

    info!("xtun-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Using mimalloc allocator");

    let storage = Arc::new(FileStorage::new(&config.storage.dir));
    seed_mode(&storage, &config).await?;

    let backends = backends(&config).await?;
    let service = TunnelService::new(ServiceParts {
        translator: Translator::new(config.translate_options()),
        launcher: backends.launcher,
        runtime_dir: config.engine.runtime_dir.clone(),
        engine_stop_timeout: config.engine_stop_timeout(),
        interface: backends.interface,
        flow: backends.flow,
        connector: backends.connector,
        storage,
        options: config.service_options(),
    })
    .await;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.error {
                    Some(e) => error!("Tunnel {} ({:?}): {}", event.state, event.server_name, e),
                    None => info!("Tunnel {} ({:?})", event.state, event.server_name),
                },
                Err(RecvError::Lagged(n)) => warn!("Status stream lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let starting = service.clone();
    tokio::spawn(async move {
        match starting.connect_selected().await {
            Ok(true) => {}
            Ok(false) => info!("No server selected, tunnel stays down"),
            Err(e) => error!("Connecting to the selected server failed: {}", e),
        }
    });

    let channel = ControlChannel::new(service.clone(), config.request_timeout());
    let server = Arc::new(ControlServer::new(
        channel,
        &config.control.socket_path,
        config.control.max_message_size,
    ));
    let serving = Arc::clone(&server);
    let mut control = tokio::spawn(async move { serving.run().await });

    let control_done = tokio::select! {
        result = &mut control => {
            match result {
                Ok(Ok(())) => warn!("Control server stopped"),
                Ok(Err(e)) => error!("Control server failed: {}", e),
                Err(e) => error!("Control server task failed: {}", e),
            }
            true
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            false
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            false
        }
    };

    match service.disconnect().await {
        Ok(()) | Err(TunnelError::NotConnected) => {}
        Err(e) => warn!("Disconnect during shutdown: {}", e),
    }

    server.shutdown();
    if !control_done {
        let _ = control.await;
    }

    info!("xtun-agent stopped");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
