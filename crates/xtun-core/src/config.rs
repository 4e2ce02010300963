//! Core configuration
//!
//! Loaded once at startup from TOML or JSON. Every field has a default, so an
//! empty file is a valid configuration.

use crate::control::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REQUEST_TIMEOUT};
use crate::descriptor::ConnectionMode;
use crate::interface::NetworkSettings;
use crate::lifecycle::ServiceOptions;
use crate::translator::TranslateOptions;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown config format {0:?} (expected .toml or .json)")]
    UnknownFormat(PathBuf),
}

/// Proxy engine binary and its scratch space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub binary: PathBuf,
    /// Arguments before the config path
    pub args: Vec<String>,
    pub runtime_dir: PathBuf,
    pub stop_timeout_ms: u64,
    /// Run against the in-memory simulator instead of a real engine
    pub simulate: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xray"),
            args: vec!["run".to_string(), "-c".to_string()],
            runtime_dir: std::env::temp_dir(),
            stop_timeout_ms: 3000,
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Engine log level
    pub level: String,
    /// Agent filter when `RUST_LOG` is unset
    pub agent_level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "warning".to_string(),
            agent_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    pub servers: Vec<String>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

/// Engine-side listener the relay talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundSection {
    pub listen: String,
    pub port: u16,
}

impl Default for InboundSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 10808,
        }
    }
}

/// Host side of the packet flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Local address the relay reads packets on
    pub listen: SocketAddr,
    /// Where packets for the host are sent
    pub peer: SocketAddr,
    pub stop_timeout_ms: u64,
    pub stats_interval_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10809),
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10810),
            stop_timeout_ms: 2000,
            stats_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSection {
    pub name: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub mtu: u32,
    pub dns: Vec<IpAddr>,
    pub extra_excluded_routes: Vec<IpNet>,
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            name: "xtun0".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1)),
            prefix_len: 16,
            mtu: 1500,
            dns: vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            extra_excluded_routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub socket_path: PathBuf,
    pub request_timeout_ms: u64,
    pub max_message_size: usize,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("xtun").join("control.sock"),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("xtun").join("state"),
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub engine: EngineSection,
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbound: InboundSection,
    pub relay: RelaySection,
    pub interface: InterfaceSection,
    pub control: ControlSection,
    pub storage: StorageSection,
    /// Mode used until the host stores one
    pub mode: ConnectionMode,
    pub latency_probe: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            log: LogSection::default(),
            dns: DnsSection::default(),
            inbound: InboundSection::default(),
            relay: RelaySection::default(),
            interface: InterfaceSection::default(),
            control: ControlSection::default(),
            storage: StorageSection::default(),
            mode: ConnectionMode::default(),
            latency_probe: true,
        }
    }
}

impl CoreConfig {
    /// Load by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(path.to_path_buf())),
        }
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&read(path.as_ref())?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&read(path.as_ref())?)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn translate_options(&self) -> TranslateOptions {
        TranslateOptions {
            log_level: self.log.level.clone(),
            dns_servers: self.dns.servers.clone(),
            inbound_listen: self.inbound.listen.clone(),
            inbound_port: self.inbound.port,
            mode: self.mode,
        }
    }

    pub fn network_settings(&self) -> NetworkSettings {
        let iface = &self.interface;
        let mut settings = NetworkSettings::new(iface.name.clone(), iface.address, iface.prefix_len)
            .with_dns(iface.dns.clone())
            .with_mtu(iface.mtu);
        for net in &iface.extra_excluded_routes {
            settings.exclude(*net);
        }
        settings
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            network: self.network_settings(),
            relay_stop_timeout: Duration::from_millis(self.relay.stop_timeout_ms),
            stats_interval: Duration::from_millis(self.relay.stats_interval_ms),
            latency_probe: self.latency_probe,
        }
    }

    pub fn engine_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.stop_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.control.request_timeout_ms)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = CoreConfig::from_toml("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.engine.binary, PathBuf::from("xray"));
        assert_eq!(config.inbound.port, 10808);
        assert!(config.latency_probe);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            mode = "global"
            latency_probe = false

            [engine]
            binary = "/usr/local/bin/xray"
            stop_timeout_ms = 500

            [interface]
            mtu = 1400
            extra_excluded_routes = ["203.0.113.0/24"]
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, ConnectionMode::Global);
        assert_eq!(config.engine.binary, PathBuf::from("/usr/local/bin/xray"));
        assert_eq!(config.engine.args, vec!["run", "-c"]);
        assert_eq!(config.engine_stop_timeout(), Duration::from_millis(500));
        assert_eq!(config.interface.name, "xtun0");

        let network = config.network_settings();
        assert_eq!(network.mtu, 1400);
        let extra: IpNet = "203.0.113.0/24".parse().unwrap();
        assert!(network.excluded_routes().contains(&extra));
        assert!(network.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let config = CoreConfig::from_json(
            r#"{ "dns": { "servers": ["9.9.9.9"] }, "inbound": { "port": 2080 } }"#,
        )
        .unwrap();

        let options = config.translate_options();
        assert_eq!(options.dns_servers, vec!["9.9.9.9"]);
        assert_eq!(options.inbound_port, 2080);
        assert_eq!(options.inbound_listen, "127.0.0.1");
        assert_eq!(options.log_level, "warning");
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("xtun.toml");
        std::fs::write(&toml_path, "[control]\nrequest_timeout_ms = 250\n").unwrap();
        let config = CoreConfig::load(&toml_path).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));

        let json_path = dir.path().join("xtun.json");
        std::fs::write(&json_path, r#"{ "mode": "direct" }"#).unwrap();
        assert_eq!(CoreConfig::load(&json_path).unwrap().mode, ConnectionMode::Direct);

        assert!(matches!(
            CoreConfig::load(dir.path().join("xtun.yaml")),
            Err(ConfigError::UnknownFormat(_))
        ));
        assert!(matches!(
            CoreConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            CoreConfig::from_toml("[interface]\naddress = \"not-an-ip\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(CoreConfig::from_json("{"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_service_options() {
        let options = CoreConfig::default().service_options();
        assert_eq!(options.stats_interval, Duration::from_secs(1));
        assert_eq!(options.relay_stop_timeout, Duration::from_secs(2));
        assert_eq!(options.network.prefix_len, 16);
        assert!(options.latency_probe);
    }
}
