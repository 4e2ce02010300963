//! Server Descriptors
//!
//! Protocol-agnostic description of a remote proxy server, as the host
//! application stores it. Each protocol variant carries its own typed
//! fields; anything the typed fields do not cover lives in `extra` and is
//! merged into the generated engine settings at translation time.
//!
//! # Wire shape
//!
//! ```json
//! {
//!   "id": "7b0c...",
//!   "name": "Frankfurt",
//!   "address": "ss.example.com",
//!   "port": 8388,
//!   "protocol": "shadowsocks",
//!   "password": "pw",
//!   "method": "chacha20-ietf-poly1305",
//!   "extra": { "level": 1 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

/// Placeholder printed instead of credentials.
const REDACTED: &str = "<redacted>";

/// Protocol family of a descriptor, without its credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Shadowsocks,
    Vmess,
    Trojan,
    Vless,
    Ikev2,
    WireGuard,
}

impl ProtocolKind {
    /// Protocol name as the proxy engine spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Ikev2 => "ikev2",
            ProtocolKind::WireGuard => "wireguard",
        }
    }

    /// Whether traffic for this protocol is carried by the proxy engine.
    pub fn is_engine_routed(&self) -> bool {
        !matches!(self, ProtocolKind::Ikev2 | ProtocolKind::WireGuard)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-specific fields.
///
/// Required fields are `Option`s so that a descriptor missing them can still
/// be stored and later rejected with a precise `MissingField` error.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ProtocolSettings {
    Shadowsocks {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    Vmess {
        #[serde(default, alias = "uuid", skip_serializing_if = "Option::is_none")]
        identifier: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alter_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        security: Option<String>,
    },
    Trojan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sni: Option<String>,
    },
    Vless {
        #[serde(default, alias = "uuid", skip_serializing_if = "Option::is_none")]
        identifier: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encryption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
    },
    Ikev2 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
    },
    #[serde(rename = "wireguard")]
    WireGuard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_public_key: Option<String>,
    },
}

impl ProtocolSettings {
    /// The protocol family of these settings.
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolSettings::Shadowsocks { .. } => ProtocolKind::Shadowsocks,
            ProtocolSettings::Vmess { .. } => ProtocolKind::Vmess,
            ProtocolSettings::Trojan { .. } => ProtocolKind::Trojan,
            ProtocolSettings::Vless { .. } => ProtocolKind::Vless,
            ProtocolSettings::Ikev2 { .. } => ProtocolKind::Ikev2,
            ProtocolSettings::WireGuard { .. } => ProtocolKind::WireGuard,
        }
    }

    /// Shadowsocks with a password and the default cipher.
    pub fn shadowsocks(password: impl Into<String>) -> Self {
        ProtocolSettings::Shadowsocks {
            password: Some(password.into()),
            method: None,
        }
    }

    /// VMess with a user id and default security.
    pub fn vmess(identifier: impl Into<String>) -> Self {
        ProtocolSettings::Vmess {
            identifier: Some(identifier.into()),
            alter_id: None,
            security: None,
        }
    }

    /// Trojan with a password; SNI defaults to the server address.
    pub fn trojan(password: impl Into<String>) -> Self {
        ProtocolSettings::Trojan {
            password: Some(password.into()),
            sni: None,
        }
    }

    /// VLESS with a user id, no encryption and no flow.
    pub fn vless(identifier: impl Into<String>) -> Self {
        ProtocolSettings::Vless {
            identifier: Some(identifier.into()),
            encryption: None,
            flow: None,
        }
    }
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| REDACTED)
}

impl fmt::Debug for ProtocolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolSettings::Shadowsocks { password, method } => f
                .debug_struct("Shadowsocks")
                .field("password", &redact(password))
                .field("method", method)
                .finish(),
            ProtocolSettings::Vmess { identifier, alter_id, security } => f
                .debug_struct("Vmess")
                .field("identifier", &redact(identifier))
                .field("alter_id", alter_id)
                .field("security", security)
                .finish(),
            ProtocolSettings::Trojan { password, sni } => f
                .debug_struct("Trojan")
                .field("password", &redact(password))
                .field("sni", sni)
                .finish(),
            ProtocolSettings::Vless { identifier, encryption, flow } => f
                .debug_struct("Vless")
                .field("identifier", &redact(identifier))
                .field("encryption", encryption)
                .field("flow", flow)
                .finish(),
            ProtocolSettings::Ikev2 { username, password, remote_id } => f
                .debug_struct("Ikev2")
                .field("username", username)
                .field("password", &redact(password))
                .field("remote_id", remote_id)
                .finish(),
            ProtocolSettings::WireGuard { private_key, peer_public_key } => f
                .debug_struct("WireGuard")
                .field("private_key", &redact(private_key))
                .field("peer_public_key", peer_public_key)
                .finish(),
        }
    }
}

/// Stream network used between the engine and the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
        }
    }
}

/// Stream security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

/// Optional transport settings (stream type, TLS, WebSocket path).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSettings {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_short_id: Option<String>,
}

impl TransportSettings {
    /// WebSocket transport over TLS.
    pub fn websocket_tls(path: impl Into<String>) -> Self {
        Self {
            network: Network::Ws,
            security: Security::Tls,
            ws_path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// How traffic is split between the proxy and the direct outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Everything goes through the proxy
    Global,
    /// Private destinations go direct, the rest through the proxy
    #[default]
    Rule,
    /// Everything goes direct
    Direct,
}

/// A remote proxy/VPN server.
///
/// Immutable once a connection attempt has started: a different descriptor
/// means a new connect or an explicit reconfigure.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: ProtocolSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSettings>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ServerDescriptor {
    /// Create a descriptor with a fresh id.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        protocol: ProtocolSettings,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            port,
            protocol,
            transport: None,
            extra: Map::new(),
        }
    }

    /// Set the transport settings.
    pub fn with_transport(mut self, transport: TransportSettings) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a free-form engine setting.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The protocol family.
    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    /// Name for logs and status; falls back to the endpoint.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.endpoint()
        } else {
            self.name.clone()
        }
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    /// The server address, if it is an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}
