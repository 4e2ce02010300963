//! Config Translator
//!
//! Turns a [`ServerDescriptor`] into the configuration the proxy engine
//! understands. Translation is pure: identical input yields an identical
//! [`ProxyConfig`] and nothing outside the return value is touched.
//!
//! # Defaults
//!
//! | Protocol    | Required       | Defaults                                   |
//! |-------------|----------------|--------------------------------------------|
//! | shadowsocks | password       | method = chacha20-ietf-poly1305            |
//! | vmess       | identifier     | alterId = 0, security = auto               |
//! | trojan      | password       | sni = server address                       |
//! | vless       | identifier     | encryption = none, flow = ""               |
//! | ikev2       | username, pass | native profile, not routed through engine  |
//! | wireguard   | -              | always `NotImplemented`                    |

use crate::descriptor::{
    ConnectionMode, Network, ProtocolKind, ProtocolSettings, Security, ServerDescriptor,
    TransportSettings,
};
use crate::socks;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Default Shadowsocks cipher
pub const DEFAULT_SS_METHOD: &str = "chacha20-ietf-poly1305";
/// Default VMess security
pub const DEFAULT_VMESS_SECURITY: &str = "auto";
/// Default VLESS encryption
pub const DEFAULT_VLESS_ENCRYPTION: &str = "none";

/// Outbound tag carrying the remote server
pub const PROXY_TAG: &str = "proxy";
/// Outbound tag for traffic that bypasses the server
pub const DIRECT_TAG: &str = "direct";
/// Outbound tag that drops traffic
pub const BLOCK_TAG: &str = "block";
/// Inbound tag of the local listener the relay talks to
pub const RELAY_INBOUND_TAG: &str = "relay-in";

/// Translation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Malformed descriptor: {0}")]
    Malformed(String),
}

impl ConfigurationError {
    /// Whether retrying with the same descriptor can never succeed.
    ///
    /// A missing field is something the user fills in; an unsupported
    /// protocol or a malformed descriptor is not.
    pub fn is_fundamental(&self) -> bool {
        matches!(
            self,
            ConfigurationError::NotImplemented(_) | ConfigurationError::Malformed(_)
        )
    }
}

/// Engine log section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

/// Engine DNS section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub servers: Vec<String>,
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub outbound_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl RoutingRule {
    fn field(outbound_tag: &str) -> Self {
        Self {
            kind: "field".to_string(),
            outbound_tag: outbound_tag.to_string(),
            ip: None,
            domain: None,
            network: None,
        }
    }

    fn ip(outbound_tag: &str, ip: &[&str]) -> Self {
        Self {
            ip: Some(ip.iter().map(|s| s.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }

    fn domain(outbound_tag: &str, domain: &[&str]) -> Self {
        Self {
            domain: Some(domain.iter().map(|s| s.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }

    fn catch_all(outbound_tag: &str) -> Self {
        Self {
            network: Some("tcp,udp".to_string()),
            ..Self::field(outbound_tag)
        }
    }
}

/// Engine routing section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSettings {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

/// Local listener the packet relay talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    pub listen: String,
    pub port: u16,
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

impl Inbound {
    /// `listen:port` of the inbound.
    pub fn address(&self) -> String {
        match self.listen.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.listen, self.port),
        }
    }
}

/// TLS parameters of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// REALITY parameters of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub fingerprint: String,
}

/// WebSocket parameters of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
}

/// gRPC parameters of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

/// Transport settings of the proxy outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
}

/// One outbound definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

impl Outbound {
    fn plain(tag: &str, protocol: &str) -> Self {
        Self {
            tag: tag.to_string(),
            protocol: protocol.to_string(),
            settings: Map::new(),
            stream_settings: None,
        }
    }

    /// The server entry (`servers[0]` or `vnext[0]`).
    pub fn server_entry(&self) -> Option<&Map<String, Value>> {
        self.settings
            .get("servers")
            .or_else(|| self.settings.get("vnext"))
            .and_then(|list| list.get(0))
            .and_then(Value::as_object)
    }

    /// The user entry of a `vnext` server (`vnext[0].users[0]`).
    pub fn user_entry(&self) -> Option<&Map<String, Value>> {
        self.settings
            .get("vnext")
            .and_then(|list| list.get(0))
            .and_then(|server| server.get("users"))
            .and_then(|users| users.get(0))
            .and_then(Value::as_object)
    }

    /// Look a setting up in the user entry, then in the server entry.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.user_entry()
            .and_then(|user| user.get(key))
            .or_else(|| self.server_entry().and_then(|server| server.get(key)))
    }
}

/// Engine-facing configuration, written to disk before each engine start.
///
/// Never mutated in place: a configuration change produces a new value and
/// a full stop/start cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub log: LogSettings,
    pub dns: DnsSettings,
    pub routing: RoutingSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

impl ProxyConfig {
    /// The outbound that encodes the remote server.
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == PROXY_TAG)
    }

    /// The inbound the packet relay talks to.
    pub fn relay_inbound(&self) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag == RELAY_INBOUND_TAG)
    }

    /// Transport settings of the proxy outbound.
    pub fn transport(&self) -> Option<&StreamSettings> {
        self.proxy_outbound().and_then(|o| o.stream_settings.as_ref())
    }

    /// Serialize for the engine.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Connection profile for protocols carried by the OS rather than the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct NativeProfile {
    pub server: String,
    pub remote_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for NativeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeProfile")
            .field("server", &self.server)
            .field("remote_id", &self.remote_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a translation
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelPlan {
    /// Traffic is carried by the supervised proxy engine
    Engine(ProxyConfig),
    /// Traffic is carried by a native OS tunnel
    Native(NativeProfile),
}

impl TunnelPlan {
    /// The engine configuration, or `NotImplemented` for native plans.
    pub fn into_engine(self) -> Result<ProxyConfig, ConfigurationError> {
        match self {
            TunnelPlan::Engine(config) => Ok(config),
            TunnelPlan::Native(profile) => Err(ConfigurationError::NotImplemented(format!(
                "native tunnel for {} is not hosted by the engine core",
                profile.server
            ))),
        }
    }
}

/// Knobs that do not come from the descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateOptions {
    /// Engine log level
    pub log_level: String,
    /// DNS resolvers handed to the engine
    pub dns_servers: Vec<String>,
    /// Relay inbound listen address
    pub inbound_listen: String,
    /// Relay inbound port
    pub inbound_port: u16,
    /// Traffic split
    pub mode: ConnectionMode,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            log_level: "warning".to_string(),
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            inbound_listen: "127.0.0.1".to_string(),
            inbound_port: 10808,
            mode: ConnectionMode::Rule,
        }
    }
}

/// Descriptor-to-engine translator
#[derive(Debug, Clone, Default)]
pub struct Translator {
    options: TranslateOptions,
}

/// Translate with default options.
pub fn translate(descriptor: &ServerDescriptor) -> Result<TunnelPlan, ConfigurationError> {
    Translator::default().translate(descriptor)
}

impl Translator {
    pub fn new(options: TranslateOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TranslateOptions {
        &self.options
    }

    /// Same translator with a different traffic split.
    pub fn with_mode(&self, mode: ConnectionMode) -> Self {
        let mut options = self.options.clone();
        options.mode = mode;
        Self { options }
    }

    /// Translate a descriptor.
    pub fn translate(&self, descriptor: &ServerDescriptor) -> Result<TunnelPlan, ConfigurationError> {
        validate_endpoint(descriptor)?;

        let mut outbound = match &descriptor.protocol {
            ProtocolSettings::Shadowsocks { password, method } => {
                let password = required(password, "password")?;
                let method = method.as_deref().unwrap_or(DEFAULT_SS_METHOD);
                server_outbound(
                    ProtocolKind::Shadowsocks,
                    json!({
                        "address": descriptor.address,
                        "port": descriptor.port,
                        "method": method,
                        "password": password,
                    }),
                )
            }
            ProtocolSettings::Vmess { identifier, alter_id, security } => {
                let id = required_uuid(identifier)?;
                vnext_outbound(
                    ProtocolKind::Vmess,
                    descriptor,
                    json!({
                        "id": id,
                        "alterId": alter_id.unwrap_or(0),
                        "security": security.as_deref().unwrap_or(DEFAULT_VMESS_SECURITY),
                    }),
                )
            }
            ProtocolSettings::Trojan { password, .. } => {
                let password = required(password, "password")?;
                server_outbound(
                    ProtocolKind::Trojan,
                    json!({
                        "address": descriptor.address,
                        "port": descriptor.port,
                        "password": password,
                    }),
                )
            }
            ProtocolSettings::Vless { identifier, encryption, flow } => {
                let id = required_uuid(identifier)?;
                vnext_outbound(
                    ProtocolKind::Vless,
                    descriptor,
                    json!({
                        "id": id,
                        "encryption": encryption.as_deref().unwrap_or(DEFAULT_VLESS_ENCRYPTION),
                        "flow": flow.as_deref().unwrap_or(""),
                    }),
                )
            }
            ProtocolSettings::Ikev2 { username, password, remote_id } => {
                let username = required(username, "username")?;
                let password = required(password, "password")?;
                return Ok(TunnelPlan::Native(NativeProfile {
                    server: descriptor.address.clone(),
                    remote_id: remote_id.clone().unwrap_or_else(|| descriptor.address.clone()),
                    username: username.to_string(),
                    password: password.to_string(),
                }));
            }
            ProtocolSettings::WireGuard { .. } => {
                return Err(ConfigurationError::NotImplemented(
                    "wireguard is not supported".to_string(),
                ));
            }
        };

        merge_extra(&mut outbound.settings, &descriptor.extra);
        outbound.stream_settings = stream_settings(descriptor)?;

        Ok(TunnelPlan::Engine(ProxyConfig {
            log: LogSettings {
                loglevel: self.options.log_level.clone(),
            },
            dns: DnsSettings {
                servers: self.options.dns_servers.clone(),
            },
            routing: routing(self.options.mode),
            inbounds: vec![self.inbound()],
            outbounds: vec![
                outbound,
                Outbound::plain(DIRECT_TAG, "freedom"),
                Outbound::plain(BLOCK_TAG, "blackhole"),
            ],
        }))
    }

    fn inbound(&self) -> Inbound {
        Inbound {
            tag: RELAY_INBOUND_TAG.to_string(),
            protocol: socks::INBOUND_PROTOCOL.to_string(),
            listen: self.options.inbound_listen.clone(),
            port: self.options.inbound_port,
            settings: socks::inbound_settings(&self.options.inbound_listen),
            sniffing: Some(json!({ "enabled": true, "destOverride": ["http", "tls"] })),
        }
    }
}

fn validate_endpoint(descriptor: &ServerDescriptor) -> Result<(), ConfigurationError> {
    if descriptor.address.trim().is_empty() {
        return Err(ConfigurationError::Malformed("empty server address".to_string()));
    }
    if descriptor.address.chars().any(char::is_whitespace) {
        return Err(ConfigurationError::Malformed(
            "server address contains whitespace".to_string(),
        ));
    }
    if descriptor.port == 0 {
        return Err(ConfigurationError::Malformed("server port is zero".to_string()));
    }
    Ok(())
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigurationError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigurationError::MissingField(name)),
    }
}

fn required_uuid(value: &Option<String>) -> Result<&str, ConfigurationError> {
    let id = required(value, "identifier")?;
    uuid::Uuid::parse_str(id)
        .map_err(|_| ConfigurationError::Malformed("identifier is not a UUID".to_string()))?;
    Ok(id)
}

fn server_outbound(kind: ProtocolKind, server: Value) -> Outbound {
    let mut outbound = Outbound::plain(PROXY_TAG, kind.as_str());
    outbound.settings.insert("servers".to_string(), Value::Array(vec![server]));
    outbound
}

fn vnext_outbound(kind: ProtocolKind, descriptor: &ServerDescriptor, user: Value) -> Outbound {
    let mut outbound = Outbound::plain(PROXY_TAG, kind.as_str());
    outbound.settings.insert(
        "vnext".to_string(),
        json!([{
            "address": descriptor.address,
            "port": descriptor.port,
            "users": [user],
        }]),
    );
    outbound
}

/// Merge caller-supplied settings over the generated ones.
///
/// Keys that already exist on the user entry override it there; every other
/// key lands on the server entry. Caller keys always win.
fn merge_extra(settings: &mut Map<String, Value>, extra: &Map<String, Value>) {
    if extra.is_empty() {
        return;
    }

    let list_key = if settings.contains_key("vnext") { "vnext" } else { "servers" };
    let Some(server) = settings
        .get_mut(list_key)
        .and_then(|list| list.get_mut(0))
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    for (key, value) in extra {
        let on_user = server
            .get("users")
            .and_then(|users| users.get(0))
            .and_then(Value::as_object)
            .is_some_and(|user| user.contains_key(key));

        if !on_user {
            server.insert(key.clone(), value.clone());
        } else if let Some(user) = server
            .get_mut("users")
            .and_then(|users| users.get_mut(0))
            .and_then(Value::as_object_mut)
        {
            user.insert(key.clone(), value.clone());
        }
    }
}

fn stream_settings(descriptor: &ServerDescriptor) -> Result<Option<StreamSettings>, ConfigurationError> {
    let is_trojan = descriptor.kind() == ProtocolKind::Trojan;
    let transport = match (&descriptor.transport, is_trojan) {
        (Some(t), _) => t.clone(),
        (None, true) => TransportSettings::default(),
        (None, false) => return Ok(None),
    };

    let mut security = transport.security;
    if is_trojan && security == Security::None {
        security = Security::Tls;
    }

    let protocol_sni = match &descriptor.protocol {
        ProtocolSettings::Trojan { sni, .. } => sni.clone(),
        _ => None,
    };
    let server_name = transport
        .sni
        .clone()
        .or(protocol_sni)
        .unwrap_or_else(|| descriptor.address.clone());

    let tls_settings = (security == Security::Tls).then(|| TlsSettings {
        server_name: server_name.clone(),
        allow_insecure: transport.allow_insecure,
        fingerprint: transport.fingerprint.clone(),
    });

    let reality_settings = match security {
        Security::Reality => {
            let public_key = transport
                .reality_public_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or(ConfigurationError::MissingField("realityPublicKey"))?;
            Some(RealitySettings {
                server_name: server_name.clone(),
                public_key,
                short_id: transport.reality_short_id.clone(),
                fingerprint: transport
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| "chrome".to_string()),
            })
        }
        _ => None,
    };

    let ws_settings = (transport.network == Network::Ws).then(|| {
        let mut headers = Map::new();
        if let Some(host) = &transport.ws_host {
            headers.insert("Host".to_string(), Value::String(host.clone()));
        }
        WsSettings {
            path: transport.ws_path.clone().unwrap_or_else(|| "/".to_string()),
            headers,
        }
    });

    let grpc_settings = (transport.network == Network::Grpc).then(|| GrpcSettings {
        service_name: transport.grpc_service_name.clone().unwrap_or_default(),
    });

    Ok(Some(StreamSettings {
        network: transport.network.as_str().to_string(),
        security: security.as_str().to_string(),
        tls_settings,
        reality_settings,
        ws_settings,
        grpc_settings,
    }))
}

fn routing(mode: ConnectionMode) -> RoutingSettings {
    let rules = match mode {
        ConnectionMode::Global => vec![RoutingRule::catch_all(PROXY_TAG)],
        ConnectionMode::Rule => vec![
            RoutingRule::ip(DIRECT_TAG, &["geoip:private"]),
            RoutingRule::domain(DIRECT_TAG, &["geosite:private"]),
            RoutingRule::catch_all(PROXY_TAG),
        ],
        ConnectionMode::Direct => vec![RoutingRule::catch_all(DIRECT_TAG)],
    };

    RoutingSettings {
        domain_strategy: "IPIfNonMatch".to_string(),
        rules,
    }
}
