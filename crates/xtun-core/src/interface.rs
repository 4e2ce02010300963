//! Tunnel Interface Manager
//!
//! Network settings for the virtual interface and the code that applies
//! them to the OS.
//!
//! Every [`NetworkSettings`] carries the mandatory exclusion list: loopback,
//! link-local, private and multicast ranges never enter the tunnel. Without
//! it the tunnel would capture the engine's own upstream traffic and the
//! local network. The list cannot be removed through the public API.

use crate::descriptor::ServerDescriptor;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Ranges that are always routed outside the tunnel
pub const MANDATORY_EXCLUSIONS: [&str; 10] = [
    "127.0.0.0/8",
    "169.254.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "::1/128",
    "fe80::/10",
    "fc00::/7",
    "ff00::/8",
];

/// Smallest MTU accepted (IPv4 minimum reassembly size)
pub const MIN_MTU: u32 = 576;
/// Largest MTU accepted
pub const MAX_MTU: u32 = 9000;

/// Interface errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("Interface settings rejected: {0}")]
    SettingsRejected(String),
}

/// Parsed [`MANDATORY_EXCLUSIONS`].
pub fn mandatory_exclusions() -> Vec<IpNet> {
    MANDATORY_EXCLUSIONS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Settings of the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub interface_name: String,
    /// Tunnel-local address
    pub address: IpAddr,
    pub prefix_len: u8,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u32,
    /// Routes sent into the tunnel
    pub included_routes: Vec<IpNet>,
    excluded_routes: Vec<IpNet>,
}

impl NetworkSettings {
    /// Full-tunnel settings with the mandatory exclusions.
    pub fn new(interface_name: impl Into<String>, address: IpAddr, prefix_len: u8) -> Self {
        let included_routes = ["0.0.0.0/0", "::/0"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        Self {
            interface_name: interface_name.into(),
            address,
            prefix_len,
            dns_servers: Vec::new(),
            mtu: 1500,
            included_routes,
            excluded_routes: mandatory_exclusions(),
        }
    }

    pub fn with_dns(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Add an exclusion on top of the mandatory ones.
    pub fn exclude(&mut self, net: IpNet) {
        let net = net.trunc();
        if !self.excluded_routes.contains(&net) {
            self.excluded_routes.push(net);
        }
    }

    /// Routes kept outside the tunnel.
    pub fn excluded_routes(&self) -> &[IpNet] {
        &self.excluded_routes
    }

    /// Settings for a connection to `descriptor`.
    ///
    /// A server given as an IP literal gets a host exclusion so the engine's
    /// upstream connection bypasses the tunnel.
    pub fn for_server(&self, descriptor: &ServerDescriptor) -> Self {
        let mut settings = self.clone();
        if let Some(ip) = descriptor.ip() {
            settings.exclude(IpNet::from(ip));
        }
        settings
    }

    /// The tunnel's own network.
    pub fn tunnel_network(&self) -> Result<IpNet, InterfaceError> {
        IpNet::new(self.address, self.prefix_len)
            .map_err(|e| InterfaceError::SettingsRejected(format!("bad prefix length: {}", e)))
    }

    /// Check the settings before anything touches the OS.
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.interface_name.is_empty() {
            return Err(InterfaceError::SettingsRejected("empty interface name".to_string()));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(InterfaceError::SettingsRejected(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }
        self.tunnel_network()?;
        if self.included_routes.is_empty() {
            return Err(InterfaceError::SettingsRejected("no included routes".to_string()));
        }
        if let Some(net) = self.excluded_routes.iter().find(|net| net.contains(&self.address)) {
            return Err(InterfaceError::SettingsRejected(format!(
                "tunnel address {} lies in excluded range {}",
                self.address, net
            )));
        }
        if let Some(missing) = mandatory_exclusions()
            .into_iter()
            .find(|net| !self.excluded_routes.contains(net))
        {
            return Err(InterfaceError::SettingsRejected(format!(
                "mandatory exclusion {} missing",
                missing
            )));
        }
        Ok(())
    }
}

/// OS side of the tunnel interface.
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    /// Apply settings. Fails without leaving partial state behind.
    async fn apply(&self, settings: &NetworkSettings) -> Result<(), InterfaceError>;

    /// Remove whatever the last `apply` installed.
    async fn clear(&self) -> Result<(), InterfaceError>;
}

/// One external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SystemCommand {
    fn new(program: &PathBuf, args: &[&str]) -> Self {
        Self {
            program: program.clone(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Priority of the exclusion rules (looked up before the tunnel table)
const EXCLUDE_PRIORITY: u32 = 9000;
/// Priority of the rule sending everything else to the tunnel table
const TUNNEL_PRIORITY: u32 = 9010;

fn family_flag(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

/// Linux interface configuration through `ip` and `resolvectl`.
///
/// The interface device itself belongs to the packet-flow provider; this
/// type only configures it.
pub struct SystemInterface {
    ip: PathBuf,
    resolvectl: PathBuf,
    table: u32,
    applied: Mutex<Option<NetworkSettings>>,
}

impl SystemInterface {
    pub fn new() -> Self {
        Self {
            ip: PathBuf::from("ip"),
            resolvectl: PathBuf::from("resolvectl"),
            table: 2022,
            applied: Mutex::new(None),
        }
    }

    /// Routing table holding the tunnel routes.
    pub fn with_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    /// Commands that install `settings`.
    pub fn apply_commands(&self, settings: &NetworkSettings) -> Vec<SystemCommand> {
        let name = settings.interface_name.as_str();
        let table = self.table.to_string();
        let address = format!("{}/{}", settings.address, settings.prefix_len);
        let mtu = settings.mtu.to_string();

        let mut commands = vec![
            SystemCommand::new(&self.ip, &["addr", "replace", &address, "dev", name]),
            SystemCommand::new(&self.ip, &["link", "set", "dev", name, "mtu", &mtu, "up"]),
        ];

        for net in &settings.included_routes {
            let net = net.to_string();
            commands.push(SystemCommand::new(
                &self.ip,
                &["route", "replace", &net, "dev", name, "table", &table],
            ));
        }

        let exclude_priority = EXCLUDE_PRIORITY.to_string();
        for net in settings.excluded_routes() {
            let flag = family_flag(net);
            let net = net.to_string();
            commands.push(SystemCommand::new(
                &self.ip,
                &[flag, "rule", "add", "to", &net, "lookup", "main", "priority", &exclude_priority],
            ));
        }

        let tunnel_priority = TUNNEL_PRIORITY.to_string();
        for flag in ["-4", "-6"] {
            commands.push(SystemCommand::new(
                &self.ip,
                &[flag, "rule", "add", "lookup", &table, "priority", &tunnel_priority],
            ));
        }

        if !settings.dns_servers.is_empty() {
            let mut args = vec!["dns".to_string(), name.to_string()];
            args.extend(settings.dns_servers.iter().map(|ip| ip.to_string()));
            commands.push(SystemCommand {
                program: self.resolvectl.clone(),
                args,
            });
            commands.push(SystemCommand::new(&self.resolvectl, &["domain", name, "~."]));
        }

        commands
    }

    /// Commands that undo [`apply_commands`](Self::apply_commands).
    pub fn clear_commands(&self, settings: &NetworkSettings) -> Vec<SystemCommand> {
        let name = settings.interface_name.as_str();
        let table = self.table.to_string();

        let mut commands = Vec::new();
        let tunnel_priority = TUNNEL_PRIORITY.to_string();
        for flag in ["-4", "-6"] {
            commands.push(SystemCommand::new(
                &self.ip,
                &[flag, "rule", "del", "lookup", &table, "priority", &tunnel_priority],
            ));
        }

        let exclude_priority = EXCLUDE_PRIORITY.to_string();
        for net in settings.excluded_routes() {
            let flag = family_flag(net);
            let net = net.to_string();
            commands.push(SystemCommand::new(
                &self.ip,
                &[flag, "rule", "del", "to", &net, "lookup", "main", "priority", &exclude_priority],
            ));
        }

        for flag in ["-4", "-6"] {
            commands.push(SystemCommand::new(&self.ip, &[flag, "route", "flush", "table", &table]));
        }
        commands.push(SystemCommand::new(&self.ip, &["addr", "flush", "dev", name]));

        if !settings.dns_servers.is_empty() {
            commands.push(SystemCommand::new(&self.resolvectl, &["revert", name]));
        }
        commands
    }

    async fn run(command: &SystemCommand) -> Result<(), InterfaceError> {
        debug!("Running {}", command.display());
        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .await
            .map_err(|e| {
                InterfaceError::SettingsRejected(format!("{}: {}", command.display(), e))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(InterfaceError::SettingsRejected(format!(
                "{} exited with {}: {}",
                command.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Run every command, returning the first failure.
    async fn run_all(commands: &[SystemCommand]) -> Result<(), InterfaceError> {
        let mut first_error = None;
        for command in commands {
            if let Err(e) = Self::run(command).await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for SystemInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelInterface for SystemInterface {
    async fn apply(&self, settings: &NetworkSettings) -> Result<(), InterfaceError> {
        settings.validate()?;

        // Recorded up front so a cancelled apply is still undone by `clear`
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());

        for command in self.apply_commands(settings) {
            if let Err(e) = Self::run(&command).await {
                // Roll back what went in so far; failures here are expected
                let _ = Self::run_all(&self.clear_commands(settings)).await;
                *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = None;
                return Err(e);
            }
        }

        info!(
            "Interface {} configured with {}/{} (mtu {})",
            settings.interface_name, settings.address, settings.prefix_len, settings.mtu
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), InterfaceError> {
        let applied = self
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match applied {
            Some(settings) => {
                let result = Self::run_all(&self.clear_commands(&settings)).await;
                info!("Interface {} cleared", settings.interface_name);
                result
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ProtocolSettings;

    fn settings() -> NetworkSettings {
        NetworkSettings::new("xtun0", "198.18.0.1".parse().unwrap(), 16)
    }

    #[test]
    fn test_mandatory_exclusions_always_present() {
        let settings = settings();
        assert_eq!(settings.excluded_routes().len(), MANDATORY_EXCLUSIONS.len());
        for net in mandatory_exclusions() {
            assert!(settings.excluded_routes().contains(&net));
        }
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_server_ip_is_excluded() {
        let descriptor = ServerDescriptor::new("s", "203.0.113.7", 443, ProtocolSettings::trojan("pw"));
        let per_server = settings().for_server(&descriptor);
        assert!(per_server
            .excluded_routes()
            .contains(&"203.0.113.7/32".parse().unwrap()));

        let by_name = ServerDescriptor::new("s", "s.example.com", 443, ProtocolSettings::trojan("pw"));
        assert_eq!(settings().for_server(&by_name), settings());
    }

    #[test]
    fn test_exclude_dedupes() {
        let mut settings = settings();
        settings.exclude("10.1.2.3/8".parse().unwrap());
        assert_eq!(settings.excluded_routes().len(), MANDATORY_EXCLUSIONS.len());
    }

    #[test]
    fn test_validation() {
        assert!(settings().with_mtu(100).validate().is_err());
        assert!(settings().with_mtu(9001).validate().is_err());

        let private = NetworkSettings::new("xtun0", "10.8.0.2".parse().unwrap(), 24);
        assert!(matches!(
            private.validate(),
            Err(InterfaceError::SettingsRejected(_))
        ));

        let bad_prefix = NetworkSettings::new("xtun0", "198.18.0.1".parse().unwrap(), 40);
        assert!(bad_prefix.validate().is_err());

        let mut no_routes = settings();
        no_routes.included_routes.clear();
        assert!(no_routes.validate().is_err());
    }

    #[test]
    fn test_apply_commands() {
        let iface = SystemInterface::new().with_table(100);
        let settings = settings().with_dns(vec!["1.1.1.1".parse().unwrap()]);
        let commands = iface.apply_commands(&settings);
        let lines: Vec<String> = commands.iter().map(SystemCommand::display).collect();

        assert_eq!(lines[0], "ip addr replace 198.18.0.1/16 dev xtun0");
        assert_eq!(lines[1], "ip link set dev xtun0 mtu 1500 up");
        assert!(lines.contains(&"ip route replace 0.0.0.0/0 dev xtun0 table 100".to_string()));
        assert!(lines.contains(&"ip -4 rule add to 192.168.0.0/16 lookup main priority 9000".to_string()));
        assert!(lines.contains(&"ip -6 rule add to fe80::/10 lookup main priority 9000".to_string()));
        assert!(lines.contains(&"resolvectl dns xtun0 1.1.1.1".to_string()));

        let clear: Vec<String> = iface
            .clear_commands(&settings)
            .iter()
            .map(SystemCommand::display)
            .collect();
        assert!(clear.contains(&"ip addr flush dev xtun0".to_string()));
        assert!(clear.contains(&"resolvectl revert xtun0".to_string()));
    }

    #[tokio::test]
    async fn test_clear_without_apply_is_noop() {
        assert!(SystemInterface::new().clear().await.is_ok());
    }
}
