//! Core types shared by the resolver, synchronizer and keepalived manager.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Transport protocol of a virtual server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Parse a Kubernetes port protocol; an absent protocol means TCP.
    pub fn from_k8s(protocol: Option<&str>) -> Option<Self> {
        match protocol.unwrap_or("TCP") {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

impl From<Protocol> for ipvs::Protocol {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tcp => ipvs::Protocol::TCP,
            Protocol::Udp => ipvs::Protocol::UDP,
        }
    }
}

/// Reference to a Service as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key used by the state mirror.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which Service port(s) a binding exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortSelector {
    Number(u16),
    Name(String),
}

impl FromStr for PortSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u16>() {
            Ok(n) => PortSelector::Number(n),
            Err(_) => PortSelector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Number(n) => write!(f, "{}", n),
            PortSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

/// One entry of the VIP-assignment source.
///
/// Without a port selector the binding exposes every port of the Service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VipBinding {
    pub vip: IpAddr,
    pub service: ServiceRef,
    pub port: Option<PortSelector>,
}

impl fmt::Display for VipBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            Some(port) => write!(f, "{} -> {}:{}", self.vip, self.service, port),
            None => write!(f, "{} -> {}", self.vip, self.service),
        }
    }
}

/// Kernel lookup key of a virtual server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualServerKey {
    pub vip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for VirtualServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, SocketAddr::new(self.vip, self.port))
    }
}

/// A backend endpoint receiving load-balanced traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RealServer {
    pub address: SocketAddr,
    pub weight: u32,
}

/// A virtual server and its real servers for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualServer {
    pub key: VirtualServerKey,
    pub service: ServiceRef,
    /// Sorted by address, unique per address. Empty when the Service has no
    /// ready endpoints.
    pub real_servers: Vec<RealServer>,
}

impl VirtualServer {
    pub fn new(key: VirtualServerKey, service: ServiceRef, mut real_servers: Vec<RealServer>) -> Self {
        real_servers.sort();
        real_servers.dedup_by_key(|rs| rs.address);
        Self {
            key,
            service,
            real_servers,
        }
    }
}

/// Target mapping computed from cluster state, canonically ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    entries: Vec<VirtualServer>,
}

impl DesiredState {
    /// Sort entries by key; a later duplicate key is dropped.
    pub fn new(mut entries: Vec<VirtualServer>) -> Self {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|later, earlier| later.key == earlier.key);
        Self { entries }
    }

    pub fn entries(&self) -> &[VirtualServer] {
        &self.entries
    }

    pub fn get(&self, key: &VirtualServerKey) -> Option<&VirtualServer> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ordered set of virtual IPs.
    pub fn vips(&self) -> BTreeSet<IpAddr> {
        self.entries.iter().map(|e| e.key.vip).collect()
    }

    /// Keep only entries whose VIP satisfies `keep`.
    pub fn retain_vips(&self, keep: impl Fn(&IpAddr) -> bool) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| keep(&e.key.vip))
                .cloned()
                .collect(),
        }
    }
}

/// VRRP role reported by keepalived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    Init,
    Backup,
    Master,
    Fault,
}

impl FromStr for VrrpState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(VrrpState::Init),
            "BACKUP" => Ok(VrrpState::Backup),
            "MASTER" => Ok(VrrpState::Master),
            "FAULT" => Ok(VrrpState::Fault),
            other => Err(format!("unknown VRRP state {:?}", other)),
        }
    }
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VrrpState::Init => "INIT",
            VrrpState::Backup => "BACKUP",
            VrrpState::Master => "MASTER",
            VrrpState::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

/// A role transition reported by keepalived's notify hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTransition {
    /// `INSTANCE` or `GROUP`
    pub kind: String,
    pub instance: String,
    pub state: VrrpState,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// This node's view of the VRRP participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoster {
    pub node: String,
    pub address: IpAddr,
    /// Other nodes, sorted.
    pub peers: Vec<IpAddr>,
    pub priority: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs(vip: &str, port: u16) -> VirtualServer {
        VirtualServer::new(
            VirtualServerKey {
                vip: vip.parse().unwrap(),
                port,
                protocol: Protocol::Tcp,
            },
            ServiceRef::new("default", "web"),
            vec![],
        )
    }

    #[test]
    fn test_desired_state_is_canonically_ordered() {
        let a = DesiredState::new(vec![vs("10.0.0.2", 80), vs("10.0.0.1", 443), vs("10.0.0.1", 80)]);
        let b = DesiredState::new(vec![vs("10.0.0.1", 80), vs("10.0.0.2", 80), vs("10.0.0.1", 443)]);
        assert_eq!(a, b);
        assert_eq!(a.entries()[0].key.port, 80);
        assert_eq!(a.vips().len(), 2);
    }

    #[test]
    fn test_real_servers_dedup_by_address() {
        let key = VirtualServerKey {
            vip: "10.0.0.1".parse().unwrap(),
            port: 80,
            protocol: Protocol::Tcp,
        };
        let addr: SocketAddr = "10.1.0.5:8080".parse().unwrap();
        let entry = VirtualServer::new(
            key,
            ServiceRef::new("default", "web"),
            vec![
                RealServer { address: addr, weight: 1 },
                RealServer { address: addr, weight: 1 },
            ],
        );
        assert_eq!(entry.real_servers.len(), 1);
    }

    #[test]
    fn test_port_selector_parsing() {
        assert_eq!("80".parse::<PortSelector>().unwrap(), PortSelector::Number(80));
        assert_eq!(
            "http".parse::<PortSelector>().unwrap(),
            PortSelector::Name("http".into())
        );
    }

    #[test]
    fn test_vrrp_state_is_case_insensitive() {
        assert_eq!("master".parse::<VrrpState>().unwrap(), VrrpState::Master);
        assert!("LEADER".parse::<VrrpState>().is_err());
    }
}
