//! IPVS data types and structures.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// IPVS version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IPVSVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl IPVSVersion {
    /// Decode the kernel's packed `(major << 16) | (minor << 8) | patch` form.
    pub fn from_packed(v: u32) -> Self {
        Self {
            major: (v >> 16) & 0xff,
            minor: (v >> 8) & 0xff,
            patch: v & 0xff,
        }
    }
}

impl fmt::Display for IPVSVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// IP protocol for IPVS services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    TCP,
    UDP,
    SCTP,
    Other(u16),
}

impl Protocol {
    /// IANA protocol number as carried in `IPVS_SVC_ATTR_PROTOCOL`.
    pub fn number(self) -> u16 {
        match self {
            Protocol::TCP => libc::IPPROTO_TCP as u16,
            Protocol::UDP => libc::IPPROTO_UDP as u16,
            Protocol::SCTP => libc::IPPROTO_SCTP as u16,
            Protocol::Other(n) => n,
        }
    }

    pub fn from_number(n: u16) -> Self {
        match n as i32 {
            libc::IPPROTO_TCP => Protocol::TCP,
            libc::IPPROTO_UDP => Protocol::UDP,
            libc::IPPROTO_SCTP => Protocol::SCTP,
            _ => Protocol::Other(n),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
            Protocol::SCTP => write!(f, "SCTP"),
            Protocol::Other(n) => write!(f, "IP({})", n),
        }
    }
}

/// IPVS scheduling algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnection,
    WeightedLeastConnection,
    SourceHashing,
    MaglevHashing,
    Other(String),
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheduler::RoundRobin => write!(f, "rr"),
            Scheduler::WeightedRoundRobin => write!(f, "wrr"),
            Scheduler::LeastConnection => write!(f, "lc"),
            Scheduler::WeightedLeastConnection => write!(f, "wlc"),
            Scheduler::SourceHashing => write!(f, "sh"),
            Scheduler::MaglevHashing => write!(f, "mh"),
            Scheduler::Other(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for Scheduler {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "rr" => Scheduler::RoundRobin,
            "wrr" => Scheduler::WeightedRoundRobin,
            "lc" => Scheduler::LeastConnection,
            "wlc" => Scheduler::WeightedLeastConnection,
            "sh" => Scheduler::SourceHashing,
            "mh" => Scheduler::MaglevHashing,
            other => Scheduler::Other(other.to_string()),
        })
    }
}

/// Service flags for IPVS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ServiceFlags(pub u32);

impl ServiceFlags {
    pub const PERSISTENT: u32 = 0x1;
    pub const HASHED: u32 = 0x2;
    pub const ONE_PACKET: u32 = 0x4;
    pub const SCHED_SH_FALLBACK: u32 = 0x8;
    pub const SCHED_SH_PORT: u32 = 0x10;

    /// Flags the kernel sets on its own; ignored when comparing services.
    pub const KERNEL_OWNED: u32 = Self::HASHED;

    /// Flags that were requested by userspace.
    pub fn user_flags(self) -> u32 {
        self.0 & !Self::KERNEL_OWNED
    }

    pub fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT != 0
    }
}

/// Packet forwarding method of a destination (`IP_VS_CONN_F_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardingMethod {
    /// NAT mode (masquerading)
    #[default]
    Masq,
    /// Local delivery
    Local,
    /// Tunnel mode (IP-in-IP)
    Tunnel,
    /// Route mode (DSR - Direct Server Return)
    Route,
    /// Bypass
    Bypass,
}

impl ForwardingMethod {
    const FWD_MASK: u32 = 0x7;

    pub fn to_kernel(self) -> u32 {
        match self {
            ForwardingMethod::Masq => 0,
            ForwardingMethod::Local => 1,
            ForwardingMethod::Tunnel => 2,
            ForwardingMethod::Route => 3,
            ForwardingMethod::Bypass => 4,
        }
    }

    pub fn from_kernel(v: u32) -> Self {
        match v & Self::FWD_MASK {
            1 => ForwardingMethod::Local,
            2 => ForwardingMethod::Tunnel,
            3 => ForwardingMethod::Route,
            4 => ForwardingMethod::Bypass,
            _ => ForwardingMethod::Masq,
        }
    }
}

impl fmt::Display for ForwardingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingMethod::Masq => write!(f, "NAT"),
            ForwardingMethod::Local => write!(f, "LOCAL"),
            ForwardingMethod::Tunnel => write!(f, "TUN"),
            ForwardingMethod::Route => write!(f, "DR"),
            ForwardingMethod::Bypass => write!(f, "BYPASS"),
        }
    }
}

/// Identity of a virtual service: the kernel's lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.protocol,
            SocketAddr::new(self.address, self.port)
        )
    }
}

/// An IPVS service (virtual server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub address: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
    pub fwmark: u32,
    pub scheduler: Scheduler,
    pub flags: ServiceFlags,
    /// Persistence timeout in seconds; only meaningful with `PERSISTENT`.
    pub timeout: u32,
}

impl Service {
    /// A non-persistent service keyed by address, port and protocol.
    pub fn new(address: IpAddr, port: u16, protocol: Protocol, scheduler: Scheduler) -> Self {
        Self {
            address,
            protocol,
            port,
            fwmark: 0,
            scheduler,
            flags: ServiceFlags::default(),
            timeout: 0,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            address: self.address,
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// Kernel persistence netmask: host mask for the service's family.
    pub(crate) fn netmask(&self) -> u32 {
        match self.address {
            IpAddr::V4(_) => u32::MAX,
            IpAddr::V6(_) => 128,
        }
    }

    /// Whether the user-controlled attributes of two services differ.
    pub fn attributes_differ(&self, other: &Service) -> bool {
        self.scheduler != other.scheduler
            || self.flags.user_flags() != other.flags.user_flags()
            || (self.flags.is_persistent() && self.timeout != other.timeout)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fwmark > 0 {
            write!(f, "FWM {} ({})", self.fwmark, self.scheduler)
        } else {
            write!(f, "{} ({})", self.key(), self.scheduler)
        }
    }
}

/// An IPVS destination (real server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub forwarding: ForwardingMethod,
    pub lower_threshold: u32,
    pub upper_threshold: u32,
}

impl Destination {
    pub fn new(addr: SocketAddr, weight: u32, forwarding: ForwardingMethod) -> Self {
        Self {
            address: addr.ip(),
            port: addr.port(),
            weight,
            forwarding,
            lower_threshold: 0,
            upper_threshold: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} weight {} {}", self.socket_addr(), self.weight, self.forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_unpacking() {
        let v = IPVSVersion::from_packed((1 << 16) | (2 << 8) | 1);
        assert_eq!(v.to_string(), "1.2.1");
    }

    #[test]
    fn test_scheduler_names() {
        assert_eq!("wlc".parse::<Scheduler>().unwrap(), Scheduler::WeightedLeastConnection);
        assert_eq!(Scheduler::MaglevHashing.to_string(), "mh");
        assert_eq!(
            "fo".parse::<Scheduler>().unwrap(),
            Scheduler::Other("fo".to_string())
        );
    }

    #[test]
    fn test_hashed_flag_does_not_count_as_drift() {
        let desired = Service::new(
            "10.0.0.1".parse().unwrap(),
            80,
            Protocol::TCP,
            Scheduler::WeightedLeastConnection,
        );
        let mut live = desired.clone();
        live.flags = ServiceFlags(ServiceFlags::HASHED);
        assert!(!desired.attributes_differ(&live));

        live.scheduler = Scheduler::RoundRobin;
        assert!(desired.attributes_differ(&live));
    }

    #[test]
    fn test_forwarding_roundtrip_masks_flags() {
        // Kernel reports extra connection flags above the forwarding bits.
        assert_eq!(ForwardingMethod::from_kernel(0x0103), ForwardingMethod::Route);
        assert_eq!(ForwardingMethod::Tunnel.to_kernel(), 2);
    }
}
