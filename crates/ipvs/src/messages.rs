//! IPVS netlink message serialization and deserialization.
//!
//! This module provides types that implement the traits required for
//! generic netlink communication with the IPVS kernel module.

use crate::commands::{
    CMD_ATTR_DEST, CMD_ATTR_SERVICE, IPVSCommand, IPVSDestAttr, IPVSInfoAttr, IPVSServiceAttr,
};
use crate::types::{Destination, ForwardingMethod, Protocol, Scheduler, Service, ServiceFlags};
use common::{Error, Result};
use netlink_packet_core::{DecodeError, ParseableParametrized};
use netlink_packet_generic::{GenlFamily, GenlHeader};
use netlink_packet_utils::{
    nla::{Nla, NlaBuffer, NlasIterator},
    parsers::{parse_u16, parse_u32},
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netlink_packet_utils::Emitable as UtilsEmitable;

/// IPVS generic netlink family name.
pub const IPVS_GENL_NAME: &str = "IPVS";

/// IPVS generic netlink family version.
const IPVS_GENL_VERSION: u8 = 1;

/// IPVS generic netlink message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPVSMessage {
    pub cmd: IPVSCommand,
    pub nlas: Vec<IPVSNla>,
}

impl IPVSMessage {
    pub fn new(cmd: IPVSCommand) -> Self {
        Self {
            cmd,
            nlas: Vec::new(),
        }
    }

    pub fn with_nlas(cmd: IPVSCommand, nlas: Vec<IPVSNla>) -> Self {
        Self { cmd, nlas }
    }

    /// Service attribute sets carried by this message.
    pub fn services(&self) -> impl Iterator<Item = &[ServiceNla]> {
        self.nlas.iter().filter_map(|nla| match nla {
            IPVSNla::Service(attrs) => Some(attrs.as_slice()),
            _ => None,
        })
    }

    /// Destination attribute sets carried by this message.
    pub fn destinations(&self) -> impl Iterator<Item = &[DestNla]> {
        self.nlas.iter().filter_map(|nla| match nla {
            IPVSNla::Dest(attrs) => Some(attrs.as_slice()),
            _ => None,
        })
    }

    /// The packed version from a `GetInfo` reply.
    pub fn version(&self) -> Option<u32> {
        self.nlas.iter().find_map(|nla| match nla {
            IPVSNla::Info(InfoNla::Version(v)) => Some(*v),
            _ => None,
        })
    }
}

/// Top-level IPVS netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IPVSNla {
    /// Service information (nested attributes)
    Service(Vec<ServiceNla>),
    /// Destination information (nested attributes)
    Dest(Vec<DestNla>),
    /// Info attribute of a `GetInfo` reply
    Info(InfoNla),
    /// Unknown/unsupported attribute
    Other(u16, Vec<u8>),
}

/// Service-specific netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceNla {
    AddressFamily(u16),
    Protocol(u16),
    /// `union nf_inet_addr`: IPv4 occupies the first four bytes.
    Address([u8; 16]),
    /// Host-order port; encoded big-endian on the wire.
    Port(u16),
    FirewallMark(u32),
    Scheduler(String),
    Flags { flags: u32, mask: u32 },
    Timeout(u32),
    Netmask(u32),
    Other(u16, Vec<u8>),
}

/// Destination-specific netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestNla {
    Address([u8; 16]),
    /// Host-order port; encoded big-endian on the wire.
    Port(u16),
    ForwardingMethod(u32),
    Weight(u32),
    UpperThreshold(u32),
    LowerThreshold(u32),
    AddressFamily(u16),
    Other(u16, Vec<u8>),
}

/// Info-specific netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoNla {
    Version(u32),
    ConnTableSize(u32),
    Other(u16, Vec<u8>),
}

fn emit_nested<T: Nla>(nlas: &[T], buffer: &mut [u8]) {
    let mut offset = 0;
    for nla in nlas {
        let len = nla.buffer_len();
        nla.emit(&mut buffer[offset..offset + len]);
        offset += len;
    }
}

impl Nla for IPVSNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Service(nlas) => nlas.iter().map(|nla| nla.buffer_len()).sum(),
            Self::Dest(nlas) => nlas.iter().map(|nla| nla.buffer_len()).sum(),
            Self::Info(nla) => nla.value_len(),
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Service(_) => CMD_ATTR_SERVICE,
            Self::Dest(_) => CMD_ATTR_DEST,
            Self::Info(nla) => nla.kind(),
            Self::Other(kind, _) => *kind,
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, Self::Service(_) | Self::Dest(_))
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Service(nlas) => emit_nested(nlas, buffer),
            Self::Dest(nlas) => emit_nested(nlas, buffer),
            Self::Info(nla) => nla.emit_value(buffer),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for ServiceNla {
    fn value_len(&self) -> usize {
        match self {
            Self::AddressFamily(_) | Self::Protocol(_) | Self::Port(_) => 2,
            Self::Address(_) => 16,
            Self::FirewallMark(_) | Self::Timeout(_) | Self::Netmask(_) => 4,
            Self::Scheduler(s) => s.len() + 1,
            Self::Flags { .. } => 8,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::AddressFamily(_) => IPVSServiceAttr::AddressFamily as u16,
            Self::Protocol(_) => IPVSServiceAttr::Protocol as u16,
            Self::Address(_) => IPVSServiceAttr::Address as u16,
            Self::Port(_) => IPVSServiceAttr::Port as u16,
            Self::FirewallMark(_) => IPVSServiceAttr::FirewallMark as u16,
            Self::Scheduler(_) => IPVSServiceAttr::Scheduler as u16,
            Self::Flags { .. } => IPVSServiceAttr::Flags as u16,
            Self::Timeout(_) => IPVSServiceAttr::Timeout as u16,
            Self::Netmask(_) => IPVSServiceAttr::Netmask as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::AddressFamily(v) | Self::Protocol(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Address(raw) => buffer.copy_from_slice(raw),
            Self::Port(v) => buffer.copy_from_slice(&v.to_be_bytes()),
            Self::FirewallMark(v) | Self::Timeout(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Netmask(v) => buffer.copy_from_slice(&v.to_be_bytes()),
            Self::Scheduler(s) => {
                buffer[..s.len()].copy_from_slice(s.as_bytes());
                buffer[s.len()] = 0;
            }
            Self::Flags { flags, mask } => {
                buffer[..4].copy_from_slice(&flags.to_ne_bytes());
                buffer[4..8].copy_from_slice(&mask.to_ne_bytes());
            }
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for DestNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Address(_) => 16,
            Self::Port(_) | Self::AddressFamily(_) => 2,
            Self::ForwardingMethod(_)
            | Self::Weight(_)
            | Self::UpperThreshold(_)
            | Self::LowerThreshold(_) => 4,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Address(_) => IPVSDestAttr::Address as u16,
            Self::Port(_) => IPVSDestAttr::Port as u16,
            Self::ForwardingMethod(_) => IPVSDestAttr::ForwardingMethod as u16,
            Self::Weight(_) => IPVSDestAttr::Weight as u16,
            Self::UpperThreshold(_) => IPVSDestAttr::UpperThreshold as u16,
            Self::LowerThreshold(_) => IPVSDestAttr::LowerThreshold as u16,
            Self::AddressFamily(_) => IPVSDestAttr::AddressFamily as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Address(raw) => buffer.copy_from_slice(raw),
            Self::Port(v) => buffer.copy_from_slice(&v.to_be_bytes()),
            Self::AddressFamily(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::ForwardingMethod(v)
            | Self::Weight(v)
            | Self::UpperThreshold(v)
            | Self::LowerThreshold(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for InfoNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Version(_) | Self::ConnTableSize(_) => 4,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Version(_) => IPVSInfoAttr::Version as u16,
            Self::ConnTableSize(_) => IPVSInfoAttr::ConnTableSize as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Version(v) | Self::ConnTableSize(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> DecodeError {
    DecodeError::from(format!("invalid {}: {}", what, e))
}

fn u16_attr(payload: &[u8], what: &str) -> std::result::Result<u16, DecodeError> {
    parse_u16(payload).map_err(|e| decode_err(what, e))
}

fn u32_attr(payload: &[u8], what: &str) -> std::result::Result<u32, DecodeError> {
    parse_u32(payload).map_err(|e| decode_err(what, e))
}

fn be16_attr(payload: &[u8], what: &str) -> std::result::Result<u16, DecodeError> {
    let bytes: [u8; 2] = payload.try_into().map_err(|e| decode_err(what, e))?;
    Ok(u16::from_be_bytes(bytes))
}

fn be32_attr(payload: &[u8], what: &str) -> std::result::Result<u32, DecodeError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|e| decode_err(what, e))?;
    Ok(u32::from_be_bytes(bytes))
}

fn raw_addr_attr(payload: &[u8]) -> std::result::Result<[u8; 16], DecodeError> {
    if payload.len() != 4 && payload.len() != 16 {
        return Err(DecodeError::from("invalid address length"));
    }
    let mut raw = [0u8; 16];
    raw[..payload.len()].copy_from_slice(payload);
    Ok(raw)
}

/// Walk a run of attributes, handing each `(kind, payload)` to `f`.
fn for_each_nla<F>(buf: &[u8], mut f: F) -> std::result::Result<(), DecodeError>
where
    F: FnMut(u16, &[u8]) -> std::result::Result<(), DecodeError>,
{
    for nla in NlasIterator::new(buf) {
        let nla: NlaBuffer<&[u8]> = nla.map_err(|e| decode_err("attribute", e))?;
        f(nla.kind(), nla.value())?;
    }
    Ok(())
}

impl ServiceNla {
    fn parse(kind: u16, payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        Ok(match kind {
            x if x == IPVSServiceAttr::AddressFamily as u16 => {
                Self::AddressFamily(u16_attr(payload, "address family")?)
            }
            x if x == IPVSServiceAttr::Protocol as u16 => {
                Self::Protocol(u16_attr(payload, "protocol")?)
            }
            x if x == IPVSServiceAttr::Address as u16 => Self::Address(raw_addr_attr(payload)?),
            x if x == IPVSServiceAttr::Port as u16 => Self::Port(be16_attr(payload, "port")?),
            x if x == IPVSServiceAttr::FirewallMark as u16 => {
                Self::FirewallMark(u32_attr(payload, "fwmark")?)
            }
            x if x == IPVSServiceAttr::Scheduler as u16 => {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| decode_err("scheduler name", e))?
                    .trim_end_matches('\0')
                    .to_string();
                Self::Scheduler(s)
            }
            x if x == IPVSServiceAttr::Flags as u16 => {
                if payload.len() != 8 {
                    return Err(DecodeError::from("invalid flags length"));
                }
                Self::Flags {
                    flags: u32_attr(&payload[..4], "flags")?,
                    mask: u32_attr(&payload[4..], "flags mask")?,
                }
            }
            x if x == IPVSServiceAttr::Timeout as u16 => {
                Self::Timeout(u32_attr(payload, "timeout")?)
            }
            x if x == IPVSServiceAttr::Netmask as u16 => {
                Self::Netmask(be32_attr(payload, "netmask")?)
            }
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl DestNla {
    fn parse(kind: u16, payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        Ok(match kind {
            x if x == IPVSDestAttr::Address as u16 => Self::Address(raw_addr_attr(payload)?),
            x if x == IPVSDestAttr::Port as u16 => Self::Port(be16_attr(payload, "port")?),
            x if x == IPVSDestAttr::ForwardingMethod as u16 => {
                Self::ForwardingMethod(u32_attr(payload, "forwarding method")?)
            }
            x if x == IPVSDestAttr::Weight as u16 => Self::Weight(u32_attr(payload, "weight")?),
            x if x == IPVSDestAttr::UpperThreshold as u16 => {
                Self::UpperThreshold(u32_attr(payload, "upper threshold")?)
            }
            x if x == IPVSDestAttr::LowerThreshold as u16 => {
                Self::LowerThreshold(u32_attr(payload, "lower threshold")?)
            }
            x if x == IPVSDestAttr::AddressFamily as u16 => {
                Self::AddressFamily(u16_attr(payload, "address family")?)
            }
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl InfoNla {
    fn parse(kind: u16, payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        Ok(match kind {
            x if x == IPVSInfoAttr::Version as u16 => Self::Version(u32_attr(payload, "version")?),
            x if x == IPVSInfoAttr::ConnTableSize as u16 => {
                Self::ConnTableSize(u32_attr(payload, "conn table size")?)
            }
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl netlink_packet_core::Emitable for IPVSMessage {
    fn buffer_len(&self) -> usize {
        self.nlas.iter().map(UtilsEmitable::buffer_len).sum()
    }

    fn emit(&self, buffer: &mut [u8]) {
        let mut offset = 0;
        for nla in &self.nlas {
            let len = UtilsEmitable::buffer_len(nla);
            UtilsEmitable::emit(nla, &mut buffer[offset..offset + len]);
            offset += len;
        }
    }
}

impl GenlFamily for IPVSMessage {
    fn family_name() -> &'static str {
        IPVS_GENL_NAME
    }

    fn version(&self) -> u8 {
        IPVS_GENL_VERSION
    }

    fn command(&self) -> u8 {
        self.cmd.into()
    }
}

impl ParseableParametrized<[u8], GenlHeader> for IPVSMessage {
    fn parse_with_param(buf: &[u8], header: GenlHeader) -> std::result::Result<Self, DecodeError> {
        let cmd = IPVSCommand::from_u8(header.cmd)
            .ok_or_else(|| DecodeError::from(format!("unknown IPVS command {}", header.cmd)))?;

        let mut nlas = Vec::new();
        for_each_nla(buf, |kind, payload| {
            let nla = match (cmd, kind) {
                (IPVSCommand::SetInfo | IPVSCommand::GetInfo, _) => {
                    IPVSNla::Info(InfoNla::parse(kind, payload)?)
                }
                (_, CMD_ATTR_SERVICE) => {
                    let mut attrs = Vec::new();
                    for_each_nla(payload, |k, p| {
                        attrs.push(ServiceNla::parse(k, p)?);
                        Ok(())
                    })?;
                    IPVSNla::Service(attrs)
                }
                (_, CMD_ATTR_DEST) => {
                    let mut attrs = Vec::new();
                    for_each_nla(payload, |k, p| {
                        attrs.push(DestNla::parse(k, p)?);
                        Ok(())
                    })?;
                    IPVSNla::Dest(attrs)
                }
                _ => IPVSNla::Other(kind, payload.to_vec()),
            };
            nlas.push(nla);
            Ok(())
        })?;

        Ok(Self { cmd, nlas })
    }
}

fn address_family(addr: &IpAddr) -> u16 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u16,
        IpAddr::V6(_) => libc::AF_INET6 as u16,
    }
}

fn raw_from_ip(addr: &IpAddr) -> [u8; 16] {
    let mut raw = [0u8; 16];
    match addr {
        IpAddr::V4(ip) => raw[..4].copy_from_slice(&ip.octets()),
        IpAddr::V6(ip) => raw.copy_from_slice(&ip.octets()),
    }
    raw
}

fn ip_from_raw(af: u16, raw: &[u8; 16]) -> Result<IpAddr> {
    match af as i32 {
        libc::AF_INET => Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        libc::AF_INET6 => Ok(IpAddr::V6(Ipv6Addr::from(*raw))),
        other => Err(Error::ipvs(format!("unsupported address family {}", other))),
    }
}

impl Service {
    /// Attributes identifying the service; enough for delete and dest lookups.
    pub(crate) fn key_nlas(&self) -> Vec<ServiceNla> {
        let mut nlas = vec![
            ServiceNla::AddressFamily(address_family(&self.address)),
            ServiceNla::Protocol(self.protocol.number()),
        ];
        if self.fwmark == 0 {
            nlas.push(ServiceNla::Address(raw_from_ip(&self.address)));
            nlas.push(ServiceNla::Port(self.port));
        } else {
            nlas.push(ServiceNla::FirewallMark(self.fwmark));
        }
        nlas
    }

    /// Full attribute set; the kernel rejects create/update without
    /// scheduler, flags, timeout and netmask.
    pub(crate) fn full_nlas(&self) -> Vec<ServiceNla> {
        let mut nlas = self.key_nlas();
        nlas.push(ServiceNla::Scheduler(self.scheduler.to_string()));
        nlas.push(ServiceNla::Flags {
            flags: self.flags.0,
            mask: u32::MAX,
        });
        nlas.push(ServiceNla::Timeout(self.timeout));
        nlas.push(ServiceNla::Netmask(self.netmask()));
        nlas
    }

    /// Build a service from a dump reply's attribute set.
    pub(crate) fn from_nlas(nlas: &[ServiceNla]) -> Result<Self> {
        let mut af = None;
        let mut raw = None;
        let mut service = Service::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            Protocol::TCP,
            Scheduler::WeightedLeastConnection,
        );

        for nla in nlas {
            match nla {
                ServiceNla::AddressFamily(v) => af = Some(*v),
                ServiceNla::Protocol(v) => service.protocol = Protocol::from_number(*v),
                ServiceNla::Address(r) => raw = Some(*r),
                ServiceNla::Port(v) => service.port = *v,
                ServiceNla::FirewallMark(v) => service.fwmark = *v,
                ServiceNla::Scheduler(s) => {
                    service.scheduler = s.parse().unwrap_or(Scheduler::Other(s.clone()))
                }
                ServiceNla::Flags { flags, .. } => service.flags = ServiceFlags(*flags),
                ServiceNla::Timeout(v) => service.timeout = *v,
                ServiceNla::Netmask(_) | ServiceNla::Other(_, _) => {}
            }
        }

        let af = af.ok_or_else(|| Error::ipvs("service without address family"))?;
        if let Some(raw) = raw {
            service.address = ip_from_raw(af, &raw)?;
        }
        Ok(service)
    }
}

impl Destination {
    pub(crate) fn key_nlas(&self) -> Vec<DestNla> {
        vec![
            DestNla::Address(raw_from_ip(&self.address)),
            DestNla::Port(self.port),
            DestNla::AddressFamily(address_family(&self.address)),
        ]
    }

    /// Full attribute set required by the kernel for create/update.
    pub(crate) fn full_nlas(&self) -> Vec<DestNla> {
        let mut nlas = self.key_nlas();
        nlas.push(DestNla::ForwardingMethod(self.forwarding.to_kernel()));
        nlas.push(DestNla::Weight(self.weight));
        nlas.push(DestNla::UpperThreshold(self.upper_threshold));
        nlas.push(DestNla::LowerThreshold(self.lower_threshold));
        nlas
    }

    /// Build a destination from a dump reply; `service_af` is used when the
    /// kernel predates `IPVS_DEST_ATTR_ADDR_FAMILY`.
    pub(crate) fn from_nlas(nlas: &[DestNla], service_af: u16) -> Result<Self> {
        let mut af = service_af;
        let mut raw = None;
        let mut dest = Destination {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            weight: 0,
            forwarding: ForwardingMethod::default(),
            lower_threshold: 0,
            upper_threshold: 0,
        };

        for nla in nlas {
            match nla {
                DestNla::Address(r) => raw = Some(*r),
                DestNla::Port(v) => dest.port = *v,
                DestNla::ForwardingMethod(v) => dest.forwarding = ForwardingMethod::from_kernel(*v),
                DestNla::Weight(v) => dest.weight = *v,
                DestNla::UpperThreshold(v) => dest.upper_threshold = *v,
                DestNla::LowerThreshold(v) => dest.lower_threshold = *v,
                DestNla::AddressFamily(v) => af = *v,
                DestNla::Other(_, _) => {}
            }
        }

        let raw = raw.ok_or_else(|| Error::ipvs("destination without address"))?;
        dest.address = ip_from_raw(af, &raw)?;
        Ok(dest)
    }
}

pub(crate) fn service_family(service: &Service) -> u16 {
    address_family(&service.address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::Emitable;

    fn web_service() -> Service {
        Service::new(
            "203.0.113.10".parse().unwrap(),
            80,
            Protocol::TCP,
            Scheduler::WeightedLeastConnection,
        )
    }

    #[test]
    fn test_full_service_carries_kernel_required_attrs() {
        let nlas = web_service().full_nlas();
        assert!(nlas.iter().any(|n| matches!(n, ServiceNla::Scheduler(s) if s == "wlc")));
        assert!(nlas.iter().any(|n| matches!(n, ServiceNla::Flags { .. })));
        assert!(nlas.iter().any(|n| matches!(n, ServiceNla::Timeout(0))));
        assert!(nlas.contains(&ServiceNla::Netmask(u32::MAX)));
        assert!(nlas.contains(&ServiceNla::Port(80)));
    }

    #[test]
    fn test_ipv6_netmask_is_prefix_length() {
        let svc = Service::new(
            "2001:db8::10".parse().unwrap(),
            443,
            Protocol::TCP,
            Scheduler::RoundRobin,
        );
        assert!(svc.full_nlas().contains(&ServiceNla::Netmask(128)));
    }

    #[test]
    fn test_parse_dump_reply_with_unknown_stats() {
        // A NewService reply as produced by a service dump, including a
        // stats attribute this crate does not interpret.
        let mut attrs = web_service().full_nlas();
        attrs.push(ServiceNla::Other(10, vec![0u8; 8]));
        let reply = IPVSMessage::with_nlas(IPVSCommand::NewService, vec![IPVSNla::Service(attrs)]);

        let mut buf = vec![0u8; reply.buffer_len()];
        reply.emit(&mut buf);

        let header = GenlHeader {
            cmd: IPVSCommand::NewService.into(),
            version: 1,
        };
        let parsed = IPVSMessage::parse_with_param(&buf, header).unwrap();
        let attrs: Vec<_> = parsed.services().collect();
        assert_eq!(attrs.len(), 1);

        let svc = Service::from_nlas(attrs[0]).unwrap();
        assert_eq!(svc.key(), web_service().key());
        assert_eq!(svc.scheduler, Scheduler::WeightedLeastConnection);
    }

    #[test]
    fn test_destination_falls_back_to_service_family() {
        let nlas = vec![
            DestNla::Address(raw_from_ip(&"10.0.0.5".parse().unwrap())),
            DestNla::Port(8080),
            DestNla::Weight(3),
            DestNla::ForwardingMethod(0),
        ];
        let dest = Destination::from_nlas(&nlas, libc::AF_INET as u16).unwrap();
        assert_eq!(dest.socket_addr(), "10.0.0.5:8080".parse().unwrap());
        assert_eq!(dest.weight, 3);
        assert_eq!(dest.forwarding, ForwardingMethod::Masq);
    }
}
