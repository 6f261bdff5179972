//! VIP map resolution: bindings plus cluster state to desired virtual servers.

use crate::mirror::Snapshot;
use crate::types::{
    DesiredState, PortSelector, Protocol, RealServer, VipBinding, VirtualServer, VirtualServerKey,
};
use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// A binding (or one of its ports) left out of the desired state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingWarning {
    #[error("{binding}: service not found")]
    ServiceNotFound { binding: VipBinding },

    #[error("{binding}: service declares no ports")]
    NoPorts { binding: VipBinding },

    #[error("{binding}: no service port matches {selector}")]
    PortNotFound {
        binding: VipBinding,
        selector: PortSelector,
    },

    #[error("{binding}: port {port} uses unsupported protocol {protocol}")]
    UnsupportedProtocol {
        binding: VipBinding,
        port: i32,
        protocol: String,
    },

    #[error("{binding}: port {port} is out of range")]
    InvalidPort { binding: VipBinding, port: i32 },
}

impl BindingWarning {
    pub fn binding(&self) -> &VipBinding {
        match self {
            BindingWarning::ServiceNotFound { binding }
            | BindingWarning::NoPorts { binding }
            | BindingWarning::PortNotFound { binding, .. }
            | BindingWarning::UnsupportedProtocol { binding, .. }
            | BindingWarning::InvalidPort { binding, .. } => binding,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BindingWarning::ServiceNotFound { .. } => "service_not_found",
            BindingWarning::NoPorts { .. } => "no_ports",
            BindingWarning::PortNotFound { .. } => "port_not_found",
            BindingWarning::UnsupportedProtocol { .. } => "unsupported_protocol",
            BindingWarning::InvalidPort { .. } => "invalid_port",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Weight given to every ready endpoint. Values below 1 are raised to 1.
    pub default_weight: u32,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self { default_weight: 1 }
    }
}

/// Output of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub desired: DesiredState,
    pub warnings: Vec<BindingWarning>,
}

/// Resolve every binding against `snapshot`.
///
/// Pure: equal inputs yield equal output, in canonical order.
pub fn resolve(bindings: &[VipBinding], snapshot: &Snapshot, options: &ResolveOptions) -> Resolution {
    let weight = options.default_weight.max(1);
    let mut entries = Vec::new();
    let mut warnings = Vec::new();

    for binding in bindings {
        let Some(service) = snapshot.service(&binding.service) else {
            warnings.push(BindingWarning::ServiceNotFound {
                binding: binding.clone(),
            });
            continue;
        };

        let ports: &[ServicePort] = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();
        if ports.is_empty() {
            warnings.push(BindingWarning::NoPorts {
                binding: binding.clone(),
            });
            continue;
        }

        let selected: Vec<&ServicePort> = ports
            .iter()
            .filter(|p| match &binding.port {
                None => true,
                Some(PortSelector::Number(n)) => p.port == i32::from(*n),
                Some(PortSelector::Name(name)) => p.name.as_deref() == Some(name.as_str()),
            })
            .collect();
        if let (true, Some(selector)) = (selected.is_empty(), &binding.port) {
            warnings.push(BindingWarning::PortNotFound {
                binding: binding.clone(),
                selector: selector.clone(),
            });
            continue;
        }

        let endpoints = snapshot.endpoints(&binding.service);
        for svc_port in selected {
            let Some(protocol) = Protocol::from_k8s(svc_port.protocol.as_deref()) else {
                warnings.push(BindingWarning::UnsupportedProtocol {
                    binding: binding.clone(),
                    port: svc_port.port,
                    protocol: svc_port.protocol.clone().unwrap_or_default(),
                });
                continue;
            };
            let Ok(port) = u16::try_from(svc_port.port) else {
                warnings.push(BindingWarning::InvalidPort {
                    binding: binding.clone(),
                    port: svc_port.port,
                });
                continue;
            };

            let key = VirtualServerKey {
                vip: binding.vip,
                port,
                protocol,
            };
            let real_servers = endpoints
                .map(|ep| ready_backends(ep, svc_port, protocol, weight))
                .unwrap_or_default();
            entries.push(VirtualServer::new(key, binding.service.clone(), real_servers));
        }
    }

    Resolution {
        desired: DesiredState::new(entries),
        warnings,
    }
}

/// Ready addresses of every subset exposing the Service port's target.
fn ready_backends(
    endpoints: &Endpoints,
    svc_port: &ServicePort,
    protocol: Protocol,
    weight: u32,
) -> Vec<RealServer> {
    let mut backends = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let Some(port) = subset_port(subset, svc_port, protocol) else {
            continue;
        };
        for address in subset.addresses.iter().flatten() {
            if let Ok(ip) = address.ip.parse::<IpAddr>() {
                backends.push(RealServer {
                    address: SocketAddr::new(ip, port),
                    weight,
                });
            }
        }
    }
    backends
}

/// The subset port carrying traffic for `svc_port`, if the subset has one.
fn subset_port(subset: &EndpointSubset, svc_port: &ServicePort, protocol: Protocol) -> Option<u16> {
    let svc_name = svc_port.name.as_deref().unwrap_or_default();
    subset
        .ports
        .iter()
        .flatten()
        .filter(|p| Protocol::from_k8s(p.protocol.as_deref()) == Some(protocol))
        .find(|p| {
            let ep_name = p.name.as_deref().unwrap_or_default();
            match &svc_port.target_port {
                Some(IntOrString::String(target)) => ep_name == target || ep_name == svc_name,
                Some(IntOrString::Int(n)) => p.port == *n,
                None => p.port == svc_port.port,
            }
        })
        .and_then(|p| u16::try_from(p.port).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::StateMirror;
    use crate::types::ServiceRef;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, Service, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            resource_version: Some("1".into()),
            ..Default::default()
        }
    }

    fn service(name: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: meta(name),
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn svc_port(name: Option<&str>, port: i32, target: IntOrString) -> ServicePort {
        ServicePort {
            name: name.map(Into::into),
            port,
            protocol: Some("TCP".into()),
            target_port: Some(target),
            ..Default::default()
        }
    }

    fn subset(ips: &[&str], ports: &[(Option<&str>, i32)]) -> EndpointSubset {
        EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| EndpointPort {
                        name: name.map(Into::into),
                        port: *port,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn endpoints(name: &str, subsets: Vec<EndpointSubset>) -> Endpoints {
        Endpoints {
            metadata: meta(name),
            subsets: Some(subsets),
        }
    }

    fn binding(vip: &str, name: &str, port: Option<PortSelector>) -> VipBinding {
        VipBinding {
            vip: vip.parse().unwrap(),
            service: ServiceRef::new("default", name),
            port,
        }
    }

    #[test]
    fn test_unnamed_binding_with_two_ready_endpoints() {
        let mirror = StateMirror::new();
        mirror.apply(service("web", vec![svc_port(None, 80, IntOrString::Int(8080))]));
        mirror.apply(endpoints(
            "web",
            vec![subset(&["10.0.0.6", "10.0.0.5"], &[(None, 8080)])],
        ));

        let res = resolve(
            &[binding("203.0.113.10", "web", None)],
            &mirror.snapshot(),
            &ResolveOptions::default(),
        );

        assert!(res.warnings.is_empty());
        assert_eq!(res.desired.len(), 1);
        let entry = &res.desired.entries()[0];
        assert_eq!(entry.key.port, 80);
        let addrs: Vec<String> = entry.real_servers.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.5:8080", "10.0.0.6:8080"]);
        assert!(entry.real_servers.iter().all(|r| r.weight == 1));
    }

    #[test]
    fn test_missing_service_is_omitted_with_warning() {
        let mirror = StateMirror::new();
        let res = resolve(
            &[binding("203.0.113.10", "gone", None)],
            &mirror.snapshot(),
            &ResolveOptions::default(),
        );
        assert!(res.desired.is_empty());
        assert!(matches!(res.warnings[0], BindingWarning::ServiceNotFound { .. }));
    }

    #[test]
    fn test_no_endpoints_yields_empty_entry() {
        let mirror = StateMirror::new();
        mirror.apply(service("web", vec![svc_port(None, 80, IntOrString::Int(8080))]));

        let res = resolve(
            &[binding("203.0.113.10", "web", None)],
            &mirror.snapshot(),
            &ResolveOptions::default(),
        );
        assert_eq!(res.desired.len(), 1);
        assert!(res.desired.entries()[0].real_servers.is_empty());
    }

    #[test]
    fn test_named_target_port_excludes_subsets_without_it() {
        let mirror = StateMirror::new();
        mirror.apply(service(
            "web",
            vec![svc_port(Some("http"), 80, IntOrString::String("http".into()))],
        ));
        mirror.apply(endpoints(
            "web",
            vec![
                subset(&["10.0.0.5"], &[(Some("http"), 8080)]),
                subset(&["10.0.0.7"], &[(Some("metrics"), 9090)]),
            ],
        ));

        let res = resolve(
            &[binding("203.0.113.10", "web", Some(PortSelector::Name("http".into())))],
            &mirror.snapshot(),
            &ResolveOptions::default(),
        );
        let entry = &res.desired.entries()[0];
        assert_eq!(entry.real_servers.len(), 1);
        assert_eq!(entry.real_servers[0].address.to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn test_unknown_port_selector_warns() {
        let mirror = StateMirror::new();
        mirror.apply(service("web", vec![svc_port(Some("http"), 80, IntOrString::Int(8080))]));

        let res = resolve(
            &[binding("203.0.113.10", "web", Some(PortSelector::Number(443)))],
            &mirror.snapshot(),
            &ResolveOptions::default(),
        );
        assert!(res.desired.is_empty());
        assert_eq!(
            res.warnings,
            vec![BindingWarning::PortNotFound {
                binding: binding("203.0.113.10", "web", Some(PortSelector::Number(443))),
                selector: PortSelector::Number(443),
            }]
        );
    }

    #[test]
    fn test_weight_floor_is_one() {
        let mirror = StateMirror::new();
        mirror.apply(service("web", vec![svc_port(None, 80, IntOrString::Int(8080))]));
        mirror.apply(endpoints("web", vec![subset(&["10.0.0.5"], &[(None, 8080)])]));

        let res = resolve(
            &[binding("203.0.113.10", "web", None)],
            &mirror.snapshot(),
            &ResolveOptions { default_weight: 0 },
        );
        assert_eq!(res.desired.entries()[0].real_servers[0].weight, 1);
    }
}
