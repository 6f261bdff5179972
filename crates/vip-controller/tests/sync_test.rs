//! End-to-end reconciliation: VIP map and cluster objects to kernel entries

use common::{Error, Result};
use ipvs::{Destination, Scheduler, Service, ServiceKey};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service as KubeService, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use vip_controller::resolver::ResolveOptions;
use vip_controller::sync::SyncSettings;
use vip_controller::{LoadBalancerTable, StateMirror, Synchronizer, VipMap, resolve};

/// Kernel table stand-in keyed like IPVS.
#[derive(Default)]
struct FakeTable {
    services: BTreeMap<ServiceKey, (Service, BTreeMap<SocketAddr, Destination>)>,
}

impl FakeTable {
    fn dests(&self, vip: &str, port: u16) -> Vec<SocketAddr> {
        let key = ServiceKey {
            address: vip.parse().unwrap(),
            port,
            protocol: ipvs::Protocol::TCP,
        };
        self.services
            .get(&key)
            .map(|(_, d)| d.keys().copied().collect())
            .unwrap_or_default()
    }

    fn lookup(&mut self, service: &Service) -> Result<&mut (Service, BTreeMap<SocketAddr, Destination>)> {
        self.services
            .get_mut(&service.key())
            .ok_or_else(|| Error::kernel("GetService", libc::ESRCH))
    }
}

impl LoadBalancerTable for FakeTable {
    fn services(&mut self) -> Result<Vec<Service>> {
        Ok(self.services.values().map(|(s, _)| s.clone()).collect())
    }

    fn destinations(&mut self, service: &Service) -> Result<Vec<Destination>> {
        Ok(self.lookup(service)?.1.values().cloned().collect())
    }

    fn add_service(&mut self, service: &Service) -> Result<()> {
        self.services
            .insert(service.key(), (service.clone(), BTreeMap::new()));
        Ok(())
    }

    fn update_service(&mut self, service: &Service) -> Result<()> {
        self.lookup(service)?.0 = service.clone();
        Ok(())
    }

    fn delete_service(&mut self, service: &Service) -> Result<()> {
        self.services.remove(&service.key());
        Ok(())
    }

    fn add_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.lookup(service)?.1.insert(dest.socket_addr(), dest.clone());
        Ok(())
    }

    fn update_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.add_destination(service, dest)
    }

    fn delete_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.lookup(service)?.1.remove(&dest.socket_addr());
        Ok(())
    }
}

fn meta(name: &str, rv: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some("default".into()),
        resource_version: Some(rv.into()),
        ..Default::default()
    }
}

fn web_service() -> KubeService {
    KubeService {
        metadata: meta("web", "1"),
        spec: Some(ServiceSpec {
            ports: Some(vec![
                ServicePort {
                    name: Some("http".into()),
                    port: 80,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::String("http".into())),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".into()),
                    port: 443,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(8443)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn web_endpoints(rv: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: meta("web", rv),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![
                EndpointPort {
                    name: Some("http".into()),
                    port: 8080,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                },
                EndpointPort {
                    name: Some("https".into()),
                    port: 8443,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }]),
    }
}

fn synchronizer(map: &VipMap) -> Synchronizer<FakeTable> {
    Synchronizer::new(
        FakeTable::default(),
        SyncSettings {
            scheduler: Scheduler::RoundRobin,
            retry_delay: Duration::ZERO,
            ..Default::default()
        },
        map.vips(),
    )
}

#[test]
fn test_service_ports_become_virtual_servers() {
    let map = VipMap::from_entries([("203.0.113.10", "default/web")]);
    let mirror = StateMirror::new();
    mirror.apply(web_service());
    mirror.apply(web_endpoints("1", &["10.1.0.5", "10.1.0.6"]));

    let resolution = resolve(map.bindings(), &mirror.snapshot(), &ResolveOptions::default());
    assert!(resolution.warnings.is_empty());

    let mut sync = synchronizer(&map);
    let report = sync.apply(&resolution.desired).unwrap();
    assert_eq!(report.services_created, 2);
    assert_eq!(report.destinations_added, 4);

    let table = sync.table();
    assert_eq!(
        table.dests("203.0.113.10", 80),
        vec!["10.1.0.5:8080".parse().unwrap(), "10.1.0.6:8080".parse().unwrap()]
    );
    assert_eq!(table.dests("203.0.113.10", 443).len(), 2);
}

#[test]
fn test_endpoint_change_converges_kernel_table() {
    let map = VipMap::from_entries([("203.0.113.10", "default/web:http")]);
    let mirror = StateMirror::new();
    mirror.apply(web_service());
    mirror.apply(web_endpoints("1", &["10.1.0.5", "10.1.0.6"]));

    let mut sync = synchronizer(&map);
    let options = ResolveOptions::default();
    sync.apply(&resolve(map.bindings(), &mirror.snapshot(), &options).desired)
        .unwrap();

    assert!(mirror.apply(web_endpoints("2", &["10.1.0.6", "10.1.0.7"])));
    let report = sync
        .apply(&resolve(map.bindings(), &mirror.snapshot(), &options).desired)
        .unwrap();
    assert_eq!(report.destinations_added, 1);
    assert_eq!(report.destinations_removed, 1);
    assert_eq!(
        sync.table().dests("203.0.113.10", 80),
        vec!["10.1.0.6:8080".parse().unwrap(), "10.1.0.7:8080".parse().unwrap()]
    );
    // Port selector limits the binding to the http port.
    assert!(sync.table().dests("203.0.113.10", 443).is_empty());
}

#[test]
fn test_deleted_service_removes_its_entries() {
    let map = VipMap::from_entries([("203.0.113.10", "default/web")]);
    let mirror = StateMirror::new();
    let service = web_service();
    mirror.apply(service.clone());
    mirror.apply(web_endpoints("1", &["10.1.0.5"]));

    let mut sync = synchronizer(&map);
    let options = ResolveOptions::default();
    sync.apply(&resolve(map.bindings(), &mirror.snapshot(), &options).desired)
        .unwrap();
    assert_eq!(sync.table().services.len(), 2);

    assert!(mirror.delete(&service));
    let resolution = resolve(map.bindings(), &mirror.snapshot(), &options);
    assert_eq!(resolution.warnings.len(), 1);

    let report = sync.apply(&resolution.desired).unwrap();
    assert_eq!(report.services_deleted, 2);
    assert!(sync.table().services.is_empty());
}
