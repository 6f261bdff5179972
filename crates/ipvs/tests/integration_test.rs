//! Integration tests for IPVS operations.
//!
//! These tests require:
//! - Root privileges (CAP_NET_ADMIN)
//! - IPVS kernel module loaded (modprobe ip_vs)
//! - Set IPVS_TEST_ENABLED=1 environment variable to run
//!
//! They share the kernel table, so run them single-threaded:
//! sudo -E cargo test --test integration_test -- --test-threads=1

use ipvs::{Destination, ForwardingMethod, IPVSManager, Protocol, Scheduler, Service, ServiceFlags};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn should_run_tests() -> bool {
    std::env::var("IPVS_TEST_ENABLED").is_ok()
}

macro_rules! skip_unless_enabled {
    () => {
        if !should_run_tests() {
            eprintln!("Skipping test (set IPVS_TEST_ENABLED=1 to enable)");
            return;
        }
    };
}

fn vip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 255, 0, last))
}

#[test]
fn test_ipvs_version() {
    skip_unless_enabled!();

    let mut manager = IPVSManager::new().expect("Failed to create manager");
    let version = manager.version().expect("Failed to get IPVS version");
    assert!(version.major > 0 || version.minor > 0);
}

#[test]
fn test_service_lifecycle() {
    skip_unless_enabled!();

    let mut manager = IPVSManager::new().expect("Failed to create manager");
    manager.flush().expect("Failed to flush");

    let service = Service::new(vip(1), 80, Protocol::TCP, Scheduler::RoundRobin);
    manager.add_service(&service).expect("Failed to add service");

    let mut updated = service.clone();
    updated.scheduler = Scheduler::WeightedRoundRobin;
    manager.update_service(&updated).expect("Failed to update service");

    let live = manager.get_service(&service).expect("Failed to get service");
    assert_eq!(live.scheduler, Scheduler::WeightedRoundRobin);
    assert!(!updated.attributes_differ(&live));

    let dest = Destination::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 8080),
        100,
        ForwardingMethod::Masq,
    );
    manager.add_destination(&updated, &dest).expect("Failed to add destination");

    let mut heavier = dest.clone();
    heavier.weight = 200;
    manager
        .update_destination(&updated, &heavier)
        .expect("Failed to update destination");

    let dests = manager.get_destinations(&updated).expect("Failed to list destinations");
    assert_eq!(dests.len(), 1);
    assert_eq!(dests[0].socket_addr(), dest.socket_addr());
    assert_eq!(dests[0].weight, 200);

    manager
        .delete_destination(&updated, &heavier)
        .expect("Failed to delete destination");
    manager.delete_service(&updated).expect("Failed to delete service");

    assert!(manager.get_services().expect("Failed to list").is_empty());
}

#[test]
fn test_duplicate_service_reports_errno() {
    skip_unless_enabled!();

    let mut manager = IPVSManager::new().expect("Failed to create manager");
    manager.flush().expect("Failed to flush");

    let service = Service::new(vip(2), 53, Protocol::UDP, Scheduler::SourceHashing);
    manager.add_service(&service).expect("Failed to add UDP service");

    let err = manager.add_service(&service).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EEXIST));

    manager.delete_service(&service).expect("Failed to delete service");
}

#[test]
fn test_persistent_service_with_multiple_destinations() {
    skip_unless_enabled!();

    let mut manager = IPVSManager::new().expect("Failed to create manager");
    manager.flush().expect("Failed to flush");

    let mut service = Service::new(vip(3), 443, Protocol::TCP, Scheduler::WeightedLeastConnection);
    service.flags = ServiceFlags(ServiceFlags::PERSISTENT);
    service.timeout = 300;
    manager.add_service(&service).expect("Failed to add service");

    for i in 1..=3u8 {
        let dest = Destination::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10 + i)), 8443),
            1,
            ForwardingMethod::Route,
        );
        manager
            .add_destination(&service, &dest)
            .unwrap_or_else(|e| panic!("Failed to add destination {}: {}", i, e));
    }

    let services = manager.get_services().expect("Failed to list services");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].timeout, 300);
    assert!(services[0].flags.is_persistent());

    let dests = manager.get_destinations(&service).expect("Failed to list destinations");
    assert_eq!(dests.len(), 3);
    assert!(dests.iter().all(|d| d.forwarding == ForwardingMethod::Route));

    manager.flush().expect("Failed to flush");
}
