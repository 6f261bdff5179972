//! Load-balancer table synchronizer.
//!
//! Converges the kernel IPVS table to a [`DesiredState`]: live state is read
//! fresh every pass, then owned entries are deleted, created and reconciled
//! in that order. Only virtual servers whose address is a configured VIP are
//! ever touched.

use crate::types::{DesiredState, VirtualServer};
use common::{Error, Result};
use ipvs::{Destination, ForwardingMethod, IPVSManager, Scheduler, Service, ServiceFlags, ServiceKey};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Access to a kernel load-balancer table.
pub trait LoadBalancerTable: Send {
    fn services(&mut self) -> Result<Vec<Service>>;
    fn destinations(&mut self, service: &Service) -> Result<Vec<Destination>>;
    fn add_service(&mut self, service: &Service) -> Result<()>;
    fn update_service(&mut self, service: &Service) -> Result<()>;
    fn delete_service(&mut self, service: &Service) -> Result<()>;
    fn add_destination(&mut self, service: &Service, dest: &Destination) -> Result<()>;
    fn update_destination(&mut self, service: &Service, dest: &Destination) -> Result<()>;
    fn delete_destination(&mut self, service: &Service, dest: &Destination) -> Result<()>;
}

impl LoadBalancerTable for IPVSManager {
    fn services(&mut self) -> Result<Vec<Service>> {
        self.get_services()
    }

    fn destinations(&mut self, service: &Service) -> Result<Vec<Destination>> {
        self.get_destinations(service)
    }

    fn add_service(&mut self, service: &Service) -> Result<()> {
        IPVSManager::add_service(self, service)
    }

    fn update_service(&mut self, service: &Service) -> Result<()> {
        IPVSManager::update_service(self, service)
    }

    fn delete_service(&mut self, service: &Service) -> Result<()> {
        IPVSManager::delete_service(self, service)
    }

    fn add_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        IPVSManager::add_destination(self, service, dest)
    }

    fn update_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        IPVSManager::update_destination(self, service, dest)
    }

    fn delete_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        IPVSManager::delete_destination(self, service, dest)
    }
}

/// Attributes applied to every virtual server this controller creates.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub scheduler: Scheduler,
    pub forwarding: ForwardingMethod,
    /// Client affinity timeout; `None` disables persistence.
    pub persistence_timeout: Option<Duration>,
    /// Extra attempts for a failed mutation
    pub op_retries: u32,
    /// Delay between attempts, multiplied by the attempt number
    pub retry_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            scheduler: Scheduler::WeightedLeastConnection,
            forwarding: ForwardingMethod::Masq,
            persistence_timeout: None,
            op_retries: 2,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// A mutation that failed after its retries.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub target: String,
    pub error: String,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub services_created: usize,
    pub services_updated: usize,
    pub services_deleted: usize,
    pub destinations_added: usize,
    pub destinations_updated: usize,
    pub destinations_removed: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    /// Kernel mutations that succeeded.
    pub fn mutations(&self) -> usize {
        self.services_created
            + self.services_updated
            + self.services_deleted
            + self.destinations_added
            + self.destinations_updated
            + self.destinations_removed
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "services +{} ~{} -{}, destinations +{} ~{} -{}, {} failed",
            self.services_created,
            self.services_updated,
            self.services_deleted,
            self.destinations_added,
            self.destinations_updated,
            self.destinations_removed,
            self.failures.len()
        )
    }
}

enum Counter {
    ServiceCreated,
    ServiceUpdated,
    ServiceDeleted,
    DestAdded,
    DestUpdated,
    DestRemoved,
}

/// The single writer of the kernel load-balancer table.
pub struct Synchronizer<T> {
    table: T,
    settings: SyncSettings,
    owned: BTreeSet<IpAddr>,
    last_report: SyncReport,
}

impl<T: LoadBalancerTable> Synchronizer<T> {
    /// `owned` is the set of configured VIPs; live entries on any other
    /// address are never read back into the diff.
    pub fn new(table: T, settings: SyncSettings, owned: BTreeSet<IpAddr>) -> Self {
        Self {
            table,
            settings,
            owned,
            last_report: SyncReport::default(),
        }
    }

    /// Report of the most recent pass, successful or not.
    pub fn last_report(&self) -> &SyncReport {
        &self.last_report
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut T {
        &mut self.table
    }

    /// Converge the table to `desired`.
    ///
    /// Every mutation is attempted even when earlier ones fail; the pass
    /// fails if any did.
    pub fn apply(&mut self, desired: &DesiredState) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let live: BTreeMap<ServiceKey, Service> = self
            .table
            .services()?
            .into_iter()
            .filter(|s| s.fwmark == 0 && self.owned.contains(&s.address))
            .map(|s| (s.key(), s))
            .collect();

        let wanted: BTreeMap<ServiceKey, (Service, &VirtualServer)> = desired
            .entries()
            .iter()
            .filter(|vs| {
                let owned = self.owned.contains(&vs.key.vip);
                if !owned {
                    warn!(key = %vs.key, "Skipping virtual server on an unowned address");
                }
                owned
            })
            .map(|vs| {
                let svc = self.service_for(vs);
                (svc.key(), (svc, vs))
            })
            .collect();

        for (key, svc) in &live {
            if !wanted.contains_key(key) {
                info!(service = %key, "Deleting virtual server");
                self.mutate(&mut report, Counter::ServiceDeleted, key.to_string(), |t| {
                    t.delete_service(svc)
                });
            }
        }

        for (key, (svc, vs)) in &wanted {
            if live.contains_key(key) {
                continue;
            }
            info!(service = %key, backends = vs.real_servers.len(), "Creating virtual server");
            let created =
                self.mutate(&mut report, Counter::ServiceCreated, key.to_string(), |t| {
                    t.add_service(svc)
                });
            if !created {
                continue;
            }
            for dest in self.destinations_for(vs) {
                self.mutate(&mut report, Counter::DestAdded, dest_target(key, &dest), |t| {
                    t.add_destination(svc, &dest)
                });
            }
        }

        for (key, (svc, vs)) in &wanted {
            let Some(current) = live.get(key) else {
                continue;
            };
            if svc.attributes_differ(current) {
                info!(service = %key, "Updating virtual server attributes");
                self.mutate(&mut report, Counter::ServiceUpdated, key.to_string(), |t| {
                    t.update_service(svc)
                });
            }
            if let Err(e) = self.reconcile_destinations(&mut report, svc, vs) {
                warn!(service = %key, error = %e, "Cannot list real servers");
                report.failures.push(SyncFailure {
                    target: key.to_string(),
                    error: e.to_string(),
                });
            }
        }

        self.last_report = report.clone();
        if report.failures.is_empty() {
            if report.mutations() > 0 {
                info!(%report, "Load-balancer table synchronized");
            } else {
                debug!("Load-balancer table already converged");
            }
            Ok(report)
        } else {
            warn!(%report, "Load-balancer sync incomplete");
            Err(Error::sync(format!(
                "{} of {} mutations failed",
                report.failures.len(),
                report.failures.len() + report.mutations()
            )))
        }
    }

    fn reconcile_destinations(
        &mut self,
        report: &mut SyncReport,
        svc: &Service,
        vs: &VirtualServer,
    ) -> Result<()> {
        let key = svc.key();
        let live: BTreeMap<SocketAddr, Destination> = self
            .table
            .destinations(svc)?
            .into_iter()
            .map(|d| (d.socket_addr(), d))
            .collect();
        let wanted: BTreeMap<SocketAddr, Destination> = self
            .destinations_for(vs)
            .into_iter()
            .map(|d| (d.socket_addr(), d))
            .collect();

        for (addr, dest) in &live {
            if !wanted.contains_key(addr) {
                debug!(service = %key, backend = %addr, "Removing real server");
                self.mutate(report, Counter::DestRemoved, dest_target(&key, dest), |t| {
                    t.delete_destination(svc, dest)
                });
            }
        }
        for (addr, dest) in &wanted {
            match live.get(addr) {
                None => {
                    debug!(service = %key, backend = %addr, "Adding real server");
                    self.mutate(report, Counter::DestAdded, dest_target(&key, dest), |t| {
                        t.add_destination(svc, dest)
                    });
                }
                Some(current)
                    if current.weight != dest.weight || current.forwarding != dest.forwarding =>
                {
                    debug!(service = %key, backend = %addr, weight = dest.weight, "Updating real server");
                    self.mutate(report, Counter::DestUpdated, dest_target(&key, dest), |t| {
                        t.update_destination(svc, dest)
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn service_for(&self, vs: &VirtualServer) -> Service {
        let mut svc = Service::new(
            vs.key.vip,
            vs.key.port,
            vs.key.protocol.into(),
            self.settings.scheduler.clone(),
        );
        if let Some(timeout) = self.settings.persistence_timeout {
            svc.flags = ServiceFlags(ServiceFlags::PERSISTENT);
            svc.timeout = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        }
        svc
    }

    fn destinations_for(&self, vs: &VirtualServer) -> Vec<Destination> {
        vs.real_servers
            .iter()
            .map(|rs| Destination::new(rs.address, rs.weight, self.settings.forwarding))
            .collect()
    }

    /// Run one mutation with retries. Returns whether it succeeded.
    fn mutate<F>(&mut self, report: &mut SyncReport, counter: Counter, target: String, mut op: F) -> bool
    where
        F: FnMut(&mut T) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            match op(&mut self.table) {
                Ok(()) => {
                    let slot = match counter {
                        Counter::ServiceCreated => &mut report.services_created,
                        Counter::ServiceUpdated => &mut report.services_updated,
                        Counter::ServiceDeleted => &mut report.services_deleted,
                        Counter::DestAdded => &mut report.destinations_added,
                        Counter::DestUpdated => &mut report.destinations_updated,
                        Counter::DestRemoved => &mut report.destinations_removed,
                    };
                    *slot += 1;
                    return true;
                }
                Err(e) if attempt < self.settings.op_retries && is_retriable(&e) => {
                    attempt += 1;
                    debug!(entry = %target, attempt, error = %e, "Retrying kernel mutation");
                    std::thread::sleep(self.settings.retry_delay * attempt);
                }
                Err(e) => {
                    warn!(entry = %target, error = %e, "Kernel mutation failed");
                    report.failures.push(SyncFailure {
                        target,
                        error: e.to_string(),
                    });
                    return false;
                }
            }
        }
    }
}

/// Rejections that will not change on retry within the same pass.
fn is_retriable(e: &Error) -> bool {
    !matches!(
        e.errno(),
        Some(libc::EEXIST) | Some(libc::ENOENT) | Some(libc::ESRCH) | Some(libc::EINVAL)
    )
}

fn dest_target(key: &ServiceKey, dest: &Destination) -> String {
    format!("{} -> {}", key, dest.socket_addr())
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory table used by unit tests.

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemoryTable {
        pub services: BTreeMap<ServiceKey, (Service, BTreeMap<SocketAddr, Destination>)>,
        pub mutations: usize,
    }

    impl MemoryTable {
        fn entry(&mut self, svc: &Service) -> Result<&mut (Service, BTreeMap<SocketAddr, Destination>)> {
            self.services
                .get_mut(&svc.key())
                .ok_or_else(|| Error::kernel("lookup", libc::ESRCH))
        }
    }

    impl LoadBalancerTable for MemoryTable {
        fn services(&mut self) -> Result<Vec<Service>> {
            Ok(self.services.values().map(|(s, _)| s.clone()).collect())
        }

        fn destinations(&mut self, service: &Service) -> Result<Vec<Destination>> {
            Ok(self.entry(service)?.1.values().cloned().collect())
        }

        fn add_service(&mut self, service: &Service) -> Result<()> {
            if self.services.contains_key(&service.key()) {
                return Err(Error::kernel("NewService", libc::EEXIST));
            }
            self.mutations += 1;
            self.services
                .insert(service.key(), (service.clone(), BTreeMap::new()));
            Ok(())
        }

        fn update_service(&mut self, service: &Service) -> Result<()> {
            self.entry(service)?.0 = service.clone();
            self.mutations += 1;
            Ok(())
        }

        fn delete_service(&mut self, service: &Service) -> Result<()> {
            self.services
                .remove(&service.key())
                .ok_or_else(|| Error::kernel("DelService", libc::ESRCH))?;
            self.mutations += 1;
            Ok(())
        }

        fn add_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
            let dests = &mut self.entry(service)?.1;
            if dests.contains_key(&dest.socket_addr()) {
                return Err(Error::kernel("NewDest", libc::EEXIST));
            }
            dests.insert(dest.socket_addr(), dest.clone());
            self.mutations += 1;
            Ok(())
        }

        fn update_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
            self.entry(service)?.1.insert(dest.socket_addr(), dest.clone());
            self.mutations += 1;
            Ok(())
        }

        fn delete_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
            self.entry(service)?
                .1
                .remove(&dest.socket_addr())
                .ok_or_else(|| Error::kernel("DelDest", libc::ENOENT))?;
            self.mutations += 1;
            Ok(())
        }
    }
}
