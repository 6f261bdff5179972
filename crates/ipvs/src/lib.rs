//! Linux IPVS (IP Virtual Server) management via generic netlink.
//!
//! The controller uses this crate to read and mutate the kernel's virtual
//! service table directly, without shelling out to `ipvsadm`.
//!
//! # Example
//!
//! ```no_run
//! use ipvs::IPVSManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut manager = IPVSManager::new()?;
//!
//! let version = manager.version()?;
//! println!("IPVS version: {}", version);
//!
//! for service in manager.get_services()? {
//!     println!("Service: {}", service);
//! }
//! # Ok(())
//! # }
//! ```

mod commands;
mod messages;
mod netlink;
mod types;

pub use commands::IPVSCommand;
pub use types::{
    Destination, ForwardingMethod, IPVSVersion, Protocol, Scheduler, Service, ServiceFlags,
    ServiceKey,
};

use common::{Error, Result};
use messages::{IPVSMessage, IPVSNla, service_family};
use netlink::NetlinkSocket;
use std::time::Duration;
use tracing::debug;

/// IPVS Manager - main interface for IPVS operations.
pub struct IPVSManager {
    socket: NetlinkSocket,
}

impl IPVSManager {
    /// Create a new IPVS manager instance.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The netlink socket cannot be created
    /// - The IPVS kernel module is not loaded
    pub fn new() -> Result<Self> {
        Self::with_timeout(netlink::DEFAULT_TIMEOUT)
    }

    /// Create a manager whose kernel requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let socket = NetlinkSocket::new(timeout)?;
        Ok(Self { socket })
    }

    /// Get the IPVS family ID.
    pub fn family_id(&self) -> u16 {
        self.socket.family_id()
    }

    /// Get the IPVS version from the kernel.
    pub fn version(&mut self) -> Result<IPVSVersion> {
        let replies = self.socket.execute(IPVSMessage::new(IPVSCommand::GetInfo))?;
        replies
            .iter()
            .find_map(IPVSMessage::version)
            .map(IPVSVersion::from_packed)
            .ok_or_else(|| Error::ipvs("GetInfo reply carried no version"))
    }

    /// Flush all services and destinations from IPVS.
    pub fn flush(&mut self) -> Result<()> {
        debug!("Flushing IPVS table");
        self.socket.execute(IPVSMessage::new(IPVSCommand::Flush))?;
        Ok(())
    }

    /// Add a new service to IPVS.
    pub fn add_service(&mut self, service: &Service) -> Result<()> {
        debug!("Adding service {}", service);
        self.service_command(IPVSCommand::NewService, IPVSNla::Service(service.full_nlas()))
    }

    /// Update an existing service in IPVS.
    pub fn update_service(&mut self, service: &Service) -> Result<()> {
        debug!("Updating service {}", service);
        self.service_command(IPVSCommand::SetService, IPVSNla::Service(service.full_nlas()))
    }

    /// Delete a service, and with it all of its destinations.
    pub fn delete_service(&mut self, service: &Service) -> Result<()> {
        debug!("Deleting service {}", service);
        self.service_command(IPVSCommand::DelService, IPVSNla::Service(service.key_nlas()))
    }

    /// Get a specific service by its key.
    pub fn get_service(&mut self, service: &Service) -> Result<Service> {
        let replies = self.socket.execute(IPVSMessage::with_nlas(
            IPVSCommand::GetService,
            vec![IPVSNla::Service(service.key_nlas())],
        ))?;
        replies
            .iter()
            .flat_map(IPVSMessage::services)
            .next()
            .map(Service::from_nlas)
            .unwrap_or_else(|| Err(Error::ipvs(format!("service {} not found", service.key()))))
    }

    /// Get all services from IPVS.
    pub fn get_services(&mut self) -> Result<Vec<Service>> {
        let replies = self.socket.dump(IPVSMessage::new(IPVSCommand::GetService))?;
        replies
            .iter()
            .flat_map(IPVSMessage::services)
            .map(Service::from_nlas)
            .collect()
    }

    /// Get all destinations of a service.
    pub fn get_destinations(&mut self, service: &Service) -> Result<Vec<Destination>> {
        let af = service_family(service);
        let replies = self.socket.dump(IPVSMessage::with_nlas(
            IPVSCommand::GetDest,
            vec![IPVSNla::Service(service.key_nlas())],
        ))?;
        replies
            .iter()
            .flat_map(IPVSMessage::destinations)
            .map(|nlas| Destination::from_nlas(nlas, af))
            .collect()
    }

    /// Add a destination to a service.
    pub fn add_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        debug!("Adding destination {} to {}", dest, service.key());
        self.dest_command(IPVSCommand::NewDest, service, dest.full_nlas())
    }

    /// Update a destination in a service.
    pub fn update_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        debug!("Updating destination {} of {}", dest, service.key());
        self.dest_command(IPVSCommand::SetDest, service, dest.full_nlas())
    }

    /// Delete a destination from a service.
    pub fn delete_destination(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        debug!("Deleting destination {} from {}", dest, service.key());
        self.dest_command(IPVSCommand::DelDest, service, dest.key_nlas())
    }

    fn service_command(&mut self, cmd: IPVSCommand, nla: IPVSNla) -> Result<()> {
        self.socket.execute(IPVSMessage::with_nlas(cmd, vec![nla]))?;
        Ok(())
    }

    fn dest_command(
        &mut self,
        cmd: IPVSCommand,
        service: &Service,
        dest: Vec<messages::DestNla>,
    ) -> Result<()> {
        self.socket.execute(IPVSMessage::with_nlas(
            cmd,
            vec![IPVSNla::Service(service.key_nlas()), IPVSNla::Dest(dest)],
        ))?;
        Ok(())
    }
}
