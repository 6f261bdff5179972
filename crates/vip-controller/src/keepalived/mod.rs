//! VRRP configuration and lifecycle management through keepalived.

pub mod manager;
pub mod render;
pub mod supervisor;

pub use manager::{ApplyOutcome, KeepalivedManager, Lifecycle, ManagerSettings};
pub use render::{Grouping, KeepalivedConfig, RenderOptions, VrrpInstance};
pub use supervisor::{Daemon, ProcessDaemon, SupervisorConfig};

use crate::types::DesiredState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Which nodes carry kernel rules for a VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemotionPolicy {
    /// Every node keeps rules for every VIP, so a promoted node already has
    /// them in place.
    #[default]
    Retain,
    /// Only VIPs whose instance is MASTER here get rules; demotion converges
    /// local entries away.
    Flush,
}

impl DemotionPolicy {
    /// The part of `desired` this node should program.
    pub fn effective(self, desired: &DesiredState, master_vips: &BTreeSet<IpAddr>) -> DesiredState {
        match self {
            DemotionPolicy::Retain => desired.clone(),
            DemotionPolicy::Flush => desired.retain_vips(|vip| master_vips.contains(vip)),
        }
    }
}
