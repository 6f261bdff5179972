//! Host preconditions applied once at startup.

use common::{Error, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Kernel settings keepalived and IPVS need on every node.
pub const SYSCTLS: &[(&str, &str)] = &[
    // Bind VIPs that are not (yet) configured locally.
    ("net/ipv4/ip_nonlocal_bind", "1"),
    // Keep connection tracking for IPVS traffic so NAT works.
    ("net/ipv4/vs/conntrack", "1"),
];

#[derive(Debug, Clone)]
pub struct HostSetup {
    pub load_module: bool,
    pub modprobe: PathBuf,
    /// Root of the sysctl tree, normally `/proc/sys`
    pub sysctl_root: PathBuf,
}

impl Default for HostSetup {
    fn default() -> Self {
        Self {
            load_module: true,
            modprobe: PathBuf::from("modprobe"),
            sysctl_root: PathBuf::from("/proc/sys"),
        }
    }
}

impl HostSetup {
    /// Load `ip_vs` and apply [`SYSCTLS`]. Any failure is fatal.
    pub async fn prepare(&self) -> Result<()> {
        if self.load_module {
            self.load_ip_vs().await?;
        } else {
            debug!("Skipping ip_vs module load");
        }
        for (key, value) in SYSCTLS {
            self.write_sysctl(key, value)?;
        }
        Ok(())
    }

    async fn load_ip_vs(&self) -> Result<()> {
        let status = Command::new(&self.modprobe)
            .arg("ip_vs")
            .status()
            .await
            .map_err(|e| Error::host(format!("cannot run {}: {}", self.modprobe.display(), e)))?;
        if !status.success() {
            return Err(Error::host(format!("modprobe ip_vs failed: {}", status)));
        }
        info!("Loaded ip_vs kernel module");
        Ok(())
    }

    fn write_sysctl(&self, key: &str, value: &str) -> Result<()> {
        let path = self.sysctl_root.join(key);
        let current = std::fs::read_to_string(&path)
            .map_err(|e| Error::host(format!("cannot read sysctl {}: {}", key, e)))?;
        if current.trim() == value {
            debug!(key, value, "sysctl already set");
            return Ok(());
        }
        std::fs::write(&path, value)
            .map_err(|e| Error::host(format!("cannot set sysctl {}={}: {}", key, value, e)))?;
        info!(key, value, "Adjusted sysctl");
        Ok(())
    }
}
