//! VIP-assignment source.
//!
//! The mapping `virtualIP -> namespace/serviceName[:portNameOrNumber]` is read
//! once at startup, either from a YAML/JSON file or from a directory holding
//! a mounted ConfigMap (one file per key).

use crate::types::{PortSelector, ServiceRef, VipBinding};
use common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Why a single mapping entry was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("invalid virtual IP {0:?}")]
    InvalidVip(String),

    #[error("service reference {0:?} has no namespace")]
    MissingNamespace(String),

    #[error("service reference {0:?} has an empty name")]
    EmptyName(String),

    #[error("service reference {0:?} has an empty port")]
    EmptyPort(String),
}

/// The loaded, validated VIP bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VipMap {
    bindings: Vec<VipBinding>,
    rejected: usize,
}

impl VipMap {
    /// Build a map from raw `(vip, value)` entries, logging each rejection.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut bindings = Vec::new();
        let mut rejected = 0;
        for (vip, value) in entries {
            match parse_entry(vip, value) {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    warn!(vip = %vip, value = %value, error = %e, "Rejecting VIP entry");
                    rejected += 1;
                }
            }
        }
        bindings.sort();
        Self { bindings, rejected }
    }

    /// Load from a mapping file or a ConfigMap directory.
    ///
    /// Fails when the source is unreadable or holds no valid binding.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = if path.is_dir() {
            read_dir_entries(path)?
        } else {
            read_file_entries(path)?
        };

        let map = Self::from_entries(raw.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if map.bindings.is_empty() {
            return Err(Error::config(format!(
                "{} holds no valid VIP binding ({} rejected)",
                path.display(),
                map.rejected
            )));
        }

        info!(
            source = %path.display(),
            bindings = map.bindings.len(),
            rejected = map.rejected,
            "Loaded VIP map"
        );
        Ok(map)
    }

    /// Bindings sorted by VIP.
    pub fn bindings(&self) -> &[VipBinding] {
        &self.bindings
    }

    /// Number of entries rejected while loading.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Every configured virtual IP: the set of addresses this controller owns.
    pub fn vips(&self) -> BTreeSet<IpAddr> {
        self.bindings.iter().map(|b| b.vip).collect()
    }
}

/// Parse one `vip -> namespace/name[:port]` entry.
pub fn parse_entry(vip: &str, value: &str) -> std::result::Result<VipBinding, EntryError> {
    let vip_addr: IpAddr = vip
        .trim()
        .parse()
        .map_err(|_| EntryError::InvalidVip(vip.to_string()))?;

    let value = value.trim();
    let (namespace, rest) = value
        .split_once('/')
        .filter(|(ns, _)| !ns.is_empty())
        .ok_or_else(|| EntryError::MissingNamespace(value.to_string()))?;

    let (name, port) = match rest.split_once(':') {
        Some((_, "")) => return Err(EntryError::EmptyPort(value.to_string())),
        Some((name, port)) => (name, Some(port)),
        None => (rest, None),
    };
    if name.is_empty() || name.contains('/') {
        return Err(EntryError::EmptyName(value.to_string()));
    }

    Ok(VipBinding {
        vip: vip_addr,
        service: ServiceRef::new(namespace, name),
        port: port.and_then(|p| p.parse::<PortSelector>().ok()),
    })
}

fn read_file_entries(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    // YAML is a superset of JSON, so one parser covers both formats.
    serde_yaml::from_str(&contents)
        .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
}

fn read_dir_entries(path: &Path) -> Result<BTreeMap<String, String>> {
    let dir = std::fs::read_dir(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;

    let mut entries = BTreeMap::new();
    for entry in dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Kubelet's atomic-writer bookkeeping (`..data`, timestamped dirs).
        if name.starts_with('.') {
            continue;
        }
        let file = entry.path();
        if !file.is_file() {
            continue;
        }
        let value = std::fs::read_to_string(&file)
            .map_err(|e| Error::config(format!("cannot read {}: {}", file.display(), e)))?;
        entries.insert(name, value);
    }
    Ok(entries)
}
