//! In-memory mirror of the cluster objects the resolver reads.
//!
//! Writers replace the current snapshot copy-on-write; readers take an
//! `Arc<Snapshot>` that never changes while they hold it.

use crate::types::{NodeRoster, ServiceRef};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// Highest priority keepalived accepts for a non-owner.
const MAX_PRIORITY: u8 = 254;

/// A consistent view of Services, Endpoints and Nodes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    services: BTreeMap<String, Service>,
    endpoints: BTreeMap<String, Endpoints>,
    nodes: BTreeMap<String, Node>,
}

impl Snapshot {
    /// Monotonic version, bumped on every effective change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn service(&self, r: &ServiceRef) -> Option<&Service> {
        self.services.get(&r.key())
    }

    pub fn endpoints(&self, r: &ServiceRef) -> Option<&Endpoints> {
        self.endpoints.get(&r.key())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Derive this node's VRRP roster.
    ///
    /// Node addresses are sorted and the local node's priority is
    /// `base_priority` plus its position, so every node computes the same,
    /// distinct priorities. Returns `None` while the local node is unknown
    /// or has no usable address.
    pub fn roster(&self, local: &str, base_priority: u8) -> Option<NodeRoster> {
        let mut addrs: Vec<(IpAddr, &str)> = self
            .nodes
            .iter()
            .filter_map(|(name, node)| node_address(node).map(|ip| (ip, name.as_str())))
            .collect();
        addrs.sort();

        let position = addrs.iter().position(|(_, name)| *name == local)?;
        let offset = u8::try_from(position).unwrap_or(u8::MAX);

        Some(NodeRoster {
            node: local.to_string(),
            address: addrs[position].0,
            peers: addrs
                .iter()
                .filter(|(_, name)| *name != local)
                .map(|(ip, _)| *ip)
                .collect(),
            priority: base_priority.saturating_add(offset).min(MAX_PRIORITY),
        })
    }
}

/// Preferred address of a node: InternalIP, else ExternalIP.
fn node_address(node: &Node) -> Option<IpAddr> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["InternalIP", "ExternalIP"].iter().find_map(|kind| {
        addresses
            .iter()
            .filter(|a| a.type_ == *kind)
            .find_map(|a| a.address.parse().ok())
    })
}

/// Kinds of object stored in a [`Snapshot`].
pub trait Mirrored: ResourceExt + Clone {
    fn store(snapshot: &Snapshot) -> &BTreeMap<String, Self>;
    fn store_mut(snapshot: &mut Snapshot) -> &mut BTreeMap<String, Self>;

    /// `namespace/name`, or just the name for cluster-scoped kinds.
    fn mirror_key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name_any()),
            None => self.name_any(),
        }
    }
}

impl Mirrored for Service {
    fn store(snapshot: &Snapshot) -> &BTreeMap<String, Self> {
        &snapshot.services
    }

    fn store_mut(snapshot: &mut Snapshot) -> &mut BTreeMap<String, Self> {
        &mut snapshot.services
    }
}

impl Mirrored for Endpoints {
    fn store(snapshot: &Snapshot) -> &BTreeMap<String, Self> {
        &snapshot.endpoints
    }

    fn store_mut(snapshot: &mut Snapshot) -> &mut BTreeMap<String, Self> {
        &mut snapshot.endpoints
    }
}

impl Mirrored for Node {
    fn store(snapshot: &Snapshot) -> &BTreeMap<String, Self> {
        &snapshot.nodes
    }

    fn store_mut(snapshot: &mut Snapshot) -> &mut BTreeMap<String, Self> {
        &mut snapshot.nodes
    }
}

fn same_version<K: ResourceExt>(a: &K, b: &K) -> bool {
    match (a.resource_version(), b.resource_version()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Versioned, copy-on-write store fed by watch callbacks.
#[derive(Debug, Default)]
pub struct StateMirror {
    current: RwLock<Arc<Snapshot>>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert or update an object. Returns whether the snapshot changed;
    /// re-delivery of the same resource version is a no-op.
    pub fn apply<K: Mirrored>(&self, obj: K) -> bool {
        let key = obj.mirror_key();
        self.update(|snap| {
            if K::store(snap).get(&key).is_some_and(|old| same_version(old, &obj)) {
                return None;
            }
            Some(move |snap: &mut Snapshot| {
                K::store_mut(snap).insert(key, obj);
            })
        })
    }

    /// Remove an object. Removing an unknown object is a no-op.
    pub fn delete<K: Mirrored>(&self, obj: &K) -> bool {
        let key = obj.mirror_key();
        self.update(|snap| {
            if !K::store(snap).contains_key(&key) {
                return None;
            }
            Some(move |snap: &mut Snapshot| {
                K::store_mut(snap).remove(&key);
            })
        })
    }

    /// Replace every object of one kind after a relist.
    pub fn replace<K: Mirrored>(&self, objs: Vec<K>) -> bool {
        let next: BTreeMap<String, K> = objs.into_iter().map(|o| (o.mirror_key(), o)).collect();
        self.update(|snap| {
            let current = K::store(snap);
            let unchanged = current.len() == next.len()
                && current
                    .iter()
                    .zip(next.iter())
                    .all(|((ka, a), (kb, b))| ka == kb && same_version(a, b));
            if unchanged {
                return None;
            }
            Some(move |snap: &mut Snapshot| {
                *K::store_mut(snap) = next;
            })
        })
    }

    /// Decide against the current snapshot, then mutate a private copy
    /// (or the snapshot itself when no reader holds it).
    fn update<F, M>(&self, decide: F) -> bool
    where
        F: FnOnce(&Snapshot) -> Option<M>,
        M: FnOnce(&mut Snapshot),
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let Some(mutate) = decide(&**guard) else {
            return false;
        };
        let snap = Arc::make_mut(&mut *guard);
        mutate(snap);
        snap.version += 1;
        trace!(version = snap.version, "State mirror updated");
        true
    }
}
