//! Kubernetes watchers feeding the state mirror.

use crate::mirror::{Mirrored, StateMirror};
use crate::queue::SyncQueue;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scope of the watches.
#[derive(Debug, Clone, Default)]
pub struct WatchSettings {
    /// Namespace for Services and Endpoints; all namespaces when `None`.
    pub namespace: Option<String>,
    /// Label selector restricting which Nodes join the VRRP roster.
    pub node_selector: Option<String>,
}

/// Completion of the initial list of every watched kind.
///
/// Each token is cancelled once its watcher reaches its first `InitDone`.
/// Until all three are, the mirror is partial and must not drive the kernel
/// table.
#[derive(Debug, Clone, Default)]
pub struct CacheReadiness {
    services: CancellationToken,
    endpoints: CancellationToken,
    nodes: CancellationToken,
}

impl CacheReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness for a mirror that is filled by the caller.
    pub fn synced() -> Self {
        let readiness = Self::default();
        readiness.services.cancel();
        readiness.endpoints.cancel();
        readiness.nodes.cancel();
        readiness
    }

    pub fn is_ready(&self) -> bool {
        self.services.is_cancelled() && self.endpoints.is_cancelled() && self.nodes.is_cancelled()
    }

    /// Resolve once every kind has completed its initial list.
    pub async fn wait(&self) {
        self.services.cancelled().await;
        self.endpoints.cancelled().await;
        self.nodes.cancelled().await;
    }
}

/// Objects of a relist, held until the relist completes.
struct Relist<K> {
    buffer: Option<Vec<K>>,
}

impl<K> Default for Relist<K> {
    fn default() -> Self {
        Self { buffer: None }
    }
}

/// Fold one watch event into the mirror. Returns whether it changed.
fn apply_event<K: Mirrored>(
    mirror: &StateMirror,
    relist: &mut Relist<K>,
    event: watcher::Event<K>,
) -> bool {
    match event {
        watcher::Event::Apply(obj) => mirror.apply(obj),
        watcher::Event::Delete(obj) => mirror.delete(&obj),
        watcher::Event::Init => {
            relist.buffer = Some(Vec::new());
            false
        }
        watcher::Event::InitApply(obj) => {
            relist.buffer.get_or_insert_with(Vec::new).push(obj);
            false
        }
        watcher::Event::InitDone => {
            let objs = relist.buffer.take().unwrap_or_default();
            mirror.replace(objs)
        }
    }
}

/// Mirror one kind until cancelled, enqueueing a sync on every change.
pub async fn run_watcher<K>(
    api: Api<K>,
    config: watcher::Config,
    mirror: Arc<StateMirror>,
    queue: SyncQueue,
    ready: CancellationToken,
    cancel: CancellationToken,
) where
    K: Mirrored + Resource + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut stream = watcher(api, config).default_backoff().boxed();
    let mut relist = Relist::default();
    info!(kind = %kind, "Watcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    let init_done = matches!(event, watcher::Event::InitDone);
                    let changed = apply_event(&mirror, &mut relist, event);
                    if init_done && !ready.is_cancelled() {
                        info!(kind = %kind, "Initial list complete");
                        ready.cancel();
                    }
                    if changed {
                        debug!(kind = %kind, version = mirror.snapshot().version(), "Cluster state changed");
                        queue.enqueue(&kind);
                    }
                }
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error, retrying"),
                None => break,
            },
        }
    }
    info!(kind = %kind, "Watcher stopped");
}

/// Start the Service, Endpoints and Node watchers.
pub fn spawn_watchers(
    client: Client,
    settings: &WatchSettings,
    mirror: Arc<StateMirror>,
    queue: SyncQueue,
    readiness: &CacheReadiness,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (services, endpoints): (Api<Service>, Api<Endpoints>) = match &settings.namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };
    let nodes: Api<Node> = Api::all(client);
    let node_config = match &settings.node_selector {
        Some(selector) => watcher::Config::default().labels(selector),
        None => watcher::Config::default(),
    };

    vec![
        tokio::spawn(run_watcher(
            services,
            watcher::Config::default(),
            mirror.clone(),
            queue.clone(),
            readiness.services.clone(),
            cancel.clone(),
        )),
        tokio::spawn(run_watcher(
            endpoints,
            watcher::Config::default(),
            mirror.clone(),
            queue.clone(),
            readiness.endpoints.clone(),
            cancel.clone(),
        )),
        tokio::spawn(run_watcher(
            nodes,
            node_config,
            mirror,
            queue,
            readiness.nodes.clone(),
            cancel,
        )),
    ]
}
