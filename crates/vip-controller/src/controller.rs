//! Controller wiring: builds every component and runs them until shutdown.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::keepalived::{ApplyOutcome, Daemon, DemotionPolicy, KeepalivedManager, ProcessDaemon};
use crate::metrics::MetricsRegistry;
use crate::mirror::StateMirror;
use crate::notify::NotifyListener;
use crate::queue::{SyncHandler, SyncQueue, Worker};
use crate::resolver::{BindingWarning, ResolveOptions, resolve};
use crate::sync::{LoadBalancerTable, SyncReport, Synchronizer};
use crate::types::{RoleTransition, VipBinding};
use crate::vipmap::VipMap;
use crate::watch::{CacheReadiness, spawn_watchers};
use async_trait::async_trait;
use common::{Error, Result};
use ipvs::IPVSManager;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the notify-hook to worker channel
const ROLE_CHANNEL_SIZE: usize = 64;

/// The sync pass run by the queue worker.
///
/// One pass resolves the VIP map against the current snapshot, applies the
/// demotion policy, programs IPVS and then hands the VIP set to keepalived.
pub struct ControllerHandler<T, D> {
    bindings: Vec<VipBinding>,
    mirror: Arc<StateMirror>,
    synchronizer: Arc<Mutex<Synchronizer<T>>>,
    keepalived: Arc<KeepalivedManager<D>>,
    queue: SyncQueue,
    node_name: String,
    base_priority: u8,
    policy: DemotionPolicy,
    resolve_options: ResolveOptions,
    readiness: CacheReadiness,
    metrics: Option<Arc<MetricsRegistry>>,
    last_warnings: Vec<BindingWarning>,
    roster_missing: bool,
}

impl<T, D> ControllerHandler<T, D>
where
    T: LoadBalancerTable + 'static,
    D: Daemon + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bindings: Vec<VipBinding>,
        mirror: Arc<StateMirror>,
        synchronizer: Synchronizer<T>,
        keepalived: Arc<KeepalivedManager<D>>,
        queue: SyncQueue,
        node_name: String,
        base_priority: u8,
        policy: DemotionPolicy,
    ) -> Self {
        Self {
            bindings,
            mirror,
            synchronizer: Arc::new(Mutex::new(synchronizer)),
            keepalived,
            queue,
            node_name,
            base_priority,
            policy,
            resolve_options: ResolveOptions::default(),
            readiness: CacheReadiness::synced(),
            metrics: None,
            last_warnings: Vec::new(),
            roster_missing: false,
        }
    }

    pub fn with_resolve_options(mut self, options: ResolveOptions) -> Self {
        self.resolve_options = options;
        self
    }

    /// Skip passes until the watchers have completed their initial lists.
    pub fn with_readiness(mut self, readiness: CacheReadiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared handle to the synchronizer, for inspection.
    pub fn synchronizer(&self) -> Arc<Mutex<Synchronizer<T>>> {
        self.synchronizer.clone()
    }

    async fn pass(&mut self) -> Result<()> {
        // A partial mirror would resolve to deletions of live entries.
        if !self.readiness.is_ready() {
            debug!("Cluster state not loaded yet, skipping pass");
            return Ok(());
        }

        let snapshot = self.mirror.snapshot();
        let resolution = resolve(&self.bindings, &snapshot, &self.resolve_options);
        self.report_warnings(resolution.warnings);

        let masters = self.keepalived.master_vips().await;
        let effective = self.policy.effective(&resolution.desired, &masters);
        if let Some(m) = &self.metrics {
            let real_servers = effective.entries().iter().map(|vs| vs.real_servers.len()).sum();
            m.set_desired(effective.len(), real_servers);
        }
        debug!(
            version = snapshot.version(),
            services = snapshot.service_count(),
            nodes = snapshot.node_count(),
            virtual_servers = effective.len(),
            "Synchronizing IPVS"
        );

        let synchronizer = self.synchronizer.clone();
        let (ipvs_result, report) = tokio::task::spawn_blocking(move || {
            let mut sync = synchronizer.lock().unwrap_or_else(PoisonError::into_inner);
            let result = sync.apply(&effective);
            (result, sync.last_report().clone())
        })
        .await
        .map_err(|e| Error::other(format!("IPVS sync task failed: {}", e)))?;
        self.record_report(&report);

        // keepalived announces every configured VIP regardless of the
        // demotion policy; only IPVS rules follow the role.
        let keepalived_result = self.apply_keepalived(&snapshot, &resolution.desired.vips()).await;

        if let Some(m) = &self.metrics {
            m.set_coalesced(self.queue.stats().coalesced);
        }
        ipvs_result.map(|_| ()).and(keepalived_result)
    }

    async fn apply_keepalived(
        &mut self,
        snapshot: &crate::mirror::Snapshot,
        vips: &std::collections::BTreeSet<std::net::IpAddr>,
    ) -> Result<()> {
        let Some(roster) = snapshot.roster(&self.node_name, self.base_priority) else {
            if !self.roster_missing {
                warn!(node = %self.node_name, "Local node has no known address, deferring keepalived");
                self.roster_missing = true;
            }
            return Ok(());
        };
        self.roster_missing = false;

        match self.keepalived.apply(vips, &roster).await? {
            ApplyOutcome::Reloaded | ApplyOutcome::Restarted => {
                if let Some(m) = &self.metrics {
                    m.record_keepalived_reload();
                }
            }
            ApplyOutcome::Started | ApplyOutcome::Unchanged | ApplyOutcome::Skipped => {}
        }
        Ok(())
    }

    fn report_warnings(&mut self, warnings: Vec<BindingWarning>) {
        if let Some(m) = &self.metrics {
            m.set_binding_warnings(warnings.iter().map(BindingWarning::kind));
        }
        if warnings == self.last_warnings {
            if !warnings.is_empty() {
                debug!(count = warnings.len(), "Binding warnings unchanged");
            }
            return;
        }
        for w in &warnings {
            warn!(binding = %w.binding(), kind = w.kind(), "{}", w);
        }
        self.last_warnings = warnings;
    }

    fn record_report(&self, report: &SyncReport) {
        if let Some(m) = &self.metrics {
            m.record_report(report);
        }
    }
}

#[async_trait]
impl<T, D> SyncHandler for ControllerHandler<T, D>
where
    T: LoadBalancerTable + 'static,
    D: Daemon + 'static,
{
    async fn sync(&mut self) -> Result<()> {
        let started = Instant::now();
        let result = self.pass().await;
        if let Some(m) = &self.metrics {
            m.record_sync(result.is_ok(), started.elapsed());
        }
        result
    }

    async fn role_changed(&mut self, transition: &RoleTransition) {
        info!(
            instance = %transition.instance,
            state = %transition.state,
            priority = ?transition.priority,
            "VRRP transition"
        );
        self.keepalived.observe(transition).await;
        if let Some(m) = &self.metrics {
            m.record_transition(&transition.instance, transition.state);
        }
    }
}

/// The running controller.
pub struct Controller {
    config: Config,
    node_name: String,
    vip_map: VipMap,
}

impl Controller {
    pub fn new(config: Config, node_name: String, vip_map: VipMap) -> Self {
        Self {
            config,
            node_name,
            vip_map,
        }
    }

    /// Run until `cancel` fires or a component fails fatally.
    ///
    /// Shutdown order: stop accepting events, let the in-flight pass finish,
    /// then stop keepalived.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = &self.config;
        info!(
            node = %self.node_name,
            bindings = self.vip_map.bindings().len(),
            rejected = self.vip_map.rejected(),
            "Starting VIP controller"
        );

        config.host_setup().prepare().await?;

        let mut ipvs = IPVSManager::with_timeout(config.ipvs.netlink_timeout)
            .map_err(|e| Error::host(format!("cannot open IPVS netlink socket: {}", e)))?;
        match ipvs.version() {
            Ok(version) => info!(version = %version, "Connected to IPVS"),
            Err(e) => return Err(Error::host(format!("IPVS unavailable: {}", e))),
        }
        let synchronizer = Synchronizer::new(ipvs, config.sync_settings(), self.vip_map.vips());

        let notify_binary =
            std::env::current_exe().unwrap_or_else(|_| PathBuf::from("vip-controller"));
        let settings = config.manager_settings(&notify_binary);
        let daemon = Arc::new(ProcessDaemon::new(
            &config.keepalived.binary,
            &settings.config_path,
        ));
        let keepalived = Arc::new(KeepalivedManager::new(daemon, settings));

        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(MetricsRegistry::new()));

        let client = kube::Client::try_default().await.map_err(Error::kube)?;

        let mirror = Arc::new(StateMirror::new());
        let queue = SyncQueue::new();
        let (roles_tx, roles_rx) = mpsc::channel(ROLE_CHANNEL_SIZE);

        // Event sources and the metrics endpoint stop first.
        let sources = CancellationToken::new();
        let worker_cancel = CancellationToken::new();
        let supervisor_cancel = CancellationToken::new();

        let listener = NotifyListener::new(&config.keepalived.notify_socket, roles_tx);
        let socket = listener.bind()?;

        let readiness = CacheReadiness::new();
        let mut aux: Vec<(&'static str, JoinHandle<()>)> = spawn_watchers(
            client,
            &config.watch_settings(),
            mirror.clone(),
            queue.clone(),
            &readiness,
            sources.clone(),
        )
        .into_iter()
        .map(|h| ("watcher", h))
        .collect();

        // The first pass waits for every initial list.
        let ready = readiness.clone();
        let startup_queue = queue.clone();
        let token = sources.clone();
        aux.push((
            "startup",
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = ready.wait() => {
                        info!("Cluster state loaded");
                        startup_queue.enqueue("startup");
                    }
                }
            }),
        ));

        let token = sources.clone();
        aux.push((
            "notify listener",
            tokio::spawn(async move {
                if let Err(e) = listener.serve(socket, token).await {
                    warn!(error = %e, "Notify listener error");
                }
            }),
        ));

        if let Some(registry) = &metrics {
            let server = MetricsServer::new(registry.clone(), config.metrics.listen_addr.clone());
            let token = sources.clone();
            aux.push((
                "metrics server",
                tokio::spawn(async move {
                    if let Err(e) = server.run(token).await {
                        warn!(error = %e, "Metrics server error");
                    }
                }),
            ));
        }

        let handler = ControllerHandler::new(
            self.vip_map.bindings().to_vec(),
            mirror,
            synchronizer,
            keepalived.clone(),
            queue.clone(),
            self.node_name.clone(),
            config.keepalived.base_priority,
            config.ipvs.demotion_policy,
        )
        .with_resolve_options(config.resolve_options())
        .with_readiness(readiness)
        .with_metrics(metrics);

        let worker = Worker::new(
            queue.clone(),
            handler,
            roles_rx,
            config.queue_config(),
            worker_cancel.clone(),
        );
        let mut worker = tokio::spawn(worker.run());

        let supervised = keepalived.clone();
        let token = supervisor_cancel.clone();
        let mut supervisor = tokio::spawn(async move { supervised.supervise(token).await });

        info!("VIP controller running");

        let mut worker_result = None;
        let mut supervisor_result = None;
        tokio::select! {
            _ = cancel.cancelled() => info!("Shutdown requested"),
            out = &mut worker => worker_result = Some(joined("sync worker", out)),
            out = &mut supervisor => supervisor_result = Some(joined("keepalived supervisor", out)),
        }

        queue.close();
        sources.cancel();
        worker_cancel.cancel();
        let worker_result = match worker_result {
            Some(r) => r,
            None => joined("sync worker", worker.await),
        };

        supervisor_cancel.cancel();
        let supervisor_result = match supervisor_result {
            Some(r) => r,
            None => joined("keepalived supervisor", supervisor.await),
        };

        for (task, handle) in aux {
            if let Err(e) = handle.await {
                warn!(task, error = %e, "Task did not stop cleanly");
            }
        }

        info!("VIP controller stopped");
        worker_result.and(supervisor_result)
    }
}

fn joined(task: &str, out: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!(task, "Task exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(task, error = %e, "Task failed");
            Err(e)
        }
        Err(e) => {
            error!(task, error = %e, "Task panicked or was cancelled");
            Err(Error::other(format!("{} task failed: {}", task, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalived::supervisor::MockDaemon;
    use crate::keepalived::{ManagerSettings, RenderOptions, SupervisorConfig};
    use crate::sync::SyncSettings;
    use crate::sync::memory::MemoryTable;
    use crate::types::VrrpState;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeAddress, NodeStatus,
        Service, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: namespace.map(Into::into),
            resource_version: Some("1".into()),
            ..Default::default()
        }
    }

    fn populate(mirror: &StateMirror) {
        mirror.apply(Service {
            metadata: meta("web", Some("default")),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        mirror.apply(Endpoints {
            metadata: meta("web", Some("default")),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ["10.1.0.5", "10.1.0.6"]
                        .iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(vec![EndpointPort {
                    port: 8080,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        });
        mirror.apply(Node {
            metadata: meta("node-a", None),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: "10.0.0.1".into(),
                    type_: "InternalIP".into(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    fn manager(name: &str, daemon: MockDaemon) -> Arc<KeepalivedManager<MockDaemon>> {
        let dir = std::env::temp_dir().join(format!("controller-{}-{}", name, std::process::id()));
        let settings = ManagerSettings {
            config_path: dir.join("keepalived.conf"),
            render: RenderOptions::default(),
            supervisor: SupervisorConfig::default(),
        };
        Arc::new(KeepalivedManager::new(Arc::new(daemon), settings))
    }

    fn handler(
        name: &str,
        daemon: MockDaemon,
        policy: DemotionPolicy,
    ) -> (ControllerHandler<MemoryTable, MockDaemon>, Arc<StateMirror>) {
        let map = VipMap::from_entries([("203.0.113.10", "default/web")]);
        let mirror = Arc::new(StateMirror::new());
        let synchronizer =
            Synchronizer::new(MemoryTable::default(), SyncSettings::default(), map.vips());
        let handler = ControllerHandler::new(
            map.bindings().to_vec(),
            mirror.clone(),
            synchronizer,
            manager(name, daemon),
            SyncQueue::new(),
            "node-a".into(),
            100,
            policy,
        )
        .with_metrics(Some(Arc::new(MetricsRegistry::new())));
        (handler, mirror)
    }

    #[tokio::test]
    async fn test_pass_programs_ipvs_and_starts_keepalived() {
        let mut daemon = MockDaemon::new();
        daemon.expect_spawn().times(1).returning(|| Ok(()));

        let (mut handler, mirror) = handler("program", daemon, DemotionPolicy::Retain);
        populate(&mirror);
        handler.sync().await.unwrap();

        let sync = handler.synchronizer();
        let sync = sync.lock().unwrap();
        let table = sync.table();
        assert_eq!(table.services.len(), 1);
        let (_, dests) = table.services.values().next().unwrap();
        assert_eq!(dests.len(), 2);
        assert_eq!(sync.last_report().destinations_added, 2);
    }

    #[tokio::test]
    async fn test_unknown_local_node_defers_keepalived() {
        // No spawn expectation: keepalived must not be touched.
        let daemon = MockDaemon::new();
        let (mut handler, mirror) = handler("defer", daemon, DemotionPolicy::Retain);
        populate(&mirror);
        handler.node_name = "node-z".into();

        handler.sync().await.unwrap();
        assert!(handler.roster_missing);
        assert_eq!(handler.synchronizer().lock().unwrap().table().services.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_policy_follows_master_role() {
        let mut daemon = MockDaemon::new();
        daemon.expect_spawn().times(1).returning(|| Ok(()));

        let (mut handler, mirror) = handler("flush", daemon, DemotionPolicy::Flush);
        populate(&mirror);

        handler.sync().await.unwrap();
        assert!(handler.synchronizer().lock().unwrap().table().services.is_empty());

        handler
            .role_changed(&RoleTransition {
                kind: "INSTANCE".into(),
                instance: "vips".into(),
                state: VrrpState::Master,
                priority: Some(100),
            })
            .await;
        handler.sync().await.unwrap();
        assert_eq!(handler.synchronizer().lock().unwrap().table().services.len(), 1);
    }

    fn backup() -> RoleTransition {
        RoleTransition {
            kind: "INSTANCE".into(),
            instance: "vips".into(),
            state: VrrpState::Backup,
            priority: Some(100),
        }
    }

    fn master() -> RoleTransition {
        RoleTransition {
            state: VrrpState::Master,
            ..backup()
        }
    }

    fn service_count(handler: &ControllerHandler<MemoryTable, MockDaemon>) -> usize {
        handler.synchronizer().lock().unwrap().table().services.len()
    }

    #[tokio::test]
    async fn test_flush_policy_removes_entries_on_demotion() {
        let mut daemon = MockDaemon::new();
        daemon.expect_spawn().times(1).returning(|| Ok(()));

        let (mut handler, mirror) = handler("demote-flush", daemon, DemotionPolicy::Flush);
        populate(&mirror);
        handler.sync().await.unwrap();

        handler.role_changed(&master()).await;
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 1);

        handler.role_changed(&backup()).await;
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 0);
        assert_eq!(
            handler.synchronizer().lock().unwrap().last_report().services_deleted,
            1
        );
    }

    #[tokio::test]
    async fn test_retain_policy_keeps_entries_on_demotion() {
        let mut daemon = MockDaemon::new();
        daemon.expect_spawn().times(1).returning(|| Ok(()));

        let (mut handler, mirror) = handler("demote-retain", daemon, DemotionPolicy::Retain);
        populate(&mirror);
        handler.role_changed(&master()).await;
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 1);

        let before = handler.synchronizer().lock().unwrap().table().mutations;
        handler.role_changed(&backup()).await;
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 1);
        assert_eq!(handler.synchronizer().lock().unwrap().table().mutations, before);
    }

    #[tokio::test]
    async fn test_pass_waits_for_initial_lists() {
        // Only the pass after the initial lists starts keepalived.
        let mut daemon = MockDaemon::new();
        daemon.expect_spawn().times(1).returning(|| Ok(()));
        let (handler, mirror) = handler("startup", daemon, DemotionPolicy::Retain);
        let mut handler = handler.with_readiness(CacheReadiness::new());

        let live = ipvs::Service::new(
            "203.0.113.10".parse().unwrap(),
            80,
            ipvs::Protocol::TCP,
            ipvs::Scheduler::RoundRobin,
        );
        {
            let sync = handler.synchronizer();
            let mut sync = sync.lock().unwrap();
            let table = sync.table_mut();
            table.add_service(&live).unwrap();
            table
                .add_destination(
                    &live,
                    &ipvs::Destination::new(
                        "10.1.0.5:8080".parse().unwrap(),
                        1,
                        ipvs::ForwardingMethod::Masq,
                    ),
                )
                .unwrap();
        }

        // Restart with live rules and an empty mirror: nothing is deleted.
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 1);
        assert_eq!(handler.synchronizer().lock().unwrap().table().mutations, 2);
        assert!(handler.last_warnings.is_empty());

        populate(&mirror);
        handler.readiness = CacheReadiness::synced();
        handler.sync().await.unwrap();
        assert_eq!(service_count(&handler), 1);
        let sync = handler.synchronizer();
        let sync = sync.lock().unwrap();
        assert_eq!(sync.last_report().services_deleted, 0);
        let (_, dests) = sync.table().services.values().next().unwrap();
        assert_eq!(dests.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_service_warns_without_failing() {
        let daemon = MockDaemon::new();
        let (mut handler, _mirror) = handler("missing", daemon, DemotionPolicy::Retain);

        handler.sync().await.unwrap();
        assert_eq!(handler.last_warnings.len(), 1);
        assert_eq!(handler.last_warnings[0].kind(), "service_not_found");
    }
}
