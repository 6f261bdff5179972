//! Prometheus metrics for the VIP controller.

use crate::sync::SyncReport;
use crate::types::VrrpState;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for sync pass outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// success or failure
    pub result: String,
}

/// Labels for kernel mutations
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutationLabels {
    /// service or destination
    pub object: String,
    /// create, update or delete
    pub op: String,
}

/// Labels for per-instance VRRP state
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub instance: String,
}

/// Labels for warnings
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WarningLabels {
    pub kind: String,
}

/// Metrics registry with all controller metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    sync_passes_total: Family<ResultLabels, Counter>,
    sync_duration_seconds: Histogram,
    mutations_total: Family<MutationLabels, Counter>,
    mutation_failures_total: Counter,
    binding_warnings: Family<WarningLabels, Gauge>,
    desired_virtual_servers: Gauge,
    desired_real_servers: Gauge,
    coalesced_enqueues: Gauge,
    /// 0=init, 1=backup, 2=master, 3=fault
    vrrp_state: Family<InstanceLabels, Gauge>,
    vrrp_transitions_total: Family<InstanceLabels, Counter>,
    keepalived_reloads_total: Counter,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sync_passes_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "vip_controller_sync_passes",
            "Synchronization passes by result",
            sync_passes_total.clone(),
        );

        // 1ms to ~16s
        let sync_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "vip_controller_sync_duration_seconds",
            "Duration of synchronization passes",
            sync_duration_seconds.clone(),
        );

        let mutations_total = Family::<MutationLabels, Counter>::default();
        registry.register(
            "vip_controller_ipvs_mutations",
            "Successful IPVS mutations",
            mutations_total.clone(),
        );

        let mutation_failures_total = Counter::default();
        registry.register(
            "vip_controller_ipvs_mutation_failures",
            "IPVS mutations that failed after retries",
            mutation_failures_total.clone(),
        );

        let binding_warnings = Family::<WarningLabels, Gauge>::default();
        registry.register(
            "vip_controller_binding_warnings",
            "VIP bindings left out of the last resolution",
            binding_warnings.clone(),
        );

        let desired_virtual_servers = Gauge::default();
        registry.register(
            "vip_controller_desired_virtual_servers",
            "Virtual servers in the last desired state",
            desired_virtual_servers.clone(),
        );

        let desired_real_servers = Gauge::default();
        registry.register(
            "vip_controller_desired_real_servers",
            "Real servers in the last desired state",
            desired_real_servers.clone(),
        );

        let coalesced_enqueues = Gauge::default();
        registry.register(
            "vip_controller_coalesced_enqueues",
            "Sync requests merged into an already pending pass",
            coalesced_enqueues.clone(),
        );

        let vrrp_state = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "vip_controller_vrrp_state",
            "Last reported VRRP state (0=init, 1=backup, 2=master, 3=fault)",
            vrrp_state.clone(),
        );

        let vrrp_transitions_total = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vip_controller_vrrp_transitions",
            "VRRP role transitions reported by keepalived",
            vrrp_transitions_total.clone(),
        );

        let keepalived_reloads_total = Counter::default();
        registry.register(
            "vip_controller_keepalived_reloads",
            "keepalived configuration reloads and restarts",
            keepalived_reloads_total.clone(),
        );

        Self {
            registry,
            sync_passes_total,
            sync_duration_seconds,
            mutations_total,
            mutation_failures_total,
            binding_warnings,
            desired_virtual_servers,
            desired_real_servers,
            coalesced_enqueues,
            vrrp_state,
            vrrp_transitions_total,
            keepalived_reloads_total,
        }
    }

    /// Record one sync pass
    pub fn record_sync(&self, success: bool, duration: Duration) {
        let result = if success { "success" } else { "failure" };
        self.sync_passes_total
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
        self.sync_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Record the mutations of one synchronizer run
    pub fn record_report(&self, report: &SyncReport) {
        let counts = [
            ("service", "create", report.services_created),
            ("service", "update", report.services_updated),
            ("service", "delete", report.services_deleted),
            ("destination", "create", report.destinations_added),
            ("destination", "update", report.destinations_updated),
            ("destination", "delete", report.destinations_removed),
        ];
        for (object, op, count) in counts {
            if count > 0 {
                self.mutations_total
                    .get_or_create(&MutationLabels {
                        object: object.to_string(),
                        op: op.to_string(),
                    })
                    .inc_by(count as u64);
            }
        }
        self.mutation_failures_total
            .inc_by(report.failures.len() as u64);
    }

    /// Update binding warning counts by kind
    pub fn set_binding_warnings<'a>(&self, kinds: impl IntoIterator<Item = &'a str>) {
        self.binding_warnings.clear();
        for kind in kinds {
            self.binding_warnings
                .get_or_create(&WarningLabels {
                    kind: kind.to_string(),
                })
                .inc();
        }
    }

    /// Update desired state size
    pub fn set_desired(&self, virtual_servers: usize, real_servers: usize) {
        self.desired_virtual_servers.set(virtual_servers as i64);
        self.desired_real_servers.set(real_servers as i64);
    }

    pub fn set_coalesced(&self, coalesced: u64) {
        self.coalesced_enqueues.set(coalesced as i64);
    }

    /// Record a VRRP role transition
    pub fn record_transition(&self, instance: &str, state: VrrpState) {
        let labels = InstanceLabels {
            instance: instance.to_string(),
        };
        self.vrrp_state.get_or_create(&labels).set(state_value(state));
        self.vrrp_transitions_total.get_or_create(&labels).inc();
    }

    pub fn record_keepalived_reload(&self) {
        self.keepalived_reloads_total.inc();
    }
}

fn state_value(state: VrrpState) -> i64 {
    match state {
        VrrpState::Init => 0,
        VrrpState::Backup => 1,
        VrrpState::Master => 2,
        VrrpState::Fault => 3,
    }
}
