//! Kubernetes VIP controller built on IPVS and keepalived.
//!
//! Every node runs one controller. It watches Services, Endpoints and
//! Nodes, resolves a VIP map against them and keeps two things converged:
//!
//! - the kernel's IPVS table, programmed over generic netlink
//! - keepalived's VRRP configuration, which decides which node holds each VIP
//!
//! # Components
//!
//! - **Mirror**: snapshot of the watched cluster objects
//! - **Resolver**: pure mapping from VIP bindings and a snapshot to the desired state
//! - **Synchronizer**: diffs the desired state against IPVS and applies the delta
//! - **Queue**: coalescing, rate-limited single-worker reconciliation
//! - **Keepalived**: config rendering, process supervision, role tracking
//! - **Notify**: Unix socket receiving keepalived's VRRP transitions

pub mod cli;
pub mod config;
pub mod controller;
pub mod host;
pub mod http_server;
pub mod keepalived;
pub mod metrics;
pub mod mirror;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod sync;
pub mod types;
pub mod vipmap;
pub mod watch;

pub use config::{Config, ConfigError};
pub use controller::{Controller, ControllerHandler};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use mirror::{Snapshot, StateMirror};
pub use queue::{SyncHandler, SyncQueue, Worker};
pub use resolver::{Resolution, resolve};
pub use sync::{LoadBalancerTable, SyncReport, Synchronizer};
pub use types::{DesiredState, RoleTransition, VipBinding, VrrpState};
pub use vipmap::VipMap;
