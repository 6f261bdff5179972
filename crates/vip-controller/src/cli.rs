//! Command-line interface.

use crate::types::{RoleTransition, VrrpState};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "IPVS and keepalived VIP controller for Kubernetes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Report a VRRP transition to a running controller (keepalived notify hook)
    Notify(NotifyArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file; searched in the default locations when omitted
    #[arg(long, short, env = "VIP_CONTROLLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of the node this controller runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// VIP map file or ConfigMap directory, overriding the config file
    #[arg(long, env = "VIP_MAP")]
    pub vip_map: Option<String>,

    /// Restrict Service and Endpoints watches to one namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Use unicast VRRP between nodes
    #[arg(long)]
    pub use_unicast: bool,

    /// Log level, overriding the config file
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Controller notify socket
    #[arg(long, default_value = "/run/vip-controller/notify.sock")]
    pub socket: PathBuf,

    /// INSTANCE or GROUP
    pub kind: String,

    /// VRRP instance or group name
    pub instance: String,

    /// MASTER, BACKUP, FAULT or STOP
    pub state: String,

    /// Priority of this node
    pub priority: Option<u8>,
}

impl NotifyArgs {
    /// The transition to report. keepalived's STOP has no VRRP role and is
    /// reported as INIT.
    pub fn transition(&self) -> Result<RoleTransition, String> {
        let state = match self.state.to_ascii_uppercase().as_str() {
            "STOP" | "DELETED" => VrrpState::Init,
            other => other.parse::<VrrpState>()?,
        };
        Ok(RoleTransition {
            kind: self.kind.clone(),
            instance: self.instance.clone(),
            state,
            priority: self.priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_hook_arguments() {
        let cli = Cli::parse_from([
            "vip-controller",
            "notify",
            "--socket",
            "/tmp/notify.sock",
            "INSTANCE",
            "vips",
            "MASTER",
            "101",
        ]);
        let Commands::Notify(args) = cli.command else {
            panic!("expected notify subcommand");
        };
        let t = args.transition().unwrap();
        assert_eq!(t.instance, "vips");
        assert_eq!(t.state, VrrpState::Master);
        assert_eq!(t.priority, Some(101));
    }

    #[test]
    fn test_stop_maps_to_init() {
        let args = NotifyArgs {
            socket: PathBuf::from("/tmp/notify.sock"),
            kind: "INSTANCE".into(),
            instance: "vips".into(),
            state: "STOP".into(),
            priority: None,
        };
        assert_eq!(args.transition().unwrap().state, VrrpState::Init);
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from(["vip-controller", "run", "--node-name", "node-a", "--use-unicast"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.node_name.as_deref(), Some("node-a"));
        assert!(args.use_unicast);
    }
}
