//! keepalived.conf generation.
//!
//! Rendering is a pure function of the VIP set, the node roster and the
//! options: equal input always produces byte-identical text.

use crate::types::NodeRoster;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// How VIPs are spread over VRRP instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// One instance carrying every VIP
    #[default]
    Single,
    /// One instance per VIP, each with its own VRID
    PerVip,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub interface: String,
    /// VRID of the first instance
    pub vrid: u8,
    pub grouping: Grouping,
    pub use_unicast: bool,
    pub advert_int: u32,
    /// Instance name for single grouping, prefix for per-VIP grouping
    pub instance_name: String,
    /// Command keepalived runs on every transition; it appends type, name,
    /// state and priority.
    pub notify_command: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            vrid: 50,
            grouping: Grouping::Single,
            use_unicast: false,
            advert_int: 1,
            instance_name: "vips".to_string(),
            notify_command: "/usr/local/bin/vip-controller notify --socket /run/vip-controller/notify.sock"
                .to_string(),
        }
    }
}

/// One `vrrp_instance` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpInstance {
    pub name: String,
    pub vrid: u8,
    pub priority: u8,
    pub vips: BTreeSet<IpAddr>,
}

/// A complete keepalived configuration, rendered through `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivedConfig {
    interface: String,
    advert_int: u32,
    notify_command: String,
    unicast: Option<(IpAddr, Vec<IpAddr>)>,
    instances: Vec<VrrpInstance>,
}

impl KeepalivedConfig {
    /// Lay out the instances for `vips` on this node.
    ///
    /// Fails when per-VIP grouping would need a VRID above 255.
    pub fn build(vips: &BTreeSet<IpAddr>, roster: &NodeRoster, options: &RenderOptions) -> Result<Self> {
        let instances = match options.grouping {
            Grouping::Single if vips.is_empty() => Vec::new(),
            Grouping::Single => vec![VrrpInstance {
                name: options.instance_name.clone(),
                vrid: options.vrid,
                priority: roster.priority,
                vips: vips.clone(),
            }],
            Grouping::PerVip => vips
                .iter()
                .enumerate()
                .map(|(i, vip)| {
                    let vrid = u8::try_from(usize::from(options.vrid) + i).map_err(|_| {
                        Error::keepalived(format!(
                            "{} VIPs starting at VRID {} exceed VRID 255",
                            vips.len(),
                            options.vrid
                        ))
                    })?;
                    Ok(VrrpInstance {
                        name: format!("{}_{}", options.instance_name, vip_suffix(vip)),
                        vrid,
                        priority: roster.priority,
                        vips: BTreeSet::from([*vip]),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let unicast = options.use_unicast.then(|| {
            let mut peers = roster.peers.clone();
            peers.sort();
            peers.dedup();
            (roster.address, peers)
        });

        Ok(Self {
            interface: options.interface.clone(),
            advert_int: options.advert_int,
            notify_command: options.notify_command.clone(),
            unicast,
            instances,
        })
    }

    pub fn instances(&self) -> &[VrrpInstance] {
        &self.instances
    }
}

fn vip_suffix(vip: &IpAddr) -> String {
    vip.to_string().replace(['.', ':'], "_")
}

impl fmt::Display for KeepalivedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Generated by vip-controller. Do not edit.")?;
        writeln!(f)?;
        writeln!(f, "global_defs {{")?;
        writeln!(f, "  vrrp_version 3")?;
        writeln!(f, "  script_user root")?;
        writeln!(f, "  enable_script_security")?;
        writeln!(f, "}}")?;

        for instance in &self.instances {
            writeln!(f)?;
            self.fmt_instance(f, instance)?;
        }
        Ok(())
    }
}

impl KeepalivedConfig {
    fn fmt_instance(&self, f: &mut fmt::Formatter<'_>, instance: &VrrpInstance) -> fmt::Result {
        writeln!(f, "vrrp_instance {} {{", instance.name)?;
        writeln!(f, "  state BACKUP")?;
        writeln!(f, "  interface {}", self.interface)?;
        writeln!(f, "  virtual_router_id {}", instance.vrid)?;
        writeln!(f, "  priority {}", instance.priority)?;
        writeln!(f, "  nopreempt")?;
        writeln!(f, "  advert_int {}", self.advert_int)?;
        writeln!(f)?;
        writeln!(f, "  track_interface {{")?;
        writeln!(f, "    {}", self.interface)?;
        writeln!(f, "  }}")?;

        if let Some((src, peers)) = &self.unicast {
            writeln!(f)?;
            writeln!(f, "  unicast_src_ip {}", src)?;
            writeln!(f, "  unicast_peer {{")?;
            for peer in peers {
                writeln!(f, "    {}", peer)?;
            }
            writeln!(f, "  }}")?;
        }

        // keepalived rejects mixed families in one block; the minority
        // family goes to the excluded list, which is still configured on
        // the interface but not advertised.
        let (v4, v6): (Vec<&IpAddr>, Vec<&IpAddr>) = instance.vips.iter().partition(|v| v.is_ipv4());
        let (primary, excluded) = if v4.is_empty() { (v6, v4) } else { (v4, v6) };

        writeln!(f)?;
        writeln!(f, "  virtual_ipaddress {{")?;
        for vip in primary {
            writeln!(f, "    {}", vip)?;
        }
        writeln!(f, "  }}")?;
        if !excluded.is_empty() {
            writeln!(f)?;
            writeln!(f, "  virtual_ipaddress_excluded {{")?;
            for vip in excluded {
                writeln!(f, "    {}", vip)?;
            }
            writeln!(f, "  }}")?;
        }

        writeln!(f)?;
        writeln!(f, "  notify \"{}\"", self.notify_command)?;
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> NodeRoster {
        NodeRoster {
            node: "node-b".into(),
            address: "10.0.0.2".parse().unwrap(),
            peers: vec!["10.0.0.3".parse().unwrap(), "10.0.0.1".parse().unwrap()],
            priority: 101,
        }
    }

    fn vips(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn test_render_is_deterministic() {
        let options = RenderOptions {
            use_unicast: true,
            ..Default::default()
        };
        let a = KeepalivedConfig::build(&vips(&["203.0.113.11", "203.0.113.10"]), &roster(), &options)
            .unwrap()
            .to_string();
        let b = KeepalivedConfig::build(&vips(&["203.0.113.10", "203.0.113.11"]), &roster(), &options)
            .unwrap()
            .to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_instance_with_unicast_peers() {
        let options = RenderOptions {
            use_unicast: true,
            ..Default::default()
        };
        let text = KeepalivedConfig::build(&vips(&["203.0.113.10"]), &roster(), &options)
            .unwrap()
            .to_string();

        assert!(text.contains("vrrp_instance vips {"));
        assert!(text.contains("  state BACKUP\n"));
        assert!(text.contains("  nopreempt\n"));
        assert!(text.contains("  priority 101\n"));
        assert!(text.contains("  virtual_router_id 50\n"));
        assert!(text.contains("  unicast_src_ip 10.0.0.2\n"));
        assert!(text.contains("  unicast_peer {\n    10.0.0.1\n    10.0.0.3\n  }"));
        assert!(text.contains("    203.0.113.10\n"));
        assert!(text.contains("notify \"/usr/local/bin/vip-controller notify"));
    }

    #[test]
    fn test_multicast_omits_unicast_section() {
        let text = KeepalivedConfig::build(&vips(&["203.0.113.10"]), &roster(), &RenderOptions::default())
            .unwrap()
            .to_string();
        assert!(!text.contains("unicast_src_ip"));
        assert!(!text.contains("unicast_peer"));
    }

    #[test]
    fn test_per_vip_grouping_assigns_consecutive_vrids() {
        let options = RenderOptions {
            grouping: Grouping::PerVip,
            vrid: 10,
            ..Default::default()
        };
        let config =
            KeepalivedConfig::build(&vips(&["203.0.113.10", "203.0.113.11"]), &roster(), &options).unwrap();

        let vrids: Vec<u8> = config.instances().iter().map(|i| i.vrid).collect();
        assert_eq!(vrids, vec![10, 11]);
        assert_eq!(config.instances()[1].name, "vips_203_0_113_11");
    }

    #[test]
    fn test_per_vip_grouping_rejects_vrid_overflow() {
        let options = RenderOptions {
            grouping: Grouping::PerVip,
            vrid: 255,
            ..Default::default()
        };
        let result = KeepalivedConfig::build(&vips(&["203.0.113.10", "203.0.113.11"]), &roster(), &options);
        assert!(matches!(result, Err(Error::Keepalived(_))));
    }

    #[test]
    fn test_mixed_families_use_excluded_block() {
        let text = KeepalivedConfig::build(
            &vips(&["203.0.113.10", "2001:db8::10"]),
            &roster(),
            &RenderOptions::default(),
        )
        .unwrap()
        .to_string();
        assert!(text.contains("  virtual_ipaddress {\n    203.0.113.10\n  }"));
        assert!(text.contains("  virtual_ipaddress_excluded {\n    2001:db8::10\n  }"));
    }

    #[test]
    fn test_empty_vip_set_renders_no_instance() {
        let config =
            KeepalivedConfig::build(&BTreeSet::new(), &roster(), &RenderOptions::default()).unwrap();
        assert!(config.instances().is_empty());
        assert!(!config.to_string().contains("vrrp_instance"));
    }
}
