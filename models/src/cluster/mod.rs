mod error;
mod inventory;

pub use self::error::Error as ClusterSpecError;
use self::error::Result;
pub use self::inventory::{Inventory, InventoryNode};

use crate::constants::{
    DEFAULT_ARCH, DEFAULT_BRIDGE, DEFAULT_ISO_DATASTORE, DEFAULT_PLATFORM, DEFAULT_PROXMOX_NODE,
    DEFAULT_VM_DATASTORE, DEFAULT_VM_DISK_SIZE_GB, KUBERNETES_API_PORT,
};
use crate::node::NodeDuty;

use k8s_openapi::api::core::v1::Taint;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// The role a node plays in the Kubernetes cluster.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, strum_macros::Display,
)]
pub enum NodeRole {
    #[serde(rename = "controlplane")]
    #[strum(serialize = "controlplane")]
    ControlPlane,
    #[serde(rename = "worker")]
    #[strum(serialize = "worker")]
    Worker,
}

/// Who owns the machine a node runs on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum_macros::Display, Default)]
pub enum NodeClass {
    /// A VM created and tracked on the Proxmox hypervisor.
    #[default]
    #[serde(rename = "proxmox")]
    #[strum(serialize = "proxmox")]
    Proxmox,
    /// A machine outside our control. We only push configuration to it.
    #[serde(rename = "external")]
    #[strum(serialize = "external")]
    External,
}

/// One machine in the cluster. Name and IP identify the node for the lifetime of the cluster; changing either
/// describes a different node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub ip: Ipv4Addr,
    pub role: NodeRole,
    pub class: NodeClass,
    pub cpu: u32,
    pub memory_mb: u32,
    pub install_disk: String,
    /// Key into `ClusterSpec::image_profiles`.
    pub image_profile: String,
    pub gpu: bool,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl NodeSpec {
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }

    pub fn is_control_plane(&self) -> bool {
        self.role == NodeRole::ControlPlane
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.ip)
    }
}

/// The OS customizations that make up one image variant, e.g. "default" or "gpu".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageProfile {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Whether the ISO is downloaded into hypervisor storage for use as VM boot media.
    #[serde(default = "default_true")]
    pub upload_to_hypervisor: bool,
}

impl Default for ImageProfile {
    fn default() -> Self {
        ImageProfile {
            extensions: Vec::new(),
            platform: default_platform(),
            arch: default_arch(),
            upload_to_hypervisor: true,
        }
    }
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

fn default_arch() -> String {
    DEFAULT_ARCH.to_string()
}

fn default_true() -> bool {
    true
}

/// Where on the hypervisor VMs and boot media are placed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub node_name: String,
    pub iso_datastore: String,
    pub vm_datastore: String,
    pub bridge: String,
    pub disk_size_gb: u32,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        HypervisorSettings {
            node_name: DEFAULT_PROXMOX_NODE.to_string(),
            iso_datastore: DEFAULT_ISO_DATASTORE.to_string(),
            vm_datastore: DEFAULT_VM_DATASTORE.to_string(),
            bridge: DEFAULT_BRIDGE.to_string(),
            disk_size_gb: DEFAULT_VM_DISK_SIZE_GB,
        }
    }
}

/// A Helm release installed once the cluster is healthy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub name: String,
    pub repo_url: String,
    pub chart: String,
    pub version: String,
    pub values_file: Option<PathBuf>,
}

/// Workloads for one namespace of the application-deployment layer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub namespace: String,
    pub release: Option<ReleaseDescriptor>,
    #[serde(default)]
    pub manifests: Vec<PathBuf>,
}

/// The root input to orchestration.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    pub talos_version: String,
    /// Defaults to the Kubernetes version bundled with `talos_version`.
    pub kubernetes_version: Option<String>,
    pub gateway: Ipv4Addr,
    pub endpoint_ip: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
    pub nodes: Vec<NodeSpec>,
    pub use_cilium: bool,
    pub cilium_version: String,
    pub image_profiles: BTreeMap<String, ImageProfile>,
    pub hypervisor: HypervisorSettings,
    pub applications: Vec<ApplicationSpec>,
}

impl ClusterSpec {
    /// The URL clients use to reach the Kubernetes API.
    pub fn cluster_endpoint(&self) -> String {
        format!("https://{}:{}", self.endpoint_ip, KUBERNETES_API_PORT)
    }

    /// The nameservers handed to nodes; the gateway when none are configured.
    pub fn effective_nameservers(&self) -> Vec<Ipv4Addr> {
        if self.nameservers.is_empty() {
            vec![self.gateway]
        } else {
            self.nameservers.clone()
        }
    }

    /// The single node on which the cluster is initialized: the first control-plane node holding the endpoint IP.
    pub fn bootstrap_node(&self) -> Option<&NodeSpec> {
        self.nodes
            .iter()
            .find(|node| node.is_control_plane() && node.ip == self.endpoint_ip)
    }

    pub fn controlplane_ips(&self) -> Vec<Ipv4Addr> {
        self.nodes
            .iter()
            .filter(|node| node.is_control_plane())
            .map(|node| node.ip)
            .collect()
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(move |node| node.role == role)
    }

    /// Determines what the orchestration must do for a node of this cluster.
    pub fn duty_of(&self, node: &NodeSpec) -> NodeDuty {
        match node.role {
            NodeRole::Worker => NodeDuty::Worker,
            NodeRole::ControlPlane => match self.bootstrap_node() {
                Some(bootstrap) if bootstrap.name == node.name => NodeDuty::ControlPlaneBootstrap,
                _ => NodeDuty::ControlPlaneJoin,
            },
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Checks the invariants which span several nodes or fields.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.nodes.is_empty(),
            error::NoNodesSnafu {
                cluster: self.name.clone()
            }
        );
        ensure!(
            self.nodes.iter().any(NodeSpec::is_control_plane),
            error::NoControlPlaneSnafu {
                cluster: self.name.clone()
            }
        );

        let mut ips: HashMap<Ipv4Addr, &str> = HashMap::new();
        let mut names: HashMap<&str, ()> = HashMap::new();
        for node in &self.nodes {
            if let Some(first) = ips.insert(node.ip, &node.name) {
                return error::DuplicateNodeIpSnafu {
                    ip: node.ip,
                    first,
                    second: node.name.clone(),
                }
                .fail();
            }
            ensure!(
                names.insert(&node.name, ()).is_none(),
                error::DuplicateNodeNameSnafu {
                    name: node.name.clone()
                }
            );

            let profile = self.image_profiles.get(&node.image_profile).ok_or_else(|| {
                ClusterSpecError::UnknownImageProfile {
                    node: node.name.clone(),
                    profile: node.image_profile.clone(),
                }
            })?;
            ensure!(
                node.class == NodeClass::External || profile.upload_to_hypervisor,
                error::IsoUnavailableSnafu {
                    node: node.name.clone(),
                    profile: node.image_profile.clone(),
                }
            );
        }

        ensure!(
            self.bootstrap_node().is_some(),
            error::NoBootstrapNodeSnafu {
                endpoint_ip: self.endpoint_ip
            }
        );

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use maplit::btreemap;

    pub(crate) fn fake_node(name: &str, ip: &str, role: NodeRole) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            ip: ip.parse().unwrap(),
            role,
            class: NodeClass::Proxmox,
            cpu: 2,
            memory_mb: 2048,
            install_disk: "/dev/sda".to_string(),
            image_profile: "default".to_string(),
            gpu: false,
            hostname: None,
            labels: BTreeMap::new(),
            taints: Vec::new(),
        }
    }

    pub(crate) fn fake_cluster(nodes: Vec<NodeSpec>) -> ClusterSpec {
        let endpoint_ip = nodes[0].ip;
        ClusterSpec {
            name: "homelab".to_string(),
            talos_version: "v1.9.0".to_string(),
            kubernetes_version: None,
            gateway: "10.0.0.1".parse().unwrap(),
            endpoint_ip,
            nameservers: Vec::new(),
            nodes,
            use_cilium: false,
            cilium_version: "1.16.0".to_string(),
            image_profiles: btreemap! { "default".to_string() => ImageProfile::default() },
            hypervisor: HypervisorSettings::default(),
            applications: Vec::new(),
        }
    }

    #[test]
    fn test_duty_assignment() {
        let cluster = fake_cluster(vec![
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
            fake_node("cp-2", "10.0.0.11", NodeRole::ControlPlane),
            fake_node("w-1", "10.0.0.20", NodeRole::Worker),
        ]);

        let duties: Vec<NodeDuty> = cluster.nodes.iter().map(|n| cluster.duty_of(n)).collect();
        assert_eq!(
            duties,
            vec![
                NodeDuty::ControlPlaneBootstrap,
                NodeDuty::ControlPlaneJoin,
                NodeDuty::Worker
            ]
        );
        assert_eq!(cluster.cluster_endpoint(), "https://10.0.0.10:6443");
        assert_eq!(
            cluster.controlplane_ips(),
            vec![
                "10.0.0.10".parse::<Ipv4Addr>().unwrap(),
                "10.0.0.11".parse::<Ipv4Addr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_bootstrap_node_requires_control_plane_role() {
        let mut cluster = fake_cluster(vec![
            fake_node("w-1", "10.0.0.20", NodeRole::Worker),
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
        ]);
        // The endpoint defaults to the first node, which is a worker here.
        assert!(cluster.bootstrap_node().is_none());
        assert!(matches!(
            cluster.validate(),
            Err(ClusterSpecError::NoBootstrapNode { .. })
        ));

        cluster.endpoint_ip = "10.0.0.10".parse().unwrap();
        assert_eq!(cluster.bootstrap_node().unwrap().name, "cp-1");
        assert!(cluster.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_inventories() {
        let duplicate_ip = fake_cluster(vec![
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
            fake_node("w-1", "10.0.0.10", NodeRole::Worker),
        ]);
        assert!(matches!(
            duplicate_ip.validate(),
            Err(ClusterSpecError::DuplicateNodeIp { .. })
        ));

        let duplicate_name = fake_cluster(vec![
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
            fake_node("cp-1", "10.0.0.11", NodeRole::Worker),
        ]);
        assert!(matches!(
            duplicate_name.validate(),
            Err(ClusterSpecError::DuplicateNodeName { .. })
        ));

        let mut gpu_node = fake_node("w-1", "10.0.0.20", NodeRole::Worker);
        gpu_node.image_profile = "gpu".to_string();
        let unknown_profile = fake_cluster(vec![
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
            gpu_node,
        ]);
        assert!(matches!(
            unknown_profile.validate(),
            Err(ClusterSpecError::UnknownImageProfile { .. })
        ));

        let workers_only = fake_cluster(vec![fake_node("w-1", "10.0.0.20", NodeRole::Worker)]);
        assert!(matches!(
            workers_only.validate(),
            Err(ClusterSpecError::NoControlPlane { .. })
        ));
    }

    #[test]
    fn test_external_node_does_not_need_uploaded_iso() {
        let mut external = fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane);
        external.class = NodeClass::External;
        let mut cluster = fake_cluster(vec![external]);
        cluster
            .image_profiles
            .get_mut("default")
            .unwrap()
            .upload_to_hypervisor = false;
        assert!(cluster.validate().is_ok());

        cluster.nodes[0].class = NodeClass::Proxmox;
        assert!(matches!(
            cluster.validate(),
            Err(ClusterSpecError::IsoUnavailable { .. })
        ));
    }
}
