use super::error::{self, Result};
use super::{
    ApplicationSpec, ClusterSpec, HypervisorSettings, ImageProfile, NodeClass, NodeRole, NodeSpec,
};
use crate::constants::{
    DEFAULT_CILIUM_VERSION, DEFAULT_IMAGE_PROFILE, DEFAULT_INSTALL_DISK, DEFAULT_NODE_CPU,
    DEFAULT_NODE_MEMORY_MB,
};

use k8s_openapi::api::core::v1::Taint;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::instrument;
use validator::Validate;

lazy_static! {
    // Talos and Kubernetes versions are written as tags, e.g. "v1.9.0".
    static ref VERSION_TAG: Regex = Regex::new(r"^v\d+\.\d+\.\d+.*$").unwrap();
    // Node names become hostnames and VM names.
    static ref NODE_NAME: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    // Cluster names become state directory names and talosconfig contexts, so they must be a single DNS label.
    static ref CLUSTER_NAME: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

/// The cluster description exactly as an operator writes it.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Inventory {
    #[validate(length(max = 63), regex = "CLUSTER_NAME")]
    pub cluster_name: String,
    #[validate(regex = "VERSION_TAG")]
    pub talos_version: String,
    #[validate(regex = "VERSION_TAG")]
    pub kubernetes_version: Option<String>,
    pub gateway: String,
    pub cluster_endpoint_ip: Option<String>,
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub use_cilium: bool,
    #[serde(default = "default_cilium_version")]
    #[validate(length(min = 1))]
    pub cilium_version: String,
    #[serde(default = "default_image_profiles")]
    pub image_profiles: BTreeMap<String, ImageProfile>,
    #[serde(default)]
    pub hypervisor: HypervisorSettings,
    #[validate]
    pub nodes: Vec<InventoryNode>,
    #[serde(default)]
    pub applications: Vec<ApplicationSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct InventoryNode {
    #[validate(regex = "NODE_NAME")]
    pub name: String,
    pub ip: String,
    pub role: NodeRole,
    #[serde(rename = "type", default)]
    pub class: NodeClass,
    #[serde(default = "default_cpu")]
    #[validate(range(min = 1))]
    pub cpu: u32,
    #[serde(default = "default_memory")]
    #[validate(range(min = 512))]
    pub memory: u32,
    #[serde(default = "default_install_disk")]
    #[validate(length(min = 1))]
    pub install_disk: String,
    #[serde(rename = "talos_image", default = "default_image_profile")]
    pub image_profile: String,
    #[serde(default)]
    pub gpu: bool,
    pub hostname: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

fn default_cilium_version() -> String {
    DEFAULT_CILIUM_VERSION.to_string()
}

fn default_image_profiles() -> BTreeMap<String, ImageProfile> {
    let mut profiles = BTreeMap::new();
    profiles.insert(DEFAULT_IMAGE_PROFILE.to_string(), ImageProfile::default());
    profiles
}

fn default_cpu() -> u32 {
    DEFAULT_NODE_CPU
}

fn default_memory() -> u32 {
    DEFAULT_NODE_MEMORY_MB
}

fn default_install_disk() -> String {
    DEFAULT_INSTALL_DISK.to_string()
}

fn default_image_profile() -> String {
    DEFAULT_IMAGE_PROFILE.to_string()
}

fn parse_ip(field: &str, value: &str) -> Result<Ipv4Addr> {
    value.parse().context(error::InvalidIpSnafu {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn check_version(field: &str, version: &str) -> Result<()> {
    semver::Version::parse(version.trim_start_matches('v')).context(error::InvalidVersionSnafu {
        field: field.to_string(),
        version: version.to_string(),
    })?;
    Ok(())
}

impl Inventory {
    #[instrument(err)]
    pub fn from_path(path: &Path) -> Result<ClusterSpec> {
        let contents = std::fs::read_to_string(path).context(error::ReadInventorySnafu {
            path: path.to_path_buf(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates an inventory document. No cluster description is produced unless every check passes.
    pub fn from_yaml(contents: &str) -> Result<ClusterSpec> {
        let inventory: Inventory =
            serde_yaml::from_str(contents).context(error::ParseInventorySnafu)?;
        inventory.into_cluster_spec()
    }

    pub fn into_cluster_spec(self) -> Result<ClusterSpec> {
        self.validate().context(error::InvalidInventorySnafu)?;
        check_version("talos_version", &self.talos_version)?;
        if let Some(kubernetes_version) = &self.kubernetes_version {
            check_version("kubernetes_version", kubernetes_version)?;
        }

        let gateway = parse_ip("gateway", &self.gateway)?;
        let nameservers = self
            .nameservers
            .iter()
            .map(|ns| parse_ip("nameservers", ns))
            .collect::<Result<Vec<_>>>()?;

        let nodes = self
            .nodes
            .into_iter()
            .map(|node| {
                let ip = parse_ip(&format!("nodes.{}.ip", node.name), &node.ip)?;
                Ok(NodeSpec {
                    name: node.name,
                    ip,
                    role: node.role,
                    class: node.class,
                    cpu: node.cpu,
                    memory_mb: node.memory,
                    install_disk: node.install_disk,
                    image_profile: node.image_profile,
                    gpu: node.gpu,
                    hostname: node.hostname,
                    labels: node.labels,
                    taints: node.taints,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let endpoint_ip = match &self.cluster_endpoint_ip {
            Some(ip) => parse_ip("cluster_endpoint_ip", ip)?,
            None => match nodes.first() {
                Some(node) => node.ip,
                None => {
                    return error::NoNodesSnafu {
                        cluster: self.cluster_name,
                    }
                    .fail()
                }
            },
        };

        let cluster = ClusterSpec {
            name: self.cluster_name,
            talos_version: self.talos_version,
            kubernetes_version: self.kubernetes_version,
            gateway,
            endpoint_ip,
            nameservers,
            nodes,
            use_cilium: self.use_cilium,
            cilium_version: self.cilium_version,
            image_profiles: self.image_profiles,
            hypervisor: self.hypervisor,
            applications: self.applications,
        };
        cluster.validate()?;
        Ok(cluster)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::ClusterSpecError;

    const HOMELAB: &str = r#"
cluster_name: homelab
talos_version: v1.9.0
gateway: 10.0.0.1
use_cilium: true
image_profiles:
  default:
    extensions: [siderolabs/qemu-guest-agent]
  gpu:
    extensions: [siderolabs/nonfree-kmod-nvidia-production, siderolabs/nvidia-container-toolkit-production]
nodes:
  - name: cp-1
    ip: 10.0.0.10
    role: controlplane
  - name: gpu-1
    ip: 10.0.0.20
    role: worker
    type: external
    talos_image: gpu
    gpu: true
    memory: 8192
    labels:
      tier: compute
"#;

    #[test]
    fn test_inventory_defaults() {
        let cluster = Inventory::from_yaml(HOMELAB).unwrap();

        assert_eq!(cluster.name, "homelab");
        assert_eq!(cluster.endpoint_ip, "10.0.0.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cluster.cilium_version, DEFAULT_CILIUM_VERSION);
        assert_eq!(cluster.hypervisor, HypervisorSettings::default());
        assert_eq!(cluster.kubernetes_version, None);

        let cp = &cluster.nodes[0];
        assert_eq!(cp.class, NodeClass::Proxmox);
        assert_eq!(cp.cpu, 2);
        assert_eq!(cp.memory_mb, 2048);
        assert_eq!(cp.install_disk, "/dev/sda");
        assert_eq!(cp.image_profile, "default");

        let gpu = &cluster.nodes[1];
        assert_eq!(gpu.class, NodeClass::External);
        assert_eq!(gpu.image_profile, "gpu");
        assert!(gpu.gpu);
        assert_eq!(gpu.labels.get("tier").map(String::as_str), Some("compute"));
        assert_eq!(cluster.image_profiles["gpu"].platform, "nocloud");
    }

    #[test]
    fn test_inventory_rejections() {
        let test_cases = vec![
            (HOMELAB.replace("v1.9.0", "v1.9"), "InvalidInventory"),
            (HOMELAB.replace("gateway: 10.0.0.1", "gateway: 10.0.0"), "InvalidIp"),
            (HOMELAB.replace("ip: 10.0.0.20", "ip: 10.0.0.10"), "DuplicateNodeIp"),
            (HOMELAB.replace("talos_image: gpu", "talos_image: cuda"), "UnknownImageProfile"),
            (HOMELAB.replace("memory: 8192", "memory: 64"), "InvalidInventory"),
            (HOMELAB.replace("name: gpu-1", "name: GPU_1"), "InvalidInventory"),
            (HOMELAB.replace("cluster_name: homelab", "cluster_name: ../homelab"), "InvalidInventory"),
            (HOMELAB.replace("cluster_name: homelab", "cluster_name: lab/prod"), "InvalidInventory"),
            (HOMELAB.replace("cluster_name: homelab", "cluster_name: Homelab"), "InvalidInventory"),
            (HOMELAB.replace("cluster_name: homelab", "cluster_name: homelab-"), "InvalidInventory"),
            (
                HOMELAB.replace("cluster_name: homelab", &format!("cluster_name: {}", "a".repeat(64))),
                "InvalidInventory",
            ),
            (HOMELAB.replace("cluster_name: homelab", "cluster_name: \"\""), "InvalidInventory"),
            (
                HOMELAB.replace("gateway: 10.0.0.1", "gateway: 10.0.0.1\ncluster_endpoint_ip: 10.0.0.20"),
                "NoBootstrapNode",
            ),
            (HOMELAB.replace("role: controlplane", "role: worker"), "NoControlPlane"),
            (HOMELAB.replace("role: controlplane", "role: master"), "ParseInventory"),
        ];

        for (inventory, expected) in test_cases {
            let err = Inventory::from_yaml(&inventory).unwrap_err();
            let variant = match err {
                ClusterSpecError::InvalidInventory { .. } => "InvalidInventory",
                ClusterSpecError::InvalidIp { .. } => "InvalidIp",
                ClusterSpecError::DuplicateNodeIp { .. } => "DuplicateNodeIp",
                ClusterSpecError::UnknownImageProfile { .. } => "UnknownImageProfile",
                ClusterSpecError::NoBootstrapNode { .. } => "NoBootstrapNode",
                ClusterSpecError::NoControlPlane { .. } => "NoControlPlane",
                ClusterSpecError::ParseInventory { .. } => "ParseInventory",
                other => panic!("unexpected error: {}", other),
            };
            assert_eq!(variant, expected);
        }
    }

    #[test]
    fn test_empty_node_list() {
        let inventory = "cluster_name: x\ntalos_version: v1.9.0\ngateway: 10.0.0.1\nnodes: []\n";
        assert!(matches!(
            Inventory::from_yaml(inventory),
            Err(ClusterSpecError::NoNodes { .. })
        ));
    }
}
