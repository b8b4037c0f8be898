/*!
The cluster lifecycle engine.

`ClusterOrchestrator` turns a `ClusterSpec` into a running cluster: it creates the cluster's secrets, resolves
OS images, provisions every node concurrently and gates downstream work on cluster health. `UpgradeSequencer`
rolls a new OS version through an existing cluster one node at a time.
*/

pub mod cancel;
pub mod chain;
pub mod deploy;
pub mod error;
pub mod health;
pub mod image;
pub mod orchestrator;
pub mod provisioner;
pub mod secrets;
pub mod upgrade;

pub use crate::cancel::Cancellation;
pub use crate::deploy::ApplicationGate;
pub use crate::error::{Error, ErrorKind};
pub use crate::health::{HealthGate, HealthGateSettings, HealthyCluster};
pub use crate::image::{ImageAssetResolver, ResolvedImage};
pub use crate::orchestrator::{ClusterOrchestrator, ClusterOutputs, OrchestratorClients};
pub use crate::provisioner::NodeProvisioner;
pub use crate::secrets::SecretsFactory;
pub use crate::upgrade::{UpgradeSequencer, UpgradeSettings};

#[cfg(test)]
pub(crate) mod test {
    use maplit::btreemap;
    use models::cluster::{
        ClusterSpec, HypervisorSettings, ImageProfile, NodeClass, NodeRole, NodeSpec,
    };
    use std::collections::BTreeMap;

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

    /// Two control-plane nodes, a plain worker and a GPU worker. `cp-1` holds the endpoint IP.
    pub(crate) fn fake_cluster() -> ClusterSpec {
        let mut gpu_worker = fake_node("w-2", "10.0.0.21", NodeRole::Worker);
        gpu_worker.gpu = true;
        gpu_worker.image_profile = "gpu".to_string();

        ClusterSpec {
            name: "homelab".to_string(),
            talos_version: "v1.9.0".to_string(),
            kubernetes_version: None,
            gateway: "10.0.0.1".parse().unwrap(),
            endpoint_ip: "10.0.0.10".parse().unwrap(),
            nameservers: Vec::new(),
            nodes: vec![
                fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
                fake_node("cp-2", "10.0.0.11", NodeRole::ControlPlane),
                fake_node("w-1", "10.0.0.20", NodeRole::Worker),
                gpu_worker,
            ],
            use_cilium: true,
            cilium_version: "1.16.0".to_string(),
            image_profiles: btreemap! {
                "default".to_string() => ImageProfile {
                    extensions: vec!["siderolabs/qemu-guest-agent".to_string()],
                    ..Default::default()
                },
                "gpu".to_string() => ImageProfile {
                    extensions: vec![
                        "siderolabs/nvidia-container-toolkit-production".to_string(),
                        "siderolabs/nonfree-kmod-nvidia-production".to_string(),
                    ],
                    ..Default::default()
                },
            },
            hypervisor: HypervisorSettings::default(),
            applications: Vec::new(),
        }
    }
}
