/*!
Machine configuration for a single node, computed from the cluster description.

The document is assembled bottom-up: every concern (network identity, kubelet flags, install target, cluster
bootstrap directives, GPU support, operator labels and taints) contributes a patch, and patches are folded into
the document with `merge`. Nothing here performs I/O, so identical inputs always produce identical documents.
*/

pub mod cilium;

use crate::cluster::{ClusterSpec, NodeRole, NodeSpec};
use crate::constants::{
    CONTAINERD_CRI_FRAGMENT_PATH, DEFAULT_ROUTE, GPU_BPF_JIT_HARDEN_SYSCTL, GPU_KERNEL_MODULES,
    GPU_PRESENT_LABEL, KUBELET_SERVING_CERT_APPROVER_URL, METRICS_SERVER_URL, NODE_PREFIX_LENGTH,
};
use crate::deferred::Deferred;

use k8s_openapi::api::core::v1::Taint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Registers the NVIDIA runtime as containerd's default so GPU workloads need no runtime class.
const NVIDIA_CRI_FRAGMENT: &str = r#"[plugins]
  [plugins."io.containerd.grpc.v1.cri"]
    [plugins."io.containerd.grpc.v1.cri".containerd]
      default_runtime_name = "nvidia"
"#;

/// The per-node configuration patch applied on top of the generated base configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineConfigDocument {
    pub node: String,
    pub machine_type: NodeRole,
    pub patch: Value,
}

impl MachineConfigDocument {
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(&self.patch)
    }

    /// Looks up a value by its path of object keys, e.g. `["machine", "install", "image"]`.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.patch, |value, key| value.as_object()?.get(*key))
    }
}

/// Deep-merges `patch` into `base`. Objects merge key by key; any other value in `patch` replaces the one in `base`.
pub fn merge(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

/// Sets the value at `path`, discarding whatever was there before.
pub fn replace(base: Value, path: &[&str], value: Value) -> Value {
    let (head, rest) = match path.split_first() {
        Some(split) => split,
        None => return value,
    };
    let mut object = match base {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    let child = object.remove(*head).unwrap_or(Value::Null);
    object.insert(head.to_string(), replace(child, rest, value));
    Value::Object(object)
}

pub fn network_patch(
    hostname: &str,
    ip: Ipv4Addr,
    gateway: Ipv4Addr,
    nameservers: &[Ipv4Addr],
) -> Value {
    json!({
        "machine": {
            "network": {
                "hostname": hostname,
                "interfaces": [{
                    "deviceSelector": {"physical": true},
                    "addresses": [format!("{}/{}", ip, NODE_PREFIX_LENGTH)],
                    "routes": [{"network": DEFAULT_ROUTE, "gateway": gateway.to_string()}],
                }],
                "nameservers": nameservers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }
        }
    })
}

pub fn kubelet_patch() -> Value {
    json!({
        "machine": {
            "kubelet": {
                "extraArgs": {"rotate-server-certificates": "true"}
            }
        }
    })
}

/// The install target. The disk is always wiped: changing `install_disk` of an existing node reinstalls it and
/// loses the data on the new disk.
pub fn install_patch(disk: &str, image: &str) -> Value {
    json!({
        "machine": {
            "install": {"disk": disk, "image": image, "wipe": true}
        }
    })
}

/// Bootstrap directives for control-plane nodes. With an overlay CNI the built-in CNI and kube-proxy are
/// disabled and the overlay is installed from inline manifests; otherwise only the add-on manifests are added.
pub fn cluster_patch(use_cilium: bool, cilium_version: &str) -> Value {
    let extra_manifests = json!([KUBELET_SERVING_CERT_APPROVER_URL, METRICS_SERVER_URL]);
    if use_cilium {
        json!({
            "cluster": {
                "network": {"cni": {"name": "none"}},
                "proxy": {"disabled": true},
                "inlineManifests": [
                    {"name": cilium::VALUES_MANIFEST_NAME, "contents": cilium::values_manifest()},
                    {"name": cilium::INSTALL_MANIFEST_NAME, "contents": cilium::install_manifest(cilium_version)},
                ],
                "extraManifests": extra_manifests,
            }
        })
    } else {
        json!({
            "cluster": {"extraManifests": extra_manifests}
        })
    }
}

pub fn gpu_patch() -> Value {
    let modules: Vec<Value> = GPU_KERNEL_MODULES
        .iter()
        .map(|module| json!({ "name": module }))
        .collect();
    json!({
        "machine": {
            "nodeLabels": {GPU_PRESENT_LABEL: "true"},
            "kernel": {"modules": modules},
            "sysctls": {GPU_BPF_JIT_HARDEN_SYSCTL: "1"},
            "files": [{
                "content": NVIDIA_CRI_FRAGMENT,
                "path": CONTAINERD_CRI_FRAGMENT_PATH,
                "op": "create",
            }],
        }
    })
}

pub fn labels_patch(labels: &BTreeMap<String, String>) -> Value {
    json!({ "machine": { "nodeLabels": labels } })
}

/// Taints in the `key: value:Effect` form used by `machine.nodeTaints`.
pub fn taints_value(taints: &[Taint]) -> Value {
    let taints: BTreeMap<&str, String> = taints
        .iter()
        .map(|taint| {
            let value = match &taint.value {
                Some(value) if !value.is_empty() => format!("{}:{}", value, taint.effect),
                _ => taint.effect.clone(),
            };
            (taint.key.as_str(), value)
        })
        .collect();
    json!(taints)
}

/// Computes machine configuration for the nodes of one cluster.
#[derive(Clone, Debug)]
pub struct MachineConfigBuilder {
    gateway: Ipv4Addr,
    nameservers: Vec<Ipv4Addr>,
    use_cilium: bool,
    cilium_version: String,
}

impl MachineConfigBuilder {
    pub fn new(cluster: &ClusterSpec) -> Self {
        MachineConfigBuilder {
            gateway: cluster.gateway,
            nameservers: cluster.effective_nameservers(),
            use_cilium: cluster.use_cilium,
            cilium_version: cluster.cilium_version.clone(),
        }
    }

    pub fn build(&self, node: &NodeSpec, installer_image: &str) -> MachineConfigDocument {
        let mut patches = vec![
            network_patch(node.hostname(), node.ip, self.gateway, &self.nameservers),
            kubelet_patch(),
            install_patch(&node.install_disk, installer_image),
        ];
        if node.is_control_plane() {
            patches.push(cluster_patch(self.use_cilium, &self.cilium_version));
        }
        if node.gpu {
            patches.push(gpu_patch());
        }
        if !node.labels.is_empty() {
            patches.push(labels_patch(&node.labels));
        }

        let mut patch = patches.into_iter().fold(json!({}), merge);
        if !node.taints.is_empty() {
            patch = replace(patch, &["machine", "nodeTaints"], taints_value(&node.taints));
        }

        MachineConfigDocument {
            node: node.name.clone(),
            machine_type: node.role,
            patch,
        }
    }

    /// Builds the document once the installer image is known.
    pub fn build_deferred<E>(
        &self,
        node: &NodeSpec,
        installer_image: &Deferred<String, E>,
    ) -> Deferred<MachineConfigDocument, E>
    where
        E: Send + Sync + 'static,
    {
        let builder = self.clone();
        let node = node.clone();
        installer_image.map(move |image| builder.build(&node, &image))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test::{fake_cluster, fake_node};
    use maplit::btreemap;

    const INSTALLER: &str = "factory.talos.dev/nocloud-installer/abc:v1.9.0";

    fn cluster(use_cilium: bool) -> ClusterSpec {
        let mut cluster = fake_cluster(vec![
            fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane),
            fake_node("w-1", "10.0.0.20", NodeRole::Worker),
        ]);
        cluster.use_cilium = use_cilium;
        cluster
    }

    #[test]
    fn test_merge() {
        let base = json!({"machine": {"nodeLabels": {"a": "1", "b": "2"}, "files": [1]}});
        let patch = json!({"machine": {"nodeLabels": {"b": "3"}, "files": [2]}});
        assert_eq!(
            merge(base, patch),
            json!({"machine": {"nodeLabels": {"a": "1", "b": "3"}, "files": [2]}})
        );
        assert_eq!(
            replace(json!({"machine": {"nodeTaints": {"old": "NoSchedule"}}}), &["machine", "nodeTaints"], json!({})),
            json!({"machine": {"nodeTaints": {}}})
        );
    }

    #[test]
    fn test_deterministic() {
        let cluster = cluster(true);
        let builder = MachineConfigBuilder::new(&cluster);
        let first = builder.build(&cluster.nodes[0], INSTALLER).to_yaml().unwrap();
        let second = MachineConfigBuilder::new(&cluster)
            .build(&cluster.nodes[0], INSTALLER)
            .to_yaml()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_common_sections() {
        let cluster = cluster(false);
        let doc = MachineConfigBuilder::new(&cluster).build(&cluster.nodes[1], INSTALLER);

        assert_eq!(doc.get(&["machine", "network", "hostname"]), Some(&json!("w-1")));
        assert_eq!(
            doc.get(&["machine", "network", "interfaces"]),
            Some(&json!([{
                "deviceSelector": {"physical": true},
                "addresses": ["10.0.0.20/24"],
                "routes": [{"network": "0.0.0.0/0", "gateway": "10.0.0.1"}],
            }]))
        );
        assert_eq!(doc.get(&["machine", "network", "nameservers"]), Some(&json!(["10.0.0.1"])));
        assert_eq!(
            doc.get(&["machine", "kubelet", "extraArgs", "rotate-server-certificates"]),
            Some(&json!("true"))
        );
        assert_eq!(
            doc.get(&["machine", "install"]),
            Some(&json!({"disk": "/dev/sda", "image": INSTALLER, "wipe": true}))
        );
        // Workers never carry cluster directives.
        assert_eq!(doc.get(&["cluster"]), None);
    }

    #[test]
    fn test_cni_branch_exclusivity() {
        for use_cilium in [true, false] {
            let cluster = cluster(use_cilium);
            let doc = MachineConfigBuilder::new(&cluster).build(&cluster.nodes[0], INSTALLER);

            let cni_disabled = doc.get(&["cluster", "network", "cni", "name"]) == Some(&json!("none"));
            let proxy_disabled = doc.get(&["cluster", "proxy", "disabled"]) == Some(&json!(true));
            let inline = doc
                .get(&["cluster", "inlineManifests"])
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);

            assert_eq!(cni_disabled, use_cilium);
            assert_eq!(proxy_disabled, use_cilium);
            assert_eq!(inline, if use_cilium { 2 } else { 0 });
            assert_eq!(
                doc.get(&["cluster", "extraManifests"]),
                Some(&json!([KUBELET_SERVING_CERT_APPROVER_URL, METRICS_SERVER_URL]))
            );
        }
    }

    #[test]
    fn test_gpu_patch_isolation() {
        let mut cluster = cluster(false);
        let builder = MachineConfigBuilder::new(&cluster);

        let plain = builder.build(&cluster.nodes[1], INSTALLER);
        assert_eq!(plain.get(&["machine", "kernel"]), None);
        assert_eq!(plain.get(&["machine", "nodeLabels"]), None);
        assert_eq!(plain.get(&["machine", "files"]), None);
        assert_eq!(plain.get(&["machine", "sysctls"]), None);

        cluster.nodes[1].gpu = true;
        let gpu = builder.build(&cluster.nodes[1], INSTALLER);
        assert_eq!(
            gpu.get(&["machine", "nodeLabels", GPU_PRESENT_LABEL]),
            Some(&json!("true"))
        );
        assert_eq!(
            gpu.get(&["machine", "kernel", "modules"]),
            Some(&json!([
                {"name": "nvidia"},
                {"name": "nvidia_uvm"},
                {"name": "nvidia_drm"},
                {"name": "nvidia_modeset"}
            ]))
        );
        assert_eq!(
            gpu.get(&["machine", "files"]).and_then(|files| files[0].get("path")),
            Some(&json!(CONTAINERD_CRI_FRAGMENT_PATH))
        );
        assert_eq!(
            gpu.get(&["machine", "sysctls", GPU_BPF_JIT_HARDEN_SYSCTL]),
            Some(&json!("1"))
        );
    }

    #[test]
    fn test_user_labels_and_taints_win() {
        let mut cluster = cluster(false);
        let node = &mut cluster.nodes[1];
        node.gpu = true;
        node.hostname = Some("gpu-box".to_string());
        node.labels = btreemap! {
            GPU_PRESENT_LABEL.to_string() => "false".to_string(),
            "tier".to_string() => "compute".to_string(),
        };
        node.taints = vec![
            Taint {
                key: "nvidia.com/gpu".to_string(),
                value: Some("present".to_string()),
                effect: "NoSchedule".to_string(),
                time_added: None,
            },
            Taint {
                key: "dedicated".to_string(),
                value: None,
                effect: "NoExecute".to_string(),
                time_added: None,
            },
        ];

        let doc = MachineConfigBuilder::new(&cluster).build(&cluster.nodes[1], INSTALLER);
        assert_eq!(doc.get(&["machine", "network", "hostname"]), Some(&json!("gpu-box")));
        assert_eq!(
            doc.get(&["machine", "nodeLabels"]),
            Some(&json!({GPU_PRESENT_LABEL: "false", "tier": "compute"}))
        );
        assert_eq!(
            doc.get(&["machine", "nodeTaints"]),
            Some(&json!({"nvidia.com/gpu": "present:NoSchedule", "dedicated": "NoExecute"}))
        );
    }

    #[tokio::test]
    async fn test_deferred_installer_image() {
        let cluster = cluster(false);
        let builder = MachineConfigBuilder::new(&cluster);
        let image: Deferred<String, ()> = Deferred::new(async { Ok(INSTALLER.to_string()) });

        let doc = builder.build_deferred(&cluster.nodes[0], &image);
        assert!(doc.peek().is_none());
        let doc = doc.resolve().await.unwrap();
        assert_eq!(doc.get(&["machine", "install", "image"]), Some(&json!(INSTALLER)));
    }
}
