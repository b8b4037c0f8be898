//! Inline manifests which install Cilium as the pod network once the API server is up.

use crate::constants::CILIUM_NAMESPACE;

pub const VALUES_MANIFEST_NAME: &str = "cilium-values";
pub const INSTALL_MANIFEST_NAME: &str = "cilium-install";

/// Helm values which fit Talos: kube-proxy replacement through KubePrism, cgroup v2 already mounted.
fn values() -> String {
    [
        "ipam:",
        "  mode: kubernetes",
        "kubeProxyReplacement: true",
        "k8sServiceHost: localhost",
        "k8sServicePort: 7445",
        "cgroup:",
        "  autoMount:",
        "    enabled: false",
        "  hostRoot: /sys/fs/cgroup",
        "securityContext:",
        "  capabilities:",
        "    ciliumAgent: [CHOWN, KILL, NET_ADMIN, NET_RAW, IPC_LOCK, SYS_ADMIN, SYS_RESOURCE, DAC_OVERRIDE, FOWNER, SETGID, SETUID]",
        "    cleanCiliumState: [NET_ADMIN, SYS_ADMIN, SYS_RESOURCE]",
    ]
    .join("\n")
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The ConfigMap carrying the Helm values consumed by the install job.
pub fn values_manifest() -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n  namespace: {}\ndata:\n  values.yaml: |\n{}\n",
        VALUES_MANIFEST_NAME,
        CILIUM_NAMESPACE,
        indent(&values(), 4)
    )
}

/// A one-shot Job which runs `cilium install` from the control plane with host networking.
pub fn install_manifest(cilium_version: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: {name}
  namespace: {namespace}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {name}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: cluster-admin
subjects:
  - kind: ServiceAccount
    name: {name}
    namespace: {namespace}
---
apiVersion: batch/v1
kind: Job
metadata:
  name: {name}
  namespace: {namespace}
spec:
  backoffLimit: 10
  template:
    metadata:
      labels:
        app: {name}
    spec:
      restartPolicy: OnFailure
      serviceAccountName: {name}
      hostNetwork: true
      tolerations:
        - operator: Exists
      affinity:
        nodeAffinity:
          requiredDuringSchedulingIgnoredDuringExecution:
            nodeSelectorTerms:
              - matchExpressions:
                  - key: node-role.kubernetes.io/control-plane
                    operator: Exists
      containers:
        - name: cilium-install
          image: quay.io/cilium/cilium-cli-ci:latest
          env:
            - name: KUBERNETES_SERVICE_HOST
              valueFrom:
                fieldRef:
                  apiVersion: v1
                  fieldPath: status.podIP
            - name: KUBERNETES_SERVICE_PORT
              value: "6443"
          command:
            - cilium
            - install
            - --version={version}
            - --values=/values/values.yaml
          volumeMounts:
            - name: values
              mountPath: /values
      volumes:
        - name: values
          configMap:
            name: {values}
"#,
        name = INSTALL_MANIFEST_NAME,
        namespace = CILIUM_NAMESPACE,
        version = cilium_version,
        values = VALUES_MANIFEST_NAME,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_manifests_are_valid_yaml() {
        let values: serde_yaml::Value = serde_yaml::from_str(&values_manifest()).unwrap();
        assert_eq!(values["kind"], "ConfigMap");
        let inner: serde_yaml::Value =
            serde_yaml::from_str(values["data"]["values.yaml"].as_str().unwrap()).unwrap();
        assert_eq!(inner["kubeProxyReplacement"], true);

        let install = install_manifest("1.16.0");
        let docs: Vec<serde_yaml::Value> = install
            .split("\n---\n")
            .map(|doc| serde_yaml::from_str(doc).unwrap())
            .collect();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[2]["kind"], "Job");
        assert!(install.contains("--version=1.16.0"));
    }
}
