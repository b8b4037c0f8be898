// Kubernetes / Talos endpoints
pub const KUBERNETES_API_PORT: u16 = 6443; // The port the Kubernetes API server listens on.
pub const NODE_PREFIX_LENGTH: u8 = 24; // Static addresses are always assigned a /24.
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

// Image factory
pub const DEFAULT_IMAGE_FACTORY_URL: &str = "https://factory.talos.dev";
pub const DEFAULT_PLATFORM: &str = "nocloud";
pub const DEFAULT_ARCH: &str = "amd64";
pub const DEFAULT_IMAGE_PROFILE: &str = "default";
pub const SCHEMATIC_SLOT_PREFIX_LEN: usize = 12; // How much of the schematic id is kept in ISO file names.

// Node defaults, applied when the inventory leaves them out.
pub const DEFAULT_NODE_CPU: u32 = 2;
pub const DEFAULT_NODE_MEMORY_MB: u32 = 2048;
pub const DEFAULT_INSTALL_DISK: &str = "/dev/sda";
pub const DEFAULT_VM_DISK_SIZE_GB: u32 = 20;

// Proxmox defaults
pub const DEFAULT_PROXMOX_NODE: &str = "pve01";
pub const DEFAULT_ISO_DATASTORE: &str = "local";
pub const DEFAULT_VM_DATASTORE: &str = "local-lvm";
pub const DEFAULT_BRIDGE: &str = "vmbr0";

// Cilium
pub const DEFAULT_CILIUM_VERSION: &str = "1.16.0";
pub const CILIUM_NAMESPACE: &str = "kube-system";

// Add-on manifests injected into every control-plane config.
pub const KUBELET_SERVING_CERT_APPROVER_URL: &str =
    "https://raw.githubusercontent.com/alex1989hu/kubelet-serving-cert-approver/main/deploy/standalone-install.yaml";
pub const METRICS_SERVER_URL: &str =
    "https://github.com/kubernetes-sigs/metrics-server/releases/latest/download/components.yaml";

// GPU
pub const GPU_PRESENT_LABEL: &str = "nvidia.com/gpu.present";
pub const GPU_KERNEL_MODULES: [&str; 4] = ["nvidia", "nvidia_uvm", "nvidia_drm", "nvidia_modeset"];
pub const GPU_BPF_JIT_HARDEN_SYSCTL: &str = "net.core.bpf_jit_harden";
pub const CONTAINERD_CRI_FRAGMENT_PATH: &str = "/etc/cri/conf.d/20-customization.part";
