use crate::cluster::{HypervisorSettings, NodeSpec};
use crate::constants::NODE_PREFIX_LENGTH;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CpuSpec {
    pub cores: u32,
    pub sockets: u32,
    #[serde(rename = "type")]
    pub cpu_type: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub interface: String,
    pub size_gb: u32,
    pub datastore: String,
    pub format: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EfiDiskSpec {
    pub datastore: String,
    pub format: String,
    #[serde(rename = "type")]
    pub efi_type: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NicSpec {
    pub model: String,
    pub bridge: String,
}

/// The cloud-init style network block handed to the VM at first boot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CloudInitSpec {
    pub datastore: String,
    pub interface: String,
    #[serde(rename = "type")]
    pub init_type: String,
    /// Address with prefix, e.g. `10.0.0.10/24`.
    pub address: String,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CdromSpec {
    pub file_id: String,
    pub interface: String,
}

/// Everything the hypervisor needs to create a node's VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmRequest {
    pub name: String,
    pub hypervisor_node: String,
    /// UEFI firmware.
    pub bios: String,
    pub efi_disk: EfiDiskSpec,
    pub cpu: CpuSpec,
    pub memory_mb: u32,
    pub disk: DiskSpec,
    pub nic: NicSpec,
    pub cloud_init: CloudInitSpec,
    pub cdrom: CdromSpec,
    pub boot_order: Vec<String>,
    pub agent_type: String,
}

impl VmRequest {
    pub fn for_node(
        node: &NodeSpec,
        settings: &HypervisorSettings,
        gateway: Ipv4Addr,
        dns_servers: &[Ipv4Addr],
        iso_file_id: &str,
    ) -> Self {
        VmRequest {
            name: node.name.clone(),
            hypervisor_node: settings.node_name.clone(),
            bios: "ovmf".to_string(),
            efi_disk: EfiDiskSpec {
                datastore: settings.vm_datastore.clone(),
                format: "raw".to_string(),
                efi_type: "4m".to_string(),
            },
            cpu: CpuSpec {
                cores: node.cpu,
                sockets: 1,
                cpu_type: "host".to_string(),
            },
            memory_mb: node.memory_mb,
            disk: DiskSpec {
                interface: "scsi0".to_string(),
                size_gb: settings.disk_size_gb,
                datastore: settings.vm_datastore.clone(),
                format: "raw".to_string(),
            },
            nic: NicSpec {
                model: "virtio".to_string(),
                bridge: settings.bridge.clone(),
            },
            cloud_init: CloudInitSpec {
                datastore: settings.vm_datastore.clone(),
                interface: "ide0".to_string(),
                init_type: "nocloud".to_string(),
                address: format!("{}/{}", node.ip, NODE_PREFIX_LENGTH),
                gateway,
                dns_servers: dns_servers.to_vec(),
            },
            cdrom: CdromSpec {
                file_id: iso_file_id.to_string(),
                interface: "ide2".to_string(),
            },
            boot_order: vec!["scsi0".to_string()],
            agent_type: "virtio".to_string(),
        }
    }
}

/// A request to fetch a remote file into hypervisor storage.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub hypervisor_node: String,
    pub datastore: String,
    pub content_type: String,
    pub file_name: String,
    pub url: String,
    /// Replace an existing file of the same name.
    pub overwrite: bool,
}

impl DownloadRequest {
    /// The volume id under which the file will be stored, e.g. `local:iso/talos.iso`.
    pub fn file_id(&self) -> String {
        format!("{}:{}/{}", self.datastore, self.content_type, self.file_name)
    }
}

/// A VM known to the hypervisor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmHandle {
    pub vm_id: u32,
    pub name: String,
    pub hypervisor_node: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test::fake_node;
    use crate::cluster::NodeRole;

    #[test]
    fn test_vm_request_shape() {
        let node = fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane);
        let request = VmRequest::for_node(
            &node,
            &HypervisorSettings::default(),
            "10.0.0.1".parse().unwrap(),
            &["10.0.0.1".parse().unwrap()],
            "local:iso/talos-v1.9.0-abc-nocloud-amd64.iso",
        );

        assert_eq!(request.hypervisor_node, "pve01");
        assert_eq!(request.cloud_init.address, "10.0.0.10/24");
        assert_eq!(request.disk.size_gb, 20);
        assert_eq!(request.disk.datastore, "local-lvm");
        assert_eq!(request.cpu.cores, 2);
        assert_eq!(request.boot_order, vec!["scsi0".to_string()]);
        assert_eq!(request.cdrom.interface, "ide2");
    }

    #[test]
    fn test_download_file_id() {
        let request = DownloadRequest {
            hypervisor_node: "pve01".to_string(),
            datastore: "local".to_string(),
            content_type: "iso".to_string(),
            file_name: "talos.iso".to_string(),
            url: "https://factory.talos.dev/image/abc/v1.9.0/nocloud-amd64.iso".to_string(),
            overwrite: true,
        };
        assert_eq!(request.file_id(), "local:iso/talos.iso");
    }
}
