/*!
Interfaces to the external collaborators of the lifecycle engine.

Each collaborator is a trait so that tests can substitute mocks. The concrete implementations shell out to
`talosctl`/`helm`/`kubectl` or speak HTTP to the image factory and the Proxmox VE API.
*/

mod error;
mod factory;
mod fs;
mod helm;
mod proxmox;
mod state;
mod talosctl;

pub use self::error::{ClientError, Result};
pub use self::factory::HttpImageFactoryClient;
pub use self::fs::{write_private_file, PRIVATE_FILE_MODE};
pub use self::helm::HelmDeployer;
pub use self::proxmox::{ProxmoxClient, ProxmoxSettings};
pub use self::state::{FileStateStore, MemoryStateStore};
pub use self::talosctl::TalosctlClient;

use crate::cluster::{NodeRole, ReleaseDescriptor};
use crate::image::{ImageAsset, Schematic, SchematicId};
use crate::node::{DownloadRequest, NodeRecord, VmHandle, VmRequest};
use crate::secrets::{MachineSecrets, SecretsBundle, TalosConfig};

use async_trait::async_trait;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

/// Inputs to the OS configuration generator.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateConfigRequest {
    pub cluster_name: String,
    pub machine_type: NodeRole,
    pub cluster_endpoint: String,
    pub secrets: MachineSecrets,
    /// YAML patches applied in order on top of the generated configuration.
    pub patches: Vec<String>,
    pub kubernetes_version: Option<String>,
}

/// Everything in a `GenerateConfigRequest` that changes the generated document, except the secrets.
#[derive(Serialize)]
struct RenderInputs<'a> {
    cluster_name: &'a str,
    machine_type: NodeRole,
    cluster_endpoint: &'a str,
    kubernetes_version: Option<&'a str>,
    patches: &'a [String],
}

impl GenerateConfigRequest {
    /// A stable rendering of the request's non-secret inputs. Two requests with the same fingerprint generate
    /// the same configuration for a given secrets bundle.
    pub fn fingerprint(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(&RenderInputs {
            cluster_name: &self.cluster_name,
            machine_type: self.machine_type,
            cluster_endpoint: &self.cluster_endpoint,
            kubernetes_version: self.kubernetes_version.as_deref(),
            patches: &self.patches,
        })
    }
}

/// Flags forwarded verbatim to the OS upgrade action.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpgradeOptions {
    /// Keep the ephemeral partition's data.
    pub preserve: bool,
    /// Stage the upgrade to be performed on the next reboot.
    pub stage: bool,
    pub force: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        UpgradeOptions {
            preserve: true,
            stage: false,
            force: false,
        }
    }
}

#[async_trait]
/// The OS management API of the cluster's nodes.
pub trait TalosClient: Clone + Sized + Send + Sync {
    /// Installs the administrative credentials used by every later call.
    async fn configure(&self, talosconfig: &TalosConfig) -> Result<()>;
    /// Renders a complete machine configuration from the cluster secrets and the given patches.
    async fn generate_config(&self, request: &GenerateConfigRequest) -> Result<String>;
    /// Submits a machine configuration to a node. Nodes still in maintenance mode are handled transparently.
    async fn apply_config(&self, node: Ipv4Addr, config: &str) -> Result<()>;
    async fn bootstrap(&self, node: Ipv4Addr) -> Result<()>;
    async fn kubeconfig(&self, node: Ipv4Addr) -> Result<String>;
    /// Runs the aggregate cluster health check against a node, giving up after `timeout`.
    async fn health(&self, node: Ipv4Addr, timeout: Duration) -> Result<()>;
    /// The OS version tag reported by the node, e.g. `v1.9.0`.
    async fn version(&self, node: Ipv4Addr) -> Result<String>;
    async fn upgrade(&self, node: Ipv4Addr, image: &str, options: &UpgradeOptions) -> Result<()>;
}

#[async_trait]
/// The service which builds OS images from schematics.
pub trait ImageFactoryClient: Clone + Sized + Send + Sync {
    fn base_url(&self) -> String;
    async fn submit_schematic(&self, schematic: &Schematic) -> Result<SchematicId>;
}

#[async_trait]
/// The hypervisor which hosts the cluster's VMs.
pub trait HypervisorClient: Clone + Sized + Send + Sync {
    async fn find_vm(&self, hypervisor_node: &str, name: &str) -> Result<Option<VmHandle>>;
    /// Creates and starts a VM.
    async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle>;
    /// Fetches a file into hypervisor storage and returns its volume id.
    async fn download_file(&self, request: &DownloadRequest) -> Result<String>;
}

#[async_trait]
/// The application-deployment layer installed on top of a healthy cluster.
pub trait ApplicationDeployer: Clone + Sized + Send + Sync {
    async fn install_release(&self, namespace: &str, release: &ReleaseDescriptor) -> Result<()>;
    async fn apply_manifests(&self, namespace: &str, manifests: &[PathBuf]) -> Result<()>;
}

#[async_trait]
/// Durable memory of what has been done to a cluster, so that re-runs converge instead of repeating work.
pub trait StateStore: Clone + Sized + Send + Sync {
    async fn load_secrets(&self, cluster: &str) -> Result<Option<SecretsBundle>>;
    async fn save_secrets(&self, bundle: &SecretsBundle) -> Result<()>;
    /// Returns an empty record for nodes never seen before.
    async fn load_node(&self, cluster: &str, node: &str) -> Result<NodeRecord>;
    async fn save_node(&self, cluster: &str, node: &str, record: &NodeRecord) -> Result<()>;
    async fn load_image(&self, cluster: &str, profile: &str) -> Result<Option<ImageAsset>>;
    async fn save_image(&self, cluster: &str, asset: &ImageAsset) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock TalosClient for use in tests.
    pub TalosClient {}
    #[async_trait]
    impl TalosClient for TalosClient {
        async fn configure(&self, talosconfig: &TalosConfig) -> Result<()>;
        async fn generate_config(&self, request: &GenerateConfigRequest) -> Result<String>;
        async fn apply_config(&self, node: Ipv4Addr, config: &str) -> Result<()>;
        async fn bootstrap(&self, node: Ipv4Addr) -> Result<()>;
        async fn kubeconfig(&self, node: Ipv4Addr) -> Result<String>;
        async fn health(&self, node: Ipv4Addr, timeout: Duration) -> Result<()>;
        async fn version(&self, node: Ipv4Addr) -> Result<String>;
        async fn upgrade(&self, node: Ipv4Addr, image: &str, options: &UpgradeOptions) -> Result<()>;
    }

    impl Clone for TalosClient {
        fn clone(&self) -> Self;
    }
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ImageFactoryClient for use in tests.
    pub ImageFactoryClient {}
    #[async_trait]
    impl ImageFactoryClient for ImageFactoryClient {
        fn base_url(&self) -> String;
        async fn submit_schematic(&self, schematic: &Schematic) -> Result<SchematicId>;
    }

    impl Clone for ImageFactoryClient {
        fn clone(&self) -> Self;
    }
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock HypervisorClient for use in tests.
    pub HypervisorClient {}
    #[async_trait]
    impl HypervisorClient for HypervisorClient {
        async fn find_vm(&self, hypervisor_node: &str, name: &str) -> Result<Option<VmHandle>>;
        async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle>;
        async fn download_file(&self, request: &DownloadRequest) -> Result<String>;
    }

    impl Clone for HypervisorClient {
        fn clone(&self) -> Self;
    }
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ApplicationDeployer for use in tests.
    pub ApplicationDeployer {}
    #[async_trait]
    impl ApplicationDeployer for ApplicationDeployer {
        async fn install_release(&self, namespace: &str, release: &ReleaseDescriptor) -> Result<()>;
        async fn apply_manifests(&self, namespace: &str, manifests: &[PathBuf]) -> Result<()>;
    }

    impl Clone for ApplicationDeployer {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> TalosClient for Arc<T>
where
    T: TalosClient,
{
    async fn configure(&self, talosconfig: &TalosConfig) -> Result<()> {
        (**self).configure(talosconfig).await
    }

    async fn generate_config(&self, request: &GenerateConfigRequest) -> Result<String> {
        (**self).generate_config(request).await
    }

    async fn apply_config(&self, node: Ipv4Addr, config: &str) -> Result<()> {
        (**self).apply_config(node, config).await
    }

    async fn bootstrap(&self, node: Ipv4Addr) -> Result<()> {
        (**self).bootstrap(node).await
    }

    async fn kubeconfig(&self, node: Ipv4Addr) -> Result<String> {
        (**self).kubeconfig(node).await
    }

    async fn health(&self, node: Ipv4Addr, timeout: Duration) -> Result<()> {
        (**self).health(node, timeout).await
    }

    async fn version(&self, node: Ipv4Addr) -> Result<String> {
        (**self).version(node).await
    }

    async fn upgrade(&self, node: Ipv4Addr, image: &str, options: &UpgradeOptions) -> Result<()> {
        (**self).upgrade(node, image, options).await
    }
}

#[async_trait]
impl<T> ImageFactoryClient for Arc<T>
where
    T: ImageFactoryClient,
{
    fn base_url(&self) -> String {
        (**self).base_url()
    }

    async fn submit_schematic(&self, schematic: &Schematic) -> Result<SchematicId> {
        (**self).submit_schematic(schematic).await
    }
}

#[async_trait]
impl<T> HypervisorClient for Arc<T>
where
    T: HypervisorClient,
{
    async fn find_vm(&self, hypervisor_node: &str, name: &str) -> Result<Option<VmHandle>> {
        (**self).find_vm(hypervisor_node, name).await
    }

    async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle> {
        (**self).create_vm(request).await
    }

    async fn download_file(&self, request: &DownloadRequest) -> Result<String> {
        (**self).download_file(request).await
    }
}

#[async_trait]
impl<T> ApplicationDeployer for Arc<T>
where
    T: ApplicationDeployer,
{
    async fn install_release(&self, namespace: &str, release: &ReleaseDescriptor) -> Result<()> {
        (**self).install_release(namespace, release).await
    }

    async fn apply_manifests(&self, namespace: &str, manifests: &[PathBuf]) -> Result<()> {
        (**self).apply_manifests(namespace, manifests).await
    }
}

#[async_trait]
impl<T> StateStore for Arc<T>
where
    T: StateStore,
{
    async fn load_secrets(&self, cluster: &str) -> Result<Option<SecretsBundle>> {
        (**self).load_secrets(cluster).await
    }

    async fn save_secrets(&self, bundle: &SecretsBundle) -> Result<()> {
        (**self).save_secrets(bundle).await
    }

    async fn load_node(&self, cluster: &str, node: &str) -> Result<NodeRecord> {
        (**self).load_node(cluster, node).await
    }

    async fn save_node(&self, cluster: &str, node: &str, record: &NodeRecord) -> Result<()> {
        (**self).save_node(cluster, node, record).await
    }

    async fn load_image(&self, cluster: &str, profile: &str) -> Result<Option<ImageAsset>> {
        (**self).load_image(cluster, profile).await
    }

    async fn save_image(&self, cluster: &str, asset: &ImageAsset) -> Result<()> {
        (**self).save_image(cluster, asset).await
    }
}
