use crate::cancel::Cancellation;
use crate::error::{self, Error, Result};
use crate::image::ResolvedImage;
use models::client::{GenerateConfigRequest, HypervisorClient, StateStore, TalosClient};
use models::cluster::{ClusterSpec, HypervisorSettings, NodeClass, NodeSpec};
use models::deferred::Deferred;
use models::machineconfig::{MachineConfigBuilder, MachineConfigDocument};
use models::node::{NodeDuty, NodeRecord, NodeState, Placement, ProvisionStage, VmRequest};
use models::secrets::MachineSecrets;

use snafu::{OptionExt, ResultExt};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Cluster-wide inputs shared read-only by every node's provisioning.
#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub kubernetes_version: Option<String>,
    pub secrets: Arc<MachineSecrets>,
    pub builder: MachineConfigBuilder,
    pub hypervisor: HypervisorSettings,
    pub gateway: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
}

impl ProvisionContext {
    pub fn new(cluster: &ClusterSpec, secrets: MachineSecrets) -> Self {
        ProvisionContext {
            cluster_name: cluster.name.clone(),
            cluster_endpoint: cluster.cluster_endpoint(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            secrets: Arc::new(secrets),
            builder: MachineConfigBuilder::new(cluster),
            hypervisor: cluster.hypervisor.clone(),
            gateway: cluster.gateway,
            nameservers: cluster.effective_nameservers(),
        }
    }
}

/// The outcome of provisioning one node.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionedNode {
    pub name: String,
    pub ip: Ipv4Addr,
    pub duty: NodeDuty,
    pub state: NodeState,
    /// Only present for the bootstrap node.
    pub kubeconfig: Option<String>,
}

/// Walks a single node through the provisioning state machine.
///
/// Transitions are not retried here. A failed transition halts the node and the error is returned; re-running
/// the plan resumes from the persisted `NodeRecord`, skipping completed work.
#[derive(Clone, Debug)]
pub struct NodeProvisioner<T, H, S>
where
    T: TalosClient,
    H: HypervisorClient,
    S: StateStore,
{
    talos: T,
    hypervisor: H,
    store: S,
    context: ProvisionContext,
}

impl<T, H, S> NodeProvisioner<T, H, S>
where
    T: TalosClient,
    H: HypervisorClient,
    S: StateStore,
{
    pub fn new(talos: T, hypervisor: H, store: S, context: ProvisionContext) -> Self {
        NodeProvisioner {
            talos,
            hypervisor,
            store,
            context,
        }
    }

    fn placement(&self, node: &NodeSpec, iso_file_id: &str) -> Placement {
        match node.class {
            NodeClass::Proxmox => Placement::Hypervisor(VmRequest::for_node(
                node,
                &self.context.hypervisor,
                self.context.gateway,
                &self.context.nameservers,
                iso_file_id,
            )),
            NodeClass::External => Placement::External,
        }
    }

    /// Drives `node` from its current stage to `Ready`, checking for cancellation between transitions.
    #[instrument(skip(self, node, image, cancellation), fields(node = %node), err)]
    pub async fn provision(
        &self,
        node: &NodeSpec,
        duty: NodeDuty,
        image: &ResolvedImage,
        cancellation: &Cancellation,
    ) -> Result<ProvisionedNode> {
        let mut record = self
            .store
            .load_node(&self.context.cluster_name, &node.name)
            .await
            .context(error::LoadStateSnafu {
                key: format!("node/{}", node.name),
            })?;
        let config = self
            .context
            .builder
            .build_deferred(node, &image.installer_image);
        let on_hypervisor = node.class == NodeClass::Proxmox;

        let mut stage = ProvisionStage::Unprovisioned;
        let mut state = NodeState::new(duty);
        while !stage.is_terminal() {
            let next = stage.on_success(duty);
            if cancellation.is_cancelled() {
                return error::CancelledSnafu {
                    node: node.to_string(),
                    stage: next.to_string(),
                }
                .fail();
            }

            match stage {
                ProvisionStage::Unprovisioned => self.ensure_vm(node, image, &mut record).await?,
                ProvisionStage::VmReady => self.apply_config(node, &config, &mut record).await?,
                ProvisionStage::ConfigApplied if duty.bootstraps() => {
                    self.bootstrap(node, &mut record).await?
                }
                ProvisionStage::Bootstrapped => self.fetch_kubeconfig(node, &mut record).await?,
                _ => {}
            }

            record.touch();
            self.store
                .save_node(&self.context.cluster_name, &node.name, &record)
                .await
                .context(error::SaveStateSnafu {
                    key: format!("node/{}", node.name),
                })?;
            state = state.reached(next, on_hypervisor);
            event!(Level::INFO, from = %stage, to = %next, "Node transitioned.");
            stage = next;
        }

        Ok(ProvisionedNode {
            name: node.name.clone(),
            ip: node.ip,
            duty,
            state,
            kubeconfig: if duty.bootstraps() {
                record.kubeconfig
            } else {
                None
            },
        })
    }

    /// Creates the node's VM unless one is already recorded or present on the hypervisor.
    async fn ensure_vm(&self, node: &NodeSpec, image: &ResolvedImage, record: &mut NodeRecord) -> Result<()> {
        if node.class == NodeClass::External {
            event!(Level::INFO, "Node is externally managed, no VM is created.");
            return Ok(());
        }
        if let Some(vm_id) = record.vm_id {
            event!(Level::INFO, vm_id, "VM already provisioned.");
            return Ok(());
        }

        let hypervisor_node = &self.context.hypervisor.node_name;
        let existing = self
            .hypervisor
            .find_vm(hypervisor_node, &node.name)
            .await
            .context(error::ProvisionVmSnafu {
                node: node.to_string(),
            })?;
        let handle = match existing {
            Some(handle) => {
                event!(Level::WARN, vm_id = handle.vm_id, "Adopting existing VM with the node's name.");
                handle
            }
            None => {
                let iso_file_id = image
                    .iso_file_id
                    .resolve()
                    .await
                    .context(error::ImageUnavailableSnafu {
                        profile: image.profile.clone(),
                    })?
                    .context(error::MissingBootMediaSnafu {
                        profile: image.profile.clone(),
                        node: node.to_string(),
                    })?;
                let request = match self.placement(node, &iso_file_id) {
                    Placement::Hypervisor(request) => request,
                    Placement::External => return Ok(()),
                };
                self.hypervisor
                    .create_vm(&request)
                    .await
                    .context(error::ProvisionVmSnafu {
                        node: node.to_string(),
                    })?
            }
        };

        record.vm_id = Some(handle.vm_id);
        record.iso_file_id = image.iso_file_id.peek().flatten();
        Ok(())
    }

    /// Renders and applies the node's configuration once its installer image is known. Skipped when the node
    /// already runs a configuration generated from the same inputs.
    async fn apply_config(
        &self,
        node: &NodeSpec,
        config: &Deferred<MachineConfigDocument, Error>,
        record: &mut NodeRecord,
    ) -> Result<()> {
        let document = config
            .resolve()
            .await
            .context(error::ImageUnavailableSnafu {
                profile: node.image_profile.clone(),
            })?;
        let patch = document.to_yaml().context(error::RenderConfigSnafu {
            node: node.to_string(),
        })?;

        let request = GenerateConfigRequest {
            cluster_name: self.context.cluster_name.clone(),
            machine_type: document.machine_type,
            cluster_endpoint: self.context.cluster_endpoint.clone(),
            secrets: (*self.context.secrets).clone(),
            patches: vec![patch],
            kubernetes_version: self.context.kubernetes_version.clone(),
        };
        let fingerprint = request.fingerprint().context(error::RenderConfigSnafu {
            node: node.to_string(),
        })?;
        if record.applied_config.as_deref() == Some(fingerprint.as_str()) {
            event!(Level::INFO, "Machine configuration unchanged, not reapplying.");
            return Ok(());
        }

        let rendered = self
            .talos
            .generate_config(&request)
            .await
            .context(error::GenerateConfigSnafu {
                node: node.to_string(),
            })?;
        self.talos
            .apply_config(node.ip, &rendered)
            .await
            .context(error::ApplyConfigSnafu {
                node: node.to_string(),
            })?;

        event!(Level::INFO, "Applied machine configuration.");
        record.applied_config = Some(fingerprint);
        Ok(())
    }

    async fn bootstrap(&self, node: &NodeSpec, record: &mut NodeRecord) -> Result<()> {
        if record.bootstrapped {
            event!(Level::INFO, "Cluster already bootstrapped on this node.");
            return Ok(());
        }
        self.talos
            .bootstrap(node.ip)
            .await
            .context(error::BootstrapSnafu {
                node: node.to_string(),
            })?;
        event!(Level::INFO, "Bootstrapped the cluster.");
        record.bootstrapped = true;
        Ok(())
    }

    async fn fetch_kubeconfig(&self, node: &NodeSpec, record: &mut NodeRecord) -> Result<()> {
        let kubeconfig = self
            .talos
            .kubeconfig(node.ip)
            .await
            .context(error::RetrieveKubeconfigSnafu {
                node: node.to_string(),
            })?;
        record.kubeconfig = Some(kubeconfig);
        Ok(())
    }
}
