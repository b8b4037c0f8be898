use crate::cancel::Cancellation;
use crate::error::{self, Result};
use crate::health::{HealthGate, HealthGateSettings, HealthyCluster};
use crate::image::{image_requests, ImageAssetResolver, ResolvedImage};
use crate::provisioner::{NodeProvisioner, ProvisionContext, ProvisionedNode};
use crate::secrets::SecretsFactory;
use crate::upgrade::{upgrade_plan, UpgradeReport, UpgradeSequencer, UpgradeSettings};
use models::client::{HypervisorClient, ImageFactoryClient, StateStore, TalosClient, UpgradeOptions};
use models::cluster::ClusterSpec;
use models::image::ImageAsset;
use models::machineconfig::MachineConfigBuilder;
use models::secrets::{SecretsBundle, TalosConfig};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{event, instrument, Level};

/// The external collaborators used by the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorClients<T, F, H, S>
where
    T: TalosClient,
    F: ImageFactoryClient,
    H: HypervisorClient,
    S: StateStore,
{
    pub talos: T,
    pub factory: F,
    pub hypervisor: H,
    pub store: S,
}

/// The resolved references of one image profile.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageOutput {
    pub schematic_id: String,
    pub iso_url: String,
    pub installer_image: String,
    pub iso_file_id: Option<String>,
}

impl From<&ImageAsset> for ImageOutput {
    fn from(asset: &ImageAsset) -> Self {
        ImageOutput {
            schematic_id: asset.schematic_id.to_string(),
            iso_url: asset.iso_url.clone(),
            installer_image: asset.installer_image.clone(),
            iso_file_id: asset.iso_file_id.clone(),
        }
    }
}

/// What a converged cluster exports. The credentials are not serialized with the rest.
#[derive(Clone, PartialEq, Serialize)]
pub struct ClusterOutputs {
    #[serde(skip)]
    pub kubeconfig: String,
    #[serde(skip)]
    pub talosconfig: String,
    pub cluster_endpoint: String,
    pub controlplane_ips: Vec<Ipv4Addr>,
    pub images: BTreeMap<String, ImageOutput>,
}

impl fmt::Debug for ClusterOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOutputs")
            .field("kubeconfig", &"<redacted>")
            .field("talosconfig", &"<redacted>")
            .field("cluster_endpoint", &self.cluster_endpoint)
            .field("controlplane_ips", &self.controlplane_ips)
            .field("images", &self.images)
            .finish()
    }
}

/// The result of a successful apply.
#[derive(Clone, Debug)]
pub struct AppliedCluster {
    pub outputs: ClusterOutputs,
    pub healthy: HealthyCluster,
    pub nodes: Vec<ProvisionedNode>,
}

/// The administrative client configuration for the cluster, targeting the endpoint IP.
pub fn cluster_talosconfig(cluster: &ClusterSpec, secrets: &SecretsBundle) -> TalosConfig {
    let endpoint = vec![cluster.endpoint_ip.to_string()];
    TalosConfig::new(&cluster.name, &secrets.client, &endpoint, &endpoint)
}

fn talosconfig_yaml(cluster: &ClusterSpec, secrets: &SecretsBundle) -> Result<String> {
    serde_yaml::to_string(&cluster_talosconfig(cluster, secrets)).context(error::SerializeTalosconfigSnafu)
}

/// Drives a whole cluster to its specified state.
///
/// One secrets bundle is created per cluster and one image asset per referenced profile. Every node is then
/// provisioned concurrently; nodes share nothing but read-only references to those values. The cluster is only
/// handed to downstream consumers after the health gate passes.
#[derive(Clone, Debug)]
pub struct ClusterOrchestrator<T, F, H, S>
where
    T: TalosClient,
    F: ImageFactoryClient,
    H: HypervisorClient,
    S: StateStore,
{
    clients: OrchestratorClients<T, F, H, S>,
    health: HealthGateSettings,
}

impl<T, F, H, S> ClusterOrchestrator<T, F, H, S>
where
    T: TalosClient + 'static,
    F: ImageFactoryClient + 'static,
    H: HypervisorClient + 'static,
    S: StateStore + 'static,
{
    pub fn new(clients: OrchestratorClients<T, F, H, S>, health: HealthGateSettings) -> Self {
        ClusterOrchestrator { clients, health }
    }

    /// Validates the cluster, makes sure its secrets exist and installs the management API credentials.
    /// Nothing external is touched if validation fails.
    async fn prepare(&self, cluster: &ClusterSpec) -> Result<SecretsBundle> {
        cluster.validate().context(error::InvalidClusterSnafu)?;

        let secrets = SecretsFactory::new(self.clients.store.clone())
            .ensure_secrets(&cluster.name, &cluster.talos_version)
            .await?;
        self.clients
            .talos
            .configure(&cluster_talosconfig(cluster, &secrets))
            .await
            .context(error::ConfigureClientSnafu)?;
        Ok(secrets)
    }

    fn resolve_images(&self, cluster: &ClusterSpec) -> BTreeMap<String, ResolvedImage> {
        let resolver = ImageAssetResolver::new(
            self.clients.factory.clone(),
            self.clients.hypervisor.clone(),
            self.clients.store.clone(),
            cluster,
        );
        image_requests(cluster)
            .into_iter()
            .map(|(request, upload)| {
                (
                    request.profile.clone(),
                    resolver.resolve_deferred(request, upload),
                )
            })
            .collect()
    }

    async fn image_outputs(images: &BTreeMap<String, ResolvedImage>) -> Result<BTreeMap<String, ImageOutput>> {
        let mut outputs = BTreeMap::new();
        for (profile, image) in images {
            let asset = image
                .asset
                .resolve()
                .await
                .context(error::ImageUnavailableSnafu {
                    profile: profile.clone(),
                })?;
            outputs.insert(profile.clone(), ImageOutput::from(&asset));
        }
        Ok(outputs)
    }

    /// Provisions every node, waits for the cluster to become healthy and returns its outputs.
    ///
    /// A failing node does not stop independent nodes already in flight; their progress is kept and the first
    /// error is returned once all of them have settled.
    #[instrument(skip(self, cluster, cancellation), fields(cluster = %cluster.name), err)]
    pub async fn apply(&self, cluster: &ClusterSpec, cancellation: &Cancellation) -> Result<AppliedCluster> {
        let secrets = self.prepare(cluster).await?;
        let bootstrap = cluster
            .bootstrap_node()
            .context(error::UnknownNodeSnafu {
                cluster: cluster.name.clone(),
                name: cluster.endpoint_ip.to_string(),
            })?;

        let images = self.resolve_images(cluster);
        let provisioner = NodeProvisioner::new(
            self.clients.talos.clone(),
            self.clients.hypervisor.clone(),
            self.clients.store.clone(),
            ProvisionContext::new(cluster, secrets.machine.clone()),
        );

        let provisions = cluster.nodes.iter().map(|node| {
            let provisioner = &provisioner;
            let images = &images;
            async move {
                let image = images
                    .get(&node.image_profile)
                    .context(error::MissingImageAssetSnafu {
                        node: node.to_string(),
                        profile: node.image_profile.clone(),
                    })?;
                provisioner
                    .provision(node, cluster.duty_of(node), image, cancellation)
                    .await
            }
        });
        let nodes = futures::future::join_all(provisions)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let kubeconfig = nodes
            .iter()
            .find(|provisioned| provisioned.duty.bootstraps())
            .and_then(|provisioned| provisioned.kubeconfig.clone())
            .context(error::MissingKubeconfigSnafu {
                node: bootstrap.to_string(),
            })?;

        let healthy = HealthGate::new(self.clients.talos.clone(), self.health)
            .wait(bootstrap.ip, &kubeconfig, cancellation)
            .await?;
        event!(Level::INFO, nodes = nodes.len(), "Cluster converged.");

        Ok(AppliedCluster {
            outputs: ClusterOutputs {
                kubeconfig,
                talosconfig: talosconfig_yaml(cluster, &secrets)?,
                cluster_endpoint: cluster.cluster_endpoint(),
                controlplane_ips: cluster.controlplane_ips(),
                images: Self::image_outputs(&images).await?,
            },
            healthy,
            nodes,
        })
    }

    /// Resolves the images for the cluster's OS version and rolls them through the nodes.
    #[instrument(skip(self, cluster, settings, cancellation), fields(cluster = %cluster.name), err)]
    pub async fn upgrade(
        &self,
        cluster: &ClusterSpec,
        options: &UpgradeOptions,
        settings: UpgradeSettings,
        cancellation: &Cancellation,
    ) -> Result<UpgradeReport> {
        self.prepare(cluster).await?;

        let mut assets = BTreeMap::new();
        for (profile, image) in self.resolve_images(cluster) {
            let asset = image
                .asset
                .resolve()
                .await
                .context(error::ImageUnavailableSnafu {
                    profile: profile.clone(),
                })?;
            assets.insert(profile, asset);
        }

        let plan = upgrade_plan(cluster, &assets)?;
        UpgradeSequencer::new(self.clients.talos.clone(), settings)
            .execute(&plan, options, cancellation)
            .await
    }

    /// Renders the configuration patch of one node. See [`render_node`].
    pub async fn render(&self, cluster: &ClusterSpec, node_name: &str) -> Result<String> {
        render_node(&self.clients.store, cluster, node_name).await
    }

    /// Reads the outputs of a previously applied cluster. See [`read_outputs`].
    pub async fn outputs(&self, cluster: &ClusterSpec) -> Result<ClusterOutputs> {
        read_outputs(&self.clients.store, cluster).await
    }
}

/// Renders the configuration patch of one node from the inventory and the stored image of its profile.
pub async fn render_node<S: StateStore>(store: &S, cluster: &ClusterSpec, node_name: &str) -> Result<String> {
    cluster.validate().context(error::InvalidClusterSnafu)?;
    let node = cluster.node(node_name).context(error::UnknownNodeSnafu {
        cluster: cluster.name.clone(),
        name: node_name,
    })?;

    let asset = load_current_image(store, cluster, &node.image_profile)
        .await?
        .context(error::NotAppliedSnafu {
            cluster: cluster.name.clone(),
            what: format!(
                "image for profile '{}' at {}",
                node.image_profile, cluster.talos_version
            ),
        })?;
    MachineConfigBuilder::new(cluster)
        .build(node, &asset.installer_image)
        .to_yaml()
        .context(error::RenderConfigSnafu {
            node: node.to_string(),
        })
}

/// Reads the outputs of a previously applied cluster from state, without contacting any node.
pub async fn read_outputs<S: StateStore>(store: &S, cluster: &ClusterSpec) -> Result<ClusterOutputs> {
    cluster.validate().context(error::InvalidClusterSnafu)?;

    let secrets = store
        .load_secrets(&cluster.name)
        .await
        .context(error::LoadStateSnafu {
            key: cluster.name.clone(),
        })?
        .context(error::NotAppliedSnafu {
            cluster: cluster.name.clone(),
            what: "secrets",
        })?;
    let bootstrap = cluster.bootstrap_node().context(error::UnknownNodeSnafu {
        cluster: cluster.name.clone(),
        name: cluster.endpoint_ip.to_string(),
    })?;
    let kubeconfig = store
        .load_node(&cluster.name, &bootstrap.name)
        .await
        .context(error::LoadStateSnafu {
            key: format!("node/{}", bootstrap.name),
        })?
        .kubeconfig
        .context(error::NotAppliedSnafu {
            cluster: cluster.name.clone(),
            what: "kubeconfig",
        })?;

    let mut images = BTreeMap::new();
    for (request, _) in image_requests(cluster) {
        if let Some(asset) = load_current_image(store, cluster, &request.profile).await? {
            images.insert(request.profile.clone(), ImageOutput::from(&asset));
        }
    }

    Ok(ClusterOutputs {
        kubeconfig,
        talosconfig: talosconfig_yaml(cluster, &secrets)?,
        cluster_endpoint: cluster.cluster_endpoint(),
        controlplane_ips: cluster.controlplane_ips(),
        images,
    })
}

/// The stored image of a profile, if it was resolved from the profile's current inputs.
async fn load_current_image<S: StateStore>(
    store: &S,
    cluster: &ClusterSpec,
    profile: &str,
) -> Result<Option<ImageAsset>> {
    let stored = store
        .load_image(&cluster.name, profile)
        .await
        .context(error::LoadStateSnafu {
            key: format!("image/{}", profile),
        })?;
    let current = image_requests(cluster)
        .into_iter()
        .find(|(request, _)| request.profile == profile);
    Ok(match (stored, current) {
        (Some(asset), Some((request, _))) if asset.matches(&request) => Some(asset),
        _ => None,
    })
}
