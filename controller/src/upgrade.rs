/*!
Rolls a new OS image through an existing cluster.

Nodes are upgraded one at a time: every control-plane node before any worker, each waiting for the previous
node to come back before starting. Nodes already running the target image are skipped, so an interrupted
upgrade can simply be run again.
*/

use crate::cancel::Cancellation;
use crate::chain::Chain;
use crate::error::{self, Result};
use models::client::{TalosClient, UpgradeOptions};
use models::cluster::{ClusterSpec, NodeRole};
use models::image::{image_tag, ImageAsset};

use snafu::OptionExt;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

const DEFAULT_CONTROL_PLANE_HEALTH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_RESPONSIVE_ATTEMPTS: u32 = 30;
const DEFAULT_RESPONSIVE_INTERVAL: Duration = Duration::from_secs(10);
// Reported when the node cannot be asked for its version; never equal to a target tag.
const UNKNOWN_VERSION: &str = "unknown";

/// Bounds on the post-upgrade checks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpgradeSettings {
    /// How long a control-plane node may take for the whole cluster to report healthy again.
    pub control_plane_health_timeout: Duration,
    /// How many times a worker is asked for its version before it is considered unresponsive.
    pub responsive_attempts: u32,
    pub responsive_interval: Duration,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        UpgradeSettings {
            control_plane_health_timeout: DEFAULT_CONTROL_PLANE_HEALTH_TIMEOUT,
            responsive_attempts: DEFAULT_RESPONSIVE_ATTEMPTS,
            responsive_interval: DEFAULT_RESPONSIVE_INTERVAL,
        }
    }
}

/// One link of the upgrade chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradeStep {
    pub node: String,
    pub ip: Ipv4Addr,
    pub role: NodeRole,
    pub image: String,
    /// The OS tag the node reports once running `image`.
    pub target_tag: String,
}

impl UpgradeStep {
    fn describe(&self) -> String {
        format!("({}, {})", self.node, self.ip)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgradeOutcome {
    /// The node already reported the target image.
    Skipped,
    Upgraded,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpgradeReport {
    pub outcomes: Vec<(String, UpgradeOutcome)>,
}

impl UpgradeReport {
    pub fn upgraded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == UpgradeOutcome::Upgraded)
            .count()
    }
}

/// Orders the cluster's nodes into a single chain: control-plane nodes first, then workers, each tier in
/// inventory order.
pub fn upgrade_plan(cluster: &ClusterSpec, assets: &BTreeMap<String, ImageAsset>) -> Result<Chain<UpgradeStep>> {
    let ordered = cluster
        .nodes_with_role(NodeRole::ControlPlane)
        .chain(cluster.nodes_with_role(NodeRole::Worker));

    let mut chain = Chain::new();
    for node in ordered {
        let asset = assets
            .get(&node.image_profile)
            .context(error::MissingImageAssetSnafu {
                node: node.to_string(),
                profile: node.image_profile.clone(),
            })?;
        let target_tag = image_tag(&asset.installer_image).context(error::UnrecognizedInstallerImageSnafu {
            image: asset.installer_image.clone(),
        })?;
        chain = chain.then(UpgradeStep {
            node: node.name.clone(),
            ip: node.ip,
            role: node.role,
            image: asset.installer_image.clone(),
            target_tag: target_tag.to_string(),
        });
    }
    Ok(chain)
}

/// Executes upgrade plans.
#[derive(Clone, Debug)]
pub struct UpgradeSequencer<T: TalosClient> {
    talos: T,
    settings: UpgradeSettings,
}

impl<T: TalosClient> UpgradeSequencer<T> {
    pub fn new(talos: T, settings: UpgradeSettings) -> Self {
        UpgradeSequencer { talos, settings }
    }

    /// Executes the plan, stopping at the first node that fails. Nothing is rolled back.
    #[instrument(skip(self, plan, cancellation), fields(nodes = plan.len()), err)]
    pub async fn execute(
        &self,
        plan: &Chain<UpgradeStep>,
        options: &UpgradeOptions,
        cancellation: &Cancellation,
    ) -> Result<UpgradeReport> {
        let outcomes = plan
            .run(|step| {
                let step = step.clone();
                async move {
                    let outcome = self.upgrade_node(&step, options, cancellation).await?;
                    Ok::<_, error::Error>((step.node, outcome))
                }
            })
            .await?;
        Ok(UpgradeReport { outcomes })
    }

    #[instrument(skip(self, step, options, cancellation), fields(node = %step.node), err)]
    async fn upgrade_node(
        &self,
        step: &UpgradeStep,
        options: &UpgradeOptions,
        cancellation: &Cancellation,
    ) -> Result<UpgradeOutcome> {
        if cancellation.is_cancelled() {
            return error::CancelledSnafu {
                node: step.describe(),
                stage: "upgrade",
            }
            .fail();
        }

        let current = match self.talos.version(step.ip).await {
            Ok(version) => version,
            Err(err) => {
                event!(Level::WARN, error = %err, "Unable to read the node's version, upgrading anyway.");
                UNKNOWN_VERSION.to_string()
            }
        };
        if current == step.target_tag {
            event!(Level::INFO, version = %current, "Node already runs the target image, skipping.");
            return Ok(UpgradeOutcome::Skipped);
        }

        event!(Level::INFO, from = %current, to = %step.target_tag, image = %step.image, "Upgrading node.");
        self.talos
            .upgrade(step.ip, &step.image, options)
            .await
            .context(error::UpgradeSnafu {
                node: step.describe(),
            })?;

        match step.role {
            NodeRole::ControlPlane => self
                .talos
                .health(step.ip, self.settings.control_plane_health_timeout)
                .await
                .context(error::UpgradeHealthTimeoutSnafu {
                    node: step.describe(),
                })?,
            NodeRole::Worker => self.wait_responsive(step).await?,
        }

        event!(Level::INFO, "Node upgraded.");
        Ok(UpgradeOutcome::Upgraded)
    }

    /// Polls the node's version until it answers at all.
    async fn wait_responsive(&self, step: &UpgradeStep) -> Result<()> {
        for attempt in 1..=self.settings.responsive_attempts {
            match self.talos.version(step.ip).await {
                Ok(version) => {
                    event!(Level::INFO, %version, attempt, "Node is responsive.");
                    return Ok(());
                }
                Err(err) => {
                    event!(Level::WARN, attempt, error = %err, "Node is not responsive yet.");
                }
            }
            if attempt < self.settings.responsive_attempts {
                sleep(self.settings.responsive_interval).await;
            }
        }
        error::NodeUnresponsiveSnafu {
            node: step.describe(),
            attempts: self.settings.responsive_attempts,
        }
        .fail()
    }
}
