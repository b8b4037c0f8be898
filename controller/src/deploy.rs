use crate::error::{self, Result};
use crate::health::HealthyCluster;
use models::client::ApplicationDeployer;
use models::cluster::ApplicationSpec;

use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// Deploys workloads onto a cluster. Deployment can only start from a passed health gate.
#[derive(Clone, Debug)]
pub struct ApplicationGate<D: ApplicationDeployer> {
    deployer: D,
}

impl<D: ApplicationDeployer> ApplicationGate<D> {
    pub fn new(deployer: D) -> Self {
        ApplicationGate { deployer }
    }

    /// Installs each application in order: its release first, then its raw manifests.
    #[instrument(skip(self, healthy, applications), fields(node = %healthy.node(), count = applications.len()), err)]
    pub async fn deploy(&self, healthy: &HealthyCluster, applications: &[ApplicationSpec]) -> Result<()> {
        for application in applications {
            if let Some(release) = &application.release {
                self.deployer
                    .install_release(&application.namespace, release)
                    .await
                    .context(error::DeploySnafu {
                        namespace: application.namespace.clone(),
                    })?;
                event!(Level::INFO, namespace = %application.namespace, release = %release.name, "Installed release.");
            }
            if !application.manifests.is_empty() {
                self.deployer
                    .apply_manifests(&application.namespace, &application.manifests)
                    .await
                    .context(error::DeploySnafu {
                        namespace: application.namespace.clone(),
                    })?;
                event!(
                    Level::INFO,
                    namespace = %application.namespace,
                    manifests = application.manifests.len(),
                    "Applied manifests."
                );
            }
        }
        Ok(())
    }
}
