use models::client::ClientError;
use models::cluster::ClusterSpecError;

use snafu::Snafu;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, so that operators can tell whether re-running a plan may help.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The inventory is malformed. Nothing was touched.
    InputValidation,
    /// The hypervisor, image factory, OS management API or deployment tools rejected a request.
    ExternalService,
    /// A bounded wait for the cluster to become healthy ran out.
    ConvergenceTimeout,
    /// The run was cancelled before this node finished.
    Cancelled,
    /// Local state could not be read, written or generated.
    State,
}

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid cluster specification: '{}'", source))]
    InvalidCluster { source: ClusterSpecError },

    #[snafu(display("Unable to generate {} for cluster '{}': '{}'", what, cluster, source))]
    GenerateSecrets {
        what: String,
        cluster: String,
        source: rcgen::Error,
    },

    #[snafu(display("Unable to load state of '{}': '{}'", key, source))]
    LoadState { key: String, source: ClientError },

    #[snafu(display("Unable to save state of '{}': '{}'", key, source))]
    SaveState { key: String, source: ClientError },

    #[snafu(display("Unable to resolve image profile '{}': '{}'", profile, source))]
    ResolveImage { profile: String, source: ClientError },

    #[snafu(display("Image profile '{}' is unavailable: '{}'", profile, source))]
    ImageUnavailable { profile: String, source: Arc<Error> },

    #[snafu(display("Image profile '{}' has no ISO in hypervisor storage for node {}", profile, node))]
    MissingBootMedia { profile: String, node: String },

    #[snafu(display("Hypervisor rejected VM for node {}: '{}'", node, source))]
    ProvisionVm { node: String, source: ClientError },

    #[snafu(display("Unable to install management API credentials: '{}'", source))]
    ConfigureClient { source: ClientError },

    #[snafu(display("Unable to render machine configuration for node {}: '{}'", node, source))]
    RenderConfig {
        node: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Unable to generate machine configuration for node {}: '{}'", node, source))]
    GenerateConfig { node: String, source: ClientError },

    #[snafu(display("Unable to apply machine configuration to node {}: '{}'", node, source))]
    ApplyConfig { node: String, source: ClientError },

    #[snafu(display("Unable to bootstrap the cluster on node {}: '{}'", node, source))]
    Bootstrap { node: String, source: ClientError },

    #[snafu(display("Unable to retrieve the kubeconfig from node {}: '{}'", node, source))]
    RetrieveKubeconfig { node: String, source: ClientError },

    #[snafu(display("Bootstrap node {} finished without a kubeconfig", node))]
    MissingKubeconfig { node: String },

    #[snafu(display(
        "Cluster was not healthy after {} checks against '{}', last error: '{}'",
        attempts,
        node,
        last_error
    ))]
    HealthGateTimeout {
        node: Ipv4Addr,
        attempts: u32,
        last_error: String,
    },

    #[snafu(display("Node {} has no image asset for profile '{}'", node, profile))]
    MissingImageAsset { node: String, profile: String },

    #[snafu(display("Unable to determine the OS tag of installer image '{}'", image))]
    UnrecognizedInstallerImage { image: String },

    #[snafu(display("Unable to upgrade node {}: '{}'", node, source))]
    Upgrade { node: String, source: ClientError },

    #[snafu(display("Cluster did not become healthy after upgrading node {}: '{}'", node, source))]
    UpgradeHealthTimeout { node: String, source: ClientError },

    #[snafu(display(
        "Node {} did not respond after upgrading, {} version checks failed",
        node,
        attempts
    ))]
    NodeUnresponsive { node: String, attempts: u32 },

    #[snafu(display("Run was cancelled before node {} reached {}", node, stage))]
    Cancelled { node: String, stage: String },

    #[snafu(display("Unable to deploy applications to namespace '{}': '{}'", namespace, source))]
    Deploy {
        namespace: String,
        source: ClientError,
    },

    #[snafu(display("Cluster '{}' has no node named '{}'", cluster, name))]
    UnknownNode { cluster: String, name: String },

    #[snafu(display("Cluster '{}' has not been applied yet: no {} in state", cluster, what))]
    NotApplied { cluster: String, what: String },

    #[snafu(display("Unable to serialize the cluster client configuration: '{}'", source))]
    SerializeTalosconfig { source: serde_yaml::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCluster { .. }
            | Self::MissingBootMedia { .. }
            | Self::MissingImageAsset { .. }
            | Self::UnrecognizedInstallerImage { .. }
            | Self::UnknownNode { .. } => ErrorKind::InputValidation,
            Self::ResolveImage { .. }
            | Self::ProvisionVm { .. }
            | Self::ConfigureClient { .. }
            | Self::GenerateConfig { .. }
            | Self::ApplyConfig { .. }
            | Self::Bootstrap { .. }
            | Self::RetrieveKubeconfig { .. }
            | Self::Upgrade { .. }
            | Self::Deploy { .. } => ErrorKind::ExternalService,
            Self::HealthGateTimeout { .. }
            | Self::UpgradeHealthTimeout { .. }
            | Self::NodeUnresponsive { .. } => ErrorKind::ConvergenceTimeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ImageUnavailable { source, .. } => source.kind(),
            Self::GenerateSecrets { .. }
            | Self::LoadState { .. }
            | Self::SaveState { .. }
            | Self::RenderConfig { .. }
            | Self::MissingKubeconfig { .. }
            | Self::NotApplied { .. }
            | Self::SerializeTalosconfig { .. } => ErrorKind::State,
        }
    }

    /// Whether re-running the same plan may succeed without any change to the inventory.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConvergenceTimeout | ErrorKind::Cancelled
        )
    }
}
