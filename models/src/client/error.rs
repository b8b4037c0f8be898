use snafu::Snafu;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// The client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while talking to an external collaborator: the OS management API, the image factory, the
/// hypervisor, the application-deployment tools, or the state store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("Unable to run talosctl with args {:?}: '{}'", args, source))]
    TalosctlCommand {
        args: Vec<String>,
        source: std::io::Error,
    },

    #[snafu(display("talosctl {} failed for node '{}': '{}'", action, node, stderr))]
    TalosctlFailed {
        action: String,
        node: Ipv4Addr,
        stderr: String,
    },

    #[snafu(display(
        "Management API of node '{}' was unavailable after {} attempts of '{}'",
        node,
        attempts,
        action
    ))]
    TalosUnavailable {
        action: String,
        node: Ipv4Addr,
        attempts: u32,
    },

    #[snafu(display("Unable to find the server tag in the version output of node '{}'", node))]
    MissingServerVersion { node: Ipv4Addr },

    #[snafu(display("Kubeconfig retrieved from node '{}' is invalid: '{}'", node, source))]
    InvalidKubeconfig {
        node: Ipv4Addr,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Management API credentials have not been configured"))]
    MissingTalosconfig,

    #[snafu(display("Unable to write '{}': '{}'", path.display(), source))]
    WriteWorkFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to serialize '{}': '{}'", what, source))]
    SerializeYaml {
        what: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Image factory request to '{}' failed: '{}'", url, source))]
    FactoryRequest { url: String, source: reqwest::Error },

    #[snafu(display("Image factory responded with status code {}: '{}'", status_code, response))]
    FactoryResponse {
        status_code: reqwest::StatusCode,
        response: String,
    },

    #[snafu(display("Missing hypervisor setting '{}'", variable))]
    MissingHypervisorSetting { variable: String },

    #[snafu(display("Hypervisor setting '{}' has an invalid value '{}'", variable, value))]
    InvalidHypervisorSetting { variable: String, value: String },

    #[snafu(display("Unable to build the hypervisor HTTP client: '{}'", source))]
    HypervisorClientBuild { source: reqwest::Error },

    #[snafu(display("Hypervisor request '{} {}' failed: '{}'", method, path, source))]
    HypervisorRequest {
        method: String,
        path: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "Hypervisor responded to '{} {}' with status code {}: '{}'",
        method,
        path,
        status_code,
        response
    ))]
    HypervisorResponse {
        method: String,
        path: String,
        status_code: reqwest::StatusCode,
        response: String,
    },

    #[snafu(display("Hypervisor task '{}' failed with exit status '{}'", upid, exit_status))]
    HypervisorTaskFailed { upid: String, exit_status: String },

    #[snafu(display("Hypervisor task '{}' did not finish after {} polls", upid, polls))]
    HypervisorTaskTimeout { upid: String, polls: u32 },

    #[snafu(display("Hypervisor returned an unexpected next VM id '{}'", value))]
    InvalidVmId { value: String },

    #[snafu(display("Unable to run '{}' with args {:?}: '{}'", program, args, source))]
    DeployCommand {
        program: String,
        args: Vec<String>,
        source: std::io::Error,
    },

    #[snafu(display("'{}' failed in namespace '{}': '{}'", program, namespace, stderr))]
    DeployFailed {
        program: String,
        namespace: String,
        stderr: String,
    },

    #[snafu(display("Unable to read state file '{}': '{}'", path.display(), source))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to write state file '{}': '{}'", path.display(), source))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("State file '{}' is corrupt: '{}'", path.display(), source))]
    StateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Unable to serialize state for '{}': '{}'", key, source))]
    StateSerialize {
        key: String,
        source: serde_json::Error,
    },
}
