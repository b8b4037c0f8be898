use snafu::Snafu;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors found while loading or validating a cluster description. None of these are raised after a
/// mutating call has been made.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to read inventory file '{}': '{}'", path.display(), source))]
    ReadInventory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse inventory: '{}'", source))]
    ParseInventory { source: serde_yaml::Error },

    #[snafu(display("Inventory failed validation: '{}'", source))]
    InvalidInventory {
        source: validator::ValidationErrors,
    },

    #[snafu(display("Field '{}' is not a valid IPv4 address '{}': '{}'", field, value, source))]
    InvalidIp {
        field: String,
        value: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("Version '{}' for '{}' is not a valid version: '{}'", version, field, source))]
    InvalidVersion {
        field: String,
        version: String,
        source: semver::Error,
    },

    #[snafu(display("Cluster '{}' has no nodes", cluster))]
    NoNodes { cluster: String },

    #[snafu(display("Cluster '{}' has no control-plane nodes", cluster))]
    NoControlPlane { cluster: String },

    #[snafu(display("Node IP '{}' is used by both '{}' and '{}'", ip, first, second))]
    DuplicateNodeIp {
        ip: Ipv4Addr,
        first: String,
        second: String,
    },

    #[snafu(display("Node name '{}' is used more than once", name))]
    DuplicateNodeName { name: String },

    #[snafu(display(
        "Node '{}' references image profile '{}' which is not defined in image_profiles",
        node,
        profile
    ))]
    UnknownImageProfile { node: String, profile: String },

    #[snafu(display(
        "No control-plane node has the cluster endpoint IP '{}', so no bootstrap node can be chosen",
        endpoint_ip
    ))]
    NoBootstrapNode { endpoint_ip: Ipv4Addr },

    #[snafu(display(
        "Node '{}' is hypervisor-managed but image profile '{}' is not uploaded to the hypervisor",
        node,
        profile
    ))]
    IsoUnavailable { node: String, profile: String },
}
