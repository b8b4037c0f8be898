/*!
The cryptographic material shared by every node of a cluster.

The serialized form of `MachineSecrets` matches the `secrets.yaml` document understood by
`talosctl gen config --with-secrets`: every certificate and key is a base64-encoded PEM block.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A PEM certificate and its private key, both base64-encoded.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CertAndKey {
    pub crt: String,
    pub key: String,
}

impl fmt::Debug for CertAndKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAndKey")
            .field("crt", &self.crt)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// A private key without a certificate, base64-encoded PEM.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyOnly {
    pub key: String,
}

impl fmt::Debug for KeyOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyOnly(<redacted>)")
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SharedSecrets {
    /// `<6 chars>.<16 chars>` as required by kubeadm-style bootstrap tokens.
    #[serde(rename = "bootstraptoken")]
    pub bootstrap_token: String,
    #[serde(rename = "secretboxencryptionsecret")]
    pub secretbox_encryption_secret: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrustdInfo {
    pub token: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Certs {
    pub etcd: CertAndKey,
    pub k8s: CertAndKey,
    #[serde(rename = "k8saggregator")]
    pub k8s_aggregator: CertAndKey,
    #[serde(rename = "k8sserviceaccount")]
    pub k8s_service_account: KeyOnly,
    pub os: CertAndKey,
}

/// The secrets document handed to the OS configuration generator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MachineSecrets {
    pub cluster: ClusterIdentity,
    pub secrets: SharedSecrets,
    #[serde(rename = "trustdinfo")]
    pub trustd_info: TrustdInfo,
    pub certs: Certs,
}

/// CA plus an admin client certificate, accepted by the management API of every node in the cluster.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientConfiguration {
    pub ca_certificate: String,
    pub client_certificate: String,
    pub client_key: String,
}

impl fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("ca_certificate", &self.ca_certificate)
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &"<redacted>")
            .finish()
    }
}

/// All secrets of one cluster. Generated once and kept for the lifetime of the cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecretsBundle {
    /// The cluster this bundle belongs to. This, and nothing else, identifies the bundle.
    pub cluster_name: String,
    /// The OS version whose generation rules produced the bundle. Informational only.
    pub talos_version: String,
    pub generated_at: DateTime<Utc>,
    pub machine: MachineSecrets,
    pub client: ClientConfiguration,
}

impl SecretsBundle {
    pub fn id(&self) -> &str {
        &self.cluster_name
    }
}

/// Administrative credentials for the OS management API of a cluster, as consumed by `talosctl`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TalosConfig {
    pub context: String,
    pub contexts: std::collections::BTreeMap<String, TalosContext>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TalosContext {
    pub endpoints: Vec<String>,
    pub nodes: Vec<String>,
    pub ca: String,
    pub crt: String,
    pub key: String,
}

impl TalosConfig {
    /// A configuration whose single context targets the given endpoints and nodes.
    pub fn new(cluster_name: &str, client: &ClientConfiguration, endpoints: &[String], nodes: &[String]) -> Self {
        let mut contexts = std::collections::BTreeMap::new();
        contexts.insert(
            cluster_name.to_string(),
            TalosContext {
                endpoints: endpoints.to_vec(),
                nodes: nodes.to_vec(),
                ca: client.ca_certificate.clone(),
                crt: client.client_certificate.clone(),
                key: client.client_key.clone(),
            },
        );
        TalosConfig {
            context: cluster_name.to_string(),
            contexts,
        }
    }
}
