/*!
Generates and keeps the cryptographic identity of a cluster.

A cluster's secrets are generated exactly once and are keyed by the cluster name alone. The OS version only
records which generation rules were in effect; it never causes regeneration, so that node identities survive
OS upgrades.
*/

use crate::error::{self, Result};
use models::client::StateStore;
use models::secrets::{
    CertAndKey, Certs, ClientConfiguration, ClusterIdentity, KeyOnly, MachineSecrets, SecretsBundle,
    SharedSecrets, TrustdInfo,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Datelike, Utc};
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SignatureAlgorithm,
};
use snafu::ResultExt;
use tracing::{event, instrument, Level};

const CA_VALIDITY_YEARS: i32 = 10;
const CLIENT_VALIDITY_YEARS: i32 = 1;
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ADMIN_ORGANIZATION: &str = "os:admin";

/// A freshly generated certificate authority, kept long enough to sign leaf certificates.
struct GeneratedCa {
    pair: CertAndKey,
    issuer: Issuer<'static, KeyPair>,
}

/// Produces the secrets of a cluster.
#[derive(Clone, Debug)]
pub struct SecretsFactory<S: StateStore> {
    store: S,
}

impl<S: StateStore> SecretsFactory<S> {
    pub fn new(store: S) -> Self {
        SecretsFactory { store }
    }

    /// Returns the cluster's secrets, generating and persisting them on first use.
    #[instrument(skip(self), err)]
    pub async fn ensure_secrets(&self, cluster_name: &str, talos_version: &str) -> Result<SecretsBundle> {
        if let Some(bundle) = self
            .store
            .load_secrets(cluster_name)
            .await
            .context(error::LoadStateSnafu { key: cluster_name })?
        {
            if bundle.talos_version != talos_version {
                event!(
                    Level::INFO,
                    generated_for = %bundle.talos_version,
                    talos_version,
                    "Keeping existing cluster secrets across OS versions."
                );
            }
            return Ok(bundle);
        }

        let bundle = create_secrets(cluster_name, talos_version)?;
        self.store
            .save_secrets(&bundle)
            .await
            .context(error::SaveStateSnafu { key: cluster_name })?;
        event!(Level::INFO, cluster = cluster_name, "Generated cluster secrets.");
        Ok(bundle)
    }
}

/// Generates a complete secrets bundle. Any failure aborts generation; a partial bundle is never returned.
pub fn create_secrets(cluster_name: &str, talos_version: &str) -> Result<SecretsBundle> {
    let etcd = generate_ca(cluster_name, "etcd", &rcgen::PKCS_ECDSA_P256_SHA256)?;
    let k8s = generate_ca(cluster_name, "kubernetes", &rcgen::PKCS_ECDSA_P256_SHA256)?;
    let aggregator = generate_ca(cluster_name, "front-proxy", &rcgen::PKCS_ECDSA_P256_SHA256)?;
    let os = generate_ca(cluster_name, "talos", &rcgen::PKCS_ED25519)?;
    let service_account = generate_key(cluster_name, "service account key", &rcgen::PKCS_ECDSA_P256_SHA256)?;
    let client = issue_admin_client(cluster_name, &os)?;

    Ok(SecretsBundle {
        cluster_name: cluster_name.to_string(),
        talos_version: talos_version.to_string(),
        generated_at: Utc::now(),
        machine: MachineSecrets {
            cluster: ClusterIdentity {
                id: random_base64(32),
                secret: random_base64(32),
            },
            secrets: SharedSecrets {
                bootstrap_token: bootstrap_token(),
                secretbox_encryption_secret: random_base64(32),
            },
            trustd_info: TrustdInfo {
                token: bootstrap_token(),
            },
            certs: Certs {
                etcd: etcd.pair,
                k8s: k8s.pair,
                k8s_aggregator: aggregator.pair,
                k8s_service_account: KeyOnly {
                    key: STANDARD.encode(service_account.serialize_pem()),
                },
                os: os.pair.clone(),
            },
        },
        client,
    })
}

fn generate_key(cluster_name: &str, what: &str, alg: &'static SignatureAlgorithm) -> Result<KeyPair> {
    KeyPair::generate_for(alg).context(error::GenerateSecretsSnafu {
        what,
        cluster: cluster_name,
    })
}

/// Validity starts at the first day of the current month.
fn set_validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    let month = today.month() as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, 1);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, 1);
}

fn generate_ca(cluster_name: &str, common_name: &str, alg: &'static SignatureAlgorithm) -> Result<GeneratedCa> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(cluster_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, CA_VALIDITY_YEARS);

    let what = format!("{} CA", common_name);
    let key_pair = generate_key(cluster_name, &what, alg)?;
    let cert = params
        .self_signed(&key_pair)
        .context(error::GenerateSecretsSnafu {
            what: what.clone(),
            cluster: cluster_name,
        })?;

    Ok(GeneratedCa {
        pair: CertAndKey {
            crt: STANDARD.encode(cert.pem()),
            key: STANDARD.encode(key_pair.serialize_pem()),
        },
        issuer: Issuer::new(params, key_pair),
    })
}

/// Issues the administrative client certificate accepted by every node's management API.
fn issue_admin_client(cluster_name: &str, os: &GeneratedCa) -> Result<ClientConfiguration> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String("admin".to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ADMIN_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    set_validity(&mut params, CLIENT_VALIDITY_YEARS);

    let key_pair = generate_key(cluster_name, "admin client key", &rcgen::PKCS_ED25519)?;
    let cert = params
        .signed_by(&key_pair, &os.issuer)
        .context(error::GenerateSecretsSnafu {
            what: "admin client certificate",
            cluster: cluster_name,
        })?;

    Ok(ClientConfiguration {
        ca_certificate: os.pair.crt.clone(),
        client_certificate: STANDARD.encode(cert.pem()),
        client_key: STANDARD.encode(key_pair.serialize_pem()),
    })
}

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// A token of the form `[a-z0-9]{6}.[a-z0-9]{16}`.
fn bootstrap_token() -> String {
    format!("{}.{}", random_token(6), random_token(16))
}

fn random_base64(len: usize) -> String {
    let mut raw = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::client::MemoryStateStore;

    fn decode(value: &str) -> String {
        String::from_utf8(STANDARD.decode(value).unwrap()).unwrap()
    }

    #[test]
    fn test_bundle_shape() {
        let bundle = create_secrets("homelab", "v1.9.0").unwrap();
        assert_eq!(bundle.id(), "homelab");

        let certs = &bundle.machine.certs;
        for pair in [&certs.etcd, &certs.k8s, &certs.k8s_aggregator, &certs.os] {
            assert!(decode(&pair.crt).starts_with("-----BEGIN CERTIFICATE-----"));
            assert!(decode(&pair.key).contains("PRIVATE KEY-----"));
        }
        assert!(decode(&certs.k8s_service_account.key).contains("PRIVATE KEY-----"));
        assert_eq!(bundle.client.ca_certificate, certs.os.crt);
        assert_ne!(bundle.client.client_certificate, certs.os.crt);
        assert_eq!(STANDARD.decode(&bundle.machine.secrets.secretbox_encryption_secret).unwrap().len(), 32);
    }

    #[test]
    fn test_bootstrap_token_format() {
        for _ in 0..20 {
            let token = bootstrap_token();
            let (id, secret) = token.split_once('.').unwrap();
            assert_eq!(id.len(), 6);
            assert_eq!(secret.len(), 16);
            assert!(token
                .chars()
                .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_secrets_stable_across_os_versions() {
        let store = MemoryStateStore::new();
        let factory = SecretsFactory::new(store.clone());

        let first = factory.ensure_secrets("homelab", "v1.8.3").await.unwrap();
        let second = factory.ensure_secrets("homelab", "v1.9.0").await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first, second);
        assert_eq!(store.load_secrets("homelab").await.unwrap(), Some(first.clone()));

        let other = factory.ensure_secrets("lab2", "v1.9.0").await.unwrap();
        assert_ne!(other.machine.certs.os, first.machine.certs.os);
    }
}
