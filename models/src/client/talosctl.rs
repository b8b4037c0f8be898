/*!
A `TalosClient` which drives the Talos management API through the `talosctl` binary.

Credentials (`talosconfig`) and cluster secrets (`secrets.yaml`) are written into a per-cluster work directory;
rendered machine configurations are written next to them, one file per node.
*/

use super::error::{self, Result};
use super::fs::write_private_file;
use super::{GenerateConfigRequest, TalosClient, UpgradeOptions};
use crate::secrets::TalosConfig;

use async_trait::async_trait;
use snafu::{ensure, ResultExt};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

const TALOSCTL_BIN: &str = "talosctl";
const TALOSCTL_BIN_ENV_VAR: &str = "TALOSCTL_BIN";
const MAX_ATTEMPTS: u32 = 5;
const UNAVAILABLE_SLEEP_DURATION: Duration = Duration::from_secs(10);

// stderr fragments of failures that go away by themselves, e.g. while a node reboots.
const TRANSIENT_FAILURES: [&str; 5] = [
    "connection refused",
    "Unavailable",
    "i/o timeout",
    "no route to host",
    "connection reset by peer",
];
// stderr fragments of an authenticated call against a node which has no configuration yet.
const MAINTENANCE_MODE_FAILURES: [&str; 3] = ["certificate required", "x509", "tls:"];

const TALOSCONFIG_FILE: &str = "talosconfig";
const SECRETS_FILE: &str = "secrets.yaml";

fn is_transient(stderr: &str) -> bool {
    TRANSIENT_FAILURES.iter().any(|marker| stderr.contains(marker))
}

fn is_maintenance_mode(stderr: &str) -> bool {
    MAINTENANCE_MODE_FAILURES
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Extracts the server's tag from `talosctl version --short` output:
///
/// ```text
/// Client:
///     Tag:         v1.9.0
/// Server:
///     NODE:        10.0.0.10
///     Tag:         v1.9.0
/// ```
pub(crate) fn parse_server_tag(output: &str) -> Option<String> {
    output
        .lines()
        .skip_while(|line| line.trim() != "Server:")
        .filter_map(|line| line.trim().strip_prefix("Tag:"))
        .map(|tag| tag.trim().to_string())
        .find(|tag| !tag.is_empty())
}

pub(crate) fn upgrade_args(image: &str, options: &UpgradeOptions) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--image".to_string(),
        image.to_string(),
        format!("--preserve={}", options.preserve),
    ];
    if options.stage {
        args.push("--stage".to_string());
    }
    if options.force {
        args.push("--force".to_string());
    }
    args
}

#[derive(Clone, Debug)]
pub struct TalosctlClient {
    bin: PathBuf,
    work_dir: PathBuf,
    max_attempts: u32,
    retry_interval: Duration,
    // Serializes writers and readers of the shared secrets file.
    secrets_lock: Arc<Mutex<()>>,
}

impl TalosctlClient {
    pub fn new<P: Into<PathBuf>, W: Into<PathBuf>>(bin: P, work_dir: W) -> Self {
        TalosctlClient {
            bin: bin.into(),
            work_dir: work_dir.into(),
            max_attempts: MAX_ATTEMPTS,
            retry_interval: UNAVAILABLE_SLEEP_DURATION,
            secrets_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Uses `$TALOSCTL_BIN`, falling back to `talosctl` on the `PATH`.
    pub fn from_env<W: Into<PathBuf>>(work_dir: W) -> Self {
        let bin = std::env::var(TALOSCTL_BIN_ENV_VAR).unwrap_or_else(|_| TALOSCTL_BIN.to_string());
        Self::new(bin, work_dir)
    }

    pub fn talosconfig_path(&self) -> PathBuf {
        self.work_dir.join(TALOSCONFIG_FILE)
    }

    async fn write_work_file(&self, relative: &Path, contents: &str) -> Result<PathBuf> {
        let path = self.work_dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::WriteWorkFileSnafu {
                    path: parent.to_path_buf(),
                })?;
        }
        write_private_file(&path, contents.as_bytes())
            .await
            .context(error::WriteWorkFileSnafu { path: path.clone() })?;
        Ok(path)
    }

    async fn authenticated_args(&self, node: Ipv4Addr) -> Result<Vec<String>> {
        let talosconfig = self.talosconfig_path();
        let configured = tokio::fs::try_exists(&talosconfig).await.unwrap_or(false);
        ensure!(configured, error::MissingTalosconfigSnafu);

        Ok(vec![
            "--talosconfig".to_string(),
            talosconfig.display().to_string(),
            "--nodes".to_string(),
            node.to_string(),
            "--endpoints".to_string(),
            node.to_string(),
        ])
    }

    /// Runs talosctl, retrying while the node's API is unavailable. Any other failure is returned immediately.
    async fn invoke(&self, action: &str, node: Ipv4Addr, args: Vec<String>) -> Result<Output> {
        let mut attempts: u32 = 0;
        while attempts < self.max_attempts {
            let output = Command::new(&self.bin)
                .args(&args)
                .output()
                .await
                .context(error::TalosctlCommandSnafu { args: args.clone() })?;

            if output.status.success() {
                return Ok(output);
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !is_transient(&stderr) {
                return error::TalosctlFailedSnafu {
                    action,
                    node,
                    stderr,
                }
                .fail();
            }

            attempts += 1;
            event!(
                Level::WARN,
                %node,
                action,
                attempts,
                "Management API unavailable, retrying in {:?}",
                self.retry_interval
            );
            sleep(self.retry_interval).await;
        }

        error::TalosUnavailableSnafu {
            action,
            node,
            attempts,
        }
        .fail()
    }
}

#[async_trait]
impl TalosClient for TalosctlClient {
    #[instrument(skip(self, talosconfig), err)]
    async fn configure(&self, talosconfig: &TalosConfig) -> Result<()> {
        let contents = serde_yaml::to_string(talosconfig).context(error::SerializeYamlSnafu {
            what: TALOSCONFIG_FILE,
        })?;
        self.write_work_file(Path::new(TALOSCONFIG_FILE), &contents)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(cluster = %request.cluster_name, machine_type = %request.machine_type), err)]
    async fn generate_config(&self, request: &GenerateConfigRequest) -> Result<String> {
        let secrets = serde_yaml::to_string(&request.secrets).context(error::SerializeYamlSnafu {
            what: SECRETS_FILE,
        })?;

        let _guard = self.secrets_lock.lock().await;
        let secrets_path = self
            .write_work_file(Path::new(SECRETS_FILE), &secrets)
            .await?;

        let mut args = vec![
            "gen".to_string(),
            "config".to_string(),
            request.cluster_name.clone(),
            request.cluster_endpoint.clone(),
            "--with-secrets".to_string(),
            secrets_path.display().to_string(),
            "--output-types".to_string(),
            request.machine_type.to_string(),
            "--output".to_string(),
            "-".to_string(),
            "--with-docs=false".to_string(),
            "--with-examples=false".to_string(),
        ];
        if let Some(version) = &request.kubernetes_version {
            args.push("--kubernetes-version".to_string());
            args.push(version.trim_start_matches('v').to_string());
        }
        for patch in &request.patches {
            args.push("--config-patch".to_string());
            args.push(patch.clone());
        }

        let output = Command::new(&self.bin)
            .args(&args)
            .output()
            .await
            .context(error::TalosctlCommandSnafu { args: args.clone() })?;
        ensure!(
            output.status.success(),
            error::TalosctlFailedSnafu {
                action: "gen config",
                node: Ipv4Addr::UNSPECIFIED,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }
        );

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    #[instrument(skip(self, config), err)]
    async fn apply_config(&self, node: Ipv4Addr, config: &str) -> Result<()> {
        let config_path = self
            .write_work_file(&Path::new("nodes").join(format!("{}.yaml", node)), config)
            .await?;
        let file_args = vec!["--file".to_string(), config_path.display().to_string()];

        let mut args = self.authenticated_args(node).await?;
        args.push("apply-config".to_string());
        args.extend(file_args.iter().cloned());

        match self.invoke("apply-config", node, args).await {
            Ok(_) => Ok(()),
            Err(error::ClientError::TalosctlFailed { stderr, .. }) if is_maintenance_mode(&stderr) => {
                event!(
                    Level::INFO,
                    %node,
                    "Node has no configuration yet, applying in maintenance mode"
                );
                let mut args = vec![
                    "apply-config".to_string(),
                    "--insecure".to_string(),
                    "--nodes".to_string(),
                    node.to_string(),
                ];
                args.extend(file_args);
                self.invoke("apply-config", node, args).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), err)]
    async fn bootstrap(&self, node: Ipv4Addr) -> Result<()> {
        let mut args = self.authenticated_args(node).await?;
        args.push("bootstrap".to_string());
        self.invoke("bootstrap", node, args).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn kubeconfig(&self, node: Ipv4Addr) -> Result<String> {
        let mut args = self.authenticated_args(node).await?;
        args.extend(["kubeconfig".to_string(), "-".to_string()]);
        let output = self.invoke("kubeconfig", node, args).await?;

        let kubeconfig = String::from_utf8_lossy(&output.stdout).to_string();
        kube::config::Kubeconfig::from_yaml(&kubeconfig).context(error::InvalidKubeconfigSnafu { node })?;
        Ok(kubeconfig)
    }

    #[instrument(skip(self), err)]
    async fn health(&self, node: Ipv4Addr, timeout: Duration) -> Result<()> {
        let mut args = self.authenticated_args(node).await?;
        args.extend([
            "health".to_string(),
            format!("--wait-timeout={}s", timeout.as_secs()),
        ]);
        self.invoke("health", node, args).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn version(&self, node: Ipv4Addr) -> Result<String> {
        let mut args = self.authenticated_args(node).await?;
        args.extend(["version".to_string(), "--short".to_string()]);
        let output = self.invoke("version", node, args).await?;

        parse_server_tag(&String::from_utf8_lossy(&output.stdout))
            .ok_or(error::ClientError::MissingServerVersion { node })
    }

    #[instrument(skip(self), err)]
    async fn upgrade(&self, node: Ipv4Addr, image: &str, options: &UpgradeOptions) -> Result<()> {
        let mut args = self.authenticated_args(node).await?;
        args.extend(upgrade_args(image, options));
        self.invoke("upgrade", node, args).await?;
        Ok(())
    }
}
