use super::error::{self, Result};
use super::ApplicationDeployer;
use crate::cluster::ReleaseDescriptor;

use async_trait::async_trait;
use snafu::{ensure, ResultExt};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::instrument;

const HELM_BIN: &str = "helm";
const HELM_BIN_ENV_VAR: &str = "HELM_BIN";
const KUBECTL_BIN: &str = "kubectl";
const KUBECTL_BIN_ENV_VAR: &str = "KUBECTL_BIN";

pub(crate) fn helm_args(namespace: &str, release: &ReleaseDescriptor) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        release.name.clone(),
        release.chart.clone(),
        "--repo".to_string(),
        release.repo_url.clone(),
        "--version".to_string(),
        release.version.clone(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--create-namespace".to_string(),
        "--wait".to_string(),
    ];
    if let Some(values) = &release.values_file {
        args.push("--values".to_string());
        args.push(values.display().to_string());
    }
    args
}

/// Installs Helm releases and raw manifests with the `helm` and `kubectl` binaries.
#[derive(Clone, Debug)]
pub struct HelmDeployer {
    helm_bin: PathBuf,
    kubectl_bin: PathBuf,
    kubeconfig: PathBuf,
}

impl HelmDeployer {
    pub fn new<P: Into<PathBuf>>(kubeconfig: P) -> Self {
        HelmDeployer {
            helm_bin: std::env::var(HELM_BIN_ENV_VAR)
                .unwrap_or_else(|_| HELM_BIN.to_string())
                .into(),
            kubectl_bin: std::env::var(KUBECTL_BIN_ENV_VAR)
                .unwrap_or_else(|_| KUBECTL_BIN.to_string())
                .into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    async fn run(&self, program: &Path, namespace: &str, args: Vec<String>) -> Result<()> {
        let output = Command::new(program)
            .args(&args)
            .env("KUBECONFIG", &self.kubeconfig)
            .output()
            .await
            .context(error::DeployCommandSnafu {
                program: program.display().to_string(),
                args: args.clone(),
            })?;
        ensure!(
            output.status.success(),
            error::DeployFailedSnafu {
                program: program.display().to_string(),
                namespace,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }
        );
        Ok(())
    }
}

#[async_trait]
impl ApplicationDeployer for HelmDeployer {
    #[instrument(skip(self, release), fields(release = %release.name), err)]
    async fn install_release(&self, namespace: &str, release: &ReleaseDescriptor) -> Result<()> {
        self.run(&self.helm_bin, namespace, helm_args(namespace, release))
            .await
    }

    #[instrument(skip(self), err)]
    async fn apply_manifests(&self, namespace: &str, manifests: &[PathBuf]) -> Result<()> {
        for manifest in manifests {
            let args = vec![
                "apply".to_string(),
                "--namespace".to_string(),
                namespace.to_string(),
                "-f".to_string(),
                manifest.display().to_string(),
            ];
            self.run(&self.kubectl_bin, namespace, args).await?;
        }
        Ok(())
    }
}
