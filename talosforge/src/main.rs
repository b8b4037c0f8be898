/*!
`talosforge` converges a Talos Linux cluster hosted on Proxmox VE to the state described by an inventory file.

Progress is kept under `--state-dir`, so an interrupted or failed run can simply be repeated.
*/

use controller::orchestrator::{read_outputs, render_node};
use controller::{
    ApplicationGate, Cancellation, ClusterOrchestrator, ClusterOutputs, HealthGateSettings,
    OrchestratorClients, UpgradeSettings,
};
use models::client::{
    write_private_file, FileStateStore, HelmDeployer, HttpImageFactoryClient, ProxmoxClient,
    ProxmoxSettings, TalosctlClient, UpgradeOptions,
};
use models::cluster::{ClusterSpec, Inventory};
use models::telemetry;

use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::process;
use structopt::StructOpt;
use tracing::{event, Level};

type Result<T> = std::result::Result<T, error::Error>;

const DEFAULT_INVENTORY: &str = "inventory.yaml";
const DEFAULT_STATE_DIR: &str = ".talosforge";
const DEFAULT_OUTPUT_DIR: &str = "out";

const KUBECONFIG_FILE: &str = "kubeconfig";
const TALOSCONFIG_FILE: &str = "talosconfig.yaml";
const OUTPUTS_FILE: &str = "outputs.json";
const TALOSCTL_WORK_DIR: &str = "talosctl";

// Retryable failures (timeouts, interrupts) exit differently from hard rejections.
const EXIT_FAILURE: i32 = 1;
const EXIT_RETRYABLE: i32 = 2;

#[tokio::main]
async fn main() {
    if let Err(e) = telemetry::init_telemetry_from_env() {
        eprintln!("{}", e);
        process::exit(EXIT_FAILURE);
    }

    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(if e.is_retryable() {
            EXIT_RETRYABLE
        } else {
            EXIT_FAILURE
        });
    }
}

#[derive(StructOpt, Debug)]
pub(crate) struct Arguments {
    #[structopt(
        global = true,
        long = "--inventory",
        default_value = DEFAULT_INVENTORY,
        parse(from_os_str)
    )]
    inventory: PathBuf,

    #[structopt(
        global = true,
        long = "--state-dir",
        default_value = DEFAULT_STATE_DIR,
        parse(from_os_str)
    )]
    state_dir: PathBuf,

    #[structopt(
        global = true,
        long = "--output-dir",
        default_value = DEFAULT_OUTPUT_DIR,
        parse(from_os_str)
    )]
    output_dir: PathBuf,

    #[structopt(subcommand)]
    subcommand: SubCommand,
}

#[derive(StructOpt, Debug, PartialEq)]
enum SubCommand {
    /// Provision every node, wait for the cluster to become healthy and deploy its applications.
    Apply(ApplyArgs),
    /// Roll the inventory's OS version through the nodes, control plane first.
    Upgrade(UpgradeArgs),
    /// Print the machine configuration patch of one node.
    Render(RenderArgs),
    /// Write the outputs of an applied cluster without contacting it.
    Outputs,
}

#[derive(StructOpt, Debug, PartialEq)]
pub struct ApplyArgs {
    #[structopt(long = "--skip-apps")]
    skip_apps: bool,
}

#[derive(StructOpt, Debug, PartialEq)]
pub struct UpgradeArgs {
    /// Wipe the ephemeral partition during the upgrade.
    #[structopt(long = "--no-preserve")]
    no_preserve: bool,

    /// Stage the upgrade to be performed on the next reboot.
    #[structopt(long = "--stage")]
    stage: bool,

    #[structopt(long = "--force")]
    force: bool,
}

impl From<&UpgradeArgs> for UpgradeOptions {
    fn from(args: &UpgradeArgs) -> Self {
        UpgradeOptions {
            preserve: !args.no_preserve,
            stage: args.stage,
            force: args.force,
        }
    }
}

#[derive(StructOpt, Debug, PartialEq)]
pub struct RenderArgs {
    #[structopt(long = "--node")]
    node: String,
}

type LiveOrchestrator =
    ClusterOrchestrator<TalosctlClient, HttpImageFactoryClient, ProxmoxClient, FileStateStore>;

fn orchestrator(args: &Arguments, cluster: &ClusterSpec) -> Result<LiveOrchestrator> {
    let settings = ProxmoxSettings::from_env().context(error::HypervisorSettingsSnafu)?;
    let hypervisor = ProxmoxClient::new(settings).context(error::HypervisorSettingsSnafu)?;

    let clients = OrchestratorClients {
        talos: TalosctlClient::from_env(
            args.state_dir.join(&cluster.name).join(TALOSCTL_WORK_DIR),
        ),
        factory: HttpImageFactoryClient::from_env(),
        hypervisor,
        store: FileStateStore::new(&args.state_dir),
    };
    Ok(ClusterOrchestrator::new(
        clients,
        HealthGateSettings::default(),
    ))
}

/// A cancellation token which fires on the first interrupt. Steps already in flight still finish.
fn cancel_on_interrupt() -> Cancellation {
    let cancellation = Cancellation::new();
    let handle = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(
                Level::WARN,
                "Interrupted, stopping once in-flight steps finish."
            );
            handle.cancel();
        }
    });
    cancellation
}

async fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    if secret {
        write_private_file(path, contents).await
    } else {
        tokio::fs::write(path, contents).await
    }
    .context(error::WriteOutputSnafu { path })
}

/// Writes the credentials and the public outputs of the cluster to `output_dir`.
async fn write_outputs(output_dir: &Path, outputs: &ClusterOutputs) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .context(error::WriteOutputSnafu { path: output_dir })?;

    write_file(
        &output_dir.join(KUBECONFIG_FILE),
        outputs.kubeconfig.as_bytes(),
        true,
    )
    .await?;
    write_file(
        &output_dir.join(TALOSCONFIG_FILE),
        outputs.talosconfig.as_bytes(),
        true,
    )
    .await?;

    let public = serde_json::to_vec_pretty(outputs).context(error::SerializeOutputsSnafu)?;
    write_file(&output_dir.join(OUTPUTS_FILE), &public, false).await?;

    event!(Level::INFO, output_dir = %output_dir.display(), "Wrote cluster outputs.");
    Ok(())
}

async fn run() -> Result<()> {
    let args = Arguments::from_args();

    let cluster = Inventory::from_path(&args.inventory).context(error::LoadInventorySnafu {
        path: args.inventory.clone(),
    })?;
    let store = FileStateStore::new(&args.state_dir);

    match &args.subcommand {
        SubCommand::Apply(apply_args) => {
            let applied = orchestrator(&args, &cluster)?
                .apply(&cluster, &cancel_on_interrupt())
                .await
                .context(error::LifecycleSnafu)?;
            write_outputs(&args.output_dir, &applied.outputs).await?;

            if apply_args.skip_apps || cluster.applications.is_empty() {
                event!(Level::INFO, "No applications to deploy.");
            } else {
                let deployer = HelmDeployer::new(args.output_dir.join(KUBECONFIG_FILE));
                ApplicationGate::new(deployer)
                    .deploy(&applied.healthy, &cluster.applications)
                    .await
                    .context(error::LifecycleSnafu)?;
            }
        }
        SubCommand::Upgrade(upgrade_args) => {
            let report = orchestrator(&args, &cluster)?
                .upgrade(
                    &cluster,
                    &UpgradeOptions::from(upgrade_args),
                    UpgradeSettings::default(),
                    &cancel_on_interrupt(),
                )
                .await
                .context(error::LifecycleSnafu)?;
            event!(
                Level::INFO,
                upgraded = report.upgraded(),
                total = report.outcomes.len(),
                "Upgrade finished."
            );
        }
        SubCommand::Render(render_args) => {
            let document = render_node(&store, &cluster, &render_args.node)
                .await
                .context(error::LifecycleSnafu)?;
            print!("{}", document);
        }
        SubCommand::Outputs => {
            let outputs = read_outputs(&store, &cluster)
                .await
                .context(error::LifecycleSnafu)?;
            write_outputs(&args.output_dir, &outputs).await?;
        }
    }
    Ok(())
}

mod error {
    use models::client::ClientError;
    use models::cluster::ClusterSpecError;
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("Unable to load inventory '{}': {}", path.display(), source))]
        LoadInventory {
            path: PathBuf,
            source: ClusterSpecError,
        },

        #[snafu(display("Unable to configure the hypervisor client: {}", source))]
        HypervisorSettings { source: ClientError },

        #[snafu(display("{}", source))]
        Lifecycle { source: controller::Error },

        #[snafu(display("Unable to serialize cluster outputs: {}", source))]
        SerializeOutputs { source: serde_json::Error },

        #[snafu(display("Unable to write '{}': {}", path.display(), source))]
        WriteOutput {
            path: PathBuf,
            source: std::io::Error,
        },
    }

    impl Error {
        pub(super) fn is_retryable(&self) -> bool {
            match self {
                Self::Lifecycle { source } => source.is_retryable(),
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::client::PRIVATE_FILE_MODE;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_arguments() {
        let test_cases = vec![
            (
                vec!["talosforge", "apply"],
                SubCommand::Apply(ApplyArgs { skip_apps: false }),
            ),
            (
                vec!["talosforge", "apply", "--skip-apps"],
                SubCommand::Apply(ApplyArgs { skip_apps: true }),
            ),
            (
                vec!["talosforge", "upgrade", "--no-preserve", "--stage"],
                SubCommand::Upgrade(UpgradeArgs {
                    no_preserve: true,
                    stage: true,
                    force: false,
                }),
            ),
            (
                vec!["talosforge", "render", "--node", "cp-1"],
                SubCommand::Render(RenderArgs {
                    node: "cp-1".to_string(),
                }),
            ),
            (vec!["talosforge", "outputs"], SubCommand::Outputs),
        ];

        for (argv, expected) in test_cases {
            let args = Arguments::from_iter_safe(argv).unwrap();
            assert_eq!(args.subcommand, expected);
            assert_eq!(args.inventory, PathBuf::from(DEFAULT_INVENTORY));
        }
    }

    #[test]
    fn test_global_paths() {
        let args = Arguments::from_iter_safe(vec![
            "talosforge",
            "outputs",
            "--inventory",
            "lab.yaml",
            "--output-dir",
            "/tmp/lab",
        ])
        .unwrap();
        assert_eq!(args.inventory, PathBuf::from("lab.yaml"));
        assert_eq!(args.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(args.output_dir, PathBuf::from("/tmp/lab"));
    }

    #[test]
    fn test_upgrade_options() {
        assert_eq!(
            UpgradeOptions::from(&UpgradeArgs {
                no_preserve: false,
                stage: false,
                force: false,
            }),
            UpgradeOptions::default()
        );
        assert!(
            !UpgradeOptions::from(&UpgradeArgs {
                no_preserve: true,
                stage: false,
                force: true,
            })
            .preserve
        );
    }

    #[tokio::test]
    async fn test_write_outputs() {
        let output_dir = std::env::temp_dir().join(format!("talosforge-outputs-{}", process::id()));
        let outputs = ClusterOutputs {
            kubeconfig: "apiVersion: v1\nkind: Config\n".to_string(),
            talosconfig: "context: homelab\n".to_string(),
            cluster_endpoint: "https://10.0.0.10:6443".to_string(),
            controlplane_ips: vec!["10.0.0.10".parse().unwrap()],
            images: BTreeMap::new(),
        };
        // A kubeconfig left behind by an earlier run with looser permissions.
        let kubeconfig = output_dir.join(KUBECONFIG_FILE);
        std::fs::create_dir_all(&output_dir).unwrap();
        std::fs::write(&kubeconfig, "stale").unwrap();
        std::fs::set_permissions(&kubeconfig, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_outputs(&output_dir, &outputs).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&kubeconfig).unwrap(),
            outputs.kubeconfig
        );
        let mode = std::fs::metadata(&kubeconfig).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, PRIVATE_FILE_MODE);

        let public: serde_json::Value =
            serde_json::from_slice(&std::fs::read(output_dir.join(OUTPUTS_FILE)).unwrap()).unwrap();
        assert_eq!(public["cluster_endpoint"], "https://10.0.0.10:6443");
        assert!(public.get("kubeconfig").is_none());

        std::fs::remove_dir_all(&output_dir).unwrap();
    }
}
