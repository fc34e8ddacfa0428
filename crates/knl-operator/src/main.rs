//! KNL Operator
//!
//! Kubernetes operator for network labs. Reconciles Lab resources into LANs,
//! pods and VMs, and helps users attach to lab nodes.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use knl_operator::{
    config::{ConfigSnapshot, OperatorSettings},
    controllers::{Context, LabController},
    crds::{KnlConfig, Lab, Lan},
    nodes::{attach_target, AttachMode, Registry},
    store::KubeStore,
};
use kube::{Api, CustomResourceExt};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "knl-operator")]
#[command(about = "Kubernetes operator for network labs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print CRD manifests to stdout
    Crds,
    /// Run the operator
    Run,
    /// Open a shell or console on a lab node
    Attach {
        /// Lab name
        lab: String,
        /// Node name
        node: String,
        #[arg(short, long, env = "KNL_LAB_NAMESPACE", default_value = "default")]
        namespace: String,
        /// Serial console instead of a shell (VM nodes)
        #[arg(long)]
        console: bool,
        /// Only print the command
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();
    let settings = OperatorSettings::from_env();

    match cli.command {
        Commands::Crds => print_crds(),
        Commands::Run => run_operator(settings).await,
        Commands::Attach {
            lab,
            node,
            namespace,
            console,
            dry_run,
        } => {
            let mode = if console {
                AttachMode::Console
            } else {
                AttachMode::Shell
            };
            attach(&settings, &namespace, &lab, &node, mode, dry_run).await
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [Lab::crd(), Lan::crd(), KnlConfig::crd()] {
        println!("---");
        println!(
            "{}",
            serde_yaml::to_string(&crd).context("Failed to serialize CRD")?
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run_operator(settings: OperatorSettings) -> anyhow::Result<()> {
    init_tracing(settings.json_logs);
    info!(
        config = %format!("{}/{}", settings.namespace, settings.config_name),
        "Starting knl-operator"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes");

    let ctx = Arc::new(Context::new(client, settings)?);
    LabController::run(ctx).await;
    Ok(())
}

async fn attach(
    settings: &OperatorSettings,
    namespace: &str,
    lab_name: &str,
    node: &str,
    mode: AttachMode,
    dry_run: bool,
) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let lab = Api::<Lab>::namespaced(client.clone(), namespace)
        .get(lab_name)
        .await
        .with_context(|| format!("Failed to read lab {namespace}/{lab_name}"))?;
    let registry = Registry::builtin()?;
    let store = KubeStore::new(client);
    let config =
        ConfigSnapshot::fetch(&store, &registry, &settings.namespace, &settings.config_name).await?;

    let argv = attach_target(&lab, &config, &registry, node, mode)?.command_line();
    println!("{}", argv.join(" "));
    if dry_run {
        return Ok(());
    }
    let Some((program, args)) = argv.split_first() else {
        bail!("empty attach command");
    };
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}
