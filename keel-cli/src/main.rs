use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::{Builder, Env, Target};
use log::{error, warn, LevelFilter};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use helpers::k8s_helpers::kubernetes::expand_kubeconfig_path;
use keel::KubeClient;
use types::{
    DEFAULT_NAMESPACE, METRICS_AGENT_CHANNEL, MONITORING_NAMESPACE, PLATFORM_OPERATOR,
    SYSTEM_NAMESPACE,
};

mod checkenvironment;
mod install;
mod monitoring;
mod upgrade;

#[derive(Parser, Debug)]
#[command(name = "keel", author, version, about, long_about = None)]
struct Cmd {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to a kubeconfig
    #[arg(short, long, global = true, env = "KUBECONFIG", default_value_t = String::from("~/.kube/config"))]
    kubeconfig: String,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Installs OLM, the catalog, the database operators and the platform operator
    Install(InstallArgs),

    /// Installs the monitoring stack only
    Monitoring(MonitoringArgs),

    /// Approves a pending upgrade of an installed operator
    Upgrade(UpgradeArgs),

    /// Checks that the cluster is reachable and reports whether OLM is installed
    CheckEnvironment,
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Comma-separated DB namespaces the engine operators are installed into
    #[arg(short, long, default_value_t = String::from(DEFAULT_NAMESPACE))]
    namespaces: String,

    /// Install the MySQL operator
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    operator_mysql: bool,

    /// Install the MongoDB operator
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    operator_mongodb: bool,

    /// Install the PostgreSQL operator
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    operator_postgresql: bool,

    /// Channel of the MySQL operator
    #[arg(long, default_value_t = String::from("stable-v1"))]
    channel_mysql: String,

    /// Channel of the MongoDB operator
    #[arg(long, default_value_t = String::from("stable-v1"))]
    channel_mongodb: String,

    /// Channel of the PostgreSQL operator
    #[arg(long, default_value_t = String::from("stable-v2"))]
    channel_postgresql: String,

    /// Channel of the platform operator
    #[arg(long, default_value_t = String::from(types::PLATFORM_OPERATOR_CHANNEL))]
    channel_platform: String,

    /// Channel of the metrics agent operator
    #[arg(long, default_value_t = String::from(METRICS_AGENT_CHANNEL))]
    channel_monitoring: String,

    /// Install the monitoring stack as well
    #[arg(long)]
    monitoring: bool,

    /// Do not install OLM, expect it to be present
    #[arg(long)]
    skip_olm: bool,

    /// Number of operators installed at the same time
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Wait for each operator's CSV to succeed instead of returning once its plan is approved
    #[arg(long)]
    wait_for_csv: bool,

    /// Seconds to wait for an operator's install plan or CSV
    #[arg(long, default_value_t = 150)]
    timeout: u64,

    /// Pass DISABLE_TELEMETRY=true to the operators. DISABLE_TELEMETRY=true in
    /// the environment does the same
    #[arg(long)]
    disable_telemetry: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MonitoringArgs {
    /// Namespace of the monitoring stack
    #[arg(short, long, default_value_t = String::from(MONITORING_NAMESPACE))]
    namespace: String,

    /// Channel of the metrics agent operator
    #[arg(long, default_value_t = String::from(METRICS_AGENT_CHANNEL))]
    channel: String,
}

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    /// Namespace the operator is installed in
    #[arg(short, long, default_value_t = String::from(SYSTEM_NAMESPACE))]
    namespace: String,

    /// Subscription name of the operator
    #[arg(short, long, default_value_t = String::from(PLATFORM_OPERATOR))]
    operator: String,

    /// Seconds to wait for the upgrade install plan
    #[arg(long, default_value_t = 150)]
    timeout: u64,
}

fn init_logger(verbose: bool) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if verbose {
        builder
            .filter_module("keel", LevelFilter::Debug)
            .filter_module("helpers", LevelFilter::Debug);
    }
    builder
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .target(Target::Stdout)
        .init();
}

pub async fn connect(global: &GlobalArgs) -> Result<Arc<KubeClient>> {
    let path = expand_kubeconfig_path(&global.kubeconfig)?;
    let client = if path.exists() {
        KubeClient::from_kubeconfig(Some(&path)).await
    } else {
        warn!("{} does not exist, using the default config", path.display());
        KubeClient::from_kubeconfig(None).await
    }
    .context("could not connect to Kubernetes")?;
    Ok(Arc::new(client))
}

/// Usage errors exit with 1 like every other failure; help and version exit with 0.
fn parse_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cmd::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(parse_exit_code(&e));
        }
    };
    init_logger(cli.global.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current step");
            on_signal.cancel();
        }
    });

    let res = match &cli.command {
        Commands::Install(args) => install::install(&cli.global, args, &cancel).await,
        Commands::Monitoring(args) => monitoring::monitoring(&cli.global, args, &cancel).await,
        Commands::Upgrade(args) => upgrade::upgrade(&cli.global, args, &cancel).await,
        Commands::CheckEnvironment => checkenvironment::check_environment(&cli.global).await,
    };

    if let Err(e) = res {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
