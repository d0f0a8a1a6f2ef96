mod daemon;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use daemon::{Role, RunArgs};

#[derive(Parser)]
#[command(name = "aetheriumd", version, about = "Aetherium microVM orchestration engine")]
struct Cli {
    /// Path to a TOML config file; defaults apply for anything absent or if omitted.
    #[arg(long, global = true, env = "AETHERIUM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the privileged VM driver for this node: owns the bridge, TAP
    /// allocation, and hypervisor processes.
    Hostd(DaemonFlags),
    /// Run the task loop for this node: registers with the service
    /// registry, claims tasks, and dispatches them.
    Workerd(DaemonFlags),
}

#[derive(clap::Args)]
struct DaemonFlags {
    /// Worker id to register as; generated if omitted.
    #[arg(long, env = "AETHERIUM_WORKER_ID")]
    worker_id: Option<String>,
    /// Hypervisor binary to spawn per VM.
    #[arg(long, env = "AETHERIUM_HYPERVISOR_BIN", default_value = "firecracker")]
    hypervisor_bin: String,
    /// Directory for per-VM control sockets and run-time state.
    #[arg(long, env = "AETHERIUM_RUN_DIR", default_value = "/var/lib/aetherium/run")]
    run_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = aeth_core::config::EngineConfig::load(cli.config.as_deref()).context("loading config")?;

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    match cli.command {
        Commands::Hostd(flags) => rt.block_on(daemon::run(Role::Hostd, cfg, flags.into())),
        Commands::Workerd(flags) => rt.block_on(daemon::run(Role::Workerd, cfg, flags.into())),
    }
}

impl From<DaemonFlags> for RunArgs {
    fn from(flags: DaemonFlags) -> Self {
        RunArgs {
            worker_id: flags.worker_id,
            hypervisor_bin: flags.hypervisor_bin,
            run_dir: flags.run_dir,
        }
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aetheriumd=info,warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}
