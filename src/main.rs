mod config;
mod deploy;
mod descriptor;
mod environment;
mod gateway;
mod launcher;
mod plan;
mod process;
mod recipe;
mod resources;
mod runners;
mod volumes;
mod watchdog;

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ServiceSettings, CONFIG_FILE_NAME};
use crate::descriptor::{DeploymentDescriptor, ServiceDescriptor};
use crate::launcher::LaunchState;
use crate::plan::BuildPlan;
use crate::resources::ResourceDescriptor;
use crate::volumes::{LocalVolumeStore, VolumeBindingSet};
use crate::watchdog::StopReason;

#[derive(Parser, Debug)]
#[command(name = "kohya-host", version, about = "Build, attach and serve the Kohya SS GUI on a GPU host")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the TOML configuration document
    #[arg(long, global = true, env = "KOHYA_HOST_CONFIG", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved deployment descriptor as JSON
    Describe,
    /// Execute the build plan and commit the environment image
    Build {
        /// Log each step without touching docker
        #[arg(long)]
        dry_run: bool,
        /// Image tag to commit (defaults to kohya-ss-gui:<version date>)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Run the service in this environment until it exits
    Serve {
        /// Seconds to wait for the port before giving up
        #[arg(long)]
        startup_timeout: Option<u64>,
    },
    /// Build, attach volumes, launch and expose the service locally
    Deploy {
        /// Reuse an already built image
        #[arg(long)]
        skip_build: bool,
        /// Loopback port the container publishes on
        #[arg(long)]
        upstream_port: Option<u16>,
        /// Keep volumes as host directories (default: the user data dir)
        #[arg(long, value_name = "DIR", num_args = 0..=1)]
        local_volumes: Option<Option<PathBuf>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("KOHYA_HOST_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(command) = cli.command else {
        println!("No command given; nothing was provisioned.\n");
        Cli::command().print_help()?;
        println!("\nStart with `kohya-host describe`, then `kohya-host deploy`.");
        return Ok(());
    };

    match command {
        Commands::Describe => cmd_describe(&cli.config)?,
        Commands::Build { dry_run, tag } => cmd_build(dry_run, tag).await?,
        Commands::Serve { startup_timeout } => cmd_serve(&cli.config, startup_timeout).await?,
        Commands::Deploy {
            skip_build,
            upstream_port,
            local_volumes,
        } => {
            let volume_root = local_volumes.map(|dir| dir.unwrap_or_else(LocalVolumeStore::default_root));
            cmd_deploy(&cli.config, skip_build, upstream_port, volume_root).await?
        }
    }
    Ok(())
}

struct Resolved {
    plan: BuildPlan,
    resources: ResourceDescriptor,
    settings: ServiceSettings,
}

fn resolve(config: &Path) -> Result<Resolved> {
    let (resources, settings) = config::resolve(config);
    let plan = recipe::kohya_plan().context("building the kohya plan")?;
    Ok(Resolved { plan, resources, settings })
}

fn descriptor(resolved: &Resolved) -> Result<DeploymentDescriptor> {
    let volumes = VolumeBindingSet::kohya().context("kohya volume bindings")?;
    Ok(DeploymentDescriptor::new(
        recipe::default_image_tag(),
        &resolved.plan,
        resolved.resources.clone(),
        &resolved.settings,
        volumes,
    ))
}

fn cmd_describe(config: &Path) -> Result<()> {
    let resolved = resolve(config)?;
    let descriptor = descriptor(&resolved)?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

async fn cmd_build(dry_run: bool, tag: Option<String>) -> Result<()> {
    let plan = recipe::kohya_plan()?;
    let tag = tag.unwrap_or_else(recipe::default_image_tag);
    let outcome = deploy::build(&plan, &tag, dry_run).await?;
    let secs = (outcome.finished_at - outcome.started_at).num_seconds();
    println!("✓ {} ({} steps via {}, {}s)", outcome.artifact, outcome.steps_run, outcome.backend, secs);
    Ok(())
}

async fn cmd_serve(config: &Path, startup_timeout: Option<u64>) -> Result<()> {
    let mut resolved = resolve(config)?;
    if let Some(secs) = startup_timeout {
        resolved.settings.startup_timeout_secs = secs;
    }
    let service = ServiceDescriptor::kohya(&resolved.resources, &resolved.settings);
    match deploy::serve(&service).await? {
        LaunchState::Crashed => bail!("service crashed"),
        state => println!("Service {state}"),
    }
    Ok(())
}

async fn cmd_deploy(config: &Path, skip_build: bool, upstream_port: Option<u16>, volume_root: Option<PathBuf>) -> Result<()> {
    let resolved = resolve(config)?;
    let descriptor = descriptor(&resolved)?;
    let opts = deploy::DeployOptions {
        skip_build,
        upstream_port,
        listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        volume_root,
    };
    let report = deploy::deploy(&descriptor, &resolved.plan, &opts).await?;
    println!("Instance stopped ({}), service {}", report.reason, report.final_state);
    if report.reason == StopReason::ServiceExited || report.final_state == LaunchState::Crashed {
        bail!("service ended unexpectedly");
    }
    Ok(())
}
