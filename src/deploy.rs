//! The local host platform: build, attach, launch, expose, supervise.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout, Instant};

use crate::descriptor::{DeploymentDescriptor, LaunchCommand, ServiceDescriptor};
use crate::environment::{attach, AttachedEnvironment, EnvironmentRef};
use crate::gateway::Gateway;
use crate::launcher::{LaunchState, Probe, ServiceLauncher};
use crate::plan::{BuildOutcome, BuildPlan};
use crate::runners::docker::{docker, DockerBackend};
use crate::runners::dry_run::DryRunBackend;
use crate::runners::BuildBackend;
use crate::volumes::{DockerVolumeStore, LocalVolumeStore, VolumeStore};
use crate::watchdog::{self, StopReason};

/// How long `docker stop` gives the service before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub skip_build: bool,
    /// Loopback port the container is published on; defaults to the service port + 1.
    pub upstream_port: Option<u16>,
    pub listen_host: IpAddr,
    /// Back volumes with host directories under this root instead of docker volumes.
    pub volume_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployReport {
    pub reason: StopReason,
    pub final_state: LaunchState,
}

pub async fn build(plan: &BuildPlan, tag: &str, dry_run: bool) -> Result<BuildOutcome> {
    let mut docker_backend;
    let mut dry_backend;
    let backend: &mut dyn BuildBackend = if dry_run {
        dry_backend = DryRunBackend::new();
        &mut dry_backend
    } else {
        docker_backend = DockerBackend::new(tag);
        &mut docker_backend
    };
    let outcome = plan
        .execute(backend)
        .await
        .context("provisioning failed: environment build aborted")?;
    Ok(outcome)
}

fn instance_filter_args(name: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "-q".to_string(),
        "--filter".to_string(),
        format!("name=^/{name}$"),
    ]
}

fn stop_args(name: &str) -> Vec<String> {
    vec![
        "stop".to_string(),
        "--time".to_string(),
        STOP_GRACE.as_secs().to_string(),
        name.to_string(),
    ]
}

/// Refuses to start a second instance of `name`.
pub async fn ensure_single_instance(name: &str) -> Result<()> {
    let mut cmd = docker()?;
    cmd.args(instance_filter_args(name));
    let out = cmd.output().await.context("listing running containers")?;
    if !out.status.success() {
        bail!("docker ps failed: {}", String::from_utf8_lossy(&out.stderr).trim());
    }
    if !String::from_utf8_lossy(&out.stdout).trim().is_empty() {
        bail!("an instance named '{name}' is already running; only one instance per deployment is allowed");
    }
    Ok(())
}

/// The loopback port the container is published on.
fn upstream_port(service_port: u16, requested: Option<u16>) -> Result<u16> {
    match requested {
        Some(p) => Ok(p),
        None => service_port
            .checked_add(1)
            .context("service port leaves no room for an upstream port; pass --upstream-port"),
    }
}

/// `docker run` in the foreground, publishing the service port on loopback.
pub fn container_command(attached: &AttachedEnvironment, service: &ServiceDescriptor, upstream_port: u16) -> LaunchCommand {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-p".to_string(),
        format!("127.0.0.1:{upstream_port}:{}", service.port),
    ];
    args.extend(attached.docker_args());
    args.push(attached.environment.image.clone());
    args.extend(["bash".to_string(), "-c".to_string(), service.command.shell_line()]);
    LaunchCommand::new("docker", args)
}

async fn stop_container(name: &str) {
    match docker() {
        Ok(mut c) => {
            c.args(stop_args(name));
            if let Err(e) = c.output().await {
                tracing::warn!(instance = name, error = %e, "docker stop failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot stop instance"),
    }
}

/// Starts the service unless `hard_deadline` passes first.
pub async fn start_before(launcher: &mut ServiceLauncher, hard_deadline: Instant) -> Result<()> {
    let started = tokio::select! {
        r = launcher.start() => Some(r),
        _ = sleep_until(hard_deadline) => None,
    };
    match started {
        Some(r) => Ok(r?),
        None => {
            launcher.abandon_start();
            bail!("hard timeout reached before the service listened");
        }
    }
}

pub async fn deploy(descriptor: &DeploymentDescriptor, plan: &BuildPlan, opts: &DeployOptions) -> Result<DeployReport> {
    let name = descriptor.app_name.as_str();
    let service = &descriptor.service;
    let resources = &descriptor.resources;

    // 1) claim the public port before anything is built or started
    let listen = SocketAddr::new(opts.listen_host, service.port);
    let upstream = SocketAddr::from(([127, 0, 0, 1], upstream_port(service.port, opts.upstream_port)?));
    let gateway = Gateway::bind(listen, upstream, service.concurrency_limit)
        .await
        .with_context(|| format!("binding gateway on {listen}"))?;
    let public = gateway.local_addr().unwrap_or(listen);

    // 2) materialize the environment
    if opts.skip_build {
        tracing::info!(image = %descriptor.image_tag, "skipping build");
    } else {
        let outcome = build(plan, &descriptor.image_tag, false).await?;
        println!(
            "✓ Built {} ({} steps, {}s)",
            outcome.artifact,
            outcome.steps_run,
            (outcome.finished_at - outcome.started_at).num_seconds()
        );
    }

    // 3) one instance at a time
    ensure_single_instance(name).await?;

    // 4) volumes, before anything starts
    let environment = EnvironmentRef {
        image: descriptor.image_tag.clone(),
        instance_name: name.to_string(),
    };
    let store: Box<dyn VolumeStore> = match &opts.volume_root {
        Some(root) => Box::new(LocalVolumeStore::new(root)),
        None => Box::new(DockerVolumeStore),
    };
    tracing::info!(store = store.kind(), "attaching volumes");
    let attached = attach(&environment, &descriptor.volumes, resources, store.as_ref())
        .await
        .context("attaching volumes")?;

    // 5) launch; the hard limit runs from here
    let hard_deadline = Instant::now() + resources.hard_timeout();
    let mut launcher = ServiceLauncher::new(
        container_command(&attached, service, upstream.port()),
        Probe::Http(upstream),
        Duration::from_secs(service.startup_timeout_secs),
    );
    tracing::info!(probe = %launcher.probe(), "waiting for the service");
    if let Err(e) = start_before(&mut launcher, hard_deadline).await {
        stop_container(name).await;
        return Err(e).context("deployment failed: service did not start");
    }

    // 6) expose with the concurrency ceiling
    let activity = gateway.activity();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let gateway_task = tokio::spawn(gateway.run(async move {
        let _ = shutdown_rx.await;
    }));
    println!("✓ {name} listening on http://{public} (max {} concurrent inputs)", service.concurrency_limit);

    // 7) supervise until a watchdog, a signal or the service ends it
    let reason = tokio::select! {
        r = watchdog::watch(activity, resources.idle_timeout(), hard_deadline) => r,
        _ = tokio::signal::ctrl_c() => StopReason::Signal,
        end = launcher.wait() => {
            match end {
                Ok(state) => tracing::error!(%state, "service exited on its own"),
                Err(e) => tracing::error!(error = %e, "lost track of the service process"),
            }
            StopReason::ServiceExited
        }
    };
    tracing::info!(%reason, "tearing down instance");

    let _ = shutdown_tx.send(());
    if launcher.state() == LaunchState::Listening {
        launcher.request_stop();
        stop_container(name).await;
        match timeout(STOP_GRACE + Duration::from_secs(5), launcher.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "waiting for the instance failed"),
            Err(_) => {
                tracing::warn!("instance did not exit in time, killing the client");
                launcher.stop().await?;
            }
        }
    }
    if let Ok(Err(e)) = gateway_task.await {
        tracing::warn!(error = %e, "gateway ended with an error");
    }

    Ok(DeployReport {
        reason,
        final_state: launcher.state(),
    })
}

/// In-environment entry point: run the service until it exits or ctrl-c.
/// Timeouts are the host's business, not this process's.
pub async fn serve(service: &ServiceDescriptor) -> Result<LaunchState> {
    let mut launcher = ServiceLauncher::for_service(service);
    launcher.start().await.context("service failed to start")?;
    println!("✓ Listening on port {}", service.port);

    let exited = tokio::select! {
        end = launcher.wait() => Some(end),
        _ = tokio::signal::ctrl_c() => None,
    };
    let end = match exited {
        Some(end) => end?,
        None => launcher.stop().await?,
    };
    Ok(end)
}
