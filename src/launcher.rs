//! Process supervision for the wrapped service.
//!
//! ```text
//! NotStarted -> Starting -> Listening -> Stopped
//!                   |            |
//!                   +--> Crashed <+
//! ```
//!
//! The launcher starts one process and probes an address until the service
//! answers there. Beyond the probe request it does not speak the service's
//! protocol.

use std::fmt;
use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::descriptor::{LaunchCommand, ServiceDescriptor};
use crate::process::forward_output;

pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on one probe attempt, connect and answer included.
pub const PROBE_ATTEMPT: Duration = Duration::from_secs(2);

const HTTP_PROBE_REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

/// How readiness is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// A completed TCP connect.
    Tcp(SocketAddr),
    /// At least one byte in answer to an HTTP request. Required behind a
    /// published docker port: docker-proxy accepts connections before
    /// anything listens inside the container.
    Http(SocketAddr),
}

impl Probe {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(addr) | Self::Http(addr) => *addr,
        }
    }

    async fn attempt(&self) -> std::io::Result<bool> {
        let mut stream = TcpStream::connect(self.addr()).await?;
        if let Self::Http(_) = self {
            stream.write_all(HTTP_PROBE_REQUEST).await?;
            let mut buf = [0u8; 1];
            return Ok(stream.read(&mut buf).await? > 0);
        }
        Ok(true)
    }

    /// One attempt, bounded by `budget`.
    pub async fn check(&self, budget: Duration) -> bool {
        matches!(timeout(budget, self.attempt()).await, Ok(Ok(true)))
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Http(addr) => write!(f, "http://{addr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchState {
    NotStarted,
    Starting,
    Listening,
    Stopped,
    Crashed,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("cannot go from {from} to {to}")]
    InvalidTransition { from: LaunchState, to: LaunchState },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("service exited with {status} before listening on {addr}")]
    ExitedEarly { status: ExitStatus, addr: SocketAddr },

    #[error("service did not listen on {addr} within {}s", .timeout.as_secs_f64())]
    StartupTimeout { addr: SocketAddr, timeout: Duration },

    #[error("supervising the service process failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ServiceLauncher {
    command: LaunchCommand,
    probe: Probe,
    startup_timeout: Duration,
    state: LaunchState,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
    stop_requested: bool,
}

impl ServiceLauncher {
    pub fn new(command: LaunchCommand, probe: Probe, startup_timeout: Duration) -> Self {
        Self {
            command,
            probe,
            startup_timeout,
            state: LaunchState::NotStarted,
            child: None,
            pumps: Vec::new(),
            stop_requested: false,
        }
    }

    /// Runs the service's own command in this environment and probes its
    /// port on loopback, where no proxy sits in front of it.
    pub fn for_service(service: &ServiceDescriptor) -> Self {
        Self::new(
            service.command.clone(),
            Probe::Tcp(SocketAddr::from(([127, 0, 0, 1], service.port))),
            Duration::from_secs(service.startup_timeout_secs),
        )
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn probe(&self) -> Probe {
        self.probe
    }

    fn transition(&mut self, to: LaunchState) -> Result<(), LaunchError> {
        use LaunchState::*;
        let allowed = matches!(
            (self.state, to),
            (NotStarted, Starting)
                | (Starting, Listening)
                | (Starting, Crashed)
                | (Listening, Stopped)
                | (Listening, Crashed)
        );
        if !allowed {
            return Err(LaunchError::InvalidTransition { from: self.state, to });
        }
        tracing::info!(from = %self.state, to = %to, "service state");
        self.state = to;
        Ok(())
    }

    /// Spawns the process and waits until the probe succeeds, the process
    /// exits, or the startup timeout elapses.
    pub async fn start(&mut self) -> Result<(), LaunchError> {
        self.transition(LaunchState::Starting)?;

        let mut cmd = self.command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(source) => {
                self.transition(LaunchState::Crashed)?;
                return Err(LaunchError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };
        self.pumps = forward_output(&mut child, "kohya");
        tracing::info!(program = %self.command.program, pid = ?child.id(), probe = %self.probe, "service process spawned");

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    let err = LaunchError::ExitedEarly { status, addr: self.probe.addr() };
                    return Err(self.fail_start(child, err).await);
                }
                Err(e) => return Err(self.fail_start(child, e.into()).await),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.probe.check(PROBE_ATTEMPT.min(remaining)).await {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                let err = LaunchError::StartupTimeout {
                    addr: self.probe.addr(),
                    timeout: self.startup_timeout,
                };
                return Err(self.fail_start(child, err).await);
            }
            sleep(PROBE_INTERVAL.min(deadline - now)).await;
        }

        self.child = Some(child);
        self.transition(LaunchState::Listening)
    }

    /// Kills a process that never made it to `Listening` and records the crash.
    async fn fail_start(&mut self, mut child: Child, err: LaunchError) -> LaunchError {
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "service process already gone");
        }
        self.drain_output().await;
        if let Err(e) = self.transition(LaunchState::Crashed) {
            return e;
        }
        err
    }

    /// Records a start that was cancelled from outside (its future dropped)
    /// as a crash. The spawned process dies with the dropped future.
    pub fn abandon_start(&mut self) {
        if self.state == LaunchState::Starting {
            tracing::warn!("service start abandoned");
            self.pumps.clear();
            self.state = LaunchState::Crashed;
        }
    }

    /// Marks the next exit as a requested shutdown rather than a crash.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Waits for the process to exit and reports how it ended.
    pub async fn wait(&mut self) -> Result<LaunchState, LaunchError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        let status = child.wait().await?;
        self.child = None;
        self.drain_output().await;

        let end = if self.stop_requested || status.success() {
            LaunchState::Stopped
        } else {
            LaunchState::Crashed
        };
        tracing::info!(%status, "service process exited");
        self.transition(end)?;
        Ok(end)
    }

    /// Kills the process if it is still running.
    pub async fn stop(&mut self) -> Result<LaunchState, LaunchError> {
        self.request_stop();
        if let Some(child) = self.child.as_mut() {
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        self.wait().await
    }

    // A grandchild can keep the pipes open after the process itself is gone.
    async fn drain_output(&mut self) {
        for p in self.pumps.drain(..) {
            let _ = timeout(Duration::from_secs(2), p).await;
        }
    }
}
