// src/runners/docker.rs
use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use which::which;

use super::{BuildBackend, FinishContext, StepContext};
use crate::plan::{PackageManager, StepKind};
use crate::process::{run_checked, shell_quote};

/// Where `add_python` style bootstraps put their interpreter.
const PYTHON_PREFIX: &str = "/opt/python";
const SYSTEM_PATH: &str = "/usr/local/nvidia/bin:/usr/local/cuda/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub fn docker() -> Result<Command> {
    if which("docker").is_err() {
        bail!("docker not found on PATH");
    }
    Ok(Command::new("docker"))
}

/// Builds the environment inside a throwaway builder container and commits it
/// as an image once every step has passed.
pub struct DockerBackend {
    tag: String,
    builder: String,
    container_started: bool,
    /// Variables the backend itself introduces (interpreter PATH).
    base_env: BTreeMap<String, String>,
}

impl DockerBackend {
    pub fn new(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let builder = format!(
            "kohya-host-build-{}",
            tag.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).collect::<String>()
        );
        Self {
            tag,
            builder,
            container_started: false,
            base_env: BTreeMap::new(),
        }
    }

    fn merged_env(&self, plan_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.base_env.clone();
        env.extend(plan_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    async fn start_builder(&mut self, image: &str, accelerator: bool) -> Result<()> {
        let mut pull = docker()?;
        pull.args(["pull", image]);
        run_checked(pull, "docker pull").await?;

        // Leftover from an interrupted build.
        let mut rm = docker()?;
        rm.args(["rm", "-f", &self.builder]);
        let _ = rm.output().await;

        let mut cmd = docker()?;
        cmd.args(builder_run_args(&self.builder, image, accelerator));
        run_checked(cmd, "docker run").await?;
        self.container_started = true;
        tracing::info!(builder = %self.builder, image, accelerator, "builder container started");
        Ok(())
    }

    async fn exec(&self, ctx: &StepContext<'_>, script: &str) -> Result<()> {
        let mut cmd = docker()?;
        cmd.args(exec_args(&self.builder, &self.merged_env(ctx.env), ctx.workdir, script));
        let tag = format!("step {}/{}", ctx.index + 1, ctx.total);
        run_checked(cmd, &tag).await
    }
}

fn builder_run_args(builder: &str, image: &str, accelerator: bool) -> Vec<String> {
    let mut args = vec!["run", "-d", "--name", builder];
    if accelerator {
        args.extend(["--gpus", "all"]);
    }
    args.extend(["--entrypoint", "sleep", image, "infinity"]);
    args.into_iter().map(str::to_string).collect()
}

/// `docker exec` running `script` under `set -e`.
fn exec_args(builder: &str, env: &BTreeMap<String, String>, workdir: Option<&str>, script: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for (k, v) in env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    if let Some(wd) = workdir {
        args.push("-w".to_string());
        args.push(wd.to_string());
    }
    args.extend([builder.to_string(), "bash".to_string(), "-c".to_string(), format!("set -e\n{script}")]);
    args
}

fn commit_args(builder: &str, tag: &str, env: &BTreeMap<String, String>, workdir: Option<&str>) -> Result<Vec<String>> {
    let mut changes = Vec::new();
    for (k, v) in env {
        changes.push(env_change(k, v)?);
    }
    if let Some(wd) = workdir {
        changes.push(format!("WORKDIR {wd}"));
    }
    // The builder ran with `--entrypoint sleep`; don't bake that in.
    changes.push("ENTRYPOINT []".to_string());
    changes.push(r#"CMD ["bash"]"#.to_string());

    let mut args = vec!["commit".to_string()];
    for change in changes {
        args.push("--change".to_string());
        args.push(change);
    }
    args.extend([builder.to_string(), tag.to_string()]);
    Ok(args)
}

/// Script installing `version` of CPython into [`PYTHON_PREFIX`].
fn python_bootstrap(version: &str) -> String {
    [
        "export DEBIAN_FRONTEND=noninteractive",
        "apt-get update",
        "apt-get install -y --no-install-recommends software-properties-common",
        "add-apt-repository -y ppa:deadsnakes/ppa",
        "apt-get update",
        &format!("apt-get install -y --no-install-recommends python{version} python{version}-venv python{version}-dev"),
        &format!("python{version} -m venv {PYTHON_PREFIX}"),
        &format!("{PYTHON_PREFIX}/bin/python -m pip install --upgrade pip"),
        "rm -rf /var/lib/apt/lists/*",
    ]
    .join("\n")
}

pub(crate) fn install_script(manager: PackageManager, packages: &[String], options: &[String]) -> String {
    let args = options
        .iter()
        .chain(packages)
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    match manager {
        PackageManager::Apt => format!(
            "apt-get update\napt-get install -y --no-install-recommends {args}\nrm -rf /var/lib/apt/lists/*"
        ),
        PackageManager::Pip => format!("python -m pip install {args}"),
    }
}

/// `--change` instruction for one variable. Values are JSON-quoted, which the
/// Dockerfile parser accepts as a double-quoted string.
fn env_change(key: &str, value: &str) -> Result<String> {
    Ok(format!("ENV {key}={}", serde_json::to_string(value)?))
}

#[async_trait::async_trait]
impl BuildBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run_step(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        match &ctx.step.kind {
            StepKind::BaseImageSelect { image, python_version } => {
                self.start_builder(image, ctx.accelerator).await?;
                if let Some(v) = python_version {
                    self.exec(ctx, &python_bootstrap(v))
                        .await
                        .with_context(|| format!("installing python {v}"))?;
                    self.base_env
                        .insert("PATH".into(), format!("{PYTHON_PREFIX}/bin:{SYSTEM_PATH}"));
                }
                Ok(())
            }
            // Carried in the context and applied on every exec and on commit.
            StepKind::EnvSet { .. } => Ok(()),
            StepKind::Workdir { path } => {
                let scratch = StepContext { workdir: None, ..ctx.clone() };
                self.exec(&scratch, &format!("mkdir -p {}", shell_quote(path))).await
            }
            StepKind::PackageInstall { manager, packages, options } => {
                self.exec(ctx, &install_script(*manager, packages, options)).await
            }
            StepKind::ShellCommand { commands } => self.exec(ctx, &commands.join("\n")).await,
        }
    }

    async fn finish(&mut self, ctx: &FinishContext<'_>) -> Result<String> {
        let mut cmd = docker()?;
        cmd.args(commit_args(&self.builder, &self.tag, &self.merged_env(ctx.env), ctx.workdir)?);
        run_checked(cmd, "docker commit").await?;

        self.abort().await;
        Ok(self.tag.clone())
    }

    async fn abort(&mut self) {
        if !self.container_started {
            return;
        }
        match docker() {
            Ok(mut cmd) => {
                cmd.args(["rm", "-f", &self.builder]);
                if let Err(e) = cmd.output().await {
                    tracing::warn!(builder = %self.builder, error = %e, "failed to remove builder container");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot remove builder container"),
        }
        self.container_started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_name_is_sanitized() {
        let b = DockerBackend::new("kohya-ss-gui:latest");
        assert_eq!(b.builder, "kohya-host-build-kohya-ss-gui-latest");
    }

    #[test]
    fn test_install_scripts() {
        let pkgs = vec!["torch==2.8.0+cu128".to_string()];
        let opts = vec!["--extra-index-url".to_string(), "https://download.pytorch.org/whl/cu128".to_string()];
        assert_eq!(
            install_script(PackageManager::Pip, &pkgs, &opts),
            "python -m pip install --extra-index-url https://download.pytorch.org/whl/cu128 torch==2.8.0+cu128"
        );

        let apt = install_script(PackageManager::Apt, &["git".to_string(), "libglib2.0-0".to_string()], &[]);
        assert!(apt.contains("apt-get install -y --no-install-recommends git libglib2.0-0"));
    }

    #[test]
    fn test_env_change_quotes_value() {
        assert_eq!(
            env_change("PYTORCH_CUDA_ALLOC_CONF", "max_split_size_mb:128,expandable_segments:True").unwrap(),
            r#"ENV PYTORCH_CUDA_ALLOC_CONF="max_split_size_mb:128,expandable_segments:True""#
        );
    }

    #[test]
    fn test_plan_env_overrides_backend_env() {
        let mut b = DockerBackend::new("t");
        b.base_env.insert("PATH".into(), "/opt/python/bin".into());
        let mut plan_env = BTreeMap::new();
        plan_env.insert("PATH".to_string(), "/custom".to_string());
        plan_env.insert("TZ".to_string(), "Etc/UTC".to_string());
        let merged = b.merged_env(&plan_env);
        assert_eq!(merged["PATH"], "/custom");
        assert_eq!(merged["TZ"], "Etc/UTC");
    }

    #[test]
    fn test_python_bootstrap_targets_prefix() {
        let script = python_bootstrap("3.10");
        assert!(script.contains("python3.10 -m venv /opt/python"));
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_builder_run_args() {
        assert_eq!(
            builder_run_args("b", "nvidia/cuda:12.8.1", true),
            ["run", "-d", "--name", "b", "--gpus", "all", "--entrypoint", "sleep", "nvidia/cuda:12.8.1", "infinity"]
        );
        assert!(!builder_run_args("b", "img", false).contains(&"--gpus".to_string()));
    }

    #[test]
    fn test_exec_args() {
        let args = exec_args("b", &env(&[("A", "1"), ("B", "two words")]), Some("/kohya_ss"), "echo hi");
        assert_eq!(
            args,
            ["exec", "-e", "A=1", "-e", "B=two words", "-w", "/kohya_ss", "b", "bash", "-c", "set -e\necho hi"]
        );

        let bare = exec_args("b", &BTreeMap::new(), None, "true");
        assert_eq!(bare, ["exec", "b", "bash", "-c", "set -e\ntrue"]);
    }

    #[test]
    fn test_commit_args() {
        let args = commit_args("b", "kohya-ss-gui:2025-05-25", &env(&[("A", "1")]), Some("/kohya_ss")).unwrap();
        assert_eq!(
            args,
            [
                "commit",
                "--change",
                r#"ENV A="1""#,
                "--change",
                "WORKDIR /kohya_ss",
                "--change",
                "ENTRYPOINT []",
                "--change",
                r#"CMD ["bash"]"#,
                "b",
                "kohya-ss-gui:2025-05-25",
            ]
        );
    }
}
