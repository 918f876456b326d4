//! Declarative, ordered description of how an environment is built, and the
//! sequential executor that materializes it.
//!
//! A [`BuildPlan`] is validated once at construction and offers no way to
//! change it afterwards. Execution walks the steps in insertion order and
//! stops at the first failure; nothing after the failing step runs and the
//! backend is told to throw its partial state away.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runners::{BuildBackend, FinishContext, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Pip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    BaseImageSelect {
        image: String,
        python_version: Option<String>,
    },
    EnvSet {
        vars: Vec<(String, String)>,
    },
    PackageInstall {
        manager: PackageManager,
        packages: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
    ShellCommand {
        commands: Vec<String>,
    },
    Workdir {
        path: String,
    },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BaseImageSelect { .. } => "base_image_select",
            Self::EnvSet { .. } => "env_set",
            Self::PackageInstall { .. } => "package_install",
            Self::ShellCommand { .. } => "shell_command",
            Self::Workdir { .. } => "workdir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub requires_accelerator: bool,
}

impl BuildStep {
    pub fn base_image(image: impl Into<String>, python_version: Option<&str>) -> Self {
        Self::from_kind(StepKind::BaseImageSelect {
            image: image.into(),
            python_version: python_version.map(str::to_string),
        })
    }

    pub fn env<K: Into<String>, V: Into<String>>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::from_kind(StepKind::EnvSet {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        })
    }

    pub fn apt<S: Into<String>>(packages: impl IntoIterator<Item = S>) -> Self {
        Self::install(PackageManager::Apt, packages, Vec::<String>::new())
    }

    pub fn pip<S: Into<String>>(packages: impl IntoIterator<Item = S>) -> Self {
        Self::install(PackageManager::Pip, packages, Vec::<String>::new())
    }

    pub fn install<S: Into<String>, O: Into<String>>(
        manager: PackageManager,
        packages: impl IntoIterator<Item = S>,
        options: impl IntoIterator<Item = O>,
    ) -> Self {
        Self::from_kind(StepKind::PackageInstall {
            manager,
            packages: packages.into_iter().map(Into::into).collect(),
            options: options.into_iter().map(Into::into).collect(),
        })
    }

    pub fn shell<S: Into<String>>(commands: impl IntoIterator<Item = S>) -> Self {
        Self::from_kind(StepKind::ShellCommand {
            commands: commands.into_iter().map(Into::into).collect(),
        })
    }

    pub fn workdir(path: impl Into<String>) -> Self {
        Self::from_kind(StepKind::Workdir { path: path.into() })
    }

    /// Marks the step as needing a GPU-equipped builder.
    pub fn on_accelerator(mut self) -> Self {
        self.requires_accelerator = true;
        self
    }

    fn from_kind(kind: StepKind) -> Self {
        Self {
            kind,
            requires_accelerator: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("build plan has no steps")]
    Empty,

    #[error("step 0 must select the base image, found {found}")]
    BaseImageNotFirst { found: &'static str },

    #[error("step {index} selects a second base image")]
    DuplicateBaseImage { index: usize },

    #[error("step {index} sets a relative working directory '{path}'")]
    RelativeWorkdir { index: usize, path: String },

    #[error("step {index} declares an environment variable with an empty name")]
    EmptyEnvKey { index: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build step {index} ({kind}) failed")]
    StepFailed {
        index: usize,
        kind: &'static str,
        /// Environment as declared up to the failing step.
        env: BTreeMap<String, String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to commit the built environment")]
    Commit {
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub plan: String,
    pub backend: &'static str,
    pub artifact: String,
    pub steps_run: usize,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    name: String,
    steps: Vec<BuildStep>,
}

impl BuildPlan {
    pub fn new(name: impl Into<String>, steps: Vec<BuildStep>) -> Result<Self, PlanError> {
        let first = steps.first().ok_or(PlanError::Empty)?;
        if !matches!(first.kind, StepKind::BaseImageSelect { .. }) {
            return Err(PlanError::BaseImageNotFirst { found: first.kind.label() });
        }

        for (index, step) in steps.iter().enumerate().skip(1) {
            match &step.kind {
                StepKind::BaseImageSelect { .. } => return Err(PlanError::DuplicateBaseImage { index }),
                StepKind::Workdir { path } if !path.starts_with('/') => {
                    return Err(PlanError::RelativeWorkdir { index, path: path.clone() })
                }
                StepKind::EnvSet { vars } if vars.iter().any(|(k, _)| k.trim().is_empty()) => {
                    return Err(PlanError::EmptyEnvKey { index })
                }
                _ => {}
            }
        }

        let plan = Self { name: name.into(), steps };
        let unpinned = plan.unpinned_packages();
        if !unpinned.is_empty() {
            tracing::warn!(plan = %plan.name, packages = ?unpinned, "pip packages without an exact version pin");
        }
        Ok(plan)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    #[cfg(test)]
    pub fn base_image(&self) -> &str {
        match &self.steps[0].kind {
            StepKind::BaseImageSelect { image, .. } => image,
            _ => unreachable!("validated in BuildPlan::new"),
        }
    }

    pub fn requires_accelerator(&self) -> bool {
        self.steps.iter().any(|s| s.requires_accelerator)
    }

    /// Pip requirements lacking an `==` pin. Apt packages resolve against the
    /// base image's distribution snapshot and are not checked.
    pub fn unpinned_packages(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::PackageInstall {
                    manager: PackageManager::Pip,
                    packages,
                    ..
                } => Some(packages),
                _ => None,
            })
            .flatten()
            .filter(|p| !p.contains("=="))
            .map(String::as_str)
            .collect()
    }

    /// Runs every step against `backend`, in order, stopping at the first failure.
    pub async fn execute(&self, backend: &mut dyn BuildBackend) -> Result<BuildOutcome, BuildError> {
        let started_at = Utc::now();
        let accelerator = self.requires_accelerator();
        let total = self.steps.len();
        let mut env = BTreeMap::new();
        let mut workdir: Option<String> = None;

        tracing::info!(plan = %self.name, backend = backend.name(), steps = total, accelerator, "executing build plan");

        for (index, step) in self.steps.iter().enumerate() {
            match &step.kind {
                StepKind::EnvSet { vars } => {
                    for (k, v) in vars {
                        env.insert(k.clone(), v.clone());
                    }
                }
                StepKind::Workdir { path } => workdir = Some(path.clone()),
                _ => {}
            }

            let ctx = StepContext {
                index,
                total,
                step,
                env: &env,
                workdir: workdir.as_deref(),
                accelerator,
            };
            tracing::debug!(index, kind = step.kind.label(), gpu = step.requires_accelerator, "build step");

            if let Err(source) = backend.run_step(&ctx).await {
                tracing::error!(index, kind = step.kind.label(), error = %source, "build step failed, aborting plan");
                backend.abort().await;
                return Err(BuildError::StepFailed {
                    index,
                    kind: step.kind.label(),
                    env,
                    source,
                });
            }
        }

        let finish = FinishContext {
            env: &env,
            workdir: workdir.as_deref(),
        };
        let artifact = match backend.finish(&finish).await {
            Ok(a) => a,
            Err(source) => {
                backend.abort().await;
                return Err(BuildError::Commit { source });
            }
        };

        tracing::info!(plan = %self.name, %artifact, "build plan complete");
        Ok(BuildOutcome {
            plan: self.name.clone(),
            backend: backend.name(),
            artifact,
            steps_run: total,
            env,
            workdir,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
