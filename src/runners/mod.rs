pub mod docker;
pub mod dry_run;

use std::collections::BTreeMap;

use anyhow::Result;

use crate::plan::BuildStep;

/// Everything a backend needs to apply one step.
#[derive(Clone, Debug)]
pub struct StepContext<'a> {
    pub index: usize,
    pub total: usize,
    pub step: &'a BuildStep,
    /// Variables declared by every `EnvSet` up to and including this step.
    pub env: &'a BTreeMap<String, String>,
    pub workdir: Option<&'a str>,
    /// Set when any step of the plan needs a GPU-equipped builder.
    pub accelerator: bool,
}

/// State handed over once the last step has succeeded.
#[derive(Clone, Debug)]
pub struct FinishContext<'a> {
    pub env: &'a BTreeMap<String, String>,
    pub workdir: Option<&'a str>,
}

/// Materializes a build plan, one step at a time.
#[async_trait::async_trait]
pub trait BuildBackend: Send {
    fn name(&self) -> &'static str;
    async fn run_step(&mut self, ctx: &StepContext<'_>) -> Result<()>;
    /// Commits the environment and returns an identifier for it.
    async fn finish(&mut self, ctx: &FinishContext<'_>) -> Result<String>;
    /// Discards whatever partial state the backend holds.
    async fn abort(&mut self);
}
