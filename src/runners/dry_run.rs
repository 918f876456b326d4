use anyhow::Result;

use super::{BuildBackend, FinishContext, StepContext};
use crate::plan::StepKind;
use crate::runners::docker::install_script;

/// Prints what each step would do. Nothing is executed.
#[derive(Default)]
pub struct DryRunBackend {
    lines: Vec<String>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn emit(&mut self, line: String) {
        println!("{line}");
        self.lines.push(line);
    }
}

#[async_trait::async_trait]
impl BuildBackend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn run_step(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let gpu = if ctx.step.requires_accelerator { " [gpu]" } else { "" };
        let head = format!("[{}/{}] {}{gpu}", ctx.index + 1, ctx.total, ctx.step.kind.label());
        let body = match &ctx.step.kind {
            StepKind::BaseImageSelect { image, python_version } => match python_version {
                Some(v) => format!("{image} (python {v})"),
                None => image.clone(),
            },
            StepKind::EnvSet { vars } => vars
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" "),
            StepKind::PackageInstall { manager, packages, options } => install_script(*manager, packages, options),
            StepKind::ShellCommand { commands } => commands.join(" && "),
            StepKind::Workdir { path } => path.clone(),
        };
        self.emit(format!("{head}: {body}"));
        Ok(())
    }

    async fn finish(&mut self, ctx: &FinishContext<'_>) -> Result<String> {
        self.emit(format!(
            "commit: {} variables, workdir {}",
            ctx.env.len(),
            ctx.workdir.unwrap_or("/")
        ));
        Ok("dry-run".to_string())
    }

    async fn abort(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{BuildPlan, BuildStep};

    #[tokio::test]
    async fn test_dry_run_lists_every_step() {
        let plan = BuildPlan::new(
            "p",
            vec![
                BuildStep::base_image("nvidia/cuda:12.8.1-cudnn-devel-ubuntu24.04", Some("3.10")),
                BuildStep::env([("TZ", "Etc/UTC")]),
                BuildStep::shell(["pip install --upgrade pip"]).on_accelerator(),
                BuildStep::workdir("/kohya_ss"),
            ],
        )
        .unwrap();
        let mut backend = DryRunBackend::new();
        let outcome = plan.execute(&mut backend).await.unwrap();

        assert_eq!(outcome.artifact, "dry-run");
        assert_eq!(backend.lines().len(), 5);
        assert_eq!(
            backend.lines()[0],
            "[1/4] base_image_select: nvidia/cuda:12.8.1-cudnn-devel-ubuntu24.04 (python 3.10)"
        );
        assert_eq!(backend.lines()[2], "[3/4] shell_command [gpu]: pip install --upgrade pip");
        assert_eq!(backend.lines()[4], "commit: 1 variables, workdir /kohya_ss");
    }
}
