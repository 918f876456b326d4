//! What gets deployed, as plain data.
//!
//! The descriptor says what to run and with which resources and storage; how
//! those are provisioned is left to the deploy pipeline and the launcher.

use serde::Serialize;
use tokio::process::Command;

use crate::config::ServiceSettings;
use crate::plan::BuildPlan;
use crate::process::shell_quote;
use crate::recipe::{APP_NAME, KOHYA_BASE};
use crate::resources::{ResourceDescriptor, MAX_INSTANCES};
use crate::volumes::VolumeBindingSet;

pub const KOHYA_SCRIPT: &str = "kohya_gui.py";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new<S: Into<String>>(program: impl Into<String>, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            workdir: None,
            env: Vec::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// The GUI server. These flags are a fixed contract with kohya_ss.
    pub fn kohya_gui(port: u16, cpu_threads: u32) -> Self {
        Self::new(
            "accelerate",
            [
                "launch".to_string(),
                format!("--num_cpu_threads_per_process={cpu_threads}"),
                KOHYA_SCRIPT.to_string(),
                "--listen".to_string(),
                "0.0.0.0".to_string(),
                "--server_port".to_string(),
                port.to_string(),
                "--headless".to_string(),
                "--noverify".to_string(),
                "--share".to_string(),
            ],
        )
        .in_dir(KOHYA_BASE)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// One shell line equivalent to this command, `cd` included.
    pub fn shell_line(&self) -> String {
        let mut line = String::new();
        if let Some(dir) = &self.workdir {
            line.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        for (k, v) in &self.env {
            line.push_str(&format!("{k}={} ", shell_quote(v)));
        }
        line.push_str(&shell_quote(&self.program));
        for a in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(a));
        }
        line
    }
}

/// The launch contract for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub port: u16,
    pub concurrency_limit: u32,
    pub startup_timeout_secs: u64,
    pub command: LaunchCommand,
}

impl ServiceDescriptor {
    pub fn kohya(resources: &ResourceDescriptor, settings: &ServiceSettings) -> Self {
        Self {
            port: settings.port,
            concurrency_limit: resources.max_concurrent_inputs,
            startup_timeout_secs: settings.startup_timeout_secs,
            command: LaunchCommand::kohya_gui(settings.port, resources.cpu_threads()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptor {
    pub app_name: String,
    pub image_tag: String,
    pub plan: String,
    pub resources: ResourceDescriptor,
    pub volumes: VolumeBindingSet,
    pub service: ServiceDescriptor,
    pub max_instances: u32,
}

impl DeploymentDescriptor {
    pub fn new(
        image_tag: impl Into<String>,
        plan: &BuildPlan,
        resources: ResourceDescriptor,
        settings: &ServiceSettings,
        volumes: VolumeBindingSet,
    ) -> Self {
        let service = ServiceDescriptor::kohya(&resources, settings);
        Self {
            app_name: APP_NAME.to_string(),
            image_tag: image_tag.into(),
            plan: plan.name().to_string(),
            resources,
            volumes,
            service,
            max_instances: MAX_INSTANCES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::kohya_plan;

    #[test]
    fn test_kohya_launch_flags() {
        let cmd = LaunchCommand::kohya_gui(8000, 4);
        assert_eq!(
            cmd.shell_line(),
            "cd /kohya_ss && accelerate launch --num_cpu_threads_per_process=4 kohya_gui.py --listen 0.0.0.0 --server_port 8000 --headless --noverify --share"
        );
    }

    #[test]
    fn test_shell_line_quotes_env_and_args() {
        let mut cmd = LaunchCommand::new("echo", ["a b"]);
        cmd.env.push(("GREETING".into(), "hi there".into()));
        assert_eq!(cmd.shell_line(), "GREETING='hi there' echo 'a b'");
    }

    #[test]
    fn test_service_descriptor_follows_resolved_settings() {
        let resources = ResourceDescriptor {
            max_concurrent_inputs: 3,
            cpu_count: 8.0,
            port: 7860,
            ..ResourceDescriptor::default()
        };
        let settings = ServiceSettings {
            port: 7860,
            startup_timeout_secs: 120,
        };
        let svc = ServiceDescriptor::kohya(&resources, &settings);
        assert_eq!(svc.port, 7860);
        assert_eq!(svc.concurrency_limit, 3);
        assert_eq!(svc.startup_timeout_secs, 120);
        assert!(svc.command.args.contains(&"--num_cpu_threads_per_process=8".to_string()));
        assert!(svc.command.args.windows(2).any(|w| w == ["--server_port", "7860"]));
    }

    #[test]
    fn test_deployment_descriptor_json() {
        let plan = kohya_plan().unwrap();
        let d = DeploymentDescriptor::new(
            "kohya-ss-gui:test",
            &plan,
            ResourceDescriptor::default(),
            &ServiceSettings::default(),
            VolumeBindingSet::kohya().unwrap(),
        );
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["maxInstances"], 1);
        assert_eq!(json["resources"]["gpuClass"], "A10G");
        assert_eq!(json["service"]["startupTimeoutSecs"], 300);
        assert_eq!(json["service"]["concurrencyLimit"], 10);
        assert_eq!(json["volumes"][0]["logicalName"], "hf-cache");
        assert_eq!(json["volumes"][0]["mountPath"], "/cache");
    }
}
