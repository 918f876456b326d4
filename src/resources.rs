use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Defaults;

/// Running instances allowed per deployment. The volumes are single-writer,
/// and this cap is the only thing keeping them that way.
pub const MAX_INSTANCES: u32 = 1;

pub const GPU_LABEL: &str = "kohya-host.gpu";

/// Compute ceiling and lifecycle windows for one running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub max_concurrent_inputs: u32,
    pub idle_timeout_secs: u64,
    pub hard_timeout_secs: u64,
    pub gpu_class: String,
    pub cpu_count: f64,
    pub memory_mb: u64,
    pub port: u16,
}

impl Default for ResourceDescriptor {
    fn default() -> Self {
        Self {
            max_concurrent_inputs: Defaults::MAX_CONCURRENT_INPUTS,
            idle_timeout_secs: Defaults::IDLE_TIMEOUT_SECS,
            hard_timeout_secs: Defaults::HARD_TIMEOUT_SECS,
            gpu_class: Defaults::GPU_CLASS.to_string(),
            cpu_count: Defaults::CPU_COUNT,
            memory_mb: Defaults::MEMORY_MB,
            port: Defaults::PORT,
        }
    }
}

impl ResourceDescriptor {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    /// Threads per process handed to `accelerate launch`.
    pub fn cpu_threads(&self) -> u32 {
        (self.cpu_count.round() as u32).max(1)
    }

    /// `docker run` flags enforcing the ceiling.
    ///
    /// A local Docker host cannot pick a GPU model, so the class only travels
    /// as a label.
    pub fn docker_args(&self) -> Vec<String> {
        vec![
            "--cpus".to_string(),
            self.cpu_count.to_string(),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            "--gpus".to_string(),
            "all".to_string(),
            "--label".to_string(),
            format!("{GPU_LABEL}={}", self.gpu_class),
        ]
    }
}
