//! Binding storage and the compute ceiling to a built environment.

use serde::Serialize;

use crate::resources::ResourceDescriptor;
use crate::volumes::{VolumeBinding, VolumeBindingSet, VolumeError, VolumeHandle, VolumeSource, VolumeStore};

/// A built environment image and the name its one instance runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentRef {
    pub image: String,
    pub instance_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedVolume {
    pub binding: VolumeBinding,
    pub handle: VolumeHandle,
}

impl AttachedVolume {
    /// Value for `docker run --mount`.
    pub fn mount_arg(&self) -> String {
        let target = &self.binding.mount_path;
        match &self.handle.source {
            VolumeSource::Named(name) => format!("type=volume,source={name},target={target}"),
            VolumeSource::HostPath(dir) => format!("type=bind,source={},target={target}", dir.display()),
        }
    }
}

/// An environment with storage resolved and limits fixed, ready to launch.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedEnvironment {
    pub environment: EnvironmentRef,
    pub volumes: Vec<AttachedVolume>,
    pub resources: ResourceDescriptor,
}

impl AttachedEnvironment {
    /// `docker run` flags for mounts and limits, without image or command.
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.environment.instance_name.clone()];
        for v in &self.volumes {
            args.push("--mount".to_string());
            args.push(v.mount_arg());
        }
        args.extend(self.resources.docker_args());
        args
    }
}

/// Ensures every bound volume exists, in binding order, before anything starts.
pub async fn attach(
    environment: &EnvironmentRef,
    bindings: &VolumeBindingSet,
    resources: &ResourceDescriptor,
    store: &dyn VolumeStore,
) -> Result<AttachedEnvironment, VolumeError> {
    let mut volumes = Vec::with_capacity(bindings.len());
    for binding in bindings.iter() {
        let handle = store.ensure(&binding.logical_name).await?;
        tracing::info!(
            store = store.kind(),
            volume = %binding.logical_name,
            mount = %binding.mount_path,
            created = handle.created,
            "volume attached"
        );
        volumes.push(AttachedVolume {
            binding: binding.clone(),
            handle,
        });
    }

    Ok(AttachedEnvironment {
        environment: environment.clone(),
        volumes,
        resources: resources.clone(),
    })
}
