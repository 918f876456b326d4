//! Durable storage bound into the environment.
//!
//! A [`VolumeBindingSet`] maps logical names to mount paths. Each name is
//! backed by a storage unit that a [`VolumeStore`] creates on first reference
//! and reuses afterwards, so attaching the same set to a fresh instance finds
//! whatever the previous instance wrote.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::runners::docker::docker;

pub const CACHE_MOUNT: &str = "/cache";
pub const MODELS_MOUNT: &str = "/kohya_ss/models";
pub const DATASET_MOUNT: &str = "/kohya_ss/dataset";
pub const OUTPUTS_MOUNT: &str = "/kohya_ss/outputs";
pub const CONFIGS_MOUNT: &str = "/kohya_ss/configs";

const KOHYA_VOLUMES: &[(&str, &str)] = &[
    ("hf-cache", CACHE_MOUNT),
    ("kohya-models", MODELS_MOUNT),
    ("kohya-dataset", DATASET_MOUNT),
    ("kohya-outputs", OUTPUTS_MOUNT),
    ("kohya-configs", CONFIGS_MOUNT),
];

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("invalid volume name '{0}'")]
    InvalidName(String),

    #[error("volume '{0}' is bound twice")]
    DuplicateName(String),

    #[error("mount path '{path}' for volume '{name}' is not absolute")]
    RelativeMount { name: String, path: String },

    #[error("mount paths '{first}' and '{second}' overlap")]
    OverlappingMounts { first: String, second: String },

    #[error("volume store '{store}' failed for '{name}': {reason}")]
    Store {
        store: &'static str,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBinding {
    pub logical_name: String,
    pub mount_path: String,
}

impl VolumeBinding {
    pub fn new(logical_name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// A fixed, non-overlapping set of bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VolumeBindingSet {
    bindings: Vec<VolumeBinding>,
}

impl VolumeBindingSet {
    pub fn new(bindings: Vec<VolumeBinding>) -> Result<Self, VolumeError> {
        let mut names = HashSet::new();
        for b in &bindings {
            if !valid_name(&b.logical_name) {
                return Err(VolumeError::InvalidName(b.logical_name.clone()));
            }
            if !names.insert(b.logical_name.as_str()) {
                return Err(VolumeError::DuplicateName(b.logical_name.clone()));
            }
            if !b.mount_path.starts_with('/') {
                return Err(VolumeError::RelativeMount {
                    name: b.logical_name.clone(),
                    path: b.mount_path.clone(),
                });
            }
        }

        for (i, a) in bindings.iter().enumerate() {
            for b in &bindings[i + 1..] {
                if overlaps(&a.mount_path, &b.mount_path) {
                    return Err(VolumeError::OverlappingMounts {
                        first: a.mount_path.clone(),
                        second: b.mount_path.clone(),
                    });
                }
            }
        }

        Ok(Self { bindings })
    }

    /// The five stores the kohya GUI expects.
    pub fn kohya() -> Result<Self, VolumeError> {
        Self::new(
            KOHYA_VOLUMES
                .iter()
                .map(|(name, path)| VolumeBinding::new(*name, *path))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[cfg(test)]
    pub fn mount_path(&self, logical_name: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| b.logical_name == logical_name)
            .map(|b| b.mount_path.as_str())
    }
}

// Docker's rule for volume names.
fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn overlaps(a: &str, b: &str) -> bool {
    let a = Path::new(a);
    let b = Path::new(b);
    a.starts_with(b) || b.starts_with(a)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "source", rename_all = "snake_case")]
pub enum VolumeSource {
    /// A named volume managed by the container engine.
    Named(String),
    /// A host directory bind-mounted into the environment.
    HostPath(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeHandle {
    pub name: String,
    pub source: VolumeSource,
    /// `false` when an existing unit was reused.
    pub created: bool,
}

#[async_trait::async_trait]
pub trait VolumeStore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Returns the unit for `name`, creating it if absent.
    async fn ensure(&self, name: &str) -> Result<VolumeHandle, VolumeError>;
}

/// Named volumes on the local Docker engine.
pub struct DockerVolumeStore;

const MANAGED_LABEL: &str = "kohya-host.managed=true";

fn inspect_args(name: &str) -> [&str; 3] {
    ["volume", "inspect", name]
}

fn create_args(name: &str) -> [&str; 5] {
    ["volume", "create", "--label", MANAGED_LABEL, name]
}

#[async_trait::async_trait]
impl VolumeStore for DockerVolumeStore {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn ensure(&self, name: &str) -> Result<VolumeHandle, VolumeError> {
        let store_err = |reason: String| VolumeError::Store {
            store: "docker",
            name: name.to_string(),
            reason,
        };

        let mut inspect = docker().map_err(|e| store_err(e.to_string()))?;
        inspect.args(inspect_args(name));
        let found = inspect
            .output()
            .await
            .map_err(|e| store_err(e.to_string()))?
            .status
            .success();

        if !found {
            let mut create = docker().map_err(|e| store_err(e.to_string()))?;
            create.args(create_args(name));
            let out = create.output().await.map_err(|e| store_err(e.to_string()))?;
            if !out.status.success() {
                return Err(store_err(String::from_utf8_lossy(&out.stderr).trim().to_string()));
            }
            tracing::info!(volume = name, "created docker volume");
        }

        Ok(VolumeHandle {
            name: name.to_string(),
            source: VolumeSource::Named(name.to_string()),
            created: !found,
        })
    }
}

/// One directory per logical name under `root`.
pub struct LocalVolumeStore {
    root: PathBuf,
}

impl LocalVolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data dir>/kohya-host/volumes`, or a temp dir fallback.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kohya-host/volumes")
    }
}

#[async_trait::async_trait]
impl VolumeStore for LocalVolumeStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn ensure(&self, name: &str) -> Result<VolumeHandle, VolumeError> {
        if !valid_name(name) {
            return Err(VolumeError::InvalidName(name.to_string()));
        }
        let dir = self.root.join(name);
        let existed = tokio::fs::try_exists(&dir).await.unwrap_or(false);
        if !existed {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| VolumeError::Store {
                store: "local",
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            tracing::info!(volume = name, path = %dir.display(), "created local volume");
        }
        Ok(VolumeHandle {
            name: name.to_string(),
            source: VolumeSource::HostPath(dir),
            created: !existed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kohya_bindings() {
        let set = VolumeBindingSet::kohya().unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.mount_path("hf-cache"), Some("/cache"));
        assert_eq!(set.mount_path("kohya-configs"), Some("/kohya_ss/configs"));
        assert_eq!(set.mount_path("nope"), None);
    }

    #[test]
    fn test_docker_volume_argv() {
        assert_eq!(inspect_args("hf-cache"), ["volume", "inspect", "hf-cache"]);
        assert_eq!(
            create_args("hf-cache"),
            ["volume", "create", "--label", "kohya-host.managed=true", "hf-cache"]
        );
    }

    #[test]
    fn test_rejects_duplicate_names_and_overlapping_paths() {
        let dup = VolumeBindingSet::new(vec![VolumeBinding::new("a", "/x"), VolumeBinding::new("a", "/y")]);
        assert!(matches!(dup, Err(VolumeError::DuplicateName(n)) if n == "a"));

        let same = VolumeBindingSet::new(vec![VolumeBinding::new("a", "/x"), VolumeBinding::new("b", "/x")]);
        assert!(matches!(same, Err(VolumeError::OverlappingMounts { .. })));

        let nested = VolumeBindingSet::new(vec![VolumeBinding::new("a", "/x"), VolumeBinding::new("b", "/x/y")]);
        assert!(matches!(nested, Err(VolumeError::OverlappingMounts { .. })));

        // Sharing a prefix string is not nesting.
        tokio_test::assert_ok!(VolumeBindingSet::new(vec![
            VolumeBinding::new("a", "/data"),
            VolumeBinding::new("b", "/data2"),
        ]));
    }

    #[test]
    fn test_rejects_bad_names_and_relative_paths() {
        assert!(matches!(
            VolumeBindingSet::new(vec![VolumeBinding::new("-bad", "/x")]),
            Err(VolumeError::InvalidName(_))
        ));
        assert!(matches!(
            VolumeBindingSet::new(vec![VolumeBinding::new("a/b", "/x")]),
            Err(VolumeError::InvalidName(_))
        ));
        assert!(matches!(
            VolumeBindingSet::new(vec![VolumeBinding::new("a", "x")]),
            Err(VolumeError::RelativeMount { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_store_is_idempotent_and_keeps_content() {
        let root = TempDir::new().unwrap();

        // First environment instantiation.
        let store = LocalVolumeStore::new(root.path());
        let first = store.ensure("kohya-models").await.unwrap();
        assert!(first.created);
        let VolumeSource::HostPath(dir) = &first.source else {
            panic!("expected host path");
        };
        tokio::fs::write(dir.join("model.safetensors"), b"weights").await.unwrap();

        // Second one, with a fresh store over the same root.
        let store = LocalVolumeStore::new(root.path());
        let second = store.ensure("kohya-models").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.source, first.source);
        let content = tokio::fs::read(dir.join("model.safetensors")).await.unwrap();
        assert_eq!(content, b"weights");
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let root = TempDir::new().unwrap();
        let store = LocalVolumeStore::new(root.path());
        assert!(matches!(store.ensure("../escape").await, Err(VolumeError::InvalidName(_))));
    }
}
