//! Configuration resolution for the deployment.
//!
//! The configuration document is optional in every respect: a missing file,
//! broken TOML or a mistyped section yields the built-in defaults, and a
//! single unusable key only costs that key its value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::resources::ResourceDescriptor;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const MODAL_SECTION: &str = "modal_settings";
pub const KOHYA_SECTION: &str = "kohya_settings";

/// Built-in fallback values, consulted independently for every key.
pub struct Defaults;

impl Defaults {
    pub const MAX_CONCURRENT_INPUTS: u32 = 10;
    pub const IDLE_TIMEOUT_SECS: u64 = 600;
    pub const HARD_TIMEOUT_SECS: u64 = 3600;
    pub const GPU_CLASS: &'static str = "A10G";
    pub const CPU_COUNT: f64 = 4.0;
    pub const MEMORY_MB: u64 = 8192;
    pub const PORT: u16 = 8000;
    pub const STARTUP_TIMEOUT_SECS: u64 = 300;
}

/// Service-side half of the resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    pub port: u16,
    pub startup_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            port: Defaults::PORT,
            startup_timeout_secs: Defaults::STARTUP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("section `{section}` must be a table, found {found}")]
    SectionType { section: String, found: &'static str },
}

/// The loaded document, split into its two recognised sections.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    modal: Table,
    kohya: Table,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root: Table = text.parse()?;
        Ok(Self {
            modal: section(&root, MODAL_SECTION)?,
            kohya: section(&root, KOHYA_SECTION)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn resources(&self) -> ResourceDescriptor {
        let m = &self.modal;
        ResourceDescriptor {
            max_concurrent_inputs: key(m, MODAL_SECTION, "allow_concurrent_inputs", Defaults::MAX_CONCURRENT_INPUTS, |v| {
                positive_int(v).and_then(|n| u32::try_from(n).ok())
            }),
            idle_timeout_secs: key(m, MODAL_SECTION, "container_idle_timeout", Defaults::IDLE_TIMEOUT_SECS, positive_int),
            hard_timeout_secs: key(m, MODAL_SECTION, "timeout", Defaults::HARD_TIMEOUT_SECS, positive_int),
            gpu_class: key(m, MODAL_SECTION, "gpu", Defaults::GPU_CLASS.to_string(), non_empty_string),
            cpu_count: key(m, MODAL_SECTION, "cpu", Defaults::CPU_COUNT, positive_number),
            memory_mb: key(m, MODAL_SECTION, "memory", Defaults::MEMORY_MB, positive_int),
            port: self.port(),
        }
    }

    pub fn service(&self) -> ServiceSettings {
        ServiceSettings {
            port: self.port(),
            ..ServiceSettings::default()
        }
    }

    fn port(&self) -> u16 {
        key(&self.kohya, KOHYA_SECTION, "port", Defaults::PORT, |v| {
            positive_int(v).and_then(|n| u16::try_from(n).ok())
        })
    }
}

/// Resolves the deployment settings from the document at `path`.
///
/// Never fails. Load errors are logged and answered with the full default set.
pub fn resolve(path: &Path) -> (ResourceDescriptor, ServiceSettings) {
    match ConfigDocument::load(path) {
        Ok(doc) => {
            tracing::info!(path = %path.display(), "loaded deployment config");
            (doc.resources(), doc.service())
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config unavailable, using built-in defaults");
            (ResourceDescriptor::default(), ServiceSettings::default())
        }
    }
}

fn section(root: &Table, name: &str) -> Result<Table, ConfigError> {
    match root.get(name) {
        None => Ok(Table::new()),
        Some(Value::Table(t)) => Ok(t.clone()),
        Some(other) => Err(ConfigError::SectionType {
            section: name.to_string(),
            found: other.type_str(),
        }),
    }
}

fn key<T>(section: &Table, section_name: &str, name: &str, default: T, read: impl Fn(&Value) -> Option<T>) -> T {
    let Some(raw) = section.get(name) else {
        return default;
    };
    match read(raw) {
        Some(v) => v,
        None => {
            tracing::warn!(section = section_name, key = name, value = %raw, "ignoring unusable config value");
            default
        }
    }
}

// Numbers are often written as strings ("4", "8192"); both spellings are accepted.
fn positive_int(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) if *i > 0 => u64::try_from(*i).ok(),
        Value::String(s) => s.trim().parse::<u64>().ok().filter(|n| *n > 0),
        _ => None,
    }
}

fn positive_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}

fn non_empty_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, body).unwrap();
        (dir, path)
    }

    fn expected_defaults() -> ResourceDescriptor {
        ResourceDescriptor {
            max_concurrent_inputs: 10,
            idle_timeout_secs: 600,
            hard_timeout_secs: 3600,
            gpu_class: "A10G".to_string(),
            cpu_count: 4.0,
            memory_mb: 8192,
            port: 8000,
        }
    }

    #[test]
    fn test_absent_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let (resources, service) = resolve(&dir.path().join("missing.toml"));
        assert_eq!(resources, expected_defaults());
        assert_eq!(service, ServiceSettings { port: 8000, startup_timeout_secs: 300 });
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let (_dir, path) = write_config("");
        let (resources, _) = resolve(&path);
        assert_eq!(resources, expected_defaults());
    }

    #[test]
    fn test_malformed_documents_yield_defaults() {
        for body in [
            "modal_settings = [",
            "[modal_settings\ngpu = 'H100'",
            "modal_settings = 5",
            "kohya_settings = \"port\"",
            "\u{0}\u{1}garbage",
        ] {
            let (_dir, path) = write_config(body);
            let (resources, service) = resolve(&path);
            assert_eq!(resources, expected_defaults(), "body: {body:?}");
            assert_eq!(service, ServiceSettings::default(), "body: {body:?}");
        }
    }

    #[test]
    fn test_only_gpu_overridden() {
        let (_dir, path) = write_config("[modal_settings]\ngpu = \"H100\"\n");
        let (resources, _) = resolve(&path);
        assert_eq!(
            resources,
            ResourceDescriptor {
                gpu_class: "H100".to_string(),
                ..expected_defaults()
            }
        );
    }

    #[test]
    fn test_subset_of_keys_is_honored_per_key() {
        let (_dir, path) = write_config(
            "[modal_settings]\ntimeout = 7200\nmemory = 16384\n\n[kohya_settings]\nport = 7860\n",
        );
        let (resources, service) = resolve(&path);
        assert_eq!(resources.hard_timeout_secs, 7200);
        assert_eq!(resources.memory_mb, 16384);
        assert_eq!(resources.port, 7860);
        assert_eq!(service.port, 7860);
        assert_eq!(resources.max_concurrent_inputs, 10);
        assert_eq!(resources.idle_timeout_secs, 600);
        assert_eq!(resources.gpu_class, "A10G");
        assert_eq!(resources.cpu_count, 4.0);
    }

    #[test]
    fn test_string_numbers_are_accepted() {
        let doc = ConfigDocument::parse("[modal_settings]\ncpu = \"8\"\nmemory = \"32768\"\n").unwrap();
        let resources = doc.resources();
        assert_eq!(resources.cpu_count, 8.0);
        assert_eq!(resources.memory_mb, 32768);
    }

    #[test]
    fn test_fractional_cpu() {
        let doc = ConfigDocument::parse("[modal_settings]\ncpu = 2.5\n").unwrap();
        assert_eq!(doc.resources().cpu_count, 2.5);
    }

    #[test]
    fn test_bad_value_only_affects_its_own_key() {
        let doc = ConfigDocument::parse(
            "[modal_settings]\nallow_concurrent_inputs = \"lots\"\ncontainer_idle_timeout = -5\ngpu = \"\"\ncpu = true\ntimeout = 900\n\n[kohya_settings]\nport = 70000\n",
        )
        .unwrap();
        let resources = doc.resources();
        assert_eq!(resources.max_concurrent_inputs, 10);
        assert_eq!(resources.idle_timeout_secs, 600);
        assert_eq!(resources.gpu_class, "A10G");
        assert_eq!(resources.cpu_count, 4.0);
        assert_eq!(resources.port, 8000);
        assert_eq!(resources.hard_timeout_secs, 900);
    }

    #[test]
    fn test_unknown_sections_and_keys_are_ignored() {
        let doc = ConfigDocument::parse("[other]\nx = 1\n[modal_settings]\nregion = \"eu\"\ngpu = \"L4\"\n").unwrap();
        assert_eq!(doc.resources().gpu_class, "L4");
    }

    #[test]
    fn test_section_type_error() {
        let err = ConfigDocument::parse("modal_settings = 5").unwrap_err();
        assert!(matches!(err, ConfigError::SectionType { ref section, .. } if section == MODAL_SECTION));
    }
}
