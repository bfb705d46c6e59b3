//! Runtime settings loader.
//!
//! Loads and merges:
//! - System defaults: `<TODO_ROOT>/config/settings.yaml`
//! - User overrides:  `<TODO_CONFIG_HOME>/todo-storage/settings.yaml`
//!
//! Merge precedence is user over system, key by key. A file that is missing,
//! unreadable or invalid is ignored with a warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use todo_jobs::OrchestratorConfig;
use todo_resilience::{NodeSpec, RetryConfig};
use todo_verify::VerificationOptions;

const DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH: &str = "config/settings.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "todo-storage/settings.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";

/// Everything the runtime reads from settings files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Job orchestrator.
    pub jobs: OrchestratorConfig,
    /// Retry engine shared by storage calls.
    pub retry: RetryConfig,
    /// Default verification options.
    pub verification: VerificationOptions,
    /// Storage network and job program.
    pub storage: StorageSettings,
    /// Event bus.
    pub events: EventSettings,
}

/// Storage network settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Storage nodes, in declaration order.
    pub nodes: Vec<NodeSpec>,
    /// Program that runs job commands (`<program> <command> <args..>`).
    /// Unset runs the command itself as the executable.
    pub program: Option<PathBuf>,
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Broadcast buffer per subscriber.
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Load settings from the default system and user locations.
pub fn load_runtime_settings() -> RuntimeSettings {
    let (system_path, user_path) = runtime_settings_paths();
    load_runtime_settings_from_paths(&system_path, &user_path)
}

/// System and user settings paths, honouring `TODO_ROOT` and
/// `TODO_CONFIG_HOME`.
pub fn runtime_settings_paths() -> (PathBuf, PathBuf) {
    let root = project_root();
    let system_path = root.join(DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH);
    let user_path = resolve_config_home(&root).join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system_path, user_path)
}

/// Load `system`, then overlay `user` on top of it.
pub fn load_runtime_settings_from_paths(system: &Path, user: &Path) -> RuntimeSettings {
    let mut merged = Value::Mapping(Mapping::new());
    for path in [system, user] {
        if let Some(layer) = load_layer(path) {
            merge_value(&mut merged, layer);
        }
    }
    match serde_yaml::from_value::<RuntimeSettings>(merged) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!(error = %error, "merged settings are invalid; using defaults");
            RuntimeSettings::default()
        }
    }
}

/// Raw YAML of one file, or `None` when it should be ignored.
fn load_layer(path: &Path) -> Option<Value> {
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to read settings file; ignoring"
            );
            return None;
        }
    };
    let value = match serde_yaml::from_str::<Value>(&raw) {
        Ok(Value::Null) => return None,
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to parse settings yaml; ignoring file"
            );
            return None;
        }
    };
    // Typecheck the layer on its own so one bad file cannot discard the other.
    if let Err(error) = serde_yaml::from_value::<RuntimeSettings>(value.clone()) {
        tracing::warn!(
            path = %path.display(),
            error = %error,
            "settings file does not match the expected shape; ignoring file"
        );
        return None;
    }
    Some(value)
}

/// Overlay `overlay` onto `base`; mappings merge recursively, anything else
/// replaces.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn project_root() -> PathBuf {
    env_path("TODO_ROOT")
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn resolve_config_home(project_root: &Path) -> PathBuf {
    let configured =
        env_path("TODO_CONFIG_HOME").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_HOME_RELATIVE_PATH));
    if configured.is_absolute() {
        configured
    } else {
        project_root.join(configured)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
