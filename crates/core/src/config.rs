//! Run configuration and per-hook environment construction.
//!
//! [`SharedConfig`] is the single mutable configuration map of a run. It is
//! seeded from caller overrides and grows as foreground hooks report
//! discoveries (see [`crate::directives`]). Every hook's environment is
//! rebuilt from it by [`build_env_for_plugin`] right before launch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::plugin::Plugin;

/// Environment variable map handed to a hook process.
pub type HookEnv = BTreeMap<String, String>;

/// Default foreground hook timeout in seconds.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// Generic timeout variable consulted when no plugin-specific one is set.
pub const TIMEOUT_ENV_VAR: &str = "TIMEOUT";

// ---------------------------------------------------------------------------
// LibPaths
// ---------------------------------------------------------------------------

/// Shared library locations exposed to every hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibPaths {
    /// Root of the shared library directory.
    pub lib_dir: PathBuf,
    /// `node_modules` directory used by JavaScript hooks.
    pub node_modules_dir: PathBuf,
    /// Package-manager bin directory, prepended to `PATH`.
    pub npm_bin_dir: PathBuf,
}

impl LibPaths {
    /// Derive the standard layout beneath `lib_dir`.
    pub fn new(lib_dir: impl Into<PathBuf>) -> Self {
        let lib_dir = lib_dir.into();
        let node_modules_dir = lib_dir.join("npm").join("node_modules");
        let npm_bin_dir = node_modules_dir.join(".bin");
        Self {
            lib_dir,
            node_modules_dir,
            npm_bin_dir,
        }
    }

    /// Load library paths from environment variables with defaults.
    ///
    /// | Env Var            | Default                          |
    /// |--------------------|----------------------------------|
    /// | `LIB_DIR`          | `$HOME/.config/abx/lib`          |
    /// | `NODE_MODULES_DIR` | `$LIB_DIR/npm/node_modules`      |
    /// | `NPM_BIN_DIR`      | `$NODE_MODULES_DIR/.bin`         |
    pub fn from_env() -> Self {
        let lib_dir = std::env::var_os("LIB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                home.join(".config").join("abx").join("lib")
            });

        let mut paths = Self::new(lib_dir);
        if let Some(dir) = std::env::var_os("NODE_MODULES_DIR") {
            paths.node_modules_dir = PathBuf::from(dir);
            paths.npm_bin_dir = paths.node_modules_dir.join(".bin");
        }
        if let Some(dir) = std::env::var_os("NPM_BIN_DIR") {
            paths.npm_bin_dir = PathBuf::from(dir);
        }
        paths
    }
}

// ---------------------------------------------------------------------------
// SharedConfig
// ---------------------------------------------------------------------------

/// The run-wide configuration map visible to every hook.
///
/// Owned by the orchestrator and passed by reference into each launch; only
/// the orchestrator's control task mutates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedConfig {
    values: BTreeMap<String, Value>,
}

impl SharedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from caller-supplied overrides.
    pub fn from_overrides(overrides: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: overrides.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Merge every configuration directive in a hook's stdout.
    ///
    /// Returns the keys that were written, in order.
    pub fn merge_stdout(&mut self, stdout: &str) -> Vec<String> {
        crate::directives::config_updates(stdout)
            .into_iter()
            .map(|(key, value)| {
                tracing::debug!(key = %key, "Merging hook configuration update");
                self.values.insert(key.clone(), value);
                key
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Render a configuration value as an environment variable string.
///
/// Strings are passed through verbatim; everything else is rendered as JSON.
pub fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Build the environment for one of `plugin`'s hooks.
///
/// Layers, lowest precedence first:
/// 1. `base` (normally the engine's own process environment),
/// 2. the plugin's schema defaults, for keys `base` does not set,
/// 3. every shared configuration key, upper-cased,
/// 4. `LIB_DIR`, `NODE_MODULES_DIR`, `NPM_BIN_DIR`, and `PATH` prefixed with
///    the npm bin directory.
pub fn build_env_for_plugin(
    plugin: &Plugin,
    shared: &SharedConfig,
    lib: &LibPaths,
    base: impl IntoIterator<Item = (String, String)>,
) -> HookEnv {
    let mut env: HookEnv = base.into_iter().collect();

    for (key, default) in &plugin.config_schema {
        env.entry(key.to_uppercase())
            .or_insert_with(|| value_to_env(default));
    }

    for (key, value) in shared.iter() {
        env.insert(key.to_uppercase(), value_to_env(value));
    }

    env.insert("LIB_DIR".into(), path_str(&lib.lib_dir));
    env.insert("NODE_MODULES_DIR".into(), path_str(&lib.node_modules_dir));
    env.insert("NPM_BIN_DIR".into(), path_str(&lib.npm_bin_dir));

    let path = match env.get("PATH") {
        Some(existing) if !existing.is_empty() => {
            format!("{}:{existing}", path_str(&lib.npm_bin_dir))
        }
        _ => path_str(&lib.npm_bin_dir),
    };
    env.insert("PATH".into(), path);

    env
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Name of the per-plugin timeout variable, e.g. `SINGLEFILE_TIMEOUT`.
pub fn plugin_timeout_var(plugin_name: &str) -> String {
    format!("{}_TIMEOUT", plugin_name.to_uppercase().replace('-', "_"))
}

/// Resolve a hook's timeout from its environment.
///
/// Consults `<PLUGIN>_TIMEOUT`, then `TIMEOUT`, then falls back to
/// [`DEFAULT_HOOK_TIMEOUT_SECS`]. Unparseable values are skipped.
pub fn resolve_timeout(env: &HookEnv, plugin_name: &str) -> Duration {
    let plugin_var = plugin_timeout_var(plugin_name);
    let secs = [plugin_var.as_str(), TIMEOUT_ENV_VAR]
        .into_iter()
        .find_map(|var| {
            let raw = env.get(var)?;
            match raw.trim().parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    tracing::warn!(var, value = %raw, "Ignoring invalid timeout value");
                    None
                }
            }
        })
        .unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
