//! Plugin and hook descriptors.
//!
//! These are supplied by an external discovery step; the engine only reads
//! them. A [`Plugin`] bundles its [`Hook`]s with the binaries they depend
//! on and the defaults for its configuration keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a plugin or hook name.
pub const MAX_NAME_LENGTH: usize = 200;

/// Binary provider consulted when a spec names none.
pub const DEFAULT_BINPROVIDER: &str = "env";

// ---------------------------------------------------------------------------
// HookPhase
// ---------------------------------------------------------------------------

/// The ordering tier a hook belongs to. Every crawl hook runs before any
/// snapshot hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Crawl,
    Snapshot,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Snapshot => "snapshot",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_lowercase().as_str() {
            "crawl" => Ok(Self::Crawl),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(CoreError::Validation(format!(
                "Invalid hook phase: '{s}'. Must be one of: crawl, snapshot"
            ))),
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Hook
// ---------------------------------------------------------------------------

/// A single executable unit belonging to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Name of the owning plugin. Filled in by [`Plugin::with_hook`].
    #[serde(default)]
    pub plugin_name: String,
    pub name: String,
    /// Language tag (`py`, `js`, `sh`). Kept raw so that unknown tags can be
    /// reported per hook instead of failing descriptor loading.
    pub language: String,
    pub path: PathBuf,
    #[serde(default)]
    pub is_background: bool,
    /// Ascending execution order within a phase.
    #[serde(default)]
    pub sort_key: i32,
    pub phase: HookPhase,
}

// ---------------------------------------------------------------------------
// BinarySpec
// ---------------------------------------------------------------------------

/// A binary dependency declared by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarySpec {
    pub name: String,
    /// Comma-separated provider names, e.g. `"env,apt,brew"`.
    #[serde(default = "default_binproviders")]
    pub binproviders: String,
    /// Provider-specific overrides, passed through untouched.
    #[serde(default)]
    pub overrides: serde_json::Value,
}

fn default_binproviders() -> String {
    DEFAULT_BINPROVIDER.to_string()
}

impl BinarySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binproviders: default_binproviders(),
            overrides: serde_json::Value::Null,
        }
    }

    /// Provider names listed in [`binproviders`](Self::binproviders).
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.binproviders
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// A named bundle of hooks plus their declared dependencies and
/// configuration defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub binaries: Vec<BinarySpec>,
    /// Configuration key -> default value.
    #[serde(default)]
    pub config_schema: BTreeMap<String, serde_json::Value>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Attach a hook, stamping it with this plugin's name.
    pub fn with_hook(mut self, mut hook: Hook) -> Self {
        hook.plugin_name = self.name.clone();
        self.hooks.push(hook);
        self
    }

    pub fn with_binary(mut self, spec: BinarySpec) -> Self {
        self.binaries.push(spec);
        self
    }

    pub fn with_config_default(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config_schema.insert(key.into(), value);
        self
    }

    /// Re-stamp every hook with this plugin's name. Used after
    /// deserializing a descriptor where hooks are nested under the plugin.
    pub fn bind_hooks(mut self) -> Self {
        for hook in &mut self.hooks {
            hook.plugin_name = self.name.clone();
        }
        self
    }

    pub fn crawl_hooks(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(|h| h.phase == HookPhase::Crawl)
    }

    pub fn snapshot_hooks(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(|h| h.phase == HookPhase::Snapshot)
    }

    /// Check the plugin name and its hook names.
    ///
    /// The plugin name doubles as its output subdirectory, so it must be a
    /// single relative path component.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_name("Plugin", &self.name)?;
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(CoreError::Validation(format!(
                "Plugin name '{}' must be a single path component",
                self.name
            )));
        }
        for hook in &self.hooks {
            validate_name("Hook", &hook.name)?;
        }
        Ok(())
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(format!("{kind} name must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(CoreError::Validation(format!(
            "{kind} name exceeds maximum length of {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
