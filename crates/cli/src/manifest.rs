//! Plugin manifest loading.
//!
//! A manifest is a JSON file listing plugins and their hooks:
//!
//! ```json
//! {
//!   "plugins": [
//!     {
//!       "name": "wget",
//!       "binaries": [{ "name": "wget", "binproviders": "env,apt" }],
//!       "config_schema": { "WGET_ARGS": "--mirror" },
//!       "hooks": [
//!         { "name": "save", "language": "sh", "path": "wget/save.sh",
//!           "phase": "snapshot", "sort_key": 50 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Relative hook paths are resolved against the manifest's directory.

use std::path::Path;

use abx_core::plugin::Plugin;
use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Manifest {
    plugins: Vec<Plugin>,
}

/// Load and validate every plugin in the manifest at `path`.
pub fn load(path: &Path) -> anyhow::Result<Vec<Plugin>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plugin manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid plugin manifest {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let plugins = manifest
        .plugins
        .into_iter()
        .map(|plugin| {
            let mut plugin = plugin.bind_hooks();
            for hook in &mut plugin.hooks {
                if hook.path.is_relative() {
                    hook.path = base.join(&hook.path);
                }
            }
            plugin
                .validate()
                .with_context(|| format!("Invalid plugin '{}'", plugin.name))?;
            Ok(plugin)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    tracing::debug!(path = %path.display(), plugins = plugins.len(), "Loaded plugin manifest");
    Ok(plugins)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
