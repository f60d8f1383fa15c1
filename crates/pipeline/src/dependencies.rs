//! Binary dependency checks run before a plugin's hooks.
//!
//! [`DependencyGate`] is the seam to whatever resolves and installs binaries
//! (package managers, provider backends). The orchestrator only needs to
//! know which declared binaries are still missing after
//! [`check_plugin_dependencies`].

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use abx_core::plugin::{BinarySpec, Plugin, DEFAULT_BINPROVIDER};

/// Resolves and optionally installs a plugin's declared binaries.
pub trait DependencyGate: Send + Sync {
    /// Look up an already-installed binary. `None` if it is not usable.
    fn load(&self, spec: &BinarySpec) -> impl std::future::Future<Output = Option<PathBuf>> + Send;

    /// Try to install a binary. `None` if installation failed or is not
    /// supported.
    fn install(&self, spec: &BinarySpec) -> impl std::future::Future<Output = Option<PathBuf>> + Send;
}

/// Check every binary `plugin` declares, installing missing ones when
/// `auto_install` is set.
///
/// Returns the names of binaries that are still unavailable; an empty list
/// means the plugin can run.
pub async fn check_plugin_dependencies<G: DependencyGate>(
    gate: &G,
    plugin: &Plugin,
    auto_install: bool,
) -> Vec<String> {
    let mut missing = Vec::new();
    for spec in &plugin.binaries {
        let mut found = gate.load(spec).await;
        if found.is_none() && auto_install {
            tracing::info!(plugin = %plugin.name, binary = %spec.name, "Installing missing binary");
            found = gate.install(spec).await;
        }
        match found {
            Some(path) => {
                tracing::debug!(plugin = %plugin.name, binary = %spec.name, path = %path.display(), "Binary available");
            }
            None => missing.push(spec.name.clone()),
        }
    }
    missing
}

// ---------------------------------------------------------------------------
// EnvGate
// ---------------------------------------------------------------------------

/// Resolves binaries from the search path, like the `env` provider.
///
/// An `abspath` entry in a binary's overrides is checked instead of
/// searching. Installation is not supported.
#[derive(Debug, Clone, Default)]
pub struct EnvGate {
    search_paths: Vec<PathBuf>,
}

impl EnvGate {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Search the directories listed in `PATH`.
    pub fn from_env() -> Self {
        let search_paths = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self::new(search_paths)
    }

    fn resolve(&self, spec: &BinarySpec) -> Option<PathBuf> {
        if let Some(abspath) = spec.overrides.get("abspath").and_then(|v| v.as_str()) {
            let path = PathBuf::from(abspath);
            return is_executable(&path).then_some(path);
        }
        if !spec.providers().any(|p| p == DEFAULT_BINPROVIDER) {
            return None;
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(&spec.name))
            .find(|candidate| is_executable(candidate))
    }
}

impl DependencyGate for EnvGate {
    async fn load(&self, spec: &BinarySpec) -> Option<PathBuf> {
        self.resolve(spec)
    }

    async fn install(&self, spec: &BinarySpec) -> Option<PathBuf> {
        tracing::debug!(binary = %spec.name, "Search-path provider cannot install binaries");
        None
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn make_executable(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[tokio::test]
    async fn env_gate_finds_binaries_on_search_path() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let expected = make_executable(dir.path(), "ffmpeg", 0o755);
        make_executable(dir.path(), "not-exec", 0o644);
        let gate = EnvGate::new(vec![dir.path().to_path_buf()]);

        assert_eq!(gate.load(&BinarySpec::new("ffmpeg")).await, Some(expected));
        assert_eq!(gate.load(&BinarySpec::new("not-exec")).await, None);
        assert_eq!(gate.load(&BinarySpec::new("missing")).await, None);
    }

    #[tokio::test]
    async fn env_gate_honours_abspath_override() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = make_executable(dir.path(), "chrome-custom", 0o755);
        let gate = EnvGate::new(Vec::new());

        let mut spec = BinarySpec::new("chrome");
        spec.overrides = json!({ "abspath": path.to_string_lossy() });
        assert_eq!(gate.load(&spec).await, Some(path));
    }

    #[tokio::test]
    async fn env_gate_ignores_other_providers() {
        let dir = tempfile::tempdir().expect("create temp dir");
        make_executable(dir.path(), "yt-dlp", 0o755);
        let gate = EnvGate::new(vec![dir.path().to_path_buf()]);

        let mut spec = BinarySpec::new("yt-dlp");
        spec.binproviders = "pip,brew".into();
        assert_eq!(gate.load(&spec).await, None);
        spec.binproviders = "pip,env".into();
        assert!(gate.load(&spec).await.is_some());
    }

    /// Gate that knows a fixed set of binaries and can install one more.
    struct FakeGate {
        installed: Vec<&'static str>,
        installable: Vec<&'static str>,
        install_calls: AtomicUsize,
    }

    impl DependencyGate for FakeGate {
        async fn load(&self, spec: &BinarySpec) -> Option<PathBuf> {
            self.installed
                .contains(&spec.name.as_str())
                .then(|| PathBuf::from("/usr/bin").join(&spec.name))
        }

        async fn install(&self, spec: &BinarySpec) -> Option<PathBuf> {
            self.install_calls.fetch_add(1, Ordering::SeqCst);
            self.installable
                .contains(&spec.name.as_str())
                .then(|| PathBuf::from("/opt/lib").join(&spec.name))
        }
    }

    fn plugin() -> Plugin {
        Plugin::new("media")
            .with_binary(BinarySpec::new("ffmpeg"))
            .with_binary(BinarySpec::new("yt-dlp"))
            .with_binary(BinarySpec::new("aria2c"))
    }

    #[tokio::test]
    async fn reports_missing_without_auto_install() {
        let gate = FakeGate {
            installed: vec!["ffmpeg"],
            installable: vec!["yt-dlp"],
            install_calls: AtomicUsize::new(0),
        };
        let missing = check_plugin_dependencies(&gate, &plugin(), false).await;
        assert_eq!(missing, vec!["yt-dlp".to_string(), "aria2c".to_string()]);
        assert_eq!(gate.install_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_install_fills_what_it_can() {
        let gate = FakeGate {
            installed: vec!["ffmpeg"],
            installable: vec!["yt-dlp"],
            install_calls: AtomicUsize::new(0),
        };
        let missing = check_plugin_dependencies(&gate, &plugin(), true).await;
        assert_eq!(missing, vec!["aria2c".to_string()]);
        assert_eq!(gate.install_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plugin_without_binaries_is_satisfied() {
        let gate = EnvGate::new(Vec::new());
        assert!(check_plugin_dependencies(&gate, &Plugin::new("plain"), true).await.is_empty());
    }
}
