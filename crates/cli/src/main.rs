//! `abx-dl` -- archive a single URL with a set of plugin hooks.
//!
//! ```text
//! abx-dl <url> <plugins.json>
//! ```
//!
//! Results are written to `<output dir>/index.jsonl`, one record per line.
//! Ctrl-C stops after the running hook; background hooks are still
//! terminated and recorded before exit.
//! When stdout is not a terminal the same records are echoed there; logs
//! always go to stderr.
//!
//! # Environment variables
//!
//! | Variable           | Required | Default | Description                                   |
//! |--------------------|----------|---------|-----------------------------------------------|
//! | `ABX_OUTPUT_DIR`   | no       | `.`     | Directory receiving `index.jsonl` and plugin output |
//! | `ABX_PLUGINS`      | no       | all     | Comma-separated plugin names to run           |
//! | `ABX_AUTO_INSTALL` | no       | `true`  | Install missing binaries instead of skipping  |
//! | `LIB_DIR`          | no       | `$HOME/.config/abx/lib` | Shared library directory for hooks |
//! | `TIMEOUT`          | no       | `60`    | Default per-hook timeout in seconds           |

mod manifest;

use std::collections::BTreeMap;
use std::path::PathBuf;

use abx_core::config::LibPaths;
use abx_core::records::ArchiveStatus;
use abx_pipeline::{download, DownloadOptions, EnvGate, SkipReason};
use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abx_dl=info,abx_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(url), Some(manifest_path)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: abx-dl <url> <plugins.json>");
    };

    let output_dir = std::env::var_os("ABX_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let selected_plugins = std::env::var("ABX_PLUGINS").ok().map(|raw| parse_plugin_list(&raw));
    let auto_install = std::env::var("ABX_AUTO_INSTALL")
        .map(|v| parse_flag(&v))
        .unwrap_or(true);

    let plugins = manifest::load(&PathBuf::from(&manifest_path))?;

    tracing::info!(
        url = %url,
        output_dir = %output_dir.display(),
        plugins = plugins.len(),
        auto_install,
        "Starting abx-dl",
    );

    let options = DownloadOptions {
        selected_plugins,
        config_overrides: BTreeMap::new(),
        auto_install,
        lib_paths: LibPaths::from_env(),
        ..DownloadOptions::default()
    };

    let mut run = download(&url, plugins, &output_dir, options, EnvGate::from_env())
        .await
        .context("Failed to start download")?;

    let mut tally: BTreeMap<ArchiveStatus, usize> = BTreeMap::new();
    let mut interrupted = false;
    loop {
        let next = tokio::select! {
            next = run.next() => next,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping background hooks");
                interrupted = true;
                break;
            }
        };
        let Some(result) = next else {
            break;
        };
        tracing::info!(
            plugin = %result.plugin,
            hook = %result.hook_name,
            status = %result.status,
            "Hook result",
        );
        if result.status.is_terminal() {
            *tally.entry(result.status).or_default() += 1;
        }
    }

    let report = if interrupted { run.close().await } else { run.finish().await }.context("Download failed")?;
    for result in &report.reconciled {
        *tally.entry(result.status).or_default() += 1;
    }

    for skipped in &report.skipped_plugins {
        let detail = match &skipped.reason {
            SkipReason::MissingBinaries(missing) => format!("missing {}", missing.join(", ")),
            SkipReason::Invalid(reason) => reason.clone(),
        };
        eprintln!("skipped plugin {}: {detail}", skipped.name);
    }

    let summary: Vec<String> = tally
        .iter()
        .map(|(status, count)| format!("{count} {status}"))
        .collect();
    eprintln!(
        "Snapshot {} done: {}",
        report.snapshot.id,
        if summary.is_empty() { "no hooks ran".to_string() } else { summary.join(", ") }
    );
    Ok(())
}

fn parse_plugin_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
