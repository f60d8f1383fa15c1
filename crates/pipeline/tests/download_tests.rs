//! End-to-end tests for [`download`] driving real bash hooks.
//!
//! Each test writes small hook scripts into a temp directory, runs a full
//! download into another temp directory, and checks both the yielded
//! results and the `index.jsonl` that was written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use abx_core::config::{HookEnv, LibPaths};
use abx_core::plugin::{BinarySpec, Hook, HookPhase, Plugin};
use abx_core::records::{ArchiveResult, ArchiveStatus, INTERNAL_FAILURE_EXIT_CODE};
use abx_events::{read_all, IndexRecord, INDEX_FILE_NAME};
use abx_pipeline::{download, DownloadOptions, EnvGate, SkipReason};
use assert_matches::assert_matches;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    scripts: tempfile::TempDir,
    output: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            scripts: tempfile::tempdir().expect("scripts dir"),
            output: tempfile::tempdir().expect("output dir"),
        }
    }

    fn out(&self) -> &Path {
        self.output.path()
    }

    fn hook(&self, name: &str, phase: HookPhase, sort_key: i32, body: &str) -> Hook {
        self.write_hook(name, phase, sort_key, body, false)
    }

    fn background_hook(&self, name: &str, sort_key: i32, body: &str) -> Hook {
        self.write_hook(name, HookPhase::Snapshot, sort_key, body, true)
    }

    fn write_hook(&self, name: &str, phase: HookPhase, sort_key: i32, body: &str, background: bool) -> Hook {
        let path: PathBuf = self.scripts.path().join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).expect("write hook script");
        Hook {
            plugin_name: String::new(),
            name: name.to_string(),
            language: "sh".to_string(),
            path,
            is_background: background,
            sort_key,
            phase,
        }
    }

    fn records(&self) -> Vec<IndexRecord> {
        read_all(self.out().join(INDEX_FILE_NAME)).expect("read event log")
    }
}

fn options() -> DownloadOptions {
    let mut base_env = HookEnv::new();
    base_env.insert("PATH".into(), "/usr/bin:/bin".into());
    DownloadOptions {
        selected_plugins: None,
        config_overrides: BTreeMap::new(),
        auto_install: false,
        lib_paths: LibPaths::new("/tmp/abx-test-lib"),
        base_env,
        echo: Some(false),
        termination_grace: Duration::from_secs(2),
    }
}

async fn run_all(url: &str, plugins: Vec<Plugin>, out: &Path, options: DownloadOptions) -> (Vec<ArchiveResult>, abx_pipeline::DownloadReport) {
    let mut download = download(url, plugins, out, options, EnvGate::new(Vec::new()))
        .await
        .expect("start download");
    let mut results = Vec::new();
    while let Some(result) = download.next().await {
        results.push(result);
    }
    let report = download.finish().await.expect("download completes");
    (results, report)
}

fn kinds(records: &[IndexRecord]) -> Vec<&'static str> {
    records.iter().map(IndexRecord::kind).collect()
}

// ---------------------------------------------------------------------------
// Test: event log layout
// ---------------------------------------------------------------------------

/// Two plugins with one file-producing hook each log a snapshot followed by
/// a process and result per hook.
#[tokio::test]
async fn two_plugins_log_snapshot_then_process_result_pairs() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("wget").with_hook(fx.hook("save_html", HookPhase::Snapshot, 10, "echo '<html/>' > index.html")),
        Plugin::new("title").with_hook(fx.hook("save_title", HookPhase::Snapshot, 20, "echo Example > title.txt")),
    ];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ArchiveStatus::Succeeded));
    assert_eq!(results[0].output_files, vec!["index.html".to_string()]);
    assert!(fx.out().join("wget/index.html").is_file());
    assert!(fx.out().join("title/title.txt").is_file());

    let records = fx.records();
    assert_eq!(
        kinds(&records),
        vec!["Snapshot", "Process", "ArchiveResult", "Process", "ArchiveResult"]
    );
    assert_matches!(&records[0], IndexRecord::Snapshot(s) if s.id == report.snapshot.id && s.url == "https://example.com");
}

/// Every result references the run snapshot and one result is produced per
/// attempted hook.
#[tokio::test]
async fn every_result_references_the_snapshot() {
    let fx = Fixture::new();
    let plugins = vec![Plugin::new("mixed")
        .with_hook(fx.hook("ok", HookPhase::Snapshot, 1, "touch a.txt"))
        .with_hook(fx.hook("noop", HookPhase::Snapshot, 2, "true"))
        .with_hook(fx.hook("bad", HookPhase::Snapshot, 3, "exit 7"))];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.snapshot_id == report.snapshot.id));
    let statuses: Vec<ArchiveStatus> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ArchiveStatus::Succeeded, ArchiveStatus::Skipped, ArchiveStatus::Failed]
    );
}

// ---------------------------------------------------------------------------
// Test: ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crawl_hooks_run_before_snapshot_hooks() {
    let fx = Fixture::new();
    let trace = fx.scripts.path().join("trace.log");
    let append = |label: &str| format!("echo {label} >> '{}'", trace.display());

    let plugins = vec![
        Plugin::new("early")
            .with_hook(fx.hook("early_snapshot", HookPhase::Snapshot, 1, &append("early_snapshot")))
            .with_hook(fx.hook("early_crawl", HookPhase::Crawl, 99, &append("early_crawl"))),
        Plugin::new("late").with_hook(fx.hook("late_crawl", HookPhase::Crawl, 50, &append("late_crawl"))),
    ];

    let (results, _) = run_all("https://example.com", plugins, fx.out(), options()).await;
    let names: Vec<&str> = results.iter().map(|r| r.hook_name.as_str()).collect();
    assert_eq!(names, vec!["late_crawl", "early_crawl", "early_snapshot"]);

    let executed = std::fs::read_to_string(&trace).expect("trace log");
    assert_eq!(executed.lines().collect::<Vec<_>>(), names);
}

// ---------------------------------------------------------------------------
// Test: timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plugin_timeout_fails_the_hook() {
    let fx = Fixture::new();
    let plugins = vec![Plugin::new("slow").with_hook(fx.hook("sleeper", HookPhase::Snapshot, 1, "sleep 30"))];
    let mut opts = options();
    opts.base_env.insert("SLOW_TIMEOUT".into(), "1".into());
    opts.base_env.insert("TIMEOUT".into(), "120".into());

    let (results, _) = run_all("https://example.com", plugins, fx.out(), opts).await;
    assert_eq!(results[0].status, ArchiveStatus::Failed);
    assert_eq!(results[0].error.as_deref(), Some("Timed out after 1s"));

    let process = fx
        .records()
        .into_iter()
        .find_map(|r| match r {
            IndexRecord::Process(p) => Some(p),
            _ => None,
        })
        .expect("process record");
    assert_eq!(process.exit_code, Some(INTERNAL_FAILURE_EXIT_CODE));
    assert_eq!(process.timeout, 1);
}

// ---------------------------------------------------------------------------
// Test: configuration propagation
// ---------------------------------------------------------------------------

/// A `Binary` directive from one hook is visible to every later hook.
#[tokio::test]
async fn binary_directive_reaches_later_hooks() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("ffmpeg").with_hook(fx.hook(
            "locate",
            HookPhase::Crawl,
            0,
            r#"echo '{"type":"Binary","name":"ffmpeg","abspath":"/opt/bin/ffmpeg"}'"#,
        )),
        Plugin::new("media").with_hook(fx.hook(
            "use",
            HookPhase::Snapshot,
            10,
            r#"echo "$FFMPEG_BINARY" > seen.txt"#,
        )),
    ];

    run_all("https://example.com", plugins, fx.out(), options()).await;
    let seen = std::fs::read_to_string(fx.out().join("media/seen.txt")).expect("seen.txt");
    assert_eq!(seen.trim(), "/opt/bin/ffmpeg");
}

#[tokio::test]
async fn overrides_and_machine_updates_reach_hooks() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("setup").with_hook(fx.hook(
            "configure",
            HookPhase::Crawl,
            0,
            r#"echo '{"type":"Machine","_method":"update","key":"config/USER_AGENT","value":"abx/1.0"}'"#,
        )),
        Plugin::new("fetch")
            .with_config_default("RESOLUTION", serde_json::json!("1440,2000"))
            .with_hook(fx.hook(
                "env",
                HookPhase::Snapshot,
                0,
                r#"echo "$USER_AGENT|$RESOLUTION|$CHECK_SSL|$LIB_DIR" > env.txt"#,
            )),
    ];
    let mut opts = options();
    opts.config_overrides.insert("check_ssl".into(), serde_json::json!(false));

    run_all("https://example.com", plugins, fx.out(), opts).await;
    let seen = std::fs::read_to_string(fx.out().join("fetch/env.txt")).expect("env.txt");
    assert_eq!(seen.trim(), "abx/1.0|1440,2000|false|/tmp/abx-test-lib");
}

// ---------------------------------------------------------------------------
// Test: background hooks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fast_crashing_background_hook_is_plain_failure() {
    let fx = Fixture::new();
    let plugins = vec![Plugin::new("bg").with_hook(fx.background_hook("crash", 0, "echo boom >&2; exit 1"))];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ArchiveStatus::Failed);
    assert_eq!(results[0].error.as_deref(), Some("boom\n"));
    assert!(report.reconciled.is_empty());
    assert_eq!(kinds(&fx.records()), vec!["Snapshot", "Process", "ArchiveResult"]);
}

/// A background hook still running when iteration ends is terminated and
/// logged once with a terminal status, after the foreground hooks.
#[tokio::test]
async fn running_background_hook_is_reconciled_at_shutdown() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("recorder").with_hook(fx.background_hook(
            "capture",
            0,
            "trap 'echo done > capture.txt; exit 0' TERM\nwhile true; do sleep 0.1; done",
        )),
        Plugin::new("wget").with_hook(fx.hook("save", HookPhase::Snapshot, 10, "touch page.html")),
    ];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, ArchiveStatus::Started);
    assert_eq!(results[1].status, ArchiveStatus::Succeeded);

    assert_eq!(report.reconciled.len(), 1);
    let finalized = &report.reconciled[0];
    assert_eq!(finalized.id, results[0].id);
    assert_eq!(finalized.status, ArchiveStatus::Succeeded);
    assert_eq!(finalized.output_files, vec!["capture.txt".to_string()]);

    let records = fx.records();
    assert_eq!(
        kinds(&records),
        vec!["Snapshot", "Process", "ArchiveResult", "Process", "ArchiveResult"]
    );
    let capture_results: Vec<ArchiveStatus> = records
        .iter()
        .filter_map(IndexRecord::as_archive_result)
        .filter(|r| r.hook_name == "capture")
        .map(|r| r.status)
        .collect();
    assert_eq!(capture_results, vec![ArchiveStatus::Succeeded]);
}

#[tokio::test]
async fn background_hook_ignoring_sigterm_is_killed() {
    let fx = Fixture::new();
    let plugins = vec![Plugin::new("stubborn").with_hook(fx.background_hook(
        "ignore",
        0,
        "trap '' TERM\nwhile true; do sleep 0.1; done",
    ))];
    let mut opts = options();
    opts.termination_grace = Duration::from_millis(500);

    let (_, report) = run_all("https://example.com", plugins, fx.out(), opts).await;
    assert_eq!(report.reconciled[0].status, ArchiveStatus::Failed);
    assert_eq!(
        report.reconciled[0].error.as_deref(),
        Some("Background hook did not exit after SIGTERM")
    );
}

/// Background hooks never feed shared configuration, even when they print
/// directives before being tracked.
#[tokio::test]
async fn background_directives_do_not_reach_later_hooks() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("locator").with_hook(fx.background_hook(
            "announce",
            0,
            r#"echo '{"type":"Binary","name":"ffmpeg","abspath":"/bg/ffmpeg"}'
exec sleep 30"#,
        )),
        Plugin::new("media").with_hook(fx.hook(
            "use",
            HookPhase::Snapshot,
            10,
            r#"echo "${FFMPEG_BINARY:-unset}" > seen.txt"#,
        )),
    ];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;
    assert_eq!(results[0].status, ArchiveStatus::Started);
    assert_eq!(report.reconciled.len(), 1);

    let seen = std::fs::read_to_string(fx.out().join("media/seen.txt")).expect("seen.txt");
    assert_eq!(seen.trim(), "unset");
}

// ---------------------------------------------------------------------------
// Test: stopping early
// ---------------------------------------------------------------------------

/// `close` returns only after background hooks are logged, so the records
/// survive the runtime shutting down right after.
#[test]
fn close_reconciles_before_runtime_shutdown() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("bg").with_hook(fx.background_hook("daemon", 0, "exec sleep 30")),
        Plugin::new("never").with_hook(fx.hook("skipped", HookPhase::Snapshot, 10, "touch never.txt")),
    ];

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let report = runtime.block_on(async {
        let mut download = download("https://example.com", plugins, fx.out(), options(), EnvGate::new(Vec::new()))
            .await
            .expect("start download");
        let first = download.next().await.expect("first result");
        assert_eq!(first.status, ArchiveStatus::Started);
        download.close().await.expect("close download")
    });
    drop(runtime);

    assert_eq!(report.reconciled.len(), 1);
    assert!(!fx.out().join("never/never.txt").exists());

    let records = fx.records();
    assert_eq!(kinds(&records), vec!["Snapshot", "Process", "ArchiveResult"]);
    assert_matches!(&records[1], IndexRecord::Process(p) if p.exit_code.is_some());
    let daemon = records[2].as_archive_result().expect("archive result");
    assert_eq!(daemon.hook_name, "daemon");
    assert!(daemon.status.is_terminal());
}

/// Hooks only start when their result is asked for.
#[tokio::test]
async fn unrequested_hooks_never_start() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("first").with_hook(fx.hook("one", HookPhase::Snapshot, 0, "touch one.txt")),
        Plugin::new("second").with_hook(fx.hook("two", HookPhase::Snapshot, 10, "touch two.txt")),
    ];

    let mut download = download("https://example.com", plugins, fx.out(), options(), EnvGate::new(Vec::new()))
        .await
        .expect("start download");
    let first = download.next().await.expect("first result");
    assert_eq!(first.hook_name, "one");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!fx.out().join("second/two.txt").exists());

    let report = download.close().await.expect("close download");
    assert!(report.reconciled.is_empty());
    assert!(!fx.out().join("second/two.txt").exists());
    assert_eq!(kinds(&fx.records()), vec!["Snapshot", "Process", "ArchiveResult"]);
}

/// Dropping the handle signals background hooks; the control task still
/// logs them while the runtime is alive.
#[tokio::test]
async fn dropped_download_still_reconciles() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("bg").with_hook(fx.background_hook("daemon", 0, "exec sleep 30")),
        Plugin::new("never").with_hook(fx.hook("skipped", HookPhase::Snapshot, 10, "touch never.txt")),
    ];

    let mut download = download("https://example.com", plugins, fx.out(), options(), EnvGate::new(Vec::new()))
        .await
        .expect("start download");
    let first = download.next().await.expect("first result");
    assert_eq!(first.status, ArchiveStatus::Started);
    let log_path = fx.out().join(INDEX_FILE_NAME);
    drop(download);

    let mut finalized = None;
    for _ in 0..100 {
        finalized = read_all(&log_path)
            .expect("read event log")
            .into_iter()
            .filter_map(|r| r.as_archive_result().cloned())
            .find(|r| r.hook_name == "daemon");
        if finalized.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let finalized = finalized.expect("background hook reconciled");
    assert!(finalized.status.is_terminal());
    assert!(!fx.out().join("never/never.txt").exists());
}

// ---------------------------------------------------------------------------
// Test: plugin filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_binaries_skip_the_plugin() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("needs-tool")
            .with_binary(BinarySpec::new("definitely-not-installed-abx"))
            .with_hook(fx.hook("never", HookPhase::Snapshot, 0, "touch x")),
        Plugin::new("plain").with_hook(fx.hook("runs", HookPhase::Snapshot, 0, "touch y")),
    ];

    let (results, report) = run_all("https://example.com", plugins, fx.out(), options()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].plugin, "plain");
    assert_eq!(report.skipped_plugins.len(), 1);
    assert_eq!(report.skipped_plugins[0].name, "needs-tool");
    assert_matches!(&report.skipped_plugins[0].reason, SkipReason::MissingBinaries(m) if m == &vec!["definitely-not-installed-abx".to_string()]);
}

#[tokio::test]
async fn selection_limits_plugins() {
    let fx = Fixture::new();
    let plugins = vec![
        Plugin::new("Wget").with_hook(fx.hook("a", HookPhase::Snapshot, 0, "touch a")),
        Plugin::new("git").with_hook(fx.hook("b", HookPhase::Snapshot, 0, "touch b")),
    ];
    let mut opts = options();
    opts.selected_plugins = Some(vec!["wget".into()]);

    let (results, _) = run_all("https://example.com", plugins, fx.out(), opts).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].plugin, "Wget");
    assert!(!fx.out().join("git").exists());
}

#[tokio::test]
async fn unsupported_language_is_reported_and_run_continues() {
    let fx = Fixture::new();
    let mut ruby = fx.hook("ruby", HookPhase::Snapshot, 0, "");
    ruby.language = "rb".into();
    let plugins = vec![Plugin::new("mixed")
        .with_hook(ruby)
        .with_hook(fx.hook("after", HookPhase::Snapshot, 1, "touch after.txt"))];

    let (results, _) = run_all("https://example.com", plugins, fx.out(), options()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, ArchiveStatus::Failed);
    assert_eq!(results[1].status, ArchiveStatus::Succeeded);
}

/// Results carry the plugin's name even when hooks were attached without
/// going through `with_hook`.
#[tokio::test]
async fn hooks_are_bound_to_their_plugin() {
    let fx = Fixture::new();
    let plugin = Plugin {
        name: "literal".into(),
        hooks: vec![fx.hook("save", HookPhase::Snapshot, 0, "touch saved.txt")],
        ..Plugin::default()
    };
    assert!(plugin.hooks[0].plugin_name.is_empty());

    let (results, _) = run_all("https://example.com", vec![plugin], fx.out(), options()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].plugin, "literal");
    assert!(fx.out().join("literal/saved.txt").is_file());

    let logged = fx
        .records()
        .iter()
        .filter_map(IndexRecord::as_archive_result)
        .map(|r| r.plugin.clone())
        .collect::<Vec<_>>();
    assert_eq!(logged, vec!["literal".to_string()]);
}
