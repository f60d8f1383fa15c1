//! Shared subprocess plumbing for hook processes.
//!
//! [`spawn`] launches a hook command with a fully specified environment and
//! starts draining its stdout and stderr in background tasks, so a chatty
//! child never blocks on a full pipe regardless of when (or whether) the
//! caller waits on it. Both the foreground runner and the background
//! reconciler build on this.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use abx_core::config::HookEnv;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output beyond this limit is read and discarded so the child keeps
/// running.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How long to wait for the output pipes to close after the child exits.
///
/// A hook that forks a daemon may leave the pipes open indefinitely; output
/// captured up to this point is kept.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running hook process and its output capture.
pub struct SpawnedProcess {
    pub child: Child,
    pub output: OutputCapture,
}

/// Spawn `cmd` in `cwd` with exactly the variables in `env`.
///
/// The child is killed if its handle is dropped before it has been waited
/// on.
pub fn spawn(cmd: &[String], cwd: &Path, env: &HookEnv) -> io::Result<SpawnedProcess> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = OutputCapture::start(child.stdout.take(), child.stderr.take());
    Ok(SpawnedProcess { child, output })
}

// ---------------------------------------------------------------------------
// OutputCapture
// ---------------------------------------------------------------------------

/// Stdout/stderr being drained by background tasks.
pub struct OutputCapture {
    stdout: StreamCapture,
    stderr: StreamCapture,
}

struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn start<O, E>(stdout: Option<O>, stderr: Option<E>) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            stdout: StreamCapture::start(stdout),
            stderr: StreamCapture::start(stderr),
        }
    }

    /// Wait (bounded by [`OUTPUT_DRAIN_TIMEOUT`]) for both streams to reach
    /// EOF and return everything captured, lossily decoded as UTF-8.
    pub async fn collect(self) -> (String, String) {
        let stdout = self.stdout.finish(OUTPUT_DRAIN_TIMEOUT);
        let stderr = self.stderr.finish(OUTPUT_DRAIN_TIMEOUT);
        tokio::join!(stdout, stderr)
    }

    /// Stop draining and return whatever has been captured so far.
    pub fn abort(self) -> (String, String) {
        (self.stdout.take_now(), self.stderr.take_now())
    }
}

impl StreamCapture {
    fn start<R: AsyncRead + Unpin + Send + 'static>(handle: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            if let Some(h) = handle {
                read_stream(h, &sink).await;
            }
        });
        Self { buf, task }
    }

    async fn finish(mut self, limit: Duration) -> String {
        if tokio::time::timeout(limit, &mut self.task).await.is_err() {
            tracing::debug!("Output pipe still open after process exit, keeping partial output");
        }
        self.take_now()
    }

    fn take_now(self) -> String {
        self.task.abort();
        let bytes = match self.buf.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Read a stream to EOF into `sink`, keeping at most [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(mut handle: R, sink: &Mutex<Vec<u8>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let Ok(mut buf) = sink.lock() else { break };
                let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exit codes and signals
// ---------------------------------------------------------------------------

/// Convert an exit status to an exit code.
///
/// A process killed by signal `N` reports `-N`, matching how a POSIX shell
/// reports it, so it stays distinct from a normal non-zero exit.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => abx_core::records::INTERNAL_FAILURE_EXIT_CODE,
    }
}

/// Send `SIGTERM` to a child that has not been reaped yet.
///
/// Returns `Ok(false)` when the process has already exited.
pub fn terminate(child: &Child) -> io::Result<bool> {
    match child.id() {
        Some(pid) => terminate_pid(pid),
        None => Ok(false),
    }
}

/// Send `SIGTERM` to `pid`.
///
/// The caller must know the process has not been reaped, otherwise the pid
/// may belong to an unrelated process. Returns `Ok(false)` on `ESRCH`.
pub fn terminate_pid(pid: u32) -> io::Result<bool> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // Safety: `kill` has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
