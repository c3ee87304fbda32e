//! Subprocess supervision for the external tool.
//!
//! Two execution shapes exist. [`run`] drives short-lived invocations
//! (connect, leave, quit, flag-mode intercept) to completion under a bounded
//! wait. [`StreamedRun`] spawns the long-lived `intercept run` process and
//! keeps it alive while the caller scans its stdout for the result payload.
//!
//! Waits are sliced: the child is polled with `wait_timeout` in short
//! increments and the cancellation token is checked between slices, so a
//! cancel terminates the wait promptly without relying on signals reaching
//! the child first.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::cancel::CancellationToken;
use crate::color::{log_info_stderr, log_warn_stderr};
use crate::constants;
use crate::errors::{Error, Result};

/// Ceiling applied to every short-lived tool invocation.
pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

const WAIT_SLICE: Duration = Duration::from_millis(100);
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves the external tool binary on PATH.
pub(crate) fn tool_path() -> Result<PathBuf> {
    which::which(constants::TOOL_NAME).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("'{}' not found on PATH", constants::TOOL_NAME),
        ))
    })
}

/// One short-lived tool invocation.
#[derive(Debug, Clone)]
pub(crate) struct RunRequest {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl RunRequest {
    pub(crate) fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Collected result of a short-lived invocation. `status` is `None` when the
/// wait was aborted by cancellation and the child was killed.
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub(crate) status: Option<ExitStatus>,
    pub(crate) stdout: Vec<String>,
    pub(crate) stderr: Vec<String>,
}

impl RunOutcome {
    pub(crate) fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub(crate) fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Runs the request to completion, collecting output line by line on reader
/// threads. Cancellation kills the child and returns cleanly with no status.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(program = ?request.program)))]
pub(crate) fn run(request: RunRequest, token: &CancellationToken) -> Result<RunOutcome> {
    let mut child = Command::new(&request.program)
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::Subprocess(format!(
                "failed to spawn {:?} with args {:?}: {e}",
                request.program, request.args
            ))
        })?;

    let stdout = collect_lines(child.stdout.take(), LogStream::Stdout);
    let stderr = collect_lines(child.stderr.take(), LogStream::Stderr);

    let deadline = token.linked_with_timeout(request.timeout);
    let status = loop {
        if deadline.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        match child.wait_timeout(WAIT_SLICE) {
            Ok(Some(status)) => break Some(status),
            Ok(None) => continue,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Subprocess(format!("failed to wait for process: {e}")));
            }
        }
    };

    Ok(RunOutcome {
        status,
        stdout: stdout.join_lines(),
        stderr: stderr.join_lines(),
    })
}

/// The long-lived `intercept run` process. It stays alive for the duration of
/// the intercept; stdout is streamed to the caller line by line, stderr is
/// collected and surfaced as warnings.
pub(crate) struct StreamedRun {
    child: Child,
    stdout_rx: mpsc::Receiver<String>,
    stderr: LineCollector,
}

impl StreamedRun {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(program = ?request.program)))]
    pub(crate) fn spawn(request: RunRequest) -> Result<Self> {
        let mut child = Command::new(&request.program)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Subprocess(format!(
                    "failed to spawn {:?} with args {:?}: {e}",
                    request.program, request.args
                ))
            })?;

        let (stdout_tx, stdout_rx) = mpsc::channel();
        if let Some(pipe) = child.stdout.take() {
            thread::spawn(move || {
                let reader = BufReader::new(pipe);
                for line in reader.lines().map_while(|l| l.ok()) {
                    if stdout_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        let stderr = collect_lines(child.stderr.take(), LogStream::Stderr);

        Ok(Self {
            child,
            stdout_rx,
            stderr,
        })
    }

    /// Blocks until a stdout line satisfies `predicate`, the child exits, or
    /// the token fires. Returns `None` on exit or cancellation.
    pub(crate) fn await_line<F>(&mut self, token: &CancellationToken, predicate: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        loop {
            if token.is_cancelled() {
                return None;
            }
            match self.stdout_rx.recv_timeout(WAIT_SLICE) {
                Ok(line) if predicate(&line) => return Some(line),
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Once the child has exited, the reader thread drains the
                    // remaining buffered output and hangs up; consume until it
                    // does instead of waiting for a line that cannot come.
                    if let Ok(Some(_)) = self.child.try_wait() {
                        while let Ok(line) = self.stdout_rx.recv_timeout(WAIT_SLICE) {
                            if predicate(&line) {
                                return Some(line);
                            }
                        }
                        return None;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub(crate) fn stderr_lines(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    /// Kills the child if it is still running. Its stderr has already been
    /// echoed line by line as it arrived.
    pub(crate) fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Drop for StreamedRun {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct LineCollector {
    lines: Arc<Mutex<Vec<String>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LineCollector {
    fn join_lines(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[derive(Clone, Copy)]
enum LogStream {
    Stdout,
    Stderr,
}

/// Drains a pipe on its own thread, echoing each non-empty line to the
/// crate's stderr logging as it arrives and keeping a copy for the caller.
fn collect_lines(
    pipe: Option<impl std::io::Read + Send + 'static>,
    stream: LogStream,
) -> LineCollector {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let handle = pipe.map(|pipe| {
        let sink = Arc::clone(&lines);
        thread::spawn(move || {
            let use_err = crate::color::color_enabled_stderr();
            let reader = BufReader::new(pipe);
            for line in reader.lines().map_while(|l| l.ok()) {
                if !line.trim().is_empty() {
                    match stream {
                        LogStream::Stdout => log_info_stderr(use_err, &line),
                        LogStream::Stderr => log_warn_stderr(use_err, &line),
                    }
                }
                if let Ok(mut sink) = sink.lock() {
                    sink.push(line);
                }
            }
        })
    });
    LineCollector { lines, handle }
}

/// Polls until `path` exists. Returns false on cancellation. The nominal
/// poll interval is sliced so cancellation is noticed promptly.
pub(crate) fn wait_for_file(path: &Path, token: &CancellationToken) -> bool {
    let slice = WAIT_SLICE;
    let slices_per_poll = (FILE_POLL_INTERVAL.as_millis() / slice.as_millis()).max(1);
    loop {
        if path.exists() {
            return true;
        }
        for _ in 0..slices_per_poll {
            if token.is_cancelled() {
                return false;
            }
            thread::sleep(slice);
            if path.exists() {
                return true;
            }
        }
    }
}

/// Waits until `path` can be opened and shared-locked, i.e. the writer has
/// released its exclusive lock. Returns on cancellation as well; the caller's
/// subsequent read will fail on its own terms if the file is still locked.
pub(crate) fn wait_for_readable_file(path: &Path, token: &CancellationToken) {
    loop {
        if token.is_cancelled() {
            return;
        }
        if let Ok(file) = std::fs::File::open(path) {
            if fs2::FileExt::try_lock_shared(&file).is_ok() {
                let _ = fs2::FileExt::unlock(&file);
                return;
            }
        }
        thread::sleep(LOCK_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_run_collects_stdout_and_stderr_lines() {
        let request = RunRequest::new("/bin/sh")
            .arg("-c")
            .arg("echo out1; echo out2; echo err1 >&2");
        let outcome = run(request, &CancellationToken::new()).expect("run");
        assert!(outcome.success());
        assert_eq!(outcome.stdout, vec!["out1", "out2"]);
        assert_eq!(outcome.stderr, vec!["err1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_timeout_kills_child_and_reports_no_status() {
        let request = RunRequest::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .timeout(Duration::from_millis(200));
        let outcome = run(request, &CancellationToken::new()).expect("run");
        assert!(outcome.status.is_none());
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_cancellation_aborts_the_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let request = RunRequest::new("/bin/sh").arg("-c").arg("sleep 30");
        let outcome = run(request, &token).expect("run");
        assert!(outcome.status.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_streamed_run_finds_matching_line() {
        let request = RunRequest::new("/bin/sh")
            .arg("-c")
            .arg("echo noise; echo '{\"environment\": {}}'; sleep 5");
        let mut streamed = StreamedRun::spawn(request).expect("spawn");
        let token = CancellationToken::new().linked_with_timeout(Duration::from_secs(10));
        let line = streamed.await_line(&token, |l| l.starts_with('{'));
        assert_eq!(line.as_deref(), Some("{\"environment\": {}}"));
        streamed.terminate();
    }

    #[cfg(unix)]
    #[test]
    fn test_streamed_run_returns_none_when_child_exits_without_match() {
        let request = RunRequest::new("/bin/sh").arg("-c").arg("echo noise");
        let mut streamed = StreamedRun::spawn(request).expect("spawn");
        let token = CancellationToken::new().linked_with_timeout(Duration::from_secs(10));
        assert!(streamed.await_line(&token, |l| l.starts_with('{')).is_none());
    }

    #[test]
    fn test_wait_for_file_returns_false_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!wait_for_file(Path::new("/nonexistent/never-appears"), &token));
    }

    #[test]
    fn test_wait_for_file_sees_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ready");
        std::fs::write(&path, "x").expect("write");
        assert!(wait_for_file(&path, &CancellationToken::new()));
    }

    #[test]
    fn test_wait_for_readable_file_passes_unlocked_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("result.json");
        std::fs::write(&path, "{}").expect("write");
        let token = CancellationToken::new().linked_with_timeout(Duration::from_secs(5));
        wait_for_readable_file(&path, &token);
        assert!(!token.is_cancelled(), "lock wait consumed the whole window");
    }
}
