//! Cluster connection management: the `connect` and `quit` surfaces.
//!
//! Connect and quit are best-effort by design. A failed connect is reported
//! on stderr and swallowed, because the subsequent intercept start is the
//! step with real error semantics: if the connection is genuinely down, start
//! fails loudly on its own. Propagating connect errors as well would fail
//! workflows where a daemon is already connected out of band.

use std::path::PathBuf;

use crate::cancel::CancellationToken;
use crate::color::{color_enabled_stderr, log_info_stderr, log_warn_stderr};
use crate::errors::Result;
use crate::spec::Connection;
use crate::supervisor::{self, RunRequest};

/// Tracks whether this process has connected the external tool's daemon to
/// the cluster, so repeated connect calls within one lifecycle are no-ops.
pub struct ClusterConnection {
    tool: PathBuf,
    connection: Connection,
    connected: bool,
}

impl ClusterConnection {
    pub fn new(connection: Connection) -> Result<Self> {
        Ok(Self {
            tool: supervisor::tool_path()?,
            connection,
            connected: false,
        })
    }

    pub(crate) fn with_tool(tool: PathBuf, connection: Connection) -> Self {
        Self {
            tool,
            connection,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connects the daemon to the cluster. Idempotent within this instance;
    /// failures are logged and swallowed.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn connect(&mut self, token: &CancellationToken) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let use_err = color_enabled_stderr();
        log_info_stderr(
            use_err,
            &format!(
                "connecting to context '{}', namespace '{}'",
                self.connection.context(),
                self.connection.namespace()
            ),
        );
        let request = RunRequest::new(&self.tool)
            .arg("connect")
            .args(self.connection.connect_args());
        match supervisor::run(request, token) {
            Ok(outcome) if outcome.success() => {
                self.connected = true;
            }
            Ok(outcome) => {
                log_warn_stderr(
                    use_err,
                    &format!("connect did not succeed: {}", outcome.stderr_text()),
                );
            }
            Err(e) => {
                log_warn_stderr(use_err, &format!("connect failed: {e}"));
            }
        }
        Ok(())
    }

    /// Quits the daemon without stopping background daemons.
    pub fn disconnect(&mut self, token: &CancellationToken) {
        self.quit(false, token);
    }

    /// Quits the daemon, optionally stopping the background daemons as well.
    /// Failures are logged and swallowed; the daemon may already be gone.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn quit(&mut self, stop_daemons: bool, token: &CancellationToken) {
        let use_err = color_enabled_stderr();
        let mut request = RunRequest::new(&self.tool).arg("quit");
        if stop_daemons {
            request = request.arg("--stop-daemons");
        }
        match supervisor::run(request, token) {
            Ok(outcome) if outcome.success() => {}
            Ok(outcome) => {
                log_warn_stderr(
                    use_err,
                    &format!("quit did not succeed: {}", outcome.stderr_text()),
                );
            }
            Err(e) => {
                log_warn_stderr(use_err, &format!("quit failed: {e}"));
            }
        }
        self.connected = false;
    }
}
