//! Backend process supervision.
//!
//! Each session gets a dedicated single-test server process:
//!
//! ```text
//! Starting --(readiness marker on stdout)--> Ready --(process exit)--> Exited
//!     |
//!     +--(exec failure / output closed / timeout)--> never registered
//! ```
//!
//! [`BackendSupervisor::spawn`] drives `Starting -> Ready` and returns only
//! once the backend accepts connections. [`BackendSupervisor::reap`] owns
//! the process from then on and removes the session when it exits.

mod output;

pub use output::{forward_output, wait_for_marker, MarkerScanner, OutputStream};

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::SpawnError;
use crate::metrics::Metrics;
use crate::session::{Session, SessionTable};

/// Placeholder replaced by the allocated port in backend arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Default readiness marker printed by `iperf3 -s`.
pub const DEFAULT_READINESS_MARKER: &str = "Server listening on";

/// Default time a backend gets to print its readiness marker.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for a backend that closed stdout to report its exit status.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// How backend processes are launched.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Program to execute.
    pub program: String,
    /// Argument template; [`PORT_PLACEHOLDER`] is substituted per session.
    pub args: Vec<String>,
    /// String whose appearance on stdout marks the backend ready.
    pub readiness_marker: String,
    pub readiness_timeout: Duration,
}

impl BackendConfig {
    /// Arguments for a backend bound to `port`.
    pub fn args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

impl Default for BackendConfig {
    /// A one-off iperf3 server: `iperf3 -s -1 -p {port}`.
    fn default() -> Self {
        Self {
            program: "iperf3".to_string(),
            args: ["-s", "-1", "-p", PORT_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            readiness_marker: DEFAULT_READINESS_MARKER.to_string(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

/// A backend process that has reached readiness.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    port: u16,
    pid: Option<u32>,
}

impl BackendProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Spawns, watches and reaps backend processes.
pub struct BackendSupervisor {
    config: BackendConfig,
    table: Arc<SessionTable>,
    metrics: Arc<Metrics>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig, table: Arc<SessionTable>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            table,
            metrics,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Start a backend on `port` and wait until it is ready.
    ///
    /// On failure the process (if any) is killed and nothing is counted.
    pub async fn spawn(&self, port: u16) -> Result<BackendProcess, SpawnError> {
        let args = self.config.args_for(port);
        info!(
            port = port,
            program = %self.config.program,
            args = ?args,
            "Spawning backend"
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Exec {
                program: self.config.program.clone(),
                source,
            })?;

        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, port, OutputStream::Stderr));
        }

        let Some(mut stdout) = child.stdout.take() else {
            terminate(&mut child).await;
            return Err(SpawnError::Output(std::io::Error::other(
                "backend stdout not captured",
            )));
        };

        let mut scanner = MarkerScanner::new(self.config.readiness_marker.as_bytes());
        let readiness = tokio::time::timeout(
            self.config.readiness_timeout,
            wait_for_marker(&mut stdout, &mut scanner),
        )
        .await;

        let failure = match readiness {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(SpawnError::OutputClosed {
                status: terminate(&mut child).await,
            }),
            Ok(Err(e)) => {
                terminate(&mut child).await;
                Some(SpawnError::Output(e))
            }
            Err(_) => {
                terminate(&mut child).await;
                Some(SpawnError::ReadinessTimeout(self.config.readiness_timeout))
            }
        };

        if let Some(e) = failure {
            warn!(port = port, pid = ?pid, error = %e, "Backend failed to start");
            return Err(e);
        }

        // Keep draining so the backend never blocks on (or dies from) its pipe.
        tokio::spawn(forward_output(stdout, port, OutputStream::Stdout));

        self.metrics.sessions_started.inc();
        self.metrics.sessions_active.inc();
        info!(port = port, pid = ?pid, "Backend ready");

        Ok(BackendProcess { child, port, pid })
    }

    /// Wait for the backend to exit, then remove its session.
    ///
    /// Abnormal exits are logged only. Relays still using the backend see
    /// the closed socket as ordinary EOF or I/O error.
    pub async fn reap(&self, session: Session, mut process: BackendProcess) {
        match process.child.wait().await {
            Ok(status) if status.success() => {
                info!(port = process.port, pid = ?process.pid, "Backend exited");
            }
            Ok(status) => {
                warn!(
                    port = process.port,
                    pid = ?process.pid,
                    exit_code = ?status.code(),
                    status = %status,
                    "Backend exited unexpectedly"
                );
            }
            Err(e) => {
                error!(port = process.port, pid = ?process.pid, error = %e, "Failed waiting for backend");
            }
        }

        if self.table.remove(&session).await {
            info!(port = session.port, token = %session.token, "Cleaning up session");
        } else {
            debug!(port = session.port, "Session already removed");
        }
        self.metrics.sessions_active.dec();
    }

    /// Run [`reap`](Self::reap) as a background task.
    pub fn launch_reaper(self: &Arc<Self>, session: Session, process: BackendProcess) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let span = tracing::info_span!("backend", port = session.port);
        tokio::spawn(async move { supervisor.reap(session, process).await }.instrument(span))
    }
}

/// Stop a backend that failed to become ready and collect its status.
async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if let Ok(Ok(status)) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        return Some(status);
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill backend");
    }
    child.wait().await.ok()
}
