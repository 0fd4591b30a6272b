//! Supervision of the two engine roles of one protocol instance.
//!
//! Both roles are started back to back and each is watched by its own
//! supervisor task. The supervisors and a watchdog share one cancellation
//! token: the watchdog cancels it when the timeout elapses, and the role 0
//! supervisor cancels it when role 0 fails, since role 1 can then never
//! finish its rendezvous. A cancelled supervisor kills its process and
//! waits a short grace period for the remaining output.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use harness_core::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

/// Time a killed process has to release its output pipes.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Why a trial produced no metrics.
#[derive(Debug, thiserror::Error)]
pub enum TrialFailure {
    #[error("protocol did not finish within {0:?}")]
    Timeout(Duration),
    #[error("{role} failed with exit code {exit_code:?}: {stderr}")]
    Process {
        role: Role,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("report could not be parsed: {0}")]
    Parse(#[from] harness_core::report::ReportError),
}

impl TrialFailure {
    /// Short name used in logs and the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            TrialFailure::Timeout(_) => "timeout",
            TrialFailure::Process { .. } => "process-error",
            TrialFailure::Parse(_) => "parse-error",
        }
    }
}

/// Command line for one role and the host it runs on.
#[derive(Debug, Clone)]
pub struct RoleCommand {
    pub role: Role,
    pub transport: Arc<dyn Transport>,
    pub command: String,
}

/// Everything one role left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was terminated by a signal or its status could
    /// not be collected.
    pub exit_code: Option<i32>,
    /// Whether the supervisor killed the process.
    pub killed: bool,
}

impl RoleOutput {
    pub fn success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }
}

/// Output of both roles of one protocol instance.
#[derive(Debug, Clone)]
pub struct DriverOutput {
    pub server: RoleOutput,
    pub client: RoleOutput,
    /// Wall time from starting role 0 until both roles were collected.
    pub elapsed: Duration,
    pub timed_out: bool,
    timeout: Duration,
}

impl DriverOutput {
    pub fn role(&self, role: Role) -> &RoleOutput {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }

    /// Returns the report printed by role 0.
    ///
    /// A failure of role 1 alone is tolerated, the report decides.
    pub fn report(&self) -> Result<&str, TrialFailure> {
        let server = &self.server;
        if server.killed && self.timed_out {
            return Err(TrialFailure::Timeout(self.timeout));
        }
        if !server.success() {
            return Err(TrialFailure::Process {
                role: Role::Server,
                exit_code: server.exit_code,
                stderr: server.stderr.clone(),
            });
        }
        if !self.client.success() {
            warn!(
                exit_code = ?self.client.exit_code,
                killed = self.client.killed,
                stderr = %self.client.stderr.trim(),
                "{} failed, using report of {}",
                Role::Client,
                Role::Server
            );
        }

        Ok(&server.stdout)
    }
}

/// Runs both roles of a protocol instance under one timeout.
#[derive(Debug, Clone)]
pub struct ProtocolDriver {
    timeout: Duration,
}

impl ProtocolDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs both roles until they exit or the timeout elapses.
    ///
    /// Only a failure to start a process is an error. Everything that
    /// happens afterwards is reported in the returned output.
    pub async fn run(
        &self,
        server: &RoleCommand,
        client: &RoleCommand,
    ) -> Result<DriverOutput, TransportError> {
        let start = Instant::now();
        let server_handle = start_role(server)?;
        let client_handle = match start_role(client) {
            Ok(handle) => handle,
            Err(e) => {
                _ = server_handle.kill();
                return Err(e);
            }
        };
        debug!(skew = ?start.elapsed(), "started both roles");

        let token = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn({
            let token = token.clone();
            let timed_out = timed_out.clone();
            let timeout = self.timeout;
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            }
        });

        let (server_output, client_output) = tokio::join!(
            supervise(Role::Server, server_handle, token.clone(), KILL_GRACE),
            supervise(Role::Client, client_handle, token.clone(), KILL_GRACE),
        );
        let elapsed = start.elapsed();

        token.cancel();
        _ = watchdog.await;

        let timed_out = timed_out.load(Ordering::SeqCst);
        if timed_out {
            warn!(timeout = ?self.timeout, "protocol timed out");
        }

        Ok(DriverOutput {
            server: server_output,
            client: client_output,
            elapsed,
            timed_out,
            timeout: self.timeout,
        })
    }
}

fn start_role(cmd: &RoleCommand) -> Result<Arc<duct::Handle>, TransportError> {
    debug!(role = %cmd.role, host = cmd.transport.host(), command = %cmd.command, "starting");

    cmd.transport
        .expression(&cmd.command)
        .stdin_null()
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .start()
        .map(Arc::new)
        .map_err(|source| TransportError::Spawn {
            host: cmd.transport.host().to_string(),
            command: cmd.command.clone(),
            source,
        })
}

async fn supervise(
    role: Role,
    handle: Arc<duct::Handle>,
    token: CancellationToken,
    kill_grace: Duration,
) -> RoleOutput {
    let mut waiter = tokio::task::spawn_blocking({
        let handle = handle.clone();
        move || handle.wait().cloned()
    });

    let (result, killed) = tokio::select! {
        result = &mut waiter => (result, false),
        _ = token.cancelled() => {
            debug!(%role, "killing");
            _ = tokio::task::spawn_blocking({
                let handle = handle.clone();
                move || handle.kill()
            });
            match tokio::time::timeout(kill_grace, &mut waiter).await {
                Ok(result) => (result, true),
                Err(_) => {
                    warn!(%role, "process did not release its output after being killed");
                    return RoleOutput {
                        killed: true,
                        ..Default::default()
                    };
                }
            }
        }
    };

    let output = match result {
        Ok(Ok(output)) => RoleOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            killed,
        },
        Ok(Err(e)) => {
            warn!(%role, error = %e, "failed to collect process status");
            RoleOutput {
                killed,
                ..Default::default()
            }
        }
        Err(e) => {
            warn!(%role, error = %e, "process waiter panicked");
            RoleOutput {
                killed,
                ..Default::default()
            }
        }
    };

    debug!(%role, exit_code = ?output.exit_code, killed, "collected");

    if role.is_authoritative() && !killed && !output.success() {
        token.cancel();
    }

    output
}
