//! External command hooks
//!
//! Hooks are operator-supplied programs run on lifecycle events. They run
//! detached from the caller, inherit the daemon's environment plus the event
//! variables, and are killed when the runner is cancelled.

use crate::error::{KubelanError, Result};
use crate::types::ServiceIdentity;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Overlay interface name (up, change)
pub const ENV_IFACE: &str = "IFACE";
/// `<namespace>/<name>` of the changed service (change)
pub const ENV_SERVICE: &str = "SERVICE";
/// Space-joined current peer addresses of the service (change)
pub const ENV_IPS: &str = "IPS";
/// `true` when the change only removed peers (change)
pub const ENV_DELETED: &str = "DELETED";

/// Environment for the interface-up hook
pub fn up_env(interface: &str) -> Vec<(String, String)> {
    vec![(ENV_IFACE.to_string(), interface.to_string())]
}

/// Environment for the membership change hook
pub fn change_env(
    interface: &str,
    service: &ServiceIdentity,
    peers: &[IpAddr],
    deleted: bool,
) -> Vec<(String, String)> {
    let ips = peers
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    vec![
        (ENV_IFACE.to_string(), interface.to_string()),
        (ENV_SERVICE.to_string(), service.to_string()),
        (ENV_IPS.to_string(), ips),
        (ENV_DELETED.to_string(), deleted.to_string()),
    ]
}

/// Runs hooks inside one cancellable scope.
///
/// Clones share the scope: cancelling any clone stops them all.
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `command` (program followed by arguments) without waiting for it.
    ///
    /// An empty command is a disabled hook and does nothing. Spawn failures
    /// and non-zero exits are logged, never returned. Must be called from
    /// within a Tokio runtime.
    pub fn fire(
        &self,
        hook: &'static str,
        command: &[String],
        env: Vec<(String, String)>,
    ) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(KubelanError::HookRunnerStopped);
        }

        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let program = program.clone();
        let token = self.token.clone();

        self.tracker.spawn(async move {
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(hook, program = %program, error = %e, "Failed to run hook");
                    return;
                }
            };
            debug!(hook, program = %program, pid = ?child.id(), "Hook started");

            let cancelled = tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            debug!(hook, program = %program, "Hook finished");
                        }
                        Ok(status) => {
                            warn!(
                                hook,
                                program = %program,
                                code = ?status.code(),
                                "Hook exited with failure"
                            );
                        }
                        Err(e) => {
                            warn!(hook, program = %program, error = %e, "Failed to wait for hook");
                        }
                    }
                    false
                }
                _ = token.cancelled() => true,
            };

            if cancelled {
                debug!(hook, program = %program, "Killing hook on shutdown");
                if let Err(e) = child.kill().await {
                    warn!(hook, program = %program, error = %e, "Failed to kill hook");
                }
            }
        });

        Ok(())
    }

    /// Cancel the scope. In-flight hooks are killed and later fires are rejected.
    pub fn cancel(&self) {
        self.token.cancel();
        self.tracker.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for every spawned hook to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
