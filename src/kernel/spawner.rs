//! Kernel process spawner.
//!
//! Spawns interpreter processes from a [`KernelSpec`] with:
//! - `kill_on_drop(true)` so a leaked handle never leaves an orphan kernel.
//! - `env_clear()` + an allowlist so the gateway's own secrets are not
//!   visible to user code.
//! - stdin/stdout piped for the message channel, stderr drained into the
//!   gateway's log at `DEBUG`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{InterruptMode, KernelSpec, BRIDGE_PLACEHOLDER};
use crate::kernel::channel::{BoxedReader, BoxedWriter};
use crate::{AppError, Result};

/// Python program implementing the kernel wire protocol on a bare `python3`.
pub const PYTHON_BRIDGE: &str = include_str!("../../assets/python_bridge.py");

/// Environment variables inherited by kernel processes.
///
/// Every other variable from the gateway's environment is stripped.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
    "TMPDIR",
    "PYTHONPATH",
    "PYTHONHOME",
    "VIRTUAL_ENV",
    "CONDA_PREFIX",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Handle to a running kernel process.
#[derive(Debug)]
pub struct KernelProcess {
    child: Child,
    pid: Option<u32>,
    stderr_task: Option<JoinHandle<()>>,
}

impl KernelProcess {
    /// Wrap an already spawned child.
    #[must_use]
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            stderr_task: None,
        }
    }

    /// OS process id, if the process has not been reaped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check.
    ///
    /// Returns a human-readable exit description once the process is gone.
    pub fn try_exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(describe_exit(status)),
            Ok(None) => None,
            Err(err) => Some(format!("wait error: {err}")),
        }
    }

    /// Deliver `SIGINT` to the kernel.
    ///
    /// # Errors
    ///
    /// [`AppError::Transport`] if the signal cannot be delivered or no pid is
    /// known.
    #[cfg(unix)]
    pub fn signal_interrupt(&self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self
            .pid
            .ok_or_else(|| AppError::Transport("kernel process has no pid".into()))?;
        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Transport(format!("kernel pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), Signal::SIGINT)
            .map_err(|err| AppError::Transport(format!("failed to signal kernel: {err}")))
    }

    /// Signals are unavailable on this platform.
    ///
    /// # Errors
    ///
    /// Always returns [`AppError::Transport`].
    #[cfg(not(unix))]
    pub fn signal_interrupt(&self) -> Result<()> {
        Err(AppError::Transport(
            "signal interrupts are not supported on this platform".into(),
        ))
    }

    /// Wait up to `grace` for the process to exit, then force-kill it.
    pub async fn terminate(&mut self, session_id: &str, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(session_id, status = %describe_exit(status), "kernel process exited");
            }
            Ok(Err(err)) => {
                warn!(session_id, %err, "error waiting for kernel process");
            }
            Err(_) => {
                warn!(
                    session_id,
                    "kernel process did not exit within grace period, forcing kill"
                );
                if let Err(err) = self.child.kill().await {
                    warn!(session_id, %err, "failed to force-kill kernel process");
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Everything the gateway needs to talk to a freshly started kernel.
pub struct KernelConnection {
    /// Kernel's output stream.
    pub reader: BoxedReader,
    /// Kernel's input stream.
    pub writer: BoxedWriter,
    /// OS process, when the kernel is a subprocess.
    pub process: Option<KernelProcess>,
    /// How to interrupt this kernel.
    pub interrupt_mode: InterruptMode,
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("process", &self.process)
            .field("interrupt_mode", &self.interrupt_mode)
            .finish_non_exhaustive()
    }
}

/// Expand `{bridge}` placeholders in a kernel spec's argv.
#[must_use]
pub fn resolve_argv(argv: &[String]) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            if arg.contains(BRIDGE_PLACEHOLDER) {
                arg.replace(BRIDGE_PLACEHOLDER, PYTHON_BRIDGE)
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Spawn a kernel process for `session_id` from `spec`.
///
/// The readiness wait is not done here; the session performs it on the
/// message channel so it can be bounded and treated as best effort.
///
/// # Errors
///
/// - `AppError::Config` if the spec's argv is empty.
/// - `AppError::Transport("failed to spawn kernel: …")` on OS spawn failure
///   or when stdio cannot be captured.
pub fn spawn_kernel(
    spec: &KernelSpec,
    kernel_name: &str,
    session_id: &str,
    working_dir: &Path,
) -> Result<KernelConnection> {
    let argv = resolve_argv(&spec.argv);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AppError::Config(format!("kernel spec '{kernel_name}' has empty argv")))?;

    let mut cmd = Command::new(program);
    cmd.args(args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&spec.env);
    cmd.env("KERNEL_SESSION_ID", session_id);

    cmd.current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Transport(format!("failed to spawn kernel: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Transport("failed to capture kernel stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Transport("failed to capture kernel stdout".into()))?;
    let stderr = child.stderr.take();

    let mut process = KernelProcess::new(child);
    process.stderr_task = stderr.map(|stream| drain_stderr(session_id.to_owned(), stream));

    info!(
        session_id,
        kernel_name,
        pid = ?process.pid(),
        program = %program,
        "kernel process spawned"
    );

    Ok(KernelConnection {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        process: Some(process),
        interrupt_mode: spec.interrupt_mode,
    })
}

/// Forward kernel stderr lines to the log until the stream closes.
fn drain_stderr(session_id: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(session_id, line = %line, "kernel stderr"),
                Ok(None) => break,
                Err(err) => {
                    debug!(session_id, %err, "kernel stderr closed with error");
                    break;
                }
            }
        }
    })
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    status.code().map_or_else(
        || "process terminated by signal".to_owned(),
        |c| format!("process exited with code {c}"),
    )
}
