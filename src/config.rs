//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Name of the kernel spec that is always available unless overridden.
pub const BUILTIN_KERNEL_NAME: &str = "python3";

/// Placeholder in a kernel spec's `argv` replaced by the embedded Python
/// bridge program.
pub const BRIDGE_PLACEHOLDER: &str = "{bridge}";

/// How a kernel is asked to abandon the code it is running.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// Deliver `SIGINT` to the kernel process (falls back to a message when
    /// no process id is available).
    #[default]
    Signal,
    /// Send an `interrupt_request` on the control channel.
    Message,
}

/// Recipe for starting one kind of kernel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct KernelSpec {
    /// Human-readable name shown in listings.
    #[serde(default)]
    pub display_name: String,
    /// Program and arguments. `{bridge}` expands to the embedded bridge.
    pub argv: Vec<String>,
    /// Extra environment variables passed to the kernel process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Interrupt delivery strategy.
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
}

impl KernelSpec {
    /// The built-in spec: a plain `python3` driven by the embedded bridge.
    #[must_use]
    pub fn builtin_python() -> Self {
        Self {
            display_name: "Python 3".into(),
            argv: vec![
                "python3".into(),
                "-u".into(),
                "-c".into(),
                BRIDGE_PLACEHOLDER.into(),
            ],
            env: HashMap::new(),
            interrupt_mode: InterruptMode::Signal,
        }
    }
}

/// Bounded waits applied to kernel operations (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Wait for the kernel's readiness signal; expiry still counts as ready.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Upper bound on one execute call.
    #[serde(default = "default_execute_seconds")]
    pub execute_seconds: u64,
    /// Time allowed for the kernel to reach idle after an interrupt.
    #[serde(default = "default_grace_seconds")]
    pub interrupt_grace_seconds: u64,
    /// Time allowed for the kernel process to exit before it is killed.
    #[serde(default = "default_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: default_startup_seconds(),
            execute_seconds: default_execute_seconds(),
            interrupt_grace_seconds: default_grace_seconds(),
            shutdown_grace_seconds: default_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Convert to the [`Duration`] form used by sessions.
    #[must_use]
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            startup: Duration::from_secs(self.startup_seconds),
            execute: Duration::from_secs(self.execute_seconds),
            interrupt_grace: Duration::from_secs(self.interrupt_grace_seconds),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
        }
    }
}

/// Kernel operation bounds in [`Duration`] form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Readiness wait.
    pub startup: Duration,
    /// Execute deadline.
    pub execute: Duration,
    /// Post-interrupt drain window.
    pub interrupt_grace: Duration,
    /// Process exit window on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        TimeoutConfig::default().session_timeouts()
    }
}

fn default_startup_seconds() -> u64 {
    10
}

fn default_execute_seconds() -> u64 {
    120
}

fn default_grace_seconds() -> u64 {
    5
}

fn default_http_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    8000
}

fn default_max_sessions() -> u32 {
    16
}

fn default_kernel() -> String {
    BUILTIN_KERNEL_NAME.into()
}

fn default_monitor_seconds() -> u64 {
    5
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the HTTP API binds to.
    #[serde(default = "default_http_host")]
    pub http_host: String,
    /// HTTP port for the API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Maximum number of live kernel sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    /// Kernel spec used when a request does not name one.
    #[serde(default = "default_kernel")]
    pub default_kernel: String,
    /// Directory kernels are started in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Interval between crash-detection polls.
    #[serde(default = "default_monitor_seconds")]
    pub monitor_poll_seconds: u64,
    /// Bounded waits for kernel operations.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Named kernel specs.
    #[serde(default)]
    pub kernels: HashMap<String, KernelSpec>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string, install the built-in kernel
    /// spec, and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Address string for the HTTP listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Crash-detection poll interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(AppError::Config(
                "max_sessions must be greater than zero".into(),
            ));
        }

        let timeouts = [
            ("startup_seconds", self.timeouts.startup_seconds),
            ("execute_seconds", self.timeouts.execute_seconds),
            ("interrupt_grace_seconds", self.timeouts.interrupt_grace_seconds),
            ("shutdown_grace_seconds", self.timeouts.shutdown_grace_seconds),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, seconds)| *seconds == 0) {
            return Err(AppError::Config(format!(
                "timeouts.{field} must be greater than zero"
            )));
        }

        if self.monitor_poll_seconds == 0 {
            return Err(AppError::Config(
                "monitor_poll_seconds must be greater than zero".into(),
            ));
        }

        self.kernels
            .entry(BUILTIN_KERNEL_NAME.to_owned())
            .or_insert_with(KernelSpec::builtin_python);

        for (name, spec) in &mut self.kernels {
            if spec.argv.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(AppError::Config(format!(
                    "kernel spec '{name}' must have a non-empty argv"
                )));
            }
            if spec.display_name.is_empty() {
                spec.display_name.clone_from(name);
            }
        }

        if !self.kernels.contains_key(&self.default_kernel) {
            return Err(AppError::Config(format!(
                "default_kernel '{}' is not a configured kernel spec",
                self.default_kernel
            )));
        }

        let canonical = self
            .working_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;
        self.working_dir = canonical;

        Ok(())
    }
}
