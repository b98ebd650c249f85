//! Kernel launcher abstraction.
//!
//! The [`KernelLauncher`] trait separates "how a kernel is started" from the
//! session registry, so the registry can run against real subprocesses in
//! production and against in-memory kernels in tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::config::{GlobalConfig, KernelSpec};
use crate::kernel::spawner::{spawn_kernel, KernelConnection};
use crate::{AppError, Result};

/// Starts kernels by spec name.
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel for `session_id` from the spec called `kernel_name`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] if `kernel_name` is unknown, or
    /// [`AppError::Transport`] if the kernel cannot be started.
    fn launch<'a>(
        &'a self,
        kernel_name: &'a str,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<KernelConnection>> + Send + 'a>>;

    /// Whether a spec with this name exists.
    fn has_kernel(&self, kernel_name: &str) -> bool;
}

/// Launcher that spawns kernel subprocesses from configured specs.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    specs: HashMap<String, KernelSpec>,
    working_dir: PathBuf,
}

impl ProcessLauncher {
    /// Create a launcher over an explicit spec table.
    #[must_use]
    pub fn new(specs: HashMap<String, KernelSpec>, working_dir: PathBuf) -> Self {
        Self { specs, working_dir }
    }

    /// Create a launcher from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.kernels.clone(), config.working_dir.clone())
    }
}

impl KernelLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        kernel_name: &'a str,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<KernelConnection>> + Send + 'a>> {
        Box::pin(async move {
            let spec = self.specs.get(kernel_name).ok_or_else(|| {
                AppError::Validation(format!("unknown kernel spec '{kernel_name}'"))
            })?;
            spawn_kernel(spec, kernel_name, session_id, &self.working_dir)
        })
    }

    fn has_kernel(&self, kernel_name: &str) -> bool {
        self.specs.contains_key(kernel_name)
    }
}
