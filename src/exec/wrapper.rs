//! Wrapper programs
//!
//! A command is never executed directly: it is handed to a wrapper that
//! applies the resource limits, executes it, and writes a status file
//! describing how it terminated. Two wrappers exist, the embedded shell
//! script and the native `run-process` binary. `WrapperContext::prepare`
//! sets both up once at startup; the context is then shared by every runner.

use crate::config::limits::WrapperMode;
use crate::config::loader::BuilderConfig;
use crate::config::types::{Result, SandboxError};
use crate::observability::audit;
use log::{debug, info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RUN_PROCESS_SCRIPT: &str = include_str!("res/run_process.sh");

pub const SCRIPT_FILE_NAME: &str = "run_process.sh";
pub const NATIVE_WRAPPER_NAME: &str = "run-process";

/// Shared, read-only view of the available wrappers
#[derive(Debug)]
pub struct WrapperContext {
    // Owns the externalized script; removed when the context is dropped
    _scratch: TempDir,
    shell: PathBuf,
    script_path: PathBuf,
    native_wrapper: Option<PathBuf>,
    sandbox_library: Option<PathBuf>,
}

impl WrapperContext {
    /// Externalize the script and locate the native wrapper and sandbox library
    pub fn prepare(config: &BuilderConfig) -> Result<Self> {
        let scratch = create_scratch_dir(config.scratch_dir.as_deref())?;

        let script_path = scratch.path().join(SCRIPT_FILE_NAME);
        fs::write(&script_path, RUN_PROCESS_SCRIPT).map_err(|e| {
            SandboxError::Wrapper(format!(
                "Could not write wrapper script {}: {}",
                script_path.display(),
                e
            ))
        })?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
        debug!("Wrapper script externalized to {}", script_path.display());

        let native_wrapper = locate_native_wrapper(config.native_wrapper_path.as_deref());
        match &native_wrapper {
            Some(path) => info!("Native wrapper: {}", path.display()),
            None if config.wrapper_mode == WrapperMode::NativeExe => {
                warn!("Native wrapper not found; commands will run under the script wrapper")
            }
            None => debug!("Native wrapper not available"),
        }

        let sandbox_library = match &config.sandbox_library_path {
            Some(path) if path.is_file() => {
                info!("Sandbox library: {}", path.display());
                Some(path.clone())
            }
            Some(path) => {
                audit::sandbox_unavailable(&format!(
                    "configured sandbox library {} does not exist",
                    path.display()
                ));
                None
            }
            None => None,
        };

        Ok(WrapperContext {
            _scratch: scratch,
            shell: config.shell.clone(),
            script_path,
            native_wrapper,
            sandbox_library,
        })
    }

    /// Replace the wrapper script with another file honoring the same contract
    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = path.into();
        self
    }

    pub fn with_native_wrapper(mut self, path: impl Into<PathBuf>) -> Self {
        self.native_wrapper = Some(path.into());
        self
    }

    pub fn with_sandbox_library(mut self, path: Option<PathBuf>) -> Self {
        self.sandbox_library = path;
        self
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn native_wrapper(&self) -> Option<&Path> {
        self.native_wrapper.as_deref()
    }

    pub fn sandbox_library(&self) -> Option<&Path> {
        self.sandbox_library.as_deref()
    }

    /// The wrapper mode that will actually be used for `requested`
    pub fn effective_mode(&self, requested: WrapperMode) -> WrapperMode {
        match requested {
            WrapperMode::NativeExe if self.native_wrapper.is_none() => {
                warn!("Native wrapper requested but unavailable, falling back to script");
                WrapperMode::Script
            }
            mode => mode,
        }
    }

    /// Full argv that runs `command` under the wrapper for `mode`
    pub fn wrap_command(&self, mode: WrapperMode, command: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(command.len() + 2);
        match (self.effective_mode(mode), &self.native_wrapper) {
            (WrapperMode::NativeExe, Some(native)) => {
                argv.push(native.to_string_lossy().into_owned());
            }
            _ => {
                argv.push(self.shell.to_string_lossy().into_owned());
                argv.push(self.script_path.to_string_lossy().into_owned());
            }
        }
        argv.extend(command.iter().cloned());
        argv
    }
}

fn create_scratch_dir(base: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("gradebox");
    let dir = match base {
        Some(base) => {
            fs::create_dir_all(base)?;
            builder.tempdir_in(base)
        }
        None => builder.tempdir(),
    };
    dir.map_err(|e| SandboxError::Wrapper(format!("Could not create scratch directory: {}", e)))
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Configured path first, then a `run-process` next to the running executable
fn locate_native_wrapper(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if is_executable_file(path) {
            return Some(path.to_path_buf());
        }
        warn!(
            "Configured native wrapper {} is not an executable file",
            path.display()
        );
    }

    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    // Test and bench binaries live one level below the wrapper
    [dir.join(NATIVE_WRAPPER_NAME), dir.join("..").join(NATIVE_WRAPPER_NAME)]
        .into_iter()
        .find(|candidate| is_executable_file(candidate))
}
