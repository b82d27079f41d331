//! Sandbox facade.
//!
//! The engine never executes contestant code itself: an external
//! trusted-execution wrapper enforces limits and reports structured
//! metadata. This module defines the contract the orchestrator consumes,
//! the meta-file parser, and the wrapper-backed implementation.
//!
//! Both operations block for the lifetime of the wrapped process and are
//! safe to call concurrently on disjoint working directories.

pub mod jail;
pub mod meta;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::settings::{LimitsSettings, RunMetadata};

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether this sandbox can run on the current host.
    fn supported(&self) -> bool;

    /// Compiles `source_files` into `bin_dir`, leaving the compiler's
    /// stdout/stderr and the wrapper's meta file at the given paths.
    #[allow(clippy::too_many_arguments)]
    async fn compile(
        &self,
        language: &str,
        source_files: &[PathBuf],
        bin_dir: &Path,
        stdout_path: &Path,
        stderr_path: &Path,
        meta_path: &Path,
        target: &str,
        extra_flags: &[String],
    ) -> Result<RunMetadata>;

    /// Runs a previously compiled target under `limits`.
    ///
    /// `original_input`, `original_output` and `run_meta` are additional
    /// files mounted read-only next to the target (custom validators
    /// receive the case input, the expected output and the contestant's
    /// run metadata this way). `extra_mounts` maps host directories to
    /// in-sandbox paths.
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        limits: &LimitsSettings,
        language: &str,
        bin_dir: &Path,
        stdin_path: &Path,
        stdout_path: &Path,
        stderr_path: &Path,
        meta_path: &Path,
        target: &str,
        original_input: Option<&Path>,
        original_output: Option<&Path>,
        run_meta: Option<&Path>,
        extra_args: &[String],
        extra_mounts: &HashMap<PathBuf, PathBuf>,
    ) -> Result<RunMetadata>;
}

pub use jail::JailSandbox;
