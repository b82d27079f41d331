//! Sandbox implementation backed by the external trusted-execution
//! wrapper binary.
//!
//! The wrapper owns namespaces, limit enforcement and accounting; this
//! side only assembles the invocation, points the wrapper at the usual
//! stdio/meta paths, and reads the meta file back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::meta::parse_meta;
use super::Sandbox;
use crate::settings::{LimitsSettings, RunMetadata};
use crate::verdict::Verdict;

pub struct JailSandbox {
    wrapper_path: PathBuf,
}

impl JailSandbox {
    pub fn new(wrapper_path: impl Into<PathBuf>) -> Self {
        Self {
            wrapper_path: wrapper_path.into(),
        }
    }

    async fn read_metadata(
        &self,
        meta_path: &Path,
        limits: Option<&LimitsSettings>,
    ) -> RunMetadata {
        match tokio::fs::read_to_string(meta_path).await {
            Ok(content) => parse_meta(&content).into_metadata(limits),
            Err(err) => {
                warn!(meta = %meta_path.display(), error = %err, "wrapper left no meta file");
                RunMetadata {
                    verdict: Verdict::JE,
                    ..RunMetadata::default()
                }
            }
        }
    }
}

#[async_trait]
impl Sandbox for JailSandbox {
    fn supported(&self) -> bool {
        self.wrapper_path.is_file()
    }

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
    ) -> Result<RunMetadata> {
        tokio::fs::create_dir_all(bin_dir)
            .await
            .with_context(|| format!("create bin dir {}", bin_dir.display()))?;

        let mut command = Command::new(&self.wrapper_path);
        command
            .arg("compile")
            .arg("--language")
            .arg(language)
            .arg("--chdir")
            .arg(bin_dir)
            .arg("--stdout")
            .arg(stdout_path)
            .arg("--stderr")
            .arg(stderr_path)
            .arg("--meta")
            .arg(meta_path)
            .arg("--target")
            .arg(target);
        for flag in extra_flags {
            command.arg("--extra-flag").arg(flag);
        }
        command.arg("--");
        for source in source_files {
            command.arg(source);
        }

        debug!(language, target, "compiling under wrapper");
        let status = command
            .status()
            .await
            .with_context(|| format!("spawn wrapper {}", self.wrapper_path.display()))?;

        let mut metadata = self.read_metadata(meta_path, None).await;
        if !status.success() || metadata.verdict != Verdict::OK {
            // The wrapper reports compiler failure like any crashed
            // process; grading wants it as a compile error.
            if metadata.verdict != Verdict::JE {
                metadata.verdict = Verdict::CE;
            }
        }
        Ok(metadata)
    }

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
    ) -> Result<RunMetadata> {
        let mut command = Command::new(&self.wrapper_path);
        command
            .arg("run")
            .arg("--language")
            .arg(language)
            .arg("--chdir")
            .arg(bin_dir)
            .arg("--stdin")
            .arg(stdin_path)
            .arg("--stdout")
            .arg(stdout_path)
            .arg("--stderr")
            .arg(stderr_path)
            .arg("--meta")
            .arg(meta_path)
            .arg("--target")
            .arg(target)
            .arg("--time-limit-ms")
            .arg(limits.time_limit_ms.to_string())
            .arg("--wall-time-limit-ms")
            .arg(
                (limits.time_limit_ms + limits.extra_wall_time_ms + 1_000).to_string(),
            )
            .arg("--output-limit-bytes")
            .arg(limits.output_limit_bytes.to_string())
            .arg("--stack-limit-bytes")
            .arg(limits.stack_limit_bytes.to_string());
        if limits.memory_limit_bytes >= 0 {
            command
                .arg("--memory-limit-bytes")
                .arg(limits.memory_limit_bytes.to_string());
        }
        for (source, target_path) in extra_mounts {
            command
                .arg("--bind")
                .arg(format!("{}:{}", source.display(), target_path.display()));
        }
        for mounted in [original_input, original_output, run_meta].into_iter().flatten() {
            command.arg("--mount-file").arg(mounted);
        }
        if !extra_args.is_empty() {
            command.arg("--");
            for arg in extra_args {
                command.arg(arg);
            }
        }

        debug!(language, target, "running under wrapper");
        command
            .status()
            .await
            .with_context(|| format!("spawn wrapper {}", self.wrapper_path.display()))?;

        Ok(self.read_metadata(meta_path, Some(limits)).await)
    }
}
