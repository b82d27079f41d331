//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup. Every knob has a
/// default so a development checkout runs without any environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all runtime state: submissions, cache, grade trees.
    pub runtime_path: PathBuf,
    /// Keep scratch trees after grading instead of removing them.
    pub preserve_files: bool,
    /// Name reported in `judged_by`.
    pub judge_name: String,
    /// The external trusted-execution wrapper binary.
    pub wrapper_path: PathBuf,
    /// JVM used to drive the interactive descriptor generator.
    pub java_path: PathBuf,
    /// The interactive descriptor generator jar.
    pub libinteractive_jar_path: PathBuf,
    /// Directory of bare problem repositories, one per problem.
    pub problems_git_path: PathBuf,
    /// Directory of per-problem base settings files.
    pub problem_settings_path: PathBuf,
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).unwrap_or_else(|_| default.into()).into()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            runtime_path: env_path("ARBITER_RUNTIME_PATH", "/var/lib/arbiter"),
            preserve_files: env::var("ARBITER_PRESERVE_FILES")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(false),
            judge_name: env::var("ARBITER_JUDGE_NAME").unwrap_or_else(|_| "arbiter".into()),
            wrapper_path: env_path("ARBITER_WRAPPER_PATH", "/usr/bin/omegajail"),
            java_path: env_path("ARBITER_JAVA_PATH", "/usr/bin/java"),
            libinteractive_jar_path: env_path(
                "ARBITER_LIBINTERACTIVE_JAR",
                "/usr/share/java/libinteractive.jar",
            ),
            problems_git_path: env_path("ARBITER_PROBLEMS_GIT_PATH", "/var/lib/arbiter/problems.git"),
            problem_settings_path: env_path(
                "ARBITER_PROBLEM_SETTINGS_PATH",
                "/var/lib/arbiter/settings",
            ),
        }
    }
}

/// Shared state threaded through a grading pass.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Config,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}
