//! One-shot grading worker.
//!
//! Thin driver around the library: persists and verifies problem
//! archives, and grades a stored submission end to end, leaving
//! `details.json` and `files.zip` in the sharded grade directory.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use num_rational::BigRational;
use num_traits::One;
use tracing::info;

use arbiter::archive::{FileSettingsLoader, Libinteractive};
use arbiter::config::{Config, Context};
use arbiter::grader;
use arbiter::input::InputManager;
use arbiter::layout;
use arbiter::sandbox::JailSandbox;
use arbiter::settings::Run;

const USAGE: &str = "usage:
  arbiter persist <problem> <hash>
  arbiter verify <hash>
  arbiter grade <problem> <hash> <attempt-id> <guid> <language> [--debug]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arbiter=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("persist") if args.len() == 3 => persist(&config, &args[1], &args[2]),
        Some("verify") if args.len() == 2 => verify(&config, &args[1]),
        Some("grade") if args.len() >= 6 => grade(&config, &args[1..]).await,
        _ => bail!("{}", USAGE),
    }
}

fn manager(config: &Config) -> InputManager {
    InputManager::new(config.runtime_path.join("cache"))
}

fn repository_path(config: &Config, problem: &str) -> std::path::PathBuf {
    config.problems_git_path.join(problem)
}

fn persist(config: &Config, problem: &str, hash: &str) -> Result<()> {
    let loader = FileSettingsLoader::new(&config.problem_settings_path);
    let generator = Libinteractive::new(&config.java_path, &config.libinteractive_jar_path);
    let input = manager(config).persist(
        problem,
        hash,
        &repository_path(config, problem),
        &loader,
        &generator,
    )?;
    info!(
        problem,
        hash,
        uncompressed_size = input.uncompressed_size(),
        "archive ready"
    );
    Ok(())
}

fn verify(config: &Config, hash: &str) -> Result<()> {
    manager(config).get(hash)?.verify()?;
    info!(hash, "archive verified");
    Ok(())
}

async fn grade(config: &Config, args: &[String]) -> Result<()> {
    let problem = args[0].as_str();
    let hash = args[1].as_str();
    let attempt_id: u64 = args[2].parse().context("attempt-id must be numeric")?;
    let guid = args[3].as_str();
    let language = args[4].as_str();
    let debug = args.iter().any(|arg| arg == "--debug");

    if !layout::is_valid_guid(guid) {
        bail!("invalid submission guid: {}", guid);
    }
    let source_path = layout::submission_path(&config.runtime_path, guid);
    let source = std::fs::read_to_string(&source_path)
        .with_context(|| format!("read submission {}", source_path.display()))?;

    let input_manager = manager(config);
    let input = match input_manager.get(hash) {
        Ok(input) => input,
        Err(err) => {
            info!(hash, error = %err, "archive not cached, building it");
            let loader = FileSettingsLoader::new(&config.problem_settings_path);
            let generator =
                Libinteractive::new(&config.java_path, &config.libinteractive_jar_path);
            input_manager.persist(
                problem,
                hash,
                &repository_path(config, problem),
                &loader,
                &generator,
            )?
        }
    };

    let run = Run {
        attempt_id,
        guid: guid.to_string(),
        language: language.to_string(),
        source,
        input_hash: hash.to_string(),
        max_score: BigRational::one(),
        debug,
    };

    let grade_dir = layout::grade_dir(&config.runtime_path, attempt_id);
    std::fs::create_dir_all(&grade_dir)
        .with_context(|| format!("create grade dir {}", grade_dir.display()))?;
    let mut files_zip = File::create(grade_dir.join("files.zip"))
        .with_context(|| format!("create files.zip under {}", grade_dir.display()))?;

    let ctx = Context::new(config.clone());
    let sandbox = Arc::new(JailSandbox::new(&config.wrapper_path));
    let result = grader::grade(&ctx, Some(&mut files_zip), &run, &input, sandbox).await?;

    write_details(&grade_dir, &result)?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn write_details(grade_dir: &Path, result: &grader::RunResult) -> Result<()> {
    let details = serde_json::to_string_pretty(result)?;
    std::fs::write(grade_dir.join("details.json"), details)
        .with_context(|| format!("write details.json under {}", grade_dir.display()))
}
