//! The grading orchestrator.
//!
//! Drives the per-submission pipeline: plan binaries, compile, execute
//! every case inside the sandbox, validate outputs, aggregate exact
//! scores by group, and package the artifacts.

pub mod artifacts;
pub mod plan;
pub mod results;

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use num_rational::BigRational;
use num_traits::{One, Zero};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::checker;
use crate::config::Context;
use crate::input::Input;
use crate::languages;
use crate::layout;
use crate::settings::{ProblemSettings, Run, RunMetadata, ValidatorKind};
use crate::verdict::Verdict;

use plan::{Binary, BinaryKind, OutputOnlyFile, Plan};
pub use results::{CaseResult, GroupResult, RunResult};

/// Removes the scratch tree on every exit path unless preservation was
/// requested.
struct ScratchGuard {
    path: PathBuf,
    preserve: bool,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if !self.preserve {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

struct IntermediateResult {
    name: String,
    kind: BinaryKind,
    metadata: RunMetadata,
    generated_files: Vec<String>,
}

/// Grades a submission against a materialised input.
///
/// Failures of the submission itself always come back as an `Ok` result
/// carrying a verdict; `Err` is reserved for infrastructure failures.
pub async fn grade(
    ctx: &Context,
    files_writer: Option<&mut (dyn Write + Send)>,
    run: &Run,
    input: &Input,
    sandbox: Arc<dyn crate::sandbox::Sandbox>,
) -> Result<RunResult> {
    let mut result = RunResult::new(Verdict::JE, run.max_score.clone());
    result.judged_by = ctx.config.judge_name.clone();
    if !sandbox.supported() {
        bail!("sandbox not supported on this host");
    }

    let run_root = layout::scratch_dir(&ctx.config.runtime_path, run.attempt_id);
    fs::create_dir_all(&run_root)
        .with_context(|| format!("create scratch dir {}", run_root.display()))?;
    let _scratch = ScratchGuard {
        path: run_root.clone(),
        preserve: ctx.config.preserve_files,
    };

    info!(
        attempt_id = run.attempt_id,
        guid = %run.guid,
        language = %run.language,
        "grading submission"
    );

    let mut settings = input.settings().clone();
    let total_weight_factor = settings.total_weight_factor();

    let (binaries, output_only) = match plan::plan(&run_root, run, input, &mut settings)? {
        Plan::CompileError(message) => {
            result.verdict = Verdict::CE;
            result.compile_error = Some(message);
            return Ok(result);
        }
        Plan::Binaries {
            binaries,
            output_only,
        } => (binaries, output_only),
    };
    if run.language == "cat" {
        result.compile_meta.insert(
            "Main".to_string(),
            RunMetadata {
                verdict: Verdict::OK,
                ..RunMetadata::default()
            },
        );
    }

    let regular_binary_count = binaries
        .iter()
        .filter(|binary| binary.kind != BinaryKind::Validator)
        .count();
    let mut generated_files: Vec<String> = vec![];

    for binary in &binaries {
        let bin_root = run_root.join(&binary.name);
        let language = if binary.kind == BinaryKind::Validator {
            languages::upgrade_problemsetter_language(&binary.language)
        } else {
            binary.language.clone()
        };
        let compiled = sandbox
            .compile(
                &language,
                &binary.source_files,
                &binary.bin_path,
                &bin_root.join("compile.out"),
                &bin_root.join("compile.err"),
                &bin_root.join("compile.meta"),
                &binary.target,
                &binary.extra_flags,
            )
            .await;
        for artifact in ["compile.out", "compile.err", "compile.meta"] {
            generated_files.push(format!("{}/{}", binary.name, artifact));
        }
        let metadata = match compiled {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(binary = %binary.name, error = %err, "sandbox failed to compile");
                RunMetadata {
                    verdict: Verdict::CE,
                    ..RunMetadata::default()
                }
            }
        };
        result.compile_meta.insert(binary.name.clone(), metadata.clone());

        if metadata.verdict != Verdict::OK {
            result.verdict = Verdict::CE;
            let error_file = if languages::compile_errors_on_stdout(&binary.language) {
                "compile.out"
            } else {
                "compile.err"
            };
            let text = fs::read_to_string(bin_root.join(error_file))
                .unwrap_or_else(|err| err.to_string());
            result.compile_error = Some(format!("{}:\n{}", binary.name, text));
            return Ok(result);
        }
    }

    // Execute phase.
    result.verdict = Verdict::OK;
    let mut group_results: Vec<GroupResult> = Vec::with_capacity(settings.cases.len());
    for group in &settings.cases {
        let mut case_results = Vec::with_capacity(group.cases.len());
        for case in &group.cases {
            let mut individual_meta = BTreeMap::new();
            let case_metadata = if result.wall_time
                > settings.limits.overall_wall_time_limit_secs()
            {
                debug!(
                    case = %case.name,
                    wall_time = result.wall_time,
                    "wall-time budget exhausted, case not run"
                );
                RunMetadata {
                    verdict: Verdict::TLE,
                    ..RunMetadata::default()
                }
            } else if run.language == "cat" {
                run_output_only_case(&run_root, &case.name, &output_only, &mut generated_files)
            } else {
                run_case(
                    &run_root,
                    run,
                    input,
                    Arc::clone(&sandbox),
                    &binaries,
                    regular_binary_count,
                    &case.name,
                    &mut individual_meta,
                    &mut generated_files,
                )
                .await
            };

            result.verdict = result.verdict.worse(case_metadata.verdict);
            result.time += case_metadata.time;
            result.wall_time += case_metadata.wall_time;
            result.memory = result.memory.max(case_metadata.memory);

            let normalised_weight = case.weight.clone() * total_weight_factor.clone();
            case_results.push(CaseResult {
                name: case.name.clone(),
                verdict: case_metadata.verdict,
                score: BigRational::zero(),
                contest_score: BigRational::zero(),
                max_score: run.max_score.clone() * normalised_weight,
                meta: case_metadata,
                individual_meta,
            });
        }
        group_results.push(GroupResult {
            group: group.name.clone(),
            score: BigRational::zero(),
            contest_score: BigRational::zero(),
            max_score: run.max_score.clone() * group.weight() * total_weight_factor.clone(),
            cases: case_results,
        });
    }

    // Validate phase.
    let validator_binary = binaries
        .iter()
        .find(|binary| binary.kind == BinaryKind::Validator);
    for (group_index, group) in settings.cases.iter().enumerate() {
        let mut correct = true;
        let mut group_score = BigRational::zero();
        for (case_index, case) in group.cases.iter().enumerate() {
            let case_result = &mut group_results[group_index].cases[case_index];
            if case_result.verdict != Verdict::OK {
                correct = false;
                continue;
            }

            let mut contestant_path = run_root.join(format!("{}.out", case.name));
            if settings.validator.name == ValidatorKind::Custom {
                contestant_path = match run_custom_validator(
                    &run_root,
                    run,
                    input,
                    Arc::clone(&sandbox),
                    &settings,
                    validator_binary,
                    &case.name,
                    contestant_path,
                    &mut case_result.individual_meta,
                    &mut generated_files,
                )
                .await
                {
                    Ok(path) => path,
                    Err(err) => {
                        error!(case = %case.name, error = %err, "custom validation failed");
                        PathBuf::from("/dev/null")
                    }
                };
            }

            let contestant_file = match fs::File::open(&contestant_path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %contestant_path.display(), error = %err, "contestant output unreadable");
                    continue;
                }
            };
            let expected_path = if settings.validator.name == ValidatorKind::Custom {
                // The validator's stdout carries the score; the expected
                // output never participates.
                PathBuf::from("/dev/null")
            } else {
                input.path().join("cases").join(format!("{}.out", case.name))
            };
            let expected_file = match fs::File::open(&expected_path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %expected_path.display(), error = %err, "expected output unreadable");
                    continue;
                }
            };

            let case_score = checker::calculate_score(
                &settings.validator,
                BufReader::new(expected_file),
                BufReader::new(contestant_file),
            )
            .unwrap_or_else(|err| {
                debug!(case = %case.name, error = %err, "output comparison failed");
                BigRational::zero()
            });

            let normalised_weight = case.weight.clone() * total_weight_factor.clone();
            case_result.score = case_score.clone();
            case_result.contest_score =
                run.max_score.clone() * normalised_weight.clone() * case_score.clone();
            group_score = group_score + case_score.clone() * normalised_weight;

            if case_score.is_one() {
                case_result.verdict = Verdict::AC;
            } else {
                result.verdict = result.verdict.worse(Verdict::PA);
                if case_score.is_zero() {
                    correct = false;
                    case_result.verdict = Verdict::WA;
                } else {
                    case_result.verdict = Verdict::PA;
                }
            }
        }
        if correct {
            result.score = result.score.clone() + group_score.clone();
            group_results[group_index].score = group_score.clone();
            group_results[group_index].contest_score = run.max_score.clone() * group_score;
        }
    }

    result.groups = group_results;

    if result.verdict == Verdict::PA && result.score.is_zero() {
        result.verdict = Verdict::WA;
    } else if result.verdict == Verdict::OK {
        result.verdict = Verdict::AC;
        result.score = BigRational::one();
    }
    result.contest_score = result.max_score.clone() * result.score.clone();

    info!(
        attempt_id = run.attempt_id,
        verdict = %result.verdict,
        time = result.time,
        memory = result.memory,
        "finished grading"
    );

    if let Some(writer) = files_writer {
        if let Err(err) = artifacts::bundle(writer, &run_root, &generated_files) {
            error!(error = %err, "failed to package grading artifacts");
        }
    }

    Ok(result)
}

/// Runs every non-validator binary of one case concurrently and merges
/// their metadata.
#[allow(clippy::too_many_arguments)]
async fn run_case(
    run_root: &Path,
    run: &Run,
    input: &Input,
    sandbox: Arc<dyn crate::sandbox::Sandbox>,
    binaries: &[Binary],
    regular_binary_count: usize,
    case_name: &str,
    individual_meta: &mut BTreeMap<String, RunMetadata>,
    generated_files: &mut Vec<String>,
) -> RunMetadata {
    let (tx, mut rx) = mpsc::channel::<IntermediateResult>(regular_binary_count);
    for binary in binaries
        .iter()
        .filter(|binary| binary.kind != BinaryKind::Validator)
    {
        let tx = tx.clone();
        let sandbox = Arc::clone(&sandbox);
        let binary = binary.clone();
        let case_name = case_name.to_string();
        let submission_language = run.language.clone();
        let stdin_path = if binary.receive_input {
            input
                .path()
                .join("cases")
                .join(format!("{}.in", case_name))
        } else {
            PathBuf::from("/dev/null")
        };
        let output_root = run_root.join(&binary.output_path_prefix);
        tokio::spawn(async move {
            let extra_args = if binary.kind == BinaryKind::Problemsetter {
                vec![case_name.clone(), submission_language]
            } else {
                vec![]
            };
            let outcome = sandbox
                .run(
                    &binary.limits,
                    &binary.language,
                    &binary.bin_path,
                    &stdin_path,
                    &output_root.join(format!("{}.out", case_name)),
                    &output_root.join(format!("{}.err", case_name)),
                    &output_root.join(format!("{}.meta", case_name)),
                    &binary.target,
                    None,
                    None,
                    None,
                    &extra_args,
                    &binary.extra_mount_points,
                )
                .await;
            let metadata = match outcome {
                Ok(metadata) => metadata,
                Err(err) => {
                    error!(
                        case = %case_name,
                        binary = %binary.name,
                        error = %err,
                        "sandbox failed to run binary"
                    );
                    RunMetadata {
                        verdict: Verdict::JE,
                        ..RunMetadata::default()
                    }
                }
            };
            let generated_files = ["out", "err", "meta"]
                .iter()
                .map(|ext| {
                    if binary.output_path_prefix.is_empty() {
                        format!("{}.{}", case_name, ext)
                    } else {
                        format!("{}/{}.{}", binary.output_path_prefix, case_name, ext)
                    }
                })
                .collect();
            let _ = tx
                .send(IntermediateResult {
                    name: binary.name.clone(),
                    kind: binary.kind,
                    metadata,
                    generated_files,
                })
                .await;
        });
    }
    drop(tx);

    let mut parent_metadata: Option<RunMetadata> = None;
    let mut chosen_metadata = RunMetadata {
        verdict: Verdict::OK,
        ..RunMetadata::default()
    };
    let mut chosen_empty = true;
    let mut merged_verdict = Verdict::OK;
    let mut total_time = 0.0;
    let mut total_wall_time: f64 = 0.0;
    let mut total_memory: i64 = 0;
    for _ in 0..regular_binary_count {
        let Some(intermediate) = rx.recv().await else {
            break;
        };
        generated_files.extend(intermediate.generated_files);
        if regular_binary_count != 1 {
            individual_meta.insert(intermediate.name.clone(), intermediate.metadata.clone());
        }
        if intermediate.kind == BinaryKind::Problemsetter {
            parent_metadata = Some(intermediate.metadata);
        } else {
            if intermediate.metadata.verdict != Verdict::OK && chosen_empty {
                chosen_metadata = intermediate.metadata.clone();
                chosen_empty = false;
            }
            merged_verdict = merged_verdict.worse(intermediate.metadata.verdict);
            total_time += intermediate.metadata.time;
            total_wall_time = total_wall_time.max(intermediate.metadata.wall_time);
            total_memory += total_memory.max(intermediate.metadata.memory);
        }
    }
    chosen_metadata.verdict = merged_verdict;
    chosen_metadata.time = total_time;
    chosen_metadata.wall_time = total_wall_time;
    chosen_metadata.memory = total_memory;

    if let Some(parent) = parent_metadata {
        if parent.verdict != Verdict::OK && chosen_metadata.verdict == Verdict::OK {
            warn!(
                case = case_name,
                parent_verdict = %parent.verdict,
                "contestant finished cleanly but the harness did not"
            );
            chosen_metadata.verdict = reconcile_parent(&parent);
        }
    }
    chosen_metadata
}

/// Maps a failed harness outcome onto the case verdict when every
/// contestant process finished cleanly.
fn reconcile_parent(parent: &RunMetadata) -> Verdict {
    match parent.verdict {
        Verdict::OLE => Verdict::OLE,
        Verdict::TLE => Verdict::TLE,
        _ => match parent.exit_status {
            // Protocol exit statuses: contestant died mid-message, sent
            // an invalid cookie, sent an invalid message id, or never
            // replied to a call.
            Some(239) | Some(240) | Some(241) | Some(242) => Verdict::RTE,
            _ if parent.signal.as_deref() == Some("SIGPIPE") => Verdict::RTE,
            _ => Verdict::JE,
        },
    }
}

/// Materialises a case of an output-only submission from the collected
/// file map, synthesising the usual out/err/meta triple.
fn run_output_only_case(
    run_root: &Path,
    case_name: &str,
    output_only: &std::collections::HashMap<String, OutputOnlyFile>,
    generated_files: &mut Vec<String>,
) -> RunMetadata {
    let out_name = format!("{}.out", case_name);
    let err_name = format!("{}.err", case_name);
    let meta_name = format!("{}.meta", case_name);
    let out_path = run_root.join(&out_name);
    let meta_path = run_root.join(&meta_name);

    let metadata = if let Some(file) = output_only.get(&out_name) {
        if let Err(err) = fs::write(&out_path, &file.contents) {
            error!(case = case_name, error = %err, "failed to write output file");
        }
        if let Err(err) = fs::write(&meta_path, b"status:0") {
            error!(case = case_name, error = %err, "failed to write meta file");
        }
        RunMetadata {
            verdict: if file.ole { Verdict::OLE } else { Verdict::OK },
            ..RunMetadata::default()
        }
    } else {
        error!(case = case_name, "submission carries no output for case");
        if let Err(err) = fs::write(&out_path, b"") {
            error!(case = case_name, error = %err, "failed to write output file");
        }
        if let Err(err) = fs::write(&meta_path, b"status:1") {
            error!(case = case_name, error = %err, "failed to write meta file");
        }
        RunMetadata {
            verdict: Verdict::RTE,
            ..RunMetadata::default()
        }
    };
    if let Err(err) = fs::write(run_root.join(&err_name), b"") {
        error!(case = case_name, error = %err, "failed to write err file");
    }
    generated_files.extend([out_name, err_name, meta_name]);
    metadata
}

/// Runs the custom validator for one case and returns the path holding
/// the score stream (`/dev/null` when the validator did not exit
/// cleanly).
#[allow(clippy::too_many_arguments)]
async fn run_custom_validator(
    run_root: &Path,
    run: &Run,
    input: &Input,
    sandbox: Arc<dyn crate::sandbox::Sandbox>,
    settings: &ProblemSettings,
    validator_binary: Option<&Binary>,
    case_name: &str,
    contestant_path: PathBuf,
    individual_meta: &mut BTreeMap<String, RunMetadata>,
    generated_files: &mut Vec<String>,
) -> Result<PathBuf> {
    let validator = validator_binary.context("custom validator binary was not planned")?;

    let original_input = input
        .path()
        .join("cases")
        .join(format!("{}.in", case_name));
    let mut original_output = input
        .path()
        .join("cases")
        .join(format!("{}.out", case_name));
    if !original_output.exists() {
        warn!(case = case_name, "expected output missing, validating against /dev/null");
        original_output = PathBuf::from("/dev/null");
    }
    let run_meta_path = run_root.join(format!("{}.meta", case_name));
    let validator_root = run_root.join("validator");

    let metadata = sandbox
        .run(
            &validator.limits,
            &validator.language,
            &validator.bin_path,
            &contestant_path,
            &validator_root.join(format!("{}.out", case_name)),
            &validator_root.join(format!("{}.err", case_name)),
            &validator_root.join(format!("{}.meta", case_name)),
            &validator.target,
            Some(&original_input),
            Some(&original_output),
            Some(&run_meta_path),
            &[case_name.to_string(), run.language.clone()],
            &validator.extra_mount_points,
        )
        .await
        .unwrap_or_else(|err| {
            error!(case = case_name, error = %err, "sandbox failed to run validator");
            RunMetadata {
                verdict: Verdict::JE,
                ..RunMetadata::default()
            }
        });

    individual_meta.insert("validator".to_string(), metadata.clone());
    for ext in ["out", "err", "meta"] {
        generated_files.push(format!("validator/{}.{}", case_name, ext));
    }

    if metadata.verdict != Verdict::OK {
        info!(
            case = case_name,
            verdict = %metadata.verdict,
            "validator did not exit cleanly, score stream replaced with /dev/null"
        );
        Ok(PathBuf::from("/dev/null"))
    } else {
        Ok(validator_root.join(format!("{}.out", case_name)))
    }
}
