//! Binary planning: which processes a submission needs, with their
//! sources materialised on disk and their plumbing created.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{info, warn};

use crate::input::Input;
use crate::languages;
use crate::settings::{InteractiveSettings, LimitsSettings, ProblemSettings, Run, ValidatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// The problemsetter's interactive harness.
    Problemsetter,
    /// Code compiled from the contestant's submission.
    Contestant,
    /// The problemsetter's custom output validator.
    Validator,
}

/// One process participating in a grading pass.
#[derive(Debug, Clone)]
pub struct Binary {
    pub name: String,
    pub target: String,
    pub language: String,
    pub bin_path: PathBuf,
    /// Directory under the scratch root its per-case files land in;
    /// empty means the scratch root itself.
    pub output_path_prefix: String,
    pub kind: BinaryKind,
    pub limits: LimitsSettings,
    pub receive_input: bool,
    pub source_files: Vec<PathBuf>,
    pub extra_flags: Vec<String>,
    pub extra_mount_points: HashMap<PathBuf, PathBuf>,
}

/// A precomputed output taken from an output-only submission.
#[derive(Debug, Clone)]
pub struct OutputOnlyFile {
    pub contents: Vec<u8>,
    pub ole: bool,
}

/// Outcome of planning: either a set of binaries to compile and run, or
/// an up-front compile error (reported as a valid `CE` result).
pub enum Plan {
    Binaries {
        binaries: Vec<Binary>,
        output_only: HashMap<String, OutputOnlyFile>,
    },
    CompileError(String),
}

/// Limits applied to problemsetter-trusted processes: the problem's
/// override if declared, otherwise the generous defaults with the
/// problem's own time limit.
pub fn validator_limits(settings: &ProblemSettings) -> LimitsSettings {
    settings
        .validator
        .limits
        .clone()
        .unwrap_or_else(|| LimitsSettings::for_validator(&settings.limits))
}

/// Plans the binaries for a submission and materialises their sources
/// under `run_root`. May adjust `settings.limits` for debug passes.
pub fn plan(
    run_root: &Path,
    run: &Run,
    input: &Input,
    settings: &mut ProblemSettings,
) -> Result<Plan> {
    let mut binaries;
    let mut output_only = HashMap::new();

    if let Some(interactive) = settings.interactive.clone() {
        match plan_interactive(run_root, run, input, settings, &interactive)? {
            Plan::Binaries { binaries: b, .. } => binaries = b,
            unsupported @ Plan::CompileError(_) => return Ok(unsupported),
        }
    } else {
        let main_bin_path = run_root.join("Main").join("bin");
        fs::create_dir_all(&main_bin_path)
            .with_context(|| format!("create {}", main_bin_path.display()))?;
        let main_source_path = main_bin_path.join(format!(
            "Main.{}",
            languages::file_extension(&run.language)
        ));
        fs::write(&main_source_path, &run.source)
            .with_context(|| format!("write {}", main_source_path.display()))?;

        if run.language == "cat" {
            match parse_output_only(&run.source, settings) {
                Ok(files) => {
                    output_only = files;
                    binaries = vec![];
                }
                Err(err) => return Ok(Plan::CompileError(err.to_string())),
            }
        } else {
            let mut extra_flags = vec![];
            if run.debug && matches!(run.language.as_str(), "c" | "cpp" | "cpp11") {
                // The ASan runtime is not shipped into the sandbox, so
                // link it statically; it also needs the memory limit off,
                // double time, and room in the output for its report.
                extra_flags = vec!["-static-libasan".to_string(), "-fsanitize=address".to_string()];
                settings.limits.memory_limit_bytes = -1;
                settings.limits.time_limit_ms = settings.limits.time_limit_ms * 2 + 1_000;
                settings.limits.output_limit_bytes += 16 * 1024;
            }
            binaries = vec![Binary {
                name: "Main".to_string(),
                target: "Main".to_string(),
                language: run.language.clone(),
                bin_path: main_bin_path,
                output_path_prefix: String::new(),
                kind: BinaryKind::Contestant,
                limits: settings.limits.clone(),
                receive_input: true,
                source_files: vec![main_source_path],
                extra_flags,
                extra_mount_points: HashMap::new(),
            }];
        }
    }

    if settings.validator.name == ValidatorKind::Custom {
        binaries.push(plan_validator(run_root, input, settings)?);
    }

    Ok(Plan::Binaries {
        binaries,
        output_only,
    })
}

fn plan_interactive(
    run_root: &Path,
    run: &Run,
    input: &Input,
    settings: &ProblemSettings,
    interactive: &InteractiveSettings,
) -> Result<Plan> {
    info!(version = %interactive.libinteractive_version, "interactive problem");
    let parent_ext = languages::file_extension(&interactive.parent_lang);
    let contestant_ext = languages::file_extension(&run.language);
    let parent_lang = languages::upgrade_problemsetter_language(&interactive.parent_lang);
    let main = &interactive.main;

    let main_interface = interactive
        .interfaces
        .get(main)
        .and_then(|by_lang| by_lang.get(&parent_ext))
        .ok_or_else(|| anyhow!("interactive settings lack the {} interface", main))?;

    let mut binaries = vec![Binary {
        name: main.clone(),
        target: languages::target_name(&run.language, main),
        language: parent_lang,
        bin_path: run_root.join(main).join("bin"),
        output_path_prefix: String::new(),
        kind: BinaryKind::Problemsetter,
        limits: validator_limits(settings),
        receive_input: true,
        source_files: requisite_paths(run_root, main, main_interface.requisites.iter()),
        extra_flags: languages::extra_parent_flags(&interactive.parent_lang),
        extra_mount_points: parent_mount_points(run_root, interactive),
    }];

    for (name, by_lang) in &interactive.interfaces {
        if name == main {
            continue;
        }
        let Some(interface) = by_lang.get(&contestant_ext) else {
            return Ok(Plan::CompileError(format!(
                "libinteractive does not support language '{}'",
                run.language
            )));
        };
        binaries.push(Binary {
            name: name.clone(),
            target: languages::target_name(&run.language, name),
            language: run.language.clone(),
            bin_path: run_root.join(name).join("bin"),
            output_path_prefix: name.clone(),
            kind: BinaryKind::Contestant,
            limits: settings.limits.clone(),
            receive_input: false,
            source_files: requisite_paths(run_root, name, interface.requisites.iter()),
            extra_flags: vec![],
            extra_mount_points: pipe_mount_point(run_root, name),
        });
    }

    for binary in &binaries {
        fs::create_dir_all(&binary.bin_path)
            .with_context(|| format!("create {}", binary.bin_path.display()))?;
    }

    // The distributed harness entry point ships in the archive; the
    // generated support files come from the interface table.
    let harness_source = input
        .path()
        .join("interactive")
        .join(format!("Main.{}", parent_ext));
    let harness_dest = run_root
        .join(main)
        .join("bin")
        .join(format!("Main.{}", parent_ext));
    fs::copy(&harness_source, &harness_dest).with_context(|| {
        format!(
            "copy harness {} to {}",
            harness_source.display(),
            harness_dest.display()
        )
    })?;

    for (name, by_lang) in &interactive.interfaces {
        let ext = if name == main { &parent_ext } else { &contestant_ext };
        let bin_dir = run_root.join(name).join("bin");
        if let Some(interface) = by_lang.get(ext) {
            for (filename, contents) in &interface.files {
                let base = Path::new(filename)
                    .file_name()
                    .ok_or_else(|| anyhow!("interface file {} has no name", filename))?;
                fs::write(bin_dir.join(base), contents)
                    .with_context(|| format!("write interface file {}", filename))?;
            }
        }

        if name == main {
            for other in interactive.interfaces.keys() {
                if other != main {
                    fs::create_dir_all(bin_dir.join(format!("{}_pipes", other)))?;
                }
            }
            continue;
        }

        let module_source = bin_dir.join(format!("{}.{}", interactive.module_name, contestant_ext));
        fs::write(&module_source, &run.source)
            .with_context(|| format!("write {}", module_source.display()))?;
        fs::create_dir_all(bin_dir.join(format!("{}_pipes", name)))?;

        let pipes_dir = run_root.join(name).join("pipes");
        fs::create_dir_all(&pipes_dir)?;
        for end in ["in", "out"] {
            mkfifo(&pipes_dir.join(end), Mode::from_bits_truncate(0o644))
                .with_context(|| format!("mkfifo {}/{}", pipes_dir.display(), end))?;
        }
    }

    Ok(Plan::Binaries {
        binaries,
        output_only: HashMap::new(),
    })
}

fn plan_validator(run_root: &Path, input: &Input, settings: &ProblemSettings) -> Result<Binary> {
    let validator_lang = settings
        .validator
        .lang
        .clone()
        .ok_or_else(|| anyhow!("custom validator declared without a language"))?;
    let validator_bin_path = run_root.join("validator").join("bin");
    fs::create_dir_all(&validator_bin_path)
        .with_context(|| format!("create {}", validator_bin_path.display()))?;

    // The archive stores the file under its declared language tag; the
    // sandbox wants the canonical extension.
    let validator_input = input.path().join(format!("validator.{}", validator_lang));
    let validator_source = validator_bin_path.join(format!(
        "validator.{}",
        languages::file_extension(&validator_lang)
    ));
    fs::copy(&validator_input, &validator_source).with_context(|| {
        format!(
            "copy validator {} to {}",
            validator_input.display(),
            validator_source.display()
        )
    })?;

    Ok(Binary {
        name: "validator".to_string(),
        target: "validator".to_string(),
        language: validator_lang,
        bin_path: validator_bin_path,
        output_path_prefix: "validator".to_string(),
        kind: BinaryKind::Validator,
        limits: validator_limits(settings),
        receive_input: false,
        source_files: vec![validator_source],
        extra_flags: vec![],
        extra_mount_points: HashMap::new(),
    })
}

fn requisite_paths<'a>(
    run_root: &Path,
    name: &str,
    requisites: impl Iterator<Item = &'a String>,
) -> Vec<PathBuf> {
    let bin_root = run_root.join(name).join("bin");
    requisites
        .map(|requisite| {
            let base = Path::new(requisite)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(requisite));
            bin_root.join(base)
        })
        .collect()
}

fn pipe_mount_point(run_root: &Path, name: &str) -> HashMap<PathBuf, PathBuf> {
    let mut mounts = HashMap::new();
    mounts.insert(
        run_root.join(name).join("pipes"),
        PathBuf::from(format!("/home/{}_pipes", name)),
    );
    mounts
}

fn parent_mount_points(
    run_root: &Path,
    interactive: &InteractiveSettings,
) -> HashMap<PathBuf, PathBuf> {
    let mut mounts = HashMap::new();
    for name in interactive.interfaces.keys() {
        if *name != interactive.main {
            mounts.extend(pipe_mount_point(run_root, name));
        }
    }
    mounts
}

/// Interprets an output-only submission: either raw data (becoming
/// `Main.out`) or a data URL wrapping a ZIP of per-case outputs.
///
/// ZIP entries must be named `<case>.out` for a declared case; directory
/// prefixes are tolerated and stripped. Entries over the output limit
/// materialise as empty files flagged `OLE`.
pub fn parse_output_only(
    source: &str,
    settings: &ProblemSettings,
) -> Result<HashMap<String, OutputOnlyFile>> {
    let mut result = HashMap::new();

    let Some(zip_bytes) = decode_data_url(source) else {
        info!("output-only submission is not a data URL, taking it as Main.out");
        result.insert(
            "Main.out".to_string(),
            OutputOnlyFile {
                contents: source.as_bytes().to_vec(),
                ole: false,
            },
        );
        return Ok(result);
    };

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(zip_bytes))
        .context("read output-only zip")?;

    let expected: HashSet<String> = settings
        .cases
        .iter()
        .flat_map(|group| group.cases.iter())
        .map(|case| format!("{}.out", case.name))
        .collect();

    for index in 0..zip.len() {
        let mut file = zip.by_index(index).context("read output-only zip entry")?;
        if !file.name().ends_with(".out") {
            info!(name = file.name(), "skipping entry without .out suffix");
            continue;
        }
        // Tolerate archives built one directory up: strip any leading
        // directories and match on the base name alone.
        let base_name = file
            .name()
            .rsplit('/')
            .next()
            .unwrap_or(file.name())
            .to_string();
        if !expected.contains(&base_name) {
            info!(name = file.name(), "skipping entry for an undeclared case");
            continue;
        }
        if file.size() > settings.limits.output_limit_bytes.max(0) as u64 {
            info!(name = file.name(), size = file.size(), "entry too large, emptied");
            result.insert(
                base_name,
                OutputOnlyFile {
                    contents: vec![],
                    ole: true,
                },
            );
            continue;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        if let Err(err) = file.read_to_end(&mut contents) {
            warn!(name = %base_name, error = %err, "unreadable entry skipped");
            continue;
        }
        result.insert(base_name, OutputOnlyFile { contents, ole: false });
    }
    Ok(result)
}

/// Decodes a base64 `data:` URL; anything else yields `None`.
fn decode_data_url(source: &str) -> Option<Vec<u8>> {
    let rest = source.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    if header
        .rsplit(';')
        .next()
        .map(|token| token.eq_ignore_ascii_case("base64"))
        .unwrap_or(false)
    {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()
    } else {
        Some(payload.as_bytes().to_vec())
    }
}
