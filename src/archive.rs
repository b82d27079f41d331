//! Problem archive assembly.
//!
//! Materialises an immutable problem archive from a versioned repository:
//! walks the tree a revision points at, extracts cases, the custom
//! validator and the interactive harness, derives normalised case
//! weights, and emits a gzip-compressed tar whose last entry is the
//! derived `settings.json`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use git2::{ObjectType, Repository, TreeWalkMode, TreeWalkResult};
use num_rational::BigRational;
use num_traits::{FromPrimitive, Zero};
use regex::Regex;
use tracing::{debug, info};

use crate::settings::{
    group_name, CaseSettings, GroupSettings, InteractiveSettings, ProblemSettings, ValidatorKind,
    DEFAULT_TOLERANCE,
};

/// Supplies the base problem settings the archive derives from.
pub trait SettingsLoader {
    fn load(&self, problem_name: &str) -> Result<ProblemSettings>;
}

/// Loads settings from `<root>/<problem>.json`.
pub struct FileSettingsLoader {
    root: PathBuf,
}

impl FileSettingsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SettingsLoader for FileSettingsLoader {
    fn load(&self, problem_name: &str) -> Result<ProblemSettings> {
        let path = self.root.join(format!("{}.json", problem_name));
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read problem settings {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse problem settings {}", path.display()))
    }
}

/// Turns an interface definition into the structured settings the
/// orchestrator wires at grading time.
pub trait InteractiveCompiler {
    fn generate(
        &self,
        idl: &[u8],
        module_name: &str,
        parent_lang: &str,
    ) -> Result<InteractiveSettings>;
}

/// The external libinteractive descriptor generator.
pub struct Libinteractive {
    java_path: PathBuf,
    jar_path: PathBuf,
}

impl Libinteractive {
    pub fn new(java_path: impl Into<PathBuf>, jar_path: impl Into<PathBuf>) -> Self {
        Self {
            java_path: java_path.into(),
            jar_path: jar_path.into(),
        }
    }
}

impl InteractiveCompiler for Libinteractive {
    fn generate(
        &self,
        idl: &[u8],
        module_name: &str,
        parent_lang: &str,
    ) -> Result<InteractiveSettings> {
        let mut child = Command::new(&self.java_path)
            .arg("-jar")
            .arg(&self.jar_path)
            .args([
                "json",
                "--module-name",
                module_name,
                "--parent-lang",
                parent_lang,
                "--omit-debug-targets",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn interactive descriptor generator")?;
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("generator stdin unavailable"))?
            .write_all(idl)
            .context("write idl to descriptor generator")?;
        let output = child
            .wait_with_output()
            .context("wait for descriptor generator")?;
        if !output.status.success() {
            bail!(
                "descriptor generator failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("parse descriptor generator output")
    }
}

/// Aborts a grading pass before it starts when the problem declares an
/// interactive harness but no generator is configured.
pub struct NoInteractiveCompiler;

impl InteractiveCompiler for NoInteractiveCompiler {
    fn generate(&self, _idl: &[u8], _module: &str, _parent: &str) -> Result<InteractiveSettings> {
        bail!("no interactive descriptor generator configured")
    }
}

fn testplan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^# \t]+)\s+([0-9.]+).*$").expect("testplan regex"))
}

struct TarWriter<W: Write> {
    builder: tar::Builder<W>,
    uncompressed_size: i64,
}

impl<W: Write> TarWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(writer),
            uncompressed_size: 0,
        }
    }

    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        self.builder
            .append_data(&mut header, path, contents)
            .with_context(|| format!("append {} to archive", path))?;
        self.uncompressed_size += contents.len() as i64;
        Ok(())
    }

    fn add_dir(&mut self, path: &str) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        self.builder
            .append_data(
                &mut header,
                format!("{}/", path.trim_end_matches('/')),
                std::io::empty(),
            )
            .with_context(|| format!("append {}/ to archive", path))?;
        Ok(())
    }

    fn into_inner(self) -> Result<(W, i64)> {
        let writer = self.builder.into_inner().context("finish tar stream")?;
        Ok((writer, self.uncompressed_size))
    }
}

#[derive(Default)]
struct WalkState {
    raw_case_weights: BTreeMap<String, BigRational>,
    idl_contents: Option<Vec<u8>>,
    idl_module_name: String,
    parent_lang: String,
    validator_lang: Option<String>,
}

/// Builds the archive for `problem_name` at `revision` into
/// `archive_path` and returns the derived settings together with the
/// total uncompressed entry size.
///
/// On failure the partially written archive is left behind for the
/// caller to remove; nothing else is mutated.
pub fn build_archive(
    problem_name: &str,
    archive_path: &Path,
    repository_path: &Path,
    revision: &str,
    loader: &dyn SettingsLoader,
    interactive_compiler: &dyn InteractiveCompiler,
) -> Result<(ProblemSettings, i64)> {
    let mut settings = loader.load(problem_name)?;
    if settings.validator.name == ValidatorKind::TokenNumeric && settings.validator.tolerance.is_none()
    {
        settings.validator.tolerance = Some(DEFAULT_TOLERANCE);
    }

    let repository = Repository::open(repository_path)
        .with_context(|| format!("open repository {}", repository_path.display()))?;
    let oid = git2::Oid::from_str(revision).context("parse revision hash")?;
    let tree = repository
        .find_object(oid, None)
        .and_then(|object| object.peel(ObjectType::Tree))
        .with_context(|| format!("resolve revision {} to a tree", revision))?
        .into_tree()
        .map_err(|_| anyhow!("revision {} is not a tree", revision))?;

    let file = File::create(archive_path)
        .with_context(|| format!("create archive {}", archive_path.display()))?;
    let gz = GzEncoder::new(file, Compression::default());
    let mut archive = TarWriter::new(gz);

    let mut state = WalkState::default();
    let mut walk_err: Option<anyhow::Error> = None;
    let custom_validator = settings.validator.name == ValidatorKind::Custom;

    let walk = tree.walk(TreeWalkMode::PreOrder, |parent, entry| {
        let name = match entry.name() {
            Some(name) => name.to_string(),
            None => return TreeWalkResult::Skip,
        };
        let entry_path = format!("{}{}", parent, name);
        let result = visit_entry(
            &repository,
            &mut archive,
            &mut state,
            custom_validator,
            &entry_path,
            &name,
            entry,
        );
        match result {
            Ok(()) => TreeWalkResult::Ok,
            Err(err) => {
                walk_err = Some(err);
                TreeWalkResult::Abort
            }
        }
    });
    if let Some(err) = walk_err {
        return Err(err);
    }
    walk.context("walk revision tree")?;

    settings.cases = assemble_groups(&state.raw_case_weights);
    if let Some(lang) = state.validator_lang {
        settings.validator.lang = Some(lang);
    }

    if let (Some(idl), false) = (&state.idl_contents, state.parent_lang.is_empty()) {
        info!(
            module = %state.idl_module_name,
            parent_lang = %state.parent_lang,
            "generating interactive settings"
        );
        settings.interactive = Some(interactive_compiler.generate(
            idl,
            &state.idl_module_name,
            &state.parent_lang,
        )?);
    }

    let settings_blob = serde_json::to_vec_pretty(&settings).context("serialise settings")?;
    archive.add_file("settings.json", &settings_blob)?;

    let (gz, uncompressed_size) = archive.into_inner()?;
    gz.finish().context("finish gzip stream")?;

    debug!(
        problem = problem_name,
        revision, uncompressed_size, "archive built"
    );
    Ok((settings, uncompressed_size))
}

fn visit_entry<W: Write>(
    repository: &Repository,
    archive: &mut TarWriter<W>,
    state: &mut WalkState,
    custom_validator: bool,
    entry_path: &str,
    name: &str,
    entry: &git2::TreeEntry<'_>,
) -> Result<()> {
    let is_blob = entry.kind() == Some(ObjectType::Blob);

    if let Some(rest) = entry_path.strip_prefix("interactive/") {
        if is_blob && rest.ends_with(".idl") {
            let blob = repository.find_blob(entry.id())?;
            state.idl_contents = Some(blob.content().to_vec());
            state.idl_module_name = name.trim_end_matches(".idl").to_string();
            archive.add_file(entry_path, blob.content())?;
        } else if is_blob && name.starts_with("Main.") && !name.starts_with("Main.distrib.") {
            let blob = repository.find_blob(entry.id())?;
            state.parent_lang = name.trim_start_matches("Main.").to_string();
            archive.add_file(entry_path, blob.content())?;
        }
        return Ok(());
    }

    if entry_path == "testplan" && is_blob {
        let blob = repository.find_blob(entry.id())?;
        let contents = String::from_utf8_lossy(blob.content()).into_owned();
        for line in contents.lines() {
            if let Some(captures) = testplan_regex().captures(line) {
                let case_name = captures[1].to_string();
                let weight: f64 = captures[2]
                    .parse()
                    .with_context(|| format!("testplan weight for {}", case_name))?;
                let weight = BigRational::from_f64(weight)
                    .ok_or_else(|| anyhow!("testplan weight for {} is not finite", case_name))?;
                state.raw_case_weights.insert(case_name, weight);
            }
        }
        return Ok(());
    }

    if custom_validator && is_blob && entry_path.starts_with("validator.") {
        let lang = entry_path.trim_start_matches("validator.").to_string();
        state.validator_lang = Some(lang);
        let blob = repository.find_blob(entry.id())?;
        archive.add_file(entry_path, blob.content())?;
        return Ok(());
    }

    let Some(case_path) = entry_path.strip_prefix("cases/") else {
        return Ok(());
    };

    if let Some(case_name) = case_file_name(case_path) {
        state
            .raw_case_weights
            .entry(case_name.to_string())
            .or_insert_with(|| BigRational::from_integer(1.into()));
    }

    match entry.kind() {
        Some(ObjectType::Tree) => archive.add_dir(entry_path),
        Some(ObjectType::Blob) => {
            let blob = repository.find_blob(entry.id())?;
            archive.add_file(entry_path, blob.content())
        }
        _ => Ok(()),
    }
}

/// The case an `.in` entry under `cases/` names, for both the flat
/// layout (`<case>.in`) and the legacy `in/<case>.in` sub-layout.
fn case_file_name(case_path: &str) -> Option<&str> {
    let candidate = case_path.strip_prefix("in/").unwrap_or(case_path);
    if candidate.contains('/') {
        return None;
    }
    candidate.strip_suffix(".in")
}

/// Groups cases by name prefix, normalises the weights, and orders both
/// groups and cases lexically.
fn assemble_groups(raw_case_weights: &BTreeMap<String, BigRational>) -> Vec<GroupSettings> {
    let total: BigRational = raw_case_weights
        .values()
        .fold(BigRational::zero(), |acc, w| acc + w.clone());
    let degenerate = total <= BigRational::zero();
    let total = if degenerate {
        BigRational::from_integer(1.into())
    } else {
        total
    };

    let mut groups: BTreeMap<String, GroupSettings> = BTreeMap::new();
    for (case_name, weight) in raw_case_weights {
        let weight = if degenerate {
            BigRational::from_integer(1.into())
        } else {
            weight.clone()
        };
        let group = group_name(case_name).to_string();
        groups
            .entry(group.clone())
            .or_insert_with(|| GroupSettings {
                name: group,
                cases: vec![],
            })
            .cases
            .push(CaseSettings {
                name: case_name.clone(),
                weight: weight / total.clone(),
            });
    }
    let mut groups: Vec<GroupSettings> = groups.into_values().collect();
    for group in &mut groups {
        group.cases.sort_by(|a, b| a.name.cmp(&b.name));
    }
    groups
}
