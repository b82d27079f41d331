//! Archive builder integration: real git repositories in, verified
//! archives out.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use num_rational::BigRational;
use num_traits::{One, Zero};

use arbiter::archive::{build_archive, FileSettingsLoader, InteractiveCompiler, SettingsLoader};
use arbiter::input::InputManager;
use arbiter::settings::{InteractiveSettings, ProblemSettings};

fn commit_tree(dir: &Path, files: &[(&str, &[u8])]) -> String {
    let repo = git2::Repository::init(dir).unwrap();
    for (name, contents) in files {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    index.write_tree().unwrap().to_string()
}

fn write_settings(dir: &Path, problem: &str, validator: serde_json::Value) -> FileSettingsLoader {
    let settings_dir = dir.join("settings");
    fs::create_dir_all(&settings_dir).unwrap();
    fs::write(
        settings_dir.join(format!("{}.json", problem)),
        serde_json::json!({"validator": validator}).to_string(),
    )
    .unwrap();
    FileSettingsLoader::new(settings_dir)
}

#[derive(Default)]
struct RecordingCompiler {
    calls: Mutex<Vec<(Vec<u8>, String, String)>>,
}

impl InteractiveCompiler for RecordingCompiler {
    fn generate(
        &self,
        idl: &[u8],
        module_name: &str,
        parent_lang: &str,
    ) -> Result<InteractiveSettings> {
        self.calls.lock().unwrap().push((
            idl.to_vec(),
            module_name.to_string(),
            parent_lang.to_string(),
        ));
        Ok(InteractiveSettings {
            module_name: module_name.to_string(),
            parent_lang: parent_lang.to_string(),
            main: "Main".to_string(),
            interfaces: BTreeMap::new(),
            libinteractive_version: "2.0.0".to_string(),
        })
    }
}

fn archive_entries(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let file = fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut entries = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        entries.insert(name, contents);
    }
    entries
}

fn weight_sum(settings: &ProblemSettings) -> BigRational {
    settings
        .cases
        .iter()
        .flat_map(|group| group.cases.iter())
        .fold(BigRational::zero(), |acc, case| acc + case.weight.clone())
}

fn rat(n: i64, d: i64) -> BigRational {
    BigRational::new(n.into(), d.into())
}

#[test]
fn builds_normalised_sorted_settings_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(
        &repo_dir,
        &[
            ("testplan", b"a 2\nb.1 1\nb.0 1\n# ignored comment\n"),
            ("cases/a.in", b"in a"),
            ("cases/a.out", b"out a"),
            ("cases/b.0.in", b"in b0"),
            ("cases/b.0.out", b"out b0"),
            ("cases/b.1.in", b"in b1"),
            ("cases/b.1.out", b"out b1"),
        ],
    );
    let loader = write_settings(dir.path(), "sums", serde_json::json!({"name": "token"}));
    let archive_path = dir.path().join("sums.tar.gz");

    let (settings, uncompressed_size) = build_archive(
        "sums",
        &archive_path,
        &repo_dir,
        &tree,
        &loader,
        &RecordingCompiler::default(),
    )
    .unwrap();

    let group_names: Vec<&str> = settings.cases.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(group_names, vec!["a", "b"]);
    let case_names: Vec<&str> = settings.cases[1]
        .cases
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(case_names, vec!["b.0", "b.1"]);
    assert_eq!(settings.cases[0].cases[0].weight, rat(1, 2));
    assert_eq!(settings.cases[1].cases[0].weight, rat(1, 4));
    assert!(weight_sum(&settings).is_one());

    let entries = archive_entries(&archive_path);
    assert_eq!(entries["cases/a.in"], b"in a");
    assert_eq!(entries["cases/b.1.out"], b"out b1");

    // Re-reading the embedded settings yields the same normalised
    // weights and ordering (modulo the float JSON boundary).
    let reread: ProblemSettings = serde_json::from_slice(&entries["settings.json"]).unwrap();
    assert!(weight_sum(&reread).is_one());
    let reread_names: Vec<String> = reread
        .cases
        .iter()
        .flat_map(|g| g.cases.iter().map(|c| c.name.clone()))
        .collect();
    assert_eq!(reread_names, vec!["a", "b.0", "b.1"]);

    let expected_size: i64 = entries.values().map(|contents| contents.len() as i64).sum();
    assert_eq!(uncompressed_size, expected_size);
}

#[test]
fn cases_without_testplan_entries_default_to_weight_one() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(
        &repo_dir,
        &[
            ("cases/x.in", b"1"),
            ("cases/x.out", b"1"),
            ("cases/y.in", b"2"),
            ("cases/y.out", b"2"),
        ],
    );
    let loader = write_settings(dir.path(), "plain", serde_json::json!({"name": "token"}));
    let archive_path = dir.path().join("plain.tar.gz");

    let (settings, _) = build_archive(
        "plain",
        &archive_path,
        &repo_dir,
        &tree,
        &loader,
        &RecordingCompiler::default(),
    )
    .unwrap();

    assert_eq!(settings.cases.len(), 2);
    for group in &settings.cases {
        assert_eq!(group.cases[0].weight, rat(1, 2));
    }
}

#[test]
fn numeric_validator_gets_default_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(&repo_dir, &[("cases/a.in", b"1"), ("cases/a.out", b"1")]);
    let loader = write_settings(
        dir.path(),
        "numeric",
        serde_json::json!({"name": "token-numeric"}),
    );
    let archive_path = dir.path().join("numeric.tar.gz");

    let (settings, _) = build_archive(
        "numeric",
        &archive_path,
        &repo_dir,
        &tree,
        &loader,
        &RecordingCompiler::default(),
    )
    .unwrap();
    assert_eq!(settings.validator.tolerance, Some(1e-6));

    // A declared tolerance survives untouched.
    let loader = write_settings(
        dir.path(),
        "loose",
        serde_json::json!({"name": "token-numeric", "tolerance": 1e-2}),
    );
    let (settings, _) = build_archive(
        "loose",
        &dir.path().join("loose.tar.gz"),
        &repo_dir,
        &tree,
        &loader,
        &RecordingCompiler::default(),
    )
    .unwrap();
    assert_eq!(settings.validator.tolerance, Some(1e-2));
}

#[test]
fn custom_validator_file_is_captured() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(
        &repo_dir,
        &[
            ("cases/a.in", b"1"),
            ("cases/a.out", b"1"),
            ("validator.py", b"print(1)"),
        ],
    );
    let loader = write_settings(dir.path(), "graded", serde_json::json!({"name": "custom"}));
    let archive_path = dir.path().join("graded.tar.gz");

    let (settings, _) = build_archive(
        "graded",
        &archive_path,
        &repo_dir,
        &tree,
        &loader,
        &RecordingCompiler::default(),
    )
    .unwrap();

    assert_eq!(settings.validator.lang.as_deref(), Some("py"));
    let entries = archive_entries(&archive_path);
    assert_eq!(entries["validator.py"], b"print(1)");
}

#[test]
fn interactive_harness_is_captured_and_generated() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(
        &repo_dir,
        &[
            ("cases/a.in", b"1"),
            ("cases/a.out", b"1"),
            ("interactive/sums.idl", b"interface sums {};"),
            ("interactive/Main.cpp", b"// harness"),
            ("interactive/Main.distrib.cpp", b"// distributed stub"),
        ],
    );
    let loader = write_settings(dir.path(), "sums", serde_json::json!({"name": "token"}));
    let archive_path = dir.path().join("sums.tar.gz");
    let compiler = RecordingCompiler::default();

    let (settings, _) = build_archive(
        "sums",
        &archive_path,
        &repo_dir,
        &tree,
        &loader,
        &compiler,
    )
    .unwrap();

    let calls = compiler.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, b"interface sums {};");
    assert_eq!(calls[0].1, "sums");
    assert_eq!(calls[0].2, "cpp");

    let interactive = settings.interactive.unwrap();
    assert_eq!(interactive.module_name, "sums");
    assert_eq!(interactive.parent_lang, "cpp");

    let entries = archive_entries(&archive_path);
    assert!(entries.contains_key("interactive/sums.idl"));
    assert!(entries.contains_key("interactive/Main.cpp"));
    assert!(!entries.contains_key("interactive/Main.distrib.cpp"));
}

#[test]
fn persist_publishes_archive_with_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let repo_dir = dir.path().join("repo");
    let tree = commit_tree(
        &repo_dir,
        &[
            ("testplan", b"a 1\n"),
            ("cases/a.in", b"1 2"),
            ("cases/a.out", b"3"),
        ],
    );
    let loader = write_settings(dir.path(), "sums", serde_json::json!({"name": "token"}));
    let cache_root = dir.path().join("cache");
    let manager = InputManager::new(&cache_root);

    let input = manager
        .persist("sums", &tree, &repo_dir, &loader, &RecordingCompiler::default())
        .unwrap();

    assert!(input.verify().is_ok());
    assert!(input.path().join("cases/a.in").exists());
    assert!(input.path().join("settings.json").exists());
    assert!(weight_sum(input.settings()).is_one());

    let archive_path = arbiter::layout::archive_path(&cache_root, &tree);
    assert!(archive_path.exists());
    let sha1_sidecar = fs::read_to_string(PathBuf::from(format!(
        "{}.sha1",
        archive_path.display()
    )))
    .unwrap();
    let (digest, rest) = sha1_sidecar.split_once(' ').unwrap();
    assert_eq!(digest.len(), 40);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
        rest.trim(),
        format!("*{}", archive_path.file_name().unwrap().to_string_lossy())
    );
    let len_sidecar =
        fs::read_to_string(PathBuf::from(format!("{}.len", archive_path.display()))).unwrap();
    assert_eq!(
        len_sidecar.trim().parse::<i64>().unwrap(),
        input.uncompressed_size()
    );
    assert!(!PathBuf::from(format!("{}.tmp", archive_path.display())).exists());

    // A second materialisation reuses the cached entry.
    let again = manager.get(&tree).unwrap();
    assert!(std::sync::Arc::ptr_eq(&input, &again));
}
