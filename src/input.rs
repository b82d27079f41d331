//! Content-addressed problem archive store.
//!
//! Each problem revision materialises to exactly one archive on disk,
//! addressed by its content hash and guarded by SHA-1 and length
//! sidecars. Extraction happens at most once per hash; concurrent
//! graders share the extracted tree through reference counting.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::archive::{build_archive, InteractiveCompiler, SettingsLoader};
use crate::layout;
use crate::settings::ProblemSettings;

/// A materialised problem input: the archive, its integrity metadata,
/// and a directory with the archive's contents extracted.
pub struct Input {
    hash: String,
    archive_path: PathBuf,
    extracted_path: PathBuf,
    settings: ProblemSettings,
    stored_hash: String,
    uncompressed_size: i64,
}

impl Input {
    /// Directory holding the extracted archive contents.
    pub fn path(&self) -> &Path {
        &self.extracted_path
    }

    pub fn settings(&self) -> &ProblemSettings {
        &self.settings
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn uncompressed_size(&self) -> i64 {
        self.uncompressed_size
    }

    /// Recomputes the archive's SHA-1 and uncompressed size and checks
    /// them against the sidecars. Any mismatch is an integrity failure.
    pub fn verify(&self) -> Result<()> {
        let actual_hash = sha1_hex(&self.archive_path)?;
        if actual_hash != self.stored_hash {
            bail!(
                "integrity: archive {} hashes to {} but sidecar records {}",
                self.archive_path.display(),
                actual_hash,
                self.stored_hash
            );
        }
        let actual_size = measure_uncompressed(&self.archive_path)?;
        if actual_size != self.uncompressed_size {
            bail!(
                "integrity: archive {} unpacks to {} bytes but sidecar records {}",
                self.archive_path.display(),
                actual_size,
                self.uncompressed_size
            );
        }
        Ok(())
    }

    /// Streams the archive to `sink`, with the integrity metadata as
    /// headers.
    pub fn transmit(&self, sink: &mut dyn TransmitSink) -> Result<()> {
        sink.set_header("Content-Type", "application/x-gzip");
        sink.set_header("Content-SHA1", &self.stored_hash);
        sink.set_header(
            "X-Content-Uncompressed-Size",
            &self.uncompressed_size.to_string(),
        );
        let mut file = File::open(&self.archive_path)
            .with_context(|| format!("open archive {}", self.archive_path.display()))?;
        io::copy(&mut file, sink.body()).context("stream archive")?;
        Ok(())
    }
}

/// Receiver side of an archive transmission: a header map plus a body
/// writer, the shape the runner-facing transport exposes.
pub trait TransmitSink {
    fn set_header(&mut self, name: &str, value: &str);
    fn body(&mut self) -> &mut dyn Write;
}

pub struct InputManager {
    cache_root: PathBuf,
    entries: Mutex<HashMap<String, Arc<Input>>>,
}

impl InputManager {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the input for `hash`, materialising it on first use.
    ///
    /// The returned `Arc` is the reference count: clones share one
    /// extracted tree, and the manager's own reference keeps the entry
    /// cached until it is evicted.
    pub fn get(&self, hash: &str) -> Result<Arc<Input>> {
        let mut entries = self.entries.lock().expect("input manager poisoned");
        if let Some(input) = entries.get(hash) {
            return Ok(Arc::clone(input));
        }
        let input = Arc::new(self.materialise(hash)?);
        entries.insert(hash.to_string(), Arc::clone(&input));
        Ok(input)
    }

    /// Builds, hashes, and atomically publishes the archive for a
    /// problem revision, then materialises it.
    pub fn persist(
        &self,
        problem_name: &str,
        hash: &str,
        repository_path: &Path,
        loader: &dyn SettingsLoader,
        interactive_compiler: &dyn InteractiveCompiler,
    ) -> Result<Arc<Input>> {
        let archive_path = layout::archive_path(&self.cache_root, hash);
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create archive dir {}", parent.display()))?;
        }
        let tmp_path = sidecar(&archive_path, "tmp");
        let _tmp_cleanup = RemoveOnDrop(&tmp_path);

        let (_settings, uncompressed_size) = build_archive(
            problem_name,
            &tmp_path,
            repository_path,
            hash,
            loader,
            interactive_compiler,
        )?;

        let digest = sha1_hex(&tmp_path)?;
        let basename = archive_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs::write(
            sidecar(&archive_path, "sha1"),
            format!("{} *{}\n", digest, basename),
        )
        .context("write sha1 sidecar")?;
        fs::write(
            sidecar(&archive_path, "len"),
            format!("{}\n", uncompressed_size),
        )
        .context("write len sidecar")?;
        fs::rename(&tmp_path, &archive_path).context("publish archive")?;

        info!(problem = problem_name, hash, uncompressed_size, "archive persisted");
        self.get(hash)
    }

    /// Drops the cached entry and removes the archive, its sidecars,
    /// and the extracted tree.
    pub fn evict(&self, hash: &str) -> Result<()> {
        let removed = self
            .entries
            .lock()
            .expect("input manager poisoned")
            .remove(hash);
        let archive_path = match removed {
            Some(input) => input.archive_path.clone(),
            None => layout::archive_path(&self.cache_root, hash),
        };
        let _ = fs::remove_file(sidecar(&archive_path, "tmp"));
        let _ = fs::remove_file(sidecar(&archive_path, "sha1"));
        let _ = fs::remove_file(sidecar(&archive_path, "len"));
        let _ = fs::remove_dir_all(layout::input_dir(&self.cache_root, hash));
        fs::remove_file(&archive_path)
            .with_context(|| format!("remove archive {}", archive_path.display()))
    }

    fn materialise(&self, hash: &str) -> Result<Input> {
        let archive_path = layout::archive_path(&self.cache_root, hash);
        if !archive_path.exists() {
            bail!("no archive for input {}", hash);
        }
        let stored_hash = read_stored_hash(&sidecar(&archive_path, "sha1"))?;
        let uncompressed_size = read_stored_length(&sidecar(&archive_path, "len"))?;

        let extracted_path = layout::input_dir(&self.cache_root, hash);
        if extracted_path.exists() {
            fs::remove_dir_all(&extracted_path)
                .with_context(|| format!("clear stale input dir {}", extracted_path.display()))?;
        }
        fs::create_dir_all(&extracted_path)
            .with_context(|| format!("create input dir {}", extracted_path.display()))?;
        let file = File::open(&archive_path)
            .with_context(|| format!("open archive {}", archive_path.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .unpack(&extracted_path)
            .with_context(|| format!("extract archive {}", archive_path.display()))?;

        let settings_path = extracted_path.join("settings.json");
        let settings_blob = fs::read_to_string(&settings_path)
            .with_context(|| format!("read {}", settings_path.display()))?;
        let settings: ProblemSettings = serde_json::from_str(&settings_blob)
            .with_context(|| format!("parse {}", settings_path.display()))?;

        let input = Input {
            hash: hash.to_string(),
            archive_path,
            extracted_path,
            settings,
            stored_hash,
            uncompressed_size,
        };
        if let Err(err) = input.verify() {
            warn!(hash, error = %err, "evicting archive that failed verification");
            let _ = fs::remove_dir_all(&input.extracted_path);
            let _ = fs::remove_file(sidecar(&input.archive_path, "sha1"));
            let _ = fs::remove_file(sidecar(&input.archive_path, "len"));
            let _ = fs::remove_file(&input.archive_path);
            return Err(err);
        }
        Ok(input)
    }
}

struct RemoveOnDrop<'a>(&'a Path);

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.0);
    }
}

fn sidecar(archive_path: &Path, extension: &str) -> PathBuf {
    let mut path = archive_path.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn sha1_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Total size of the archive's regular entries, the quantity the `.len`
/// sidecar records.
fn measure_uncompressed(path: &Path) -> Result<i64> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut total: i64 = 0;
    for entry in archive.entries().context("read archive entries")? {
        let entry = entry.context("read archive entry")?;
        if entry.header().entry_type().is_file() {
            total += entry.header().size().context("entry size")? as i64;
        }
    }
    Ok(total)
}

fn read_stored_hash(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .split_whitespace()
        .next()
        .map(str::to_string)
        .with_context(|| format!("{} is empty", path.display()))
}

fn read_stored_length(path: &Path) -> Result<i64> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .next()
        .with_context(|| format!("{} is empty", path.display()))?
        .trim()
        .parse()
        .with_context(|| format!("{} is not a length", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CapturedTransmit {
        headers: Vec<(String, String)>,
        bytes: Vec<u8>,
    }

    impl TransmitSink for CapturedTransmit {
        fn set_header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }

        fn body(&mut self) -> &mut dyn Write {
            &mut self.bytes
        }
    }

    fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) -> i64 {
        let gz = flate2::write::GzEncoder::new(
            File::create(path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        let mut total = 0i64;
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(contents.len() as u64);
            builder.append_data(&mut header, name, *contents).unwrap();
            total += contents.len() as i64;
        }
        builder.into_inner().unwrap().finish().unwrap();
        total
    }

    fn minimal_settings_json() -> String {
        serde_json::json!({
            "limits": crate::settings::LimitsSettings::default(),
            "validator": {"name": "token"},
            "cases": [
                {"name": "a", "cases": [{"name": "a", "weight": 1.0}]}
            ]
        })
        .to_string()
    }

    fn seed_archive(cache_root: &Path, hash: &str) -> PathBuf {
        let archive_path = layout::archive_path(cache_root, hash);
        fs::create_dir_all(archive_path.parent().unwrap()).unwrap();
        let settings = minimal_settings_json();
        let total = write_tar_gz(
            &archive_path,
            &[
                ("settings.json", settings.as_bytes()),
                ("cases/a.in", b"1 2\n"),
                ("cases/a.out", b"3\n"),
            ],
        );
        let digest = sha1_hex(&archive_path).unwrap();
        fs::write(
            sidecar(&archive_path, "sha1"),
            format!(
                "{} *{}\n",
                digest,
                archive_path.file_name().unwrap().to_string_lossy()
            ),
        )
        .unwrap();
        fs::write(sidecar(&archive_path, "len"), format!("{}\n", total)).unwrap();
        archive_path
    }

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_get_extracts_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        seed_archive(dir.path(), HASH);
        let manager = InputManager::new(dir.path());
        let input = manager.get(HASH).unwrap();
        assert!(input.path().join("cases/a.in").exists());
        assert_eq!(input.settings().cases.len(), 1);
        assert!(input.verify().is_ok());
    }

    #[test]
    fn test_get_is_idempotent_per_hash() {
        let dir = tempfile::tempdir().unwrap();
        seed_archive(dir.path(), HASH);
        let manager = InputManager::new(dir.path());
        let first = manager.get(HASH).unwrap();
        let second = manager.get(HASH).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_corrupted_archive_fails_verification_and_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = seed_archive(dir.path(), HASH);
        // Trailing garbage keeps the gzip stream readable but changes
        // the bytes the sidecar hash covers.
        let mut bytes = fs::read(&archive_path).unwrap();
        bytes.extend_from_slice(b"tampered");
        fs::write(&archive_path, &bytes).unwrap();

        let manager = InputManager::new(dir.path());
        assert!(manager.get(HASH).is_err());
        assert!(!archive_path.exists());
    }

    #[test]
    fn test_wrong_length_sidecar_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = seed_archive(dir.path(), HASH);
        fs::write(sidecar(&archive_path, "len"), "9999999\n").unwrap();
        let manager = InputManager::new(dir.path());
        assert!(manager.get(HASH).is_err());
    }

    #[test]
    fn test_transmit_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = seed_archive(dir.path(), HASH);
        let manager = InputManager::new(dir.path());
        let input = manager.get(HASH).unwrap();

        let mut sink = CapturedTransmit {
            headers: vec![],
            bytes: vec![],
        };
        input.transmit(&mut sink).unwrap();

        let archive_bytes = fs::read(&archive_path).unwrap();
        assert_eq!(sink.bytes, archive_bytes);
        assert_eq!(sink.headers[0].0, "Content-Type");
        assert_eq!(sink.headers[0].1, "application/x-gzip");
        assert_eq!(sink.headers[1].0, "Content-SHA1");
        assert_eq!(sink.headers[1].1.len(), 40);
        assert_eq!(sink.headers[2].0, "X-Content-Uncompressed-Size");
        assert_eq!(
            sink.headers[2].1,
            input.uncompressed_size().to_string()
        );
    }

    #[test]
    fn test_evict_removes_archive_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = seed_archive(dir.path(), HASH);
        let manager = InputManager::new(dir.path());
        manager.get(HASH).unwrap();
        manager.evict(HASH).unwrap();
        assert!(!archive_path.exists());
        assert!(!sidecar(&archive_path, "sha1").exists());
        assert!(!sidecar(&archive_path, "len").exists());
        assert!(manager.get(HASH).is_err());
    }
}
