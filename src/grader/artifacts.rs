//! Results bundle: every per-case and per-binary artifact of a grading
//! pass, zipped up for the frontend.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Bundles `files` (paths relative to `run_root`) into a ZIP streamed to
/// `writer`. Files that cannot be opened are skipped: a binary that
/// never ran simply has no artifacts.
pub fn bundle(writer: &mut dyn Write, run_root: &Path, files: &[String]) -> Result<()> {
    let mut staging = tempfile::NamedTempFile::new_in(run_root)
        .context("create staging file for results zip")?;
    {
        let mut zip = ZipWriter::new(staging.as_file_mut());
        let options = SimpleFileOptions::default();
        for name in files {
            let mut file = match File::open(run_root.join(name)) {
                Ok(file) => file,
                Err(err) => {
                    debug!(name, error = %err, "artifact skipped");
                    continue;
                }
            };
            zip.start_file(name, options)
                .with_context(|| format!("add {} to results zip", name))?;
            io::copy(&mut file, &mut zip)
                .with_context(|| format!("write {} into results zip", name))?;
        }
        zip.finish().context("finish results zip")?;
    }

    let mut staged = staging.reopen().context("reopen results zip")?;
    io::copy(&mut staged, writer).context("stream results zip")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_bundle_includes_existing_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Main")).unwrap();
        std::fs::write(dir.path().join("Main/compile.err"), b"warning: x").unwrap();
        std::fs::write(dir.path().join("a.out"), b"42\n").unwrap();

        let mut bytes = Vec::new();
        bundle(
            &mut bytes,
            dir.path(),
            &[
                "Main/compile.err".to_string(),
                "a.out".to_string(),
                "never-created.meta".to_string(),
            ],
        )
        .unwrap();

        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["Main/compile.err", "a.out"]);

        let mut contents = String::new();
        zip.by_name("a.out")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "42\n");
    }
}
