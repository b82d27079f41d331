//! Language tag table for compilation and execution.
//!
//! The table is embedded at build time; unknown tags fall back to sane
//! defaults so a new language can be graded before it gets an entry.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;

/// Per-language knobs the orchestrator needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguageConfig {
    /// Canonical source-file extension (e.g. `py3` sources are `.py`).
    pub extension: Option<String>,
    /// The sandbox wraps the program and exposes `<target>_entry`.
    #[serde(default)]
    pub entry_target: bool,
    /// The compiler writes diagnostics to stdout instead of stderr.
    #[serde(default)]
    pub errors_on_stdout: bool,
    /// Extra flags when linking an interactive parent in this language.
    #[serde(default)]
    pub parent_link_flags: Vec<String>,
}

static LANGUAGES: OnceLock<HashMap<String, LanguageConfig>> = OnceLock::new();

fn table() -> &'static HashMap<String, LanguageConfig> {
    LANGUAGES.get_or_init(|| {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        toml::from_str(content).expect("embedded languages.toml is well-formed")
    })
}

fn get(language: &str) -> Option<&'static LanguageConfig> {
    table().get(&language.to_lowercase())
}

/// Canonical file extension for a language tag. Unknown tags use the tag
/// itself, which is right for every single-dialect language.
pub fn file_extension(language: &str) -> String {
    get(language)
        .and_then(|config| config.extension.clone())
        .unwrap_or_else(|| language.to_lowercase())
}

/// Name of the sandbox target for a binary written in `language`.
pub fn target_name(language: &str, target: &str) -> String {
    if get(language).map(|c| c.entry_target).unwrap_or(false) {
        format!("{}_entry", target)
    } else {
        target.to_string()
    }
}

/// Whether compile diagnostics for this language arrive on stdout.
pub fn compile_errors_on_stdout(language: &str) -> bool {
    get(language).map(|c| c.errors_on_stdout).unwrap_or(false)
}

/// Extra flags for compiling the parent side of an interactive problem.
pub fn extra_parent_flags(language: &str) -> Vec<String> {
    get(language)
        .map(|c| c.parent_link_flags.clone())
        .unwrap_or_default()
}

/// Problemsetter-provided code declared as `cpp` is compiled as `cpp11`
/// so harnesses and validators are not stuck on the oldest dialect.
pub fn upgrade_problemsetter_language(language: &str) -> String {
    if language == "cpp" {
        "cpp11".to_string()
    } else {
        language.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_extension_normalises_dialects() {
        assert_eq!(file_extension("py3"), "py");
        assert_eq!(file_extension("py2"), "py");
        assert_eq!(file_extension("cpp11"), "cpp");
        assert_eq!(file_extension("c"), "c");
        assert_eq!(file_extension("rs"), "rs");
    }

    #[test]
    fn test_target_name_entry_suffix() {
        assert_eq!(target_name("py3", "Main"), "Main_entry");
        assert_eq!(target_name("java", "encoder"), "encoder_entry");
        assert_eq!(target_name("cpp11", "Main"), "Main");
    }

    #[test]
    fn test_compile_error_stream() {
        assert!(compile_errors_on_stdout("pas"));
        assert!(compile_errors_on_stdout("cs"));
        assert!(!compile_errors_on_stdout("cpp"));
    }

    #[test]
    fn test_parent_flags_only_for_native_languages() {
        assert_eq!(extra_parent_flags("cpp"), vec!["-Wl,-e__entry"]);
        assert_eq!(extra_parent_flags("c"), vec!["-Wl,-e__entry"]);
        assert!(extra_parent_flags("py3").is_empty());
    }

    #[test]
    fn test_problemsetter_language_upgrade() {
        assert_eq!(upgrade_problemsetter_language("cpp"), "cpp11");
        assert_eq!(upgrade_problemsetter_language("cpp11"), "cpp11");
        assert_eq!(upgrade_problemsetter_language("py3"), "py3");
    }
}
