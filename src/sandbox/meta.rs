//! Wrapper meta-file parser.
//!
//! The trusted-execution wrapper reports one key–value pair per line,
//! `key:value`. Numeric `status` values carry the exit status; the
//! legacy status words (`TO`, `ML`, `OL`, `SG`, `RE`, `XX`) survive from
//! older wrapper releases and map straight to verdicts.

use crate::settings::{LimitsSettings, RunMetadata};
use crate::verdict::Verdict;

/// Raw fields of a wrapper meta file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxMeta {
    pub exit_status: Option<i32>,
    pub status_word: Option<String>,
    /// CPU time in seconds.
    pub time: f64,
    /// Wall-clock time in seconds.
    pub wall_time: f64,
    /// Peak memory in bytes.
    pub memory: i64,
    pub signal: Option<String>,
}

/// Parses meta-file contents. Unknown keys and malformed lines are
/// ignored so wrapper upgrades cannot break grading.
pub fn parse_meta(content: &str) -> SandboxMeta {
    let mut meta = SandboxMeta::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "status" => match value.parse::<i32>() {
                Ok(code) => meta.exit_status = Some(code),
                Err(_) => meta.status_word = Some(value.to_string()),
            },
            "time" => meta.time = value.parse().unwrap_or(0.0),
            "time-wall" => meta.wall_time = value.parse().unwrap_or(0.0),
            "mem" => meta.memory = value.parse().unwrap_or(0),
            "signal" => meta.signal = Some(value.to_string()),
            _ => {}
        }
    }
    meta
}

impl SandboxMeta {
    /// Derives the verdict and packages the usage numbers.
    ///
    /// Limit checks only apply when `limits` is given (they are skipped
    /// for compilation, where the wrapper's own budget governs).
    pub fn into_metadata(self, limits: Option<&LimitsSettings>) -> RunMetadata {
        let mut verdict = match self.status_word.as_deref() {
            Some("TO") => Verdict::TLE,
            Some("ML") => Verdict::MLE,
            Some("OL") => Verdict::OLE,
            Some("SG") | Some("RE") => Verdict::RTE,
            Some(_) => Verdict::JE,
            None => match (self.exit_status, self.signal.as_deref()) {
                (_, Some("SIGXCPU")) => Verdict::TLE,
                (_, Some("SIGXFSZ")) => Verdict::OLE,
                (_, Some(_)) => Verdict::RTE,
                (Some(0), None) => Verdict::OK,
                (Some(_), None) => Verdict::RTE,
                (None, None) => Verdict::JE,
            },
        };
        if let Some(limits) = limits {
            if verdict == Verdict::OK || verdict == Verdict::RTE {
                if limits.memory_limit_bytes >= 0 && self.memory >= limits.memory_limit_bytes {
                    verdict = Verdict::MLE;
                } else if self.time * 1000.0 >= limits.time_limit_ms as f64 {
                    verdict = Verdict::TLE;
                }
            }
        }
        RunMetadata {
            verdict,
            time: self.time,
            wall_time: self.wall_time,
            memory: self.memory,
            exit_status: self.exit_status,
            signal: self.signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_exit() {
        let meta = parse_meta("status:0\ntime:0.015\ntime-wall:0.020\nmem:1048576\n");
        assert_eq!(meta.exit_status, Some(0));
        assert_eq!(meta.time, 0.015);
        assert_eq!(meta.wall_time, 0.020);
        assert_eq!(meta.memory, 1_048_576);
        assert_eq!(meta.into_metadata(None).verdict, Verdict::OK);
    }

    #[test]
    fn test_parse_signal() {
        let meta = parse_meta("status:1\nsignal:SIGPIPE\ntime:0.1\n");
        assert_eq!(meta.signal.as_deref(), Some("SIGPIPE"));
        let metadata = meta.into_metadata(None);
        assert_eq!(metadata.verdict, Verdict::RTE);
        assert_eq!(metadata.signal.as_deref(), Some("SIGPIPE"));
    }

    #[test]
    fn test_cpu_signal_is_tle_and_fsz_is_ole() {
        assert_eq!(
            parse_meta("status:1\nsignal:SIGXCPU\n")
                .into_metadata(None)
                .verdict,
            Verdict::TLE
        );
        assert_eq!(
            parse_meta("status:1\nsignal:SIGXFSZ\n")
                .into_metadata(None)
                .verdict,
            Verdict::OLE
        );
    }

    #[test]
    fn test_legacy_status_words() {
        assert_eq!(parse_meta("status:TO\n").into_metadata(None).verdict, Verdict::TLE);
        assert_eq!(parse_meta("status:ML\n").into_metadata(None).verdict, Verdict::MLE);
        assert_eq!(parse_meta("status:OL\n").into_metadata(None).verdict, Verdict::OLE);
        assert_eq!(parse_meta("status:SG\n").into_metadata(None).verdict, Verdict::RTE);
        assert_eq!(parse_meta("status:XX\n").into_metadata(None).verdict, Verdict::JE);
    }

    #[test]
    fn test_memory_limit_check() {
        let limits = LimitsSettings {
            memory_limit_bytes: 1024,
            ..LimitsSettings::default()
        };
        let meta = parse_meta("status:0\nmem:2048\n");
        assert_eq!(meta.into_metadata(Some(&limits)).verdict, Verdict::MLE);
    }

    #[test]
    fn test_disabled_memory_limit_is_ignored() {
        let limits = LimitsSettings {
            memory_limit_bytes: -1,
            ..LimitsSettings::default()
        };
        let meta = parse_meta("status:0\nmem:999999999\n");
        assert_eq!(meta.into_metadata(Some(&limits)).verdict, Verdict::OK);
    }

    #[test]
    fn test_empty_meta_is_a_judge_error() {
        assert_eq!(parse_meta("").into_metadata(None).verdict, Verdict::JE);
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let meta = parse_meta("garbage\nstatus:0\n:half\n");
        assert_eq!(meta.exit_status, Some(0));
    }
}
