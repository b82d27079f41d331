//! Verdict domain for grading results.
//!
//! Verdicts are totally ordered from best to worst; merging the verdicts
//! of cooperating processes always keeps the worse one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of judging a case, a binary, or a whole run.
///
/// The declaration order is the severity order: `AC` is the best outcome,
/// `JE` the worst. `Ord` therefore ranks verdicts by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Verdict {
    /// Accepted: full score on the case.
    AC,
    /// Partially accepted: score strictly between 0 and 1.
    PA,
    /// Wrong answer.
    WA,
    /// Ran to completion; output not yet validated.
    #[default]
    OK,
    /// Time limit exceeded.
    TLE,
    /// Memory limit exceeded.
    MLE,
    /// Output limit exceeded.
    OLE,
    /// Runtime error.
    RTE,
    /// Compilation error.
    CE,
    /// Judge error: the grading infrastructure itself failed.
    JE,
}

impl Verdict {
    /// Returns the worse of the two verdicts.
    pub fn worse(self, other: Verdict) -> Verdict {
        self.max(other)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::AC => "AC",
            Verdict::PA => "PA",
            Verdict::WA => "WA",
            Verdict::OK => "OK",
            Verdict::TLE => "TLE",
            Verdict::MLE => "MLE",
            Verdict::OLE => "OLE",
            Verdict::RTE => "RTE",
            Verdict::CE => "CE",
            Verdict::JE => "JE",
        };
        write!(f, "{}", s)
    }
}
