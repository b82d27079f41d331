//! Grading result types.
//!
//! Scores are exact rationals for the whole grading pass; serialisation
//! converts them to doubles, which is the only lossy boundary.

use std::collections::BTreeMap;

use num_rational::BigRational;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::settings::{rat_f64, RunMetadata};
use crate::verdict::Verdict;

/// Result of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub verdict: Verdict,
    #[serde(with = "rat_f64")]
    pub score: BigRational,
    #[serde(with = "rat_f64")]
    pub contest_score: BigRational,
    #[serde(with = "rat_f64")]
    pub max_score: BigRational,
    pub meta: RunMetadata,
    /// Per-binary metadata, present when the case involved more than one
    /// process (interactive problems, custom validators).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub individual_meta: BTreeMap<String, RunMetadata>,
}

/// Result of a case group. Groups score all-or-nothing: a group with any
/// incorrect case contributes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    pub group: String,
    #[serde(with = "rat_f64")]
    pub score: BigRational,
    #[serde(with = "rat_f64")]
    pub contest_score: BigRational,
    #[serde(with = "rat_f64")]
    pub max_score: BigRational,
    pub cases: Vec<CaseResult>,
}

/// Result of a whole grading pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
    #[serde(default)]
    pub compile_meta: BTreeMap<String, RunMetadata>,
    #[serde(with = "rat_f64")]
    pub score: BigRational,
    #[serde(with = "rat_f64")]
    pub contest_score: BigRational,
    #[serde(with = "rat_f64")]
    pub max_score: BigRational,
    /// Total CPU seconds across cases.
    pub time: f64,
    /// Total wall-clock seconds across cases.
    pub wall_time: f64,
    /// Peak memory in bytes across cases.
    pub memory: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub judged_by: String,
    #[serde(default)]
    pub groups: Vec<GroupResult>,
}

impl RunResult {
    pub fn new(verdict: Verdict, max_score: BigRational) -> Self {
        Self {
            verdict,
            compile_error: None,
            compile_meta: BTreeMap::new(),
            score: BigRational::zero(),
            contest_score: BigRational::zero(),
            max_score,
            time: 0.0,
            wall_time: 0.0,
            memory: 0,
            judged_by: String::new(),
            groups: vec![],
        }
    }
}
