//! Problem settings data model.
//!
//! Settings are derived once by the archive builder and are immutable for
//! the lifetime of an input. Weights are exact rationals in memory; the
//! JSON boundary marshals them as IEEE-754 doubles, which is lossy but
//! acceptable because every aggregation happens on the rational copy.

use std::collections::BTreeMap;

use num_rational::BigRational;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::verdict::Verdict;

/// Serialize/deserialize a `BigRational` as an `f64`.
pub mod rat_f64 {
    use num_rational::BigRational;
    use num_traits::{FromPrimitive, ToPrimitive, Zero};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigRational, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(value.to_f64().unwrap_or(0.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigRational, D::Error> {
        let value = f64::deserialize(de)?;
        Ok(BigRational::from_f64(value).unwrap_or_else(BigRational::zero))
    }
}

/// Resource limits for a single sandboxed process.
///
/// Times are milliseconds, sizes are bytes. A memory limit of `-1` means
/// the limit is disabled (debug builds under ASan need this).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    pub time_limit_ms: i64,
    pub extra_wall_time_ms: i64,
    pub overall_wall_time_limit_ms: i64,
    pub memory_limit_bytes: i64,
    pub output_limit_bytes: i64,
    pub stack_limit_bytes: i64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            time_limit_ms: 1_000,
            extra_wall_time_ms: 0,
            overall_wall_time_limit_ms: 60_000,
            memory_limit_bytes: 256 * 1024 * 1024,
            output_limit_bytes: 10 * 1024,
            stack_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

impl LimitsSettings {
    /// Limits applied to custom validators and interactive parents when
    /// the problem does not override them: the problem's time limit with
    /// generous memory and output allowances.
    pub fn for_validator(problem_limits: &LimitsSettings) -> Self {
        Self {
            time_limit_ms: problem_limits.time_limit_ms,
            extra_wall_time_ms: 5_000,
            overall_wall_time_limit_ms: problem_limits.overall_wall_time_limit_ms,
            memory_limit_bytes: 1024 * 1024 * 1024,
            output_limit_bytes: 10 * 1024,
            stack_limit_bytes: 1024 * 1024 * 1024,
        }
    }

    pub fn overall_wall_time_limit_secs(&self) -> f64 {
        self.overall_wall_time_limit_ms as f64 / 1000.0
    }
}

/// Output comparison policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidatorKind {
    /// Byte-exact token comparison.
    Token,
    /// Case-insensitive token comparison.
    TokenCaseless,
    /// Numeric token comparison with a relative tolerance.
    TokenNumeric,
    /// The contestant output is itself the score, clamped to [0, 1].
    Literal,
    /// A problemsetter-provided subprocess emits the score.
    Custom,
}

/// Relative tolerance used by `token-numeric` when the problem does not
/// declare one.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSettings {
    pub name: ValidatorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsSettings>,
}

impl ValidatorSettings {
    pub fn tolerance(&self) -> f64 {
        self.tolerance.unwrap_or(DEFAULT_TOLERANCE)
    }
}

/// One interface of an interactive problem, in one language: the
/// materialised source files plus the names the compiler must receive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractiveInterface {
    pub files: BTreeMap<String, String>,
    pub requisites: Vec<String>,
}

/// Interactive harness description produced by the descriptor generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveSettings {
    pub module_name: String,
    pub parent_lang: String,
    pub main: String,
    /// interface name → language extension → interface definition.
    pub interfaces: BTreeMap<String, BTreeMap<String, InteractiveInterface>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub libinteractive_version: String,
}

/// A single test case and its raw weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSettings {
    pub name: String,
    #[serde(with = "rat_f64")]
    pub weight: BigRational,
}

/// An ordered set of cases sharing the name prefix before the first `.`,
/// scored all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub name: String,
    pub cases: Vec<CaseSettings>,
}

impl GroupSettings {
    /// Sum of the raw weights of the group's cases.
    pub fn weight(&self) -> BigRational {
        self.cases
            .iter()
            .fold(BigRational::zero(), |acc, c| acc + c.weight.clone())
    }
}

/// The group a case belongs to: everything before the first `.` of its
/// name, or the whole name if there is none.
pub fn group_name(case_name: &str) -> &str {
    case_name.split('.').next().unwrap_or(case_name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSettings {
    #[serde(default)]
    pub limits: LimitsSettings,
    pub validator: ValidatorSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<InteractiveSettings>,
    #[serde(default)]
    pub cases: Vec<GroupSettings>,
}

impl ProblemSettings {
    /// The factor that normalises raw case weights so they sum to 1.
    ///
    /// If the raw sum is not positive every case counts as weight 1, so a
    /// degenerate testplan cannot divide by zero.
    pub fn total_weight_factor(&self) -> BigRational {
        let total: BigRational = self
            .cases
            .iter()
            .flat_map(|g| g.cases.iter())
            .fold(BigRational::zero(), |acc, c| acc + c.weight.clone());
        if total <= BigRational::zero() {
            BigRational::from_integer(1.into())
        } else {
            BigRational::from_integer(1.into()) / total
        }
    }
}

/// A contestant submission to be graded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub attempt_id: u64,
    pub guid: String,
    pub language: String,
    pub source: String,
    pub input_hash: String,
    #[serde(with = "rat_f64")]
    pub max_score: BigRational,
    #[serde(default)]
    pub debug: bool,
}

/// Resource usage and outcome of one sandboxed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub verdict: Verdict,
    /// CPU time in seconds.
    pub time: f64,
    /// Wall-clock time in seconds.
    pub wall_time: f64,
    /// Peak memory in bytes.
    pub memory: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::One;

    fn rat(n: i64, d: i64) -> BigRational {
        BigRational::new(n.into(), d.into())
    }

    fn settings_with_weights(weights: &[(&str, BigRational)]) -> ProblemSettings {
        let mut groups: BTreeMap<String, GroupSettings> = BTreeMap::new();
        for (name, weight) in weights {
            let group = group_name(name).to_string();
            groups
                .entry(group.clone())
                .or_insert_with(|| GroupSettings {
                    name: group,
                    cases: vec![],
                })
                .cases
                .push(CaseSettings {
                    name: name.to_string(),
                    weight: weight.clone(),
                });
        }
        ProblemSettings {
            limits: LimitsSettings::default(),
            validator: ValidatorSettings {
                name: ValidatorKind::Token,
                tolerance: None,
                lang: None,
                limits: None,
            },
            interactive: None,
            cases: groups.into_values().collect(),
        }
    }

    #[test]
    fn test_normalised_weights_sum_to_one() {
        let settings = settings_with_weights(&[
            ("a.0", rat(1, 3)),
            ("a.1", rat(1, 7)),
            ("b.0", rat(5, 2)),
        ]);
        let factor = settings.total_weight_factor();
        let sum: BigRational = settings
            .cases
            .iter()
            .flat_map(|g| g.cases.iter())
            .fold(BigRational::zero(), |acc, c| {
                acc + c.weight.clone() * factor.clone()
            });
        assert!(sum.is_one());
    }

    #[test]
    fn test_degenerate_weights_fall_back_to_unit_factor() {
        let settings = settings_with_weights(&[("a", BigRational::zero())]);
        assert!(settings.total_weight_factor().is_one());
    }

    #[test]
    fn test_group_weight_is_sum_of_case_weights() {
        let settings = settings_with_weights(&[("g.0", rat(1, 2)), ("g.1", rat(1, 4))]);
        assert_eq!(settings.cases[0].weight(), rat(3, 4));
    }

    #[test]
    fn test_group_name_prefix() {
        assert_eq!(group_name("easy.0"), "easy");
        assert_eq!(group_name("standalone"), "standalone");
        assert_eq!(group_name("a.b.c"), "a");
    }

    #[test]
    fn test_weight_marshals_as_float() {
        let case = CaseSettings {
            name: "a".into(),
            weight: rat(1, 2),
        };
        let json = serde_json::to_value(&case).unwrap();
        assert_eq!(json["weight"], serde_json::json!(0.5));
    }
}
