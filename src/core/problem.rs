//! Problem description: limits, test categories and how output is evaluated

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIME_LIMIT_MS: u32 = 2000;
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 256 * 1024;
pub const DEFAULT_ACCEPT_MARKER: &str = "__AC__";
pub const DEFAULT_REJECT_MARKER: &str = "__WA__";
/// Placeholder replaced by the test case name in reference path templates
pub const TEST_CASE_NAME_PLACEHOLDER: &str = "{test_case_name}";

/// A single test case. Paths are relative to the problem root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<PathBuf>,
    /// Reference data handed to a custom or interactive evaluator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<PathBuf>,
    /// Explicit weight; defaults to an equal share of the category points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
}

impl TestCase {
    /// Name used in events: explicit name, else the input file stem, else `case-<n>`
    pub fn display_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| format!("case-{}", index + 1))
    }
}

fn default_all_or_nothing() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCategory {
    pub name: String,
    pub test_cases: Vec<TestCase>,
    pub points: f64,
    #[serde(default = "default_all_or_nothing")]
    pub all_or_nothing: bool,
}

impl TestCategory {
    /// Weight of one case inside this category; never negative, so it is a
    /// valid upper bound for any awarded score
    pub fn case_points(&self, case: &TestCase) -> f64 {
        let points = case.points.unwrap_or_else(|| {
            if self.test_cases.is_empty() {
                0.0
            } else {
                self.points / self.test_cases.len() as f64
            }
        });
        if points.is_finite() {
            points.max(0.0)
        } else {
            0.0
        }
    }
}

/// How the evaluator receives the user's output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorInput {
    /// `<user_output_file> <reference_file> <max_points>`
    #[default]
    Args,
    /// `<reference_file>`, user output piped to stdin
    Stdin,
}

/// How the number printed by an evaluator becomes a score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringFormula {
    /// Value is a distance from the optimum: `max_points - value`
    #[default]
    Distance,
    /// Value is the score itself
    Absolute,
}

/// What happens when an interactive evaluator exits cleanly, without a
/// marker, while the user program is still running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorExitPolicy {
    #[default]
    WrongAnswer,
    EvaluatorError,
}

/// Evaluator program source, given inline or as a path under the problem root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorProgram {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEvaluatorSpec {
    pub evaluator: EvaluatorProgram,
    #[serde(default)]
    pub input: EvaluatorInput,
    #[serde(default)]
    pub scoring: ScoringFormula,
    /// Overrides the engine-wide evaluator timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Reference path template, e.g. `data/{test_case_name}.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    pub accept: String,
    pub reject: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            accept: DEFAULT_ACCEPT_MARKER.to_string(),
            reject: DEFAULT_REJECT_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveSpec {
    pub evaluator: EvaluatorProgram,
    #[serde(default)]
    pub markers: Markers,
    #[serde(default)]
    pub on_evaluator_exit: EvaluatorExitPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Passed to the evaluator as JSON in `EVALUATOR_PARAMS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EvaluationMode {
    #[default]
    Standard,
    CustomEvaluator(CustomEvaluatorSpec),
    Interactive(InteractiveSpec),
}

impl EvaluationMode {
    pub fn name(&self) -> &'static str {
        match self {
            EvaluationMode::Standard => "standard",
            EvaluationMode::CustomEvaluator(_) => "custom_evaluator",
            EvaluationMode::Interactive(_) => "interactive",
        }
    }
}

fn default_time_limit_ms() -> u32 {
    DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_kb() -> u64 {
    DEFAULT_MEMORY_LIMIT_KB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSpec {
    /// Directory that relative test and evaluator paths are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u32,
    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,
    /// Skip the per-language time/memory multiplier and bonus
    #[serde(default)]
    pub ignore_limit_bonus: bool,
    pub categories: Vec<TestCategory>,
    #[serde(default)]
    pub evaluation: EvaluationMode,
}

impl ProblemSpec {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn max_score(&self) -> f64 {
        self.categories.iter().map(|c| c.points.max(0.0)).sum()
    }

    pub fn total_cases(&self) -> usize {
        self.categories.iter().map(|c| c.test_cases.len()).sum()
    }

    /// Reference data for evaluator-driven modes: explicit reference, else the
    /// template with the case name substituted, else the input itself
    pub fn reference_for(&self, case: &TestCase, index: usize) -> PathBuf {
        if let Some(reference) = &case.reference {
            return self.resolve(reference);
        }
        if let EvaluationMode::CustomEvaluator(spec) = &self.evaluation {
            if let Some(template) = &spec.reference_template {
                let path =
                    template.replace(TEST_CASE_NAME_PLACEHOLDER, &case.display_name(index));
                return self.resolve(Path::new(&path));
            }
        }
        self.resolve(&case.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_defaults() {
        let problem: ProblemSpec = serde_json::from_str(
            r#"{
                "categories": [
                    {"name": "small", "points": 30, "test_cases": [{"input": "1.in", "expected_output": "1.out"}]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(problem.time_limit_ms, DEFAULT_TIME_LIMIT_MS);
        assert_eq!(problem.memory_limit_kb, DEFAULT_MEMORY_LIMIT_KB);
        assert!(problem.categories[0].all_or_nothing);
        assert!(matches!(problem.evaluation, EvaluationMode::Standard));
        assert_eq!(problem.max_score(), 30.0);
        assert_eq!(problem.categories[0].test_cases[0].display_name(0), "1");
    }

    #[test]
    fn test_case_points_never_negative() {
        let category: TestCategory = serde_json::from_str(
            r#"{"name": "odd", "points": 20, "test_cases": [
                {"input": "1.in", "points": -5},
                {"input": "2.in"},
                {"input": "3.in", "points": 7.5}
            ]}"#,
        )
        .unwrap();

        assert_eq!(category.case_points(&category.test_cases[0]), 0.0);
        assert!((category.case_points(&category.test_cases[1]) - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(category.case_points(&category.test_cases[2]), 7.5);

        let mut case = category.test_cases[2].clone();
        case.points = Some(f64::NAN);
        assert_eq!(category.case_points(&case), 0.0);

        let negative: TestCategory = serde_json::from_str(
            r#"{"name": "neg", "points": -9, "test_cases": [{"input": "1.in"}]}"#,
        )
        .unwrap();
        assert_eq!(negative.case_points(&negative.test_cases[0]), 0.0);
    }

    #[test]
    fn test_evaluation_mode_tagging() {
        let mode: EvaluationMode = serde_json::from_str(
            r#"{"mode": "interactive", "evaluator": {"language": "python", "source_path": "judge.py"}}"#,
        )
        .unwrap();
        match mode {
            EvaluationMode::Interactive(spec) => {
                assert_eq!(spec.markers, Markers::default());
                assert_eq!(spec.on_evaluator_exit, EvaluatorExitPolicy::WrongAnswer);
            }
            other => panic!("unexpected mode {:?}", other),
        }

        let mode: EvaluationMode = serde_json::from_str(
            r#"{"mode": "custom_evaluator", "evaluator": {"language": "sh", "source_code": "echo 0"}, "scoring": "absolute", "input": "stdin"}"#,
        )
        .unwrap();
        match mode {
            EvaluationMode::CustomEvaluator(spec) => {
                assert_eq!(spec.scoring, ScoringFormula::Absolute);
                assert_eq!(spec.input, EvaluatorInput::Stdin);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_case_points_and_reference() {
        let problem: ProblemSpec = serde_json::from_str(
            r#"{
                "root": "/problems/p1",
                "evaluation": {"mode": "custom_evaluator", "evaluator": {"language": "sh"}, "reference_template": "data/{test_case_name}.json"},
                "categories": [
                    {"name": "c", "points": 10, "all_or_nothing": false, "test_cases": [
                        {"name": "a", "input": "a.in"},
                        {"input": "in/b.in", "points": 7},
                        {"input": "/abs/c.in", "reference": "ref/c.txt"}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        let category = &problem.categories[0];
        let cases = &category.test_cases;
        assert!((category.case_points(&cases[0]) - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(category.case_points(&cases[1]), 7.0);

        assert_eq!(
            problem.reference_for(&cases[0], 0),
            PathBuf::from("/problems/p1/data/a.json")
        );
        assert_eq!(
            problem.reference_for(&cases[2], 2),
            PathBuf::from("/problems/p1/ref/c.txt")
        );
        assert_eq!(problem.resolve(&cases[2].input), PathBuf::from("/abs/c.in"));
    }
}
