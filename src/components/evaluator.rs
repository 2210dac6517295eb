//! Custom evaluator bridge
//!
//! Runs a problem-supplied scoring program against the user's output. The
//! evaluator is semi-trusted: it gets its own process group and wall timer,
//! but no memory metering.
//!
//! Contract:
//! - `args` input: `<user_output_file> <reference_file> <max_points>`
//! - `stdin` input: `<reference_file>`, user output on stdin
//! - The last non-empty stdout line is a number, or a JSON object with
//!   `score` or `distance` and an optional `message`

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::languages::LanguageProfile;
use crate::core::problem::{EvaluatorInput, ScoringFormula};
use crate::core::verdict::Verdict;
use crate::engine::compiler::Artifact;
use crate::engine::config::SandboxConfig;
use crate::engine::executer::{program_env, run_supervised};
use crate::engine::process::{ProcessSpec, ResourceCeiling, Termination};

/// File the user output is written to for `args` evaluators
const USER_OUTPUT_FILE: &str = "user_output.txt";

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator failed (exit code {exit_code:?}, signal {signal:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    #[error("evaluator timed out after {0}ms")]
    Timeout(u64),
    #[error("invalid evaluator output: {0}")]
    OutputParse(String),
    #[error("failed to start evaluator: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to prepare evaluator input: {0}")]
    Io(#[from] io::Error),
}

impl EvaluatorError {
    pub fn verdict(&self) -> Verdict {
        match self {
            EvaluatorError::Failed { .. } => Verdict::EvaluatorError,
            EvaluatorError::Timeout(_) => Verdict::EvaluatorTimeout,
            EvaluatorError::OutputParse(_) => Verdict::OutputParseError,
            EvaluatorError::Spawn(_) | EvaluatorError::Io(_) => Verdict::InternalError,
        }
    }
}

/// Score produced by an evaluator, already clamped to `[0, max_points]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatorScore {
    pub score: f64,
    /// Number as printed by the evaluator
    pub raw_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A compiled evaluator together with its calling convention
#[derive(Debug, Clone)]
pub struct CustomEvaluator {
    pub profile: Arc<LanguageProfile>,
    pub artifact: Artifact,
    pub input: EvaluatorInput,
    pub scoring: ScoringFormula,
    pub timeout: Duration,
}

impl CustomEvaluator {
    /// Score `user_output` against `reference`. `work_dir` belongs to the
    /// calling test case; the user output file goes into a fresh directory
    /// inside it.
    pub async fn evaluate(
        &self,
        user_output: &[u8],
        reference: &Path,
        max_points: f64,
        work_dir: &Path,
        config: &SandboxConfig,
    ) -> Result<EvaluatorScore, EvaluatorError> {
        let mut argv = self.artifact.run_command(&self.profile);
        let reference = reference.to_string_lossy().into_owned();
        // the user program could write anywhere in `work_dir`; its output
        // goes into a directory created after it exited
        let (stdin, _output_dir): (&[u8], Option<tempfile::TempDir>) = match self.input {
            EvaluatorInput::Args => {
                let dir = tempfile::Builder::new()
                    .prefix("evaluator-")
                    .tempdir_in(work_dir)?;
                let output_path = dir.path().join(USER_OUTPUT_FILE);
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&output_path)
                    .await?;
                file.write_all(user_output).await?;
                file.flush().await?;
                argv.push(output_path.to_string_lossy().into_owned());
                argv.push(reference);
                argv.push(format_points(max_points));
                (b"".as_slice(), Some(dir))
            }
            EvaluatorInput::Stdin => {
                argv.push(reference);
                (user_output, None)
            }
        };

        debug!("Running evaluator: {:?}", argv);

        let timeout_ms = self.timeout.as_millis() as u64;
        let spec = ProcessSpec::new(work_dir)
            .with_command(argv)
            .with_env(program_env(&self.profile, config))
            .with_ceiling(ResourceCeiling {
                cpu_time_ms: Some(timeout_ms),
                address_space_kb: None,
                file_size_kb: Some(config.file_size_limit_kb),
            });

        let run = run_supervised(&spec, stdin, self.timeout, None, config)
            .await
            .map_err(EvaluatorError::Spawn)?;

        if run.supervision.termination == Termination::TimedOut {
            return Err(EvaluatorError::Timeout(timeout_ms));
        }
        if !run.supervision.success() {
            let stderr = String::from_utf8_lossy(&run.stderr).trim().to_string();
            warn!(
                "Evaluator exited abnormally: status={:?}, stderr={}",
                run.supervision.status,
                stderr.chars().take(200).collect::<String>()
            );
            return Err(EvaluatorError::Failed {
                exit_code: run.supervision.exit_code(),
                signal: run.supervision.signal(),
                stderr,
            });
        }

        let (raw_value, message) = parse_evaluator_output(&run.stdout)?;
        let score = apply_scoring(self.scoring, raw_value, max_points);
        debug!(
            "Evaluator result: raw={}, score={}/{}",
            raw_value, score, max_points
        );

        Ok(EvaluatorScore {
            score,
            raw_value,
            message,
        })
    }
}

/// `10.0` prints as `10`, `2.5` as `2.5`
fn format_points(points: f64) -> String {
    format!("{}", points)
}

/// Parse the last non-empty stdout line into a finite, non-negative value
pub fn parse_evaluator_output(stdout: &[u8]) -> Result<(f64, Option<String>), EvaluatorError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| EvaluatorError::OutputParse("no output".to_string()))?;

    let (value, message) = match line.parse::<f64>() {
        Ok(value) => (value, None),
        Err(_) => parse_json_line(line)?,
    };

    if !value.is_finite() || value < 0.0 {
        return Err(EvaluatorError::OutputParse(format!(
            "value must be finite and non-negative: {}",
            line
        )));
    }

    Ok((value, message))
}

fn parse_json_line(line: &str) -> Result<(f64, Option<String>), EvaluatorError> {
    let invalid = || EvaluatorError::OutputParse(line.chars().take(200).collect());

    let json: serde_json::Value = serde_json::from_str(line).map_err(|_| invalid())?;
    if let Some(value) = json.as_f64() {
        return Ok((value, None));
    }

    let value = json
        .get("score")
        .or_else(|| json.get("distance"))
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(invalid)?;
    let message = json
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Ok((value, message))
}

/// Turn an evaluator value into points, clamped to `[0, max_points]`
pub fn apply_scoring(formula: ScoringFormula, value: f64, max_points: f64) -> f64 {
    let max_points = max_points.max(0.0);
    let score = match formula {
        ScoringFormula::Distance => max_points - value,
        ScoringFormula::Absolute => value,
    };
    score.clamp(0.0, max_points)
}
