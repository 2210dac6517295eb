//! Batch judge - compile once, run every test case, score, stream progress
//!
//! Categories are judged in order; the cases of one category run
//! concurrently, bounded by the engine-wide parallelism semaphore. Each case
//! gets its own scratch directory with a copy of the build output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::components::evaluator::CustomEvaluator;
use crate::core::languages::LanguageProfile;
use crate::core::problem::{EvaluationMode, InteractiveSpec, ProblemSpec, TestCase, TestCategory};
use crate::core::utils::{compare_output, output_preview};
use crate::core::verdict::Verdict;
use crate::engine::compiler::{self, Artifact};
use crate::engine::config::SandboxConfig;
use crate::engine::executer::{self, ExecutionLimits};
use crate::engine::scratch::ScratchDir;

use super::events::{CategoryInfo, EventSink, JudgeEvent};
use super::interactive::InteractiveSession;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub language: String,
    pub source_code: String,
    pub problem: ProblemSpec,
}

/// Verdict of one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub status: Verdict,
    pub score_awarded: f64,
    pub max_score: f64,
    pub time_ms: u64,
    pub memory_kb: u64,
    /// Beginning of the program output
    pub produced_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Number printed by a custom evaluator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<f64>,
}

impl JudgeVerdict {
    /// Zero-score verdict for a case that did not get to run
    pub fn unrun(status: Verdict, max_score: f64, diagnostic: impl Into<String>) -> Self {
        Self {
            status,
            score_awarded: 0.0,
            max_score,
            time_ms: 0,
            memory_kb: 0,
            produced_output: String::new(),
            diagnostic: Some(diagnostic.into()),
            raw_value: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSummary {
    pub index: usize,
    pub name: String,
    #[serde(flatten)]
    pub verdict: JudgeVerdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySummary {
    pub name: String,
    pub score: f64,
    pub max_score: f64,
    pub all_passed: bool,
    pub cases: Vec<CaseSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSummary {
    /// Accepted / Scored when every case passed, else the first failing verdict
    pub status: Verdict,
    pub total_score: f64,
    pub max_score: f64,
    pub categories: Vec<CategorySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    /// Sum of custom evaluator values over all cases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_raw_value: Option<f64>,
    pub max_time_ms: u64,
    pub max_memory_kb: u64,
}

/// How each case is evaluated once the submission is built
enum CaseMode {
    Standard,
    Custom(CustomEvaluator),
    Interactive {
        spec: InteractiveSpec,
        profile: Arc<LanguageProfile>,
        artifact: Artifact,
        timeout: Duration,
    },
}

/// Shared, read-only state for every case of one submission
struct CaseContext {
    problem: Arc<ProblemSpec>,
    profile: Arc<LanguageProfile>,
    artifact: Artifact,
    limits: ExecutionLimits,
    mode: CaseMode,
    submission_dir: PathBuf,
    sandbox: SandboxConfig,
    preview_chars: usize,
}

/// Judge a submission against every test case of a problem
pub async fn judge(
    engine: &Engine,
    request: JudgeRequest,
    sink: &dyn EventSink,
) -> Result<SubmissionSummary, EngineError> {
    let JudgeRequest {
        language,
        source_code,
        problem,
    } = request;
    let profile = engine.languages().resolve(&language)?;
    let config = engine.config();

    info!(
        "Judge job: language={}, mode={}, categories={}, cases={}",
        profile.id,
        problem.evaluation.name(),
        problem.categories.len(),
        problem.total_cases()
    );

    sink.emit(JudgeEvent::TestSuiteInfo {
        mode: problem.evaluation.name().to_string(),
        language: profile.id.clone(),
        total_cases: problem.total_cases(),
        max_score: problem.max_score(),
        categories: problem
            .categories
            .iter()
            .map(|category| CategoryInfo {
                name: category.name.clone(),
                points: category.points,
                test_cases: category
                    .test_cases
                    .iter()
                    .enumerate()
                    .map(|(idx, case)| case.display_name(idx))
                    .collect(),
            })
            .collect(),
    })
    .await;

    let scratch = engine.scratch("judge")?;
    let build_dir = scratch.subdir("build").map_err(EngineError::Scratch)?;

    let artifact =
        match compiler::compile(&profile, &source_code, &build_dir, &config.sandbox).await {
            Ok(artifact) => artifact,
            Err(e) => {
                if !e.is_user_error() {
                    warn!("Compiler stage failed: {}", e);
                }
                let summary = fan_out(&problem, sink, e.verdict(), &e.message()).await;
                scratch.cleanup().await;
                return Ok(summary);
            }
        };

    let mode = match &problem.evaluation {
        EvaluationMode::Standard => CaseMode::Standard,
        EvaluationMode::CustomEvaluator(spec) => {
            match engine
                .load_evaluator(&spec.evaluator, problem.root.as_deref())
                .await?
            {
                Ok((profile, artifact)) => CaseMode::Custom(CustomEvaluator {
                    profile,
                    artifact,
                    input: spec.input,
                    scoring: spec.scoring,
                    timeout: spec
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| config.sandbox.evaluator_timeout()),
                }),
                Err(e) => {
                    let message = format!("evaluator compilation failed: {}", e.message());
                    let summary = fan_out(&problem, sink, Verdict::EvaluatorError, &message).await;
                    scratch.cleanup().await;
                    return Ok(summary);
                }
            }
        }
        EvaluationMode::Interactive(spec) => {
            match engine
                .load_evaluator(&spec.evaluator, problem.root.as_deref())
                .await?
            {
                Ok((evaluator_profile, evaluator_artifact)) => CaseMode::Interactive {
                    spec: spec.clone(),
                    profile: evaluator_profile,
                    artifact: evaluator_artifact,
                    timeout: spec
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| config.sandbox.evaluator_timeout()),
                },
                Err(e) => {
                    let message = format!("evaluator compilation failed: {}", e.message());
                    let summary = fan_out(&problem, sink, Verdict::EvaluatorError, &message).await;
                    scratch.cleanup().await;
                    return Ok(summary);
                }
            }
        }
    };

    let limits = engine.limits_for(
        &profile,
        problem.time_limit_ms,
        problem.memory_limit_kb,
        problem.ignore_limit_bonus,
    );
    debug!("Effective limits for {}: {:?}", profile.id, limits);

    let context = Arc::new(CaseContext {
        problem: Arc::new(problem),
        profile,
        artifact,
        limits,
        mode,
        submission_dir: scratch.path().to_path_buf(),
        sandbox: config.sandbox.clone(),
        preview_chars: config.output_preview_chars,
    });

    let mut categories = Vec::with_capacity(context.problem.categories.len());
    let mut case_offset = 0;
    for (category_index, category) in context.problem.categories.iter().enumerate() {
        let summary =
            judge_category(engine, &context, category_index, category, case_offset, sink).await;
        case_offset += category.test_cases.len();

        sink.emit(JudgeEvent::CategoryResult {
            category_index,
            summary: summary.clone(),
        })
        .await;
        categories.push(summary);
    }

    let custom = matches!(context.mode, CaseMode::Custom(_));
    let summary = summarize(&context.problem, categories, None, custom);
    drop(context);
    scratch.cleanup().await;

    info!(
        "Judge summary: status={}, score={}/{}, time={}ms, memory={}KB",
        summary.status,
        summary.total_score,
        summary.max_score,
        summary.max_time_ms,
        summary.max_memory_kb
    );
    sink.emit(JudgeEvent::FinalResult {
        summary: summary.clone(),
    })
    .await;

    Ok(summary)
}

async fn judge_category(
    engine: &Engine,
    context: &Arc<CaseContext>,
    category_index: usize,
    category: &TestCategory,
    case_offset: usize,
    sink: &dyn EventSink,
) -> CategorySummary {
    let mut tasks = JoinSet::new();
    for case_index in 0..category.test_cases.len() {
        let context = context.clone();
        let permits = engine.parallelism();
        tasks.spawn(async move {
            let verdict = match permits.acquire_owned().await {
                Ok(_permit) => {
                    run_case(&context, category_index, case_index, case_offset + case_index).await
                }
                Err(_) => {
                    let category = &context.problem.categories[category_index];
                    let case = &category.test_cases[case_index];
                    JudgeVerdict::unrun(
                        Verdict::InternalError,
                        category.case_points(case),
                        "judge is shutting down",
                    )
                }
            };
            (case_index, verdict)
        });
    }

    let mut cases: Vec<Option<CaseSummary>> = vec![None; category.test_cases.len()];
    while let Some(joined) = tasks.join_next().await {
        let (case_index, verdict) = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!("Test case task failed: {}", e);
                continue;
            }
        };
        let name = category.test_cases[case_index].display_name(case_index);

        sink.emit(JudgeEvent::TestCaseResult {
            category_index,
            category: category.name.clone(),
            case_index,
            case: name.clone(),
            verdict: verdict.clone(),
        })
        .await;

        cases[case_index] = Some(CaseSummary {
            index: case_index,
            name,
            verdict,
        });
    }

    let cases = cases
        .into_iter()
        .enumerate()
        .map(|(index, case)| {
            case.unwrap_or_else(|| {
                let test_case = &category.test_cases[index];
                CaseSummary {
                    index,
                    name: test_case.display_name(index),
                    verdict: JudgeVerdict::unrun(
                        Verdict::InternalError,
                        category.case_points(test_case),
                        "test case task panicked",
                    ),
                }
            })
        })
        .collect();

    let custom = matches!(context.mode, CaseMode::Custom(_));
    score_category(category, cases, custom)
}

/// Aggregate case verdicts into a category score
pub fn score_category(
    category: &TestCategory,
    cases: Vec<CaseSummary>,
    custom: bool,
) -> CategorySummary {
    let max_score = category.points.max(0.0);
    let all_passed = cases.iter().all(|case| case.verdict.status.is_passing());

    let score = if category.all_or_nothing && !custom {
        if all_passed {
            max_score
        } else {
            0.0
        }
    } else if category.all_or_nothing && !all_passed {
        0.0
    } else {
        cases
            .iter()
            .map(|case| case.verdict.score_awarded)
            .sum::<f64>()
            .clamp(0.0, max_score)
    };

    CategorySummary {
        name: category.name.clone(),
        score,
        max_score,
        all_passed,
        cases,
    }
}

fn summarize(
    problem: &ProblemSpec,
    categories: Vec<CategorySummary>,
    compile_output: Option<String>,
    custom: bool,
) -> SubmissionSummary {
    let cases = || categories.iter().flat_map(|c| c.cases.iter());

    let status = cases()
        .map(|case| case.verdict.status)
        .find(|status| !status.is_passing())
        .unwrap_or(if custom {
            Verdict::Scored
        } else {
            Verdict::Accepted
        });
    let total_raw_value = custom.then(|| cases().filter_map(|case| case.verdict.raw_value).sum());

    SubmissionSummary {
        status,
        total_score: categories.iter().map(|c| c.score).sum(),
        max_score: problem.max_score(),
        max_time_ms: cases().map(|case| case.verdict.time_ms).max().unwrap_or(0),
        max_memory_kb: cases().map(|case| case.verdict.memory_kb).max().unwrap_or(0),
        compile_output,
        total_raw_value,
        categories,
    }
}

/// Give every case the same verdict without running anything
async fn fan_out(
    problem: &ProblemSpec,
    sink: &dyn EventSink,
    status: Verdict,
    message: &str,
) -> SubmissionSummary {
    info!("Submission not run: {} for all cases", status);

    let mut categories = Vec::with_capacity(problem.categories.len());
    for (category_index, category) in problem.categories.iter().enumerate() {
        let mut cases = Vec::with_capacity(category.test_cases.len());
        for (case_index, case) in category.test_cases.iter().enumerate() {
            let verdict = JudgeVerdict::unrun(status, category.case_points(case), message);
            let name = case.display_name(case_index);
            sink.emit(JudgeEvent::TestCaseResult {
                category_index,
                category: category.name.clone(),
                case_index,
                case: name.clone(),
                verdict: verdict.clone(),
            })
            .await;
            cases.push(CaseSummary {
                index: case_index,
                name,
                verdict,
            });
        }

        let summary = score_category(category, cases, false);
        sink.emit(JudgeEvent::CategoryResult {
            category_index,
            summary: summary.clone(),
        })
        .await;
        categories.push(summary);
    }

    let summary = summarize(problem, categories, Some(message.to_string()), false);
    sink.emit(JudgeEvent::FinalResult {
        summary: summary.clone(),
    })
    .await;
    summary
}

async fn run_case(
    context: &CaseContext,
    category_index: usize,
    case_index: usize,
    global_index: usize,
) -> JudgeVerdict {
    let category = &context.problem.categories[category_index];
    let case = &category.test_cases[case_index];
    let max_score = category.case_points(case);

    let case_dir = match ScratchDir::for_case(&context.submission_dir, global_index) {
        Ok(dir) => dir,
        Err(e) => {
            warn!("Failed to create case directory: {}", e);
            return JudgeVerdict::unrun(Verdict::SystemError, max_score, e.to_string());
        }
    };

    let verdict = match context.artifact.relocate(case_dir.path()).await {
        Ok(artifact) => {
            run_case_in(context, case, case_index, max_score, &artifact, case_dir.path()).await
        }
        Err(e) => {
            warn!("Failed to copy build output: {}", e);
            JudgeVerdict::unrun(Verdict::SystemError, max_score, e.to_string())
        }
    };

    debug!(
        "Case {}/{} finished: {} ({}/{})",
        category.name,
        case.display_name(case_index),
        verdict.status,
        verdict.score_awarded,
        max_score
    );

    case_dir.cleanup().await;
    verdict
}

async fn read_resource(path: &Path, what: &str) -> Result<Vec<u8>, String> {
    tokio::fs::read(path)
        .await
        .map_err(|e| format!("{} not found: {} ({})", what, path.display(), e))
}

async fn run_case_in(
    context: &CaseContext,
    case: &TestCase,
    case_index: usize,
    max_score: f64,
    artifact: &Artifact,
    work_dir: &Path,
) -> JudgeVerdict {
    let problem = &context.problem;

    if let CaseMode::Interactive {
        spec,
        profile,
        artifact: evaluator_artifact,
        timeout,
    } = &context.mode
    {
        let reference = problem.reference_for(case, case_index);
        if !tokio::fs::try_exists(&reference).await.unwrap_or(false) {
            return JudgeVerdict::unrun(
                Verdict::Error,
                max_score,
                format!("Reference data not found: {}", reference.display()),
            );
        }
        let session = InteractiveSession {
            user_profile: context.profile.clone(),
            user_artifact: artifact.clone(),
            user_limits: context.limits,
            evaluator_profile: profile.clone(),
            evaluator_artifact: evaluator_artifact.clone(),
            evaluator_timeout: *timeout,
            reference,
            markers: spec.markers.clone(),
            on_evaluator_exit: spec.on_evaluator_exit,
            params: spec.params.clone(),
        };
        let report = session.run(work_dir, &context.sandbox).await;
        let accepted = report.status == Verdict::Accepted;
        return JudgeVerdict {
            status: report.status,
            score_awarded: if accepted { max_score } else { 0.0 },
            max_score,
            time_ms: report.user_wall_ms,
            memory_kb: report.user_peak_memory_kb,
            produced_output: output_preview(&report.user_output(), context.preview_chars),
            diagnostic: report.message,
            raw_value: None,
        };
    }

    let input = match read_resource(&problem.resolve(&case.input), "Input").await {
        Ok(input) => input,
        Err(message) => return JudgeVerdict::unrun(Verdict::Error, max_score, message),
    };

    let expected = match &context.mode {
        CaseMode::Standard => {
            let Some(path) = &case.expected_output else {
                return JudgeVerdict::unrun(
                    Verdict::Error,
                    max_score,
                    "Expected output not specified",
                );
            };
            match read_resource(&problem.resolve(path), "Expected output").await {
                Ok(expected) => Some(expected),
                Err(message) => return JudgeVerdict::unrun(Verdict::Error, max_score, message),
            }
        }
        _ => None,
    };

    let reference = match &context.mode {
        CaseMode::Custom(_) => {
            let reference = problem.reference_for(case, case_index);
            if !tokio::fs::try_exists(&reference).await.unwrap_or(false) {
                return JudgeVerdict::unrun(
                    Verdict::Error,
                    max_score,
                    format!("Reference data not found: {}", reference.display()),
                );
            }
            Some(reference)
        }
        _ => None,
    };

    let result = executer::execute(
        &context.profile,
        artifact,
        &input,
        &context.limits,
        work_dir,
        &context.sandbox,
    )
    .await;

    let mut verdict = JudgeVerdict {
        status: Verdict::from(result.verdict),
        score_awarded: 0.0,
        max_score,
        time_ms: result.wall_duration_ms,
        memory_kb: result.peak_memory_kb,
        produced_output: output_preview(&result.stdout, context.preview_chars),
        diagnostic: None,
        raw_value: None,
    };

    if !result.is_ok() {
        if !result.stderr.is_empty() {
            verdict.diagnostic = Some(output_preview(&result.stderr, context.preview_chars));
        }
        return verdict;
    }

    match (&context.mode, expected, reference) {
        (CaseMode::Custom(evaluator), _, Some(reference)) => {
            match evaluator
                .evaluate(&result.stdout, &reference, max_score, work_dir, &context.sandbox)
                .await
            {
                Ok(score) => {
                    verdict.status = Verdict::Scored;
                    verdict.score_awarded = score.score.clamp(0.0, max_score);
                    verdict.raw_value = Some(score.raw_value);
                    verdict.diagnostic = score.message;
                }
                Err(e) => {
                    verdict.status = e.verdict();
                    verdict.diagnostic = Some(e.to_string());
                }
            }
        }
        (_, Some(expected), _) => {
            if compare_output(&result.stdout, &expected) {
                verdict.status = Verdict::Accepted;
                verdict.score_awarded = max_score;
            } else {
                verdict.status = Verdict::WrongAnswer;
            }
        }
        _ => {
            verdict.status = Verdict::InternalError;
            verdict.diagnostic = Some("no comparison available for this case".to_string());
        }
    }

    verdict
}
