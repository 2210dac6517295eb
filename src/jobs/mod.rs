pub mod events;
pub mod interactive;
pub mod judger;
pub mod playground;

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::core::languages::{LanguageError, LanguageProfile, LanguageRegistry};
use crate::core::problem::EvaluatorProgram;
use crate::engine::compiler::{Artifact, CompileError, EvaluatorCache};
use crate::engine::executer::{ExecutionLimits, ExecutionResult};
use crate::engine::scratch::ScratchDir;
use crate::jobs::events::EventSink;
use crate::jobs::interactive::{InteractionReport, InteractiveRequest};
use crate::jobs::judger::{JudgeRequest, SubmissionSummary};
use crate::jobs::playground::ExecutionRequest;

/// Worker job enum - represents different types of jobs the engine can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Judge a submission against every test case of a problem
    #[serde(rename = "judge")]
    Judge(JudgeRequest),
    /// Run one session against an interactive evaluator
    #[serde(rename = "interactive")]
    Interactive(InteractiveRequest),
    /// Compile and run once with the given stdin
    #[serde(rename = "execute")]
    Execute(ExecutionRequest),
}

#[derive(Debug, Serialize)]
#[serde(tag = "job_type")]
pub enum JobOutput {
    #[serde(rename = "judge")]
    Judge(SubmissionSummary),
    #[serde(rename = "interactive")]
    Interactive(InteractionReport),
    #[serde(rename = "execute")]
    Execute(ExecutionResult),
}

/// Caller or host failures. Anything the submission did is a verdict instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Language(#[from] LanguageError),
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] io::Error),
    #[error("evaluator source missing: {0}")]
    EvaluatorSourceMissing(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Entry point for all jobs. Cheap to share behind an `Arc`; one instance
/// serves any number of concurrent jobs.
pub struct Engine {
    config: EngineConfig,
    languages: LanguageRegistry,
    evaluators: EvaluatorCache,
    parallelism: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: EngineConfig, languages: LanguageRegistry) -> Self {
        let cache_dir = std::path::absolute(&config.evaluator_cache_dir)
            .unwrap_or_else(|_| config.evaluator_cache_dir.clone());
        let max_parallel = config.max_parallel.max(1);
        Self {
            evaluators: EvaluatorCache::new(cache_dir),
            parallelism: Arc::new(Semaphore::new(max_parallel)),
            languages,
            config,
        }
    }

    /// Build an engine with the language table named by the config, or the
    /// built-in one
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let languages = match &config.languages_config {
            Some(path) => {
                let registry = LanguageRegistry::from_file(path)?;
                info!("Loaded language configurations from {}", path.display());
                registry
            }
            None => LanguageRegistry::builtin()?,
        };
        info!(
            "Supported languages: {}",
            languages.supported_languages().join(", ")
        );
        Ok(Self::new(config, languages))
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn parallelism(&self) -> Arc<Semaphore> {
        self.parallelism.clone()
    }

    /// Fresh scratch directory for one job
    pub fn scratch(&self, kind: &str) -> Result<ScratchDir, EngineError> {
        ScratchDir::for_job(&self.config.scratch_root, kind).map_err(EngineError::Scratch)
    }

    /// Effective limits for a language, with or without its bonus
    pub fn limits_for(
        &self,
        profile: &LanguageProfile,
        time_limit_ms: u32,
        memory_limit_kb: u64,
        ignore_limit_bonus: bool,
    ) -> ExecutionLimits {
        if ignore_limit_bonus {
            ExecutionLimits::new(time_limit_ms, memory_limit_kb)
        } else {
            ExecutionLimits::new(
                profile.calculate_time_limit(time_limit_ms),
                profile.calculate_memory_limit_kb(memory_limit_kb),
            )
        }
    }

    /// Resolve and compile (or fetch from cache) an evaluator program.
    ///
    /// The outer error is a caller problem (unknown language, no source);
    /// the inner one is the evaluator failing to build.
    pub async fn load_evaluator(
        &self,
        program: &EvaluatorProgram,
        root: Option<&Path>,
    ) -> Result<Result<(Arc<LanguageProfile>, Artifact), CompileError>, EngineError> {
        let profile = self.languages.resolve(&program.language)?;

        let source = match (&program.source_code, &program.source_path) {
            (Some(code), _) => code.clone(),
            (None, Some(path)) => {
                let path = match root {
                    Some(root) if path.is_relative() => root.join(path),
                    _ => path.clone(),
                };
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    EngineError::EvaluatorSourceMissing(format!("{}: {}", path.display(), e))
                })?
            }
            (None, None) => {
                return Err(EngineError::EvaluatorSourceMissing(
                    "neither source_code nor source_path given".to_string(),
                ))
            }
        };

        debug!("Loading {} evaluator ({} bytes)", profile.id, source.len());
        Ok(self
            .evaluators
            .get_or_compile(&profile, &source, &self.config.sandbox)
            .await
            .map(|artifact| (profile, artifact)))
    }

    pub async fn judge(
        &self,
        request: JudgeRequest,
        sink: &dyn EventSink,
    ) -> Result<SubmissionSummary, EngineError> {
        judger::judge(self, request, sink).await
    }

    pub async fn interact(
        &self,
        request: InteractiveRequest,
    ) -> Result<InteractionReport, EngineError> {
        interactive::interact(self, request).await
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        playground::execute(self, request).await
    }

    pub async fn run_job(
        &self,
        job: WorkerJob,
        sink: &dyn EventSink,
    ) -> Result<JobOutput, EngineError> {
        match job {
            WorkerJob::Judge(request) => self.judge(request, sink).await.map(JobOutput::Judge),
            WorkerJob::Interactive(request) => {
                self.interact(request).await.map(JobOutput::Interactive)
            }
            WorkerJob::Execute(request) => self.execute(request).await.map(JobOutput::Execute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::verdict::{ExecutionVerdict, Verdict};
    use crate::jobs::events::NullSink;
    use crate::testing::test_registry;

    fn engine(scratch: &Path) -> Engine {
        Engine::new(
            EngineConfig {
                scratch_root: scratch.to_path_buf(),
                evaluator_cache_dir: scratch.join("evaluators"),
                ..EngineConfig::default()
            },
            test_registry(),
        )
    }

    #[test]
    fn test_worker_job_tagging() {
        let job: WorkerJob = serde_json::from_str(
            r#"{"job_type": "execute", "language": "sh", "source_code": "echo hi"}"#,
        )
        .unwrap();
        assert!(matches!(job, WorkerJob::Execute(ref req) if req.language == "sh"));

        let job: WorkerJob = serde_json::from_str(
            r#"{
                "job_type": "judge",
                "language": "cpp",
                "source_code": "",
                "problem": {"categories": []}
            }"#,
        )
        .unwrap();
        assert!(matches!(job, WorkerJob::Judge(_)));

        assert!(serde_json::from_str::<WorkerJob>(r#"{"job_type": "validate"}"#).is_err());
    }

    #[test]
    fn test_limits_for_applies_bonus() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.resolve("java").unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());

        let boosted = engine.limits_for(&java, 1000, 1024, false);
        assert_eq!(boosted.cpu_time_ms, java.calculate_time_limit(1000));
        assert_eq!(boosted.memory_limit_kb, java.calculate_memory_limit_kb(1024));
        assert!(boosted.cpu_time_ms > 1000);

        let plain = engine.limits_for(&java, 1000, 1024, true);
        assert_eq!(plain, ExecutionLimits::new(1000, 1024));
    }

    #[tokio::test]
    async fn test_load_evaluator_sources() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());
        std::fs::write(scratch.path().join("check.sh"), "echo 1").unwrap();

        let from_path = EvaluatorProgram {
            language: "sh".into(),
            source_path: Some("check.sh".into()),
            source_code: None,
        };
        let (_, artifact) = engine
            .load_evaluator(&from_path, Some(scratch.path()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read_to_string(artifact.path()).unwrap(), "echo 1");

        let missing = EvaluatorProgram {
            language: "sh".into(),
            source_path: Some("nope.sh".into()),
            source_code: None,
        };
        assert!(matches!(
            engine.load_evaluator(&missing, Some(scratch.path())).await,
            Err(EngineError::EvaluatorSourceMissing(_))
        ));

        let broken = EvaluatorProgram {
            language: "shc".into(),
            source_path: None,
            source_code: Some("if then (".into()),
        };
        let inner = engine.load_evaluator(&broken, None).await.unwrap();
        assert!(matches!(inner, Err(CompileError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_run_job_dispatch() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());

        let job: WorkerJob = serde_json::from_value(serde_json::json!({
            "job_type": "execute",
            "language": "sh",
            "source_code": "echo ok",
        }))
        .unwrap();
        let output = tokio_test::assert_ok!(engine.run_job(job, &NullSink).await);
        match &output {
            JobOutput::Execute(result) => assert_eq!(result.verdict, ExecutionVerdict::Ok),
            other => panic!("unexpected output: {:?}", other),
        }
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["job_type"], "execute");
        assert_eq!(json["stdout"], "b2sK");

        let job: WorkerJob = serde_json::from_value(serde_json::json!({
            "job_type": "judge",
            "language": "sh",
            "source_code": "echo ok",
            "problem": {"categories": []}
        }))
        .unwrap();
        match engine.run_job(job, &NullSink).await.unwrap() {
            JobOutput::Judge(summary) => {
                assert_eq!(summary.status, Verdict::Accepted);
                assert_eq!(summary.max_score, 0.0);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
