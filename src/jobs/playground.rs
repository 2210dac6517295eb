//! One-off execution: compile, run once with the given stdin, report
//! everything the program did. Nothing is compared or scored.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::problem::{DEFAULT_MEMORY_LIMIT_KB, DEFAULT_TIME_LIMIT_MS};
use crate::engine::compiler;
use crate::engine::executer::{self, ExecutionLimits, ExecutionResult};

use super::{Engine, EngineError};

fn default_time_limit_ms() -> u32 {
    DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_kb() -> u64 {
    DEFAULT_MEMORY_LIMIT_KB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub source_code: String,
    /// stdin as text
    #[serde(default)]
    pub stdin: String,
    /// stdin as base64, for binary input; wins over `stdin`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_base64: Option<String>,
    #[serde(default = "default_time_limit_ms")]
    pub cpu_time_limit_ms: u32,
    /// Defaults to the CPU time limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time_limit_ms: Option<u32>,
    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,
}

impl ExecutionRequest {
    fn stdin_bytes(&self) -> Result<Vec<u8>, EngineError> {
        match &self.stdin_base64 {
            Some(encoded) => general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| EngineError::InvalidRequest(format!("stdin_base64: {}", e))),
            None => Ok(self.stdin.clone().into_bytes()),
        }
    }

    fn limits(&self) -> ExecutionLimits {
        let limits = ExecutionLimits::new(self.cpu_time_limit_ms, self.memory_limit_kb);
        match self.wall_time_limit_ms {
            Some(wall) => limits.with_wall_time(wall),
            None => limits,
        }
    }
}

/// Compile and run once. Compile failures come back as a result with a
/// compile verdict, never as an error.
pub async fn execute(
    engine: &Engine,
    request: ExecutionRequest,
) -> Result<ExecutionResult, EngineError> {
    let profile = engine.languages().resolve(&request.language)?;
    let stdin = request.stdin_bytes()?;
    let limits = request.limits();
    let config = &engine.config().sandbox;

    info!(
        "Execute job: language={}, cpu={}ms, wall={}ms, memory={}KB",
        profile.id, limits.cpu_time_ms, limits.wall_time_ms, limits.memory_limit_kb
    );

    let scratch = engine.scratch("execute")?;
    let build_dir = scratch.subdir("build").map_err(EngineError::Scratch)?;

    let result = match compiler::compile(&profile, &request.source_code, &build_dir, config).await
    {
        Ok(artifact) => {
            executer::execute(&profile, &artifact, &stdin, &limits, &build_dir, config).await
        }
        Err(e) => {
            if !e.is_user_error() {
                warn!("Compiler stage failed: {}", e);
            }
            let stdout = match &e {
                compiler::CompileError::Failed { stdout, .. } => stdout.clone().into_bytes(),
                _ => Vec::new(),
            };
            ExecutionResult::not_run(e.execution_verdict(), stdout, e.message().into_bytes())
        }
    };

    info!(
        "Execute finished: verdict={:?}, time={}ms, memory={}KB",
        result.verdict, result.wall_duration_ms, result.peak_memory_kb
    );
    scratch.cleanup().await;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::verdict::ExecutionVerdict;
    use crate::testing::test_registry;

    fn engine(scratch: &std::path::Path) -> Engine {
        Engine::new(
            EngineConfig {
                scratch_root: scratch.to_path_buf(),
                evaluator_cache_dir: scratch.join("evaluators"),
                ..EngineConfig::default()
            },
            test_registry(),
        )
    }

    fn request(language: &str, source: &str) -> ExecutionRequest {
        serde_json::from_value(serde_json::json!({
            "language": language,
            "source_code": source,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_echoes_stdin() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());
        let mut req = request("shc", "cat; echo done >&2");
        req.stdin = "hello\n".into();

        let result = engine.execute(req).await.unwrap();
        assert_eq!(result.verdict, ExecutionVerdict::Ok);
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.stderr, b"done\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_binary_stdin() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());
        let mut req = request("sh", "cat");
        req.stdin = "ignored".into();
        req.stdin_base64 = Some(general_purpose::STANDARD.encode([0u8, 255u8]));

        let result = engine.execute(req).await.unwrap();
        assert_eq!(result.stdout, vec![0u8, 255u8]);

        let mut bad = request("sh", "cat");
        bad.stdin_base64 = Some("***".into());
        assert!(matches!(
            engine.execute(bad).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_compile_error_is_a_result() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());

        let result = engine.execute(request("shc", "if then (")).await.unwrap();
        assert_eq!(result.verdict, ExecutionVerdict::CompileError);
        assert!(!result.stderr.is_empty());
        assert_eq!(result.wall_duration_ms, 0);
    }

    #[tokio::test]
    async fn test_wall_limit_and_unknown_language() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(scratch.path());

        let mut req = request("sh", "echo before; sleep 5");
        req.cpu_time_limit_ms = 1000;
        req.wall_time_limit_ms = Some(300);
        let result = engine.execute(req).await.unwrap();
        assert_eq!(result.verdict, ExecutionVerdict::TimeLimitExceeded);
        assert_eq!(result.stdout, b"before\n");
        assert!(result.wall_duration_ms < 2000);

        assert!(matches!(
            engine.execute(request("brainfuck", "+")).await,
            Err(EngineError::Language(_))
        ));
    }
}
