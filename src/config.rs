//! Engine configuration
//!
//! Loaded from the environment (after `.env`) at startup; the binary lets CLI
//! flags override individual values.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::debug;

use crate::engine::config::SandboxConfig;

pub const DEFAULT_OUTPUT_PREVIEW_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sandbox: SandboxConfig,
    /// Language table to load instead of the built-in one
    pub languages_config: Option<PathBuf>,
    /// Parent of all per-job scratch directories
    pub scratch_root: PathBuf,
    /// Compiled evaluators, kept across jobs
    pub evaluator_cache_dir: PathBuf,
    /// Test cases run at the same time, across all jobs
    pub max_parallel: usize,
    /// Characters of program output kept in verdicts
    pub output_preview_chars: usize,
}

/// Half the CPUs, at least one
pub fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        let scratch_root = std::env::temp_dir().join("judge-engine");
        Self {
            sandbox: SandboxConfig::default(),
            languages_config: None,
            evaluator_cache_dir: scratch_root.join("evaluators"),
            scratch_root,
            max_parallel: default_max_parallel(),
            output_preview_chars: DEFAULT_OUTPUT_PREVIEW_CHARS,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", name, value))
        })
        .transpose()
}

impl EngineConfig {
    /// Defaults overridden by `JUDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_var("JUDGE_LANGUAGES_CONFIG") {
            config.languages_config = Some(PathBuf::from(path));
        }
        if let Some(root) = env_var("JUDGE_SCRATCH_ROOT") {
            config.scratch_root = PathBuf::from(root);
            config.evaluator_cache_dir = config.scratch_root.join("evaluators");
        }
        if let Some(dir) = env_var("JUDGE_EVALUATOR_CACHE_DIR") {
            config.evaluator_cache_dir = PathBuf::from(dir);
        }
        if let Some(n) = parse_env::<usize>("JUDGE_MAX_PARALLEL")? {
            config.max_parallel = n.max(1);
        }
        if let Some(n) = parse_env("JUDGE_OUTPUT_PREVIEW_CHARS")? {
            config.output_preview_chars = n;
        }

        let sandbox = &mut config.sandbox;
        if let Some(ms) = parse_env("JUDGE_COMPILE_TIMEOUT_MS")? {
            sandbox.compile_time_limit_ms = ms;
        }
        if let Some(ms) = parse_env("JUDGE_EVALUATOR_TIMEOUT_MS")? {
            sandbox.evaluator_timeout_ms = ms;
        }
        if let Some(ms) = parse_env("JUDGE_MEMORY_POLL_INTERVAL_MS")? {
            sandbox.memory_poll_interval_ms = ms;
        }
        if let Some(bytes) = parse_env("JUDGE_MAX_OUTPUT_BYTES")? {
            sandbox.max_output_bytes = bytes;
        }
        if let Some(factor) = parse_env("JUDGE_ADDRESS_SPACE_FACTOR")? {
            sandbox.address_space_factor = factor;
        }

        debug!("Engine config: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment is process-global: one test touches it, and only with
    // variables nothing else reads.
    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("JUDGE_MAX_PARALLEL", "3");
        std::env::set_var("JUDGE_SCRATCH_ROOT", "/tmp/judge-test-root");
        std::env::set_var("JUDGE_MAX_OUTPUT_BYTES", "1024");
        std::env::set_var("JUDGE_EVALUATOR_TIMEOUT_MS", " ");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.scratch_root, PathBuf::from("/tmp/judge-test-root"));
        assert_eq!(
            config.evaluator_cache_dir,
            PathBuf::from("/tmp/judge-test-root/evaluators")
        );
        assert_eq!(config.sandbox.max_output_bytes, 1024);
        assert_eq!(config.sandbox.evaluator_timeout_ms, 10_000);

        std::env::set_var("JUDGE_MAX_PARALLEL", "many");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("JUDGE_MAX_PARALLEL"));

        for name in [
            "JUDGE_MAX_PARALLEL",
            "JUDGE_SCRATCH_ROOT",
            "JUDGE_MAX_OUTPUT_BYTES",
            "JUDGE_EVALUATOR_TIMEOUT_MS",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_parallel >= 1);
        assert_eq!(config.output_preview_chars, DEFAULT_OUTPUT_PREVIEW_CHARS);
        assert!(config.evaluator_cache_dir.starts_with(&config.scratch_root));
    }
}
