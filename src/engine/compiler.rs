//! Compiler stage - source text to a runnable artifact
//!
//! This module provides:
//! - Compilation of user submissions into a deterministic artifact path
//! - A content-addressed cache for evaluator programs
//!
//! Interpreted languages skip the compiler entirely: the artifact is the
//! source file itself.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::languages::LanguageProfile;
use crate::core::utils::copy_dir_all;
use crate::core::verdict::{ExecutionVerdict, Verdict};
use crate::engine::config::SandboxConfig;
use crate::engine::executer::{program_env, run_supervised};
use crate::engine::process::{ProcessSpec, ResourceCeiling, Termination};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed (exit code {exit_code:?})")]
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("compilation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, stderr: String },
    #[error("failed to start compiler: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to prepare build directory: {0}")]
    Io(#[from] io::Error),
}

impl CompileError {
    /// Caused by the submission rather than the host
    pub fn is_user_error(&self) -> bool {
        matches!(self, CompileError::Failed { .. } | CompileError::Timeout { .. })
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            CompileError::Failed { .. } => Verdict::CompileError,
            CompileError::Timeout { .. } => Verdict::CompileTimeout,
            CompileError::Spawn(_) | CompileError::Io(_) => Verdict::SystemError,
        }
    }

    pub fn execution_verdict(&self) -> ExecutionVerdict {
        match self {
            CompileError::Failed { .. } => ExecutionVerdict::CompileError,
            CompileError::Timeout { .. } => ExecutionVerdict::CompileTimeout,
            CompileError::Spawn(_) | CompileError::Io(_) => ExecutionVerdict::SpawnError,
        }
    }

    /// Compiler diagnostics shown to the user
    pub fn message(&self) -> String {
        match self {
            CompileError::Failed { stdout, stderr, .. } => {
                if !stderr.trim().is_empty() {
                    stderr.clone()
                } else if !stdout.trim().is_empty() {
                    stdout.clone()
                } else {
                    self.to_string()
                }
            }
            CompileError::Timeout { stderr, .. } if !stderr.trim().is_empty() => {
                format!("{}\n{}", self, stderr)
            }
            _ => self.to_string(),
        }
    }
}

/// Runnable output of the compiler stage. `root` holds everything the program
/// needs, so copying it elsewhere relocates the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    root: PathBuf,
    relative: PathBuf,
}

impl Artifact {
    pub fn new(root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            relative: relative.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relative)
    }

    /// Directory containing the artifact (the class path for class-dir artifacts)
    pub fn dir(&self) -> PathBuf {
        self.path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn run_command(&self, profile: &LanguageProfile) -> Vec<String> {
        profile.build_run_command(&self.path(), &self.dir())
    }

    /// Copy the artifact root into `dest` and return the artifact there
    pub async fn relocate(&self, dest: &Path) -> io::Result<Artifact> {
        let src = self.root.clone();
        let dst = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(Artifact {
            root: dest.to_path_buf(),
            relative: self.relative.clone(),
        })
    }
}

/// Write `source_code` into `build_dir` and compile it.
///
/// The compiler runs in its own process group with the configured compile
/// timeout; on expiry the whole group is killed.
pub async fn compile(
    profile: &LanguageProfile,
    source_code: &str,
    build_dir: &Path,
    config: &SandboxConfig,
) -> Result<Artifact, CompileError> {
    tokio::fs::create_dir_all(build_dir).await?;
    let source_path = build_dir.join(&profile.source_file);
    tokio::fs::write(&source_path, source_code).await?;

    let artifact = Artifact::new(build_dir, profile.artifact_relative_path());

    let Some(command) = profile.build_compile_command(&source_path, build_dir) else {
        return Ok(artifact);
    };

    debug!("Compiling {} with {:?}", profile.id, command);

    let address_space_kb = profile
        .limit_address_space
        .then_some(config.compile_memory_limit_mb * 1024);
    let spec = ProcessSpec::new(build_dir)
        .with_command(command)
        .with_env(program_env(profile, config))
        .with_ceiling(ResourceCeiling {
            cpu_time_ms: None,
            address_space_kb,
            file_size_kb: Some(config.file_size_limit_kb),
        });

    let run = run_supervised(&spec, b"", config.compile_timeout(), None, config)
        .await
        .map_err(CompileError::Spawn)?;

    let stdout = String::from_utf8_lossy(&run.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&run.stderr).into_owned();

    if run.supervision.termination == Termination::TimedOut {
        return Err(CompileError::Timeout {
            timeout_ms: config.compile_time_limit_ms,
            stderr,
        });
    }

    if !run.supervision.success() {
        return Err(CompileError::Failed {
            exit_code: run.supervision.exit_code(),
            stdout,
            stderr,
        });
    }

    if !tokio::fs::try_exists(artifact.path()).await.unwrap_or(false) {
        return Err(CompileError::Failed {
            exit_code: run.supervision.exit_code(),
            stdout,
            stderr: format!(
                "{}compiler did not produce {:?}",
                stderr,
                profile.artifact_relative_path()
            ),
        });
    }

    debug!(
        "Compiled {} in {}ms",
        profile.id,
        run.supervision.wall.as_millis()
    );
    Ok(artifact)
}

/// Compiled evaluators keyed by the hash of language and source.
/// Compiles are serialized; cached entries are never rewritten.
pub struct EvaluatorCache {
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl EvaluatorCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Get a compiled evaluator, compiling it on first use
    pub async fn get_or_compile(
        &self,
        profile: &LanguageProfile,
        source_code: &str,
        config: &SandboxConfig,
    ) -> Result<Artifact, CompileError> {
        let key = cache_key(&profile.id, source_code);
        let dir = self.cache_dir.join(format!("evaluator_{}", &key[..16]));
        let marker = dir.join(".compiled");

        let _guard = self.lock.lock().await;

        let cached = Artifact::new(&dir, profile.artifact_relative_path());
        let marker_matches = tokio::fs::read_to_string(&marker)
            .await
            .map(|content| content == key)
            .unwrap_or(false);
        if marker_matches && tokio::fs::try_exists(cached.path()).await.unwrap_or(false) {
            debug!("Using cached evaluator {:?}", dir);
            return Ok(cached);
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CompileError::Io(e)),
        }

        info!("Compiling evaluator ({}) into {:?}", profile.id, dir);
        let artifact = compile(profile, source_code, &dir, config).await?;
        tokio::fs::write(&marker, &key).await?;

        Ok(artifact)
    }
}

fn cache_key(language: &str, source_code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_code.as_bytes());
    format!("{:x}", hasher.finalize())
}
