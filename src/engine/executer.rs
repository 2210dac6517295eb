//! Sandbox runner - executes one artifact under limits
//!
//! The runner never fails because of what the user program does: every
//! outcome, including a program that cannot be started, becomes an
//! `ExecutionResult` with a verdict.

use std::io;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::languages::LanguageProfile;
use crate::core::utils::base64_bytes;
use crate::core::verdict::ExecutionVerdict;
use crate::engine::compiler::Artifact;
use crate::engine::config::SandboxConfig;
use crate::engine::process::{
    self, feed_stdin, signal_name, supervise, MemoryMonitor, OutputCapture, ProcessSpec,
    ResourceCeiling, Supervision, Termination,
};

/// A SIGKILL this close to the CPU budget is the RLIMIT_CPU hard limit
const CPU_KILL_EPSILON_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// CPU budget, enforced by RLIMIT_CPU
    pub cpu_time_ms: u32,
    /// Wall-clock budget, enforced by the supervisor
    pub wall_time_ms: u32,
    pub memory_limit_kb: u64,
}

impl ExecutionLimits {
    /// Limits with the wall-clock budget equal to the CPU budget
    pub fn new(cpu_time_ms: u32, memory_limit_kb: u64) -> Self {
        Self {
            cpu_time_ms,
            wall_time_ms: cpu_time_ms,
            memory_limit_kb,
        }
    }

    pub fn with_wall_time(mut self, wall_time_ms: u32) -> Self {
        self.wall_time_ms = wall_time_ms;
        self
    }
}

/// Outcome of executing a program once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_duration_ms: u64,
    pub peak_memory_kb: u64,
    pub verdict: ExecutionVerdict,
}

impl ExecutionResult {
    /// Result for a program that never ran
    pub fn not_run(verdict: ExecutionVerdict, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: None,
            signal: None,
            wall_duration_ms: 0,
            peak_memory_kb: 0,
            verdict,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.verdict == ExecutionVerdict::Ok
    }
}

/// Output of one supervised process, not yet classified
#[derive(Debug)]
pub struct RawRun {
    pub supervision: Supervision,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Spawn, feed stdin, capture both streams and supervise until termination.
/// Only a failure to start the process is an error.
pub async fn run_supervised(
    spec: &ProcessSpec,
    stdin: &[u8],
    wall_limit: Duration,
    monitor: Option<MemoryMonitor>,
    config: &SandboxConfig,
) -> io::Result<RawRun> {
    let mut spawned = process::spawn(spec)?;

    let stdout = spawned
        .child
        .stdout
        .take()
        .map(|pipe| OutputCapture::start(pipe, config.max_output_bytes));
    let stderr = spawned
        .child
        .stderr
        .take()
        .map(|pipe| OutputCapture::start(pipe, config.max_output_bytes));
    let feeder = spawned
        .child
        .stdin
        .take()
        .map(|pipe| feed_stdin(pipe, stdin.to_vec()));

    let supervision = supervise(&mut spawned.child, spawned.group, wall_limit, monitor).await;

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    let grace = config.drain_grace();
    let stdout = match stdout {
        Some(capture) => capture.finish(grace).await,
        None => Vec::new(),
    };
    let stderr = match stderr {
        Some(capture) => capture.finish(grace).await,
        None => Vec::new(),
    };

    Ok(RawRun {
        supervision,
        stdout,
        stderr,
    })
}

/// Environment for a spawned program: configured `PATH`, then profile additions
pub fn program_env(profile: &LanguageProfile, config: &SandboxConfig) -> Vec<(String, String)> {
    let mut env = vec![("PATH".to_string(), config.path.clone())];
    env.extend(profile.env.iter().cloned());
    env
}

/// Process spec for running `artifact` under `limits` inside `work_dir`
pub fn run_spec(
    profile: &LanguageProfile,
    artifact: &Artifact,
    limits: &ExecutionLimits,
    work_dir: &Path,
    config: &SandboxConfig,
) -> ProcessSpec {
    let address_space_kb = profile
        .limit_address_space
        .then(|| config.address_space_kb(limits.memory_limit_kb));

    ProcessSpec::new(work_dir)
        .with_command(artifact.run_command(profile))
        .with_env(program_env(profile, config))
        .with_ceiling(ResourceCeiling {
            cpu_time_ms: Some(limits.cpu_time_ms as u64),
            address_space_kb,
            file_size_kb: Some(config.file_size_limit_kb),
        })
}

/// Execute an artifact once with the given stdin and limits
pub async fn execute(
    profile: &LanguageProfile,
    artifact: &Artifact,
    stdin: &[u8],
    limits: &ExecutionLimits,
    work_dir: &Path,
    config: &SandboxConfig,
) -> ExecutionResult {
    let spec = run_spec(profile, artifact, limits, work_dir, config);
    let monitor = MemoryMonitor {
        limit_kb: limits.memory_limit_kb,
        interval: config.memory_poll_interval(),
    };
    let wall_limit = Duration::from_millis(limits.wall_time_ms as u64);

    let run = match run_supervised(&spec, stdin, wall_limit, Some(monitor), config).await {
        Ok(run) => run,
        Err(e) => {
            debug!("Failed to spawn {:?}: {}", spec.argv, e);
            return ExecutionResult::not_run(
                ExecutionVerdict::SpawnError,
                Vec::new(),
                e.to_string().into_bytes(),
            );
        }
    };

    let RawRun {
        supervision,
        stdout,
        mut stderr,
    } = run;
    let verdict = classify(&supervision, limits, &mut stderr);

    debug!(
        "Execution finished: verdict={}, wall={}ms, memory={}KB, status={:?}",
        verdict,
        supervision.wall.as_millis(),
        supervision.peak_memory_kb,
        supervision.status
    );

    ExecutionResult {
        stdout,
        stderr,
        exit_code: supervision.exit_code(),
        signal: supervision.signal(),
        wall_duration_ms: supervision.wall.as_millis() as u64,
        peak_memory_kb: supervision.peak_memory_kb,
        verdict,
    }
}

/// Map a supervised run onto a verdict, in priority order: wall timer, memory
/// poller, CPU rlimit signals, crashes and non-zero exits, other signals.
/// Memory is judged only through `Termination::MemoryExceeded`: the
/// supervisor kills on the first sample over the limit.
pub fn classify(
    run: &Supervision,
    limits: &ExecutionLimits,
    stderr: &mut Vec<u8>,
) -> ExecutionVerdict {
    match run.termination {
        Termination::TimedOut => ExecutionVerdict::TimeLimitExceeded,
        Termination::MemoryExceeded => ExecutionVerdict::MemoryLimitExceeded,
        Termination::Exited => match (run.signal(), run.exit_code()) {
            (Some(sig), _) if sig == Signal::SIGXCPU as i32 => ExecutionVerdict::TimeLimitExceeded,
            (Some(sig), _)
                if sig == Signal::SIGKILL as i32
                    && run.wall.as_millis() as u64 + CPU_KILL_EPSILON_MS
                        >= limits.cpu_time_ms as u64 =>
            {
                ExecutionVerdict::TimeLimitExceeded
            }
            (Some(sig), _) if sig == Signal::SIGSEGV as i32 || sig == Signal::SIGBUS as i32 => {
                ExecutionVerdict::RuntimeError
            }
            (Some(sig), _) => {
                stderr.extend_from_slice(
                    format!("\nProcess terminated by signal: {}", signal_name(sig)).as_bytes(),
                );
                ExecutionVerdict::RuntimeError
            }
            (None, Some(0)) => ExecutionVerdict::Ok,
            (None, _) => ExecutionVerdict::RuntimeError,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sh_artifact, test_registry};
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    async fn run_script(script: &str, limits: ExecutionLimits, stdin: &[u8]) -> ExecutionResult {
        let registry = test_registry();
        let profile = registry.resolve("sh").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artifact = sh_artifact(dir.path(), script);
        execute(
            &profile,
            &artifact,
            stdin,
            &limits,
            dir.path(),
            &SandboxConfig::default(),
        )
        .await
    }

    fn supervision(termination: Termination, raw_status: i32, wall_ms: u64, peak: u64) -> Supervision {
        Supervision {
            termination,
            status: Some(ExitStatus::from_raw(raw_status)),
            wall: Duration::from_millis(wall_ms),
            peak_memory_kb: peak,
        }
    }

    #[tokio::test]
    async fn test_echo_stdin() {
        let limits = ExecutionLimits::new(2000, 64 * 1024);
        let result = run_script("read line; printf 'got:%s' \"$line\"", limits, b"42\n").await;

        assert_eq!(result.verdict, ExecutionVerdict::Ok);
        assert_eq!(result.stdout, b"got:42");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.signal, None);
    }

    #[tokio::test]
    async fn test_repeated_runs_are_stable() {
        let limits = ExecutionLimits::new(2000, 64 * 1024);
        let first = run_script("echo stable", limits, b"").await;
        let second = run_script("echo stable", limits, b"").await;
        assert_eq!(first.verdict, ExecutionVerdict::Ok);
        assert_eq!(first.stdout, second.stdout);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let limits = ExecutionLimits::new(2000, 64 * 1024);
        let result = run_script("echo partial; exit 3", limits, b"").await;

        assert_eq!(result.verdict, ExecutionVerdict::RuntimeError);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, b"partial\n");
    }

    #[tokio::test]
    async fn test_signal_note_is_appended() {
        let limits = ExecutionLimits::new(2000, 64 * 1024);
        let result = run_script("kill -USR1 $$", limits, b"").await;

        assert_eq!(result.verdict, ExecutionVerdict::RuntimeError);
        assert_eq!(result.signal, Some(Signal::SIGUSR1 as i32));
        let stderr = String::from_utf8_lossy(&result.stderr);
        assert!(stderr.ends_with("Process terminated by signal: SIGUSR1"));
    }

    #[tokio::test]
    async fn test_wall_timeout() {
        let limits = ExecutionLimits::new(1000, 64 * 1024);
        let result = run_script("echo before; sleep 4", limits, b"").await;

        assert_eq!(result.verdict, ExecutionVerdict::TimeLimitExceeded);
        assert!(result.wall_duration_ms >= 1000 - CPU_KILL_EPSILON_MS);
        assert!(result.wall_duration_ms < 3000);
        assert_eq!(result.stdout, b"before\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_limit() {
        let registry = test_registry();
        // no address-space ceiling, so only the poller can catch it
        let profile = registry.resolve("sh-unbounded").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artifact = sh_artifact(
            dir.path(),
            "x=$(head -c 80000000 /dev/zero | tr '\\0' a); sleep 10",
        );
        let limits = ExecutionLimits::new(8000, 20 * 1024);

        let result = execute(
            &profile,
            &artifact,
            b"",
            &limits,
            dir.path(),
            &SandboxConfig::default(),
        )
        .await;

        assert_eq!(result.verdict, ExecutionVerdict::MemoryLimitExceeded);
        assert!(result.peak_memory_kb > limits.memory_limit_kb);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let registry = test_registry();
        let profile = registry.resolve("missing").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let artifact = sh_artifact(dir.path(), "echo unreachable");

        let result = execute(
            &profile,
            &artifact,
            b"",
            &ExecutionLimits::new(1000, 64 * 1024),
            dir.path(),
            &SandboxConfig::default(),
        )
        .await;

        assert_eq!(result.verdict, ExecutionVerdict::SpawnError);
        assert!(!result.stderr.is_empty());
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn test_classify_priority() {
        let limits = ExecutionLimits::new(1000, 1024);
        let mut stderr = Vec::new();

        // wall timer wins over a sampled peak above the limit
        let run = supervision(Termination::TimedOut, 9, 1000, 4096);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::TimeLimitExceeded
        );

        let run = supervision(Termination::MemoryExceeded, 9, 10, 4096);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::MemoryLimitExceeded
        );

        // SIGXCPU
        let run = supervision(Termination::Exited, Signal::SIGXCPU as i32, 1000, 0);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::TimeLimitExceeded
        );

        // SIGKILL at the CPU budget is the hard rlimit
        let run = supervision(Termination::Exited, 9, 950, 0);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::TimeLimitExceeded
        );
        assert!(stderr.is_empty());

        // SIGKILL early is an external kill
        let run = supervision(Termination::Exited, 9, 10, 0);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::RuntimeError
        );
        assert!(String::from_utf8_lossy(&stderr).contains("SIGKILL"));

        // SIGSEGV carries no note
        let mut stderr = Vec::new();
        let run = supervision(Termination::Exited, Signal::SIGSEGV as i32, 10, 0);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::RuntimeError
        );
        assert!(stderr.is_empty());

        // the memory verdict comes from the supervisor alone; a peak it
        // reports on a clean exit is informational
        let run = supervision(Termination::Exited, 0, 10, 2048);
        assert_eq!(classify(&run, &limits, &mut stderr), ExecutionVerdict::Ok);

        let run = supervision(Termination::Exited, 0, 10, 512);
        assert_eq!(classify(&run, &limits, &mut stderr), ExecutionVerdict::Ok);

        // exit code 2 is raw status 0x200
        let run = supervision(Termination::Exited, 2 << 8, 10, 512);
        assert_eq!(
            classify(&run, &limits, &mut stderr),
            ExecutionVerdict::RuntimeError
        );
    }

    #[test]
    fn test_result_serializes_bytes_as_base64() {
        let result = ExecutionResult::not_run(ExecutionVerdict::SpawnError, b"hi".to_vec(), Vec::new());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stdout"], "aGk=");
        assert_eq!(json["verdict"], "spawn_error");
    }
}
