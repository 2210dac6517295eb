//! Process supervision - spawning and containing one program
//!
//! Every program the engine starts (compiler, user solution, evaluator) goes
//! through this module:
//! - Spawned from an argv in its own process group, never through a shell
//! - Cleaned environment (`PATH`, `HOME`, `LANG` plus explicit additions)
//! - rlimits applied between fork and exec
//! - Wall-clock deadline and optional RSS polling, both killing the whole group
//!
//! This module does NOT:
//! - Decide verdicts
//! - Know about languages, problems or scoring

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::memory;

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const READ_CHUNK_SIZE: usize = 8192;

/// OS-level ceilings applied with setrlimit before exec
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCeiling {
    pub cpu_time_ms: Option<u64>,
    pub address_space_kb: Option<u64>,
    pub file_size_kb: Option<u64>,
}

impl ResourceCeiling {
    /// Runs in the forked child: no allocation, no locks.
    fn apply(&self) -> nix::Result<()> {
        if let Some(cpu_ms) = self.cpu_time_ms {
            // SIGXCPU at the soft limit, SIGKILL one second later
            let soft = cpu_ms.div_ceil(1000).max(1);
            setrlimit(Resource::RLIMIT_CPU, soft, soft + 1)?;
        }
        if let Some(kb) = self.address_space_kb {
            let bytes = kb.saturating_mul(1024);
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(kb) = self.file_size_kb {
            let bytes = kb.saturating_mul(1024);
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// Description of a process to spawn
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub ceiling: ResourceCeiling,
}

impl ProcessSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv: vec![],
            work_dir: work_dir.into(),
            env: vec![],
            ceiling: ResourceCeiling::default(),
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.argv = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_ceiling(mut self, ceiling: ResourceCeiling) -> Self {
        self.ceiling = ceiling;
        self
    }
}

/// Handle on a whole process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup(Pid);

impl ProcessGroup {
    pub fn id(&self) -> i32 {
        self.0.as_raw()
    }

    /// SIGKILL every process in the group. Idempotent.
    pub fn kill(&self) {
        match killpg(self.0, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            // macOS reports EPERM when only zombies remain
            Err(Errno::EPERM) => debug!("killpg({}) returned EPERM", self.id()),
            Err(e) => warn!("Failed to kill process group {}: {}", self.id(), e),
        }
    }
}

/// A freshly spawned child and its process group
pub struct SpawnedProcess {
    pub child: Child,
    pub group: ProcessGroup,
}

/// Spawn a process with all three standard streams piped
pub fn spawn(spec: &ProcessSpec) -> io::Result<SpawnedProcess> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    debug!(
        "Spawning {:?} in {:?} with {:?}",
        spec.argv, spec.work_dir, spec.ceiling
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.work_dir)
        .env_clear()
        .env("PATH", DEFAULT_PATH)
        .env("HOME", &spec.work_dir)
        .env("LANG", "C.UTF-8")
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let ceiling = spec.ceiling;
    // SAFETY: the closure only issues setrlimit syscalls on values copied in
    // before the fork; it does not allocate or take locks.
    unsafe {
        cmd.pre_exec(move || ceiling.apply().map_err(io::Error::from));
    }

    let child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before pid was read"))?;

    Ok(SpawnedProcess {
        child,
        group: ProcessGroup(Pid::from_raw(pid as i32)),
    })
}

/// RSS polling configuration
#[derive(Debug, Clone, Copy)]
pub struct MemoryMonitor {
    pub limit_kb: u64,
    pub interval: Duration,
}

/// How a supervised process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    MemoryExceeded,
}

#[derive(Debug, Clone)]
pub struct Supervision {
    pub termination: Termination,
    /// None if waiting on the child failed
    pub status: Option<ExitStatus>,
    pub wall: Duration,
    pub peak_memory_kb: u64,
}

impl Supervision {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code() == Some(0)
    }
}

/// Wait for the child while enforcing the wall deadline and, if given, the
/// memory monitor. Exactly one termination is recorded: whichever of exit,
/// deadline or memory breach is observed first.
///
/// The group is killed once more after the leader is reaped so that no
/// descendant outlives its test case.
pub async fn supervise(
    child: &mut Child,
    group: ProcessGroup,
    wall_limit: Duration,
    monitor: Option<MemoryMonitor>,
) -> Supervision {
    let started = Instant::now();
    let deadline = started + wall_limit;
    let mut ticker = monitor.map(|m| {
        let mut ticker = interval(m.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    let mut peak_memory_kb = 0;
    let mut termination = Termination::Exited;

    let status = loop {
        tokio::select! {
            biased;
            status = child.wait() => break status.ok(),
            _ = sleep_until(deadline) => {
                termination = Termination::TimedOut;
                break kill_and_reap(child, group).await;
            }
            _ = next_tick(&mut ticker) => {
                let pgid = group.id();
                let sample = tokio::task::spawn_blocking(move || memory::group_rss_kb(pgid))
                    .await
                    .unwrap_or(0);
                peak_memory_kb = peak_memory_kb.max(sample);
                if let Some(monitor) = monitor {
                    if sample > monitor.limit_kb {
                        debug!(
                            "Process group {} exceeded memory: {}KB > {}KB",
                            pgid, sample, monitor.limit_kb
                        );
                        termination = Termination::MemoryExceeded;
                        break kill_and_reap(child, group).await;
                    }
                }
            }
        }
    };

    let wall = started.elapsed();
    group.kill();

    Supervision {
        termination,
        status,
        wall,
        peak_memory_kb,
    }
}

async fn kill_and_reap(child: &mut Child, group: ProcessGroup) -> Option<ExitStatus> {
    group.kill();
    child.wait().await.ok()
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background reader collecting a stream up to a byte cap. Output past the cap
/// is read and discarded so the writer never blocks on a full pipe.
pub struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl OutputCapture {
    pub fn start<R>(mut reader: R, max_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let handle = tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                        let room = max_bytes.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        });
        Self { buffer, handle }
    }

    /// Wait up to `grace` for end of stream, then return whatever was read
    pub async fn finish(self, grace: Duration) -> Vec<u8> {
        let OutputCapture { buffer, mut handle } = self;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
        }
        let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }
}

/// Write `data` to the child's stdin from a separate task, then close it.
/// A child that exits without reading its input is not an error.
pub fn feed_stdin(mut stdin: ChildStdin, data: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&data).await {
            if e.kind() != io::ErrorKind::BrokenPipe {
                debug!("Failed to write stdin: {}", e);
            }
        }
        let _ = stdin.shutdown().await;
    })
}

/// Conventional signal name, e.g. `SIGSEGV`
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new(std::env::temp_dir()).with_command(["sh", "-c", script])
    }

    #[tokio::test]
    async fn test_exit_status_and_output() {
        let mut process = spawn(&sh("printf hello; printf oops >&2; exit 3")).unwrap();
        let stdout = OutputCapture::start(process.child.stdout.take().unwrap(), 1024);
        let stderr = OutputCapture::start(process.child.stderr.take().unwrap(), 1024);

        let result = supervise(
            &mut process.child,
            process.group,
            Duration::from_secs(5),
            None,
        )
        .await;

        assert_eq!(result.termination, Termination::Exited);
        assert_eq!(result.exit_code(), Some(3));
        assert!(!result.success());
        assert_eq!(stdout.finish(Duration::from_secs(1)).await, b"hello");
        assert_eq!(stderr.finish(Duration::from_secs(1)).await, b"oops");
    }

    #[tokio::test]
    async fn test_deadline_kills_group() {
        let started = std::time::Instant::now();
        // the background sleep keeps stdout open unless the whole group dies
        let mut process = spawn(&sh("sleep 30 & echo started; sleep 30")).unwrap();
        let stdout = OutputCapture::start(process.child.stdout.take().unwrap(), 1024);

        let result = supervise(
            &mut process.child,
            process.group,
            Duration::from_millis(300),
            None,
        )
        .await;
        let output = stdout.finish(Duration::from_secs(10)).await;

        assert_eq!(result.termination, Termination::TimedOut);
        assert_eq!(result.signal(), Some(Signal::SIGKILL as i32));
        assert!(result.wall >= Duration::from_millis(300));
        assert_eq!(output, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stdin_is_fed_and_closed() {
        let mut process = spawn(&sh("cat")).unwrap();
        feed_stdin(process.child.stdin.take().unwrap(), b"line\n".to_vec());
        let stdout = OutputCapture::start(process.child.stdout.take().unwrap(), 1024);

        let result = supervise(
            &mut process.child,
            process.group,
            Duration::from_secs(5),
            None,
        )
        .await;

        assert!(result.success());
        assert_eq!(stdout.finish(Duration::from_secs(1)).await, b"line\n");
    }

    #[tokio::test]
    async fn test_output_cap() {
        let mut process = spawn(&sh("head -c 100000 /dev/zero")).unwrap();
        let stdout = OutputCapture::start(process.child.stdout.take().unwrap(), 1000);

        let result = supervise(
            &mut process.child,
            process.group,
            Duration::from_secs(5),
            None,
        )
        .await;

        assert!(result.success());
        assert_eq!(stdout.finish(Duration::from_secs(1)).await.len(), 1000);
    }

    #[tokio::test]
    async fn test_cpu_ceiling_raises_sigxcpu() {
        let spec = sh("while :; do :; done").with_ceiling(ResourceCeiling {
            cpu_time_ms: Some(1000),
            ..Default::default()
        });
        let mut process = spawn(&spec).unwrap();

        let result = supervise(
            &mut process.child,
            process.group,
            Duration::from_secs(10),
            None,
        )
        .await;

        assert_eq!(result.termination, Termination::Exited);
        assert_eq!(result.signal(), Some(Signal::SIGXCPU as i32));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let err = spawn(&ProcessSpec::new(std::env::temp_dir())).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(11), "SIGSEGV");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(1000), "SIG1000");
    }
}
