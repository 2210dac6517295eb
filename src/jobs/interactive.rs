//! Interactive session coordinator
//!
//! The user program and the evaluator run concurrently, each in its own
//! process group, and talk through the coordinator:
//! - user stdout is recorded and forwarded to the evaluator's stdin
//! - evaluator stdout is recorded, scanned for the accept/reject marker and,
//!   when no marker is present, forwarded to the user's stdin
//! - stderr of either side is recorded, never forwarded
//! - each stdout stream is capped at `max_output_bytes`; a side writing more
//!   loses the session, so the transcript and relay queues stay bounded
//!
//! All process activity arrives as `SessionEvent`s on one channel and is
//! handled by a single loop, so the first terminal condition wins and later
//! events cannot change the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::core::languages::LanguageProfile;
use crate::core::problem::{EvaluatorExitPolicy, InteractiveSpec, Markers};
use crate::core::utils::base64_bytes;
use crate::core::verdict::{ExecutionVerdict, Verdict};
use crate::engine::compiler::{self, Artifact};
use crate::engine::config::SandboxConfig;
use crate::engine::executer::{classify, program_env, run_spec, ExecutionLimits};
use crate::engine::process::{
    self, MemoryMonitor, ProcessGroup, ProcessSpec, ResourceCeiling, Supervision, Termination,
};

use super::{Engine, EngineError};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    User,
    Evaluator,
    UserStderr,
    EvaluatorStderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub source: TranscriptSource,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Milliseconds since the session started
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionReport {
    pub status: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(with = "base64_bytes")]
    pub user_stderr: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub evaluator_stderr: Vec<u8>,
    pub user_wall_ms: u64,
    pub user_peak_memory_kb: u64,
}

impl InteractionReport {
    /// Report for a session that ended before any process was started
    pub fn without_session(status: Verdict, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            transcript: Vec::new(),
            user_stderr: Vec::new(),
            evaluator_stderr: Vec::new(),
            user_wall_ms: 0,
            user_peak_memory_kb: 0,
        }
    }

    /// Everything the user program wrote to stdout, in order
    pub fn user_output(&self) -> Vec<u8> {
        self.transcript
            .iter()
            .filter(|entry| entry.source == TranscriptSource::User)
            .flat_map(|entry| entry.bytes.iter().copied())
            .collect()
    }
}

/// Standalone interactive run: compile, then one session against `reference`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveRequest {
    pub language: String,
    pub source_code: String,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u32,
    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,
    #[serde(default)]
    pub ignore_limit_bonus: bool,
    pub interactive: InteractiveSpec,
    pub reference: PathBuf,
    /// Base directory for relative evaluator and reference paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

fn default_time_limit_ms() -> u32 {
    crate::core::problem::DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_kb() -> u64 {
    crate::core::problem::DEFAULT_MEMORY_LIMIT_KB
}

/// Result of scanning evaluator output for a marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerHit {
    pub accepted: bool,
    pub message: String,
}

/// Finds the accept/reject marker in evaluator output, including markers
/// split across chunk boundaries.
#[derive(Debug)]
pub struct MarkerScanner {
    accept: Vec<u8>,
    reject: Vec<u8>,
    pending: Vec<u8>,
}

impl MarkerScanner {
    pub fn new(markers: &Markers) -> Self {
        Self {
            accept: markers.accept.as_bytes().to_vec(),
            reject: markers.reject.as_bytes().to_vec(),
            pending: Vec::new(),
        }
    }

    /// Feed one chunk. On a hit the message is the trimmed text after the marker.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<MarkerHit> {
        self.pending.extend_from_slice(chunk);

        let hit = [(&self.accept, true), (&self.reject, false)]
            .into_iter()
            .filter(|(marker, _)| !marker.is_empty())
            .filter_map(|(marker, accepted)| {
                find(&self.pending, marker).map(|pos| (pos, marker.len(), accepted))
            })
            .min_by_key(|(pos, _, _)| *pos);

        if let Some((pos, len, accepted)) = hit {
            let message = String::from_utf8_lossy(&self.pending[pos + len..])
                .trim()
                .to_string();
            return Some(MarkerHit { accepted, message });
        }

        // only a marker prefix can still become a hit
        let keep = self.accept.len().max(self.reject.len()).saturating_sub(1);
        if self.pending.len() > keep {
            self.pending.drain(..self.pending.len() - keep);
        }
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Everything one interactive session needs, already compiled
pub struct InteractiveSession {
    pub user_profile: Arc<LanguageProfile>,
    pub user_artifact: Artifact,
    pub user_limits: ExecutionLimits,
    pub evaluator_profile: Arc<LanguageProfile>,
    pub evaluator_artifact: Artifact,
    pub evaluator_timeout: Duration,
    pub reference: PathBuf,
    pub markers: Markers,
    pub on_evaluator_exit: EvaluatorExitPolicy,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    User,
    Evaluator,
}

#[derive(Debug)]
enum SessionEvent {
    Stdout(Side, Vec<u8>),
    Stderr(Side, Vec<u8>),
    StdoutClosed(Side),
    Finished(Side, Supervision),
}

/// Mutable state of a running session, owned by the event loop
struct SessionState {
    started: Instant,
    outcome: Option<(Verdict, Option<String>)>,
    transcript: Vec<TranscriptEntry>,
    user_stderr: Vec<u8>,
    evaluator_stderr: Vec<u8>,
    /// Per-stream byte cap; also bounds the transcript and each relay queue
    output_cap: usize,
    transcript_bytes: usize,
    user_stdout_bytes: usize,
    evaluator_stdout_bytes: usize,
    user_done: Option<Supervision>,
    evaluator_done: Option<Supervision>,
    user_stdout_closed: bool,
    evaluator_stdout_closed: bool,
}

impl SessionState {
    fn record(&mut self, source: TranscriptSource, bytes: &[u8]) {
        let room = self.output_cap.saturating_sub(self.transcript_bytes);
        if self.outcome.is_some() || room == 0 {
            return;
        }
        let bytes = &bytes[..bytes.len().min(room)];
        self.transcript_bytes += bytes.len();
        self.transcript.push(TranscriptEntry {
            source,
            bytes: bytes.to_vec(),
            timestamp_ms: self.started.elapsed().as_millis() as u64,
        });
    }

    /// Count relayed stdout bytes; past the cap the side is cut off
    fn over_output_cap(&mut self, side: Side, len: usize) -> bool {
        let total = match side {
            Side::User => &mut self.user_stdout_bytes,
            Side::Evaluator => &mut self.evaluator_stdout_bytes,
        };
        *total += len;
        *total > self.output_cap
    }

    fn resolve(&mut self, status: Verdict, message: Option<String>) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        debug!("Interactive session resolved: {} {:?}", status, message);
        self.outcome = Some((status, message));
        true
    }
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    let room = cap.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

impl InteractiveSession {
    /// Run both programs inside `work_dir` until the session resolves
    pub async fn run(self, work_dir: &Path, config: &SandboxConfig) -> InteractionReport {
        let mut tasks = JoinSet::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let user_spec = run_spec(
            &self.user_profile,
            &self.user_artifact,
            &self.user_limits,
            work_dir,
            config,
        );
        let user_monitor = MemoryMonitor {
            limit_kb: self.user_limits.memory_limit_kb,
            interval: config.memory_poll_interval(),
        };
        let user_wall = Duration::from_millis(self.user_limits.wall_time_ms as u64);

        let (user_group, user_stdin) = match start_side(
            &mut tasks,
            &events_tx,
            Side::User,
            &user_spec,
            user_wall,
            Some(user_monitor),
        ) {
            Ok(started) => started,
            Err(e) => {
                warn!("Failed to start user program: {}", e);
                return InteractionReport::without_session(
                    Verdict::InternalError,
                    format!("failed to start user program: {}", e),
                );
            }
        };

        let evaluator_spec = self.evaluator_spec(work_dir, config);
        let (evaluator_group, evaluator_stdin) = match start_side(
            &mut tasks,
            &events_tx,
            Side::Evaluator,
            &evaluator_spec,
            self.evaluator_timeout,
            None,
        ) {
            Ok(started) => started,
            Err(e) => {
                warn!("Failed to start evaluator: {}", e);
                user_group.kill();
                tasks.shutdown().await;
                return InteractionReport::without_session(
                    Verdict::InternalError,
                    format!("failed to start evaluator: {}", e),
                );
            }
        };
        drop(events_tx);

        let mut to_evaluator = Some(spawn_writer(&mut tasks, evaluator_stdin));
        let mut to_user = Some(spawn_writer(&mut tasks, user_stdin));
        let mut scanner = MarkerScanner::new(&self.markers);

        let mut state = SessionState {
            started: Instant::now(),
            outcome: None,
            transcript: Vec::new(),
            user_stderr: Vec::new(),
            evaluator_stderr: Vec::new(),
            output_cap: config.max_output_bytes,
            transcript_bytes: 0,
            user_stdout_bytes: 0,
            evaluator_stdout_bytes: 0,
            user_done: None,
            evaluator_done: None,
            user_stdout_closed: false,
            evaluator_stdout_closed: false,
        };
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let event = match drain_deadline {
                Some(deadline) => match timeout_at(deadline, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        debug!("Interactive session drain deadline reached");
                        break;
                    }
                },
                None => events.recv().await,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                SessionEvent::Stdout(Side::User, chunk) => {
                    if state.outcome.is_some() {
                        continue;
                    }
                    if state.over_output_cap(Side::User, chunk.len()) {
                        let message = format!(
                            "output limit exceeded: more than {} bytes written",
                            state.output_cap
                        );
                        state.resolve(Verdict::RuntimeError, Some(message));
                    } else {
                        state.record(TranscriptSource::User, &chunk);
                        if let Some(tx) = &to_evaluator {
                            let _ = tx.send(chunk);
                        }
                    }
                }
                SessionEvent::Stdout(Side::Evaluator, chunk) => {
                    if state.outcome.is_some() {
                        continue;
                    }
                    if state.over_output_cap(Side::Evaluator, chunk.len()) {
                        let message = format!(
                            "evaluator output limit exceeded: more than {} bytes written",
                            state.output_cap
                        );
                        state.resolve(Verdict::EvaluatorError, Some(message));
                    } else {
                        state.record(TranscriptSource::Evaluator, &chunk);
                        match scanner.feed(&chunk) {
                            Some(hit) => {
                                let status = if hit.accepted {
                                    Verdict::Accepted
                                } else {
                                    Verdict::WrongAnswer
                                };
                                let message = (!hit.message.is_empty()).then_some(hit.message);
                                state.resolve(status, message);
                            }
                            None => {
                                if let Some(tx) = &to_user {
                                    let _ = tx.send(chunk);
                                }
                            }
                        }
                    }
                }
                SessionEvent::Stderr(side, chunk) => {
                    let (source, buffer) = match side {
                        Side::User => (TranscriptSource::UserStderr, &mut state.user_stderr),
                        Side::Evaluator => {
                            (TranscriptSource::EvaluatorStderr, &mut state.evaluator_stderr)
                        }
                    };
                    append_capped(buffer, &chunk, state.output_cap);
                    state.record(source, &chunk);
                }
                SessionEvent::StdoutClosed(Side::User) => {
                    state.user_stdout_closed = true;
                    // evaluator sees EOF once pending writes are flushed
                    to_evaluator = None;
                }
                SessionEvent::StdoutClosed(Side::Evaluator) => {
                    state.evaluator_stdout_closed = true;
                    to_user = None;
                    self.judge_evaluator_exit(&mut state);
                }
                SessionEvent::Finished(Side::User, supervision) => {
                    if state.outcome.is_none() {
                        let verdict =
                            classify(&supervision, &self.user_limits, &mut state.user_stderr);
                        if verdict != ExecutionVerdict::Ok {
                            state.resolve(verdict.into(), None);
                        }
                    }
                    state.user_done = Some(supervision);
                }
                SessionEvent::Finished(Side::Evaluator, supervision) => {
                    state.evaluator_done = Some(supervision);
                    self.judge_evaluator_exit(&mut state);
                }
            }

            if state.outcome.is_some() && drain_deadline.is_none() {
                // tear down both sides; keep collecting stderr briefly
                user_group.kill();
                evaluator_group.kill();
                to_evaluator = None;
                to_user = None;
                drain_deadline = Some(Instant::now() + config.drain_grace());
            }
        }

        user_group.kill();
        evaluator_group.kill();
        drop(to_evaluator);
        drop(to_user);
        tasks.shutdown().await;

        let (status, message) = state.outcome.take().unwrap_or_else(|| {
            (
                Verdict::InternalError,
                Some("interactive session ended without a verdict".to_string()),
            )
        });

        let (user_wall_ms, user_peak_memory_kb) = state
            .user_done
            .as_ref()
            .map(|s| (s.wall.as_millis() as u64, s.peak_memory_kb))
            .unwrap_or((0, 0));

        InteractionReport {
            status,
            message,
            transcript: state.transcript,
            user_stderr: state.user_stderr,
            evaluator_stderr: state.evaluator_stderr,
            user_wall_ms,
            user_peak_memory_kb,
        }
    }

    fn evaluator_spec(&self, work_dir: &Path, config: &SandboxConfig) -> ProcessSpec {
        let mut argv = self.evaluator_artifact.run_command(&self.evaluator_profile);
        argv.push(self.reference.to_string_lossy().into_owned());

        let mut env = program_env(&self.evaluator_profile, config);
        if let Some(params) = &self.params {
            env.push(("EVALUATOR_PARAMS".to_string(), params.to_string()));
        }

        ProcessSpec::new(work_dir)
            .with_command(argv)
            .with_env(env)
            .with_ceiling(ResourceCeiling {
                cpu_time_ms: Some(self.evaluator_timeout.as_millis() as u64),
                address_space_kb: None,
                file_size_kb: Some(config.file_size_limit_kb),
            })
    }

    /// Decide the outcome once the evaluator has exited and its stdout is
    /// drained, so a marker written just before exit is never lost.
    fn judge_evaluator_exit(&self, state: &mut SessionState) {
        if state.outcome.is_some() || !state.evaluator_stdout_closed {
            return;
        }
        let Some(supervision) = &state.evaluator_done else {
            return;
        };

        if supervision.termination == Termination::TimedOut {
            state.resolve(
                Verdict::EvaluatorError,
                Some("evaluator timed out".to_string()),
            );
            return;
        }
        if !supervision.success() {
            let message = match (supervision.exit_code(), supervision.signal()) {
                (_, Some(signal)) => format!(
                    "evaluator terminated by signal: {}",
                    process::signal_name(signal)
                ),
                (code, None) => format!("evaluator exited with code {:?}", code),
            };
            state.resolve(Verdict::EvaluatorError, Some(message));
            return;
        }

        let user_finished = state.user_done.is_some() || state.user_stdout_closed;
        if user_finished {
            state.resolve(
                Verdict::EvaluatorError,
                Some("evaluator exited without a verdict".to_string()),
            );
        } else {
            let status = match self.on_evaluator_exit {
                EvaluatorExitPolicy::WrongAnswer => Verdict::WrongAnswer,
                EvaluatorExitPolicy::EvaluatorError => Verdict::EvaluatorError,
            };
            state.resolve(
                status,
                Some("evaluator exited before the user program finished".to_string()),
            );
        }
    }
}

/// Spawn one side and its reader and supervisor tasks
fn start_side(
    tasks: &mut JoinSet<()>,
    events: &UnboundedSender<SessionEvent>,
    side: Side,
    spec: &ProcessSpec,
    wall_limit: Duration,
    monitor: Option<MemoryMonitor>,
) -> std::io::Result<(ProcessGroup, ChildStdin)> {
    let mut spawned = process::spawn(spec)?;
    let group = spawned.group;
    let missing = |name: &str| {
        std::io::Error::new(std::io::ErrorKind::Other, format!("{} not piped", name))
    };

    let stdin = spawned.child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = spawned.child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = spawned.child.stderr.take().ok_or_else(|| missing("stderr"))?;

    spawn_reader(
        tasks,
        stdout,
        events.clone(),
        move |chunk| SessionEvent::Stdout(side, chunk),
        Some(SessionEvent::StdoutClosed(side)),
    );
    spawn_reader(
        tasks,
        stderr,
        events.clone(),
        move |chunk| SessionEvent::Stderr(side, chunk),
        None,
    );

    let events = events.clone();
    let mut child = spawned.child;
    tasks.spawn(async move {
        let supervision = process::supervise(&mut child, group, wall_limit, monitor).await;
        let _ = events.send(SessionEvent::Finished(side, supervision));
    });

    Ok((group, stdin))
}

fn spawn_reader<R, F>(
    tasks: &mut JoinSet<()>,
    mut reader: R,
    events: UnboundedSender<SessionEvent>,
    wrap: F,
    on_close: Option<SessionEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(Vec<u8>) -> SessionEvent + Send + 'static,
{
    tasks.spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if events.send(wrap(chunk[..n].to_vec())).is_err() {
                        return;
                    }
                }
            }
        }
        if let Some(event) = on_close {
            let _ = events.send(event);
        }
    });
}

/// Writes forwarded chunks in order. Dropping the returned sender closes the
/// child's stdin once queued chunks are written.
fn spawn_writer(tasks: &mut JoinSet<()>, mut stdin: ChildStdin) -> UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tasks.spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Compile the user program and evaluator, then run one session against
/// `request.reference` in a fresh scratch directory.
pub async fn interact(
    engine: &Engine,
    request: InteractiveRequest,
) -> Result<InteractionReport, EngineError> {
    let profile = engine.languages().resolve(&request.language)?;
    let config = &engine.config().sandbox;

    info!(
        "Interactive run: language={}, time_limit={}ms, memory_limit={}KB",
        profile.id, request.time_limit_ms, request.memory_limit_kb
    );

    let scratch = engine.scratch("interactive")?;
    let build_dir = scratch.subdir("build").map_err(EngineError::Scratch)?;

    let report = match compiler::compile(&profile, &request.source_code, &build_dir, config).await {
        Err(e) if e.is_user_error() => {
            InteractionReport::without_session(e.verdict(), e.message())
        }
        Err(e) => {
            warn!("Compiler stage failed: {}", e);
            InteractionReport::without_session(Verdict::SystemError, e.to_string())
        }
        Ok(artifact) => {
            let root = request.root.as_deref();
            match engine.load_evaluator(&request.interactive.evaluator, root).await? {
                Err(e) => InteractionReport::without_session(
                    Verdict::EvaluatorError,
                    format!("evaluator compilation failed: {}", e.message()),
                ),
                Ok((evaluator_profile, evaluator_artifact)) => {
                    let reference = match root {
                        Some(root) if request.reference.is_relative() => {
                            root.join(&request.reference)
                        }
                        _ => request.reference.clone(),
                    };
                    let limits = engine.limits_for(
                        &profile,
                        request.time_limit_ms,
                        request.memory_limit_kb,
                        request.ignore_limit_bonus,
                    );
                    let session = InteractiveSession {
                        user_profile: profile.clone(),
                        user_artifact: artifact,
                        user_limits: limits,
                        evaluator_profile,
                        evaluator_artifact,
                        evaluator_timeout: request
                            .interactive
                            .timeout_ms
                            .map(Duration::from_millis)
                            .unwrap_or_else(|| config.evaluator_timeout()),
                        reference,
                        markers: request.interactive.markers.clone(),
                        on_evaluator_exit: request.interactive.on_evaluator_exit,
                        params: request.interactive.params.clone(),
                    };
                    let work_dir = scratch.subdir("session").map_err(EngineError::Scratch)?;
                    session.run(&work_dir, config).await
                }
            }
        }
    };

    info!(
        "Interactive run finished: status={}, transcript_entries={}",
        report.status,
        report.transcript.len()
    );
    scratch.cleanup().await;
    Ok(report)
}
