//! Sandbox configuration
//!
//! Limits and tunables shared by the compiler stage, the runner and the
//! evaluator bridge. Loaded once at startup and passed down explicitly.

use std::time::Duration;

use crate::engine::process::DEFAULT_PATH;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u64,
    /// Compile memory limit in MB (default: 2048MB), applied as an address-space ceiling
    pub compile_memory_limit_mb: u64,
    /// Interval between RSS samples of a running program (default: 200ms)
    pub memory_poll_interval_ms: u64,
    /// Captured bytes per stream; the rest is discarded (default: 16MB)
    pub max_output_bytes: usize,
    /// RLIMIT_AS = memory limit * factor + headroom
    pub address_space_factor: u64,
    pub address_space_headroom_mb: u64,
    /// Largest file a program may write (default: 256MB)
    pub file_size_limit_kb: u64,
    /// How long to wait for pipes to drain after a process group is killed
    pub drain_grace_ms: u64,
    /// Wall-clock limit for custom and interactive evaluators (default: 10s)
    pub evaluator_timeout_ms: u64,
    /// `PATH` seen by spawned programs
    pub path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            memory_poll_interval_ms: 200,
            max_output_bytes: 16 * 1024 * 1024,
            address_space_factor: 2,
            address_space_headroom_mb: 64,
            file_size_limit_kb: 262_144,
            drain_grace_ms: 500,
            evaluator_timeout_ms: 10_000,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_time_limit_ms)
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_interval_ms.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluator_timeout_ms)
    }

    /// Address-space ceiling for a program allowed `memory_limit_kb` of RSS
    pub fn address_space_kb(&self, memory_limit_kb: u64) -> u64 {
        memory_limit_kb
            .saturating_mul(self.address_space_factor.max(1))
            .saturating_add(self.address_space_headroom_mb * 1024)
    }
}
