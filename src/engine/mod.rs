//! Process-level machinery: spawning, supervision, compilation, execution

pub mod compiler;
pub mod config;
pub mod executer;
pub mod memory;
pub mod process;
pub mod scratch;
