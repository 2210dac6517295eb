use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a single test case or interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    /// Custom evaluator produced a (possibly partial) score
    Scored,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    CompileTimeout,
    /// A test resource (input, expected output, reference) is missing
    Error,
    /// The runner could not start the program
    SystemError,
    EvaluatorError,
    EvaluatorTimeout,
    OutputParseError,
    InternalError,
}

impl Verdict {
    /// Whether the case counts as passed for all-or-nothing scoring
    pub fn is_passing(&self) -> bool {
        matches!(self, Verdict::Accepted | Verdict::Scored)
    }

    /// Whether the verdict was caused by infrastructure rather than the submission
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Verdict::Error | Verdict::SystemError | Verdict::InternalError
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::Scored => "scored",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::CompileError => "compile_error",
            Verdict::CompileTimeout => "compile_timeout",
            Verdict::Error => "error",
            Verdict::SystemError => "system_error",
            Verdict::EvaluatorError => "evaluator_error",
            Verdict::EvaluatorTimeout => "evaluator_timeout",
            Verdict::OutputParseError => "output_parse_error",
            Verdict::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single program execution, before any output comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionVerdict {
    Ok,
    CompileError,
    CompileTimeout,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    SpawnError,
}

impl fmt::Display for ExecutionVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionVerdict::Ok => "ok",
            ExecutionVerdict::CompileError => "compile_error",
            ExecutionVerdict::CompileTimeout => "compile_timeout",
            ExecutionVerdict::RuntimeError => "runtime_error",
            ExecutionVerdict::TimeLimitExceeded => "time_limit_exceeded",
            ExecutionVerdict::MemoryLimitExceeded => "memory_limit_exceeded",
            ExecutionVerdict::SpawnError => "spawn_error",
        };
        write!(f, "{}", s)
    }
}

impl From<ExecutionVerdict> for Verdict {
    /// Map a failed execution onto the judge verdict. `Ok` maps to `Accepted`;
    /// callers still compare output before trusting that.
    fn from(verdict: ExecutionVerdict) -> Self {
        match verdict {
            ExecutionVerdict::Ok => Verdict::Accepted,
            ExecutionVerdict::CompileError => Verdict::CompileError,
            ExecutionVerdict::CompileTimeout => Verdict::CompileTimeout,
            ExecutionVerdict::RuntimeError => Verdict::RuntimeError,
            ExecutionVerdict::TimeLimitExceeded => Verdict::TimeLimitExceeded,
            ExecutionVerdict::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
            ExecutionVerdict::SpawnError => Verdict::SystemError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display_matches_serde() {
        for verdict in [
            Verdict::Accepted,
            Verdict::Scored,
            Verdict::CompileTimeout,
            Verdict::OutputParseError,
        ] {
            let json = serde_json::to_string(&verdict).unwrap();
            assert_eq!(json, format!("\"{}\"", verdict));
        }
    }

    #[test]
    fn test_execution_verdict_mapping() {
        assert_eq!(
            Verdict::from(ExecutionVerdict::SpawnError),
            Verdict::SystemError
        );
        assert_eq!(
            Verdict::from(ExecutionVerdict::TimeLimitExceeded),
            Verdict::TimeLimitExceeded
        );
        assert_eq!(ExecutionVerdict::SpawnError.to_string(), "spawn_error");
    }

    #[test]
    fn test_passing() {
        assert!(Verdict::Accepted.is_passing());
        assert!(Verdict::Scored.is_passing());
        assert!(!Verdict::WrongAnswer.is_passing());
        assert!(Verdict::Error.is_infrastructure());
    }
}
