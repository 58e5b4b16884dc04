//! Agent error types.
//!
//! All runtime subsystems surface failures through [`AgentError`]. The
//! taxonomy matters for propagation: validation, permission, tool, and
//! protocol failures are recovered locally by feeding a failed tool result
//! back to the model, while transport failures and iteration exhaustion end
//! the turn.

use std::time::Duration;

use kiln_core::ToolError;

use crate::workspace::PathGuardError;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Transport -----------------------------------------------------------
    /// The LLM call failed in transit.
    #[error("llm request failed: {reason}")]
    Llm { reason: String },

    /// The LLM response could not be parsed into the expected shape.
    #[error("llm response parse error: {reason}")]
    LlmParse { reason: String },

    /// The streaming connection broke or produced invalid data.
    #[error("llm stream error: {reason}")]
    Stream { reason: String },

    /// The circuit breaker is open; no request was issued.
    #[error("llm circuit open; retry after {cooldown:?}")]
    CircuitOpen { cooldown: Duration },

    // -- Loop ----------------------------------------------------------------
    /// The ReAct loop hit its iteration cap.
    #[error("max iterations reached ({cap})")]
    MaxIterations { cap: u32 },

    /// The turn was cancelled by the user.
    #[error("interrupted")]
    Cancelled,

    // -- Checkpoints ---------------------------------------------------------
    /// `/rewind` was invoked with no committed checkpoint.
    #[error("nothing to rewind")]
    NoCheckpoint,

    /// A rewind restored some paths but not all of them.
    #[error("partial rewind: {first_error}")]
    PartialRewind { first_error: String, restored: usize, failed: usize },

    // -- Pipeline ------------------------------------------------------------
    /// The planner could not produce a usable plan.
    #[error("planning failed: {reason}")]
    PlanningFailed { reason: String },

    /// A plan's dependency graph is not a DAG.
    #[error("plan has a dependency cycle involving step {step_id}")]
    PlanCycle { step_id: u32 },

    /// A plan step kept failing after its retry budget.
    #[error("step {step_id} failed after {attempts} attempts: {reason}")]
    StepFailed {
        step_id: u32,
        attempts: u32,
        reason: String,
    },

    // -- Configuration -------------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Bridged -------------------------------------------------------------
    /// Path validation failure from the project-root jail.
    #[error(transparent)]
    Path(#[from] PathGuardError),

    /// Tool layer failure.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem I/O failure outside the jail layer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors. Prefer a typed variant.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether this error should be recovered locally by surfacing a failed
    /// tool result into the conversation rather than ending the turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Path(_) | Self::Tool(_) | Self::Json(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_not_recoverable() {
        let err = AgentError::Llm { reason: "connection refused".into() };
        assert!(!err.is_recoverable());
        let err = AgentError::CircuitOpen { cooldown: Duration::from_secs(30) };
        assert!(!err.is_recoverable());
    }

    #[test]
    fn tool_errors_are_recoverable() {
        let err: AgentError = ToolError::ExecutionFailed("boom".into()).into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            AgentError::MaxIterations { cap: 20 }.to_string(),
            "max iterations reached (20)"
        );
        assert_eq!(
            AgentError::PartialRewind {
                first_error: "permission denied".into(),
                restored: 2,
                failed: 1
            }
            .to_string(),
            "partial rewind: permission denied"
        );
    }
}
