use serde::Serialize;
use uuid::Uuid;

use crate::generation::TaskKind;

/// Failure of one generation task inside a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: TaskKind,
    pub kind: &'static str,
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.task.as_str(), self.message)
    }
}

/// Errors raised while generating, aggregating or mutating a turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TurnError {
    #[error("generation service returned an empty result")]
    EmptyGenerationResult,
    #[error("malformed generation output: {reason}")]
    MalformedGenerationOutput { reason: String, raw: String },
    #[error("generation service failed: {0}")]
    Generation(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("city not found: {0}")]
    CityNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("session {0} has expired")]
    SessionExpired(Uuid),
    #[error("event could not be delivered")]
    DeliveryDropped,
    #[error("turn cancelled")]
    Cancelled,
    #[error("{} generation task(s) failed: {}", .0.len(), join_failures(.0))]
    TasksFailed(Vec<TaskFailure>),
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl TurnError {
    /// Stable classification string for events, logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyGenerationResult => "empty_generation_result",
            Self::MalformedGenerationOutput { .. } => "malformed_generation_output",
            Self::Generation(_) => "generation_failed",
            Self::Persistence(_) => "persistence_failure",
            Self::CityNotFound(_) => "city_not_found",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionExpired(_) => "session_expired",
            Self::DeliveryDropped => "delivery_dropped",
            Self::Cancelled => "cancelled",
            Self::TasksFailed(_) => "tasks_failed",
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Local failures abort one task or mutation; the rest end the turn.
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            Self::EmptyGenerationResult
                | Self::MalformedGenerationOutput { .. }
                | Self::Generation(_)
                | Self::CityNotFound(_)
        )
    }
}
