use crate::llm::{CompletionError, ExtractError};
use forge_core::StageName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification surfaced in run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkRetryable,
    NetworkFatal,
    EmptyCompletion,
    StructuredParseFailure,
    ValidationCritical,
    EmptyPlan,
    Storage,
}

impl CompletionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::EmptyCompletion { .. } => ErrorKind::EmptyCompletion,
            CompletionError::RetriesExhausted { .. } => ErrorKind::NetworkRetryable,
            other if other.is_retryable() => ErrorKind::NetworkRetryable,
            _ => ErrorKind::NetworkFatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("still invalid after auto-fix: {summary}")]
    Validation { summary: String },
    #[error("plan listed no files")]
    EmptyPlan,
    #[error("no artifacts to change and the run was already rerouted")]
    NoTargets,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Completion(err) => err.kind(),
            StageError::Extract(_) => ErrorKind::StructuredParseFailure,
            StageError::Validation { .. } => ErrorKind::ValidationCritical,
            StageError::EmptyPlan | StageError::NoTargets => ErrorKind::EmptyPlan,
        }
    }
}

/// A stage error pinned to where it happened.
#[derive(Debug, Error)]
#[error("{stage} stage failed{}: {error}", artifact_suffix(.artifact))]
pub struct StageFailure {
    pub stage: StageName,
    pub artifact: Option<String>,
    #[source]
    pub error: StageError,
}

fn artifact_suffix(artifact: &Option<String>) -> String {
    artifact
        .as_deref()
        .map(|a| format!(" on {}", a))
        .unwrap_or_default()
}

impl StageFailure {
    pub fn new(stage: StageName, error: impl Into<StageError>) -> Self {
        Self {
            stage,
            artifact: None,
            error: error.into(),
        }
    }

    pub fn on_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
