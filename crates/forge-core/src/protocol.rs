use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named text artifacts, ordered by name so runs are reproducible.
pub type ArtifactMap = BTreeMap<String, String>;

/// Immutable input to one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub message: String,
    #[serde(default)]
    pub existing_artifacts: ArtifactMap,
}

impl Request {
    pub fn new(message: impl Into<String>, existing_artifacts: ArtifactMap) -> Self {
        Self {
            message: message.into(),
            existing_artifacts,
        }
    }

    pub fn has_existing_artifacts(&self) -> bool {
        !self.existing_artifacts.is_empty()
    }
}

/// Outcome of a single stage execution.
///
/// A stage that expects code or prose fills `text_output`; a stage that expects
/// structured data fills `structured_output`. Results are cached per orchestrator
/// instance, so they must stay cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageResult {
    pub fn structured(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            structured_output: Some(value),
            ..Self::default()
        }
    }
}

/// Observational progress notification emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn now(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
