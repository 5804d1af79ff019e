//! Forge engine: completion client, structured-output recovery and the
//! request orchestrator.

pub mod error;
pub mod llm;
pub mod orchestrator;

pub use error::{ErrorKind, StageError, StageFailure};
pub use orchestrator::{
    Metrics, Orchestrator, OrchestratorSettings, OrchestratorState, RunError, RunMetadata,
    RunResult,
};
