//! Pure building blocks for Forge: the request/intent data model, the
//! intent classifier, the static pipeline registry and the deterministic
//! validation and consistency checks that run over generated artifacts.

pub mod consistency;
pub mod intent;
pub mod pipeline;
pub mod protocol;
pub mod scan;
pub mod validate;

pub use intent::{classify, Intent, IntentCategory};
pub use pipeline::{pipeline_for, PipelineDefinition, StageName};
pub use protocol::{ArtifactMap, ProgressEvent, Request, StageResult};
