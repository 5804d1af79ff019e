//! Static pipeline registry.
//!
//! Each intent maps to a fixed, ordered list of stages. Nothing here is
//! mutated at runtime; the token budget is only reported, never used to make
//! control decisions.

use crate::intent::IntentCategory;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageName {
    Plan,
    Design,
    Generate,
    Locate,
    Diagnose,
    Modify,
    Explain,
}

impl StageName {
    pub fn label(&self) -> &'static str {
        match self {
            StageName::Plan => "plan",
            StageName::Design => "design",
            StageName::Generate => "generate",
            StageName::Locate => "locate",
            StageName::Diagnose => "diagnose",
            StageName::Modify => "modify",
            StageName::Explain => "explain",
        }
    }

    /// Whether the stage expects a structured (JSON) reply rather than code or prose.
    pub fn expects_structured(&self) -> bool {
        matches!(
            self,
            StageName::Plan | StageName::Design | StageName::Locate | StageName::Diagnose
        )
    }

    /// Structured stages are deterministic given their inputs, so their results are
    /// reused through the per-instance cache.
    pub fn is_cacheable(&self) -> bool {
        self.expects_structured()
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDefinition {
    pub intent: IntentCategory,
    pub stages: &'static [StageName],
    pub description: &'static str,
    pub estimated_token_budget: u32,
}

impl PipelineDefinition {
    /// Pipelines that can leave more than one artifact behind get a
    /// cross-artifact consistency pass once every stage has finished.
    pub fn produces_artifacts(&self) -> bool {
        !matches!(self.intent, IntentCategory::Explain)
    }
}

static CREATE_NEW: PipelineDefinition = PipelineDefinition {
    intent: IntentCategory::CreateNew,
    stages: &[StageName::Plan, StageName::Design, StageName::Generate],
    description: "Plan the file set, agree on a shared design, then generate every file",
    estimated_token_budget: 24_000,
};

static MODIFY: PipelineDefinition = PipelineDefinition {
    intent: IntentCategory::Modify,
    stages: &[StageName::Locate, StageName::Modify],
    description: "Find the files the request touches and rewrite them",
    estimated_token_budget: 12_000,
};

static DEBUG: PipelineDefinition = PipelineDefinition {
    intent: IntentCategory::Debug,
    stages: &[StageName::Diagnose, StageName::Modify],
    description: "Diagnose the failure, then patch the implicated files",
    estimated_token_budget: 14_000,
};

static STYLE_CHANGE: PipelineDefinition = PipelineDefinition {
    intent: IntentCategory::StyleChange,
    stages: &[StageName::Design, StageName::Locate, StageName::Modify],
    description: "Restate the visual design, then restyle the affected files",
    estimated_token_budget: 16_000,
};

static EXPLAIN: PipelineDefinition = PipelineDefinition {
    intent: IntentCategory::Explain,
    stages: &[StageName::Explain],
    description: "Answer the question without changing any file",
    estimated_token_budget: 4_000,
};

pub fn pipeline_for(intent: IntentCategory) -> &'static PipelineDefinition {
    match intent {
        IntentCategory::CreateNew => &CREATE_NEW,
        IntentCategory::Modify => &MODIFY,
        IntentCategory::Debug => &DEBUG,
        IntentCategory::StyleChange => &STYLE_CHANGE,
        IntentCategory::Explain => &EXPLAIN,
    }
}

/// Every registered pipeline, in intent declaration order.
pub fn all_pipelines() -> impl Iterator<Item = &'static PipelineDefinition> {
    IntentCategory::ALL.iter().map(|intent| pipeline_for(*intent))
}
