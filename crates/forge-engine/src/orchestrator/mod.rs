//! Request orchestration.
//!
//! One [`Orchestrator`] owns its cache and metrics. `run` takes `&mut self`,
//! so a single instance never interleaves two runs; independent instances
//! share nothing and can run concurrently.
//!
//! A run moves through `Idle -> Classifying -> Routing -> ExecutingStage(i)
//! -> Completed | Failed`. Stages execute strictly in pipeline order and each
//! one is fully resolved before the next starts.

mod stages;
#[cfg(test)]
mod tests;

use crate::error::{ErrorKind, StageError, StageFailure};
use crate::llm::{CompletionService, Usage};
use forge_adapters::config::Config;
use forge_adapters::rules::RulesProvider;
use forge_core::consistency::{
    check_consistency_with, ConsistencyOptions, ConsistencyReport, FindingLevel,
};
use forge_core::{
    classify, pipeline_for, ArtifactMap, Intent, IntentCategory, ProgressEvent, Request,
    StageName, StageResult,
};
use serde::Serialize;
use stages::{emit, RunContext, StageOutcome, StageRunner};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use stages::{Diagnosis, Plan, PlannedFile, Target};

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Classifying,
    Routing,
    /// Index into the active pipeline's stage list.
    ExecutingStage(usize),
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: String,
    pub stage: StageName,
}

/// Cumulative counters for one orchestrator instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub runs: u32,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub pipeline_usage_counts: BTreeMap<IntentCategory, u32>,
    pub cache_hits: u32,
}

/// Instance-scoped mutable state handed to every stage.
#[derive(Debug, Default)]
pub struct Session {
    cache: HashMap<CacheKey, StageResult>,
    metrics: Metrics,
}

impl Session {
    pub fn cached(&mut self, key: &CacheKey) -> Option<StageResult> {
        let hit = self.cache.get(key).cloned();
        if hit.is_some() {
            self.metrics.cache_hits += 1;
        }
        hit
    }

    pub fn store(&mut self, key: CacheKey, result: StageResult) {
        self.cache.insert(key, result);
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.metrics.total_tokens += u64::from(usage.total_tokens);
        self.metrics.reasoning_tokens += u64::from(usage.reasoning_tokens());
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub stage: Option<StageName>,
    pub artifact: Option<String>,
    pub message: String,
}

impl From<&StageFailure> for RunError {
    fn from(failure: &StageFailure) -> Self {
        Self {
            kind: failure.kind(),
            stage: Some(failure.stage),
            artifact: failure.artifact.clone(),
            message: failure.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    /// Classification of the request as submitted.
    pub intent: Intent,
    /// Pipeline that finished the run; differs from `intent` after a reroute.
    pub pipeline: IntentCategory,
    pub rerouted_from: Option<IntentCategory>,
    pub stages: Vec<StageName>,
    pub estimated_tokens: u32,
    pub actual_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub cache_hits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub success: bool,
    /// Full working set: existing artifacts overlaid with everything written.
    /// Kept on failure so partial work is never lost.
    pub artifacts: ArtifactMap,
    pub changed_artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
    pub metadata: RunMetadata,
}

impl RunResult {
    /// Only the artifacts this run wrote.
    pub fn changed(&self) -> ArtifactMap {
        self.changed_artifacts
            .iter()
            .filter_map(|name| {
                self.artifacts
                    .get(name)
                    .map(|text| (name.clone(), text.clone()))
            })
            .collect()
    }
}

pub struct Orchestrator<S> {
    service: S,
    settings: OrchestratorSettings,
    rules: Option<Box<dyn RulesProvider>>,
    state: OrchestratorState,
    session: Session,
}

impl<S: CompletionService> Orchestrator<S> {
    pub fn new(service: S, settings: OrchestratorSettings) -> Self {
        Self {
            service,
            settings,
            rules: None,
            state: OrchestratorState::Idle,
            session: Session::default(),
        }
    }

    pub fn with_rules(mut self, rules: Box<dyn RulesProvider>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn metrics(&self) -> &Metrics {
        self.session.metrics()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Classify without running anything.
    pub fn classify(&self, message: &str, existing: &ArtifactMap) -> Intent {
        classify(message, !existing.is_empty())
    }

    /// Run one request to completion or failure. Never panics on service
    /// errors; failures come back as `success: false` with partial artifacts.
    pub async fn run<F>(
        &mut self,
        message: &str,
        existing: ArtifactMap,
        mut on_progress: F,
    ) -> RunResult
    where
        F: FnMut(&ProgressEvent) + Send,
    {
        let progress: &mut (dyn FnMut(&ProgressEvent) + Send) = &mut on_progress;
        let run_id = Uuid::new_v4();
        let request = Request::new(message, existing);

        self.state = OrchestratorState::Classifying;
        let intent = classify(&request.message, request.has_existing_artifacts());
        info!(
            %run_id,
            intent = %intent.category,
            confidence = intent.confidence,
            artifacts = request.existing_artifacts.len(),
            "classified request"
        );
        emit(
            progress,
            "classify",
            format!("{} ({:.2})", intent.category, intent.confidence),
        );

        self.state = OrchestratorState::Routing;
        let guidance = self.rules.as_ref().and_then(|rules| rules.guidance(&request));
        let mut ctx = RunContext::new(&request, guidance);
        let mut pipeline = pipeline_for(intent.category);
        let mut rerouted_from = None;
        let mut executed = Vec::new();
        let mut estimated = 0u32;
        self.session.metrics.runs += 1;

        let outcome = loop {
            *self
                .session
                .metrics
                .pipeline_usage_counts
                .entry(pipeline.intent)
                .or_default() += 1;
            estimated += pipeline.estimated_token_budget;
            emit(progress, "route", pipeline.description.to_string());

            let runner = StageRunner {
                service: &self.service,
                settings: &self.settings,
            };
            let mut step = Ok(StageOutcome::Continue);
            let mut last_stage = None;
            for (i, stage) in pipeline.stages.iter().copied().enumerate() {
                self.state = OrchestratorState::ExecutingStage(i);
                executed.push(stage);
                last_stage = Some(stage);
                debug!(%run_id, stage = %stage, index = i, "executing stage");
                emit(
                    progress,
                    stage.label(),
                    format!("Stage {}/{}: {}", i + 1, pipeline.stages.len(), stage),
                );
                step = runner
                    .execute(stage, &mut self.session, &mut ctx, &mut *progress)
                    .await;
                if !matches!(step, Ok(StageOutcome::Continue)) {
                    break;
                }
            }

            match step {
                Ok(StageOutcome::Continue) => break Ok(()),
                Err(failure) => break Err(failure),
                Ok(StageOutcome::Reroute(target)) => {
                    let stage = last_stage.unwrap_or(StageName::Modify);
                    if rerouted_from.is_some() {
                        break Err(StageFailure::new(stage, StageError::NoTargets));
                    }
                    info!(%run_id, from = %pipeline.intent, to = %target, "rerouting run");
                    emit(
                        progress,
                        "reroute",
                        format!("Nothing to change; switching to {}", target),
                    );
                    rerouted_from = Some(pipeline.intent);
                    ctx.reset_for_reroute();
                    pipeline = pipeline_for(target);
                }
            }
        };

        let consistency = match &outcome {
            Ok(()) if pipeline.produces_artifacts() && ctx.working.len() > 1 => {
                // The first planned file is the entry point even when its name
                // doesn't say so.
                let options = ConsistencyOptions {
                    entry: ctx
                        .plan
                        .as_ref()
                        .and_then(|plan| plan.files.first())
                        .map(|file| file.name.clone()),
                };
                let report = check_consistency_with(&ctx.working, &options);
                for finding in &report.findings {
                    match finding.level {
                        FindingLevel::Error => {
                            warn!(artifact = %finding.artifact, "{}", finding.message)
                        }
                        FindingLevel::Warning => {
                            debug!(artifact = %finding.artifact, "{}", finding.message)
                        }
                    }
                }
                emit(
                    progress,
                    "consistency",
                    format!("{} finding(s)", report.findings.len()),
                );
                Some(report)
            }
            _ => None,
        };

        let error = match &outcome {
            Ok(()) => {
                self.state = OrchestratorState::Completed;
                emit(
                    progress,
                    "complete",
                    format!("{} artifact(s) changed", ctx.changed.len()),
                );
                None
            }
            Err(failure) => {
                self.state = OrchestratorState::Failed;
                warn!(%run_id, kind = ?failure.kind(), "{}", failure);
                emit(progress, "failed", failure.to_string());
                Some(RunError::from(failure))
            }
        };

        RunResult {
            success: outcome.is_ok(),
            changed_artifacts: ctx.changed.iter().cloned().collect(),
            artifacts: ctx.working,
            error,
            explanation: ctx.explanation,
            warnings: ctx.warnings,
            consistency,
            metadata: RunMetadata {
                run_id,
                intent,
                pipeline: pipeline.intent,
                rerouted_from,
                stages: executed,
                estimated_tokens: estimated,
                actual_tokens: ctx
                    .usage
                    .as_ref()
                    .map_or(0, |usage| u64::from(usage.total_tokens)),
                usage: ctx.usage,
                cache_hits: ctx.cache_hits,
            },
        }
    }
}
