//! Stage handlers.
//!
//! Every handler reads what earlier stages left in [`RunContext`], makes its
//! completion call(s) and writes its own output back. Structured stages go
//! through the session cache; code stages go through the validator.

use super::{CacheKey, OrchestratorSettings, Session};
use crate::error::{StageError, StageFailure};
use crate::llm::parse::extract_json;
use crate::llm::prompts::{system_prompt, StageInput};
use crate::llm::{
    merge_usage, ChatMessage, CompletionError, CompletionRequest, CompletionResponse,
    CompletionService, ExtractError, Usage,
};
use forge_adapters::util::hash_fields;
use forge_core::validate::auto_fix;
use forge_core::{ArtifactMap, IntentCategory, ProgressEvent, Request, StageName, StageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub(crate) type ProgressSink<'p> = &'p mut (dyn FnMut(&ProgressEvent) + Send);

pub(crate) fn emit(progress: ProgressSink<'_>, kind: &str, message: String) {
    progress(&ProgressEvent::now(kind, message));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub name: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default, deserialize_with = "named_entries")]
    pub files: Vec<PlannedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LocateReply {
    #[serde(default, deserialize_with = "named_entries")]
    targets: Vec<Target>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub cause: String,
    #[serde(default, deserialize_with = "named_entries")]
    pub targets: Vec<Target>,
}

/// Lists may hold bare names or `{name, ...}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum NamedEntry {
    Bare(String),
    Full {
        name: String,
        #[serde(default, alias = "purpose")]
        reason: String,
    },
}

trait FromNamed {
    fn from_named(name: String, note: String) -> Self;
}

impl FromNamed for PlannedFile {
    fn from_named(name: String, purpose: String) -> Self {
        Self { name, purpose }
    }
}

impl FromNamed for Target {
    fn from_named(name: String, reason: String) -> Self {
        Self { name, reason }
    }
}

fn named_entries<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: FromNamed,
{
    let entries = Vec::<NamedEntry>::deserialize(deserializer)?;
    let mut seen = BTreeSet::new();
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            NamedEntry::Bare(name) => (name, String::new()),
            NamedEntry::Full { name, reason } => (name, reason),
        })
        .map(|(name, note)| (name.trim().trim_start_matches("./").to_string(), note))
        .filter(|(name, _)| !name.is_empty() && seen.insert(name.clone()))
        .map(|(name, note)| T::from_named(name, note))
        .collect())
}

/// Per-run working state threaded through the stages.
pub(crate) struct RunContext<'r> {
    pub request: &'r Request,
    pub guidance: Option<String>,
    pub working: ArtifactMap,
    pub changed: BTreeSet<String>,
    pub plan: Option<Plan>,
    pub design: Option<Value>,
    pub diagnosis: Option<Diagnosis>,
    pub targets: Option<Vec<Target>>,
    pub explanation: Option<String>,
    pub warnings: Vec<String>,
    /// Usage summed over every completion this run made.
    pub usage: Option<Usage>,
    pub cache_hits: u32,
}

impl<'r> RunContext<'r> {
    pub fn new(request: &'r Request, guidance: Option<String>) -> Self {
        Self {
            request,
            guidance,
            working: request.existing_artifacts.clone(),
            changed: BTreeSet::new(),
            plan: None,
            design: None,
            diagnosis: None,
            targets: None,
            explanation: None,
            warnings: Vec::new(),
            usage: None,
            cache_hits: 0,
        }
    }

    /// Forget stage outputs that belong to the abandoned pipeline.
    pub fn reset_for_reroute(&mut self) {
        self.plan = None;
        self.design = None;
        self.diagnosis = None;
        self.targets = None;
    }

    fn input(&self) -> StageInput {
        let mut input = StageInput::new(&self.request.message);
        input.guidance(self.guidance.as_deref());
        input
    }

    fn fingerprint(&self, stage: StageName, extra: &[&str]) -> String {
        let artifacts = serde_json::to_string(&self.working).unwrap_or_default();
        let mut fields = vec![
            stage.label(),
            self.request.message.as_str(),
            self.guidance.as_deref().unwrap_or(""),
            artifacts.as_str(),
        ];
        fields.extend_from_slice(extra);
        hash_fields(fields)
    }
}

pub(crate) enum StageOutcome {
    Continue,
    Reroute(IntentCategory),
}

pub(crate) struct StageRunner<'a, S> {
    pub service: &'a S,
    pub settings: &'a OrchestratorSettings,
}

impl<S: CompletionService> StageRunner<'_, S> {
    pub async fn execute(
        &self,
        stage: StageName,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        match stage {
            StageName::Plan => self.plan(session, ctx, progress).await,
            StageName::Design => self.design(session, ctx, progress).await,
            StageName::Generate => self.generate(session, ctx, progress).await,
            StageName::Locate => self.locate(session, ctx, progress).await,
            StageName::Diagnose => self.diagnose(session, ctx, progress).await,
            StageName::Modify => self.modify(session, ctx, progress).await,
            StageName::Explain => self.explain(session, ctx, progress).await,
        }
    }

    async fn call(
        &self,
        stage: StageName,
        user: String,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt(stage)),
                ChatMessage::user(user),
            ],
            token_limit: self.settings.max_tokens,
            temperature: Some(self.settings.temperature),
        };

        let result = self.service.complete(&request).await;
        let usage = match &result {
            Ok(response) => response.usage.as_ref(),
            Err(CompletionError::EmptyCompletion { usage, .. }) => usage.as_ref(),
            Err(_) => None,
        };
        if let Some(usage) = usage {
            session.record_usage(usage);
            ctx.usage = merge_usage(ctx.usage.take(), Some(usage.clone()));
        }
        result
    }

    /// Cached structured call: returns the recovered JSON value.
    async fn structured(
        &self,
        stage: StageName,
        input: String,
        fingerprint: String,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
    ) -> Result<Value, StageFailure> {
        let key = CacheKey { fingerprint, stage };
        if let Some(value) = session
            .cached(&key)
            .and_then(|hit| hit.structured_output)
        {
            ctx.cache_hits += 1;
            debug!(stage = %stage, "stage result served from cache");
            return Ok(value);
        }

        let response = self
            .call(stage, input, session, ctx)
            .await
            .map_err(|e| StageFailure::new(stage, e))?;
        if response.was_truncated() {
            warn!(stage = %stage, "completion stopped at the token limit");
        }

        let extracted = extract_json(&response.text).map_err(|e| StageFailure::new(stage, e))?;
        if extracted.completed {
            ctx.warnings.push(format!(
                "{} output was truncated; missing brackets were appended",
                stage
            ));
        } else {
            session.store(key, StageResult::structured(extracted.value.clone()));
        }
        Ok(extracted.value)
    }

    /// Validate and auto-fix generated code, then add it to the working set.
    fn accept_code(
        &self,
        stage: StageName,
        name: &str,
        text: &str,
        ctx: &mut RunContext<'_>,
    ) -> Result<(), StageFailure> {
        let outcome = auto_fix(text, name);
        if !outcome.applied.is_empty() {
            info!(stage = %stage, artifact = name, fixes = ?outcome.applied, "applied auto-fixes");
        }
        if !outcome.is_valid() {
            let summary = outcome
                .after
                .critical()
                .map(|issue| issue.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(
                StageFailure::new(stage, StageError::Validation { summary }).on_artifact(name),
            );
        }
        for issue in outcome.after.warnings() {
            ctx.warnings.push(format!("{}: {}", name, issue.message));
        }
        ctx.working.insert(name.to_string(), outcome.text);
        ctx.changed.insert(name.to_string());
        Ok(())
    }

    async fn plan(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Plan;
        let mut input = ctx.input();
        input.file_list("Files that already exist", ctx.working.keys().map(String::as_str));
        let fingerprint = ctx.fingerprint(stage, &[]);
        let value = self
            .structured(stage, input.build(), fingerprint, session, ctx)
            .await?;

        let plan: Plan = serde_json::from_value(value).map_err(|e| {
            StageFailure::new(stage, ExtractError::Shape(e.to_string()))
        })?;
        if plan.files.is_empty() {
            return Err(StageFailure::new(stage, StageError::EmptyPlan));
        }
        emit(
            progress,
            stage.label(),
            format!("Planned {} file(s)", plan.files.len()),
        );
        ctx.plan = Some(plan);
        Ok(StageOutcome::Continue)
    }

    async fn design(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Design;
        let plan_json = ctx
            .plan
            .as_ref()
            .and_then(|plan| serde_json::to_value(plan).ok());
        let mut input = ctx.input();
        input.json("Plan", plan_json.as_ref());
        if ctx.plan.is_none() {
            input.artifacts("Existing files", &ctx.working);
        }
        let plan_text = plan_json.as_ref().map(Value::to_string).unwrap_or_default();
        let fingerprint = ctx.fingerprint(stage, &[&plan_text]);
        let value = self
            .structured(stage, input.build(), fingerprint, session, ctx)
            .await?;

        emit(progress, stage.label(), "Design agreed".to_string());
        ctx.design = Some(value);
        Ok(StageOutcome::Continue)
    }

    async fn generate(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Generate;
        let plan = ctx
            .plan
            .clone()
            .ok_or_else(|| StageFailure::new(stage, StageError::EmptyPlan))?;
        let plan_json = serde_json::to_value(&plan).ok();
        let total = plan.files.len();

        let mut written = ArtifactMap::new();
        for (i, file) in plan.files.iter().enumerate() {
            emit(
                progress,
                stage.label(),
                format!("Writing {} ({}/{})", file.name, i + 1, total),
            );
            let mut input = ctx.input();
            input
                .json("Plan", plan_json.as_ref())
                .json("Design", ctx.design.as_ref())
                .artifacts("Files written so far", &written)
                .push(
                    "File to write",
                    &format!("{}: {}", file.name, file.purpose),
                );

            let response = self
                .call(stage, input.build(), session, ctx)
                .await
                .map_err(|e| StageFailure::new(stage, e).on_artifact(&file.name))?;
            if response.was_truncated() {
                warn!(artifact = %file.name, "generated file stopped at the token limit");
            }
            self.accept_code(stage, &file.name, &response.text, ctx)?;
            if let Some(text) = ctx.working.get(&file.name) {
                written.insert(file.name.clone(), text.clone());
            }
        }
        Ok(StageOutcome::Continue)
    }

    async fn locate(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Locate;
        let mut input = ctx.input();
        input
            .json("Design", ctx.design.as_ref())
            .artifacts("Existing files", &ctx.working);
        let design_text = ctx.design.as_ref().map(Value::to_string).unwrap_or_default();
        let fingerprint = ctx.fingerprint(stage, &[&design_text]);
        let value = self
            .structured(stage, input.build(), fingerprint, session, ctx)
            .await?;

        let reply: LocateReply = serde_json::from_value(value).map_err(|e| {
            StageFailure::new(stage, ExtractError::Shape(e.to_string()))
        })?;
        let (targets, unknown): (Vec<Target>, Vec<Target>) = reply
            .targets
            .into_iter()
            .partition(|t| ctx.working.contains_key(&t.name));
        for target in &unknown {
            warn!(artifact = %target.name, "locate named a file that does not exist");
        }

        if targets.is_empty() {
            info!("locate found nothing to change");
            emit(progress, stage.label(), "No files to change".to_string());
            return Ok(StageOutcome::Reroute(IntentCategory::CreateNew));
        }
        emit(
            progress,
            stage.label(),
            format!("Will change {}", join_names(&targets)),
        );
        ctx.targets = Some(targets);
        Ok(StageOutcome::Continue)
    }

    async fn diagnose(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Diagnose;
        let mut input = ctx.input();
        input.artifacts("Existing files", &ctx.working);
        let fingerprint = ctx.fingerprint(stage, &[]);
        let value = self
            .structured(stage, input.build(), fingerprint, session, ctx)
            .await?;

        let mut diagnosis: Diagnosis = serde_json::from_value(value).map_err(|e| {
            StageFailure::new(stage, ExtractError::Shape(e.to_string()))
        })?;
        diagnosis
            .targets
            .retain(|t| ctx.working.contains_key(&t.name));

        let targets = if diagnosis.targets.is_empty() {
            info!("diagnosis named no files; targeting every artifact");
            ctx.working
                .keys()
                .map(|name| Target {
                    name: name.clone(),
                    reason: diagnosis.cause.clone(),
                })
                .collect()
        } else {
            diagnosis.targets.clone()
        };
        emit(
            progress,
            stage.label(),
            format!("Cause: {}", diagnosis.cause.trim()),
        );
        ctx.targets = Some(targets);
        ctx.diagnosis = Some(diagnosis);
        Ok(StageOutcome::Continue)
    }

    async fn modify(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Modify;
        let targets = ctx.targets.clone().unwrap_or_default();
        if targets.is_empty() {
            return Ok(StageOutcome::Reroute(IntentCategory::CreateNew));
        }
        let cause = ctx.diagnosis.as_ref().map(|d| d.cause.clone());
        let total = targets.len();

        for (i, target) in targets.iter().enumerate() {
            emit(
                progress,
                stage.label(),
                format!("Editing {} ({}/{})", target.name, i + 1, total),
            );
            let current = ctx.working.get(&target.name).cloned().unwrap_or_default();
            let mut input = ctx.input();
            input
                .json("Design", ctx.design.as_ref())
                .push("Diagnosis", cause.as_deref().unwrap_or(""))
                .file_list(
                    "Other files in the project",
                    ctx.working
                        .keys()
                        .filter(|name| **name != target.name)
                        .map(String::as_str),
                )
                .push("File to edit", &target.name)
                .push("Why it needs to change", &target.reason)
                .push("Current contents", &current);

            let response = self
                .call(stage, input.build(), session, ctx)
                .await
                .map_err(|e| StageFailure::new(stage, e).on_artifact(&target.name))?;
            self.accept_code(stage, &target.name, &response.text, ctx)?;
        }
        Ok(StageOutcome::Continue)
    }

    async fn explain(
        &self,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
        progress: ProgressSink<'_>,
    ) -> Result<StageOutcome, StageFailure> {
        let stage = StageName::Explain;
        let mut input = ctx.input();
        input.artifacts("Files", &ctx.working);
        let response = self
            .call(stage, input.build(), session, ctx)
            .await
            .map_err(|e| StageFailure::new(stage, e))?;
        emit(progress, stage.label(), "Explanation ready".to_string());
        ctx.explanation = Some(response.text.trim().to_string());
        Ok(StageOutcome::Continue)
    }
}

fn join_names(targets: &[Target]) -> String {
    targets
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
