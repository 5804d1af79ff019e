use super::*;
use crate::llm::parse::{JSON_BEGIN_MARKER, JSON_END_MARKER};
use crate::llm::{
    CompletionError, CompletionFuture, CompletionRequest, CompletionResponse, Role,
};
use crate::llm::models::CompletionTokensDetails;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

const APP: &str = "import Counter from './Counter';\n\nexport default function App() {\n  return <Counter start={0} />;\n}\n";

const COUNTER: &str = "import { useState } from 'react';\n\nexport default function Counter({ start }) {\n  const [count, setCount] = useState(start);\n  return <button onClick={() => setCount(count + 1)}>{count}</button>;\n}\n";

const FOOTER: &str = "export function Footer() {\n  return <footer>Made with care</footer>;\n}\n";

type Reply = Result<CompletionResponse, CompletionError>;

/// Replays canned replies in order and records every request.
struct ScriptedService {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedService {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

impl CompletionService for ScriptedService {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::InvalidResponse("script exhausted".into())));
        Box::pin(async move { reply })
    }
}

struct StaticRules(&'static str);

impl RulesProvider for StaticRules {
    fn guidance(&self, _request: &Request) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn text(body: &str) -> Reply {
    Ok(CompletionResponse {
        text: body.to_string(),
        finish_reason: Some("stop".to_string()),
        usage: Some(Usage {
            total_tokens: 100,
            ..Usage::default()
        }),
    })
}

fn structured(value: Value) -> Reply {
    text(&format!(
        "{}\n{}\n{}",
        JSON_BEGIN_MARKER, value, JSON_END_MARKER
    ))
}

fn counter_plan() -> Reply {
    structured(json!({
        "summary": "A counter",
        "files": [
            {"name": "src/App.jsx", "purpose": "root component"},
            {"name": "src/Counter.jsx", "purpose": "button with a count"}
        ]
    }))
}

/// Attach a provider-reported cost to a reply's usage.
fn priced(reply: Reply, cost: f64) -> Reply {
    reply.map(|mut response| {
        if let Some(usage) = response.usage.as_mut() {
            usage.prompt_tokens = 60;
            usage.cost = Some(cost);
        }
        response
    })
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        model: "openai/gpt-4o-mini".to_string(),
        max_tokens: 2048,
        temperature: 0.2,
    }
}

fn orchestrator(replies: Vec<Reply>) -> Orchestrator<ScriptedService> {
    Orchestrator::new(ScriptedService::new(replies), settings())
}

fn artifacts(entries: &[(&str, &str)]) -> ArtifactMap {
    entries
        .iter()
        .map(|(name, body)| (name.to_string(), body.to_string()))
        .collect()
}

#[tokio::test]
async fn test_create_new_runs_plan_design_generate() {
    let mut orch = orchestrator(vec![
        counter_plan(),
        structured(json!({"components": ["App", "Counter"]})),
        text(APP),
        text(COUNTER),
    ]);
    assert_eq!(orch.state(), OrchestratorState::Idle);

    let mut events = Vec::new();
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |e| {
            events.push(e.clone())
        })
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.metadata.intent,
        Intent::new(IntentCategory::CreateNew, 0.95)
    );
    assert_eq!(
        result.metadata.stages,
        vec![StageName::Plan, StageName::Design, StageName::Generate]
    );
    assert_eq!(result.changed_artifacts, vec!["src/App.jsx", "src/Counter.jsx"]);
    assert_eq!(result.artifacts["src/App.jsx"], APP);
    assert_eq!(result.metadata.estimated_tokens, 24_000);
    assert_eq!(result.metadata.actual_tokens, 400);
    assert!(result.warnings.is_empty());
    assert!(result.consistency.as_ref().is_some_and(|c| c.is_clean()));
    assert_eq!(orch.state(), OrchestratorState::Completed);
    assert_eq!(orch.service().calls(), 4);
    assert_eq!(orch.metrics().total_tokens, 400);
    assert_eq!(
        orch.metrics().pipeline_usage_counts.get(&IntentCategory::CreateNew),
        Some(&1)
    );

    assert_eq!(events.first().map(|e| e.kind.as_str()), Some("classify"));
    assert_eq!(events.last().map(|e| e.kind.as_str()), Some("complete"));
    for stage in ["plan", "design", "generate", "consistency"] {
        assert!(events.iter().any(|e| e.kind == stage), "missing {stage} event");
    }
}

#[tokio::test]
async fn test_requests_carry_settings_and_stage_prompts() {
    let mut orch = orchestrator(vec![
        counter_plan(),
        structured(json!({})),
        text(APP),
        text(COUNTER),
    ]);
    orch.run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    let first = orch.service().request(0);
    assert_eq!(first.model, "openai/gpt-4o-mini");
    assert_eq!(first.token_limit, 2048);
    assert_eq!(first.temperature, Some(0.2));
    assert_eq!(first.messages[0].role, Role::System);
    assert_eq!(first.messages[1].role, Role::User);
    assert!(first.messages[1].content.contains("create a counter app"));

    // The second generated file sees the first one.
    let last = orch.service().request(3);
    assert!(last.messages[1].content.contains("src/Counter.jsx: button with a count"));
    assert!(last.messages[1].content.contains("export default function App()"));
}

#[tokio::test]
async fn test_generated_code_is_auto_fixed_once() {
    let mut orch = orchestrator(vec![
        structured(json!({"summary": "s", "files": ["src/App.jsx"]})),
        structured(json!({})),
        text(&format!("```jsx\n{}```\n", APP)),
    ]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.artifacts["src/App.jsx"], APP);
    // Single artifact: nothing to cross-check.
    assert!(result.consistency.is_none());
}

#[tokio::test]
async fn test_prose_around_generated_code_is_dropped() {
    let mut orch = orchestrator(vec![
        structured(json!({"summary": "s", "files": ["src/App.jsx"]})),
        structured(json!({})),
        text(&format!(
            "Here is the file:\n```jsx\n{}```\nLet me know if you want tweaks.\n",
            APP
        )),
    ]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.artifacts["src/App.jsx"], APP);
}

#[tokio::test]
async fn test_first_planned_file_is_the_entry_point() {
    let root = "import Counter from './Counter';\n\nrender(<Counter start={0} />);\n";
    let mut orch = orchestrator(vec![
        structured(json!({
            "summary": "A counter",
            "files": ["src/Root.jsx", "src/Counter.jsx"]
        })),
        structured(json!({})),
        text(root),
        text(COUNTER),
    ]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    assert!(result.success, "{:?}", result.error);
    let report = result.consistency.unwrap();
    assert!(report.is_clean(), "{:?}", report.findings);
}

#[tokio::test]
async fn test_run_usage_sums_every_completion() {
    let existing = artifacts(&[("src/Counter.jsx", COUNTER)]);
    let mut orch = orchestrator(vec![
        priced(structured(json!({"targets": ["src/Counter.jsx"]})), 0.25),
        priced(text(COUNTER), 0.5),
    ]);
    let result = orch.run("rename the button", existing, |_| {}).await;

    assert!(result.success, "{:?}", result.error);
    let usage = result.metadata.usage.clone().unwrap();
    assert_eq!(usage.total_tokens, 200);
    assert_eq!(usage.prompt_tokens, 120);
    assert_eq!(usage.cost(), 0.75);
    assert_eq!(result.metadata.actual_tokens, 200);

    let encoded = serde_json::to_value(&result.metadata).unwrap();
    assert_eq!(encoded["usage"]["total_tokens"], 200);
}

#[tokio::test]
async fn test_validation_failure_keeps_partial_artifacts() {
    let mut orch = orchestrator(vec![
        counter_plan(),
        structured(json!({})),
        text(APP),
        text("export default function Counter() {\n  return 1;\n"),
    ]);
    let mut events = Vec::new();
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |e| {
            events.push(e.clone())
        })
        .await;

    assert!(!result.success);
    let error = result.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::ValidationCritical);
    assert_eq!(error.stage, Some(StageName::Generate));
    assert_eq!(error.artifact.as_deref(), Some("src/Counter.jsx"));
    assert!(error.message.contains("unbalanced braces"));
    assert_eq!(result.changed_artifacts, vec!["src/App.jsx"]);
    assert!(result.artifacts.contains_key("src/App.jsx"));
    assert!(!result.artifacts.contains_key("src/Counter.jsx"));
    assert!(result.consistency.is_none());
    assert_eq!(orch.state(), OrchestratorState::Failed);
    assert_eq!(events.last().map(|e| e.kind.as_str()), Some("failed"));

    let encoded = serde_json::to_value(&result).unwrap();
    assert_eq!(encoded["success"], false);
    assert_eq!(encoded["error"]["kind"], "validation_critical");
}

#[tokio::test]
async fn test_locate_without_targets_reroutes_to_create_new() {
    let existing = artifacts(&[("src/App.jsx", APP)]);
    let mut orch = orchestrator(vec![
        structured(json!({"targets": [{"name": "src/Missing.jsx", "reason": "?"}]})),
        structured(json!({"summary": "footer", "files": [{"name": "src/Footer.jsx"}]})),
        structured(json!({})),
        text(FOOTER),
    ]);
    let mut events = Vec::new();
    let result = orch
        .run("add a footer", existing, |e| events.push(e.clone()))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.metadata.intent.category, IntentCategory::Modify);
    assert_eq!(result.metadata.rerouted_from, Some(IntentCategory::Modify));
    assert_eq!(result.metadata.pipeline, IntentCategory::CreateNew);
    assert_eq!(
        result.metadata.stages,
        vec![
            StageName::Locate,
            StageName::Plan,
            StageName::Design,
            StageName::Generate
        ]
    );
    assert_eq!(result.metadata.estimated_tokens, 12_000 + 24_000);
    assert_eq!(result.changed_artifacts, vec!["src/Footer.jsx"]);
    assert!(result.artifacts.contains_key("src/App.jsx"));
    assert!(events.iter().any(|e| e.kind == "reroute"));

    let counts = &orch.metrics().pipeline_usage_counts;
    assert_eq!(counts.get(&IntentCategory::Modify), Some(&1));
    assert_eq!(counts.get(&IntentCategory::CreateNew), Some(&1));
}

#[tokio::test]
async fn test_diagnose_without_targets_modifies_every_artifact() {
    let existing = artifacts(&[("src/App.jsx", APP), ("src/Counter.jsx", COUNTER)]);
    let mut orch = orchestrator(vec![
        structured(json!({"cause": "count starts undefined", "targets": []})),
        text(APP),
        text(COUNTER),
    ]);
    let result = orch.run("fix the crash", existing, |_| {}).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.metadata.intent,
        Intent::new(IntentCategory::Debug, 0.90)
    );
    assert_eq!(
        result.metadata.stages,
        vec![StageName::Diagnose, StageName::Modify]
    );
    assert_eq!(result.changed_artifacts, vec!["src/App.jsx", "src/Counter.jsx"]);
    assert_eq!(orch.service().calls(), 3);
    let edit = orch.service().request(1);
    assert!(edit.messages[1].content.contains("count starts undefined"));
    assert!(edit.messages[1].content.contains("## File to edit\nsrc/App.jsx"));
}

#[tokio::test]
async fn test_modify_targets_only_located_artifacts() {
    let existing = artifacts(&[("src/App.jsx", APP), ("src/Counter.jsx", COUNTER)]);
    let updated = COUNTER.replace("{count}</button>", "Clicked {count}</button>");
    let mut orch = orchestrator(vec![
        structured(json!({"targets": [{"name": "src/Counter.jsx", "reason": "label"}]})),
        text(&updated),
    ]);
    let result = orch
        .run("change the button label", existing, |_| {})
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.changed_artifacts, vec!["src/Counter.jsx"]);
    assert_eq!(result.artifacts["src/Counter.jsx"], updated);
    assert_eq!(result.artifacts["src/App.jsx"], APP);
    assert_eq!(result.changed().len(), 1);
}

#[tokio::test]
async fn test_explain_answers_without_touching_artifacts() {
    let existing = artifacts(&[("src/App.jsx", APP)]);
    let mut orch = orchestrator(vec![text("  App renders a Counter.  ")]);
    let mut kinds = Vec::new();
    let result = orch
        .run("explain how the app works", existing.clone(), |e| {
            kinds.push(e.kind.clone())
        })
        .await;

    assert!(result.success);
    assert_eq!(result.explanation.as_deref(), Some("App renders a Counter."));
    assert!(result.changed_artifacts.is_empty());
    assert_eq!(result.artifacts, existing);
    assert!(result.consistency.is_none());
    assert_eq!(
        kinds,
        vec!["classify", "route", "explain", "explain", "complete"]
    );
}

#[tokio::test]
async fn test_rules_guidance_reaches_the_stage_input() {
    let mut orch = orchestrator(vec![text("It counts.")])
        .with_rules(Box::new(StaticRules("Prefer tabs for indentation")));
    orch.run("explain the counter", ArtifactMap::new(), |_| {})
        .await;
    let sent = orch.service().request(0);
    assert!(sent.messages[1]
        .content
        .contains("## Project guidance\nPrefer tabs for indentation"));
}

#[tokio::test]
async fn test_structured_stage_results_are_cached_per_instance() {
    let existing = artifacts(&[("src/App.jsx", APP), ("src/Counter.jsx", COUNTER)]);
    let mut orch = orchestrator(vec![
        structured(json!({"targets": ["src/Counter.jsx"]})),
        text(COUNTER),
        text(COUNTER),
    ]);

    let first = orch
        .run("rename the button", existing.clone(), |_| {})
        .await;
    let second = orch.run("rename the button", existing, |_| {}).await;

    assert!(first.success && second.success);
    assert_eq!(first.metadata.cache_hits, 0);
    assert_eq!(second.metadata.cache_hits, 1);
    assert_eq!(second.metadata.actual_tokens, 100);
    assert_eq!(orch.service().calls(), 3);
    assert_eq!(orch.metrics().cache_hits, 1);
    assert_eq!(orch.metrics().runs, 2);
    assert_eq!(orch.session().cache_len(), 1);
}

#[tokio::test]
async fn test_separate_instances_do_not_share_cache() {
    let existing = artifacts(&[("src/Counter.jsx", COUNTER)]);
    let script = || {
        vec![
            structured(json!({"targets": ["src/Counter.jsx"]})),
            text(COUNTER),
        ]
    };
    let mut a = orchestrator(script());
    let mut b = orchestrator(script());
    a.run("rename the button", existing.clone(), |_| {}).await;
    let result = b.run("rename the button", existing, |_| {}).await;
    assert_eq!(result.metadata.cache_hits, 0);
    assert_eq!(b.service().calls(), 2);
}

#[tokio::test]
async fn test_truncated_plan_is_completed_but_not_cached() {
    let mut orch = orchestrator(vec![
        text(r#"{"summary":"s","files":[{"name":"src/App.jsx","purpose":"root"}"#),
        structured(json!({})),
        text(APP),
    ]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.warnings.iter().any(|w| w.contains("truncated")));
    // Only the design result went into the cache.
    assert_eq!(orch.session().cache_len(), 1);
}

#[tokio::test]
async fn test_empty_completion_reports_reasoning_tokens() {
    let usage = Usage {
        total_tokens: 600,
        completion_tokens_details: Some(CompletionTokensDetails {
            reasoning_tokens: 512,
        }),
        ..Usage::default()
    };
    let mut orch = orchestrator(vec![Err(CompletionError::EmptyCompletion {
        reasoning_tokens: 512,
        usage: Some(usage),
    })]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EmptyCompletion);
    assert_eq!(error.stage, Some(StageName::Plan));
    assert!(error.message.contains("512 reasoning tokens"));
    assert_eq!(result.metadata.actual_tokens, 600);
    assert_eq!(orch.metrics().reasoning_tokens, 512);
}

#[tokio::test]
async fn test_fatal_network_error_stops_the_run() {
    let mut orch = orchestrator(vec![Err(CompletionError::Http {
        status: 401,
        message: "invalid API key".to_string(),
    })]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NetworkFatal);
    assert_eq!(orch.service().calls(), 1);
    assert_eq!(orch.state(), OrchestratorState::Failed);
}

#[tokio::test]
async fn test_exhausted_retries_surface_as_retryable_kind() {
    let mut orch = orchestrator(vec![Err(CompletionError::RetriesExhausted {
        attempts: 3,
        last: Box::new(CompletionError::Http {
            status: 503,
            message: String::new(),
        }),
    })]);
    let result = orch
        .run("explain the app", ArtifactMap::new(), |_| {})
        .await;
    assert_eq!(result.error.unwrap().kind, ErrorKind::NetworkRetryable);
}

#[tokio::test]
async fn test_unparseable_plan_is_a_structured_parse_failure() {
    let mut orch = orchestrator(vec![text("Sorry, I can't plan that.")]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::StructuredParseFailure);
    assert_eq!(error.stage, Some(StageName::Plan));
}

#[tokio::test]
async fn test_plan_without_files_fails_with_empty_plan() {
    let mut orch = orchestrator(vec![structured(json!({"summary": "nothing", "files": []}))]);
    let result = orch
        .run("create a counter app", ArtifactMap::new(), |_| {})
        .await;
    assert_eq!(result.error.unwrap().kind, ErrorKind::EmptyPlan);
    assert_eq!(orch.service().calls(), 1);
}
