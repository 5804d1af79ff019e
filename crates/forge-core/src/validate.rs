//! Deterministic validation and single-pass auto-fix for generated artifacts.
//!
//! Every check lives in one table entry: a detection predicate, a severity
//! and an optional rewrite. Fixes run once, in table order; the fixed text is
//! checked one more time to decide validity but is never fed back into
//! another fix round.

use crate::scan::{count_delimiters, is_entry_artifact, is_fence_line, mask_non_code, SourceKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    UnbalancedBraces,
    UnbalancedParens,
    UnbalancedBrackets,
    MarkdownFence,
    DisallowedImport,
    DisallowedApi,
    MissingExport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: RuleKind,
    pub severity: Severity,
    pub message: String,
}

/// A deterministic rewrite offered for one detected issue.
#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub kind: RuleKind,
    pub apply: fn(&str) -> String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// True iff no critical issue was found.
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub fixes: Vec<Fix>,
}

impl ValidationReport {
    pub fn critical(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors
            .iter()
            .filter(|issue| issue.severity == Severity::Critical)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors
            .iter()
            .filter(|issue| issue.severity == Severity::Warning)
    }

    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of the single fix pass.
#[derive(Debug, Clone)]
pub struct AutoFixOutcome {
    pub text: String,
    pub applied: Vec<RuleKind>,
    pub before: ValidationReport,
    pub after: ValidationReport,
}

impl AutoFixOutcome {
    pub fn is_valid(&self) -> bool {
        self.after.valid
    }
}

/// What a rule sees: the raw text plus its string/comment-masked twin.
pub struct Subject<'a> {
    pub name: &'a str,
    pub text: &'a str,
    pub masked: String,
    pub kind: SourceKind,
}

impl<'a> Subject<'a> {
    pub fn new(text: &'a str, name: &'a str) -> Self {
        let kind = SourceKind::from_name(name);
        Self {
            name,
            text,
            masked: mask_non_code(text, kind),
            kind,
        }
    }
}

pub struct Rule {
    pub kind: RuleKind,
    pub severity: Severity,
    pub detect: fn(&Subject<'_>) -> Option<String>,
    pub rewrite: Option<fn(&str) -> String>,
}

/// Modules generated code must not pull in.
pub const DISALLOWED_MODULES: &[&str] = &["axios", "node-fetch", "jquery", "request", "child_process"];

static RULES: &[Rule] = &[
    Rule {
        kind: RuleKind::UnbalancedBraces,
        severity: Severity::Critical,
        detect: detect_unbalanced_braces,
        rewrite: None,
    },
    Rule {
        kind: RuleKind::UnbalancedParens,
        severity: Severity::Critical,
        detect: detect_unbalanced_parens,
        rewrite: None,
    },
    Rule {
        kind: RuleKind::UnbalancedBrackets,
        severity: Severity::Critical,
        detect: detect_unbalanced_brackets,
        rewrite: None,
    },
    Rule {
        kind: RuleKind::MarkdownFence,
        severity: Severity::Critical,
        detect: detect_markdown_fence,
        rewrite: Some(strip_fences),
    },
    Rule {
        kind: RuleKind::DisallowedImport,
        severity: Severity::Critical,
        detect: detect_disallowed_import,
        rewrite: Some(strip_disallowed_imports),
    },
    Rule {
        kind: RuleKind::DisallowedApi,
        severity: Severity::Critical,
        detect: detect_disallowed_api,
        rewrite: None,
    },
    Rule {
        kind: RuleKind::MissingExport,
        severity: Severity::Warning,
        detect: detect_missing_export,
        rewrite: None,
    },
];

pub fn rules() -> &'static [Rule] {
    RULES
}

/// Run every rule against `text` without changing it.
pub fn validate(text: &str, artifact_name: &str) -> ValidationReport {
    let subject = Subject::new(text, artifact_name);
    let mut errors = Vec::new();
    let mut fixes = Vec::new();

    for rule in RULES {
        if let Some(message) = (rule.detect)(&subject) {
            errors.push(ValidationIssue {
                kind: rule.kind,
                severity: rule.severity,
                message: format!("{}: {}", subject.name, message),
            });
            if let Some(apply) = rule.rewrite {
                fixes.push(Fix {
                    kind: rule.kind,
                    apply,
                });
            }
        }
    }

    let valid = !errors
        .iter()
        .any(|issue| issue.severity == Severity::Critical);
    ValidationReport {
        valid,
        errors,
        fixes,
    }
}

/// Validate, apply every offered fix exactly once, then re-check the result.
pub fn auto_fix(text: &str, artifact_name: &str) -> AutoFixOutcome {
    let before = validate(text, artifact_name);
    if before.fixes.is_empty() {
        return AutoFixOutcome {
            text: text.to_string(),
            applied: Vec::new(),
            after: before.clone(),
            before,
        };
    }

    let mut fixed = text.to_string();
    let mut applied = Vec::with_capacity(before.fixes.len());
    for fix in &before.fixes {
        fixed = (fix.apply)(&fixed);
        applied.push(fix.kind);
    }

    let after = validate(&fixed, artifact_name);
    AutoFixOutcome {
        text: fixed,
        applied,
        before,
        after,
    }
}

fn imbalance_message(what: &str, open: usize, close: usize) -> Option<String> {
    if open == close {
        None
    } else {
        Some(format!(
            "unbalanced {} ({} opening, {} closing)",
            what, open, close
        ))
    }
}

fn detect_unbalanced_braces(subject: &Subject<'_>) -> Option<String> {
    if !subject.kind.checks_delimiters() {
        return None;
    }
    let counts = count_delimiters(&subject.masked).braces;
    imbalance_message("braces", counts.open, counts.close)
}

fn detect_unbalanced_parens(subject: &Subject<'_>) -> Option<String> {
    if !subject.kind.checks_delimiters() {
        return None;
    }
    let counts = count_delimiters(&subject.masked).parens;
    imbalance_message("parentheses", counts.open, counts.close)
}

fn detect_unbalanced_brackets(subject: &Subject<'_>) -> Option<String> {
    if !subject.kind.checks_delimiters() {
        return None;
    }
    let counts = count_delimiters(&subject.masked).brackets;
    imbalance_message("brackets", counts.open, counts.close)
}

fn detect_markdown_fence(subject: &Subject<'_>) -> Option<String> {
    if matches!(subject.kind, SourceKind::Text) {
        return None;
    }
    let fences = subject.text.lines().filter(|l| is_fence_line(l)).count();
    (fences > 0).then(|| format!("leftover markdown fencing ({} fence lines)", fences))
}

/// Body of the first fenced block. Without a closed block, only the stray
/// fence lines are dropped.
fn strip_fences(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let fences: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_fence_line(line))
        .map(|(i, _)| i)
        .collect();
    match fences.as_slice() {
        [open, close, ..] => {
            let mut body = lines[open + 1..*close].join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            body
        }
        _ => rebuild_lines(text, |line| !is_fence_line(line)),
    }
}

fn disallowed_import_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let modules = DISALLOWED_MODULES
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(
            r#"(?m)^[ \t]*(?:import\s+(?:[^;'"]*?\s+from\s+)?|.*\brequire\s*\(\s*)['"]({})['"][^\n]*\n?"#,
            modules
        );
        Regex::new(&pattern).ok()
    })
    .as_ref()
}

fn detect_disallowed_import(subject: &Subject<'_>) -> Option<String> {
    if !matches!(subject.kind, SourceKind::Script | SourceKind::Markup) {
        return None;
    }
    let re = disallowed_import_regex()?;
    let found: Vec<&str> = re
        .captures_iter(subject.text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(format!("disallowed import of {}", found.join(", ")))
    }
}

fn strip_disallowed_imports(text: &str) -> String {
    let Some(re) = disallowed_import_regex() else {
        return text.to_string();
    };
    re.replace_all(text, "").into_owned()
}

fn disallowed_api_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(eval|new\s+Function|document\.write(?:ln)?)\s*\(").ok())
        .as_ref()
}

fn detect_disallowed_api(subject: &Subject<'_>) -> Option<String> {
    if !matches!(subject.kind, SourceKind::Script | SourceKind::Markup) {
        return None;
    }
    let calls: Vec<&str> = disallowed_api_regex()?
        .captures_iter(&subject.masked)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(format!("disallowed runtime call to {}", calls.join(", ")))
    }
}

fn export_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*export\b|\bmodule\.exports\b|\bexports\.\w+\s*=").ok()
    })
    .as_ref()
}

/// Whether the (masked) script text contains any export statement.
pub fn has_export(masked: &str) -> bool {
    export_regex().is_some_and(|re| re.is_match(masked))
}

fn detect_missing_export(subject: &Subject<'_>) -> Option<String> {
    if subject.kind != SourceKind::Script || is_entry_artifact(subject.name) {
        return None;
    }
    (!has_export(&subject.masked)).then(|| "no export statement".to_string())
}

/// Keep the lines accepted by `keep`, preserving a trailing newline.
fn rebuild_lines(text: &str, keep: impl Fn(&str) -> bool) -> String {
    let mut out = text
        .lines()
        .filter(|line| keep(line))
        .collect::<Vec<_>>()
        .join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}
