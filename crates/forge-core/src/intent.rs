//! Keyword cascade that maps a request onto one of the fixed pipelines.
//!
//! The classifier never fails and never calls out to the network: rules are
//! tried in order, the first match wins, and a request that matches nothing
//! falls back to a low-confidence default that depends only on whether the
//! caller already has artifacts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntentCategory {
    CreateNew,
    Modify,
    Debug,
    StyleChange,
    Explain,
}

impl IntentCategory {
    pub const ALL: [IntentCategory; 5] = [
        IntentCategory::CreateNew,
        IntentCategory::Modify,
        IntentCategory::Debug,
        IntentCategory::StyleChange,
        IntentCategory::Explain,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            IntentCategory::CreateNew => "create_new",
            IntentCategory::Modify => "modify",
            IntentCategory::Debug => "debug",
            IntentCategory::StyleChange => "style_change",
            IntentCategory::Explain => "explain",
        }
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    /// Always within `[0, 1]`.
    pub confidence: f32,
}

impl Intent {
    pub fn new(category: IntentCategory, confidence: f32) -> Self {
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactRequirement {
    Any,
    Required,
    Absent,
}

struct IntentRule {
    category: IntentCategory,
    confidence: f32,
    artifacts: ArtifactRequirement,
    keywords: &'static [&'static str],
}

const DEFAULT_CONFIDENCE: f32 = 0.60;

const RULES: &[IntentRule] = &[
    IntentRule {
        category: IntentCategory::CreateNew,
        confidence: 0.95,
        artifacts: ArtifactRequirement::Absent,
        keywords: &["create", "build", "make", "generate", "scaffold", "new"],
    },
    IntentRule {
        category: IntentCategory::Debug,
        confidence: 0.90,
        artifacts: ArtifactRequirement::Required,
        keywords: &[
            "fix",
            "bug",
            "crash",
            "crashes",
            "error",
            "broken",
            "exception",
            "fails",
            "failing",
            "not working",
            "doesn't work",
        ],
    },
    IntentRule {
        category: IntentCategory::Explain,
        confidence: 0.85,
        artifacts: ArtifactRequirement::Any,
        keywords: &[
            "explain",
            "what does",
            "how does",
            "walk me through",
            "describe",
        ],
    },
    IntentRule {
        category: IntentCategory::StyleChange,
        confidence: 0.85,
        artifacts: ArtifactRequirement::Required,
        keywords: &[
            "color",
            "colour",
            "colors",
            "style",
            "styling",
            "theme",
            "font",
            "css",
            "dark mode",
            "layout",
            "padding",
            "margin",
        ],
    },
    IntentRule {
        category: IntentCategory::CreateNew,
        confidence: 0.80,
        artifacts: ArtifactRequirement::Required,
        keywords: &["from scratch", "start over", "new project"],
    },
    IntentRule {
        category: IntentCategory::Modify,
        confidence: 0.75,
        artifacts: ArtifactRequirement::Required,
        keywords: &[
            "add", "change", "update", "remove", "rename", "replace", "modify", "refactor",
        ],
    },
];

/// Classify a request. Deterministic and total.
pub fn classify(message: &str, has_existing_artifacts: bool) -> Intent {
    let normalized = normalize(message);

    for rule in RULES {
        let artifacts_ok = match rule.artifacts {
            ArtifactRequirement::Any => true,
            ArtifactRequirement::Required => has_existing_artifacts,
            ArtifactRequirement::Absent => !has_existing_artifacts,
        };
        if artifacts_ok && rule.keywords.iter().any(|k| contains_phrase(&normalized, k)) {
            return Intent::new(rule.category, rule.confidence);
        }
    }

    if has_existing_artifacts {
        Intent::new(IntentCategory::Modify, DEFAULT_CONFIDENCE)
    } else {
        Intent::new(IntentCategory::CreateNew, DEFAULT_CONFIDENCE)
    }
}

/// Lowercase and collapse everything that is not a word character or an
/// apostrophe into single spaces, padded so phrase lookups can match on
/// word boundaries.
fn normalize(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for ch in message.chars().flat_map(char::to_lowercase) {
        let ch = if ch == '\u{2019}' { '\'' } else { ch };
        if ch.is_alphanumeric() || ch == '\'' {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {} ", phrase))
}
