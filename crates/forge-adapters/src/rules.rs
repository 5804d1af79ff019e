//! Rules/history store.
//!
//! Rules are free-text guidance folded into stage inputs. History is a bounded
//! log of past requests. Both live in one JSON file; reads are best-effort and
//! a missing or unreadable file behaves like an empty store.

use crate::config::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forge_core::{IntentCategory, Request};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAX_HISTORY: usize = 50;
const MAX_GUIDANCE_RULES: usize = 20;
const MAX_GUIDANCE_CHARS: usize = 2_000;
const RECENT_HISTORY_IN_GUIDANCE: usize = 3;

/// Boundary consumed by the orchestrator: free-text guidance for a request.
pub trait RulesProvider: Send + Sync {
    fn guidance(&self, request: &Request) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleEntry {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub message: String,
    pub intent: IntentCategory,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
struct RulesFile {
    rules: Vec<RuleEntry>,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct FileRulesStore {
    path: PathBuf,
    data: RulesFile,
}

impl FileRulesStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable rules file");
                RulesFile::default()
            }),
            Err(_) => RulesFile::default(),
        };
        Self { path, data }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules(&self) -> &[RuleEntry] {
        &self.data.rules
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.data.history
    }

    pub fn add_rule(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() || self.data.rules.iter().any(|r| r.text == text) {
            return Ok(());
        }
        self.data.rules.push(RuleEntry {
            text: text.to_string(),
            created_at: Utc::now(),
        });
        self.save()
    }

    /// Append a finished request, dropping the oldest entries past [`MAX_HISTORY`].
    pub fn record_history(
        &mut self,
        message: &str,
        intent: IntentCategory,
        success: bool,
    ) -> Result<()> {
        self.data.history.push(HistoryEntry {
            message: message.trim().to_string(),
            intent,
            success,
            recorded_at: Utc::now(),
        });
        let overflow = self.data.history.len().saturating_sub(MAX_HISTORY);
        if overflow > 0 {
            self.data.history.drain(..overflow);
        }
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create rules directory")?;
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        debug!(path = %self.path.display(), rules = self.data.rules.len(), "saved rules store");
        Ok(())
    }

    fn render_rules(&self) -> String {
        let mut entries: Vec<&RuleEntry> = self.data.rules.iter().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at)); // newest first

        let mut out = String::new();
        for entry in entries.into_iter().take(MAX_GUIDANCE_RULES) {
            let line = format!("- {}\n", entry.text.trim());
            if out.len() + line.len() > MAX_GUIDANCE_CHARS {
                break;
            }
            out.push_str(&line);
        }
        out.trim_end().to_string()
    }
}

impl RulesProvider for FileRulesStore {
    fn guidance(&self, request: &Request) -> Option<String> {
        let mut sections = Vec::new();

        let rules = self.render_rules();
        if !rules.is_empty() {
            sections.push(format!("Project rules:\n{}", rules));
        }

        let recent: Vec<String> = self
            .data
            .history
            .iter()
            .rev()
            .filter(|h| h.message != request.message.trim())
            .take(RECENT_HISTORY_IN_GUIDANCE)
            .map(|h| format!("- [{}] {}", h.intent, h.message))
            .collect();
        if !recent.is_empty() {
            sections.push(format!("Recent requests:\n{}", recent.join("\n")));
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}
