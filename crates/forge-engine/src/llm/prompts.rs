use super::parse::{JSON_BEGIN_MARKER, JSON_END_MARKER};
use forge_core::{ArtifactMap, StageName};
use serde_json::Value;

/// Per-artifact character cap when artifacts are quoted as context.
pub const MAX_ARTIFACT_CONTEXT_CHARS: usize = 12_000;

/// Shared tail for stages that must answer with JSON.
fn json_reply_rules() -> String {
    format!(
        "Reply with a single JSON value wrapped between the lines {} and {}. \
         No commentary before or after it.",
        JSON_BEGIN_MARKER, JSON_END_MARKER
    )
}

const CODE_REPLY_RULES: &str = "Reply with the complete contents of the file and nothing else. \
     Do not wrap it in markdown fences. Do not use eval, new Function or document.write. \
     Do not import axios, node-fetch, jquery, request or child_process; use fetch instead.";

pub fn system_prompt(stage: StageName) -> String {
    match stage {
        StageName::Plan => format!(
            "You plan small web front-end projects. Decide the minimal set of files needed \
             for the request. Use the shape {{\"summary\": string, \"files\": \
             [{{\"name\": relative path, \"purpose\": string}}]}}. List the entry file first. {}",
            json_reply_rules()
        ),
        StageName::Design => format!(
            "You define the shared design that every generated file must follow: component \
             names, exported symbols per file, state shape, colour palette and typography. \
             Answer with a JSON object. {}",
            json_reply_rules()
        ),
        StageName::Generate => format!(
            "You write one file of a project at a time, following the plan and design \
             exactly so the files fit together. Import sibling files with relative paths \
             and export what the design says each file exports. {}",
            CODE_REPLY_RULES
        ),
        StageName::Locate => format!(
            "You decide which existing files must change to satisfy a request. Use the \
             shape {{\"targets\": [{{\"name\": existing file name, \"reason\": string}}]}}. \
             Return an empty list when the request cannot be met by editing these files. {}",
            json_reply_rules()
        ),
        StageName::Diagnose => format!(
            "You debug front-end code. Find the root cause of the reported problem. Use the \
             shape {{\"cause\": string, \"targets\": [file names that need a fix]}}. {}",
            json_reply_rules()
        ),
        StageName::Modify => format!(
            "You edit one existing file to satisfy a request while keeping everything else \
             in it working. Keep its exports stable unless the request says otherwise. {}",
            CODE_REPLY_RULES
        ),
        StageName::Explain => "You explain code to a developer. Be concrete, reference file \
             names, and keep it short. Do not rewrite the code."
            .to_string(),
    }
}

/// Truncate file contents for prompt safety (keep beginning + end)
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars / 2).collect();
        let tail: String = content.chars().rev().take(max_chars / 2).collect();
        format!(
            "{}\n\n... [truncated] ...\n\n{}",
            head,
            tail.chars().rev().collect::<String>()
        )
    }
}

/// Sectioned user message. Empty sections are skipped.
#[derive(Debug, Default)]
pub struct StageInput {
    sections: Vec<String>,
}

impl StageInput {
    pub fn new(request: &str) -> Self {
        let mut input = Self::default();
        input.push("Request", request.trim());
        input
    }

    pub fn push(&mut self, title: &str, body: &str) -> &mut Self {
        if !body.trim().is_empty() {
            self.sections.push(format!("## {}\n{}", title, body.trim_end()));
        }
        self
    }

    pub fn guidance(&mut self, guidance: Option<&str>) -> &mut Self {
        if let Some(guidance) = guidance {
            self.push("Project guidance", guidance);
        }
        self
    }

    pub fn json(&mut self, title: &str, value: Option<&Value>) -> &mut Self {
        if let Some(value) = value {
            let rendered = serde_json::to_string_pretty(value).unwrap_or_default();
            self.push(title, &rendered);
        }
        self
    }

    pub fn artifact(&mut self, name: &str, content: &str) -> &mut Self {
        let body = format!(
            "### {}\n{}",
            name,
            truncate_content(content, MAX_ARTIFACT_CONTEXT_CHARS)
        );
        self.sections.push(body);
        self
    }

    pub fn artifacts(&mut self, title: &str, artifacts: &ArtifactMap) -> &mut Self {
        if artifacts.is_empty() {
            return self;
        }
        self.sections.push(format!("## {}", title));
        for (name, content) in artifacts {
            self.artifact(name, content);
        }
        self
    }

    pub fn file_list<'a>(
        &mut self,
        title: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) -> &mut Self {
        let listed: Vec<String> = names.into_iter().map(|n| format!("- {}", n)).collect();
        self.push(title, &listed.join("\n"))
    }

    pub fn build(&self) -> String {
        self.sections.join("\n\n")
    }
}
