//! Recover structured JSON from noisy completion text.
//!
//! Candidates are located by explicit markers, then markdown fences, then a
//! brace scan. Each candidate goes through a lossless repair pass (comments,
//! trailing commas) and a strict parse. Only when that fails is the
//! truncation heuristic tried: append whatever closers the unbalanced
//! brackets ask for and parse once more. The heuristic can produce valid but
//! wrong data, so results carry a `completed` flag.

use forge_adapters::util::truncate;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const JSON_BEGIN_MARKER: &str = "<<<JSON";
pub const JSON_END_MARKER: &str = "JSON>>>";

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Delimited,
    Fenced,
    BraceScan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub strategy: Strategy,
    /// Closers were appended to a truncated candidate.
    pub completed: bool,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no JSON object or array found in response: {preview}")]
    NoCandidate { preview: String },
    #[error("could not parse structured output ({message}); candidate: {preview}")]
    Parse { message: String, preview: String },
    #[error("structured output has unexpected shape: {0}")]
    Shape(String),
}

/// Text between the begin/end markers. A missing end marker takes the rest.
fn delimited_candidate(raw: &str) -> Option<&str> {
    let start = raw.find(JSON_BEGIN_MARKER)? + JSON_BEGIN_MARKER.len();
    let rest = &raw[start..];
    let body = match rest.find(JSON_END_MARKER) {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(body.trim()).filter(|s| !s.is_empty())
}

/// Body of the first fenced block that looks like JSON, else the first block.
fn fenced_candidate(raw: &str) -> Option<&str> {
    let mut blocks = Vec::new();
    let mut search = 0;
    while let Some(offset) = raw[search..].find("```") {
        let open = search + offset + 3;
        let body_start = raw[open..]
            .find('\n')
            .map(|nl| open + nl + 1)
            .unwrap_or(raw.len());
        let (body_end, next) = match raw[body_start..].find("```") {
            Some(close) => (body_start + close, body_start + close + 3),
            None => (raw.len(), raw.len()),
        };
        let body = raw[body_start..body_end].trim();
        if !body.is_empty() {
            blocks.push(body);
        }
        if next >= raw.len() {
            break;
        }
        search = next;
    }
    blocks
        .iter()
        .find(|b| b.starts_with('{') || b.starts_with('['))
        .or_else(|| blocks.first())
        .copied()
}

/// Balanced fragment starting at `start`, ignoring brackets inside strings.
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// First opening bracket to its match, or to the end of the text when the
/// fragment never closes.
fn brace_scan_candidate(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    if let Some(fragment) = balanced_from(raw, start) {
        return Some(fragment);
    }
    Some(raw[start..].trim_end())
}

fn candidates(raw: &str) -> Vec<(Strategy, &str)> {
    let mut out: Vec<(Strategy, &str)> = Vec::new();
    let found = [
        (Strategy::Delimited, delimited_candidate(raw)),
        (Strategy::Fenced, fenced_candidate(raw)),
        (Strategy::BraceScan, brace_scan_candidate(raw)),
    ];
    for (strategy, candidate) in found {
        if let Some(candidate) = candidate {
            if !out.iter().any(|(_, seen)| *seen == candidate) {
                out.push((strategy, candidate));
            }
        }
    }
    out
}

/// Remove `//` and `/* */` comments outside string literals.
pub fn strip_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (c, chars.get(i + 1)) {
            ('"', _) => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Drop commas whose next non-whitespace character closes an object or array.
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Lossless cleanup applied before every parse attempt.
pub fn repair(candidate: &str) -> String {
    remove_trailing_commas(&strip_comments(candidate))
}

/// Close whatever a truncated candidate left open.
///
/// Returns the completed text and how many brackets were appended, or `None`
/// when nothing is open. An unterminated string is closed first. A dangling
/// comma left at the cut is removed by the trailing-comma pass.
pub fn complete_truncated(candidate: &str) -> Option<(String, usize)> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for c in candidate.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }

    let mut completed = candidate.trim_end().to_string();
    if in_string {
        // A dangling escape would swallow the closing quote.
        if escape_next {
            completed.pop();
        }
        completed.push('"');
    }
    let appended = stack.len();
    completed.extend(stack.into_iter().rev());
    Some((remove_trailing_commas(&completed), appended))
}

fn parse_structured(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str::<Value>(text)
}

fn is_structured(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Recover a JSON object or array from raw completion text.
pub fn extract_json(raw: &str) -> Result<Extracted, ExtractError> {
    let candidates = candidates(raw);
    let Some((_, first)) = candidates.first() else {
        return Err(ExtractError::NoCandidate {
            preview: truncate(raw.trim(), PREVIEW_CHARS),
        });
    };
    let preview = truncate(first, PREVIEW_CHARS);
    let mut first_error = None;

    for (strategy, candidate) in &candidates {
        let repaired = repair(candidate);
        match parse_structured(&repaired) {
            Ok(value) if is_structured(&value) => {
                return Ok(Extracted {
                    value,
                    strategy: *strategy,
                    completed: false,
                });
            }
            Ok(_) => continue,
            Err(err) => {
                first_error.get_or_insert_with(|| err.to_string());
            }
        }

        if let Some((completed, appended)) = complete_truncated(&repaired) {
            if let Ok(value) = parse_structured(&completed) {
                if is_structured(&value) {
                    debug!(?strategy, appended, "recovered truncated structured output");
                    return Ok(Extracted {
                        value,
                        strategy: *strategy,
                        completed: true,
                    });
                }
            }
        }
    }

    Err(ExtractError::Parse {
        message: first_error.unwrap_or_else(|| "not an object or array".to_string()),
        preview,
    })
}
