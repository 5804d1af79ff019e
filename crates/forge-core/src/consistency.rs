//! Best-effort static checks across a finished artifact set.
//!
//! The checker derives an import graph from relative `import` statements
//! between sibling script artifacts and reports unused imported symbols,
//! artifacts without exports and import cycles. It only annotates a run; it
//! never fails one.

use crate::protocol::ArtifactMap;
use crate::scan::{is_entry_artifact, mask_non_code, SourceKind};
use crate::validate::has_export;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    UnusedImport,
    MissingExport,
    ImportCycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyFinding {
    pub kind: FindingKind,
    pub level: FindingLevel,
    pub artifact: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub findings: Vec<ConsistencyFinding>,
}

impl ConsistencyReport {
    pub fn warnings(&self) -> impl Iterator<Item = &ConsistencyFinding> {
        self.findings
            .iter()
            .filter(|f| f.level == FindingLevel::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ConsistencyFinding> {
        self.findings
            .iter()
            .filter(|f| f.level == FindingLevel::Error)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyOptions {
    /// Artifact allowed to have no exports, on top of any artifact whose stem
    /// is `index`, `main` or `App`.
    pub entry: Option<String>,
}

/// One `import ... from '<relative>'` statement resolved to a sibling artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SiblingImport {
    target: String,
    symbols: Vec<String>,
    /// Byte range of the whole statement in the importer.
    span: Range<usize>,
}

pub fn check_consistency(artifacts: &ArtifactMap) -> ConsistencyReport {
    check_consistency_with(artifacts, &ConsistencyOptions::default())
}

pub fn check_consistency_with(
    artifacts: &ArtifactMap,
    options: &ConsistencyOptions,
) -> ConsistencyReport {
    let mut report = ConsistencyReport::default();
    let mut graph: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();

    for (name, text) in artifacts {
        if SourceKind::from_name(name) != SourceKind::Script {
            continue;
        }
        let masked = mask_non_code(text, SourceKind::Script);
        let imports = sibling_imports(name, text, &masked, artifacts);
        let spans: Vec<Range<usize>> = imports.iter().map(|i| i.span.clone()).collect();
        let body = without_spans(&masked, &spans);

        for import in &imports {
            for symbol in &import.symbols {
                if !is_referenced(&body, symbol) {
                    report.findings.push(ConsistencyFinding {
                        kind: FindingKind::UnusedImport,
                        level: FindingLevel::Warning,
                        artifact: name.clone(),
                        message: format!(
                            "{} imports `{}` from {} but never uses it",
                            name, symbol, import.target
                        ),
                    });
                }
            }
        }

        let is_entry =
            is_entry_artifact(name) || options.entry.as_deref() == Some(name.as_str());
        if !is_entry && !has_export(&masked) {
            report.findings.push(ConsistencyFinding {
                kind: FindingKind::MissingExport,
                level: FindingLevel::Error,
                artifact: name.clone(),
                message: format!("{} has no export statement", name),
            });
        }

        graph.insert(
            name.as_str(),
            imports.into_iter().map(|import| import.target).collect(),
        );
    }

    for cycle in find_cycles(&graph) {
        report.findings.push(ConsistencyFinding {
            kind: FindingKind::ImportCycle,
            level: FindingLevel::Warning,
            artifact: cycle[0].clone(),
            message: format!("import cycle: {}", cycle.join(" -> ")),
        });
    }

    report
}

fn import_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^[ \t]*(import)\s+([^;'"]*?)\s+from\s+['"]([^'"]+)['"]"#).ok()
    })
    .as_ref()
}

/// Import statements whose `import` keyword is live code in `masked`, so
/// statements inside comments and string literals are skipped.
fn sibling_imports(
    importer: &str,
    text: &str,
    masked: &str,
    artifacts: &ArtifactMap,
) -> Vec<SiblingImport> {
    let Some(re) = import_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let keyword = caps.get(1)?;
            if masked.get(keyword.range()) != Some("import") {
                return None;
            }
            let clause = caps.get(2)?.as_str();
            let specifier = caps.get(3)?.as_str();
            let target = resolve_import(importer, specifier, artifacts)?;
            Some(SiblingImport {
                target,
                symbols: imported_symbols(clause),
                span: whole.range(),
            })
        })
        .collect()
}

/// Local names bound by an import clause such as `A, { b, c as d }` or `* as ns`.
fn imported_symbols(clause: &str) -> Vec<String> {
    let clause = clause.trim();
    let clause = clause.strip_prefix("type ").unwrap_or(clause);
    let mut symbols = Vec::new();

    let (outside, inside) = match (clause.find('{'), clause.rfind('}')) {
        (Some(open), Some(close)) if open < close => (
            format!("{} {}", &clause[..open], &clause[close + 1..]),
            Some(&clause[open + 1..close]),
        ),
        _ => (clause.to_string(), None),
    };

    for part in outside.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let local = part.rsplit(" as ").next().unwrap_or(part).trim();
        if is_identifier(local) {
            symbols.push(local.to_string());
        }
    }

    if let Some(inside) = inside {
        for part in inside.split(',') {
            let part = part.trim();
            let part = part.strip_prefix("type ").unwrap_or(part);
            let local = part.rsplit(" as ").next().unwrap_or(part).trim();
            if is_identifier(local) {
                symbols.push(local.to_string());
            }
        }
    }

    symbols
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Map a relative specifier onto an artifact name, trying the exact name, the name
/// with any extension, and a directory `index` file.
fn resolve_import(importer: &str, specifier: &str, artifacts: &ArtifactMap) -> Option<String> {
    if !specifier.starts_with("./") && !specifier.starts_with("../") {
        return None;
    }

    let mut parts: Vec<&str> = importer.split('/').collect();
    parts.pop();
    for segment in specifier.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    let wanted = parts.join("/");

    if artifacts.contains_key(&wanted) {
        return Some(wanted);
    }
    let index_stem = format!("{}/index", wanted);
    artifacts
        .keys()
        .find(|name| {
            let stem = strip_extension(name);
            stem == wanted || stem == index_stem
        })
        .cloned()
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if !name[dot..].contains('/') => &name[..dot],
        _ => name,
    }
}

/// Masked text with the import statements themselves blanked out.
fn without_spans(masked: &str, spans: &[Range<usize>]) -> String {
    masked
        .char_indices()
        .map(|(i, c)| {
            if c != '\n' && spans.iter().any(|span| span.contains(&i)) {
                ' '
            } else {
                c
            }
        })
        .collect()
}

fn is_referenced(body: &str, symbol: &str) -> bool {
    let pattern = format!(r"(^|[^\w$]){}([^\w$]|$)", regex::escape(symbol));
    let Ok(re) = Regex::new(&pattern) else {
        return true;
    };
    re.is_match(body)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first search over the import graph. Each cycle is reported once,
/// rotated so it starts at its smallest member.
fn find_cycles(graph: &BTreeMap<&str, BTreeSet<String>>) -> Vec<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<&str, BTreeSet<String>>,
        colors: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        seen: &mut BTreeSet<Vec<String>>,
        out: &mut Vec<Vec<String>>,
    ) {
        colors.insert(node, Color::Gray);
        stack.push(node);

        if let Some(edges) = graph.get(node) {
            for next in edges {
                let next = next.as_str();
                match colors.get(next).copied().unwrap_or(Color::White) {
                    Color::White => visit(next, graph, colors, stack, seen, out),
                    Color::Gray => {
                        if let Some(pos) = stack.iter().position(|n| *n == next) {
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|n| n.to_string()).collect();
                            let min = cycle
                                .iter()
                                .enumerate()
                                .min_by(|a, b| a.1.cmp(b.1))
                                .map(|(i, _)| i)
                                .unwrap_or(0);
                            cycle.rotate_left(min);
                            if seen.insert(cycle.clone()) {
                                let mut closed = cycle;
                                closed.push(closed[0].clone());
                                out.push(closed);
                            }
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        colors.insert(node, Color::Black);
    }

    let mut colors: HashMap<&str, Color> = HashMap::new();
    let mut stack = Vec::new();
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for node in graph.keys() {
        if colors.get(node).copied().unwrap_or(Color::White) == Color::White {
            visit(node, graph, &mut colors, &mut stack, &mut seen, &mut out);
        }
    }
    out
}
