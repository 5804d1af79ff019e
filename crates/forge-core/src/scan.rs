//! Lightweight lexical helpers shared by the validator and the consistency
//! checker. Nothing here parses a language; it only knows enough about
//! strings, comments and template literals to keep punctuation inside them
//! from being mistaken for code.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Script,
    Stylesheet,
    Markup,
    Data,
    Text,
}

impl SourceKind {
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => SourceKind::Script,
            "css" | "scss" | "less" => SourceKind::Stylesheet,
            "html" | "htm" | "vue" | "svelte" => SourceKind::Markup,
            "json" => SourceKind::Data,
            _ => SourceKind::Text,
        }
    }

    /// Whether delimiter balance is meaningful for this kind of artifact.
    pub fn checks_delimiters(&self) -> bool {
        matches!(
            self,
            SourceKind::Script | SourceKind::Stylesheet | SourceKind::Data
        )
    }

    fn line_comments(&self) -> bool {
        matches!(self, SourceKind::Script)
    }

    fn block_comments(&self) -> bool {
        matches!(self, SourceKind::Script | SourceKind::Stylesheet)
    }

    fn single_quotes(&self) -> bool {
        matches!(self, SourceKind::Script | SourceKind::Stylesheet)
    }

    fn template_literals(&self) -> bool {
        matches!(self, SourceKind::Script)
    }
}

/// Artifacts that act as the application entry point and are allowed to have
/// no exports.
pub fn is_entry_artifact(name: &str) -> bool {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    ["index", "main", "app"]
        .iter()
        .any(|entry| stem.eq_ignore_ascii_case(entry))
}

/// Whether a line opens or closes a markdown code fence.
pub fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    LineComment,
    BlockComment,
    Str(char),
    Template,
}

/// Blank one character, keeping its byte width so offsets stay aligned.
fn push_blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        out.extend(std::iter::repeat_n(' ', c.len_utf8()));
    }
}

/// Replace the contents of string literals and comments with spaces.
///
/// The result has the same byte length as the input, and line breaks are
/// preserved, so offsets and line numbers carry over to the original. Markdown fence lines are blanked as well. `${ ... }` segments of
/// template literals stay visible because they are code.
pub fn mask_non_code(text: &str, kind: SourceKind) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut mode = Mode::Code;
    let mut depth: usize = 0;
    let mut template_exprs: Vec<usize> = Vec::new();
    let mut at_line_start = true;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if at_line_start && mode == Mode::Code {
            let line_end = chars[i..]
                .iter()
                .position(|ch| *ch == '\n')
                .map(|p| i + p)
                .unwrap_or(chars.len());
            let line: String = chars[i..line_end].iter().collect();
            if is_fence_line(&line) {
                out.extend(std::iter::repeat_n(' ', line.len()));
                i = line_end;
                continue;
            }
        }
        at_line_start = c == '\n';

        match mode {
            Mode::Code => {
                if kind.line_comments() && c == '/' && next == Some('/') {
                    mode = Mode::LineComment;
                    out.push_str("  ");
                    i += 2;
                    continue;
                }
                if kind.block_comments() && c == '/' && next == Some('*') {
                    mode = Mode::BlockComment;
                    out.push_str("  ");
                    i += 2;
                    continue;
                }
                match c {
                    '"' => {
                        mode = Mode::Str(c);
                        out.push(' ');
                    }
                    '\'' if kind.single_quotes() => {
                        mode = Mode::Str(c);
                        out.push(' ');
                    }
                    '`' if kind.template_literals() => {
                        mode = Mode::Template;
                        out.push(' ');
                    }
                    '{' => {
                        depth += 1;
                        out.push(c);
                    }
                    '}' => {
                        if template_exprs.last() == Some(&depth) {
                            template_exprs.pop();
                            mode = Mode::Template;
                        }
                        depth = depth.saturating_sub(1);
                        out.push(c);
                    }
                    _ => out.push(c),
                }
            }
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Code;
                }
                push_blank(&mut out, c);
            }
            Mode::BlockComment => {
                if c == '*' && next == Some('/') {
                    mode = Mode::Code;
                    out.push_str("  ");
                    i += 2;
                    continue;
                }
                push_blank(&mut out, c);
            }
            Mode::Str(quote) => {
                if c == '\\' {
                    out.push(' ');
                    if let Some(n) = next {
                        push_blank(&mut out, n);
                    }
                    i += 2;
                    continue;
                }
                if c == quote {
                    mode = Mode::Code;
                    out.push(' ');
                } else if c == '\n' {
                    // Unterminated literal; don't let it swallow the rest of the file.
                    mode = Mode::Code;
                    out.push('\n');
                } else {
                    push_blank(&mut out, c);
                }
            }
            Mode::Template => {
                if c == '\\' {
                    out.push(' ');
                    if let Some(n) = next {
                        push_blank(&mut out, n);
                    }
                    i += 2;
                    continue;
                }
                if c == '`' {
                    mode = Mode::Code;
                    out.push(' ');
                } else if c == '$' && next == Some('{') {
                    depth += 1;
                    template_exprs.push(depth);
                    mode = Mode::Code;
                    out.push_str(" {");
                    i += 2;
                    continue;
                } else {
                    push_blank(&mut out, c);
                }
            }
        }
        i += 1;
    }

    out
}

/// Open/close counts for one delimiter pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairCount {
    pub open: usize,
    pub close: usize,
}

impl PairCount {
    pub fn is_balanced(&self) -> bool {
        self.open == self.close
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelimiterCounts {
    pub braces: PairCount,
    pub parens: PairCount,
    pub brackets: PairCount,
}

/// Count delimiters in already-masked text.
pub fn count_delimiters(masked: &str) -> DelimiterCounts {
    let mut counts = DelimiterCounts::default();
    for c in masked.chars() {
        match c {
            '{' => counts.braces.open += 1,
            '}' => counts.braces.close += 1,
            '(' => counts.parens.open += 1,
            ')' => counts.parens.close += 1,
            '[' => counts.brackets.open += 1,
            ']' => counts.brackets.close += 1,
            _ => {}
        }
    }
    counts
}
