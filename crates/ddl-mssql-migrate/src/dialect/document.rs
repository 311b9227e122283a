//! Raw DDL documents and statement splitting.

use std::borrow::Cow;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};

/// DDL text as read from input. Never mutated; translation produces a new
/// document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDocument {
    origin: Option<PathBuf>,
    text: String,
}

impl SchemaDocument {
    /// Wrap DDL text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            origin: None,
            text: text.into(),
        }
    }

    /// Read a DDL file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::file_access(path, e))?;
        Ok(Self {
            origin: Some(path.to_path_buf()),
            text,
        })
    }

    /// A new document derived from this one (same origin, new text).
    pub(crate) fn derive(&self, text: String) -> Self {
        Self {
            origin: self.origin.clone(),
            text,
        }
    }

    /// Full document text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// File the document was read from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Name used in log lines.
    pub fn display_name(&self) -> String {
        self.origin
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Split into executable statements.
    ///
    /// Statements end at the active delimiter (`;` unless changed by a
    /// MySQL `DELIMITER` line) outside of quotes, comments, dollar-quoted
    /// bodies and `BEGIN ... END` blocks. Empty statements are dropped and
    /// the delimiter itself is not included.
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.text)
    }
}

fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut delimiter = ";".to_string();

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if current.trim().is_empty() {
            if let Some(rest) = strip_keyword(trimmed, "DELIMITER") {
                if !rest.is_empty() {
                    delimiter = rest.to_string();
                }
                current.clear();
                continue;
            }
        }
        current.push_str(line);

        while let Some(pos) = find_delimiter(&current, &delimiter) {
            let stmt = current[..pos].trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current = current[pos + delimiter.len()..].to_string();
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let head = line.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &line[keyword.len()..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim())
}

/// Byte offset of the first top-level delimiter in `text`.
fn find_delimiter(text: &str, delimiter: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth: usize = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' | b'"' | b'`' => {
                i = skip_quoted(bytes, i, c)?;
                continue;
            }
            b'[' => {
                i = skip_quoted(bytes, i, b']')?;
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                match text[i..].find('\n') {
                    Some(off) => i += off + 1,
                    None => return None,
                }
                continue;
            }
            b'#' => {
                match text[i..].find('\n') {
                    Some(off) => i += off + 1,
                    None => return None,
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = text[i + 2..].find("*/").map(|off| i + 2 + off + 2)?;
                continue;
            }
            b'$' => {
                if let Some(tag_end) = dollar_tag_end(bytes, i) {
                    let tag = &text[i..=tag_end];
                    i = text[tag_end + 1..]
                        .find(tag)
                        .map(|off| tag_end + 1 + off + tag.len())?;
                    continue;
                }
            }
            _ => {}
        }

        if c.is_ascii_alphabetic() && (i == 0 || !is_word_byte(bytes[i - 1])) {
            let end = word_end(bytes, i);
            let word = &text[i..end];
            if word.eq_ignore_ascii_case("BEGIN") {
                if opens_block(&text[end..]) {
                    depth += 1;
                }
            } else if word.eq_ignore_ascii_case("CASE") {
                depth += 1;
            } else if word.eq_ignore_ascii_case("END") && !closes_control_flow(&text[end..]) {
                depth = depth.saturating_sub(1);
            }
            i = end;
            continue;
        }

        if depth == 0 && text[i..].starts_with(delimiter) {
            return Some(i);
        }
        i += text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
    }
    None
}

/// Index just past the closing quote, or None when the quote is still open.
fn skip_quoted(bytes: &[u8], start: usize, close: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && close != b']' {
            i += 2;
            continue;
        }
        if bytes[i] == close {
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// `$$` or `$tag$` starting at `start`; returns the index of the closing `$`.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && is_word_byte(bytes[start - 1]) {
        return None;
    }
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => return Some(i),
            b if b.is_ascii_alphanumeric() || b == b'_' => i += 1,
            _ => return None,
        }
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn word_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && is_word_byte(bytes[i]) {
        i += 1;
    }
    i
}

fn next_word(rest: &str) -> &str {
    let rest = rest.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// `BEGIN;`, `BEGIN TRANSACTION` and friends are statements, not blocks.
fn opens_block(rest: &str) -> bool {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return false;
    }
    let next = next_word(trimmed);
    !["TRANSACTION", "TRAN", "WORK", "DISTRIBUTED"]
        .iter()
        .any(|w| next.eq_ignore_ascii_case(w))
}

/// `END IF`, `END LOOP`, `END WHILE` and `END REPEAT` close statements that
/// never opened a block.
fn closes_control_flow(rest: &str) -> bool {
    let next = next_word(rest);
    ["IF", "LOOP", "WHILE", "REPEAT"]
        .iter()
        .any(|w| next.eq_ignore_ascii_case(w))
}

/// What an inert span of DDL text holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InertKind {
    /// `'...'` string literal.
    Literal,
    /// `--`, `#` or `/* */` comment.
    Comment,
}

/// Region of text that rewrite rules and the table scan must not read as SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InertSpan {
    pub kind: InertKind,
    pub range: Range<usize>,
}

/// String literals and comments in `text`, in order. Quoted identifiers are
/// skipped but not reported; an unterminated literal or block comment runs
/// to the end of the text.
pub(crate) fn inert_spans(text: &str) -> Vec<InertSpan> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let (kind, end) = match bytes[i] {
            b'\'' => (
                Some(InertKind::Literal),
                skip_quoted(bytes, i, b'\'').unwrap_or(bytes.len()),
            ),
            b'"' | b'`' => (None, skip_quoted(bytes, i, bytes[i]).unwrap_or(bytes.len())),
            b'[' => (None, skip_quoted(bytes, i, b']').unwrap_or(bytes.len())),
            b'-' if bytes.get(i + 1) == Some(&b'-') => (
                Some(InertKind::Comment),
                text[i..].find('\n').map_or(bytes.len(), |off| i + off),
            ),
            b'#' => (
                Some(InertKind::Comment),
                text[i..].find('\n').map_or(bytes.len(), |off| i + off),
            ),
            b'/' if bytes.get(i + 1) == Some(&b'*') => (
                Some(InertKind::Comment),
                text[i + 2..].find("*/").map_or(bytes.len(), |off| i + 2 + off + 2),
            ),
            _ => {
                i += 1;
                continue;
            }
        };
        if let Some(kind) = kind {
            spans.push(InertSpan { kind, range: i..end });
        }
        i = end.max(i + 1);
    }
    spans
}

/// `text` with every comment removed; literals are kept.
pub(crate) fn strip_comments(text: &str) -> Cow<'_, str> {
    let spans = inert_spans(text);
    if !spans.iter().any(|s| s.kind == InertKind::Comment) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in spans.iter().filter(|s| s.kind == InertKind::Comment) {
        out.push_str(&text[last..span.range.start]);
        out.push(' ');
        last = span.range.end;
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}
