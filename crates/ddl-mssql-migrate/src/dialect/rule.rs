//! Rewrite rules: an ordered list of `{matcher, replacement}` objects.
//!
//! Each rule is a case-insensitive regular expression anchored on word
//! boundaries plus a replacement template. Guards let a rule skip a match
//! based on the text around it, which is how guard-token rules
//! (`PRIMARY KEY CLUSTERED`, `DROP ... IF EXISTS`) stay idempotent and how
//! type rules avoid rewriting column names such as `date` or `text`.
//! String literals and comments are never rewritten, and guards read the
//! text around a match with comments removed.

use regex::{Captures, Regex};
use std::borrow::Cow;

use super::document::{inert_spans, InertKind, InertSpan};
use crate::config::CustomRule;
use crate::error::{MigrateError, Result};

/// How far back a `NotPrecededBy` guard looks.
const LOOKBEHIND_WINDOW: usize = 48;

/// Rule groups, in the order the built-in set applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleStage {
    /// Scalar type mappings.
    ScalarType,
    /// Identity/sequence mappings.
    Identity,
    /// Key clause normalization.
    KeyClause,
    /// Default-value rewriting.
    DefaultValue,
    /// Routine namespace qualification.
    RoutineQualifier,
    /// Existence-guarded drops.
    IdempotentDrop,
    /// User supplied rules.
    Custom,
}

/// Context check that vetoes an individual match.
#[derive(Debug, Clone)]
pub enum Guard {
    /// Skip when the text right after the match matches (pattern is anchored with `^`).
    NotFollowedBy(Regex),
    /// Skip when the text right before the match matches (pattern is anchored with `$`).
    NotPrecededBy(Regex),
}

impl Guard {
    fn vetoes(&self, text: &str, start: usize, end: usize, spans: &[InertSpan]) -> bool {
        match self {
            Guard::NotFollowedBy(re) => re.is_match(&text[end..]),
            Guard::NotPrecededBy(re) => re.is_match(&lookbehind(text, start, spans)),
        }
    }
}

/// Up to `LOOKBEHIND_WINDOW` bytes before `start`, skipping comments.
fn lookbehind<'t>(text: &'t str, start: usize, spans: &[InertSpan]) -> Cow<'t, str> {
    let before = spans.partition_point(|s| s.range.end <= start);
    let mut comments = spans[..before]
        .iter()
        .rev()
        .filter(|s| s.kind == InertKind::Comment)
        .peekable();

    let mut pieces: Vec<&str> = Vec::new();
    let mut budget = LOOKBEHIND_WINDOW;
    let mut end = start;
    while budget > 0 && end > 0 {
        let floor = comments.peek().map_or(0, |s| s.range.end);
        if floor == end {
            if let Some(comment) = comments.next() {
                end = comment.range.start;
            }
            continue;
        }
        let mut from = end.saturating_sub(budget).max(floor);
        while !text.is_char_boundary(from) {
            from -= 1;
        }
        pieces.push(&text[from..end]);
        budget = budget.saturating_sub(end - from);
        end = from;
    }

    match pieces.as_slice() {
        [] => Cow::Borrowed(""),
        [one] => Cow::Borrowed(*one),
        _ => Cow::Owned(pieces.iter().rev().copied().collect()),
    }
}

/// Whether `pos` falls inside a literal or comment.
fn is_inert(spans: &[InertSpan], pos: usize) -> bool {
    let at = spans.partition_point(|s| s.range.end <= pos);
    spans.get(at).is_some_and(|s| s.range.contains(&pos))
}

/// A single rewrite.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    name: String,
    stage: RuleStage,
    matcher: Regex,
    replacement: String,
    guards: Vec<Guard>,
}

impl RewriteRule {
    /// Build a rule. `pattern` is compiled case-insensitively.
    pub fn new(
        name: impl Into<String>,
        stage: RuleStage,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let matcher = compile(&name, pattern)?;
        Ok(Self {
            name,
            stage,
            matcher,
            replacement: replacement.into(),
            guards: Vec::new(),
        })
    }

    /// Whole-word keyword rule: `\b(?:A|B)\b` → `replacement`.
    pub fn keyword(
        name: impl Into<String>,
        stage: RuleStage,
        keywords: &[&str],
        replacement: impl Into<String>,
    ) -> Result<Self> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.split_whitespace().collect::<Vec<_>>().join(r"\s+"))
            .collect();
        let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
        Self::new(name, stage, &pattern, replacement)
    }

    /// Add a guard that skips matches followed by `pattern`.
    pub fn unless_followed_by(mut self, pattern: &str) -> Result<Self> {
        let re = compile(&self.name, &format!("^(?:{})", pattern))?;
        self.guards.push(Guard::NotFollowedBy(re));
        Ok(self)
    }

    /// Add a guard that skips matches preceded by `pattern`.
    pub fn unless_preceded_by(mut self, pattern: &str) -> Result<Self> {
        let re = compile(&self.name, &format!("(?:{})$", pattern))?;
        self.guards.push(Guard::NotPrecededBy(re));
        Ok(self)
    }

    /// Build a rule from configuration.
    pub fn from_custom(rule: &CustomRule) -> Result<Self> {
        Self::new(&rule.name, RuleStage::Custom, &rule.pattern, &rule.replacement)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> RuleStage {
        self.stage
    }

    /// Apply the rule to `text`, returning the rewritten text and the number
    /// of rewritten matches.
    pub fn apply<'t>(&self, text: &'t str) -> (Cow<'t, str>, usize) {
        let mut output: Option<String> = None;
        let mut spans: Option<Vec<InertSpan>> = None;
        let mut last = 0;
        let mut count = 0;

        for caps in self.matcher.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            if m.as_str().is_empty() {
                continue;
            }
            let spans = spans.get_or_insert_with(|| inert_spans(text));
            if is_inert(spans, m.start()) || self.is_vetoed(text, m.start(), m.end(), spans) {
                continue;
            }
            let out = output.get_or_insert_with(|| String::with_capacity(text.len() + 64));
            out.push_str(&text[last..m.start()]);
            self.expand(&caps, out);
            last = m.end();
            count += 1;
        }

        match output {
            Some(mut out) => {
                out.push_str(&text[last..]);
                (Cow::Owned(out), count)
            }
            None => (Cow::Borrowed(text), 0),
        }
    }

    fn is_vetoed(&self, text: &str, start: usize, end: usize, spans: &[InertSpan]) -> bool {
        self.guards.iter().any(|g| g.vetoes(text, start, end, spans))
    }

    fn expand(&self, caps: &Captures<'_>, out: &mut String) {
        caps.expand(&self.replacement, out);
    }
}

/// Ordered collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RewriteRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; it runs after every rule already in the set.
    pub fn push(&mut self, rule: RewriteRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Built-in MySQL/PostgreSQL → MSSQL rules.
    ///
    /// Type mappings run before the key and default clauses that mention
    /// those types; routine qualification runs before drop guarding.
    pub fn mssql(routine_schema: &str) -> Result<Self> {
        // Quoted names and column-name positions are left alone.
        let name_position = r#"['"`\[]|[(,]\s*|\b(?:ADD|COLUMN)\s+"#;
        let not_quoted = r#"['"`\]]"#;

        let type_rule = |name: &str, keywords: &[&str], replacement: &str| -> Result<RewriteRule> {
            RewriteRule::keyword(name, RuleStage::ScalarType, keywords, replacement)?
                .unless_preceded_by(name_position)?
                .unless_followed_by(not_quoted)
        };
        let identity_rule = |name: &str, keywords: &[&str], replacement: &str| -> Result<RewriteRule> {
            RewriteRule::keyword(name, RuleStage::Identity, keywords, replacement)?
                .unless_preceded_by(name_position)?
                .unless_followed_by(not_quoted)
        };

        let routine_name = r#"[A-Za-z_][A-Za-z0-9_$]*|\[[^\]]+\]|"[^"]+"|`[^`]+`"#;

        let mut set = Self::new();

        // 1. Scalar types
        set.push(type_rule("varchar", &["VARCHAR"], "NVARCHAR")?);
        set.push(type_rule("text", &["TEXT"], "NTEXT")?);
        set.push(type_rule("boolean", &["BOOLEAN", "BOOL"], "BIT")?);
        set.push(type_rule(
            "timestamptz",
            &["TIMESTAMPTZ", "TIMESTAMP WITH TIME ZONE"],
            "DATETIMEOFFSET",
        )?);
        set.push(type_rule("date_timestamp", &["DATE", "TIMESTAMP"], "DATETIME")?);

        // 2. Identity / sequences
        set.push(identity_rule("bigserial", &["BIGSERIAL"], "BIGINT IDENTITY")?);
        set.push(identity_rule("smallserial", &["SMALLSERIAL"], "SMALLINT IDENTITY")?);
        set.push(identity_rule("serial", &["SERIAL"], "INT IDENTITY")?);
        set.push(identity_rule("auto_increment", &["AUTO_INCREMENT"], "IDENTITY")?);

        // 3. Key clauses
        set.push(
            RewriteRule::keyword(
                "primary_key_clustered",
                RuleStage::KeyClause,
                &["PRIMARY KEY"],
                "PRIMARY KEY CLUSTERED",
            )?
            .unless_followed_by(r"\s+(?:NON)?CLUSTERED\b")?,
        );

        // 4. Defaults
        set.push(RewriteRule::new(
            "default_getdate",
            RuleStage::DefaultValue,
            r"\bDEFAULT\s+(?:CURRENT_TIMESTAMP(?:\s*\(\s*\))?|NOW\s*\(\s*\))",
            "DEFAULT GETDATE()",
        )?);

        // 5. Routine qualification
        set.push(RewriteRule::new(
            "create_or_replace_routine",
            RuleStage::RoutineQualifier,
            r"\bCREATE\s+OR\s+REPLACE\s+(?P<kind>FUNCTION|PROCEDURE|TRIGGER)\b",
            "CREATE OR ALTER ${kind}",
        )?);
        set.push(
            RewriteRule::new(
                "qualify_routine",
                RuleStage::RoutineQualifier,
                &format!(
                    r"(?P<lead>\bCREATE\s+(?:OR\s+ALTER\s+)?(?:FUNCTION|PROCEDURE|TRIGGER)\s+)(?P<name>{})",
                    routine_name
                ),
                format!("${{lead}}{}.${{name}}", routine_schema),
            )?
            .unless_followed_by(r"\s*\.")?,
        );

        // 6. Idempotent drops
        set.push(
            RewriteRule::new(
                "drop_if_exists",
                RuleStage::IdempotentDrop,
                r"(?P<lead>\bDROP\s+(?:PROCEDURE|FUNCTION|TRIGGER)\s+)",
                "${lead}IF EXISTS ",
            )?
            .unless_followed_by(r"IF\s+EXISTS\b")?,
        );

        Ok(set)
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){}", pattern)).map_err(|e| {
        MigrateError::Config(format!("rewrite rule '{}' has an invalid pattern: {}", name, e))
    })
}
