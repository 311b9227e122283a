//! Ordered-rule DDL translation.

use serde::Serialize;
use tracing::debug;

use super::document::SchemaDocument;
use super::rule::{RewriteRule, RuleSet, RuleStage};
use crate::config::TranslationConfig;
use crate::error::Result;

/// Rewrites MySQL/PostgreSQL DDL into MSSQL DDL.
///
/// Every rule runs exactly once, in order, over the whole document text, so
/// a rule sees the output of all rules before it. Translation is pure: the
/// input document is never modified.
#[derive(Debug, Clone)]
pub struct TranslationEngine {
    rules: RuleSet,
}

/// Matches rewritten by one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleHits {
    pub rule: String,
    pub matches: usize,
}

/// What a translation pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranslationReport {
    /// Statements in the input document.
    pub statements: usize,
    /// Per-rule counts, in rule order.
    pub rules: Vec<RuleHits>,
}

impl TranslationReport {
    /// Total rewritten matches.
    pub fn total_rewrites(&self) -> usize {
        self.rules.iter().map(|r| r.matches).sum()
    }

    /// Matches rewritten by the rule called `name`.
    pub fn hits(&self, name: &str) -> usize {
        self.rules
            .iter()
            .find(|r| r.rule == name)
            .map(|r| r.matches)
            .unwrap_or(0)
    }
}

impl TranslationEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Built-in rules, routines qualified with `dbo`.
    pub fn mssql() -> Result<Self> {
        Ok(Self::new(RuleSet::mssql("dbo")?))
    }

    /// Built-in rules followed by the configured extra rules.
    pub fn from_config(config: &TranslationConfig) -> Result<Self> {
        let mut rules = RuleSet::mssql(&config.routine_schema)?;
        for custom in &config.extra_rules {
            rules.push(RewriteRule::from_custom(custom)?);
        }
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Translate a document.
    pub fn translate(&self, doc: &SchemaDocument) -> SchemaDocument {
        self.translate_with_report(doc).0
    }

    /// Translate a document and report what each rule rewrote.
    pub fn translate_with_report(&self, doc: &SchemaDocument) -> (SchemaDocument, TranslationReport) {
        let mut text = doc.text().to_string();
        let mut report = TranslationReport {
            statements: doc.statements().len(),
            rules: Vec::with_capacity(self.rules.len()),
        };

        for rule in self.rules.rules() {
            let (rewritten, matches) = rule.apply(&text);
            if matches > 0 {
                debug!("rule {} rewrote {} match(es)", rule.name(), matches);
                text = rewritten.into_owned();
            }
            report.rules.push(RuleHits {
                rule: rule.name().to_string(),
                matches,
            });
        }

        debug!(
            "Translated {} ({} statements, {} rewrites)",
            doc.display_name(),
            report.statements,
            report.total_rewrites()
        );
        (doc.derive(text), report)
    }

    /// Translate a bare column type such as `VARCHAR(50)` or `SERIAL`.
    ///
    /// Only type and identity rules apply; key, default and routine rules
    /// never match a type on its own.
    pub fn translate_type(&self, column_type: &str) -> String {
        let mut text = column_type.trim().to_string();
        for rule in self.rules.rules() {
            if matches!(rule.stage(), RuleStage::ScalarType | RuleStage::Identity | RuleStage::Custom) {
                let (rewritten, matches) = rule.apply(&text);
                if matches > 0 {
                    text = rewritten.into_owned();
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomRule;

    fn engine() -> TranslationEngine {
        TranslationEngine::mssql().unwrap()
    }

    fn translate(sql: &str) -> String {
        engine().translate(&SchemaDocument::from_text(sql)).text().to_string()
    }

    const USERS: &str = "CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(50), active BOOLEAN, created TIMESTAMP DEFAULT CURRENT_TIMESTAMP);";

    #[test]
    fn test_users_table_end_to_end() {
        let out = translate(USERS);
        for expected in [
            "INT IDENTITY",
            "PRIMARY KEY CLUSTERED",
            "NVARCHAR(50)",
            "BIT",
            "DATETIME",
            "DEFAULT GETDATE()",
        ] {
            assert!(out.contains(expected), "missing {} in {}", expected, out);
        }
        assert_eq!(
            out,
            "CREATE TABLE users (id INT IDENTITY PRIMARY KEY CLUSTERED, name NVARCHAR(50), active BIT, created DATETIME DEFAULT GETDATE());"
        );
    }

    #[test]
    fn test_date_and_default_in_one_statement() {
        let out = translate("CREATE TABLE t (d DATE DEFAULT CURRENT_TIMESTAMP)");
        assert!(out.contains("DATETIME"));
        assert!(out.contains("DEFAULT GETDATE()"));
    }

    #[test]
    fn test_word_boundaries() {
        let sql = "CREATE TABLE t (textual_notes VARCHAR(10), datepublished INT, serial_no INT)";
        let out = translate(sql);
        assert!(out.contains("textual_notes NVARCHAR(10)"));
        assert!(out.contains("datepublished INT"));
        assert!(out.contains("serial_no INT"));
    }

    #[test]
    fn test_commented_column_list() {
        let out = translate("CREATE TABLE t (\n  id INT, -- key\n  date DATE\n);");
        assert!(out.contains("  date DATETIME"), "{}", out);
        assert!(!out.contains("DATETIME DATETIME"));

        let out = translate("CREATE TABLE t (seen DATE COMMENT 'last date seen');");
        assert_eq!(out, "CREATE TABLE t (seen DATETIME COMMENT 'last date seen');");
    }

    #[test]
    fn test_text_rule_leaves_textual_notes_alone() {
        let (out, n) = engine()
            .rules()
            .rules()
            .iter()
            .find(|r| r.name() == "text")
            .unwrap()
            .apply("ALTER TABLE t ADD textual_notes INT");
        assert_eq!(out, "ALTER TABLE t ADD textual_notes INT");
        assert_eq!(n, 0);
    }

    #[test]
    fn test_translation_is_idempotent() {
        let sql = r#"
CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(50), active BOOLEAN, created TIMESTAMP DEFAULT CURRENT_TIMESTAMP);
CREATE TABLE orders (id INT AUTO_INCREMENT, user_id INT, note TEXT, placed DATE, PRIMARY KEY (id), FOREIGN KEY (user_id) REFERENCES users(id));
CREATE FUNCTION total_orders() RETURNS INT AS $$ SELECT COUNT(*) FROM orders $$;
CREATE PROCEDURE purge_orders() BEGIN DELETE FROM orders; END;
DROP PROCEDURE purge_orders;
DROP FUNCTION IF EXISTS total_orders;
DROP TRIGGER audit_users;
"#;
        let doc = SchemaDocument::from_text(sql);
        let once = engine().translate(&doc);
        let twice = engine().translate(&once);
        assert_eq!(once, twice);

        let (_, report) = engine().translate_with_report(&once);
        assert_eq!(report.total_rewrites(), 0);
    }

    #[test]
    fn test_routines_and_drops() {
        let out = translate(
            "CREATE PROCEDURE purge() BEGIN END; DROP PROCEDURE purge; DROP FUNCTION IF EXISTS f; CREATE TRIGGER sales.trg",
        );
        assert!(out.contains("CREATE PROCEDURE dbo.purge()"));
        assert!(out.contains("DROP PROCEDURE IF EXISTS purge"));
        assert!(out.contains("DROP FUNCTION IF EXISTS f"));
        assert!(!out.contains("IF EXISTS IF EXISTS"));
        assert!(out.contains("CREATE TRIGGER sales.trg"));
    }

    #[test]
    fn test_create_or_replace_becomes_create_or_alter() {
        let out = translate("CREATE OR REPLACE FUNCTION f() RETURNS INT");
        assert_eq!(out, "CREATE OR ALTER FUNCTION dbo.f() RETURNS INT");
    }

    #[test]
    fn test_foreign_keys_and_unique_pass_through() {
        let sql = "ALTER TABLE o ADD CONSTRAINT fk FOREIGN KEY (u) REFERENCES users(id), ADD UNIQUE (code)";
        assert_eq!(translate(sql), sql);
    }

    #[test]
    fn test_input_document_is_not_mutated() {
        let doc = SchemaDocument::from_text(USERS);
        let _ = engine().translate(&doc);
        assert_eq!(doc.text(), USERS);
    }

    #[test]
    fn test_report_counts() {
        let (_, report) = engine().translate_with_report(&SchemaDocument::from_text(USERS));
        assert_eq!(report.statements, 1);
        assert_eq!(report.hits("serial"), 1);
        assert_eq!(report.hits("varchar"), 1);
        assert_eq!(report.hits("default_getdate"), 1);
        assert_eq!(report.hits("drop_if_exists"), 0);
        assert_eq!(report.total_rewrites(), 6);
    }

    #[test]
    fn test_extra_rules_run_after_builtins() {
        let config = TranslationConfig {
            routine_schema: "app".into(),
            extra_rules: vec![CustomRule {
                name: "jsonb".into(),
                pattern: r"\bJSONB\b".into(),
                replacement: "NVARCHAR(MAX)".into(),
            }],
        };
        let engine = TranslationEngine::from_config(&config).unwrap();
        let out = engine.translate(&SchemaDocument::from_text(
            "CREATE TABLE t (doc JSONB); CREATE FUNCTION f()",
        ));
        assert_eq!(out.text(), "CREATE TABLE t (doc NVARCHAR(MAX)); CREATE FUNCTION app.f()");
        assert_eq!(engine.rules().rules().last().unwrap().stage(), RuleStage::Custom);
    }

    #[test]
    fn test_translate_type() {
        let engine = engine();
        assert_eq!(engine.translate_type("varchar(50)"), "NVARCHAR(50)");
        assert_eq!(engine.translate_type("SERIAL"), "INT IDENTITY");
        assert_eq!(engine.translate_type("timestamptz"), "DATETIMEOFFSET");
        assert_eq!(engine.translate_type("INT"), "INT");
    }
}
