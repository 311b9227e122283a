//! MySQL/PostgreSQL to MSSQL DDL translation.
//!
//! Translation is a flat, ordered list of rewrite rules applied to raw DDL
//! text. There is no SQL parser: rules are regular expressions scoped to
//! word boundaries, with guards where a rule would otherwise fire twice.
//!
//! ```rust
//! use ddl_mssql_migrate::dialect::{SchemaDocument, TranslationEngine};
//!
//! let engine = TranslationEngine::mssql().unwrap();
//! let doc = SchemaDocument::from_text("CREATE TABLE t (id SERIAL PRIMARY KEY);");
//! let out = engine.translate(&doc);
//! assert_eq!(out.text(), "CREATE TABLE t (id INT IDENTITY PRIMARY KEY CLUSTERED);");
//! ```

mod document;
mod engine;
mod rule;

pub use document::SchemaDocument;
pub(crate) use document::strip_comments;
pub use engine::{RuleHits, TranslationEngine, TranslationReport};
pub use rule::{Guard, RewriteRule, RuleSet, RuleStage};
