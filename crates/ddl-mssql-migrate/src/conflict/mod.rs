//! Naming and type conflicts between the source schema and the target.
//!
//! The resolver compares the tables and columns declared in two documents.
//! A source identifier missing from the target is a name mismatch, resolved
//! automatically when a configured rename points at something the target
//! has. A column present on both sides whose translated type differs from
//! the target type is a type mismatch. Records are advisory; the documents
//! are never changed.

mod inventory;

pub use inventory::{base_type, parse_create_table, ColumnDef, SchemaInventory, TableDef};

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::dialect::{SchemaDocument, TranslationEngine};

/// What does not line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    NameMismatch,
    TypeMismatch,
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A configured rename maps the identifier onto the target.
    AutoRenamed,
    /// Someone has to add a rename or fix the target schema.
    RequiresManualRule,
}

/// One conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    pub source_identifier: String,
    pub target_identifier: String,
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ConflictRecord {
    pub fn is_blocking(&self) -> bool {
        self.resolution == Resolution::RequiresManualRule
    }
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ConflictKind::NameMismatch => "name mismatch",
            ConflictKind::TypeMismatch => "type mismatch",
        };
        let resolution = match self.resolution {
            Resolution::AutoRenamed => "auto renamed",
            Resolution::RequiresManualRule => "requires manual rule",
        };
        write!(
            f,
            "{} {} -> {} ({})",
            kind, self.source_identifier, self.target_identifier, resolution
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// True if any record needs a manual rule.
pub fn has_blocking(records: &[ConflictRecord]) -> bool {
    records.iter().any(ConflictRecord::is_blocking)
}

/// Blocking records joined for an error message.
pub fn blocking_summary(records: &[ConflictRecord]) -> String {
    records
        .iter()
        .filter(|r| r.is_blocking())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Finds conflicts between a source and a target document.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    engine: TranslationEngine,
    /// Lower-cased `table` or `table.column` to target name.
    renames: BTreeMap<String, String>,
}

impl ConflictResolver {
    pub fn new(engine: TranslationEngine, renames: &BTreeMap<String, String>) -> Self {
        let renames = renames
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .collect();
        Self { engine, renames }
    }

    /// Compare `source` (untranslated) with `target` (MSSQL DDL).
    pub fn find_conflicts(
        &self,
        source: &SchemaDocument,
        target: &SchemaDocument,
    ) -> Vec<ConflictRecord> {
        let source_inv = SchemaInventory::from_document(source);
        let target_inv = SchemaInventory::from_document(target);
        let mut records = Vec::new();

        for table in &source_inv.tables {
            let target_table = match target_inv.table(&table.name) {
                Some(t) => t,
                None => {
                    let renamed = self.renames.get(&table.name.to_lowercase());
                    let found = renamed.and_then(|r| target_inv.table(r));
                    records.push(ConflictRecord {
                        kind: ConflictKind::NameMismatch,
                        source_identifier: table.name.clone(),
                        target_identifier: renamed.cloned().unwrap_or_else(|| table.name.clone()),
                        resolution: if found.is_some() {
                            Resolution::AutoRenamed
                        } else {
                            Resolution::RequiresManualRule
                        },
                        detail: None,
                    });
                    match found {
                        Some(t) => t,
                        None => continue,
                    }
                }
            };

            for column in &table.columns {
                let source_id = format!("{}.{}", table.name, column.name);
                let target_column = match target_table.column(&column.name) {
                    Some(c) => c,
                    None => {
                        let renamed = self
                            .renames
                            .get(&source_id.to_lowercase())
                            .or_else(|| self.renames.get(&column.name.to_lowercase()));
                        let found = renamed.and_then(|r| target_table.column(r));
                        records.push(ConflictRecord {
                            kind: ConflictKind::NameMismatch,
                            source_identifier: source_id.clone(),
                            target_identifier: format!(
                                "{}.{}",
                                target_table.name,
                                renamed.map_or(column.name.as_str(), |r| r.as_str())
                            ),
                            resolution: if found.is_some() {
                                Resolution::AutoRenamed
                            } else {
                                Resolution::RequiresManualRule
                            },
                            detail: None,
                        });
                        match found {
                            Some(c) => c,
                            None => continue,
                        }
                    }
                };

                let translated = self.engine.translate_type(&column.data_type);
                let expected = canonical_base(&translated);
                let actual = canonical_base(&target_column.data_type);
                if expected != actual {
                    records.push(ConflictRecord {
                        kind: ConflictKind::TypeMismatch,
                        source_identifier: source_id,
                        target_identifier: format!("{}.{}", target_table.name, target_column.name),
                        resolution: Resolution::RequiresManualRule,
                        detail: Some(format!(
                            "{} translates to {}, target has {}",
                            column.data_type, translated, target_column.data_type
                        )),
                    });
                }
            }
        }

        for record in &records {
            debug!("Conflict: {}", record);
        }
        let blocking = records.iter().filter(|r| r.is_blocking()).count();
        info!(
            "Conflict check: {} tables, {} conflicts ({} blocking)",
            source_inv.tables.len(),
            records.len(),
            blocking
        );
        records
    }
}

/// Base type with common spellings folded together.
fn canonical_base(data_type: &str) -> String {
    let base = base_type(data_type);
    match base.as_str() {
        "INTEGER" | "INT4" => "INT".into(),
        "INT8" => "BIGINT".into(),
        "INT2" => "SMALLINT".into(),
        "DEC" | "NUMERIC" => "DECIMAL".into(),
        "DATETIME2" => "DATETIME".into(),
        "CHARACTER" => "CHAR".into(),
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(renames: &[(&str, &str)]) -> ConflictResolver {
        let renames = renames
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConflictResolver::new(TranslationEngine::mssql().unwrap(), &renames)
    }

    const SOURCE: &str = "CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(50), active BOOLEAN);";

    #[test]
    fn test_translation_of_itself_has_no_conflicts() {
        let source = SchemaDocument::from_text(SOURCE);
        let r = resolver(&[]);
        let target = TranslationEngine::mssql().unwrap().translate(&source);
        assert!(r.find_conflicts(&source, &target).is_empty());
    }

    #[test]
    fn test_missing_column_requires_manual_rule() {
        let source = SchemaDocument::from_text(SOURCE);
        let target = SchemaDocument::from_text(
            "CREATE TABLE users (id INT IDENTITY PRIMARY KEY CLUSTERED, full_name NVARCHAR(50), active BIT);",
        );
        let records = resolver(&[]).find_conflicts(&source, &target);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ConflictKind::NameMismatch);
        assert_eq!(records[0].source_identifier, "users.name");
        assert_eq!(records[0].resolution, Resolution::RequiresManualRule);
        assert!(has_blocking(&records));
    }

    #[test]
    fn test_rename_resolves_automatically() {
        let source = SchemaDocument::from_text(SOURCE);
        let target = SchemaDocument::from_text(
            "CREATE TABLE app_users (id INT IDENTITY, full_name NVARCHAR(50), active BIT);",
        );
        let records = resolver(&[("users", "app_users"), ("users.name", "full_name")])
            .find_conflicts(&source, &target);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.resolution == Resolution::AutoRenamed));
        assert_eq!(records[0].target_identifier, "app_users");
        assert_eq!(records[1].target_identifier, "app_users.full_name");
        assert!(!has_blocking(&records));
    }

    #[test]
    fn test_rename_to_missing_target_still_blocks() {
        let source = SchemaDocument::from_text(SOURCE);
        let target = SchemaDocument::from_text("CREATE TABLE people (id INT);");
        let records = resolver(&[("users", "members")]).find_conflicts(&source, &target);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_identifier, "members");
        assert!(records[0].is_blocking());
    }

    #[test]
    fn test_type_mismatch() {
        let source = SchemaDocument::from_text(SOURCE);
        let target = SchemaDocument::from_text(
            "CREATE TABLE users (id INTEGER, name NVARCHAR(80), active NVARCHAR(5));",
        );
        let records = resolver(&[]).find_conflicts(&source, &target);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ConflictKind::TypeMismatch);
        assert_eq!(records[0].source_identifier, "users.active");
        assert!(records[0].detail.as_deref().unwrap().contains("BIT"));
        assert!(blocking_summary(&records).contains("users.active"));
    }

    #[test]
    fn test_documents_are_not_mutated() {
        let source = SchemaDocument::from_text(SOURCE);
        let target = SchemaDocument::from_text("CREATE TABLE other (x INT);");
        let _ = resolver(&[]).find_conflicts(&source, &target);
        assert_eq!(source.text(), SOURCE);
        assert_eq!(target.text(), "CREATE TABLE other (x INT);");
    }

    #[test]
    fn test_record_serializes_snake_case() {
        let record = ConflictRecord {
            kind: ConflictKind::NameMismatch,
            source_identifier: "a".into(),
            target_identifier: "b".into(),
            resolution: Resolution::RequiresManualRule,
            detail: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"name_mismatch\""));
        assert!(json.contains("\"requires_manual_rule\""));
        assert!(!json.contains("detail"));
    }
}
