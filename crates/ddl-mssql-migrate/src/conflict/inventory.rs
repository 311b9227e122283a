//! Table and column inventory extracted from `CREATE TABLE` statements.
//!
//! This is a lexical scan, not a parser: it understands quoting, nested
//! parentheses and the handful of column flags the migration cares about.
//! Anything that is not a `CREATE TABLE` is ignored.

use crate::core::identifier::{base_name, unquote};
use crate::dialect::{strip_comments, SchemaDocument};

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type as written, e.g. `NVARCHAR(50)`.
    pub data_type: String,
    pub is_nullable: bool,
    pub is_identity: bool,
}

impl ColumnDef {
    /// Upper-cased type name without length, precision or modifiers.
    pub fn base_type(&self) -> String {
        base_type(&self.data_type)
    }
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Schema qualifier as written, if any.
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.is_identity)
    }
}

/// All tables declared by a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaInventory {
    pub tables: Vec<TableDef>,
}

impl SchemaInventory {
    pub fn from_document(doc: &SchemaDocument) -> Self {
        let tables = doc
            .statements()
            .iter()
            .filter_map(|stmt| parse_create_table(stmt))
            .collect();
        Self { tables }
    }

    /// Find a table by unqualified name, case-insensitively.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Upper-cased type name without arguments: `nvarchar(50)` → `NVARCHAR`.
pub fn base_type(data_type: &str) -> String {
    let end = data_type
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(data_type.len());
    data_type[..end].to_ascii_uppercase()
}

/// Parse a single `CREATE TABLE` statement.
pub fn parse_create_table(statement: &str) -> Option<TableDef> {
    let stmt = strip_comments(statement.trim());
    let words = tokens(&stmt);
    let mut i = 0;
    let upper = |i: usize| words.get(i).map(|w| w.to_ascii_uppercase());

    if upper(i)? != "CREATE" {
        return None;
    }
    i += 1;
    if upper(i).as_deref() == Some("OR") && upper(i + 1).as_deref() == Some("REPLACE") {
        i += 2;
    }
    while matches!(upper(i).as_deref(), Some("GLOBAL" | "LOCAL" | "TEMP" | "TEMPORARY")) {
        i += 1;
    }
    if upper(i)? != "TABLE" {
        return None;
    }
    i += 1;
    if upper(i).as_deref() == Some("IF")
        && upper(i + 1).as_deref() == Some("NOT")
        && upper(i + 2).as_deref() == Some("EXISTS")
    {
        i += 3;
    }

    // the name may be glued to the column list: `users(id INT)`
    let head = words.get(i)?;
    let (raw_name, body) = match top_level_paren(head) {
        Some(open) => (&head[..open], paren_body(&head[open..])?),
        None => (head.as_str(), paren_body(words.get(i + 1)?)?),
    };
    let raw_name = raw_name.trim();
    if raw_name.is_empty() {
        return None;
    }

    let name = base_name(raw_name);
    let schema = qualifier(raw_name);
    let mut table = TableDef {
        schema,
        name,
        columns: Vec::new(),
        primary_key: Vec::new(),
    };

    for element in split_top_level(body, ',') {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }
        let parts = tokens(element);
        let Some(first) = parts.first() else { continue };
        if parts.len() < 2 {
            continue;
        }
        match first.to_ascii_uppercase().as_str() {
            "CONSTRAINT" | "PRIMARY" | "FOREIGN" | "UNIQUE" | "KEY" | "INDEX" | "CHECK"
            | "FULLTEXT" | "SPATIAL" | "EXCLUDE" => {
                if let Some(cols) = table_primary_key(&parts) {
                    table.primary_key = cols;
                }
            }
            _ => {
                let (column, is_pk) = parse_column(&parts);
                if is_pk {
                    table.primary_key = vec![column.name.clone()];
                }
                table.columns.push(column);
            }
        }
    }

    for pk in &table.primary_key {
        if let Some(col) = table.columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(pk)) {
            col.is_nullable = false;
        }
    }

    Some(table)
}

const TYPE_CONTINUATIONS: &[&str] = &[
    "PRECISION", "VARYING", "UNSIGNED", "SIGNED", "ZEROFILL", "WITH", "WITHOUT", "TIME", "ZONE",
];

fn parse_column(parts: &[String]) -> (ColumnDef, bool) {
    let name = unquote(&parts[0]);
    let mut data_type = parts.get(1).cloned().unwrap_or_default();
    let mut rest = 2;
    while let Some(next) = parts.get(rest) {
        let upper = next.to_ascii_uppercase();
        if next.starts_with('(') {
            data_type.push_str(next);
        } else if TYPE_CONTINUATIONS.contains(&upper.as_str()) {
            data_type.push(' ');
            data_type.push_str(next);
        } else {
            break;
        }
        rest += 1;
    }

    let flags: Vec<String> = parts
        .get(rest..)
        .unwrap_or_default()
        .iter().map(|p| p.to_ascii_uppercase()).collect();
    let has_pair = |a: &str, b: &str| flags.windows(2).any(|w| w[0] == a && w[1] == b);

    let base = base_type(&data_type);
    let is_identity = matches!(base.as_str(), "SERIAL" | "BIGSERIAL" | "SMALLSERIAL")
        || flags
            .iter()
            .any(|f| f == "AUTO_INCREMENT" || f.starts_with("IDENTITY"));
    let is_pk = has_pair("PRIMARY", "KEY");

    let column = ColumnDef {
        name,
        data_type,
        is_nullable: !has_pair("NOT", "NULL") && !is_pk,
        is_identity,
    };
    (column, is_pk)
}

/// Column list of a table-level `PRIMARY KEY (...)`.
fn table_primary_key(parts: &[String]) -> Option<Vec<String>> {
    let at = parts
        .windows(2)
        .position(|w| w[0].eq_ignore_ascii_case("PRIMARY") && w[1].eq_ignore_ascii_case("KEY"))?;
    let list = parts[at + 2..].iter().find(|p| p.starts_with('('))?;
    let body = paren_body(list)?;
    Some(
        split_top_level(body, ',')
            .into_iter()
            .map(|c| {
                // MySQL prefix lengths: `name(10)`
                let c = c.trim();
                let c = top_level_paren(c).map_or(c, |p| &c[..p]);
                unquote(c.split_whitespace().next().unwrap_or(c))
            })
            .filter(|c| !c.is_empty())
            .collect(),
    )
}

fn qualifier(raw: &str) -> Option<String> {
    // byte offset of the last unquoted '.'
    let mut quote: Option<char> = None;
    let mut last_dot = None;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (None, '"') | (None, '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (Some(q), c) if c == q => quote = None,
            (None, '.') => last_dot = Some(i),
            _ => {}
        }
    }
    last_dot.map(|at| base_name(&raw[..at]))
}

/// Split on whitespace outside quotes and parentheses.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '[' => {
                quote = Some(']');
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Split on `sep` outside quotes and parentheses.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '[' => quote = Some(']'),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                out.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

/// Byte offset of the first `(` outside quotes.
fn top_level_paren(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (None, '(') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Contents of a leading parenthesized group: `(a, b) rest` → `a, b`.
fn paren_body(text: &str) -> Option<&str> {
    if !text.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_columns_and_flags() {
        let t = parse_create_table(
            "CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(50) NOT NULL, \
             price DECIMAL(10, 2), created TIMESTAMP WITH TIME ZONE DEFAULT now())",
        )
        .unwrap();
        assert_eq!(t.name, "users");
        assert_eq!(t.schema, None);
        assert_eq!(t.primary_key, vec!["id"]);
        assert_eq!(t.columns.len(), 4);

        let id = t.column("ID").unwrap();
        assert!(id.is_identity);
        assert!(!id.is_nullable);

        let name = t.column("name").unwrap();
        assert_eq!(name.data_type, "VARCHAR(50)");
        assert!(!name.is_nullable);

        assert_eq!(t.column("price").unwrap().data_type, "DECIMAL(10, 2)");
        assert_eq!(t.column("created").unwrap().data_type, "TIMESTAMP WITH TIME ZONE");
        assert_eq!(t.column("created").unwrap().base_type(), "TIMESTAMP");
    }

    #[test]
    fn test_comments_inside_table_body() {
        let t = parse_create_table("CREATE TABLE t (\n  id INT, -- id,pk,unique\n  name TEXT\n)").unwrap();
        let names: Vec<_> = t.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert!(t.primary_key.is_empty());

        let t = parse_create_table("CREATE TABLE t (id INT /* a, b */ NOT NULL, x, name TEXT)").unwrap();
        let names: Vec<_> = t.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert!(!t.column("id").unwrap().is_nullable);
    }

    #[test]
    fn test_table_level_constraints() {
        let t = parse_create_table(
            "CREATE TABLE IF NOT EXISTS `shop`.`order_items` (\n\
               `order_id` INT NOT NULL,\n\
               `line` INT NOT NULL AUTO_INCREMENT,\n\
               CONSTRAINT pk_items PRIMARY KEY (`order_id`, `line`),\n\
               FOREIGN KEY (order_id) REFERENCES orders(id)\n\
             ) ENGINE=InnoDB",
        )
        .unwrap();
        assert_eq!(t.schema.as_deref(), Some("shop"));
        assert_eq!(t.name, "order_items");
        assert_eq!(t.columns.len(), 2);
        assert_eq!(t.primary_key, vec!["order_id", "line"]);
        assert!(t.has_identity());
    }

    #[test]
    fn test_mssql_forms() {
        let t = parse_create_table(
            "CREATE TABLE [dbo].[Users](Id INT IDENTITY(1,1) PRIMARY KEY CLUSTERED, [Full Name] NVARCHAR (100))",
        )
        .unwrap();
        assert_eq!(t.name, "Users");
        assert_eq!(t.schema.as_deref(), Some("dbo"));
        assert!(t.column("id").unwrap().is_identity);
        assert_eq!(t.column("full name").unwrap().data_type, "NVARCHAR(100)");
    }

    #[test]
    fn test_non_table_statements_are_ignored() {
        assert!(parse_create_table("CREATE INDEX ix ON users(name)").is_none());
        assert!(parse_create_table("DROP TABLE users").is_none());
        assert!(parse_create_table("CREATE TABLE broken").is_none());
    }

    #[test]
    fn test_inventory_from_document() {
        let doc = SchemaDocument::from_text(
            "CREATE TABLE a (x INT);\nCREATE VIEW v AS SELECT 1;\nCREATE TABLE b (y TEXT);",
        );
        let inv = SchemaInventory::from_document(&doc);
        assert_eq!(inv.tables.len(), 2);
        assert!(inv.table("B").is_some());
        assert!(inv.table("v").is_none());
    }

    #[test]
    fn test_base_type() {
        assert_eq!(base_type("nvarchar(50)"), "NVARCHAR");
        assert_eq!(base_type("INT"), "INT");
        assert_eq!(base_type("double precision"), "DOUBLE");
    }
}
