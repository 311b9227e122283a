//! Identifier validation, quoting and unquoting.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! driver builds its SQL from names quoted here. Names are validated first
//! (non-empty, no NUL, bounded length) and then quoted in the engine's style
//! with the closing quote character doubled.

use crate::config::DriverKind;
use crate::error::{MigrateError, Result};

/// SQL Server allows 128 characters; PostgreSQL and MySQL are lower but
/// truncate or reject on their own.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject identifiers that cannot be quoted safely.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".to_string()));
    }
    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains a null byte: {:?}",
            name
        )));
    }
    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }
    Ok(())
}

/// `"name"`
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `` `name` ``
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// `[name]`
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote `name` for `driver`. The memory driver uses MSSQL quoting.
pub fn quote_for(driver: DriverKind, name: &str) -> Result<String> {
    match driver {
        DriverKind::Postgres => quote_pg(name),
        DriverKind::Mysql => quote_mysql(name),
        DriverKind::Mssql | DriverKind::Memory => quote_mssql(name),
    }
}

/// `schema.table`, or just `table` when the schema is empty.
pub fn qualify_for(driver: DriverKind, schema: &str, table: &str) -> Result<String> {
    if schema.is_empty() {
        return quote_for(driver, table);
    }
    Ok(format!(
        "{}.{}",
        quote_for(driver, schema)?,
        quote_for(driver, table)?
    ))
}

/// Strip one level of `"…"`, `` `…` `` or `[…]` quoting and undo doubling.
pub fn unquote(name: &str) -> String {
    let name = name.trim();
    let mut chars = name.chars();
    let (first, last) = match (chars.next(), chars.next_back()) {
        (Some(f), Some(l)) => (f, l),
        _ => return name.to_string(),
    };
    let inner = &name[first.len_utf8()..name.len() - last.len_utf8()];
    match (first, last) {
        ('"', '"') => inner.replace("\"\"", "\""),
        ('`', '`') => inner.replace("``", "`"),
        ('[', ']') => inner.replace("]]", "]"),
        _ => name.to_string(),
    }
}

/// Last component of a possibly qualified, possibly quoted name, unquoted.
///
/// `[dbo].[Users]` → `Users`, `public.users` → `users`.
pub fn base_name(name: &str) -> String {
    let mut depth_quote: Option<char> = None;
    let mut split_at = 0;
    for (i, c) in name.char_indices() {
        match (depth_quote, c) {
            (None, '"') | (None, '`') => depth_quote = Some(c),
            (None, '[') => depth_quote = Some(']'),
            (Some(q), c) if c == q => depth_quote = None,
            (None, '.') => split_at = i + 1,
            _ => {}
        }
    }
    unquote(&name[split_at..])
}
