//! `key=value;` connection strings.
//!
//! Values that contain `;`, `=`, quotes or surrounding whitespace are wrapped
//! in double quotes with embedded quotes doubled, the ADO.NET convention that
//! tiberius also parses.

use std::collections::HashMap;

use crate::error::{MigrateError, Result};

/// Join pairs into `k1=v1;k2=v2`.
pub fn format_pairs(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, quote_value(value)))
        .collect::<Vec<_>>()
        .join(";")
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains([';', '=', '"', '\''])
        || value.trim() != value
        || value.is_empty();
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Parse a connection string. Keys are trimmed and lowercased.
pub fn parse_pairs(input: &str) -> Result<HashMap<String, String>> {
    let mut pairs = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut key = String::new();
        let mut found_eq = false;
        for c in chars.by_ref() {
            match c {
                '=' => {
                    found_eq = true;
                    break;
                }
                ';' if key.trim().is_empty() => key.clear(),
                ';' => {
                    return Err(MigrateError::Config(format!(
                        "connection string segment '{}' has no value",
                        key.trim()
                    )))
                }
                _ => key.push(c),
            }
        }
        let key = key.trim().to_lowercase();
        if !found_eq {
            if key.is_empty() {
                break;
            }
            return Err(MigrateError::Config(format!(
                "connection string segment '{}' has no value",
                key
            )));
        }
        if key.is_empty() {
            return Err(MigrateError::Config(
                "connection string has an empty key".into(),
            ));
        }

        // skip leading whitespace before the value
        while chars.peek().is_some_and(|c| *c == ' ' || *c == '\t') {
            chars.next();
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(q @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == q {
                        if chars.peek() == Some(&q) {
                            chars.next();
                            value.push(q);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(MigrateError::Config(format!(
                        "connection string value for '{}' has an unterminated quote",
                        key
                    )));
                }
                // consume up to the separator
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        return Err(MigrateError::Config(format!(
                            "unexpected '{}' after quoted value for '{}'",
                            c, key
                        )));
                    }
                }
            }
            _ => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim_end().to_string();
            }
        }

        pairs.insert(key, value);
        if chars.peek().is_none() {
            break;
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_special_characters() {
        let pairs = vec![
            ("Server", "tcp:db,1433".to_string()),
            ("Password", "a;b=\"c\"".to_string()),
            ("User Id", " padded ".to_string()),
            ("Database", String::new()),
        ];
        let formatted = format_pairs(&pairs);
        let parsed = parse_pairs(&formatted).unwrap();
        assert_eq!(parsed["server"], "tcp:db,1433");
        assert_eq!(parsed["password"], "a;b=\"c\"");
        assert_eq!(parsed["user id"], " padded ");
        assert_eq!(parsed["database"], "");
    }

    #[test]
    fn test_plain_values_are_not_quoted() {
        let s = format_pairs(&[("host", "localhost".to_string()), ("port", "5432".to_string())]);
        assert_eq!(s, "host=localhost;port=5432");
    }

    #[test]
    fn test_parse_tolerates_trailing_separator_and_spaces() {
        let parsed = parse_pairs(" Host = db ; Port=5432; ").unwrap();
        assert_eq!(parsed["host"], "db");
        assert_eq!(parsed["port"], "5432");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_single_quoted_value() {
        let parsed = parse_pairs("password='it''s';user=sa").unwrap();
        assert_eq!(parsed["password"], "it's");
        assert_eq!(parsed["user"], "sa");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_pairs("host").is_err());
        assert!(parse_pairs("host;port=1").is_err());
        assert!(parse_pairs("password=\"open").is_err());
        assert!(parse_pairs("=value").is_err());
    }
}
