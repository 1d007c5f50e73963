//! Helpers for building the SQL the executor hands to an adapter.
//!
//! Identifiers are always double-quoted and string literals always escaped,
//! since node ids and configured columns come from user input.

/// Double-quote an identifier, doubling embedded quotes.
///
/// # Examples
/// ```
/// use sl_core::sql_utils::quote_ident;
/// assert_eq!(quote_ident("orders"), r#""orders""#);
/// assert_eq!(quote_ident(r#"odd"name"#), r#""odd""name""#);
/// ```
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote each dot-separated part of a qualified name.
///
/// # Examples
/// ```
/// use sl_core::sql_utils::quote_qualified;
/// assert_eq!(quote_qualified("staging.orders"), r#""staging"."orders""#);
/// ```
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Split a qualified name at its last dot into `(schema, table)`.
///
/// A bare name yields `None` for the schema.
pub fn split_qualified_name(name: &str) -> (Option<&str>, &str) {
    match name.rfind('.') {
        Some(pos) => (Some(&name[..pos]), &name[pos + 1..]),
        None => (None, name),
    }
}

/// Escape a value for use inside a single-quoted string literal
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Single-quoted, escaped string literal
pub fn string_literal(value: &str) -> String {
    format!("'{}'", escape_sql_string(value))
}

/// Restrict `query` to the rows matching `predicate`.
///
/// The query is wrapped as a derived table so the predicate can reference
/// any of its output columns regardless of how the query is written.
pub fn filter_query(query: &str, predicate: &str) -> String {
    format!(
        "SELECT * FROM ({}) AS __sl_src WHERE {}",
        strip_trailing_semicolon(query),
        predicate
    )
}

/// Remove trailing whitespace and semicolons so a query can be nested
pub fn strip_trailing_semicolon(query: &str) -> &str {
    query.trim_end().trim_end_matches(';').trim_end()
}

#[cfg(test)]
#[path = "sql_utils_test.rs"]
mod tests;
