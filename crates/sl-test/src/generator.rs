//! Test SQL generation

use sl_core::sql_utils::{quote_ident, quote_qualified, string_literal, strip_trailing_semicolon};
use sl_core::{TestCheck, TestSpec};
use thiserror::Error;

/// Error type for test SQL generation
#[derive(Error, Debug, PartialEq)]
pub enum TestGenError {
    /// A column-scoped check has no target column
    #[error("{check} test on '{table}' needs a target column")]
    MissingColumn { check: String, table: String },

    /// An accepted_values check with nothing to accept
    #[error("accepted_values test on '{table}' lists no values")]
    NoAcceptedValues { table: String },

    /// A custom SQL check with an empty query
    #[error("custom test on '{table}' has an empty query")]
    EmptyQuery { table: String },
}

/// Result type alias for test generation
pub type TestGenResult<T> = Result<T, TestGenError>;

/// Generate SQL for a unique test
///
/// Returns rows that violate the unique constraint (duplicates).
pub fn generate_unique_test(table: &str, column: &str) -> String {
    let qt = quote_qualified(table);
    let qc = quote_ident(column);
    format!("SELECT {qc}, COUNT(*) AS cnt\nFROM {qt}\nWHERE {qc} IS NOT NULL\nGROUP BY {qc}\nHAVING COUNT(*) > 1")
}

/// Generate SQL for a not_null test
pub fn generate_not_null_test(table: &str, column: &str) -> String {
    format!(
        "SELECT * FROM {} WHERE {} IS NULL",
        quote_qualified(table),
        quote_ident(column)
    )
}

/// Generate SQL for an accepted_values test
///
/// Numeric-looking values are emitted bare, everything else as an escaped
/// string literal. NULLs count as failures.
pub fn generate_accepted_values_test(table: &str, column: &str, values: &[String]) -> String {
    let values_list = values
        .iter()
        .map(|v| {
            if v.parse::<f64>().is_ok() {
                v.clone()
            } else {
                string_literal(v)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let qt = quote_qualified(table);
    let qc = quote_ident(column);

    format!("SELECT * FROM {qt} WHERE {qc} NOT IN ({values_list}) OR {qc} IS NULL")
}

/// Generate SQL for a relationships test
///
/// Returns rows whose non-null value has no match in `ref_table.ref_column`.
pub fn generate_relationship_test(
    table: &str,
    column: &str,
    ref_table: &str,
    ref_column: &str,
) -> String {
    let qt = quote_qualified(table);
    let qc = quote_ident(column);
    let qrt = quote_qualified(ref_table);
    let qrc = quote_ident(ref_column);
    format!(
        "SELECT src.{qc}\n\
         FROM {qt} AS src\n\
         WHERE src.{qc} IS NOT NULL\n\
         \x20 AND NOT EXISTS (\n\
         \x20   SELECT 1 FROM {qrt} AS ref_tbl\n\
         \x20   WHERE ref_tbl.{qrc} = src.{qc}\n\
         \x20 )"
    )
}

/// Failing-rows query for a test node
pub fn generate_test_sql(spec: &TestSpec) -> TestGenResult<String> {
    let table = spec.target_table.as_str();
    let column = || {
        spec.target_column
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| TestGenError::MissingColumn {
                check: check_name(&spec.check).to_string(),
                table: table.to_string(),
            })
    };

    Ok(match &spec.check {
        TestCheck::NotNull => generate_not_null_test(table, column()?),
        TestCheck::Unique => generate_unique_test(table, column()?),
        TestCheck::AcceptedValues { values } => {
            if values.is_empty() {
                return Err(TestGenError::NoAcceptedValues {
                    table: table.to_string(),
                });
            }
            generate_accepted_values_test(table, column()?, values)
        }
        TestCheck::Relationships { to, field } => {
            generate_relationship_test(table, column()?, to, field)
        }
        TestCheck::Sql { sql } => {
            let query = strip_trailing_semicolon(sql);
            if query.trim().is_empty() {
                return Err(TestGenError::EmptyQuery {
                    table: table.to_string(),
                });
            }
            query.to_string()
        }
    })
}

fn check_name(check: &TestCheck) -> &'static str {
    match check {
        TestCheck::NotNull => "not_null",
        TestCheck::Unique => "unique",
        TestCheck::AcceptedValues { .. } => "accepted_values",
        TestCheck::Relationships { .. } => "relationships",
        TestCheck::Sql { .. } => "sql",
    }
}

#[cfg(test)]
#[path = "generator_test.rs"]
mod tests;
