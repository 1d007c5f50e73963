//! Per-model materialization settings: strategy, time column and lookback.

use crate::error::{CoreError, CoreResult};
use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Write mode used to materialize a table node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    /// Replace the whole target table from the unfiltered query (default)
    #[default]
    Full,
    /// INSERT the filtered rows, no deduplication
    Append,
    /// UPSERT the filtered rows by `unique_key`
    Merge,
    /// DELETE rows matching the filter predicate, then INSERT the filtered rows
    DeleteInsert,
}

impl IncrementalStrategy {
    /// Whether this strategy ever runs a partial (filtered) load
    pub fn is_incremental(&self) -> bool {
        !matches!(self, IncrementalStrategy::Full)
    }
}

impl fmt::Display for IncrementalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncrementalStrategy::Full => write!(f, "full"),
            IncrementalStrategy::Append => write!(f, "append"),
            IncrementalStrategy::Merge => write!(f, "merge"),
            IncrementalStrategy::DeleteInsert => write!(f, "delete_insert"),
        }
    }
}

/// Declared SQL type of the time/versioning column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeColumnType {
    /// TIMESTAMP column (default)
    #[default]
    Timestamp,
    /// DATE column
    Date,
    /// Monotonic numeric version / sequence column
    Numeric,
}

impl fmt::Display for TimeColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeColumnType::Timestamp => write!(f, "timestamp"),
            TimeColumnType::Date => write!(f, "date"),
            TimeColumnType::Numeric => write!(f, "numeric"),
        }
    }
}

/// What to do when the recorded strategy differs from the configured one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMismatchPolicy {
    /// Proceed incrementally with the configured strategy, silently
    Ignore,
    /// Proceed incrementally and emit a diagnostic (default)
    #[default]
    Warn,
    /// Fail the model
    Error,
}

impl fmt::Display for StrategyMismatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyMismatchPolicy::Ignore => write!(f, "ignore"),
            StrategyMismatchPolicy::Warn => write!(f, "warn"),
            StrategyMismatchPolicy::Error => write!(f, "error"),
        }
    }
}

/// Overlap subtracted from the watermark to re-include late-arriving rows.
///
/// Written as `"90s"`, `"15m"`, `"1h"`, `"2d"` (or the long unit names) for
/// timestamp and date columns, or as a bare integer offset for numeric
/// columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookbackWindow {
    /// Wall-clock overlap
    Duration(TimeDelta),
    /// Offset in the units of a numeric version column
    Offset(i64),
}

impl FromStr for LookbackWindow {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = |reason: &str| CoreError::InvalidLookback {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let text = s.trim();
        if text.is_empty() {
            return Err(invalid("empty value"));
        }
        if let Ok(offset) = text.parse::<i64>() {
            if offset < 0 {
                return Err(invalid("must not be negative"));
            }
            return Ok(LookbackWindow::Offset(offset));
        }

        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid("missing unit"))?;
        let (count, unit) = text.split_at(split);
        let count: i64 = count
            .parse()
            .map_err(|_| invalid("expected a non-negative integer count"))?;
        let unit_secs: i64 = match unit.trim().to_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            _ => return Err(invalid("unknown unit, expected s, m, h, d or w")),
        };
        let delta = count
            .checked_mul(unit_secs)
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| invalid("duration out of range"))?;
        Ok(LookbackWindow::Duration(delta))
    }
}

impl fmt::Display for LookbackWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookbackWindow::Offset(n) => write!(f, "{}", n),
            LookbackWindow::Duration(d) => {
                let secs = d.num_seconds();
                if secs != 0 && secs % 86_400 == 0 {
                    write!(f, "{}d", secs / 86_400)
                } else if secs != 0 && secs % 3_600 == 0 {
                    write!(f, "{}h", secs / 3_600)
                } else if secs != 0 && secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{}s", secs)
                }
            }
        }
    }
}

impl Serialize for LookbackWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LookbackWindow::Offset(n) => serializer.serialize_i64(*n),
            LookbackWindow::Duration(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for LookbackWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => n.to_string().parse().map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Per-model materialization declaration.
///
/// Supplied by the upstream parser alongside each table record and treated
/// as read-only input by the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterializationConfig {
    /// Write mode
    #[serde(default)]
    pub strategy: IncrementalStrategy,

    /// Column (or expression) whose high-water value anchors incremental runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,

    /// Declared type of `time_column`, drives literal casting
    #[serde(default)]
    pub time_column_type: TimeColumnType,

    /// Merge key columns
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub unique_key: Vec<String>,

    /// Overlap subtracted from the watermark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_window: Option<LookbackWindow>,

    /// Predicate with `@name` / `{{name}}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_template: Option<String>,
}

impl MaterializationConfig {
    /// Shorthand for a config with the given strategy and no other settings
    pub fn with_strategy(strategy: IncrementalStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Check the configuration shape for `node`.
    ///
    /// These are run-level errors: a single invalid model aborts the run
    /// before any adapter call.
    pub fn validate(&self, node: &str) -> CoreResult<()> {
        let invalid = |message: String| CoreError::ConfigInvalid {
            node: node.to_string(),
            message,
        };

        let has_filter = self.time_column.is_some() || self.filter_template.is_some();
        match self.strategy {
            IncrementalStrategy::Full => return Ok(()),
            IncrementalStrategy::Merge => {
                if self.unique_key.iter().all(|k| k.trim().is_empty()) {
                    return Err(invalid(
                        "merge strategy requires a non-empty unique_key".to_string(),
                    ));
                }
            }
            IncrementalStrategy::Append | IncrementalStrategy::DeleteInsert => {
                if !has_filter {
                    return Err(invalid(format!(
                        "{} strategy requires a time_column or a filter_template",
                        self.strategy
                    )));
                }
            }
        }

        match (self.lookback_window, self.time_column_type) {
            (Some(LookbackWindow::Offset(_)), TimeColumnType::Timestamp | TimeColumnType::Date) => {
                Err(invalid(format!(
                    "lookback_window must be a duration for a {} time column",
                    self.time_column_type
                )))
            }
            (Some(LookbackWindow::Duration(_)), TimeColumnType::Numeric) => Err(invalid(
                "lookback_window must be an integer offset for a numeric time column".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        OneOrMany::Many(v) => v,
    })
}

#[cfg(test)]
#[path = "materialization_test.rs"]
mod tests;
