//! Incremental state tracking.
//!
//! One [`IncrementalState`] record per model, kept by a [`StateStore`]. The
//! JSON file store writes atomically (temp file + rename) so a write either
//! fully lands or not at all, and holds an advisory lock on a sidecar
//! `.lock` file across each read-modify-write so overlapping processes never
//! drop each other's records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::materialization::{IncrementalStrategy, LookbackWindow, TimeColumnType};
use crate::node_id::NodeId;

/// High-water value of a model's time/versioning column.
///
/// Numeric columns read back as whole numbers are kept as [`Integer`] so
/// BIGINT versions above 2^53 survive the round trip exactly; only
/// fractional (or out-of-range) values fall back to [`Numeric`].
///
/// [`Integer`]: WatermarkValue::Integer
/// [`Numeric`]: WatermarkValue::Numeric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WatermarkValue {
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Integer(i64),
    Numeric(f64),
}

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const TIMESTAMP_TZ_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

impl WatermarkValue {
    /// Parse a value as read back from the database for a column of type `ty`.
    ///
    /// Offset-carrying timestamps are normalised to UTC.
    pub fn parse(raw: &str, ty: TimeColumnType) -> CoreResult<Self> {
        let text = raw.trim();
        let invalid = || CoreError::InvalidWatermark {
            value: raw.to_string(),
            column_type: ty.to_string(),
        };

        match ty {
            TimeColumnType::Timestamp => parse_timestamp(text)
                .map(WatermarkValue::Timestamp)
                .ok_or_else(invalid),
            TimeColumnType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(text).map(|ts| ts.date()))
                .map(WatermarkValue::Date)
                .ok_or_else(invalid),
            TimeColumnType::Numeric => match text.parse::<i64>() {
                Ok(n) => Ok(WatermarkValue::Integer(n)),
                Err(_) => text
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(WatermarkValue::Numeric)
                    .ok_or_else(invalid),
            },
        }
    }

    /// The column type this value belongs to
    pub fn column_type(&self) -> TimeColumnType {
        match self {
            WatermarkValue::Timestamp(_) => TimeColumnType::Timestamp,
            WatermarkValue::Date(_) => TimeColumnType::Date,
            WatermarkValue::Integer(_) | WatermarkValue::Numeric(_) => TimeColumnType::Numeric,
        }
    }

    /// Subtract a lookback window.
    ///
    /// Durations on a date watermark are rounded up to whole days so the
    /// overlap is never smaller than requested.
    pub fn minus(&self, lookback: &LookbackWindow) -> CoreResult<Self> {
        let mismatch = || CoreError::InvalidLookback {
            value: lookback.to_string(),
            reason: format!("not applicable to a {} watermark", self.column_type()),
        };
        let out_of_range = || CoreError::InvalidLookback {
            value: lookback.to_string(),
            reason: "watermark minus lookback is out of range".to_string(),
        };

        match (self, lookback) {
            (WatermarkValue::Timestamp(ts), LookbackWindow::Duration(d)) => ts
                .checked_sub_signed(*d)
                .map(WatermarkValue::Timestamp)
                .ok_or_else(out_of_range),
            (WatermarkValue::Date(date), LookbackWindow::Duration(d)) => {
                let secs = d.num_seconds();
                let days = secs / 86_400 + i64::from(secs % 86_400 != 0);
                TimeDelta::try_days(days)
                    .and_then(|delta| date.checked_sub_signed(delta))
                    .map(WatermarkValue::Date)
                    .ok_or_else(out_of_range)
            }
            (WatermarkValue::Integer(n), LookbackWindow::Offset(offset)) => n
                .checked_sub(*offset)
                .map(WatermarkValue::Integer)
                .ok_or_else(out_of_range),
            (WatermarkValue::Numeric(n), LookbackWindow::Offset(offset)) => {
                Ok(WatermarkValue::Numeric(n - *offset as f64))
            }
            _ => Err(mismatch()),
        }
    }

    /// Render as a type-cast SQL literal, e.g. `CAST('2024-01-01T23:00:00' AS TIMESTAMP)`
    pub fn to_sql_literal(&self) -> String {
        match self {
            WatermarkValue::Timestamp(_) => format!("CAST('{}' AS TIMESTAMP)", self),
            WatermarkValue::Date(_) => format!("CAST('{}' AS DATE)", self),
            WatermarkValue::Integer(_) | WatermarkValue::Numeric(_) => self.to_string(),
        }
    }

    /// The larger of two watermarks of the same type.
    ///
    /// Values of different types are not comparable; `other` wins, since it
    /// reflects the current column type.
    pub fn max(self, other: Self) -> Self {
        match (self, other) {
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => {
                WatermarkValue::Timestamp(a.max(b))
            }
            (WatermarkValue::Date(a), WatermarkValue::Date(b)) => WatermarkValue::Date(a.max(b)),
            (WatermarkValue::Integer(a), WatermarkValue::Integer(b)) => {
                WatermarkValue::Integer(a.max(b))
            }
            (WatermarkValue::Numeric(a), WatermarkValue::Numeric(b)) => {
                WatermarkValue::Numeric(a.max(b))
            }
            (WatermarkValue::Integer(a), WatermarkValue::Numeric(b))
            | (WatermarkValue::Numeric(b), WatermarkValue::Integer(a)) => {
                if a as f64 >= b {
                    WatermarkValue::Integer(a)
                } else {
                    WatermarkValue::Numeric(b)
                }
            }
            (_, other) => other,
        }
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkValue::Timestamp(ts) if ts.nanosecond() == 0 => {
                write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S"))
            }
            WatermarkValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.6f")),
            WatermarkValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            WatermarkValue::Integer(n) => write!(f, "{}", n),
            WatermarkValue::Numeric(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            WatermarkValue::Numeric(n) => write!(f, "{}", n),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in TIMESTAMP_TZ_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.naive_utc());
        }
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Recorded outcome of a model's last successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalState {
    /// Model this state belongs to
    pub model_id: NodeId,

    /// When the last successful run finished
    pub last_run_timestamp: DateTime<Utc>,

    /// Strategy used by that run
    pub strategy_used: IncrementalStrategy,

    /// High-water mark of the time column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_value: Option<WatermarkValue>,

    /// Rows written by that run (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl IncrementalState {
    /// State for a run that just finished
    pub fn new(
        model_id: NodeId,
        strategy_used: IncrementalStrategy,
        watermark_value: Option<WatermarkValue>,
        row_count: Option<u64>,
    ) -> Self {
        Self {
            model_id,
            last_run_timestamp: Utc::now(),
            strategy_used,
            watermark_value,
            row_count,
        }
    }
}

/// Durable per-model state.
///
/// Implementations must give read-your-own-write consistency and make each
/// `put` crash-safe. Callers serialize read-modify-write for one model.
pub trait StateStore: Send + Sync {
    /// Recorded state for a model, if any
    fn get(&self, model_id: &str) -> CoreResult<Option<IncrementalState>>;

    /// Insert or replace the state for `state.model_id`
    fn put(&self, state: &IncrementalState) -> CoreResult<()>;

    /// Every recorded state, ordered by model id
    fn all(&self) -> CoreResult<Vec<IncrementalState>>;
}

/// Process-local store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<NodeId, IncrementalState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<NodeId, IncrementalState>>> {
        self.states
            .lock()
            .map_err(|e| CoreError::StateStore(format!("state lock poisoned: {}", e)))
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, model_id: &str) -> CoreResult<Option<IncrementalState>> {
        Ok(self.lock()?.get(model_id).cloned())
    }

    fn put(&self, state: &IncrementalState) -> CoreResult<()> {
        self.lock()?.insert(state.model_id.clone(), state.clone());
        Ok(())
    }

    fn all(&self) -> CoreResult<Vec<IncrementalState>> {
        let mut all: Vec<_> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(all)
    }
}

/// On-disk layout of the JSON state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// When this state file was last updated
    pub updated_at: DateTime<Utc>,

    /// State per model
    #[serde(default)]
    pub models: BTreeMap<NodeId, IncrementalState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFile {
    /// Create a new empty state file
    pub fn new() -> Self {
        Self {
            updated_at: Utc::now(),
            models: BTreeMap::new(),
        }
    }

    /// Load state from `path`; a missing file is an empty state
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save state to `path` atomically.
    ///
    /// Each save writes its own uniquely named temp file in the target
    /// directory, which is then renamed over `path`.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let dir = ensure_parent(path)?;
        let io_err = |e: std::io::Error| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        };

        let json = serde_json::to_string_pretty(self)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".state.")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(io_err)?;
        temp.write_all(json.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        // A failed persist drops (and deletes) the temp file
        temp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Update or insert a model's state
    pub fn upsert(&mut self, state: IncrementalState) {
        self.models.insert(state.model_id.clone(), state);
        self.updated_at = Utc::now();
    }
}

/// State store backed by a JSON file
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    cache: Mutex<StateFile>,
}

impl JsonStateStore {
    /// Open (or lazily create) the state file at `path`
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let file = StateFile::load(&path)?;
        log::debug!(
            "Loaded {} model state(s) from {}",
            file.models.len(),
            path.display()
        );
        Ok(Self {
            path,
            cache: Mutex::new(file),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, StateFile>> {
        self.cache
            .lock()
            .map_err(|e| CoreError::StateStore(format!("state lock poisoned: {}", e)))
    }
}

/// Create `path`'s parent directory if needed and return it
fn ensure_parent(path: &Path) -> CoreResult<PathBuf> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| CoreError::IoWithPath {
        path: dir.display().to_string(),
        source: e,
    })?;
    Ok(dir)
}

/// Exclusive advisory lock on `<state file>.lock`, released on drop
struct StateFileLock {
    file: File,
}

impl StateFileLock {
    fn acquire(state_path: &Path) -> CoreResult<Self> {
        ensure_parent(state_path)?;
        let mut name = state_path.as_os_str().to_owned();
        name.push(".lock");
        let lock_path = PathBuf::from(name);
        let io_err = |e: std::io::Error| CoreError::IoWithPath {
            path: lock_path.display().to_string(),
            source: e,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;
        file.lock().map_err(io_err)?;
        Ok(Self { file })
    }
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release state file lock: {}", e);
        }
    }
}

impl StateStore for JsonStateStore {
    fn get(&self, model_id: &str) -> CoreResult<Option<IncrementalState>> {
        Ok(self.lock()?.models.get(model_id).cloned())
    }

    fn put(&self, state: &IncrementalState) -> CoreResult<()> {
        let mut cache = self.lock()?;
        let _guard = StateFileLock::acquire(&self.path)?;
        // Pick up records written by other processes since open
        let mut file = StateFile::load(&self.path)?;
        file.upsert(state.clone());
        file.save(&self.path)?;
        *cache = file;
        Ok(())
    }

    fn all(&self) -> CoreResult<Vec<IncrementalState>> {
        Ok(self.lock()?.models.values().cloned().collect())
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
