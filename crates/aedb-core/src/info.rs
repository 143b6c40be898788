// ABOUTME: Store metadata: the GlobalInfo key/value map with typed accessors, and FieldInfo
// ABOUTME: descriptors that attach units and scaling parameters to data columns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::TransientId;
use crate::time::TimeBase;

/// Well-known GlobalInfo keys.
pub mod keys {
    pub const VERSION: &str = "Version";
    pub const FILE_STATUS: &str = "FileStatus";
    pub const TIME_BASE: &str = "TimeBase";
    pub const WRITER_ID: &str = "WriterID";
    pub const FILE_ID: &str = "FileID";
    pub const REFERENCE_ID: &str = "ReferenceID";
    pub const VALID_SETS: &str = "ValidSets";
    pub const TRAI: &str = "TRAI";
    pub const CREATED_AT: &str = "CreatedAt";
}

/// Key/value metadata of a store, stored as text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalInfo {
    entries: BTreeMap<String, String>,
}

impl GlobalInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn version(&self) -> Option<i64> {
        self.get_i64(keys::VERSION)
    }

    /// 1 while a writer holds the store open, 0 otherwise.
    pub fn file_status(&self) -> i64 {
        self.get_i64(keys::FILE_STATUS).unwrap_or(0)
    }

    pub fn writer_active(&self) -> bool {
        self.file_status() != 0
    }

    pub fn time_base(&self) -> Option<TimeBase> {
        let value = self.get(keys::TIME_BASE)?.trim();
        // tolerate "10000000.0", written by some acquisition software
        let ticks = value
            .parse::<u64>()
            .ok()
            .or_else(|| value.parse::<f64>().ok().filter(|f| *f >= 1.0).map(|f| f as u64))?;
        TimeBase::new(ticks)
    }

    pub fn valid_sets(&self) -> i64 {
        self.get_i64(keys::VALID_SETS).unwrap_or(0)
    }

    pub fn trai(&self) -> Option<TransientId> {
        self.get_i64(keys::TRAI)
    }

    pub fn writer_id(&self) -> Option<&str> {
        self.get(keys::WRITER_ID)
    }

    pub fn file_id(&self) -> Option<&str> {
        self.get(keys::FILE_ID)
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.get(keys::REFERENCE_ID).filter(|v| !v.is_empty())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(keys::CREATED_AT)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl From<BTreeMap<String, String>> for GlobalInfo {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

impl FromIterator<(String, String)> for GlobalInfo {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Unit and scaling description of one data column. Presentation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field: String,
    pub unit: Option<String>,
    /// Name of the parameter column that scales this field, e.g. `ADC_uV`.
    pub parameter: Option<String>,
    pub factor: Option<f64>,
}

impl FieldInfo {
    pub fn new(field: &str, unit: &str, parameter: Option<&str>, factor: Option<f64>) -> Self {
        Self {
            field: field.to_string(),
            unit: Some(unit.to_string()),
            parameter: parameter.map(str::to_string),
            factor,
        }
    }
}
