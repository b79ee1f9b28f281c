/// Module configuration.
///
/// A module is described by a JSON document listing its tables and the scan
/// tuning shared by all of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TableError};

/// Default bound of the queue between a scan and its consumer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Default `max_entries` for maps the module creates itself.
pub const DEFAULT_MAX_ENTRIES: u32 = 10240;

/// Tables of a module and the scan options they share.
///
/// ```rust
/// use bpf_table::config::ModuleConfig;
///
/// let config = ModuleConfig::from_json(r#"{
///     "tables": [
///         { "name": "counts", "key_desc": "unsigned int", "leaf_desc": "unsigned long long" }
///     ]
/// }"#).unwrap();
/// assert_eq!(config.tables[0].max_entries, 10240);
/// assert_eq!(config.scan.queue_capacity, 128);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub tables: Vec<TableSpec>,

    #[serde(default)]
    pub scan: ScanOptions,
}

/// One table of a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,

    /// Key type description (see `TypeDescriptor`).
    pub key_desc: Value,

    /// Leaf type description.
    pub leaf_desc: Value,

    /// Open an existing pinned map instead of creating one.
    #[serde(default)]
    pub pin_path: Option<PathBuf>,

    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
}

fn default_max_entries() -> u32 {
    DEFAULT_MAX_ENTRIES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub queue_capacity: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ModuleConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            TableError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(TableError::Config("table name must not be empty".into()));
            }
            if !names.insert(table.name.as_str()) {
                return Err(TableError::Config(format!(
                    "table {} is declared twice",
                    table.name
                )));
            }
            if table.max_entries == 0 {
                return Err(TableError::Config(format!(
                    "table {}: max_entries must be greater than zero",
                    table.name
                )));
            }
        }
        if self.scan.queue_capacity == 0 {
            return Err(TableError::Config(
                "scan queue capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
