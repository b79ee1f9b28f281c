/// Table: a string-addressable view over one map of a module.
///
/// Every operation re-reads the table's metadata (fd, descriptors) from the
/// module, encodes through the codec, calls the accessor and decodes the
/// result. Nothing is cached between calls.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::config::ScanOptions;
use crate::error::{Result, TableError};
use crate::iter::{self, TableIter};
use crate::module::{ModuleInner, TableId};

/// A decoded key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.key, self.value)
    }
}

/// Table properties as reported by `Table::config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableConfig {
    pub name: String,
    pub fd: RawFd,
    pub key_size: usize,
    pub leaf_size: usize,
    pub key_desc: String,
    pub leaf_desc: String,
}

impl TableConfig {
    /// The properties as a JSON object keyed `name`, `fd`, `key_size`,
    /// `leaf_size`, `key_desc` and `leaf_desc`.
    pub fn to_map(&self) -> JsonMap<String, Value> {
        let mut map = JsonMap::new();
        map.insert("name".to_string(), Value::from(self.name.clone()));
        map.insert("fd".to_string(), Value::from(self.fd));
        map.insert("key_size".to_string(), Value::from(self.key_size as u64));
        map.insert("leaf_size".to_string(), Value::from(self.leaf_size as u64));
        map.insert("key_desc".to_string(), Value::from(self.key_desc.clone()));
        map.insert("leaf_desc".to_string(), Value::from(self.leaf_desc.clone()));
        map
    }
}

/// Handle to one table. Cheap to clone; does not keep the module alive.
#[derive(Clone)]
pub struct Table {
    id: TableId,
    module: Weak<ModuleInner>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("id", &self.id).finish()
    }
}

impl Table {
    pub(crate) fn new(id: TableId, module: Weak<ModuleInner>) -> Self {
        Self { id, module }
    }

    /// # Panics
    ///
    /// If the owning module has been dropped.
    pub(crate) fn module(&self) -> Arc<ModuleInner> {
        self.module
            .upgrade()
            .unwrap_or_else(|| panic!("table {} used after its module was unloaded", self.id))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> String {
        self.module().meta(self.id).name
    }

    pub fn config(&self) -> TableConfig {
        let meta = self.module().meta(self.id);
        TableConfig {
            fd: meta.fd,
            key_size: meta.key.size(),
            leaf_size: meta.leaf.size(),
            key_desc: meta.key.desc().to_string(),
            leaf_desc: meta.leaf.desc().to_string(),
            name: meta.name,
        }
    }

    /// Look up `key`. Malformed keys, absent keys and undecodable leaves are
    /// all reported as `None`; use `try_get` to tell them apart.
    pub fn get(&self, key: &str) -> Option<Entry> {
        match self.try_get(key) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("GET {} failed: {}", key, err);
                None
            }
        }
    }

    /// Look up `key`, surfacing codec and access errors. `Ok(None)` means the
    /// key is well-formed but absent.
    pub fn try_get(&self, key: &str) -> Result<Option<Entry>> {
        let module = self.module();
        let meta = module.meta(self.id);
        let codec = meta.codec();
        let raw_key = codec.encode_key(key)?;
        let leaf = meta
            .accessor(&*module.maps)
            .lookup(&raw_key)
            .map_err(|err| err.into_table_error("lookup", key.to_string()))?;
        let Some(leaf) = leaf else {
            debug!("GET {}: {} not found", meta.name, key);
            return Ok(None);
        };
        let value = codec.decode_leaf(&leaf)?;
        Ok(Some(Entry::new(key, value)))
    }

    /// Create or overwrite `key` with `leaf`.
    pub fn set(&self, key: &str, leaf: &str) -> Result<()> {
        let module = self.module();
        let meta = module.meta(self.id);
        let codec = meta.codec();
        let raw_key = codec.encode_key(key)?;
        let raw_leaf = codec.encode_leaf(leaf)?;
        meta.accessor(&*module.maps)
            .update(&raw_key, &raw_leaf)
            .map_err(|err| err.into_table_error("update", format!("{key}={leaf}")))?;
        debug!("SET {}: {}={}", meta.name, key, leaf);
        Ok(())
    }

    /// Remove `key`; an absent key is `TableError::NotFound`.
    pub fn delete(&self, key: &str) -> Result<()> {
        let module = self.module();
        let meta = module.meta(self.id);
        let raw_key = meta.codec().encode_key(key)?;
        let deleted = meta
            .accessor(&*module.maps)
            .delete(&raw_key)
            .map_err(|err| err.into_table_error("delete", key.to_string()))?;
        if !deleted {
            return Err(TableError::NotFound {
                key: key.to_string(),
            });
        }
        debug!("DELETE {}: {}", meta.name, key);
        Ok(())
    }

    /// Scan the whole table with the module's scan options. Must be called
    /// from within a tokio runtime.
    pub fn iter(&self) -> TableIter {
        let options = self.module().scan;
        self.iter_with(options)
    }

    pub fn iter_with(&self, options: ScanOptions) -> TableIter {
        iter::spawn_scan(self.module(), self.id, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeDescriptor;
    use crate::module::Module;

    fn counts(module: &Module) -> Table {
        module
            .create_table(
                "counts",
                TypeDescriptor::parse("unsigned int").unwrap(),
                TypeDescriptor::parse("unsigned long long").unwrap(),
                2,
            )
            .unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let module = Module::in_memory();
        let table = counts(&module);

        table.set("1", "100").unwrap();
        assert_eq!(table.get("1"), Some(Entry::new("1", "100")));
        table.set("1", "0x10").unwrap();
        assert_eq!(table.get("1"), Some(Entry::new("1", "16")));

        table.delete("1").unwrap();
        assert_eq!(table.get("1"), None);
        assert!(table.delete("1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_collapses_errors_but_try_get_does_not() {
        let module = Module::in_memory();
        let table = counts(&module);

        assert_eq!(table.get("not-a-number"), None);
        assert!(matches!(
            table.try_get("not-a-number"),
            Err(TableError::Codec { what: "key", .. })
        ));
        assert!(matches!(table.try_get("5"), Ok(None)));
    }

    #[test]
    fn test_set_propagates_codec_errors() {
        let module = Module::in_memory();
        let table = counts(&module);
        match table.set("1", "-1") {
            Err(TableError::Codec { what, input, .. }) => {
                assert_eq!(what, "leaf");
                assert_eq!(input, "-1");
            }
            other => panic!("expected codec error, got {other:?}"),
        }
        assert!(matches!(
            table.delete("x"),
            Err(TableError::Codec { what: "key", .. })
        ));
    }

    #[test]
    fn test_update_failure_names_the_pair() {
        let module = Module::in_memory();
        let table = counts(&module);
        table.set("1", "1").unwrap();
        table.set("2", "2").unwrap();
        match table.set("3", "3") {
            Err(TableError::Access { op, target, source }) => {
                assert_eq!(op, "update");
                assert_eq!(target, "3=3");
                assert_eq!(source.raw_os_error(), Some(libc::E2BIG));
            }
            other => panic!("expected access error, got {other:?}"),
        }
    }

    #[test]
    fn test_config() {
        let module = Module::in_memory();
        let table = counts(&module);
        let config = table.config();
        assert_eq!(config.name, "counts");
        assert_eq!((config.key_size, config.leaf_size), (4, 8));
        assert_eq!(config.key_desc, "\"unsigned int\"");

        let map = config.to_map();
        let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["fd", "key_desc", "key_size", "leaf_desc", "leaf_size", "name"]
        );
        assert_eq!(map["leaf_size"], Value::from(8u64));
    }

    #[test]
    #[should_panic(expected = "used after its module was unloaded")]
    fn test_use_after_unload_panics() {
        let module = Module::in_memory();
        let table = counts(&module);
        drop(module);
        let _ = table.get("1");
    }
}
