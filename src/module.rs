/// Module: owner of a set of tables and the maps behind them.
///
/// Tables handed out by a module hold only a weak reference back to it.
/// Dropping the module closes the maps it provisioned; any `Table` used
/// afterwards panics.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::accessor::{Accessor, MapProvider};
use crate::codec::Codec;
use crate::config::{ModuleConfig, ScanOptions, TableSpec};
use crate::descriptor::TypeDescriptor;
use crate::error::{Result, TableError};
use crate::memory::MemoryMaps;
use crate::table::Table;

/// Index of a table within its module; stable for the module's lifetime.
pub type TableId = usize;

/// A table backed by a map the caller already holds open. The module does
/// not take ownership of `fd`.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub fd: RawFd,
    pub key_desc: TypeDescriptor,
    pub leaf_desc: TypeDescriptor,
}

#[derive(Debug, Clone)]
pub(crate) struct TableMeta {
    pub(crate) name: String,
    pub(crate) fd: RawFd,
    pub(crate) key: Arc<TypeDescriptor>,
    pub(crate) leaf: Arc<TypeDescriptor>,
    owned: bool,
}

impl TableMeta {
    pub(crate) fn codec(&self) -> Codec {
        Codec::new(Arc::clone(&self.key), Arc::clone(&self.leaf))
    }

    pub(crate) fn accessor<'a, M: MapProvider + ?Sized>(&self, maps: &'a M) -> Accessor<'a, M> {
        Accessor::new(maps, self.fd, self.key.size(), self.leaf.size())
    }
}

pub(crate) struct ModuleInner {
    pub(crate) maps: Arc<dyn MapProvider>,
    tables: RwLock<Vec<TableMeta>>,
    names: RwLock<HashMap<String, TableId>>,
    pub(crate) scan: ScanOptions,
}

impl ModuleInner {
    /// Snapshot of a table's metadata. Ids only come from this module, so a
    /// missing id is a caller bug.
    pub(crate) fn meta(&self, id: TableId) -> TableMeta {
        self.tables
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("table id {id} does not belong to this module"))
    }
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        let tables = self.tables.get_mut();
        for meta in tables.iter().filter(|meta| meta.owned) {
            self.maps.close_map(meta.fd);
        }
        info!("Unloaded module with {} tables", tables.len());
    }
}

pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub fn new(maps: Arc<dyn MapProvider>) -> Self {
        Self::with_scan_options(maps, ScanOptions::default())
    }

    pub fn with_scan_options(maps: Arc<dyn MapProvider>, scan: ScanOptions) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                maps,
                tables: RwLock::new(Vec::new()),
                names: RwLock::new(HashMap::new()),
                scan,
            }),
        }
    }

    /// A module over fresh in-memory maps.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryMaps::new()))
    }

    /// Build a module from its configuration: pinned tables are opened,
    /// the others are created.
    pub fn load(config: &ModuleConfig, maps: Arc<dyn MapProvider>) -> Result<Self> {
        let module = Self::with_scan_options(maps, config.scan);
        for spec in &config.tables {
            module.load_table(spec)?;
        }
        info!("Loaded module with {} tables", config.tables.len());
        Ok(module)
    }

    fn load_table(&self, spec: &TableSpec) -> Result<Table> {
        let key = TypeDescriptor::from_value(&spec.key_desc)?;
        let leaf = TypeDescriptor::from_value(&spec.leaf_desc)?;
        match &spec.pin_path {
            Some(path) => self.open_pinned(&spec.name, path, key, leaf),
            None => self.create_table(&spec.name, key, leaf, spec.max_entries),
        }
    }

    /// Register a table over a map the caller owns. The map's key and value
    /// widths must match the descriptors.
    pub fn add_table(&self, def: TableDef) -> Result<Table> {
        self.check_sizes(def.fd, &def.key_desc, &def.leaf_desc, &def.name)?;
        self.register(TableMeta {
            name: def.name,
            fd: def.fd,
            key: Arc::new(def.key_desc),
            leaf: Arc::new(def.leaf_desc),
            owned: false,
        })
    }

    /// Create a new map sized for the descriptors and register it.
    pub fn create_table(
        &self,
        name: &str,
        key: TypeDescriptor,
        leaf: TypeDescriptor,
        max_entries: u32,
    ) -> Result<Table> {
        self.ensure_unused(name)?;
        let fd = self
            .inner
            .maps
            .create_map(name, key.size(), leaf.size(), max_entries)
            .map_err(|err| TableError::Config(format!("failed to create map {name}: {err}")))?;
        self.register_owned(name, fd, key, leaf)
    }

    /// Open a map pinned in bpffs and register it, checking that its widths
    /// match the descriptors.
    pub fn open_pinned(
        &self,
        name: &str,
        path: &Path,
        key: TypeDescriptor,
        leaf: TypeDescriptor,
    ) -> Result<Table> {
        self.ensure_unused(name)?;
        let maps = &self.inner.maps;
        let fd = maps.open_pinned(path).map_err(|err| {
            TableError::Config(format!("failed to open pinned map {}: {err}", path.display()))
        })?;
        if let Err(err) = self.check_sizes(fd, &key, &leaf, &path.display()) {
            maps.close_map(fd);
            return Err(err);
        }
        self.register_owned(name, fd, key, leaf)
    }

    fn register_owned(
        &self,
        name: &str,
        fd: RawFd,
        key: TypeDescriptor,
        leaf: TypeDescriptor,
    ) -> Result<Table> {
        let registered = self.register(TableMeta {
            name: name.to_string(),
            fd,
            key: Arc::new(key),
            leaf: Arc::new(leaf),
            owned: true,
        });
        if registered.is_err() {
            self.inner.maps.close_map(fd);
        }
        registered
    }

    /// Fail unless the map behind `fd` has the widths the descriptors need.
    fn check_sizes(
        &self,
        fd: RawFd,
        key: &TypeDescriptor,
        leaf: &TypeDescriptor,
        what: &dyn fmt::Display,
    ) -> Result<()> {
        let (key_size, leaf_size) = self.inner.maps.map_sizes(fd).map_err(|err| {
            TableError::Config(format!("cannot read sizes of map {what} (fd {fd}): {err}"))
        })?;
        if key_size != key.size() || leaf_size != leaf.size() {
            return Err(TableError::Config(format!(
                "map {what} has key/leaf sizes {key_size}/{leaf_size}, descriptors need {}/{}",
                key.size(),
                leaf.size()
            )));
        }
        Ok(())
    }

    fn ensure_unused(&self, name: &str) -> Result<()> {
        if self.inner.names.read().contains_key(name) {
            return Err(TableError::Config(format!("table {name} already exists")));
        }
        Ok(())
    }

    fn register(&self, meta: TableMeta) -> Result<Table> {
        let mut names = self.inner.names.write();
        if names.contains_key(&meta.name) {
            return Err(TableError::Config(format!(
                "table {} already exists",
                meta.name
            )));
        }
        let mut tables = self.inner.tables.write();
        let id = tables.len();
        info!(
            "Registered table {} (id {}, fd {}, key {} bytes, leaf {} bytes)",
            meta.name,
            id,
            meta.fd,
            meta.key.size(),
            meta.leaf.size()
        );
        names.insert(meta.name.clone(), id);
        tables.push(meta);
        Ok(Table::new(id, Arc::downgrade(&self.inner)))
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        let id = *self.inner.names.read().get(name)?;
        Some(Table::new(id, Arc::downgrade(&self.inner)))
    }

    pub fn table_by_id(&self, id: TableId) -> Option<Table> {
        (id < self.inner.tables.read().len()).then(|| Table::new(id, Arc::downgrade(&self.inner)))
    }

    /// All tables, in registration order.
    pub fn tables(&self) -> Vec<Table> {
        (0..self.inner.tables.read().len())
            .map(|id| Table::new(id, Arc::downgrade(&self.inner)))
            .collect()
    }

    /// Point a table at a different map handle, which must have the widths
    /// of the table's descriptors. Callers of the table pick the new fd up
    /// on their next operation. The caller keeps ownership of `fd`; a map
    /// the module created or opened for this table is closed.
    pub fn remap(&self, id: TableId, fd: RawFd) -> Result<()> {
        let mut tables = self.inner.tables.write();
        let meta = tables
            .get_mut(id)
            .ok_or_else(|| TableError::Config(format!("no table with id {id}")))?;
        if meta.fd == fd {
            return Ok(());
        }
        self.check_sizes(fd, &meta.key, &meta.leaf, &meta.name)?;
        debug!("Remapping table {} from fd {} to fd {}", meta.name, meta.fd, fd);
        if meta.owned {
            self.inner.maps.close_map(meta.fd);
        }
        meta.fd = fd;
        meta.owned = false;
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        self.inner.scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(text: &str) -> TypeDescriptor {
        TypeDescriptor::parse(text).unwrap()
    }

    #[test]
    fn test_tables_are_registered_in_order() {
        let module = Module::in_memory();
        let a = module
            .create_table("a", desc("u32"), desc("u64"), 8)
            .unwrap();
        let b = module
            .create_table("b", desc("u16"), desc("u16"), 8)
            .unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert_eq!(module.table("b").unwrap().id(), 1);
        assert!(module.table("c").is_none());
        assert!(module.table_by_id(2).is_none());
        let names: Vec<String> = module.tables().iter().map(Table::name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let module = Module::in_memory();
        module
            .create_table("a", desc("u32"), desc("u64"), 8)
            .unwrap();
        assert!(matches!(
            module.create_table("a", desc("u32"), desc("u64"), 8),
            Err(TableError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_config() {
        let config = ModuleConfig::from_json(
            r#"{ "tables": [
                { "name": "counts", "key_desc": "unsigned int", "leaf_desc": "unsigned long long", "max_entries": 4 }
            ], "scan": { "queue_capacity": 2 } }"#,
        )
        .unwrap();
        let maps = Arc::new(MemoryMaps::new());
        let module = Module::load(&config, maps.clone()).unwrap();
        assert_eq!(module.scan_options().queue_capacity, 2);
        let counts = module.table("counts").unwrap();
        assert_eq!(counts.config().key_size, 4);
        assert_eq!(maps.stats().maps, 1);

        drop(module);
        assert_eq!(maps.stats().maps, 0, "owned maps are closed on unload");
    }

    #[test]
    fn test_pinned_tables_need_a_kernel() {
        let config = ModuleConfig::from_json(
            r#"{ "tables": [
                { "name": "p", "key_desc": "u32", "leaf_desc": "u32", "pin_path": "/sys/fs/bpf/p" }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(
            Module::load(&config, Arc::new(MemoryMaps::new())),
            Err(TableError::Config(_))
        ));
    }

    #[test]
    fn test_added_tables_are_not_closed() {
        let maps = Arc::new(MemoryMaps::new());
        let fd = maps.create_map("ext", 4, 4, 4).unwrap();
        let module = Module::new(maps.clone());
        module
            .add_table(TableDef {
                name: "ext".into(),
                fd,
                key_desc: desc("u32"),
                leaf_desc: desc("u32"),
            })
            .unwrap();
        drop(module);
        assert_eq!(maps.len(fd), Some(0));
    }

    #[test]
    fn test_remap() {
        let maps = Arc::new(MemoryMaps::new());
        let module = Module::new(maps.clone());
        let table = module
            .create_table("t", desc("u32"), desc("u32"), 4)
            .unwrap();
        table.set("1", "1").unwrap();
        let created = table.config().fd;

        let other = maps.create_map("t2", 4, 4, 4).unwrap();
        module.remap(table.id(), other).unwrap();
        assert_eq!(maps.len(created), None, "the module's own map is closed");
        assert_eq!(table.get("1"), None);
        table.set("2", "2").unwrap();
        assert_eq!(maps.len(other), Some(1));
        assert!(module.remap(9, other).is_err());

        drop(module);
        assert_eq!(maps.len(other), Some(1), "remapped fd stays with the caller");
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let maps = Arc::new(MemoryMaps::new());
        let wide = maps.create_map("wide", 4, 8, 4).unwrap();
        let module = Module::new(maps.clone());

        let narrow_leaf = TableDef {
            name: "narrow".into(),
            fd: wide,
            key_desc: desc("u32"),
            leaf_desc: desc("u8"),
        };
        assert!(matches!(
            module.add_table(narrow_leaf),
            Err(TableError::Config(_))
        ));
        assert!(module.table("narrow").is_none());

        let table = module
            .create_table("t", desc("u32"), desc("u32"), 4)
            .unwrap();
        let created = table.config().fd;
        assert!(matches!(
            module.remap(table.id(), wide),
            Err(TableError::Config(_))
        ));
        assert_eq!(table.config().fd, created);
        assert_eq!(maps.len(created), Some(0));

        assert!(matches!(
            module.remap(table.id(), created + 1000),
            Err(TableError::Config(_))
        ));
    }
}
