/// bpf-table: typed, string-addressable access to BPF hash maps.
///
/// Layers, leaves first:
/// 1. TypeDescriptor: bcc-style JSON type descriptions, text <-> C layout
/// 2. Codec: string <-> fixed-width key/leaf records for one table
/// 3. Accessor: lookup/update/delete/next_key over a map fd
///    (`KernelMaps` issues `bpf(2)`, `MemoryMaps` keeps maps in-process)
/// 4. Table: Get/Set/Delete/Config over a module's map
/// 5. TableIter: full-table scan streamed through a bounded queue

pub mod accessor;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod iter;
#[cfg(target_os = "linux")]
pub mod kernel;
pub mod memory;
pub mod module;
pub mod table;

pub use accessor::{Accessor, MapAccessor, MapError, MapProvider, UpdateFlags};
pub use codec::Codec;
pub use config::{ModuleConfig, ScanOptions, TableSpec};
pub use descriptor::TypeDescriptor;
pub use error::{Result, TableError};
pub use iter::TableIter;
#[cfg(target_os = "linux")]
pub use kernel::KernelMaps;
pub use memory::MemoryMaps;
pub use module::{Module, TableDef, TableId};
pub use table::{Entry, Table, TableConfig};
