/// Accessor: uniform binary-record calls over the four raw map primitives.
///
/// `MapAccessor` is the seam to whatever owns the maps (the kernel, or the
/// in-memory backend). Every call takes the map fd; callers fetch it from the
/// module per call because the module may remap it.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::error::TableError;

/// `flags` argument of an element update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFlags {
    /// Create or overwrite.
    #[default]
    Any,
    /// Create only; fails with `EEXIST` if the key is resident.
    NoExist,
    /// Overwrite only; fails with not-found if the key is absent.
    Exist,
}

impl UpdateFlags {
    pub fn bits(self) -> u64 {
        match self {
            UpdateFlags::Any => 0,
            UpdateFlags::NoExist => 1,
            UpdateFlags::Exist => 2,
        }
    }
}

/// Failure of a raw primitive. `NotFound` is a missing key for lookup,
/// update and delete, and the end of the table for `next_key`.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("no such element")]
    NotFound,

    #[error(transparent)]
    Os(io::Error),
}

impl From<io::Error> for MapError {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOENT) {
            MapError::NotFound
        } else {
            MapError::Os(err)
        }
    }
}

impl MapError {
    pub fn errno(errno: i32) -> Self {
        io::Error::from_raw_os_error(errno).into()
    }
}

/// The four raw map primitives. Each call is one blocking round trip.
pub trait MapAccessor: Send + Sync {
    fn lookup(&self, fd: RawFd, key: &[u8], leaf: &mut [u8]) -> Result<(), MapError>;

    fn update(&self, fd: RawFd, key: &[u8], leaf: &[u8], flags: UpdateFlags)
        -> Result<(), MapError>;

    fn delete(&self, fd: RawFd, key: &[u8]) -> Result<(), MapError>;

    /// Write the key following `key` into `next_key`. A `key` that is not
    /// resident yields the first key of the map.
    fn next_key(&self, fd: RawFd, key: &[u8], next_key: &mut [u8]) -> Result<(), MapError>;
}

/// Map lifecycle, used by `Module` to provision the maps it owns.
pub trait MapProvider: MapAccessor {
    fn create_map(
        &self,
        name: &str,
        key_size: usize,
        leaf_size: usize,
        max_entries: u32,
    ) -> io::Result<RawFd>;

    fn open_pinned(&self, path: &Path) -> io::Result<RawFd>;

    /// Key and value widths the backend reports for `fd`.
    fn map_sizes(&self, fd: RawFd) -> io::Result<(usize, usize)>;

    fn close_map(&self, fd: RawFd);
}

/// Failure of an `Accessor` call, before the caller attaches its own context.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("{what} record is {actual} bytes, table declares {expected}")]
    Width {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Os(#[from] io::Error),
}

impl AccessError {
    /// Attach the operation and the textual target (`key` or `key=value`).
    pub(crate) fn into_table_error(self, op: &'static str, target: String) -> TableError {
        match self {
            AccessError::Width {
                what,
                expected,
                actual,
            } => TableError::WidthMismatch {
                what,
                expected,
                actual,
            },
            AccessError::Os(source) => TableError::Access { op, target, source },
        }
    }
}

/// One table's view of a `MapAccessor`: fd and record widths bound.
pub struct Accessor<'a, M: MapAccessor + ?Sized> {
    maps: &'a M,
    fd: RawFd,
    key_size: usize,
    leaf_size: usize,
}

impl<'a, M: MapAccessor + ?Sized> Accessor<'a, M> {
    pub fn new(maps: &'a M, fd: RawFd, key_size: usize, leaf_size: usize) -> Self {
        Self {
            maps,
            fd,
            key_size,
            leaf_size,
        }
    }

    fn check(what: &'static str, expected: usize, record: &[u8]) -> Result<(), AccessError> {
        if record.len() != expected {
            return Err(AccessError::Width {
                what,
                expected,
                actual: record.len(),
            });
        }
        Ok(())
    }

    /// `Ok(None)` when the key is absent.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AccessError> {
        Self::check("key", self.key_size, key)?;
        let mut leaf = vec![0u8; self.leaf_size];
        match self.maps.lookup(self.fd, key, &mut leaf) {
            Ok(()) => Ok(Some(leaf)),
            Err(MapError::NotFound) => {
                debug!(fd = self.fd, "lookup miss");
                Ok(None)
            }
            Err(MapError::Os(err)) => Err(err.into()),
        }
    }

    pub fn update(&self, key: &[u8], leaf: &[u8]) -> Result<(), AccessError> {
        Self::check("key", self.key_size, key)?;
        Self::check("leaf", self.leaf_size, leaf)?;
        match self.maps.update(self.fd, key, leaf, UpdateFlags::Any) {
            Ok(()) => Ok(()),
            Err(MapError::NotFound) => Err(io::Error::from_raw_os_error(libc::ENOENT).into()),
            Err(MapError::Os(err)) => Err(err.into()),
        }
    }

    /// `Ok(false)` when the key was absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool, AccessError> {
        Self::check("key", self.key_size, key)?;
        match self.maps.delete(self.fd, key) {
            Ok(()) => Ok(true),
            Err(MapError::NotFound) => Ok(false),
            Err(MapError::Os(err)) => Err(err.into()),
        }
    }

    /// `Ok(None)` at the end of the table.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AccessError> {
        Self::check("key", self.key_size, key)?;
        let mut next = vec![0u8; self.key_size];
        match self.maps.next_key(self.fd, key, &mut next) {
            Ok(()) => Ok(Some(next)),
            Err(MapError::NotFound) => Ok(None),
            Err(MapError::Os(err)) => Err(err.into()),
        }
    }
}
