/// MemoryMaps: in-process hash maps behind the raw map primitives.
///
/// Follows kernel hash-map semantics where callers can observe them:
/// `next_key` of an absent key yields the first key, updates past
/// `max_entries` fail with `E2BIG`, and flags `NOEXIST`/`EXIST` are honoured.
/// Traversal order is the byte order of the keys.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::accessor::{MapAccessor, MapError, MapProvider, UpdateFlags};

// Well above typical descriptor numbers.
const FIRST_FD: RawFd = 1 << 20;

struct MemoryMap {
    name: String,
    key_size: usize,
    leaf_size: usize,
    max_entries: usize,
    entries: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemoryMap {
    fn check(&self, key: &[u8], leaf: Option<usize>) -> Result<(), MapError> {
        if key.len() != self.key_size || leaf.is_some_and(|len| len != self.leaf_size) {
            return Err(MapError::errno(libc::EINVAL));
        }
        Ok(())
    }
}

pub struct MemoryMaps {
    maps: DashMap<RawFd, Arc<MemoryMap>>,
    next_fd: AtomicI32,
}

impl MemoryMaps {
    pub fn new() -> Self {
        Self {
            maps: DashMap::new(),
            next_fd: AtomicI32::new(FIRST_FD),
        }
    }

    fn map(&self, fd: RawFd) -> Result<Arc<MemoryMap>, MapError> {
        self.maps
            .get(&fd)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MapError::errno(libc::EBADF))
    }

    /// Number of resident entries, `None` if `fd` is not an open map.
    pub fn len(&self, fd: RawFd) -> Option<usize> {
        let map = self.maps.get(&fd)?;
        let len = map.entries.read().len();
        Some(len)
    }

    pub fn stats(&self) -> MemoryMapsStats {
        let mut stats = MemoryMapsStats::default();
        for map in self.maps.iter() {
            stats.maps += 1;
            stats.entries += map.entries.read().len();
        }
        stats
    }
}

impl Default for MemoryMaps {
    fn default() -> Self {
        Self::new()
    }
}

impl MapAccessor for MemoryMaps {
    fn lookup(&self, fd: RawFd, key: &[u8], leaf: &mut [u8]) -> Result<(), MapError> {
        let map = self.map(fd)?;
        map.check(key, Some(leaf.len()))?;
        let entries = map.entries.read();
        let value = entries.get(key).ok_or(MapError::NotFound)?;
        leaf.copy_from_slice(value);
        Ok(())
    }

    fn update(
        &self,
        fd: RawFd,
        key: &[u8],
        leaf: &[u8],
        flags: UpdateFlags,
    ) -> Result<(), MapError> {
        let map = self.map(fd)?;
        map.check(key, Some(leaf.len()))?;
        let mut entries = map.entries.write();
        let resident = entries.contains_key(key);
        match flags {
            UpdateFlags::NoExist if resident => return Err(MapError::errno(libc::EEXIST)),
            UpdateFlags::Exist if !resident => return Err(MapError::NotFound),
            _ => {}
        }
        if !resident && entries.len() >= map.max_entries {
            debug!(map = %map.name, "map full, rejecting insert");
            return Err(MapError::errno(libc::E2BIG));
        }
        entries.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(leaf));
        Ok(())
    }

    fn delete(&self, fd: RawFd, key: &[u8]) -> Result<(), MapError> {
        let map = self.map(fd)?;
        map.check(key, None)?;
        let removed = map.entries.write().remove(key);
        match removed {
            Some(_) => Ok(()),
            None => Err(MapError::NotFound),
        }
    }

    fn next_key(&self, fd: RawFd, key: &[u8], next_key: &mut [u8]) -> Result<(), MapError> {
        let map = self.map(fd)?;
        map.check(key, None)?;
        map.check(next_key, None)?;
        let entries = map.entries.read();
        let next = if entries.contains_key(key) {
            entries
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next()
        } else {
            entries.iter().next()
        };
        let (next, _) = next.ok_or(MapError::NotFound)?;
        next_key.copy_from_slice(next);
        Ok(())
    }
}

impl MapProvider for MemoryMaps {
    fn create_map(
        &self,
        name: &str,
        key_size: usize,
        leaf_size: usize,
        max_entries: u32,
    ) -> io::Result<RawFd> {
        if key_size == 0 || leaf_size == 0 || max_entries == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.maps.insert(
            fd,
            Arc::new(MemoryMap {
                name: name.to_string(),
                key_size,
                leaf_size,
                max_entries: max_entries as usize,
                entries: RwLock::new(BTreeMap::new()),
            }),
        );
        info!(
            "Created memory map {} (fd {}, key {} bytes, leaf {} bytes, {} entries max)",
            name, fd, key_size, leaf_size, max_entries
        );
        Ok(fd)
    }

    fn open_pinned(&self, path: &Path) -> io::Result<RawFd> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("memory maps cannot open pinned map {}", path.display()),
        ))
    }

    fn map_sizes(&self, fd: RawFd) -> io::Result<(usize, usize)> {
        self.maps
            .get(&fd)
            .map(|map| (map.key_size, map.leaf_size))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn close_map(&self, fd: RawFd) {
        if let Some((_, map)) = self.maps.remove(&fd) {
            debug!("Closed memory map {} (fd {})", map.name, fd);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapsStats {
    pub maps: usize,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: u32) -> [u8; 4] {
        k.to_be_bytes()
    }

    fn setup(max_entries: u32) -> (MemoryMaps, RawFd) {
        let maps = MemoryMaps::new();
        let fd = maps.create_map("test", 4, 4, max_entries).unwrap();
        (maps, fd)
    }

    #[test]
    fn test_next_key_of_absent_key_restarts() {
        let (maps, fd) = setup(16);
        for k in [3, 1, 2] {
            maps.update(fd, &key(k), &key(k * 10), UpdateFlags::Any)
                .unwrap();
        }
        let mut next = [0u8; 4];

        maps.next_key(fd, &key(99), &mut next).unwrap();
        assert_eq!(next, key(1));
        maps.next_key(fd, &key(1), &mut next).unwrap();
        assert_eq!(next, key(2));
        maps.next_key(fd, &key(2), &mut next).unwrap();
        assert_eq!(next, key(3));
        assert!(matches!(
            maps.next_key(fd, &key(3), &mut next),
            Err(MapError::NotFound)
        ));
    }

    #[test]
    fn test_update_flags() {
        let (maps, fd) = setup(16);
        assert!(matches!(
            maps.update(fd, &key(1), &key(1), UpdateFlags::Exist),
            Err(MapError::NotFound)
        ));
        maps.update(fd, &key(1), &key(1), UpdateFlags::NoExist)
            .unwrap();
        match maps.update(fd, &key(1), &key(2), UpdateFlags::NoExist) {
            Err(MapError::Os(err)) => assert_eq!(err.raw_os_error(), Some(libc::EEXIST)),
            other => panic!("expected EEXIST, got {other:?}"),
        }
        maps.update(fd, &key(1), &key(2), UpdateFlags::Exist).unwrap();
        let mut leaf = [0u8; 4];
        maps.lookup(fd, &key(1), &mut leaf).unwrap();
        assert_eq!(leaf, key(2));
    }

    #[test]
    fn test_full_map_rejects_inserts_but_allows_overwrite() {
        let (maps, fd) = setup(2);
        maps.update(fd, &key(1), &key(1), UpdateFlags::Any).unwrap();
        maps.update(fd, &key(2), &key(2), UpdateFlags::Any).unwrap();
        match maps.update(fd, &key(3), &key(3), UpdateFlags::Any) {
            Err(MapError::Os(err)) => assert_eq!(err.raw_os_error(), Some(libc::E2BIG)),
            other => panic!("expected E2BIG, got {other:?}"),
        }
        maps.update(fd, &key(2), &key(20), UpdateFlags::Any).unwrap();
        assert_eq!(maps.len(fd), Some(2));
    }

    #[test]
    fn test_delete() {
        let (maps, fd) = setup(4);
        maps.update(fd, &key(1), &key(1), UpdateFlags::Any).unwrap();
        maps.delete(fd, &key(1)).unwrap();
        assert!(matches!(maps.delete(fd, &key(1)), Err(MapError::NotFound)));
        assert_eq!(maps.len(fd), Some(0));
        assert!(matches!(maps.delete(fd, &[0u8; 2]), Err(MapError::Os(_))));
    }

    #[test]
    fn test_bad_fd_and_close() {
        let (maps, fd) = setup(2);
        let mut leaf = [0u8; 4];
        assert!(matches!(
            maps.lookup(fd + 1, &key(1), &mut leaf),
            Err(MapError::Os(_))
        ));
        assert_eq!(maps.stats(), MemoryMapsStats { maps: 1, entries: 0 });
        maps.close_map(fd);
        assert_eq!(maps.len(fd), None);
        assert!(maps.open_pinned(Path::new("/sys/fs/bpf/x")).is_err());
    }
}
