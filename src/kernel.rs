/// KernelMaps: the raw map primitives as `bpf(2)` syscalls.
///
/// Works on any map fd. Maps created or opened through `MapProvider` are
/// owned here and closed by `close_map` or when `KernelMaps` is dropped.
/// Pinned maps are opened through aya; element calls stay on raw syscalls
/// because key and value widths are only known at runtime.
///
/// The kernel copies a map's full key/value width through the pointers it is
/// given, so every call first checks the slices against the map's real
/// widths. Per-CPU maps are refused: their values are `value_size` times the
/// number of possible CPUs. Needs `CAP_BPF` (or root) at runtime.

use aya::maps::{Map, MapData};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tracing::{debug, info};

use crate::accessor::{MapAccessor, MapError, MapProvider, UpdateFlags};

const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_int = 4;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;

const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_MAP_TYPE_PERCPU_HASH: u32 = 5;
const BPF_MAP_TYPE_PERCPU_ARRAY: u32 = 6;
const BPF_MAP_TYPE_LRU_PERCPU_HASH: u32 = 10;
const BPF_MAP_TYPE_PERCPU_CGROUP_STORAGE: u32 = 21;
const BPF_OBJ_NAME_LEN: usize = 16;

// Prefixes of `union bpf_attr` for the commands used here; the kernel
// accepts a shorter attr as long as it is zero beyond what it reads.

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

#[repr(C)]
#[derive(Default)]
struct InfoByFdAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

// Prefix of `struct bpf_map_info`.
#[repr(C)]
#[derive(Default)]
struct MapInfo {
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    name: [u8; BPF_OBJ_NAME_LEN],
}

fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<libc::c_long> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn elem_attr(fd: RawFd, key: &[u8], value: u64, flags: u64) -> MapElemAttr {
    MapElemAttr {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value,
        flags,
        ..Default::default()
    }
}

/// Kernel object names allow `[A-Za-z0-9_.]` and at most 15 bytes.
fn object_name(name: &str) -> [u8; BPF_OBJ_NAME_LEN] {
    let mut out = [0u8; BPF_OBJ_NAME_LEN];
    let valid = name
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.')
        .take(BPF_OBJ_NAME_LEN - 1);
    for (slot, b) in out.iter_mut().zip(valid) {
        *slot = b;
    }
    out
}

fn is_per_cpu(map_type: u32) -> bool {
    matches!(
        map_type,
        BPF_MAP_TYPE_PERCPU_HASH
            | BPF_MAP_TYPE_PERCPU_ARRAY
            | BPF_MAP_TYPE_LRU_PERCPU_HASH
            | BPF_MAP_TYPE_PERCPU_CGROUP_STORAGE
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapShape {
    key_size: usize,
    value_size: usize,
}

/// Widths of the map behind `fd`, straight from the kernel.
fn query_shape(fd: RawFd) -> io::Result<MapShape> {
    let mut info = MapInfo::default();
    let mut attr = InfoByFdAttr {
        bpf_fd: fd as u32,
        info_len: mem::size_of::<MapInfo>() as u32,
        info: &mut info as *mut MapInfo as u64,
    };
    sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    debug!(
        fd,
        map_type = info.map_type,
        id = info.id,
        max_entries = info.max_entries,
        "map info"
    );
    if is_per_cpu(info.map_type) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("fd {fd} is a per-CPU map (type {})", info.map_type),
        ));
    }
    Ok(MapShape {
        key_size: info.key_size as usize,
        value_size: info.value_size as usize,
    })
}

fn width_mismatch() -> MapError {
    MapError::errno(libc::EINVAL)
}

enum Handle {
    Created(OwnedFd),
    Pinned(MapData),
}

struct OwnedMap {
    handle: Handle,
    shape: MapShape,
}

#[derive(Default)]
pub struct KernelMaps {
    owned: Mutex<HashMap<RawFd, OwnedMap>>,
}

impl KernelMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shapes of owned maps are cached. Other fds are asked every time,
    /// since the caller may close and reuse the number.
    fn shape(&self, fd: RawFd) -> io::Result<MapShape> {
        if let Some(map) = self.owned.lock().get(&fd) {
            return Ok(map.shape);
        }
        query_shape(fd)
    }

    fn adopt(&self, fd: RawFd, handle: Handle) -> io::Result<RawFd> {
        let shape = query_shape(fd)?;
        self.owned.lock().insert(fd, OwnedMap { handle, shape });
        Ok(fd)
    }
}

impl MapAccessor for KernelMaps {
    fn lookup(&self, fd: RawFd, key: &[u8], leaf: &mut [u8]) -> Result<(), MapError> {
        let shape = self.shape(fd)?;
        if key.len() != shape.key_size || leaf.len() != shape.value_size {
            return Err(width_mismatch());
        }
        let mut attr = elem_attr(fd, key, leaf.as_mut_ptr() as u64, 0);
        sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr)?;
        Ok(())
    }

    fn update(
        &self,
        fd: RawFd,
        key: &[u8],
        leaf: &[u8],
        flags: UpdateFlags,
    ) -> Result<(), MapError> {
        let shape = self.shape(fd)?;
        if key.len() != shape.key_size || leaf.len() != shape.value_size {
            return Err(width_mismatch());
        }
        let mut attr = elem_attr(fd, key, leaf.as_ptr() as u64, flags.bits());
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr)?;
        Ok(())
    }

    fn delete(&self, fd: RawFd, key: &[u8]) -> Result<(), MapError> {
        if key.len() != self.shape(fd)?.key_size {
            return Err(width_mismatch());
        }
        let mut attr = elem_attr(fd, key, 0, 0);
        sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr)?;
        Ok(())
    }

    fn next_key(&self, fd: RawFd, key: &[u8], next_key: &mut [u8]) -> Result<(), MapError> {
        let key_size = self.shape(fd)?.key_size;
        if key.len() != key_size || next_key.len() != key_size {
            return Err(width_mismatch());
        }
        let mut attr = elem_attr(fd, key, next_key.as_mut_ptr() as u64, 0);
        sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr)?;
        Ok(())
    }
}

impl MapProvider for KernelMaps {
    fn create_map(
        &self,
        name: &str,
        key_size: usize,
        leaf_size: usize,
        max_entries: u32,
    ) -> io::Result<RawFd> {
        let width = |n: usize| {
            u32::try_from(n).map_err(|_| io::Error::from_raw_os_error(libc::E2BIG))
        };
        let mut attr = MapCreateAttr {
            map_type: BPF_MAP_TYPE_HASH,
            key_size: width(key_size)?,
            value_size: width(leaf_size)?,
            max_entries,
            map_name: object_name(name),
            ..Default::default()
        };
        let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)? as RawFd;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        info!("Created kernel hash map {} (fd {})", name, fd);
        self.adopt(owned.as_raw_fd(), Handle::Created(owned))
    }

    fn open_pinned(&self, path: &Path) -> io::Result<RawFd> {
        let data = MapData::from_pin(path).map_err(io::Error::other)?;
        let data = match Map::from_map_data(data).map_err(io::Error::other)? {
            Map::HashMap(data) | Map::LruHashMap(data) => data,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("pinned map {} is not a hash map", path.display()),
                ))
            }
        };
        let fd = data.fd().as_fd().as_raw_fd();
        info!("Opened pinned map {} (fd {})", path.display(), fd);
        self.adopt(fd, Handle::Pinned(data))
    }

    fn map_sizes(&self, fd: RawFd) -> io::Result<(usize, usize)> {
        let shape = self.shape(fd)?;
        Ok((shape.key_size, shape.value_size))
    }

    fn close_map(&self, fd: RawFd) {
        if let Some(map) = self.owned.lock().remove(&fd) {
            let origin = match map.handle {
                Handle::Created(_) => "created",
                Handle::Pinned(_) => "pinned",
            };
            debug!("Closed {} map fd {}", origin, fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layouts_match_the_kernel_abi() {
        assert_eq!(mem::size_of::<MapElemAttr>(), 32);
        assert_eq!(mem::size_of::<MapCreateAttr>(), 44);
        assert_eq!(mem::size_of::<InfoByFdAttr>(), 16);
        assert_eq!(mem::size_of::<MapInfo>(), 40);
    }

    #[test]
    fn test_object_name_is_sanitised() {
        let name = object_name("my-table/with.a.very_long_name");
        assert_eq!(&name[..15], b"mytablewith.a.v");
        assert_eq!(name[15], 0);
    }

    #[test]
    fn test_per_cpu_types() {
        assert!(!is_per_cpu(BPF_MAP_TYPE_HASH));
        assert!(is_per_cpu(BPF_MAP_TYPE_PERCPU_HASH));
        assert!(is_per_cpu(BPF_MAP_TYPE_LRU_PERCPU_HASH));
    }

    #[test]
    fn test_bad_fd_is_an_error() {
        let maps = KernelMaps::new();
        let mut leaf = [0u8; 8];
        assert!(maps.lookup(-1, &[0u8; 4], &mut leaf).is_err());
        assert!(maps.map_sizes(-1).is_err());
    }

    #[test]
    #[ignore = "needs CAP_BPF"]
    fn test_kernel_hash_map_primitives() {
        let maps = KernelMaps::new();
        let fd = maps.create_map("bpf_table_test", 4, 8, 16).unwrap();
        assert_eq!(maps.map_sizes(fd).unwrap(), (4, 8));

        let key = 1u32.to_ne_bytes();
        let mut leaf = [0u8; 8];
        assert!(matches!(
            maps.lookup(fd, &key, &mut leaf),
            Err(MapError::NotFound)
        ));
        maps.update(fd, &key, &100u64.to_ne_bytes(), UpdateFlags::Any)
            .unwrap();
        maps.lookup(fd, &key, &mut leaf).unwrap();
        assert_eq!(u64::from_ne_bytes(leaf), 100);

        let mut next = [0u8; 4];
        maps.next_key(fd, &[0xff; 4], &mut next).unwrap();
        assert_eq!(next, key);
        assert!(matches!(
            maps.next_key(fd, &key, &mut next),
            Err(MapError::NotFound)
        ));
        maps.delete(fd, &key).unwrap();
        maps.close_map(fd);
    }

    #[test]
    #[ignore = "needs CAP_BPF"]
    fn test_short_buffers_are_refused() {
        let maps = KernelMaps::new();
        let fd = maps.create_map("bpf_table_short", 4, 8, 4).unwrap();
        let key = 1u32.to_ne_bytes();
        maps.update(fd, &key, &u64::MAX.to_ne_bytes(), UpdateFlags::Any)
            .unwrap();

        let mut buf = [0u8; 8];
        match maps.lookup(fd, &key, &mut buf[..1]) {
            Err(MapError::Os(err)) => assert_eq!(err.raw_os_error(), Some(libc::EINVAL)),
            other => panic!("expected EINVAL, got {other:?}"),
        }
        assert_eq!(buf, [0u8; 8]);
        assert!(maps.update(fd, &key, &[1u8; 4], UpdateFlags::Any).is_err());
        assert!(maps.next_key(fd, &key, &mut [0u8; 2]).is_err());
        assert!(maps.delete(fd, &key[..2]).is_err());

        // An fd the backend does not own is checked against the kernel.
        let foreign = unsafe { libc::dup(fd) };
        assert!(foreign >= 0);
        assert_eq!(maps.map_sizes(foreign).unwrap(), (4, 8));
        assert!(maps.lookup(foreign, &key, &mut buf[..4]).is_err());
        maps.lookup(foreign, &key, &mut buf).unwrap();
        assert_eq!(buf, u64::MAX.to_ne_bytes());
        unsafe { libc::close(foreign) };
        maps.close_map(fd);
    }
}
