//! Map records: table construction from the `maps` section and kernel
//! creation with optional type-metadata annotation.

use std::any::Any;
use std::os::fd::RawFd;

use crate::btf::{TypeInfo, TypeKind};
use crate::error::{Error, Result};
use crate::sys::{self, KernelBpf, MapCreateRequest};

/// Fixed-size map definition as laid out in the object's `maps` section.
///
/// Objects may carry shorter definitions (missing trailing fields default
/// to zero) or longer ones (unknown trailing bytes must be zero).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapDef {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

pub(crate) const MAP_DEF_SIZE: usize = core::mem::size_of::<MapDef>();

/// Name prefix of the container type carrying a map's key/value types.
const CONTAINER_PREFIX: &str = "____btf_map_";

impl MapDef {
    /// Decode the known prefix of a definition blob; missing trailing
    /// fields stay zero.
    fn from_prefix(bytes: &[u8]) -> Self {
        let field = |idx: usize| -> u32 {
            let off = idx * 4;
            if off + 4 <= bytes.len() {
                u32::from_le_bytes(bytes[off..off + 4].try_into().expect("bounds checked"))
            } else {
                0
            }
        };
        Self {
            map_type: field(0),
            key_size: field(1),
            value_size: field(2),
            max_entries: field(3),
            map_flags: field(4),
        }
    }
}

/// One kernel map resource tracked by an object.
pub struct Map {
    pub(crate) name: String,
    /// Offset of the definition inside the maps section; the sort key
    /// and the relocation match key.
    pub(crate) section_offset: u64,
    pub(crate) fd: RawFd,
    pub(crate) ifindex: u32,
    pub(crate) def: MapDef,
    pub(crate) btf_key_type_id: u32,
    pub(crate) btf_value_type_id: u32,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("name", &self.name)
            .field("section_offset", &self.section_offset)
            .field("fd", &self.fd)
            .field("ifindex", &self.ifindex)
            .field("def", &self.def)
            .field("btf_key_type_id", &self.btf_key_type_id)
            .field("btf_value_type_id", &self.btf_value_type_id)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

impl Map {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel descriptor, or −1 before creation and after unload.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn def(&self) -> &MapDef {
        &self.def
    }

    pub fn section_offset(&self) -> u64 {
        self.section_offset
    }

    pub fn btf_key_type_id(&self) -> u32 {
        self.btf_key_type_id
    }

    pub fn btf_value_type_id(&self) -> u32 {
        self.btf_value_type_id
    }

    /// Target a network device for map offload.
    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    /// Adopt an existing kernel descriptor instead of creating a new map.
    ///
    /// The descriptor is duplicated into a close-on-exec slot owned by
    /// this map; the caller keeps ownership of `fd` itself. Name,
    /// definition fields, and type-metadata ids are copied from the
    /// kernel's view of the descriptor. The creator skips this map
    /// afterwards.
    pub fn reuse_fd(&mut self, fd: RawFd, kernel: &dyn KernelBpf) -> Result<()> {
        let info = kernel.object_info(fd).map_err(|e| {
            log::warn!("failed to query info for map fd {}: {:?}", fd, e);
            Error::Sys(e)
        })?;
        let new_fd = sys::dup_cloexec(fd).map_err(|e| {
            log::warn!("failed to duplicate map fd {}: {:?}", fd, e);
            Error::Sys(e)
        })?;
        if self.fd >= 0 {
            sys::close_fd(self.fd);
        }
        self.fd = new_fd;
        self.name = info.name;
        self.def = MapDef {
            map_type: info.map_type,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            map_flags: info.map_flags,
        };
        self.btf_key_type_id = info.btf_key_type_id;
        self.btf_value_type_id = info.btf_value_type_id;
        log::debug!("map '{}' reuses fd {} as {}", self.name, fd, new_fd);
        Ok(())
    }
}

/// Build the map table from the maps-section bytes and the symbols bound
/// to that section.
///
/// The definition size is inferred from the section length divided by
/// the symbol count; every symbol yields one map record. The table is
/// returned sorted ascending by section offset so relocations can
/// resolve a map from a symbol's `st_value` by binary search.
pub(crate) fn build_map_table(
    origin: &str,
    data: &[u8],
    symbols: Vec<(String, u64)>,
) -> Result<Vec<Map>> {
    if data.is_empty() || symbols.is_empty() {
        log::warn!("object '{}': maps section without usable definitions", origin);
        return Err(Error::InvalidInput);
    }
    if data.len() % symbols.len() != 0 {
        log::warn!(
            "object '{}': maps section size {} is not a multiple of its {} symbols",
            origin,
            data.len(),
            symbols.len()
        );
        return Err(Error::InvalidInput);
    }
    let def_sz = data.len() / symbols.len();

    let mut maps = Vec::with_capacity(symbols.len());
    for (name, offset) in symbols {
        let start = offset as usize;
        let end = match start.checked_add(def_sz) {
            Some(end) if end <= data.len() => end,
            _ => {
                log::warn!("object '{}': map '{}' definition is out of bounds", origin, name);
                return Err(Error::InvalidInput);
            }
        };
        let bytes = &data[start..end];
        if def_sz > MAP_DEF_SIZE && bytes[MAP_DEF_SIZE..].iter().any(|&b| b != 0) {
            log::warn!("object '{}': map '{}' carries unrecognized options", origin, name);
            return Err(Error::InvalidInput);
        }
        let def = MapDef::from_prefix(bytes);
        log::debug!(
            "object '{}': map '{}' at offset {}: type {}, key {}, value {}, entries {}",
            origin,
            name,
            offset,
            def.map_type,
            def.key_size,
            def.value_size,
            def.max_entries
        );
        maps.push(Map {
            name,
            section_offset: offset,
            fd: -1,
            ifindex: 0,
            def,
            btf_key_type_id: 0,
            btf_value_type_id: 0,
            user_data: None,
        });
    }

    maps.sort_by_key(|m| m.section_offset);
    Ok(maps)
}

/// Resolve a map's key/value type ids from its `____btf_map_<name>`
/// container type. Any shape mismatch disables annotation for this map
/// without failing the load.
fn find_container_ids(btf: &dyn TypeInfo, map: &Map) -> Option<(u32, u32)> {
    let container = format!("{}{}", CONTAINER_PREFIX, map.name);
    let id = match btf.find_by_name(&container) {
        Some(id) => id,
        None => {
            log::debug!("map '{}': no container type '{}'", map.name, container);
            return None;
        }
    };
    let record = btf.type_by_id(id)?;
    if record.kind != TypeKind::Struct {
        log::warn!("map '{}': container '{}' is not a struct", map.name, container);
        return None;
    }
    if record.members.len() < 2 {
        log::warn!("map '{}': container '{}' has fewer than 2 members", map.name, container);
        return None;
    }

    let key_id = record.members[0].type_id;
    let key_size = btf.resolve_size(key_id).ok()?;
    if key_size != map.def.key_size {
        log::warn!(
            "map '{}': key type size {} does not match definition {}",
            map.name,
            key_size,
            map.def.key_size
        );
        return None;
    }

    let value_id = record.members[1].type_id;
    let value_size = btf.resolve_size(value_id).ok()?;
    if value_size != map.def.value_size {
        log::warn!(
            "map '{}': value type size {} does not match definition {}",
            map.name,
            value_size,
            map.def.value_size
        );
        return None;
    }

    Some((key_id, value_id))
}

/// Materialize every map as a kernel descriptor, in table order.
///
/// Maps whose descriptor is already valid (reused) are skipped. A map
/// with resolvable type metadata is first submitted annotated; if the
/// kernel rejects that, one retry goes out with the metadata stripped.
/// On final failure every descriptor created by this call is closed
/// before the error is returned; reused descriptors are left alone.
pub(crate) fn create_maps(
    maps: &mut [Map],
    btf: Option<&dyn TypeInfo>,
    kernel: &dyn KernelBpf,
) -> Result<()> {
    let mut created: Vec<usize> = Vec::new();
    for i in 0..maps.len() {
        if maps[i].fd >= 0 {
            log::debug!("map '{}': skipping creation, fd {} reused", maps[i].name, maps[i].fd);
            continue;
        }

        let mut btf_fd = 0;
        if let Some(btf) = btf {
            if let Some((key_id, value_id)) = find_container_ids(btf, &maps[i]) {
                maps[i].btf_key_type_id = key_id;
                maps[i].btf_value_type_id = value_id;
                btf_fd = btf.fd();
            }
        }

        let map = &maps[i];
        let mut result = kernel.create_map(&MapCreateRequest {
            name: &map.name,
            def: map.def,
            ifindex: map.ifindex,
            btf_fd,
            btf_key_type_id: map.btf_key_type_id,
            btf_value_type_id: map.btf_value_type_id,
        });

        // Kernels older than the type-metadata feature reject annotated
        // requests; retry once with the metadata stripped.
        if result.is_err() && btf_fd != 0 {
            log::warn!(
                "map '{}': creation with type metadata failed ({:?}), retrying without",
                map.name,
                result.as_ref().err()
            );
            maps[i].btf_key_type_id = 0;
            maps[i].btf_value_type_id = 0;
            let map = &maps[i];
            result = kernel.create_map(&MapCreateRequest {
                name: &map.name,
                def: map.def,
                ifindex: map.ifindex,
                btf_fd: 0,
                btf_key_type_id: 0,
                btf_value_type_id: 0,
            });
        }

        match result {
            Ok(fd) => {
                log::debug!("created map '{}': fd {}", maps[i].name, fd);
                maps[i].fd = fd;
                created.push(i);
            }
            Err(err) => {
                log::warn!("failed to create map '{}': {:?}", maps[i].name, err);
                for &j in &created {
                    sys::close_fd(maps[j].fd);
                    maps[j].fd = -1;
                }
                return Err(Error::Sys(err));
            }
        }
    }
    Ok(())
}
