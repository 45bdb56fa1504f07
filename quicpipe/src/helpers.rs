use crate::ToMapName;
use anyhow::{anyhow, Context};
use aya::maps::{HashMap as AyaHashMap, Map, MapData};
use aya_obj::generated::{BPF_ANY, BPF_EXIST, BPF_F_LOCK, BPF_NOEXIST};
use log::info;
use quicpipe_common::{Cid, CID_LEN};
use std::fs::remove_file;
use std::path::{Path, PathBuf};

bitflags::bitflags! {
/// Flags for BPF_MAP_UPDATE_ELEM command
#[derive(Clone, Copy, Debug, Default)]
pub struct BpfMapUpdateFlags: u64 {
/// 0, create new element or update existing
const ANY = BPF_ANY as u64;
/// 1, create new element if it didn't exist
const NOEXIST = BPF_NOEXIST as u64;
/// 2, update existing element
const EXIST = BPF_EXIST as u64;
/// 4, spin_lock-ed map_lookup/map_update
const F_LOCK = BPF_F_LOCK as u64;
}
}

//
// Pinned link naming scheme used by the loading user app
//  program: <bpffs>/qp_<ifname>
//  shared maps: <bpffs>/QP_<map-name>
//  program maps: <bpffs>/qp_<ifname>_<lowcase-map-name>
//
pub(crate) fn pinned_link_name(ifname: &str, map_name: &str) -> Option<String> {
    if map_name.is_empty() {
        if ifname.is_empty() {
            None
        } else {
            Some(format!("qp_{}", ifname))
        }
    } else if !map_name.starts_with("QP_") || map_name.len() <= 3 {
        None
    } else if ifname.is_empty() {
        Some(map_name.to_string())
    } else {
        Some(format!("qp_{}_{}", ifname, map_name[3..].to_ascii_lowercase()))
    }
}

pub(crate) fn pinned_link_bpffs_path(ifname: &str, map_name: &str) -> Option<PathBuf> {
    pinned_link_name(ifname, map_name).map(|rel_link| Path::new(crate::BPFFS).join(rel_link))
}

pub(crate) fn mapdata_from_pinned_map(ifname: &str, map_name: &str) -> Option<MapData> {
    pinned_link_bpffs_path(ifname, map_name).and_then(|path| match MapData::from_pin(&path) {
        Err(e) => {
            log::debug!("Failed to get pinned map from {:?}, {}", &path, e);
            None
        }
        Ok(m) => Some(m),
    })
}

/// Opens a shared hash or lru hash map. The map is picked by the key type.
pub fn hashmap_mapdata<K, V>() -> Result<AyaHashMap<MapData, K, V>, anyhow::Error>
where
    K: aya::Pod + ToMapName,
    V: aya::Pod,
{
    let map = mapdata_from_pinned_map("", K::map_name()).ok_or(anyhow!(
        "Failed to find map: {} in bpffs, try load program",
        K::map_name()
    ))?;
    let map = if K::is_lru() {
        Map::LruHashMap(map)
    } else {
        Map::HashMap(map)
    };
    let map: AyaHashMap<_, K, V> = map
        .try_into()
        .with_context(|| format!("Map {} has unexpected layout", K::map_name()))?;
    Ok(map)
}

pub struct MapOpResult {
    pub count: u32,
    pub errors: u32,
    pub total: u32,
}

impl MapOpResult {
    fn new() -> Self {
        MapOpResult {
            count: 0,
            errors: 0,
            total: 0,
        }
    }

    pub fn matches_total(&self) -> bool {
        self.errors + self.count >= self.total
    }
}

pub fn hashmap_remove_if<K, V, F>(predicate: F) -> Result<MapOpResult, anyhow::Error>
where
    K: aya::Pod + ToMapName,
    V: aya::Pod,
    F: Fn(&K, &V) -> bool,
{
    let mut map = hashmap_mapdata::<K, V>()?;
    let mut result = MapOpResult::new();

    result.total = map
        .iter()
        .filter_map(|pair| pair.ok())
        .filter(|(k, v)| predicate(k, v))
        .count() as u32;

    loop {
        let keys = map
            .iter()
            .filter_map(|pair| pair.ok())
            .filter_map(|(k, v)| if predicate(&k, &v) { Some(k) } else { None })
            .take(10)
            .collect::<Vec<_>>();

        if keys.is_empty() || result.matches_total() {
            break;
        }

        for key in keys {
            if result.matches_total() {
                return Ok(result);
            }
            match map.remove(&key) {
                Ok(_) => result.count += 1,
                Err(_) => result.errors += 1,
            }
        }
    }

    Ok(result)
}

pub fn ifindex(ifname: &str) -> Result<u32, anyhow::Error> {
    if ifname.starts_with("if#") && ifname.len() > 3 {
        if let Ok(index) = ifname[3..].parse::<u32>() {
            return Ok(index);
        }
    }

    let c_interface = std::ffi::CString::new(ifname)?;
    let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
    if if_index == 0 {
        Err(anyhow!("No interface named {}", ifname))
    } else {
        Ok(if_index)
    }
}

pub fn increase_memlocked() -> Result<(), anyhow::Error> {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        Err(anyhow!(
            "remove limit on locked memory failed, ret is: {}",
            ret
        ))
    } else {
        Ok(())
    }
}

/// Return the pinned link path for the program attached to the `ifname` interface.
pub fn prog_bpffs(ifname: &str) -> Result<(PathBuf, bool), anyhow::Error> {
    // Check if name exists
    ifindex(ifname)?;

    let path = pinned_link_bpffs_path(ifname, "")
        .ok_or(anyhow!("Invalid interface name '{}'", ifname))?;

    let link_exists = path
        .try_exists()
        .context("Can't verify if quicpipe bpffs exists")?;

    Ok((path, link_exists))
}

pub fn teardown_pins(pins: &[PathBuf]) {
    for path in pins {
        match path.try_exists() {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                log::error!("Can't check the file status for {:?}, {}", path, e);
                continue;
            }
        }
        match remove_file(path) {
            Ok(()) => info!("Pin {:?} successfully deleted", path),
            Err(e) => log::error!("Failed to delete pin {:?}, {}", path, e),
        }
    }
}

/// Every quicpipe pin found in bpffs: program links, shared and program maps.
pub fn quicpipe_pins() -> Result<Vec<PathBuf>, anyhow::Error> {
    let iter = std::fs::read_dir(crate::BPFFS).context("Failed to iterate bpffs")?;

    Ok(iter
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            name.starts_with("qp_") || name.starts_with("QP_")
        })
        .collect())
}

pub fn parse_cid<T: AsRef<str>>(input: T) -> Result<Cid, anyhow::Error> {
    let input = input.as_ref();
    let mut bytes = [0_u8; CID_LEN];
    hex::decode_to_slice(input, &mut bytes).map_err(|e| {
        anyhow!(
            "invalid cid '{}', expected {} hex digits, {}",
            input,
            CID_LEN * 2,
            e
        )
    })?;
    Ok(Cid::new(bytes))
}

pub fn cid_to_str(cid: &Cid) -> String {
    hex::encode(cid.bytes)
}
