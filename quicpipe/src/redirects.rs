use crate::{
    helpers::{cid_to_str, hashmap_mapdata, hashmap_remove_if, BpfMapUpdateFlags},
    info::InfoTable,
    ToMapName,
};
use anyhow::Context;
use log::info;
use quicpipe_common::{maps, Cid, Redirect4};
use std::net::SocketAddrV4;

impl ToMapName for Cid {
    fn map_name() -> &'static str {
        maps::REDIRECT4
    }

    fn is_lru() -> bool {
        true
    }
}

/// Points every cid to the same target. An existing entry is overwritten.
pub fn add(target: SocketAddrV4, cids: &[Cid]) -> Result<(), anyhow::Error> {
    let mut rmap = hashmap_mapdata::<Cid, Redirect4>()?;
    let r4 = Redirect4::from(target);

    for cid in cids {
        rmap.insert(cid, r4, BpfMapUpdateFlags::ANY.bits())
            .with_context(|| format!("Can't redirect cid {}", cid_to_str(cid)))?;
        info!("[redirect] {} -> {}", cid_to_str(cid), target);
    }

    Ok(())
}

pub fn remove(cids: &[Cid]) -> Result<(), anyhow::Error> {
    let mut rmap = hashmap_mapdata::<Cid, Redirect4>()?;

    for cid in cids {
        match rmap.remove(cid) {
            Ok(()) => info!("[redirect] Removed {}", cid_to_str(cid)),
            Err(e) => log::warn!("[redirect] No entry for {}, {}", cid_to_str(cid), e),
        }
    }

    Ok(())
}

/// Removes all entries or only those pointing to `target`.
pub fn clear(target: Option<SocketAddrV4>) -> Result<(), anyhow::Error> {
    let target = target.map(Redirect4::from);
    let res = hashmap_remove_if::<Cid, Redirect4, _>(|_, r4| match &target {
        Some(t) => t == r4,
        None => true,
    })?;

    info!(
        "[redirect] Remove summary, count/errors/total: {}/{}/{}",
        res.count, res.errors, res.total
    );

    Ok(())
}

pub fn entries() -> Result<Vec<(Cid, SocketAddrV4)>, anyhow::Error> {
    let rmap = hashmap_mapdata::<Cid, Redirect4>()?;
    let mut entries = rmap
        .iter()
        .filter_map(|pair| pair.ok())
        .map(|(cid, r4)| (cid, SocketAddrV4::from(r4)))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

pub fn list() -> Result<(), anyhow::Error> {
    let mut tab = InfoTable::new(vec!["cid", "target"]);
    for (cid, target) in entries()? {
        tab.push_row(vec![cid_to_str(&cid), target.to_string()]);
    }
    tab.print("IPv4 redirects");
    Ok(())
}
