use crate::{
    helpers::{hashmap_mapdata, hashmap_remove_if, BpfMapUpdateFlags},
    info::InfoTable,
    ToMapName,
};
use anyhow::Context;
use log::info;
use quicpipe_common::{maps, MAX_PORTS};

/// Port filter key, the UDP port in network byte order.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortKey(u16);

unsafe impl aya::Pod for PortKey {}

impl ToMapName for PortKey {
    fn map_name() -> &'static str {
        maps::PORTS
    }
}

impl From<u16> for PortKey {
    fn from(port: u16) -> Self {
        Self(port.to_be())
    }
}

impl PortKey {
    pub fn port(&self) -> u16 {
        u16::from_be(self.0)
    }
}

pub fn add(ports: &[u16]) -> Result<(), anyhow::Error> {
    let mut pmap = hashmap_mapdata::<PortKey, u8>()?;

    for &port in ports {
        pmap.insert(PortKey::from(port), 1_u8, BpfMapUpdateFlags::ANY.bits())
            .with_context(|| {
                format!("Can't inspect port {}, at most {} ports", port, MAX_PORTS)
            })?;
        info!("[port] Inspecting UDP port {}", port);
    }

    Ok(())
}

pub fn remove(ports: &[u16]) -> Result<(), anyhow::Error> {
    let mut pmap = hashmap_mapdata::<PortKey, u8>()?;

    for &port in ports {
        match pmap.remove(&PortKey::from(port)) {
            Ok(()) => info!("[port] Stopped inspecting UDP port {}", port),
            Err(e) => log::warn!("[port] Port {} not inspected, {}", port, e),
        }
    }

    Ok(())
}

pub fn clear() -> Result<(), anyhow::Error> {
    let res = hashmap_remove_if::<PortKey, u8, _>(|_, _| true)?;
    info!(
        "[port] Remove summary, count/errors: {}/{}",
        res.count, res.errors
    );
    Ok(())
}

/// Inspected ports in ascending order.
pub fn ports() -> Result<Vec<u16>, anyhow::Error> {
    let pmap = hashmap_mapdata::<PortKey, u8>()?;
    let mut ports = pmap
        .keys()
        .filter_map(|k| k.ok())
        .map(|k| k.port())
        .collect::<Vec<_>>();
    ports.sort_unstable();
    Ok(ports)
}

pub fn list() -> Result<(), anyhow::Error> {
    let mut tab = InfoTable::new(vec!["port"]);
    for port in ports()? {
        tab.push_row(vec![port.to_string()]);
    }
    tab.print("Inspected UDP ports");
    Ok(())
}
