use crate::helpers::mapdata_from_pinned_map;
use anyhow::anyhow;
use aya::maps::{Array, Map, MapData};
use log::LevelFilter;
use quicpipe_common::{
    maps,
    runvars::{FUSED_VERSION_IDX, LOG_LEVEL_IDX},
    VERSION,
};

/// Run variables of the program attached to one interface.
pub struct RunVars {
    rvmap: Array<MapData, u64>,
}

impl RunVars {
    pub fn new(ifname: &str) -> Result<Self, anyhow::Error> {
        let map = mapdata_from_pinned_map(ifname, maps::RUNVAR).ok_or(anyhow!(
            "Can't find map {} for {}, try load program",
            maps::RUNVAR,
            ifname
        ))?;
        let map = Map::Array(map);
        let rvmap: Array<_, u64> = map.try_into()?;
        Ok(Self { rvmap })
    }

    pub fn set(&mut self, rv_idx: u32, value: u64) -> bool {
        match self.rvmap.set(rv_idx, value, 0) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to set {} to {}, {}", rv_idx, value, e);
                false
            }
        }
    }

    pub fn get(&self, rv_idx: u32, def_val: u64) -> u64 {
        match self.rvmap.get(&rv_idx, 0) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to get {}, {}", rv_idx, e);
                def_val
            }
        }
    }

    pub fn set_defaults(&mut self) {
        self.set(FUSED_VERSION_IDX, VERSION as u64);
        self.set_logging_level(log::max_level());
    }

    /// The xdp program logs only the statements at or below this level.
    pub fn set_logging_level(&mut self, level: LevelFilter) {
        if !self.set(LOG_LEVEL_IDX, level as u64) {
            log::warn!("Failed to set log level to {}", level);
        }
    }

    pub fn version(&self) -> u64 {
        self.get(FUSED_VERSION_IDX, 0)
    }
}
