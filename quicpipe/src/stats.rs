use crate::{helpers::mapdata_from_pinned_map, info::InfoTable};
use anyhow::anyhow;
use aya::maps::{Map, MapData, PerCpuArray};
use quicpipe_common::{maps, stats, Reason};

pub fn stat_name(stat_idx: u32) -> &'static str {
    if stat_idx == stats::PACKETS {
        return "packets";
    }
    Reason::ALL
        .iter()
        .find(|r| stats::index(**r) == stat_idx)
        .map(|r| r.as_str())
        .unwrap_or("unknown")
}

pub struct Stats {
    ifname: String,
    smap: PerCpuArray<MapData, u64>,
}

impl Stats {
    pub fn new(ifname: &str) -> Result<Self, anyhow::Error> {
        let map = mapdata_from_pinned_map(ifname, maps::STATS).ok_or(anyhow!(
            "Can't find map {} for {}, try load program",
            maps::STATS,
            ifname
        ))?;
        let map = Map::PerCpuArray(map);
        let smap: PerCpuArray<_, u64> = map.try_into()?;
        Ok(Self {
            ifname: String::from(ifname),
            smap,
        })
    }

    fn get(&self, stat_idx: u32) -> u64 {
        match self.smap.get(&stat_idx, 0) {
            Err(e) => {
                log::error!("Failed to get {}, {}", stat_name(stat_idx), e);
                0
            }
            Ok(pcv) => pcv.iter().sum(),
        }
    }

    pub fn print_all(&self) {
        let mut sinfo = InfoTable::new(vec![format!("{} stat", self.ifname).as_str(), "count"]);

        for idx in 0..stats::MAX {
            sinfo.push_row(vec![stat_name(idx).to_string(), self.get(idx).to_string()]);
        }

        sinfo.print("");
    }
}
