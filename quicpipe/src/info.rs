use crate::helpers::*;

use aya::{maps::MapData, programs::loaded_programs};
use chrono::{DateTime, Local};
use log::warn;
use quicpipe_common::maps;

/// Column aligned table printed by the listing commands.
pub struct InfoTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        Self {
            header: header.iter().map(|s| s.to_string()).collect(),
            rows: vec![],
        }
    }

    /// Missing cells are printed empty, extra cells are ignored.
    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn render(&self, title: &str) -> String {
        let mut sizes = self.header.iter().map(|s| s.len()).collect::<Vec<_>>();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate().take(sizes.len()) {
                sizes[i] = sizes[i].max(cell.len());
            }
        }

        let line = |row: &Vec<String>| {
            let line = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    let cell = row.get(i).map(|s| s.as_str()).unwrap_or_default();
                    format!("{0:<1$}", cell, size + 1)
                })
                .collect::<String>();
            line.trim_end().to_string()
        };

        let hdr_len = sizes.iter().sum::<usize>() + sizes.len().saturating_sub(1);
        let mut out = String::new();
        if !title.is_empty() {
            out.push_str(&format!("{}\n", title));
        }
        out.push_str(&format!("{}\n", line(&self.header)));
        out.push_str(&format!("{0:-<1$}\n", "", hdr_len));
        for row in &self.rows {
            out.push_str(&format!("{}\n", line(row)));
        }
        if !self.rows.is_empty() {
            out.push_str(&format!("{0:-<1$}\n", "", hdr_len));
        }
        out
    }

    pub fn print(&self, title: &str) {
        print!("{}", self.render(title));
    }
}

fn list_programs() {
    let mut tab = InfoTable::new(vec!["id", "tag", "loaded_at"]);

    for prog in loaded_programs().filter_map(|p| match p {
        Ok(prog) => {
            if prog.name_as_str().unwrap_or_default() == crate::PROG_NAME {
                Some(prog)
            } else {
                None
            }
        }
        Err(e) => {
            warn!("Failed to get program info, {}", e);
            None
        }
    }) {
        let loaded_at = match prog.loaded_at() {
            Some(at) => {
                let dt: DateTime<Local> = at.into();
                dt.format("%H:%M:%S %d-%m-%Y").to_string()
            }
            None => "n/a".to_string(),
        };
        tab.push_row(vec![
            prog.id().to_string(),
            format!("{:x}", prog.tag()),
            loaded_at,
        ]);
    }

    tab.print(&format!("Loaded quicpipe programs: {}", tab.len()));
}

fn list_links() -> Result<(), anyhow::Error> {
    let mut tab = InfoTable::new(vec!["ifname", "pin"]);

    for path in quicpipe_pins()? {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let ifname = match name.strip_prefix("qp_") {
            Some(ifname) => ifname,
            None => continue,
        };
        // skip the per program map pins
        if ifindex(ifname).is_err() {
            continue;
        }
        tab.push_row(vec![ifname.to_string(), path.to_string_lossy().to_string()]);
    }

    tab.print(&format!("Attached interfaces: {}", tab.len()));
    Ok(())
}

fn list_maps() {
    let mut tab = InfoTable::new(vec!["name", "id", "max", "flags", "pin"]);

    for name in [maps::PORTS, maps::REDIRECT4, maps::REJECTED] {
        let path = match pinned_link_bpffs_path("", name) {
            Some(path) => path,
            None => continue,
        };
        let row = match MapData::from_pin(&path).map(|m| m.info()) {
            Ok(Ok(info)) => vec![
                info.name_as_str().unwrap_or(name).to_string(),
                info.id().to_string(),
                info.max_entries().to_string(),
                format!("{:x}h", info.map_flags()),
                path.to_string_lossy().to_string(),
            ],
            Ok(Err(e)) => vec![name.to_string(), "err".to_string(), e.to_string()],
            Err(_) => vec![name.to_string(), "n/a".to_string()],
        };
        tab.push_row(row);
    }

    tab.print("Shared maps");
}

pub(crate) fn list_info() -> Result<(), anyhow::Error> {
    list_programs();
    println!();
    list_links()?;
    println!();
    list_maps();
    Ok(())
}
