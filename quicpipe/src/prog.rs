use crate::{helpers::*, runvars::RunVars};
use anyhow::{anyhow, Context};
use aya::{
    programs::{
        links::{FdLink, PinnedLink},
        Xdp, XdpFlags,
    },
    Btf, Ebpf, EbpfLoader,
};
use log::info;
use quicpipe_common::maps;
use std::path::{Path, PathBuf};

/// Loads the BTF data from /sys/kernel/btf/vmlinux and the xdp object.
/// The shared maps are reused from bpffs if they are already pinned.
pub fn bpf_instance(object: &Path) -> Result<Ebpf, anyhow::Error> {
    EbpfLoader::new()
        .btf(Btf::from_sys_fs().ok().as_ref())
        .map_pin_path(crate::BPFFS)
        .load_file(object)
        .with_context(|| format!("Failed to load the program object {:?}", object))
}

// Manages the life cycle of a program for a specific network interface
pub struct Prog {
    ifname: String,
    link_path: PathBuf,
    pub link_path_str: String,
    pub link_exists: bool,
}

impl Prog {
    pub fn new(ifname: &str) -> Result<Self, anyhow::Error> {
        let (path, link_exists) = prog_bpffs(ifname)?;
        let path_str = path.to_string_lossy().to_string();

        Ok(Self {
            ifname: ifname.to_string(),
            link_path: path,
            link_path_str: path_str,
            link_exists,
        })
    }

    fn unload_by_pinned_link(&mut self) -> Result<bool, anyhow::Error> {
        if !self.link_exists {
            return Ok(false);
        }

        let link = PinnedLink::from_pin(&self.link_path)
            .context("Failed to load pinned link for quicpipe bpffs")?;

        // The link and the program stay attached until the last fd is closed.
        link.unpin().context("Can't unpin program link")?;

        let (_, link_exists) = prog_bpffs(&self.ifname)?;
        self.link_exists = link_exists;

        info!(
            "[{}] Pinned link {} {}removed",
            &self.ifname,
            &self.link_path_str,
            if link_exists { "not " } else { "" }
        );

        Ok(link_exists)
    }

    pub fn unload(&mut self) -> Result<(), anyhow::Error> {
        let file_exists = match self.unload_by_pinned_link() {
            Ok(exists) => exists,
            Err(e) => {
                log::warn!("[{}] Failed to remove pinned, {}", &self.ifname, e);
                true
            }
        };

        if file_exists {
            if let Err(e) = std::fs::remove_file(&self.link_path) {
                log::warn!(
                    "[{}] Failed to remove bpffs {}, {}",
                    &self.ifname,
                    self.link_path_str,
                    e
                );
            }
        }

        teardown_pins(&self.program_map_pins());

        Ok(())
    }

    /// Detaches the programs from all interfaces and removes every map.
    pub fn teardown() -> Result<(), anyhow::Error> {
        let pins = quicpipe_pins()?;
        let (links, maps): (Vec<_>, Vec<_>) = pins.into_iter().partition(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("qp_"))
                .is_some_and(|ifname| ifindex(ifname).is_ok())
        });

        for link in &links {
            match PinnedLink::from_pin(link) {
                Ok(link) => {
                    if let Err(e) = link.unpin() {
                        log::warn!("Can't unpin program link, {}", e);
                    }
                }
                Err(e) => log::warn!("Failed to load pinned link {:?}, {}", link, e),
            }
        }

        teardown_pins(&links);
        teardown_pins(&maps);
        info!("Removed {} links and {} maps", links.len(), maps.len());

        Ok(())
    }

    fn load_program(bpf: &mut Ebpf) -> Result<&mut Xdp, anyhow::Error> {
        let program: &mut Xdp = bpf
            .program_mut(crate::PROG_NAME)
            .ok_or(anyhow!("No program {} in object", crate::PROG_NAME))?
            .try_into()?;
        program.load().context("Failed to load program in kernel")?;
        Ok(program)
    }

    fn program_map_pins(&self) -> Vec<PathBuf> {
        [maps::RUNVAR, maps::STATS]
            .iter()
            .filter_map(|name| pinned_link_bpffs_path(&self.ifname, name))
            .collect()
    }

    /// Pins the maps owned by this program instance, replacing the pins of
    /// the previous instance.
    fn pin_program_maps(&self, bpf: &Ebpf) -> Result<(), anyhow::Error> {
        for name in [maps::RUNVAR, maps::STATS] {
            let map = bpf
                .map(name)
                .ok_or(anyhow!("No map {} in object", name))?;
            let path = pinned_link_bpffs_path(&self.ifname, name)
                .ok_or(anyhow!("Invalid map name {}", name))?;

            if path.try_exists()? {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove stale pin {:?}", path))?;
            }

            map.pin(&path)
                .with_context(|| format!("Failed to create pinned link for map {}", name))?;
            info!("Pinned link created for map {} at {:?}", name, path);
        }
        Ok(())
    }

    pub fn replace(&self, bpf: &mut Ebpf) -> Result<(), anyhow::Error> {
        if !self.link_exists {
            return Err(anyhow!(
                "Can't replace program, link {} doesn't exist, try load the program first",
                self.link_path_str
            ));
        }

        let program = Self::load_program(bpf)?;

        let link = PinnedLink::from_pin(&self.link_path)
            .context("Failed to load pinned link for quicpipe bpffs")?;
        let link = FdLink::from(link);
        program
            .attach_to_link(link.try_into()?)
            .context("Failed to attach new program to existing link")?;

        match program.info() {
            Ok(info) => log::info!(
                "Pinned link attached to program id: {} binded to {}",
                info.id(),
                self.ifname
            ),
            Err(e) => log::error!("Failed to get program info, {}", e),
        };

        self.post_load_init(bpf)?;

        info!(
            "Successfully replace the program on interface {}",
            self.ifname
        );

        Ok(())
    }

    pub fn load(&self, bpf: &mut Ebpf, flags: XdpFlags) -> Result<(), anyhow::Error> {
        if self.link_exists {
            return Err(anyhow!(
                "Can't load program, link {} already exists, try replace instead",
                self.link_path_str
            ));
        }

        let program = Self::load_program(bpf)?;
        let xdplinkid = program
            .attach(&self.ifname, flags)
            .context("Failed to attach program link to interface")?;

        // Pin the program link to bpffs, otherwise the link is dropped
        // and the program detached when the user app exits.
        let xdplink = program.take_link(xdplinkid)?;
        let fdlink: FdLink = xdplink.try_into()?;
        fdlink
            .pin(&self.link_path)
            .context("Failed to create pinned link for program")?;

        self.post_load_init(bpf)?;

        info!("Successfully load the program on interface {}", self.ifname);

        Ok(())
    }

    fn post_load_init(&self, bpf: &Ebpf) -> Result<(), anyhow::Error> {
        self.pin_program_maps(bpf)?;

        let mut runvars = RunVars::new(&self.ifname)?;
        runvars.set_defaults();
        info!(
            "[{}] Program version {} log level {}",
            self.ifname,
            runvars.version(),
            log::max_level()
        );

        Ok(())
    }
}
