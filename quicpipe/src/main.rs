mod config;
mod helpers;
mod info;
mod logging;
mod ports;
mod prog;
mod redirects;
mod rejected;
mod runvars;
mod sim;
mod stats;

use anyhow::Context;
use aya::programs::XdpFlags;
use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigFile};
use helpers::{increase_memlocked, parse_cid};
use log::{debug, info};
use prog::Prog;
use quicpipe_common::Cid;
use std::{net::SocketAddrV4, path::PathBuf, time::Duration};

/// Default location for bpffs
const BPFFS: &str = "/sys/fs/bpf";

/// Program name or main function of xdp program
const PROG_NAME: &str = "quicpipe";

const DEFAULT_OBJECT: &str = "target/bpfel-unknown-none/release/quicpipe";

/// Associates a map key type with the name of its pinned map.
pub trait ToMapName {
    fn map_name() -> &'static str;

    fn is_lru() -> bool {
        false
    }
}

#[derive(Debug, Parser)]
#[clap(version, about = "Redirects QUIC short header packets by connection id")]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the xdp program attached to an interface
    Prog {
        #[clap(subcommand)]
        action: ProgAction,
    },
    /// List the loaded programs, attached interfaces and shared maps
    Info,
    /// Manage the UDP ports whose traffic is inspected
    Port {
        #[clap(subcommand)]
        action: PortAction,
    },
    /// Manage the connection id redirects
    Redirect {
        #[clap(subcommand)]
        action: RedirectAction,
    },
    /// Print the connection ids that didn't match any redirect
    Rejected {
        /// Stop after this many records
        #[clap(long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[clap(long)]
        timeout: Option<u64>,
    },
    /// Print the program counters for an interface
    Stats { ifname: String },
    /// Save or restore the ports and redirects
    Config {
        #[clap(subcommand)]
        action: ConfigAction,
    },
    /// Run a packet through the decision engine without the kernel
    Check {
        /// Config file with the ports and redirects to use
        #[clap(long)]
        config: Option<String>,
        /// The packet as hex, starting with the Ethernet header
        packet: String,
    },
}

#[derive(Debug, Args)]
struct XdpMode {
    /// Try attach the program in driver mode. In this mode the network interface driver must
    /// support XDP.
    #[clap(long, conflicts_with = "skb")]
    driver: bool,

    /// Try attach the program in skb mode. This mode is supported even if the network
    /// interface driver doesn't support XDP.
    #[clap(long)]
    skb: bool,
}

impl XdpMode {
    fn flags(&self, ifname: &str) -> XdpFlags {
        if self.driver {
            info!("Attach program to {} in DRIVER mode", ifname);
            XdpFlags::DRV_MODE
        } else if self.skb {
            info!("Attach program to {} in SKB mode", ifname);
            XdpFlags::SKB_MODE
        } else {
            info!("Attach program to {} using default kernel mode", ifname);
            XdpFlags::default()
        }
    }
}

#[derive(Debug, Subcommand)]
enum ProgAction {
    /// Attach the program to an interface
    Load {
        ifname: String,
        #[clap(flatten)]
        mode: XdpMode,
        /// The xdp object file
        #[clap(long, default_value = DEFAULT_OBJECT)]
        object: PathBuf,
        /// Print the program logs until Ctrl-C
        #[clap(long)]
        follow: bool,
    },
    /// Load a new program into the existing interface link
    Replace {
        ifname: String,
        /// The xdp object file
        #[clap(long, default_value = DEFAULT_OBJECT)]
        object: PathBuf,
        /// Print the program logs until Ctrl-C
        #[clap(long)]
        follow: bool,
    },
    /// Detach the program from an interface
    Unload { ifname: String },
    /// Detach the program from all interfaces and remove all maps
    Teardown,
}

#[derive(Debug, Subcommand)]
enum PortAction {
    Add {
        #[clap(required = true)]
        ports: Vec<u16>,
    },
    Remove {
        #[clap(required = true)]
        ports: Vec<u16>,
    },
    Clear,
    List,
}

fn cid_arg(input: &str) -> Result<Cid, anyhow::Error> {
    parse_cid(input)
}

#[derive(Debug, Subcommand)]
enum RedirectAction {
    /// Redirect all connection ids to the same IPv4 endpoint
    Add {
        target: SocketAddrV4,
        /// Connection ids as 24 hex digits
        #[clap(required = true, value_parser = cid_arg)]
        cids: Vec<Cid>,
    },
    Remove {
        #[clap(required = true, value_parser = cid_arg)]
        cids: Vec<Cid>,
    },
    /// Remove all redirects or only the ones to the target
    Clear {
        #[clap(long)]
        target: Option<SocketAddrV4>,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Write the live ports and redirects to file
    Save { file: String },
    /// Add the ports and redirects from file
    Load { file: String },
}

async fn handle_prog(action: ProgAction) -> Result<(), anyhow::Error> {
    match action {
        ProgAction::Load {
            ifname,
            mode,
            object,
            follow,
        } => {
            let prog = Prog::new(&ifname)?;
            let mut bpf = prog::bpf_instance(&object)?;
            if follow {
                logging::init_log(&mut bpf);
            }
            prog.load(&mut bpf, mode.flags(&ifname))?;
            if follow {
                logging::follow(&ifname).await?;
            }
        }
        ProgAction::Replace {
            ifname,
            object,
            follow,
        } => {
            let prog = Prog::new(&ifname)?;
            let mut bpf = prog::bpf_instance(&object)?;
            if follow {
                logging::init_log(&mut bpf);
            }
            prog.replace(&mut bpf)?;
            if follow {
                logging::follow(&ifname).await?;
            }
        }
        ProgAction::Unload { ifname } => Prog::new(&ifname)?.unload()?,
        ProgAction::Teardown => Prog::teardown()?,
    }
    Ok(())
}

fn handle_check(config: Option<String>, packet: &str) -> Result<(), anyhow::Error> {
    let cfg = match config {
        Some(file) => ConfigFile::new(&file).read()?,
        None => Config::default(),
    };
    let packet = sim::parse_packet_hex(packet)?;
    let report = sim::check(&cfg, &packet)?;
    println!("{}", report);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::init();

    if let Err(e) = increase_memlocked() {
        debug!("{}", e);
    }

    match opt.command {
        Command::Prog { action } => handle_prog(action).await?,
        Command::Info => info::list_info()?,
        Command::Port { action } => match action {
            PortAction::Add { ports } => ports::add(&ports)?,
            PortAction::Remove { ports } => ports::remove(&ports)?,
            PortAction::Clear => ports::clear()?,
            PortAction::List => ports::list()?,
        },
        Command::Redirect { action } => match action {
            RedirectAction::Add { target, cids } => redirects::add(target, &cids)?,
            RedirectAction::Remove { cids } => redirects::remove(&cids)?,
            RedirectAction::Clear { target } => redirects::clear(target)?,
            RedirectAction::List => redirects::list()?,
        },
        Command::Rejected { count, timeout } => {
            rejected::watch(count, timeout.map(Duration::from_secs)).await?
        }
        Command::Stats { ifname } => stats::Stats::new(&ifname)
            .context("No program counters")?
            .print_all(),
        Command::Config { action } => match action {
            ConfigAction::Save { file } => ConfigFile::new(&file).save()?,
            ConfigAction::Load { file } => ConfigFile::new(&file).load()?,
        },
        Command::Check { config, packet } => handle_check(config, &packet)?,
    }

    Ok(())
}
