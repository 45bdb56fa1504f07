use anyhow::{anyhow, Context};
use clap::Parser;
use std::{path::PathBuf, process::Command};

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
enum Arch {
    #[clap(name = "bpfel-unknown-none")]
    BpfEl,
    #[clap(name = "bpfeb-unknown-none")]
    BpfEb,
}

impl Arch {
    fn as_str(&self) -> &'static str {
        match self {
            Arch::BpfEl => "bpfel-unknown-none",
            Arch::BpfEb => "bpfeb-unknown-none",
        }
    }
}

#[derive(Debug, Parser)]
struct BuildOptions {
    /// Target the xdp program is built for
    #[clap(long, value_enum, default_value = "bpfel-unknown-none")]
    target: Arch,

    /// Build in debug mode, the default is release
    #[clap(long)]
    debug: bool,
}

impl BuildOptions {
    fn profile_args(&self) -> &'static [&'static str] {
        if self.debug {
            &[]
        } else {
            &["--release"]
        }
    }
}

#[derive(Debug, Parser)]
enum Opt {
    /// Build the xdp object with the nightly toolchain
    BuildEbpf(BuildOptions),
    /// Build the xdp object and the control plane
    Build(BuildOptions),
}

fn workspace_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default()
}

fn run(cmd: &mut Command) -> Result<(), anyhow::Error> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {:?}", cmd))?;
    if !status.success() {
        return Err(anyhow!("{:?} failed with {}", cmd, status));
    }
    Ok(())
}

fn build_ebpf(opts: &BuildOptions) -> Result<(), anyhow::Error> {
    let dir = workspace_dir().join("quicpipe-ebpf");
    let target = format!("--target={}", opts.target.as_str());
    let mut args = vec!["build", target.as_str(), "-Z", "build-std=core"];
    args.extend(opts.profile_args());

    run(Command::new("cargo")
        .current_dir(dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(["+nightly"])
        .args(&args))
}

fn build(opts: &BuildOptions) -> Result<(), anyhow::Error> {
    build_ebpf(opts)?;

    let mut args = vec!["build", "--package", "quicpipe"];
    args.extend(opts.profile_args());

    run(Command::new("cargo").current_dir(workspace_dir()).args(&args))
}

fn main() -> Result<(), anyhow::Error> {
    match Opt::parse() {
        Opt::BuildEbpf(opts) => build_ebpf(&opts),
        Opt::Build(opts) => build(&opts),
    }
}
