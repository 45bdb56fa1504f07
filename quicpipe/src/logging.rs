use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{info, warn};
use tokio::signal;

/// Forwards the xdp program log records to the user app logger.
pub fn init_log(bpf: &mut Ebpf) -> bool {
    match EbpfLogger::init(bpf) {
        Ok(_) => true,
        Err(e) => {
            // This can happen if all log statements are removed from eBPF program.
            warn!("Failed to initialize eBPF logger: {}", e);
            false
        }
    }
}

/// Keeps the logger running until Ctrl-C.
pub async fn follow(ifname: &str) -> Result<(), anyhow::Error> {
    info!("[{}] Following program logs, waiting for Ctrl-C...", ifname);
    signal::ctrl_c().await?;
    info!("Exiting...");
    Ok(())
}
