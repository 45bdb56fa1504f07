#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, HashMap, LruHashMap, PerCpuArray, RingBuf},
    programs::XdpContext,
};
use aya_log_ebpf::{debug, warn, Level};
use quicpipe_common::{
    runvars, stats, Cid, Engine, Frame, PortFilter, Reason, Redirect4, RedirectTable, RejectSink,
    Verdict, MAX_PORTS, MAX_REDIRECTS, REJECTED_RB_SIZE,
};

/// Stores the program instance runtime variables.
#[map]
static QP_RUNVAR: Array<u64> = Array::with_max_entries(runvars::MAX_RUNTIME_VARS, 0);

/// Stores the program statistics, one counter per decision reason.
#[map]
static QP_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(stats::MAX, 0);

/// UDP destination ports (network order) whose traffic is inspected.
/// Only the user space app updates it. Pinned to bpffs so that all
/// interfaces share the same set.
#[map]
static QP_PORTS: HashMap<u16, u8> = HashMap::<u16, u8>::pinned(MAX_PORTS, 0);

type LHMR4 = LruHashMap<Cid, Redirect4>;
/// Learned connection ids and the IPv4 endpoint to turn the packet to.
/// The user space inserts and the kernel evicts the least recently used
/// entries when full.
#[map]
static QP_REDIRECT4: LHMR4 = LHMR4::pinned(MAX_REDIRECTS, 0);

/// Connection ids that didn't match any redirect. Drained by user space.
#[map]
static QP_REJECTED: RingBuf = RingBuf::pinned(REJECTED_RB_SIZE, 0);

struct Features {
    log_level: u64,
}

impl Features {
    fn new() -> Self {
        let log_level = match QP_RUNVAR.get(runvars::LOG_LEVEL_IDX) {
            None => 0,
            Some(rvlevel) => *rvlevel,
        };
        Self { log_level }
    }

    #[inline(always)]
    fn log_enabled(&self, level: Level) -> bool {
        self.log_level >= level as u64
    }
}

struct XdpFrame<'a>(&'a XdpContext);

impl Frame for XdpFrame<'_> {
    #[inline(always)]
    fn data(&self) -> usize {
        self.0.data()
    }

    #[inline(always)]
    fn data_end(&self) -> usize {
        self.0.data_end()
    }
}

struct Ports;

impl PortFilter for Ports {
    #[inline(always)]
    fn contains(&self, port: u16) -> bool {
        unsafe { QP_PORTS.get(&port) }.is_some()
    }
}

struct Redirects;

impl RedirectTable for Redirects {
    #[inline(always)]
    fn lookup(&self, cid: &Cid) -> Option<Redirect4> {
        unsafe { QP_REDIRECT4.get(cid) }.copied()
    }
}

struct Rejected;

impl RejectSink for Rejected {
    #[inline(always)]
    fn try_publish(&self, cid: &Cid) -> bool {
        match QP_REJECTED.reserve::<Cid>(0) {
            Some(mut entry) => {
                entry.write(*cid);
                entry.submit(0);
                true
            }
            None => false,
        }
    }
}

#[inline(always)]
fn stats_inc(idx: u32) {
    if let Some(ctr) = QP_STATS.get_ptr_mut(idx) {
        unsafe {
            *ctr += 1;
        }
    }
}

#[xdp]
pub fn quicpipe(ctx: XdpContext) -> u32 {
    let engine = Engine::new(Ports, Redirects, Rejected);
    let reason = engine.classify(&XdpFrame(&ctx));

    if reason.is_inspected() {
        stats_inc(stats::PACKETS);
    }
    stats_inc(stats::index(reason));

    log_reason(&ctx, reason);

    match reason.verdict() {
        Verdict::Drop => xdp_action::XDP_DROP,
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Tx => xdp_action::XDP_TX,
    }
}

#[inline(always)]
fn log_reason(ctx: &XdpContext, reason: Reason) {
    let feat = Features::new();

    match reason {
        Reason::RejectedLost => {
            if feat.log_enabled(Level::Warn) {
                warn!(ctx, "[quic] rejected queue full, cid report lost");
            }
        }
        Reason::Redirected | Reason::Rejected | Reason::Bypass | Reason::LongHeader => {
            if feat.log_enabled(Level::Debug) {
                debug!(
                    ctx,
                    "[quic] {} -> {}",
                    reason.as_str(),
                    reason.verdict().as_str()
                );
            }
        }
        _ => {}
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
