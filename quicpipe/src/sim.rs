//! Host side tables for the decision engine and the `check` dry run.

use crate::{config::Config, helpers::cid_to_str};
use anyhow::{anyhow, Context};
use crossbeam_queue::ArrayQueue;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use quicpipe_common::{
    Cid, Engine, PortFilter, Reason, Redirect4, RedirectTable, RejectSink, SliceFrame, Verdict,
    MAX_PORTS, MAX_REDIRECTS, MAX_REJECTED,
};
use std::{collections::BTreeSet, fmt, net::SocketAddrV4, num::NonZeroUsize};

#[derive(Default)]
pub struct MemPortFilter {
    ports: RwLock<BTreeSet<u16>>,
}

impl MemPortFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails once `MAX_PORTS` distinct ports are inspected.
    pub fn insert(&self, port: u16) -> Result<(), anyhow::Error> {
        let mut ports = self.ports.write();
        if !ports.contains(&port) && ports.len() >= MAX_PORTS as usize {
            return Err(anyhow!(
                "Can't inspect port {}, at most {} ports",
                port,
                MAX_PORTS
            ));
        }
        ports.insert(port);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ports.read().len()
    }
}

impl PortFilter for MemPortFilter {
    fn contains(&self, port: u16) -> bool {
        self.ports.read().contains(&u16::from_be(port))
    }
}

pub struct MemRedirectTable {
    cache: Mutex<LruCache<Cid, Redirect4>>,
}

impl MemRedirectTable {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The capacity is clamped to `1..=MAX_REDIRECTS`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_REDIRECTS as usize);
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    /// Returns the entry pushed out to make room, if the table was full.
    pub fn insert(&self, cid: Cid, target: SocketAddrV4) -> Option<(Cid, SocketAddrV4)> {
        let mut cache = self.cache.lock();
        match cache.push(cid, Redirect4::from(target)) {
            Some((old, r4)) if old != cid => Some((old, SocketAddrV4::from(r4))),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl RedirectTable for MemRedirectTable {
    fn lookup(&self, cid: &Cid) -> Option<Redirect4> {
        self.cache.lock().get(cid).copied()
    }
}

pub struct MemRejectQueue {
    queue: ArrayQueue<Cid>,
}

impl Default for MemRejectQueue {
    fn default() -> Self {
        Self::new(MAX_REJECTED)
    }
}

impl MemRejectQueue {
    /// A zero capacity queue is bumped to one record.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn drain(&self) -> Vec<Cid> {
        let mut cids = Vec::with_capacity(self.len());
        while let Some(cid) = self.queue.pop() {
            cids.push(cid);
        }
        cids
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl RejectSink for MemRejectQueue {
    fn try_publish(&self, cid: &Cid) -> bool {
        self.queue.push(*cid).is_ok()
    }
}

pub type MemEngine = Engine<MemPortFilter, MemRedirectTable, MemRejectQueue>;

pub fn engine_from_config(cfg: &Config) -> Result<MemEngine, anyhow::Error> {
    let ports = MemPortFilter::new();
    for &port in &cfg.ports {
        ports.insert(port)?;
    }

    let redirects = MemRedirectTable::with_capacity(cfg.redirects.len());
    for (cid, target) in cfg.redirect_entries()? {
        redirects.insert(cid, target);
    }

    Ok(Engine::new(ports, redirects, MemRejectQueue::default()))
}

/// Accepts plain hex, optionally split by spaces, colons or new lines.
pub fn parse_packet_hex(input: &str) -> Result<Vec<u8>, anyhow::Error> {
    let digits = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>();
    hex::decode(&digits).context("Invalid hex packet")
}

pub struct CheckReport {
    pub ports: usize,
    pub redirects: usize,
    pub reason: Reason,
    pub verdict: Verdict,
    pub packet: Vec<u8>,
    pub rejected: Vec<Cid>,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "tables: {} ports, {} redirects",
            self.ports, self.redirects
        )?;
        writeln!(f, "reason: {}", self.reason.as_str())?;
        writeln!(f, "verdict: {}", self.verdict.as_str())?;
        for cid in &self.rejected {
            writeln!(f, "rejected: {}", cid_to_str(cid))?;
        }
        write!(f, "packet: {}", hex::encode(&self.packet))
    }
}

/// Runs one packet through the engine built from `cfg`.
pub fn check(cfg: &Config, packet: &[u8]) -> Result<CheckReport, anyhow::Error> {
    let engine = engine_from_config(cfg)?;
    Ok(run(&engine, packet))
}

pub fn run(engine: &MemEngine, packet: &[u8]) -> CheckReport {
    let mut packet = packet.to_vec();
    let reason = engine.classify(&SliceFrame::new(&mut packet));

    CheckReport {
        ports: engine.ports().len(),
        redirects: engine.redirects().len(),
        reason,
        verdict: reason.verdict(),
        packet,
        rejected: engine.rejected().drain(),
    }
}

#[cfg(test)]
impl MemPortFilter {
    pub fn remove(&self, port: u16) -> bool {
        self.ports.write().remove(&port)
    }
}

#[cfg(test)]
impl MemRedirectTable {
    pub fn remove(&self, cid: &Cid) -> Option<SocketAddrV4> {
        self.cache.lock().pop(cid).map(SocketAddrV4::from)
    }
}
