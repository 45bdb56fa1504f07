#![cfg_attr(not(test), no_std)]

pub mod csum;
pub mod cursor;
pub mod engine;
pub mod rewrite;
pub mod tables;

pub use cursor::{Cursor, Frame, SliceFrame, Truncated};
pub use engine::{Engine, Reason, Verdict};
pub use tables::{PortFilter, RedirectTable, RejectSink};

use core::net::{Ipv4Addr, SocketAddrV4};

pub const VERSION: u32 = 0x0000001;

/// Length of the destination connection id carried by short header packets.
pub const CID_LEN: usize = 12;
/// Max UDP ports that can be inspected at the same time.
pub const MAX_PORTS: u32 = 32;
/// Redirect table capacity, ~36 MB for ~2m entries.
pub const MAX_REDIRECTS: u32 = 2 * 1024 * 1024;
/// Rejected cids ring buffer size in bytes, ~5k records.
pub const REJECTED_RB_SIZE: u32 = 64 * 1024;
/// Max rejected cids records that fit in the ring buffer.
pub const MAX_REJECTED: usize = REJECTED_RB_SIZE as usize / CID_LEN;

pub mod maps {
    pub const PORTS: &str = "QP_PORTS";
    pub const REDIRECT4: &str = "QP_REDIRECT4";
    pub const REJECTED: &str = "QP_REJECTED";
    pub const STATS: &str = "QP_STATS";
    pub const RUNVAR: &str = "QP_RUNVAR";
}

pub mod runvars {
    pub const FUSED_VERSION_IDX: u32 = 0;
    pub const LOG_LEVEL_IDX: u32 = 1;
    pub const MAX_RUNTIME_VARS: u32 = 4;
}

pub mod stats {
    use crate::engine::Reason;

    /// Packets that matched an inspected port.
    pub const PACKETS: u32 = 0;
    pub const MAX: u32 = Reason::LAST as u32 + 1;

    pub const fn index(reason: Reason) -> u32 {
        reason as u32
    }
}

/// QUIC destination connection id as found on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    pub bytes: [u8; CID_LEN],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Cid {}

impl Cid {
    pub const fn new(bytes: [u8; CID_LEN]) -> Self {
        Self { bytes }
    }

    /// The first cid bit marks the newer protocol variant that is never redirected.
    #[inline(always)]
    pub fn is_bypass(&self) -> bool {
        self.bytes[0] & 0x80 != 0
    }
}

impl From<[u8; CID_LEN]> for Cid {
    fn from(bytes: [u8; CID_LEN]) -> Self {
        Self { bytes }
    }
}

/// The IPv4 endpoint a cid is redirected to.
/// Both fields are big-endian and are copied as-is into the packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Redirect4 {
    pub addr: u32,
    pub port: u16,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Redirect4 {}

impl Redirect4 {
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.addr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.port)
    }
}

impl From<SocketAddrV4> for Redirect4 {
    fn from(sa: SocketAddrV4) -> Self {
        Self {
            addr: u32::from(*sa.ip()).to_be(),
            port: sa.port().to_be(),
        }
    }
}

impl From<Redirect4> for SocketAddrV4 {
    fn from(r4: Redirect4) -> Self {
        SocketAddrV4::new(r4.ip(), r4.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect4_keeps_network_order() {
        let r4 = Redirect4::from(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4433));
        assert_eq!(r4.addr.to_ne_bytes(), [10, 0, 0, 5]);
        assert_eq!(r4.port.to_ne_bytes(), 4433_u16.to_be_bytes());
        assert_eq!(
            SocketAddrV4::from(r4),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4433)
        );
    }

    #[test]
    fn bypass_bit() {
        let mut cid = Cid::new([0x7f; CID_LEN]);
        assert!(!cid.is_bypass());
        cid.bytes[0] = 0x80;
        assert!(cid.is_bypass());
    }

    #[test]
    fn rejected_capacity() {
        assert_eq!(MAX_REJECTED, 5461);
    }
}
