//! Per packet decision: parse Ethernet/IPv4/UDP/QUIC, look up the cid and
//! either turn the packet around or report the cid and drop it.

use crate::{
    cursor::{Cursor, Frame},
    rewrite,
    tables::{PortFilter, RedirectTable, RejectSink},
    Cid,
};
use core::ptr::{self, addr_of};
use network_types::{eth::EthHdr, ip::Ipv4Hdr, udp::UdpHdr};

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const IPPROTO_UDP: u8 = 0x11;
/// IHL of a header without options, in 32-bit words.
const IPV4_IHL: u8 = 5;
const QUIC_FIXED_BIT: u8 = 0x40;
const QUIC_LONG_FORM: u8 = 0x80;

/// The final decision; the values are the xdp actions.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Drop = 1,
    Pass = 2,
    Tx = 3,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Pass => "pass",
            Self::Tx => "tx",
        }
    }
}

/// Why a packet ended up with its verdict. There is one value per terminal
/// path and the values double as indexes in the stats map.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    EthTruncated = 1,
    NotIpv4,
    Ipv6,
    IpTruncated,
    IpOptions,
    NotUdp,
    UdpTruncated,
    PortNotInspected,
    QuicTruncated,
    NotQuic,
    LongHeader,
    CidTruncated,
    Bypass,
    Redirected,
    Rejected,
    RejectedLost,
}

impl Reason {
    pub const LAST: Reason = Reason::RejectedLost;

    pub const ALL: [Reason; Reason::LAST as usize] = [
        Reason::EthTruncated,
        Reason::NotIpv4,
        Reason::Ipv6,
        Reason::IpTruncated,
        Reason::IpOptions,
        Reason::NotUdp,
        Reason::UdpTruncated,
        Reason::PortNotInspected,
        Reason::QuicTruncated,
        Reason::NotQuic,
        Reason::LongHeader,
        Reason::CidTruncated,
        Reason::Bypass,
        Reason::Redirected,
        Reason::Rejected,
        Reason::RejectedLost,
    ];

    /// Until the destination port matches, anything unexpected is left to the
    /// host stack. Past that point short or malformed payloads are dropped.
    pub const fn verdict(self) -> Verdict {
        match self {
            Self::EthTruncated
            | Self::NotIpv4
            | Self::Ipv6
            | Self::IpTruncated
            | Self::IpOptions
            | Self::NotUdp
            | Self::UdpTruncated
            | Self::PortNotInspected
            | Self::LongHeader
            | Self::Bypass => Verdict::Pass,
            Self::QuicTruncated
            | Self::NotQuic
            | Self::CidTruncated
            | Self::Rejected
            | Self::RejectedLost => Verdict::Drop,
            Self::Redirected => Verdict::Tx,
        }
    }

    /// True if the packet was sent to an inspected port.
    pub const fn is_inspected(self) -> bool {
        self as u32 > Self::PortNotInspected as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EthTruncated => "eth_truncated",
            Self::NotIpv4 => "not_ipv4",
            Self::Ipv6 => "ipv6",
            Self::IpTruncated => "ip_truncated",
            Self::IpOptions => "ip_options",
            Self::NotUdp => "not_udp",
            Self::UdpTruncated => "udp_truncated",
            Self::PortNotInspected => "port_not_inspected",
            Self::QuicTruncated => "quic_truncated",
            Self::NotQuic => "not_quic",
            Self::LongHeader => "long_header",
            Self::CidTruncated => "cid_truncated",
            Self::Bypass => "bypass",
            Self::Redirected => "redirected",
            Self::Rejected => "rejected",
            Self::RejectedLost => "rejected_lost",
        }
    }
}

/// The decision pipeline bound to its tables.
pub struct Engine<P, R, S> {
    ports: P,
    redirects: R,
    rejected: S,
}

impl<P, R, S> Engine<P, R, S> {
    pub const fn new(ports: P, redirects: R, rejected: S) -> Self {
        Self {
            ports,
            redirects,
            rejected,
        }
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn redirects(&self) -> &R {
        &self.redirects
    }

    pub fn rejected(&self) -> &S {
        &self.rejected
    }
}

impl<P: PortFilter, R: RedirectTable, S: RejectSink> Engine<P, R, S> {
    #[inline(always)]
    pub fn dispatch<F: Frame>(&self, frame: &F) -> Verdict {
        self.classify(frame).verdict()
    }

    /// Runs the pipeline once. On [`Reason::Redirected`] the packet was
    /// rewritten in place.
    #[inline(always)]
    pub fn classify<F: Frame>(&self, frame: &F) -> Reason {
        match self.try_classify(frame) {
            Ok(reason) | Err(reason) => reason,
        }
    }

    // Err carries the reason the pipeline stopped before the lookup.
    #[inline(always)]
    fn try_classify<F: Frame>(&self, frame: &F) -> Result<Reason, Reason> {
        let mut cursor = Cursor::new();

        let eth = cursor
            .read::<EthHdr, F>(frame)
            .map_err(|_| Reason::EthTruncated)?;
        let ether_type = unsafe { ptr::read_unaligned(addr_of!((*eth).ether_type) as *const u16) };
        match u16::from_be(ether_type) {
            ETH_P_IP => {}
            ETH_P_IPV6 => return Err(Reason::Ipv6),
            _ => return Err(Reason::NotIpv4),
        }

        let ipv4 = ipv4_udp(frame, &mut cursor)?;

        let udp = cursor
            .read::<UdpHdr, F>(frame)
            .map_err(|_| Reason::UdpTruncated)?;
        let dst_port = unsafe { addr_of!((*udp).dest).read_unaligned() };
        if !self.ports.contains(dst_port) {
            return Err(Reason::PortNotInspected);
        }

        let cid = quic_short_cid(frame, &mut cursor)?;
        if cid.is_bypass() {
            return Err(Reason::Bypass);
        }

        match self.redirects.lookup(&cid) {
            Some(target) => {
                unsafe { rewrite::redirect4(eth, ipv4, udp, &target) };
                Ok(Reason::Redirected)
            }
            None if self.rejected.try_publish(&cid) => Ok(Reason::Rejected),
            None => Ok(Reason::RejectedLost),
        }
    }
}

#[inline(always)]
fn ipv4_udp<F: Frame>(frame: &F, cursor: &mut Cursor) -> Result<*mut Ipv4Hdr, Reason> {
    let ipv4 = cursor
        .read::<Ipv4Hdr, F>(frame)
        .map_err(|_| Reason::IpTruncated)?;

    // version and ihl share the first byte
    let version_ihl = unsafe { *(ipv4 as *const u8) };
    if version_ihl & 0x0f != IPV4_IHL {
        return Err(Reason::IpOptions);
    }

    let proto = unsafe { *(addr_of!((*ipv4).proto) as *const u8) };
    if proto != IPPROTO_UDP {
        return Err(Reason::NotUdp);
    }

    Ok(ipv4)
}

/// Only short header packets carry a fixed size cid right after the flags.
#[inline(always)]
fn quic_short_cid<F: Frame>(frame: &F, cursor: &mut Cursor) -> Result<Cid, Reason> {
    let flags = cursor
        .read::<u8, F>(frame)
        .map_err(|_| Reason::QuicTruncated)?;
    let flags = unsafe { *flags };

    if flags & QUIC_FIXED_BIT == 0 {
        return Err(Reason::NotQuic);
    }

    if flags & QUIC_LONG_FORM != 0 {
        return Err(Reason::LongHeader);
    }

    let cid = cursor
        .read::<Cid, F>(frame)
        .map_err(|_| Reason::CidTruncated)?;

    Ok(unsafe { *cid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{csum::ones_complement_sum, cursor::SliceFrame, Redirect4, CID_LEN};
    use core::{
        cell::RefCell,
        net::{Ipv4Addr, SocketAddrV4},
    };
    use proptest::prelude::*;

    const DST_MAC: [u8; 6] = [0xaa; 6];
    const SRC_MAC: [u8; 6] = [0xbb; 6];
    const SRC_IP: [u8; 4] = [192, 0, 2, 1];
    const DST_IP: [u8; 4] = [198, 51, 100, 7];
    const SRC_PORT: u16 = 50000;
    const QUIC_PORT: u16 = 443;
    const CID: [u8; CID_LEN] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    const UDP_OFF: usize = 34;
    const QUIC_OFF: usize = 42;

    struct Ports(&'static [u16]);

    impl PortFilter for Ports {
        fn contains(&self, port: u16) -> bool {
            self.0.contains(&u16::from_be(port))
        }
    }

    struct Redirects(Vec<(Cid, Redirect4)>);

    impl RedirectTable for Redirects {
        fn lookup(&self, cid: &Cid) -> Option<Redirect4> {
            self.0.iter().find(|(k, _)| k == cid).map(|(_, v)| *v)
        }
    }

    struct Sink {
        capacity: usize,
        records: RefCell<Vec<Cid>>,
    }

    impl Sink {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                records: RefCell::new(vec![]),
            }
        }
    }

    impl RejectSink for Sink {
        fn try_publish(&self, cid: &Cid) -> bool {
            let mut records = self.records.borrow_mut();
            if records.len() >= self.capacity {
                return false;
            }
            records.push(*cid);
            true
        }
    }

    fn target() -> Redirect4 {
        Redirect4::from(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4433))
    }

    fn engine(sink_capacity: usize) -> Engine<Ports, Redirects, Sink> {
        Engine::new(
            Ports(&[QUIC_PORT]),
            Redirects(vec![(Cid::new(CID), target())]),
            Sink::new(sink_capacity),
        )
    }

    fn ipv4_udp_packet(ihl: u8, proto: u8, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let options = (ihl as usize).saturating_sub(5) * 4;
        let mut pkt = vec![];
        pkt.extend_from_slice(&DST_MAC);
        pkt.extend_from_slice(&SRC_MAC);
        pkt.extend_from_slice(&ETH_P_IP.to_be_bytes());

        let total = (ihl as usize * 4 + 8 + payload.len()) as u16;
        pkt.extend_from_slice(&[0x40 | ihl, 0x10]);
        pkt.extend_from_slice(&total.to_be_bytes());
        pkt.extend_from_slice(&0x1234_u16.to_be_bytes());
        pkt.extend_from_slice(&0x4000_u16.to_be_bytes());
        pkt.extend_from_slice(&[7, proto, 0, 0]);
        pkt.extend_from_slice(&SRC_IP);
        pkt.extend_from_slice(&DST_IP);
        pkt.extend(core::iter::repeat(1).take(options));

        pkt.extend_from_slice(&SRC_PORT.to_be_bytes());
        pkt.extend_from_slice(&dst_port.to_be_bytes());
        pkt.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&0xabcd_u16.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    fn quic_packet(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        ipv4_udp_packet(5, IPPROTO_UDP, dst_port, payload)
    }

    fn short_header(cid: [u8; CID_LEN]) -> Vec<u8> {
        let mut hdr = vec![0x41];
        hdr.extend_from_slice(&cid);
        hdr.extend_from_slice(b"protected payload");
        hdr
    }

    fn run<P: PortFilter, R: RedirectTable, S: RejectSink>(
        engine: &Engine<P, R, S>,
        pkt: &mut [u8],
    ) -> Reason {
        let frame = SliceFrame::new(pkt);
        engine.classify(&frame)
    }

    #[test]
    fn redirect_example() {
        let engine = engine(8);
        let payload = short_header(CID);
        let mut pkt = quic_packet(QUIC_PORT, &payload);

        assert_eq!(run(&engine, &mut pkt), Reason::Redirected);
        assert_eq!(Reason::Redirected.verdict(), Verdict::Tx);

        assert_eq!(pkt[0..6], SRC_MAC);
        assert_eq!(pkt[6..12], DST_MAC);
        // tos, id, flags and fragment offset are cleared
        assert_eq!(pkt[15], 0);
        assert_eq!(pkt[18..22], [0, 0, 0, 0]);
        assert_eq!(pkt[22], 64);
        assert_eq!(pkt[23], IPPROTO_UDP);
        assert_eq!(pkt[26..30], DST_IP);
        assert_eq!(pkt[30..34], [10, 0, 0, 5]);
        let hdr: [u8; 20] = pkt[14..34].try_into().unwrap();
        assert_eq!(ones_complement_sum(&hdr), 0xffff);

        assert_eq!(pkt[UDP_OFF..UDP_OFF + 2], QUIC_PORT.to_be_bytes());
        assert_eq!(pkt[UDP_OFF + 2..UDP_OFF + 4], 4433_u16.to_be_bytes());
        assert_eq!(pkt[UDP_OFF + 6..UDP_OFF + 8], [0, 0]);
        assert_eq!(pkt[QUIC_OFF..], payload[..]);
        assert!(engine.rejected.records.borrow().is_empty());
    }

    #[test]
    fn miss_reports_cid_once() {
        let engine = engine(8);
        let cid = [0x33; CID_LEN];
        let mut pkt = quic_packet(QUIC_PORT, &short_header(cid));
        let orig = pkt.clone();

        assert_eq!(run(&engine, &mut pkt), Reason::Rejected);
        assert_eq!(Reason::Rejected.verdict(), Verdict::Drop);
        assert_eq!(*engine.rejected.records.borrow(), vec![Cid::new(cid)]);
        assert_eq!(pkt, orig);
    }

    #[test]
    fn full_reject_channel_still_drops() {
        let engine = engine(0);
        let mut pkt = quic_packet(QUIC_PORT, &short_header([0x33; CID_LEN]));

        assert_eq!(run(&engine, &mut pkt), Reason::RejectedLost);
        assert_eq!(Reason::RejectedLost.verdict(), Verdict::Drop);
        assert!(engine.rejected.records.borrow().is_empty());
    }

    #[test]
    fn bypass_cid_skips_lookup() {
        let engine = Engine::new(
            Ports(&[QUIC_PORT]),
            Redirects(vec![(Cid::new([0x81; CID_LEN]), target())]),
            Sink::new(8),
        );
        let mut pkt = quic_packet(QUIC_PORT, &short_header([0x81; CID_LEN]));
        let orig = pkt.clone();

        assert_eq!(run(&engine, &mut pkt), Reason::Bypass);
        assert_eq!(Reason::Bypass.verdict(), Verdict::Pass);
        assert_eq!(pkt, orig);
        assert!(engine.rejected.records.borrow().is_empty());
    }

    #[test]
    fn long_header_passes() {
        let engine = engine(8);
        let mut payload = short_header(CID);
        payload[0] = 0xc3;
        let mut pkt = quic_packet(QUIC_PORT, &payload);

        assert_eq!(run(&engine, &mut pkt), Reason::LongHeader);
        assert_eq!(engine.dispatch(&SliceFrame::new(&mut pkt)), Verdict::Pass);
    }

    #[test]
    fn fixed_bit_clear_drops() {
        let engine = engine(8);
        let mut payload = short_header(CID);
        payload[0] = 0x01;
        let mut pkt = quic_packet(QUIC_PORT, &payload);

        assert_eq!(run(&engine, &mut pkt), Reason::NotQuic);
        assert_eq!(Reason::NotQuic.verdict(), Verdict::Drop);
    }

    #[test]
    fn truncated_before_port_match_passes_after_drops() {
        let engine = engine(8);

        // UDP header cut short: the port is unknown yet, leave it to the host
        let mut pkt = quic_packet(QUIC_PORT, &[]);
        pkt.truncate(UDP_OFF + 4);
        assert_eq!(run(&engine, &mut pkt), Reason::UdpTruncated);
        assert_eq!(Reason::UdpTruncated.verdict(), Verdict::Pass);

        // no QUIC byte at all on an inspected port
        let mut pkt = quic_packet(QUIC_PORT, &[]);
        assert_eq!(run(&engine, &mut pkt), Reason::QuicTruncated);
        assert_eq!(Reason::QuicTruncated.verdict(), Verdict::Drop);

        // short header with an incomplete cid
        for len in 1..=CID_LEN {
            let payload = short_header(CID);
            let mut pkt = quic_packet(QUIC_PORT, &payload[..len]);
            assert_eq!(run(&engine, &mut pkt), Reason::CidTruncated);
        }
        assert_eq!(Reason::CidTruncated.verdict(), Verdict::Drop);

        // the cid alone is enough
        let payload = short_header(CID);
        let mut pkt = quic_packet(QUIC_PORT, &payload[..1 + CID_LEN]);
        assert_eq!(run(&engine, &mut pkt), Reason::Redirected);
    }

    #[test]
    fn not_ipv4() {
        let engine = engine(8);
        let mut pkt = quic_packet(QUIC_PORT, &short_header(CID));

        pkt[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());
        assert_eq!(run(&engine, &mut pkt), Reason::Ipv6);

        pkt[12..14].copy_from_slice(&0x8100_u16.to_be_bytes());
        assert_eq!(run(&engine, &mut pkt), Reason::NotIpv4);

        pkt[12..14].copy_from_slice(&0x0806_u16.to_be_bytes());
        assert_eq!(run(&engine, &mut pkt), Reason::NotIpv4);
    }

    #[test]
    fn ipv4_filters() {
        let engine = engine(8);

        let mut pkt = quic_packet(QUIC_PORT, &short_header(CID));
        pkt.truncate(14 + 19);
        assert_eq!(run(&engine, &mut pkt), Reason::IpTruncated);

        let mut pkt = ipv4_udp_packet(5, 6, QUIC_PORT, &short_header(CID));
        assert_eq!(run(&engine, &mut pkt), Reason::NotUdp);

        let mut pkt = ipv4_udp_packet(4, IPPROTO_UDP, QUIC_PORT, &short_header(CID));
        assert_eq!(run(&engine, &mut pkt), Reason::IpOptions);
    }

    #[test]
    fn unknown_port_is_untouched() {
        let engine = engine(8);
        let mut pkt = quic_packet(8443, &short_header(CID));
        let orig = pkt.clone();

        assert_eq!(run(&engine, &mut pkt), Reason::PortNotInspected);
        assert_eq!(pkt, orig);
        assert!(engine.rejected.records.borrow().is_empty());
    }

    #[test]
    fn lookups_are_pure_reads() {
        let engine = engine(8);
        let cid = Cid::new(CID);
        let first = engine.redirects.lookup(&cid);

        for _ in 0..4 {
            let mut pkt = quic_packet(QUIC_PORT, &short_header(CID));
            assert_eq!(run(&engine, &mut pkt), Reason::Redirected);
            assert_eq!(engine.redirects.lookup(&cid), first);
            assert!(engine.ports.contains(QUIC_PORT.to_be()));
        }
        assert_eq!(engine.redirects.0.len(), 1);
    }

    #[test]
    fn reasons_index_stats() {
        for (i, reason) in Reason::ALL.iter().enumerate() {
            assert_eq!(*reason as usize, i + 1);
        }
        assert_eq!(crate::stats::MAX as usize, Reason::ALL.len() + 1);
        assert!(!Reason::PortNotInspected.is_inspected());
        assert!(Reason::QuicTruncated.is_inspected());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn short_ethernet_passes(mut pkt in proptest::collection::vec(any::<u8>(), 0..14)) {
            let engine = engine(8);
            let orig = pkt.clone();
            prop_assert_eq!(run(&engine, &mut pkt), Reason::EthTruncated);
            prop_assert_eq!(pkt, orig);
        }

        #[test]
        fn ip_options_pass(
            ihl in 6_u8..16,
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let engine = engine(8);
            let mut pkt = ipv4_udp_packet(ihl, IPPROTO_UDP, QUIC_PORT, &payload);
            let orig = pkt.clone();
            prop_assert_eq!(run(&engine, &mut pkt), Reason::IpOptions);
            prop_assert_eq!(pkt, orig);
        }

        #[test]
        fn unfiltered_ports_pass(
            port in any::<u16>().prop_filter("inspected", |p| *p != QUIC_PORT),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let engine = engine(8);
            let mut pkt = quic_packet(port, &payload);
            prop_assert_eq!(run(&engine, &mut pkt).verdict(), Verdict::Pass);
        }

        #[test]
        fn inspected_traffic_is_redirected_or_reported(
            cid in any::<[u8; CID_LEN]>(),
            known in any::<bool>(),
        ) {
            let cid = Cid::new(cid);
            prop_assume!(!cid.is_bypass());
            let table = if known { vec![(cid, target())] } else { vec![] };
            let engine = Engine::new(Ports(&[QUIC_PORT]), Redirects(table), Sink::new(8));
            let mut pkt = quic_packet(QUIC_PORT, &short_header(cid.bytes));

            let reason = run(&engine, &mut pkt);
            let records = engine.rejected.records.borrow();
            if known {
                prop_assert_eq!(reason, Reason::Redirected);
                prop_assert!(records.is_empty());
            } else {
                prop_assert_eq!(reason, Reason::Rejected);
                prop_assert_eq!(records.as_slice(), &[cid]);
            }
        }

        #[test]
        fn any_payload_terminates(
            payload in proptest::collection::vec(any::<u8>(), 0..48),
        ) {
            let engine = engine(8);
            let mut pkt = quic_packet(QUIC_PORT, &payload);
            let reason = run(&engine, &mut pkt);
            prop_assert!(reason.is_inspected());
        }
    }
}
